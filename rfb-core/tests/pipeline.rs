//! Integration tests: server framebuffer → tracker → encode manager →
//! wire bytes → message reader → decoders → client framebuffer.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use rfb_core::decoder::{self, Decoder};
use rfb_core::{
    ClientParams, DecodeManager, EncodeManager, FenceFlags, InStream, ManagedPixelBuffer,
    ModifiablePixelBuffer, MsgHandler, MsgReader, OutStream, PixelBuffer, PixelFormat, Point, Rect, Region,
    RfbError, SharedFramebuffer, SimpleUpdateTracker, UpdateInfo, UpdateTracker, encoding,
};
use tracing::Span;

// ── Helpers ──────────────────────────────────────────────────────

const FORMATS: [PixelFormat; 3] = [PixelFormat::BGR233, PixelFormat::RGB565, PixelFormat::RGB888];

const ENCODINGS: [i32; 5] = [
    encoding::RAW,
    encoding::RRE,
    encoding::HEXTILE,
    encoding::TIGHT,
    encoding::ZRLE,
];

/// The `k`th of many distinct pixel values in `pf`.
fn colour(pf: &PixelFormat, k: u32) -> u32 {
    match pf.bpp() {
        8 => k % 256,
        16 => k.wrapping_mul(40503) % 65536,
        _ => k.wrapping_mul(2_654_435_761) & 0x00FF_FFFF,
    }
}

/// A `w`×`h` buffer using `n` colours, scattered so runs stay short.
fn scene(pf: PixelFormat, w: i32, h: i32, n: u32) -> ManagedPixelBuffer {
    let mut fb = ManagedPixelBuffer::new(pf, w, h);
    let bpp = pf.bytes_per_pixel();
    let mut px = [0u8; 4];
    for y in 0..h {
        for x in 0..w {
            let k = ((x * 7 + y * 13 + (x * y) % 5) as u32) % n;
            pf.buffer_from_pixel(&mut px, colour(&pf, k));
            fb.fill_rect(&Rect::new(x, y, x + 1, y + 1), &px[..bpp]).unwrap();
        }
    }
    fb
}

fn full(fb: &ManagedPixelBuffer) -> UpdateInfo {
    UpdateInfo {
        changed: Region::from(fb.rect()),
        ..UpdateInfo::default()
    }
}

/// Decodes every rect as soon as its body is read.
struct SequentialClient {
    fb: ManagedPixelBuffer,
    pf: PixelFormat,
    decoders: BTreeMap<i32, Box<dyn Decoder>>,
    updates: usize,
}

impl SequentialClient {
    fn new(pf: PixelFormat, w: i32, h: i32) -> Self {
        Self {
            fb: ManagedPixelBuffer::new(pf, w, h),
            pf,
            decoders: BTreeMap::new(),
            updates: 0,
        }
    }
}

impl MsgHandler for SequentialClient {
    fn framebuffer_update_end(&mut self) -> Result<(), RfbError> {
        self.updates += 1;
        Ok(())
    }

    fn data_rect(&mut self, rect: &Rect, enc: i32, is: &mut InStream) -> Result<bool, RfbError> {
        if !self.decoders.contains_key(&enc) {
            self.decoders.insert(enc, decoder::create(enc)?);
        }
        let dec = &self.decoders[&enc];
        let mut os = OutStream::new();
        if !dec.read_rect(rect, is, &self.pf, &mut os)? {
            return Ok(false);
        }
        dec.decode_rect(rect, os.as_slice(), &self.pf, &mut self.fb)?;
        Ok(true)
    }

    fn fence(&mut self, _flags: FenceFlags, _payload: &[u8]) -> Result<(), RfbError> {
        Ok(())
    }
}

/// Hands every rect to a [`DecodeManager`].
struct ThreadedClient {
    fb: Arc<Mutex<ManagedPixelBuffer>>,
    shared: SharedFramebuffer,
    pf: PixelFormat,
    dm: DecodeManager,
}

impl ThreadedClient {
    fn new(pf: PixelFormat, w: i32, h: i32, threads: usize) -> Self {
        let fb = Arc::new(Mutex::new(ManagedPixelBuffer::new(pf, w, h)));
        let shared: SharedFramebuffer = fb.clone();
        Self {
            fb,
            shared,
            pf,
            dm: DecodeManager::with_threads(Span::none(), threads).unwrap(),
        }
    }
}

impl MsgHandler for ThreadedClient {
    fn data_rect(&mut self, rect: &Rect, enc: i32, is: &mut InStream) -> Result<bool, RfbError> {
        self.dm.decode_rect(rect, enc, is, &self.pf, &self.shared)
    }

    fn fence(&mut self, _flags: FenceFlags, _payload: &[u8]) -> Result<(), RfbError> {
        Ok(())
    }
}

/// Feed `wire` to `handler` until the reader runs dry.
fn read_all(wire: &[u8], handler: &mut dyn MsgHandler) {
    let mut reader = MsgReader::new();
    let mut is = InStream::from_slice(wire);
    while reader.read_msg(&mut is, handler).unwrap() {}
    assert!(reader.is_idle());
    assert_eq!(is.avail(), 0);
}

/// Encode all of `fb` with `encodings` and decode it again.
fn round_trip(fb: &ManagedPixelBuffer, encodings: &[i32]) -> SequentialClient {
    let pf = *fb.pf();
    let r = fb.rect();
    let cp = ClientParams::new(pf, r.width(), r.height()).with_encodings(encodings);
    let mut em = EncodeManager::new(Span::none());
    let mut os = OutStream::new();
    em.write_update(&full(fb), fb, &cp, &mut os).unwrap();

    let mut client = SequentialClient::new(pf, r.width(), r.height());
    read_all(os.as_slice(), &mut client);
    assert_eq!(client.updates, 1);
    client
}

// ── Round trips ──────────────────────────────────────────────────

#[test]
fn test_round_trip_every_encoder_and_depth() {
    for pf in FORMATS {
        for n in [1, 2, 16, 300] {
            let fb = scene(pf, 80, 70, n);
            for enc in ENCODINGS {
                let client = round_trip(&fb, &[enc]);
                assert_eq!(
                    client.fb.data(),
                    fb.data(),
                    "{} at {} bpp with {n} colours",
                    encoding::name(enc),
                    pf.bpp()
                );
            }
        }
    }
}

#[test]
fn test_round_trip_palette_boundaries() {
    for pf in FORMATS {
        for n in [2, 3, 4, 5, 16, 17, 127, 128, 129] {
            let fb = scene(pf, 64, 64, n);
            for enc in [encoding::TIGHT, encoding::ZRLE, encoding::HEXTILE] {
                let client = round_trip(&fb, &[enc, encoding::LAST_RECT]);
                assert_eq!(
                    client.fb.data(),
                    fb.data(),
                    "{} at {} bpp with {n} colours",
                    encoding::name(enc),
                    pf.bpp()
                );
            }
        }
    }
}

#[test]
fn test_round_trip_with_solid_areas() {
    let pf = PixelFormat::RGB888;
    let mut fb = scene(pf, 200, 150, 300);
    let mut px = [0u8; 4];
    pf.buffer_from_pixel(&mut px, pf.pixel_from_rgb(10, 200, 30));
    fb.fill_rect(&Rect::new(20, 10, 180, 120), &px).unwrap();

    for enc in ENCODINGS {
        let client = round_trip(&fb, &[enc, encoding::LAST_RECT]);
        assert_eq!(client.fb.data(), fb.data(), "{}", encoding::name(enc));
    }
}

#[test]
fn test_round_trip_to_other_client_format() {
    let server = scene(PixelFormat::RGB888, 40, 40, 8);
    let client_pf = PixelFormat::RGB565;
    let cp = ClientParams::new(client_pf, 40, 40).with_encodings(&[encoding::ZRLE]);

    let mut em = EncodeManager::new(Span::none());
    let mut os = OutStream::new();
    em.write_update(&full(&server), &server, &cp, &mut os).unwrap();

    let mut client = SequentialClient::new(client_pf, 40, 40);
    read_all(os.as_slice(), &mut client);

    let mut expected = ManagedPixelBuffer::new(client_pf, 40, 40);
    expected
        .image_rect_pf(&PixelFormat::RGB888, &Rect::new(0, 0, 40, 40), server.data(), 0)
        .unwrap();
    assert_eq!(client.fb.data(), expected.data());
}

// ── Tracking ─────────────────────────────────────────────────────

#[test]
fn test_full_rect_plus_small_change_scenario() {
    let mut fb = ManagedPixelBuffer::new(PixelFormat::BGR233, 256, 256);
    let mut tracker = SimpleUpdateTracker::new();
    let all = Rect::new(0, 0, 256, 256);

    tracker.add_changed(&Region::from(all));
    fb.fill_rect(&Rect::new(100, 100, 132, 132), &[0x55]).unwrap();
    tracker.add_changed(&Region::from(Rect::new(100, 100, 132, 132)));

    let ui = tracker.get_update_info(&Region::from(all));
    assert_eq!(ui.changed.area(), 256 * 256);
    assert!(ui.copied.is_empty());

    let cp = ClientParams::new(PixelFormat::BGR233, 256, 256)
        .with_encodings(&[encoding::ZRLE, encoding::COPY_RECT, encoding::LAST_RECT]);
    let mut em = EncodeManager::new(Span::none());
    let mut os = OutStream::new();
    em.write_update(&ui, &fb, &cp, &mut os).unwrap();

    let mut client = SequentialClient::new(PixelFormat::BGR233, 256, 256);
    read_all(os.as_slice(), &mut client);
    assert_eq!(client.fb.data(), fb.data());
}

#[test]
fn test_copy_then_change_reaches_client() {
    let pf = PixelFormat::RGB565;
    let mut server = scene(pf, 96, 64, 40);
    let cp = ClientParams::new(pf, 96, 64).with_encodings(&[
        encoding::HEXTILE,
        encoding::COPY_RECT,
        encoding::LAST_RECT,
    ]);
    let mut em = EncodeManager::new(Span::none());
    let mut client = SequentialClient::new(pf, 96, 64);

    let mut os = OutStream::new();
    em.write_update(&full(&server), &server, &cp, &mut os).unwrap();
    read_all(os.as_slice(), &mut client);

    // move a block right, then scribble over part of the destination
    let dest = Rect::new(40, 8, 72, 40);
    let delta = Point::new(24, 4);
    server.copy_rect(&dest, delta).unwrap();
    let mut tracker = SimpleUpdateTracker::new();
    tracker.add_copied(&Region::from(dest), delta);
    server.fill_rect(&Rect::new(60, 20, 70, 30), &[0x12, 0x34]).unwrap();
    tracker.add_changed(&Region::from(Rect::new(60, 20, 70, 30)));

    let ui = tracker.get_update_info(&Region::from(Rect::new(0, 0, 96, 64)));
    assert!(!ui.copied.is_empty());
    os.clear();
    em.write_update(&ui, &server, &cp, &mut os).unwrap();
    read_all(os.as_slice(), &mut client);

    assert_eq!(client.updates, 2);
    assert_eq!(client.fb.data(), server.data());
    assert_eq!(em.copy_stats().rects as usize, ui.copied.num_rects());
}

// ── DecodeManager ────────────────────────────────────────────────

/// Several updates over every encoding, with persistent zlib streams
/// and copies that read what earlier rects wrote.
fn mixed_stream(pf: PixelFormat) -> (Vec<u8>, ManagedPixelBuffer) {
    let (w, h) = (160, 120);
    let mut server = scene(pf, w, h, 200);
    let mut em = EncodeManager::new(Span::none());
    let mut wire = OutStream::new();
    let all = Rect::new(0, 0, w, h);

    for (i, enc) in ENCODINGS.into_iter().chain([encoding::TIGHT, encoding::ZRLE]).enumerate() {
        let cp = ClientParams::new(pf, w, h).with_encodings(&[
            enc,
            encoding::COPY_RECT,
            encoding::LAST_RECT,
        ]);

        let mut tracker = SimpleUpdateTracker::new();
        if i == 0 {
            tracker.add_changed(&Region::from(all));
        } else {
            let i = i as i32;
            let dest = Rect::new(10 + i * 8, 10, 60 + i * 8, 50);
            let delta = Point::new(8, 4 + i);
            server.copy_rect(&dest, delta).unwrap();
            tracker.add_copied(&Region::from(dest), delta);

            let patch = scene(pf, 40, 30, 3 + 20 * i as u32);
            let target = Rect::new(100 - i * 10, 70, 140 - i * 10, 100);
            server.image_rect(&target, patch.data(), 0).unwrap();
            tracker.add_changed(&Region::from(target));
        }

        let ui = tracker.get_update_info(&Region::from(all));
        em.write_update(&ui, &server, &cp, &mut wire).unwrap();
    }
    (wire.as_slice().to_vec(), server)
}

#[test]
fn test_decode_manager_matches_sequential_decoding() {
    for pf in FORMATS {
        let (wire, server) = mixed_stream(pf);

        let mut sequential = SequentialClient::new(pf, 160, 120);
        read_all(&wire, &mut sequential);
        assert_eq!(sequential.fb.data(), server.data());

        let mut threaded = ThreadedClient::new(pf, 160, 120, 4);
        read_all(&wire, &mut threaded);
        threaded.dm.flush().unwrap();
        assert_eq!(threaded.fb.lock().unwrap().data(), sequential.fb.data());
        assert!(threaded.dm.total_stats().rects > 0);
    }
}

#[test]
fn test_decode_manager_with_data_in_pieces() {
    let pf = PixelFormat::RGB888;
    let (wire, server) = mixed_stream(pf);

    let mut client = ThreadedClient::new(pf, 160, 120, 2);
    let mut reader = MsgReader::new();
    let mut is = InStream::new();
    for chunk in wire.chunks(97) {
        is.feed(chunk);
        while reader.read_msg(&mut is, &mut client).unwrap() {}
    }
    client.dm.flush().unwrap();
    assert!(reader.is_idle());
    assert_eq!(client.fb.lock().unwrap().data(), server.data());
}

#[test]
fn test_corrupt_stream_error_reaches_caller() {
    let pf = PixelFormat::BGR233;
    let mut os = OutStream::new();
    rfb_core::message::write_framebuffer_update_start(&mut os, 1);
    rfb_core::message::write_rect_header(&mut os, &Rect::new(0, 0, 4, 4), encoding::HEXTILE);
    // subrect 3 wide starting at x=2 leaves the 4×4 tile
    os.write_bytes(&[2 | 4 | 8, 1, 9, 1, 0x20, 0x20]);

    let mut client = ThreadedClient::new(pf, 4, 4, 2);
    read_all(os.as_slice(), &mut client);
    let err = client.dm.flush().unwrap_err();
    assert!(err.is_protocol());
}
