//! Decode manager: decodes incoming rects on a pool of worker threads.
//!
//! The network thread calls [`DecodeManager::decode_rect`] for every
//! rect header it reads. The rect body is copied out of the
//! [`InStream`] into one of a fixed set of buffers and queued; a worker
//! later decodes it into the framebuffer. With two buffers per worker
//! the queue never grows beyond that, and a slow framebuffer slows the
//! network reader down instead of eating memory.
//!
//! ```text
//!  network thread            queue                      workers
//!  ──────────────   ┌───────────────────────┐   ┌──────────────────┐
//!  read_rect ─────▶ │ job  job  job  job ...│──▶│ find_entry       │
//!                   └───────────────────────┘   │ decode_rect      │
//!  flush ◀──────────── producer condvar ◀───────│ commit under lock│
//!                                               └──────────────────┘
//! ```
//!
//! Jobs may complete out of order. A worker only takes a job when
//! nothing queued ahead of it could change the result:
//!
//! - `ORDERED` decoders run their rects strictly in arrival order.
//! - `PARTIALLY_ORDERED` decoders are asked per pair of rects.
//! - No job starts while an earlier job touches any of its pixels.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{Span, debug, error, info, warn};

use crate::error::RfbError;
use crate::geometry::Rect;
use crate::message::encoding;
use crate::pixel::{ManagedPixelBuffer, ModifiablePixelBuffer, PixelFormat};
use crate::region::Region;
use crate::stream::{InStream, OutStream};

use super::{Decoder, DecoderFlags, create, supported};

/// Upper bound on worker threads when sized from the CPU count.
const MAX_THREADS: usize = 4;

/// Header bytes counted against every rect in the statistics.
const RECT_HEADER_LEN: u64 = 12;

/// The framebuffer the workers decode into.
pub type SharedFramebuffer = Arc<Mutex<dyn ModifiablePixelBuffer + Send>>;

// ── DecoderStats ─────────────────────────────────────────────────

/// Counters for one encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecoderStats {
    pub rects: u64,
    /// Bytes received, rect headers included.
    pub bytes: u64,
    pub pixels: u64,
    /// What the same rects would have cost as Raw.
    pub equivalent: u64,
}

impl DecoderStats {
    pub fn ratio(&self) -> f64 {
        if self.bytes == 0 {
            0.0
        } else {
            self.equivalent as f64 / self.bytes as f64
        }
    }
}

// ── Queue ────────────────────────────────────────────────────────

struct Job {
    rect: Rect,
    encoding: i32,
    decoder: Arc<dyn Decoder>,
    /// Format the rect was sent in.
    pf: PixelFormat,
    data: OutStream,
    affected: Region,
    fb: SharedFramebuffer,
}

struct Slot {
    job: Arc<Job>,
    active: bool,
}

#[derive(Default)]
struct Queue {
    entries: VecDeque<Slot>,
    free_buffers: Vec<OutStream>,
    /// First error a worker hit, handed to the next caller.
    error: Option<RfbError>,
    stop: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    /// Signalled when a job finishes (free buffer, shorter queue).
    producer: Condvar,
    /// Signalled when there may be work for a worker.
    consumer: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── DecodeManager ────────────────────────────────────────────────

pub struct DecodeManager {
    span: Span,
    decoders: BTreeMap<i32, Arc<dyn Decoder>>,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    stats: BTreeMap<i32, DecoderStats>,
}

impl DecodeManager {
    /// A manager with one worker per CPU, at most four.
    pub fn new(span: Span) -> Result<Self, RfbError> {
        let cpus = thread::available_parallelism().map_or(1, |n| n.get());
        Self::with_threads(span, cpus.min(MAX_THREADS))
    }

    pub fn with_threads(span: Span, threads: usize) -> Result<Self, RfbError> {
        let threads = threads.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                free_buffers: (0..threads * 2).map(|_| OutStream::new()).collect(),
                ..Queue::default()
            }),
            producer: Condvar::new(),
            consumer: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let shared = Arc::clone(&shared);
            let span = span.clone();
            let handle = thread::Builder::new()
                .name(format!("rfb-decode-{i}"))
                .spawn(move || worker(shared, span))?;
            workers.push(handle);
        }

        {
            let _enter = span.enter();
            debug!(threads, "decode workers started");
        }

        Ok(Self {
            span,
            decoders: BTreeMap::new(),
            shared,
            workers,
            stats: BTreeMap::new(),
        })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Read one rect body from `is` and queue it for decoding into `fb`.
    ///
    /// Returns `Ok(false)` with `is` rewound when the body is incomplete.
    /// An error from an earlier rect's decode is returned here first.
    pub fn decode_rect(
        &mut self,
        r: &Rect,
        enc: i32,
        is: &mut InStream,
        server_pf: &PixelFormat,
        fb: &SharedFramebuffer,
    ) -> Result<bool, RfbError> {
        if !supported(enc) {
            let _enter = self.span.enter();
            error!(encoding = enc, "unknown encoding");
            return Err(RfbError::UnknownEncoding(enc));
        }

        let decoder = match self.decoders.get(&enc) {
            Some(d) => Arc::clone(d),
            None => {
                let d: Arc<dyn Decoder> = Arc::from(create(enc)?);
                self.decoders.insert(enc, Arc::clone(&d));
                d
            }
        };

        let mut buf = {
            let mut q = self.shared.lock();
            while q.free_buffers.is_empty() && q.error.is_none() {
                q = self
                    .shared
                    .producer
                    .wait(q)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if let Some(e) = q.error.take() {
                return Err(e);
            }
            match q.free_buffers.pop() {
                Some(buf) => buf,
                None => return Err(RfbError::Worker("no free decode buffer".into())),
            }
        };

        buf.clear();
        match decoder.read_rect(r, is, server_pf, &mut buf) {
            Ok(true) => {}
            other => {
                self.shared.lock().free_buffers.push(buf);
                return other;
            }
        }

        let area = r.area() as u64;
        let s = self.stats.entry(enc).or_default();
        s.rects += 1;
        s.bytes += RECT_HEADER_LEN + buf.len() as u64;
        s.pixels += area;
        s.equivalent += RECT_HEADER_LEN + area * server_pf.bytes_per_pixel() as u64;

        let affected = decoder.affected_region(r, buf.as_slice(), server_pf);
        let job = Arc::new(Job {
            rect: *r,
            encoding: enc,
            decoder,
            pf: *server_pf,
            data: buf,
            affected,
            fb: Arc::clone(fb),
        });

        self.shared.lock().entries.push_back(Slot { job, active: false });
        self.shared.consumer.notify_one();
        Ok(true)
    }

    /// Wait until every queued rect has been decoded.
    pub fn flush(&mut self) -> Result<(), RfbError> {
        let mut q = self.shared.lock();
        while !q.entries.is_empty() {
            q = self
                .shared
                .producer
                .wait(q)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match q.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> impl Iterator<Item = (i32, &DecoderStats)> {
        self.stats.iter().map(|(&enc, s)| (enc, s))
    }

    pub fn total_stats(&self) -> DecoderStats {
        self.stats.values().fold(DecoderStats::default(), |mut acc, s| {
            acc.rects += s.rects;
            acc.bytes += s.bytes;
            acc.pixels += s.pixels;
            acc.equivalent += s.equivalent;
            acc
        })
    }

    pub fn log_stats(&self) {
        let _enter = self.span.enter();
        for (&enc, s) in &self.stats {
            info!(
                decoder = encoding::name(enc),
                rects = s.rects,
                pixels = s.pixels,
                bytes = s.bytes,
                ratio = s.ratio(),
                "  decoded"
            );
        }
        let total = self.total_stats();
        info!(
            rects = total.rects,
            pixels = total.pixels,
            bytes = total.bytes,
            ratio = total.ratio(),
            "  total"
        );
    }
}

impl Drop for DecodeManager {
    fn drop(&mut self) {
        self.shared.lock().stop = true;
        self.shared.consumer.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                let _enter = self.span.enter();
                warn!("decode worker panicked during shutdown");
            }
        }
        self.log_stats();
    }
}

impl std::fmt::Debug for DecodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeManager")
            .field("threads", &self.workers.len())
            .field("decoders", &self.decoders.keys().collect::<Vec<_>>())
            .field("stats", &self.stats)
            .finish()
    }
}

// ── Workers ──────────────────────────────────────────────────────

fn worker(shared: Arc<Shared>, span: Span) {
    let _enter = span.enter();
    let mut q = shared.lock();
    loop {
        if q.stop {
            break;
        }
        let Some(job) = find_entry(&mut q) else {
            q = shared.consumer.wait(q).unwrap_or_else(PoisonError::into_inner);
            continue;
        };
        drop(q);

        let result = panic::catch_unwind(AssertUnwindSafe(|| decode_job(&job)))
            .unwrap_or_else(|payload| Err(RfbError::Worker(panic_message(payload))));

        q = shared.lock();
        if let Err(e) = result {
            warn!(rect = ?job.rect, encoding = job.encoding, error = %e, "decode failed");
            if q.error.is_none() {
                q.error = Some(e);
            }
        }

        if let Some(pos) = q.entries.iter().position(|s| Arc::ptr_eq(&s.job, &job)) {
            q.entries.remove(pos);
        }
        if let Ok(job) = Arc::try_unwrap(job) {
            q.free_buffers.push(job.data);
        }

        shared.producer.notify_all();
        // rects held back by this one may be free now
        if !q.entries.is_empty() {
            shared.consumer.notify_all();
        }
    }
    debug!("decode worker stopped");
}

/// Mark and return the first job that can start now.
fn find_entry(q: &mut Queue) -> Option<Arc<Job>> {
    let mut locked = Region::new();

    for i in 0..q.entries.len() {
        let slot = &q.entries[i];
        let job = &slot.job;

        let blocked = slot.active || {
            let flags = job.decoder.flags();
            let mut earlier = q.entries.iter().take(i).map(|s| &s.job);
            if flags.contains(DecoderFlags::ORDERED) {
                earlier.any(|e| e.encoding == job.encoding)
            } else if flags.contains(DecoderFlags::PARTIALLY_ORDERED) {
                earlier.any(|e| {
                    e.encoding == job.encoding
                        && job.decoder.rects_conflict(
                            &e.rect,
                            e.data.as_slice(),
                            &job.rect,
                            job.data.as_slice(),
                            &job.pf,
                        )
                })
            } else {
                false
            }
        } || !locked.intersect(&job.affected).is_empty();

        if blocked {
            locked.assign_union(&job.affected);
            continue;
        }

        q.entries[i].active = true;
        return Some(Arc::clone(&q.entries[i].job));
    }
    None
}

fn decode_job(job: &Job) -> Result<(), RfbError> {
    let data = job.data.as_slice();

    if job.decoder.flags().contains(DecoderFlags::READS_FRAMEBUFFER) {
        let mut fb = job.fb.lock().unwrap_or_else(PoisonError::into_inner);
        return job.decoder.decode_rect(&job.rect, data, &job.pf, &mut *fb);
    }

    let fb_pf = *job.fb.lock().unwrap_or_else(PoisonError::into_inner).pf();
    let mut staging = ManagedPixelBuffer::with_rect(fb_pf, job.rect);
    job.decoder.decode_rect(&job.rect, data, &job.pf, &mut staging)?;

    let mut fb = job.fb.lock().unwrap_or_else(PoisonError::into_inner);
    fb.image_rect(&job.rect, staging.data(), 0)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "decoder panicked".to_string()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn framebuffer(w: i32, h: i32) -> (Arc<Mutex<ManagedPixelBuffer>>, SharedFramebuffer) {
        let fb = Arc::new(Mutex::new(ManagedPixelBuffer::new(PixelFormat::BGR233, w, h)));
        let shared: SharedFramebuffer = fb.clone();
        (fb, shared)
    }

    fn pixels(fb: &Arc<Mutex<ManagedPixelBuffer>>) -> Vec<u8> {
        fb.lock().unwrap().data().to_vec()
    }

    /// Raw rects then a CopyRect reading what they wrote, then an RRE
    /// drawn over part of the copy.
    fn stream() -> (Vec<(Rect, i32)>, Vec<u8>) {
        let mut rects = Vec::new();
        let mut body = Vec::new();
        for (i, y) in (0..8).step_by(2).enumerate() {
            rects.push((Rect::new(0, y, 8, y + 2), encoding::RAW));
            body.extend((0..16).map(|p| (i * 16 + p) as u8));
        }
        rects.push((Rect::new(8, 0, 16, 8), encoding::COPY_RECT));
        body.extend([0, 0, 0, 0]);
        rects.push((Rect::new(10, 2, 14, 6), encoding::RRE));
        body.extend([0, 0, 0, 1, 0xAA, 0xBB, 0, 1, 0, 1, 0, 2, 0, 2]);
        (rects, body)
    }

    #[test]
    fn matches_sequential_decoding() {
        let (rects, body) = stream();
        let pf = PixelFormat::BGR233;

        let mut expected = ManagedPixelBuffer::new(pf, 16, 8);
        let mut is = InStream::from_slice(&body);
        for &(r, enc) in &rects {
            let dec = create(enc).unwrap();
            let mut os = OutStream::new();
            assert!(dec.read_rect(&r, &mut is, &pf, &mut os).unwrap());
            dec.decode_rect(&r, os.as_slice(), &pf, &mut expected).unwrap();
        }

        let (fb, shared) = framebuffer(16, 8);
        let mut dm = DecodeManager::with_threads(Span::none(), 4).unwrap();
        let mut is = InStream::from_slice(&body);
        for &(r, enc) in &rects {
            assert!(dm.decode_rect(&r, enc, &mut is, &pf, &shared).unwrap());
        }
        dm.flush().unwrap();

        assert_eq!(pixels(&fb), expected.data());
        assert_eq!(is.avail(), 0);
    }

    #[test]
    fn incomplete_rect_is_not_queued() {
        let (_fb, shared) = framebuffer(4, 4);
        let mut dm = DecodeManager::with_threads(Span::none(), 1).unwrap();
        let mut is = InStream::from_slice(&[1, 2, 3]);
        let r = Rect::new(0, 0, 2, 2);
        assert!(
            !dm.decode_rect(&r, encoding::RAW, &mut is, &PixelFormat::BGR233, &shared)
                .unwrap()
        );
        assert_eq!(is.avail(), 3);
        assert_eq!(dm.total_stats(), DecoderStats::default());

        is.feed(&[4]);
        assert!(dm.decode_rect(&r, encoding::RAW, &mut is, &PixelFormat::BGR233, &shared).unwrap());
        dm.flush().unwrap();
        let s = dm.total_stats();
        assert_eq!((s.rects, s.bytes, s.pixels, s.equivalent), (1, 16, 4, 16));
    }

    #[test]
    fn worker_error_surfaces_on_flush() {
        let (_fb, shared) = framebuffer(4, 4);
        let mut dm = DecodeManager::with_threads(Span::none(), 2).unwrap();
        // subrect reaches past the rect
        let body = [0, 0, 0, 1, 3, 9, 0, 2, 0, 0, 0, 2, 0, 1];
        let mut is = InStream::from_slice(&body);
        let r = Rect::new(0, 0, 3, 3);
        assert!(dm.decode_rect(&r, encoding::RRE, &mut is, &PixelFormat::BGR233, &shared).unwrap());
        let err = dm.flush().unwrap_err();
        assert!(err.is_protocol());
        // reported once
        dm.flush().unwrap();
    }

    #[test]
    fn unknown_encoding_is_rejected() {
        let (_fb, shared) = framebuffer(4, 4);
        let mut dm = DecodeManager::with_threads(Span::none(), 1).unwrap();
        let mut is = InStream::new();
        let err = dm
            .decode_rect(&Rect::new(0, 0, 1, 1), 3, &mut is, &PixelFormat::BGR233, &shared)
            .unwrap_err();
        assert!(matches!(err, RfbError::UnknownEncoding(3)));
    }

    fn job(r: Rect, enc: i32, data: &[u8], fb: &SharedFramebuffer) -> Slot {
        let decoder: Arc<dyn Decoder> = Arc::from(create(enc).unwrap());
        let mut os = OutStream::new();
        os.write_bytes(data);
        let affected = decoder.affected_region(&r, data, &PixelFormat::BGR233);
        Slot {
            job: Arc::new(Job {
                rect: r,
                encoding: enc,
                decoder,
                pf: PixelFormat::BGR233,
                data: os,
                affected,
                fb: Arc::clone(fb),
            }),
            active: false,
        }
    }

    #[test]
    fn ordered_decoders_wait_for_earlier_rects() {
        let (_fb, shared) = framebuffer(64, 64);
        let mut q = Queue::default();
        q.entries.push_back(job(Rect::new(0, 0, 8, 8), encoding::ZRLE, &[], &shared));
        q.entries.push_back(job(Rect::new(32, 32, 40, 40), encoding::ZRLE, &[], &shared));
        q.entries.push_back(job(Rect::new(16, 0, 24, 8), encoding::RAW, &[], &shared));

        let first = find_entry(&mut q).unwrap();
        assert_eq!(first.rect, Rect::new(0, 0, 8, 8));
        // second ZRLE rect is disjoint but shares the stream
        let next = find_entry(&mut q).unwrap();
        assert_eq!(next.encoding, encoding::RAW);
        assert!(find_entry(&mut q).is_none());
    }

    #[test]
    fn tight_streams_decide_ordering() {
        let (_fb, shared) = framebuffer(64, 64);
        let mut q = Queue::default();
        q.entries.push_back(job(Rect::new(0, 0, 8, 8), encoding::TIGHT, &[0x10], &shared));
        q.entries.push_back(job(Rect::new(8, 0, 16, 8), encoding::TIGHT, &[0x50], &shared));
        q.entries.push_back(job(Rect::new(16, 0, 24, 8), encoding::TIGHT, &[0x20], &shared));

        assert_eq!(find_entry(&mut q).unwrap().rect.tl.x, 0);
        // stream 1 again: must wait; stream 2 may go
        assert_eq!(find_entry(&mut q).unwrap().rect.tl.x, 16);
        assert!(find_entry(&mut q).is_none());
    }

    #[test]
    fn overlapping_rects_wait() {
        let (_fb, shared) = framebuffer(64, 64);
        let mut q = Queue::default();
        q.entries.push_back(job(Rect::new(0, 0, 8, 8), encoding::RAW, &[], &shared));
        q.entries.push_back(job(Rect::new(4, 4, 12, 12), encoding::RAW, &[], &shared));
        // copy whose source overlaps the first rect
        q.entries.push_back(job(
            Rect::new(20, 20, 24, 24),
            encoding::COPY_RECT,
            &[0, 2, 0, 2],
            &shared,
        ));
        q.entries.push_back(job(Rect::new(30, 30, 34, 34), encoding::RAW, &[], &shared));

        assert_eq!(find_entry(&mut q).unwrap().rect.tl.x, 0);
        assert_eq!(find_entry(&mut q).unwrap().rect.tl.x, 30);
        assert!(find_entry(&mut q).is_none());
    }
}
