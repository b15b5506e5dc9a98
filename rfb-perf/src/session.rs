//! Loopback session: one server and one client over TCP.
//!
//! ```text
//!  Scene ──► tracker ──► EncodeManager ──► TcpStream ──► MsgReader ──► DecodeManager
//!                             ▲                 │                           │
//!                         Congestion ◄── pong ◄─┴──────── fence reply ◄─────┘
//! ```
//!
//! The server streams one update per frame after the client's first
//! request. Every update is followed by a Fence request; the client's
//! reply is the pong that feeds the congestion estimator. While the
//! estimator reports congestion the server keeps animating but holds
//! the accumulated changes back. Once the scene has run its frames the
//! server sends whatever is still pending and closes its side; the
//! client drains the stream and both framebuffers are compared.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use rfb_core::message::{self, read_client_message};
use rfb_core::{
    ClientMessage, ClientParams, ComparingUpdateTracker, Congestion, DecodeManager, DecoderStats,
    EncodeManager, EncoderStats, FenceFlags, InStream, ManagedPixelBuffer, MsgHandler, MsgReader,
    OutStream, PixelBuffer, PixelFormat, Rect, Region, RfbError, SharedFramebuffer,
    SimpleUpdateTracker, UpdateInfo, UpdateTracker,
};

use crate::scene::Scene;

/// Poll interval while congested with no RTT measured yet.
const NO_RTT_POLL: Duration = Duration::from_millis(10);

// ── SessionConfig ────────────────────────────────────────────────

/// Resolved session parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub width: i32,
    pub height: i32,
    pub frames: u32,
    pub frame_interval: Duration,
    pub pf: PixelFormat,
    /// SetEncodings list sent by the client, most preferred first.
    pub encodings: Vec<i32>,
    /// Filter changes through a [`ComparingUpdateTracker`].
    pub compare: bool,
    /// `None` sizes the decode pool from the CPU count.
    pub decode_threads: Option<usize>,
}

// ── SessionReport ────────────────────────────────────────────────

/// What a finished session measured.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub frames: u64,
    pub updates_sent: u64,
    pub updates_received: u64,
    pub bytes_sent: u64,
    pub pings: u64,
    pub pongs: u64,
    /// Frames whose changes were held back by congestion.
    pub congested_frames: u64,
    pub congestion_window: u32,
    pub base_rtt_ms: Option<u32>,
    /// Bytes per second.
    pub bandwidth: u64,
    pub encode: EncoderStats,
    pub copy: EncoderStats,
    pub decode: DecoderStats,
    /// Client framebuffer equals the server's after the last update.
    pub framebuffer_match: bool,
    pub elapsed_ms: u64,
}

// ── PerfSession ──────────────────────────────────────────────────

pub struct PerfSession {
    config: SessionConfig,
    running: Arc<AtomicBool>,
}

impl PerfSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle that ends the session early when set to `false`.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run server and client to completion.
    pub async fn run(&self) -> Result<SessionReport, RfbError> {
        self.running.store(true, Ordering::SeqCst);
        let started = Instant::now();

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        info!("session listening on {addr}");

        let client_cfg = self.config.clone();
        let client = tokio::spawn(run_client(addr, client_cfg).instrument(info_span!("client")));

        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        info!("client connected from {peer}");

        let server = run_server(stream, &self.config, &self.running).await;
        let client = client
            .await
            .map_err(|e| RfbError::Worker(format!("client task: {e}")))?;
        self.running.store(false, Ordering::SeqCst);

        let server = server?;
        let client = client?;

        let framebuffer_match = server.framebuffer == client.framebuffer;
        if !framebuffer_match {
            warn!("client framebuffer differs from the server's");
        }

        Ok(SessionReport {
            frames: server.frames,
            updates_sent: server.updates,
            updates_received: client.updates,
            bytes_sent: server.bytes,
            pings: server.pings,
            pongs: server.pongs,
            congested_frames: server.congested_frames,
            congestion_window: server.congestion_window,
            base_rtt_ms: server.base_rtt,
            bandwidth: server.bandwidth,
            encode: server.encode,
            copy: server.copy,
            decode: client.decode,
            framebuffer_match,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

// ── Server ───────────────────────────────────────────────────────

struct ServerOutcome {
    frames: u64,
    updates: u64,
    bytes: u64,
    pings: u64,
    pongs: u64,
    congested_frames: u64,
    congestion_window: u32,
    base_rtt: Option<u32>,
    bandwidth: u64,
    encode: EncoderStats,
    copy: EncoderStats,
    framebuffer: Vec<u8>,
}

/// The server's change tracker, with or without pixel comparison.
enum ServerTracker {
    Simple(SimpleUpdateTracker),
    Comparing(ComparingUpdateTracker),
}

impl ServerTracker {
    /// A tracker with the whole of `fb` pending.
    fn new(fb: &dyn PixelBuffer, compare: bool) -> Self {
        if compare {
            return Self::Comparing(ComparingUpdateTracker::new(fb));
        }
        let mut t = SimpleUpdateTracker::new();
        t.add_changed(&Region::from(fb.rect()));
        Self::Simple(t)
    }

    fn sink(&mut self) -> &mut dyn UpdateTracker {
        match self {
            Self::Simple(t) => t,
            Self::Comparing(t) => t,
        }
    }

    /// Everything pending inside `clip`, leaving the tracker empty.
    fn take_update(&mut self, fb: &dyn PixelBuffer, clip: &Region) -> Result<UpdateInfo, RfbError> {
        match self {
            Self::Simple(t) => {
                let ui = t.get_update_info(clip);
                t.clear();
                Ok(ui)
            }
            Self::Comparing(t) => {
                t.compare(fb)?;
                let ui = t.get_update_info(clip);
                t.clear();
                Ok(ui)
            }
        }
    }

    fn log_stats(&mut self) {
        if let Self::Comparing(t) = self {
            t.log_stats();
        }
    }
}

fn lock(congestion: &Mutex<Congestion>) -> MutexGuard<'_, Congestion> {
    congestion.lock().unwrap_or_else(|e| e.into_inner())
}

/// State the server loop threads through each update.
struct Sender<W> {
    wr: W,
    os: OutStream,
    em: EncodeManager,
    cp: ClientParams,
    congestion: Arc<Mutex<Congestion>>,
    /// Bytes written so far, as the estimator's wrapping position.
    position: u32,
    updates: u64,
    bytes: u64,
    pings: u64,
}

impl<W: AsyncWrite + Unpin> Sender<W> {
    /// Encode and write `ui`, then a Fence request if the estimator has
    /// room for another ping.
    async fn send(&mut self, ui: &UpdateInfo, fb: &(dyn PixelBuffer + Sync)) -> Result<(), RfbError> {
        self.os.clear();
        self.em.write_update(ui, fb, &self.cp, &mut self.os)?;
        self.write_out().await?;
        self.updates += 1;

        if !self.cp.supports_fence() {
            return Ok(());
        }
        let pinged = lock(&self.congestion).sent_ping();
        if pinged {
            self.os.clear();
            message::write_fence(&mut self.os, FenceFlags::REQUEST | FenceFlags::BLOCK_BEFORE, &[]);
            self.write_out().await?;
            self.pings += 1;
        }
        Ok(())
    }

    async fn write_out(&mut self) -> Result<(), RfbError> {
        self.wr.write_all(self.os.as_slice()).await?;
        let n = self.os.len();
        self.bytes += n as u64;
        self.position = self.position.wrapping_add(n as u32);
        lock(&self.congestion).update_position(self.position);
        Ok(())
    }
}

/// Read the client's SetPixelFormat, SetEncodings and first update
/// request.
async fn server_handshake<R: AsyncRead + Unpin>(
    rd: &mut R,
    is: &mut InStream,
    width: i32,
    height: i32,
) -> Result<ClientParams, RfbError> {
    let mut pf = None;
    let mut encodings = None;
    loop {
        while let Some(msg) = read_client_message(is)? {
            match msg {
                ClientMessage::SetPixelFormat(p) => pf = Some(p),
                ClientMessage::SetEncodings(e) => encodings = Some(e),
                ClientMessage::UpdateRequest { .. } => {
                    let pf = pf.ok_or(RfbError::ProtocolViolation(
                        "update request before pixel format",
                    ))?;
                    let cp = ClientParams::new(pf, width, height)
                        .with_encodings(encodings.as_deref().unwrap_or(&[]));
                    return Ok(cp);
                }
                other => debug!(?other, "ignored during handshake"),
            }
        }
        if is.fill_from(rd).await? == 0 {
            return Err(RfbError::Protocol("client closed during handshake".into()));
        }
    }
}

/// Consume client messages until EOF, turning Fence replies into pongs.
async fn read_pongs<R: AsyncRead + Unpin>(
    mut rd: R,
    mut is: InStream,
    congestion: Arc<Mutex<Congestion>>,
    pongs: Arc<AtomicU64>,
) -> Result<(), RfbError> {
    loop {
        while let Some(msg) = read_client_message(&mut is)? {
            match msg {
                ClientMessage::Fence { flags, .. } if !flags.contains(FenceFlags::REQUEST) => {
                    lock(&congestion).got_pong();
                    pongs.fetch_add(1, Ordering::Relaxed);
                }
                ClientMessage::UpdateRequest { .. } => {}
                other => debug!(?other, "ignored client message"),
            }
        }
        if is.fill_from(&mut rd).await? == 0 {
            return Ok(());
        }
    }
}

/// Sleep until the estimator has room again. Returns `false` if the
/// client went away or the session was stopped first.
async fn wait_uncongested(
    congestion: &Mutex<Congestion>,
    reader: &JoinHandle<Result<(), RfbError>>,
    running: &AtomicBool,
) -> bool {
    loop {
        let eta = lock(congestion).get_uncongested_eta();
        if eta == 0 {
            return true;
        }
        if reader.is_finished() || !running.load(Ordering::SeqCst) {
            return false;
        }
        let wait = if eta < 0 {
            NO_RTT_POLL
        } else {
            Duration::from_millis(eta as u64)
        };
        tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
    }
}

async fn run_server(
    stream: TcpStream,
    cfg: &SessionConfig,
    running: &AtomicBool,
) -> Result<ServerOutcome, RfbError> {
    let span = info_span!("server");
    let (mut rd, wr) = stream.into_split();

    let mut is = InStream::new();
    let cp = server_handshake(&mut rd, &mut is, cfg.width, cfg.height).await?;
    {
        let _enter = span.enter();
        info!(
            pf = %cp.pf,
            encodings = ?cp.encodings(),
            "client parameters"
        );
    }

    let mut scene = Scene::new(cfg.pf, cfg.width, cfg.height)?;
    let mut tracker = ServerTracker::new(scene.framebuffer(), cfg.compare);
    let clip = Region::from(scene.framebuffer().rect());

    let congestion = Arc::new(Mutex::new(Congestion::new()));
    let pongs = Arc::new(AtomicU64::new(0));
    let reader = tokio::spawn(read_pongs(rd, is, Arc::clone(&congestion), Arc::clone(&pongs)));

    let mut sender = Sender {
        wr,
        os: OutStream::new(),
        em: EncodeManager::new(span.clone()),
        cp,
        congestion: Arc::clone(&congestion),
        position: 0,
        updates: 0,
        bytes: 0,
        pings: 0,
    };

    // the first request was not incremental
    let ui = tracker.take_update(scene.framebuffer(), &clip)?;
    sender.send(&ui, scene.framebuffer()).await?;

    // without Fence there are no pongs, so nothing to pace by
    let paced = sender.cp.supports_fence();
    let mut congested_frames = 0u64;
    let mut ticker = tokio::time::interval(cfg.frame_interval);
    ticker.tick().await;
    for _ in 0..cfg.frames {
        if !running.load(Ordering::SeqCst) || reader.is_finished() {
            break;
        }
        ticker.tick().await;
        scene.step(tracker.sink())?;

        if paced && lock(&congestion).is_congested() {
            congested_frames += 1;
            continue;
        }
        let ui = tracker.take_update(scene.framebuffer(), &clip)?;
        if !ui.is_empty() {
            sender.send(&ui, scene.framebuffer()).await?;
        }
    }

    // flush what congestion held back
    if !paced || wait_uncongested(&congestion, &reader, running).await {
        let ui = tracker.take_update(scene.framebuffer(), &clip)?;
        if !ui.is_empty() {
            sender.send(&ui, scene.framebuffer()).await?;
        }
    }
    sender.wr.shutdown().await?;

    match reader.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("client reader failed: {e}"),
        Err(e) => warn!("client reader task: {e}"),
    }

    let _enter = span.enter();
    sender.em.log_stats();
    tracker.log_stats();

    let cong = lock(&congestion);
    info!(
        frames = scene.frame(),
        updates = sender.updates,
        bytes = sender.bytes,
        window = cong.congestion_window(),
        "server done"
    );
    Ok(ServerOutcome {
        frames: scene.frame(),
        updates: sender.updates,
        bytes: sender.bytes,
        pings: sender.pings,
        pongs: pongs.load(Ordering::Relaxed),
        congested_frames,
        congestion_window: cong.congestion_window(),
        base_rtt: cong.base_rtt(),
        bandwidth: cong.get_bandwidth(),
        encode: sender.em.total_stats(),
        copy: *sender.em.copy_stats(),
        framebuffer: scene.framebuffer().data().to_vec(),
    })
}

// ── Client ───────────────────────────────────────────────────────

struct ClientOutcome {
    updates: u64,
    decode: DecoderStats,
    framebuffer: Vec<u8>,
}

/// Client side message handling: rects go to the decode pool, Fence
/// requests are answered once earlier rects are on screen.
struct PerfClient {
    pf: PixelFormat,
    fb: Arc<Mutex<ManagedPixelBuffer>>,
    shared: SharedFramebuffer,
    dm: DecodeManager,
    updates: u64,
    replies: Vec<(FenceFlags, Vec<u8>)>,
}

impl PerfClient {
    fn new(cfg: &SessionConfig, span: Span) -> Result<Self, RfbError> {
        let fb = Arc::new(Mutex::new(ManagedPixelBuffer::new(cfg.pf, cfg.width, cfg.height)));
        let shared: SharedFramebuffer = fb.clone();
        let dm = match cfg.decode_threads {
            Some(n) => DecodeManager::with_threads(span, n)?,
            None => DecodeManager::new(span)?,
        };
        Ok(Self {
            pf: cfg.pf,
            fb,
            shared,
            dm,
            updates: 0,
            replies: Vec::new(),
        })
    }

    /// Wait for the decode pool and copy out the framebuffer.
    fn finish(mut self) -> Result<ClientOutcome, RfbError> {
        self.dm.flush()?;
        let framebuffer = self
            .fb
            .lock()
            .map_err(|_| RfbError::Worker("framebuffer lock poisoned".into()))?
            .data()
            .to_vec();
        Ok(ClientOutcome {
            updates: self.updates,
            decode: self.dm.total_stats(),
            framebuffer,
        })
    }
}

impl MsgHandler for PerfClient {
    fn framebuffer_update_end(&mut self) -> Result<(), RfbError> {
        self.updates += 1;
        Ok(())
    }

    fn data_rect(
        &mut self,
        rect: &Rect,
        encoding: i32,
        is: &mut InStream,
    ) -> Result<bool, RfbError> {
        self.dm.decode_rect(rect, encoding, is, &self.pf, &self.shared)
    }

    fn fence(&mut self, flags: FenceFlags, payload: &[u8]) -> Result<(), RfbError> {
        if !flags.contains(FenceFlags::REQUEST) {
            return Ok(());
        }
        if flags.contains(FenceFlags::BLOCK_BEFORE) {
            self.dm.flush()?;
        }
        self.replies.push((flags - FenceFlags::REQUEST, payload.to_vec()));
        Ok(())
    }
}

async fn run_client(addr: SocketAddr, cfg: SessionConfig) -> Result<ClientOutcome, RfbError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let (rd, wr) = stream.into_split();
    client_session(rd, wr, &cfg).await
}

/// Handshake, then decode until the server closes the stream.
async fn client_session<R, W>(
    mut rd: R,
    mut wr: W,
    cfg: &SessionConfig,
) -> Result<ClientOutcome, RfbError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut os = OutStream::new();
    message::write_set_pixel_format(&mut os, &cfg.pf);
    message::write_set_encodings(&mut os, &cfg.encodings);
    let full = Rect::new(0, 0, cfg.width, cfg.height);
    message::write_framebuffer_update_request(&mut os, &full, false);
    wr.write_all(os.as_slice()).await?;

    let mut client = PerfClient::new(cfg, Span::current())?;
    let mut reader = MsgReader::new();
    let mut is = InStream::new();
    loop {
        while reader.read_msg(&mut is, &mut client)? {}

        if !client.replies.is_empty() {
            os.clear();
            for (flags, payload) in client.replies.drain(..) {
                message::write_fence(&mut os, flags, &payload);
            }
            wr.write_all(os.as_slice()).await?;
        }

        if is.fill_from(&mut rd).await? == 0 {
            break;
        }
    }
    if !reader.is_idle() || is.avail() > 0 {
        return Err(RfbError::Protocol("server closed mid-message".into()));
    }
    wr.shutdown().await?;

    let outcome = client.finish()?;
    info!(updates = outcome.updates, rects = outcome.decode.rects, "client done");
    Ok(outcome)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rfb_core::{ModifiablePixelBuffer, encoding};

    fn small(enc: i32) -> SessionConfig {
        SessionConfig {
            width: 96,
            height: 64,
            frames: 12,
            frame_interval: Duration::from_millis(1),
            pf: PixelFormat::RGB888,
            encodings: vec![
                enc,
                encoding::COPY_RECT,
                encoding::LAST_RECT,
                encoding::FENCE,
            ],
            compare: true,
            decode_threads: Some(2),
        }
    }

    #[tokio::test]
    async fn loopback_session_ends_with_matching_framebuffers() {
        for enc in [encoding::RAW, encoding::HEXTILE, encoding::TIGHT, encoding::ZRLE] {
            let session = PerfSession::new(small(enc));
            let report = session.run().await.unwrap();
            assert!(report.framebuffer_match, "encoding {enc}");
            assert_eq!(report.updates_sent, report.updates_received);
            assert_eq!(report.frames, 12);
            assert!(report.pings >= 1);
            assert!(report.pongs <= report.pings);
            assert!(!session.is_running());
        }
    }

    #[tokio::test]
    async fn session_without_compare_or_fence() {
        let mut cfg = small(encoding::RRE);
        cfg.compare = false;
        cfg.encodings.retain(|&e| e != encoding::FENCE && e != encoding::LAST_RECT);
        cfg.pf = PixelFormat::RGB565;
        let report = PerfSession::new(cfg).run().await.unwrap();
        assert!(report.framebuffer_match);
        assert_eq!(report.pings, 0);
        assert_eq!(report.pongs, 0);
        assert_eq!(report.base_rtt_ms, None);
    }

    #[tokio::test]
    async fn stopped_session_still_reports() {
        let mut cfg = small(encoding::ZRLE);
        cfg.frames = 10_000;
        let session = PerfSession::new(cfg);
        let stop = session.stop_handle();
        let handle = tokio::spawn(async move { session.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.store(false, Ordering::SeqCst);
        let report = handle.await.unwrap().unwrap();
        assert!(report.frames < 10_000);
    }

    #[tokio::test]
    async fn client_answers_fence_and_decodes() {
        let cfg = SessionConfig {
            width: 8,
            height: 4,
            frames: 1,
            frame_interval: Duration::from_millis(1),
            pf: PixelFormat::RGB888,
            encodings: vec![encoding::RAW, encoding::FENCE],
            compare: false,
            decode_threads: Some(1),
        };

        let mut hello = OutStream::new();
        message::write_set_pixel_format(&mut hello, &cfg.pf);
        message::write_set_encodings(&mut hello, &cfg.encodings);
        message::write_framebuffer_update_request(&mut hello, &Rect::new(0, 0, 8, 4), false);

        let mut fb = ManagedPixelBuffer::new(cfg.pf, 8, 4);
        fb.fill_rect_pf(&cfg.pf, &Rect::new(2, 1, 6, 3), 0x00AB_CDEF).unwrap();
        let cp = ClientParams::new(cfg.pf, 8, 4).with_encodings(&cfg.encodings);
        let ui = UpdateInfo {
            changed: Region::from(fb.rect()),
            ..UpdateInfo::default()
        };
        let mut update = OutStream::new();
        EncodeManager::new(Span::none())
            .write_update(&ui, &fb, &cp, &mut update)
            .unwrap();
        message::write_fence(&mut update, FenceFlags::REQUEST | FenceFlags::BLOCK_BEFORE, b"p1");

        let mut reply = OutStream::new();
        message::write_fence(&mut reply, FenceFlags::BLOCK_BEFORE, b"p1");

        let mock = tokio_test::io::Builder::new()
            .write(hello.as_slice())
            .read(&update.as_slice()[..10])
            .read(&update.as_slice()[10..])
            .write(reply.as_slice())
            .build();
        let (rd, wr) = tokio::io::split(mock);

        let outcome = client_session(rd, wr, &cfg).await.unwrap();
        assert_eq!(outcome.updates, 1);
        assert_eq!(outcome.framebuffer, fb.data());
        assert_eq!(outcome.decode.rects, 1);
    }

    #[tokio::test]
    async fn client_rejects_truncated_stream() {
        let cfg = small(encoding::RAW);
        let mut hello = OutStream::new();
        message::write_set_pixel_format(&mut hello, &cfg.pf);
        message::write_set_encodings(&mut hello, &cfg.encodings);
        message::write_framebuffer_update_request(&mut hello, &Rect::new(0, 0, 96, 64), false);

        let mut partial = OutStream::new();
        message::write_framebuffer_update_start(&mut partial, 1);

        let mock = tokio_test::io::Builder::new()
            .write(hello.as_slice())
            .read(&partial.as_slice()[..3])
            .build();
        let (rd, wr) = tokio::io::split(mock);
        assert!(client_session(rd, wr, &cfg).await.is_err());
    }
}
