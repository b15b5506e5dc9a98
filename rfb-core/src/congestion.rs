//! Delay-based congestion control for the update stream.
//!
//! RFB runs over a reliable transport, so losses never show up and a
//! loss-based controller would happily fill every buffer between us and
//! the client. Instead the server measures round-trip times with
//! Fence ping/pongs and keeps the amount of unacknowledged data close
//! to what the wire can carry, TCP Vegas style:
//!
//! ```text
//!            sent_ping()                 got_pong()
//!  server ──────●───────────────────────────────●────▶ time
//!               │◀──────────── rtt ────────────▶│
//!               │◀ base_rtt ▶│◀ queueing delay ▶│
//! ```
//!
//! The smallest RTT ever seen approximates pure wire latency. Anything
//! above it is time spent in buffers, and the window shrinks or grows
//! to keep that extra delay at a few milliseconds.
//!
//! Stream positions are byte offsets of the outgoing stream and may
//! wrap. Every time-dependent operation has an `_at` variant taking
//! the current instant explicitly.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, trace, warn};

/// Enough to get going quickly on a decent network; a too large value
/// is corrected within a few round trips.
const INITIAL_WINDOW: u32 = 16 * 1024;

/// TCP's floor is 3×MSS; without knowing the MSS 4 KiB is a fair guess.
const MINIMUM_WINDOW: u32 = 4 * 1024;

const MAXIMUM_WINDOW: u32 = 4 * 1024 * 1024;

/// Unanswered pings kept before [`Congestion::sent_ping`] refuses more.
pub const MAX_PINGS: usize = 256;

/// RTT assumed for bandwidth estimates before anything was measured.
const GUESSED_RTT_MS: u32 = 60;

/// Marker for "no measurement" in the millisecond fields.
const UNKNOWN: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct Ping {
    time: Instant,
    pos: u32,
    extra: u32,
    congested: bool,
}

/// Milliseconds from `from` to `to`, zero if the clock went backwards.
fn ms_between(from: Instant, to: Instant) -> u32 {
    to.saturating_duration_since(from)
        .as_millis()
        .min(u32::MAX as u128) as u32
}

/// `a` lies after `b` in a wrapping stream.
fn pos_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Scale `v` by `num / den` without overflowing.
fn scale(v: u32, num: u32, den: u32) -> u32 {
    if den == 0 {
        return v;
    }
    (v as u64 * num as u64 / den as u64).min(u32::MAX as u64) as u32
}

// ── Congestion ───────────────────────────────────────────────────

/// Per-connection congestion state.
#[derive(Debug, Clone)]
pub struct Congestion {
    last_position: u32,
    /// Bytes sitting in buffers beyond what one window explains.
    extra_buffer: u32,
    last_update: Instant,
    last_sent: Instant,

    base_rtt: u32,
    /// `base_rtt` that survives idle resets, for bandwidth estimates.
    safe_base_rtt: u32,
    cong_window: u32,
    in_slow_start: bool,

    last_pong: Ping,
    last_pong_arrival: Instant,

    measurements: u32,
    last_adjustment: Instant,
    min_rtt: u32,
    min_congested_rtt: u32,

    pings: VecDeque<Ping>,
}

impl Default for Congestion {
    fn default() -> Self {
        Self::new()
    }
}

impl Congestion {
    pub fn new() -> Self {
        Self::new_at(Instant::now())
    }

    pub fn new_at(now: Instant) -> Self {
        Self {
            last_position: 0,
            extra_buffer: 0,
            last_update: now,
            last_sent: now,
            base_rtt: UNKNOWN,
            safe_base_rtt: UNKNOWN,
            cong_window: INITIAL_WINDOW,
            in_slow_start: true,
            last_pong: Ping {
                time: now,
                pos: 0,
                extra: 0,
                congested: false,
            },
            last_pong_arrival: now,
            measurements: 0,
            last_adjustment: now,
            min_rtt: UNKNOWN,
            min_congested_rtt: UNKNOWN,
            pings: VecDeque::new(),
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    /// Lowest RTT seen since the last idle reset, in milliseconds.
    pub fn base_rtt(&self) -> Option<u32> {
        (self.base_rtt != UNKNOWN).then_some(self.base_rtt)
    }

    pub fn congestion_window(&self) -> u32 {
        self.cong_window
    }

    pub fn in_slow_start(&self) -> bool {
        self.in_slow_start
    }

    /// Pings sent and not answered yet.
    pub fn pending_pings(&self) -> usize {
        self.pings.len()
    }

    /// Estimated bandwidth in bytes per second.
    pub fn get_bandwidth(&self) -> u64 {
        let rtt = if self.safe_base_rtt == UNKNOWN {
            GUESSED_RTT_MS
        } else {
            self.safe_base_rtt.max(1)
        };
        self.cong_window as u64 * 1000 / rtt as u64
    }

    // ── Events ───────────────────────────────────────────────────

    /// Tell the estimator the stream has reached byte offset `pos`.
    pub fn update_position(&mut self, pos: u32) {
        self.update_position_at(pos, Instant::now());
    }

    pub fn update_position_at(&mut self, pos: u32, now: Instant) {
        let delta = pos.wrapping_sub(self.last_position);
        if delta > 0 || self.extra_buffer > 0 {
            self.last_sent = now;
        }

        // idle for more than a crude RTO: the measurements are stale
        let rto = self.base_rtt.saturating_mul(2).max(100);
        if ms_between(self.last_sent, now) > rto {
            if self.cong_window > INITIAL_WINDOW {
                debug!(
                    window_kib = INITIAL_WINDOW / 1024,
                    "idle, reverting to initial window"
                );
            }
            self.cong_window = self.cong_window.min(INITIAL_WINDOW);
            self.base_rtt = UNKNOWN;
            self.measurements = 0;
            self.last_adjustment = now;
            self.min_rtt = UNKNOWN;
            self.min_congested_rtt = UNKNOWN;
            self.in_slow_start = true;
        }

        // Without an RTT we cannot tell how fast the buffers drain.
        if self.base_rtt != UNKNOWN {
            self.extra_buffer = self.extra_buffer.saturating_add(delta);
            let consumed = scale(
                ms_between(self.last_update, now),
                self.cong_window,
                self.base_rtt,
            );
            self.extra_buffer = self.extra_buffer.saturating_sub(consumed);
        }

        self.last_position = pos;
        self.last_update = now;
    }

    /// Record a ping sent at the current stream position.
    ///
    /// Returns `false`, recording nothing, when [`MAX_PINGS`] pings are
    /// already unanswered; the caller must then not send one.
    pub fn sent_ping(&mut self) -> bool {
        self.sent_ping_at(Instant::now())
    }

    pub fn sent_ping_at(&mut self, now: Instant) -> bool {
        if self.pings.len() >= MAX_PINGS {
            warn!(pending = self.pings.len(), "too many unanswered pings");
            return false;
        }
        let congested = self.is_congested_at(now);
        self.pings.push_back(Ping {
            time: now,
            pos: self.last_position,
            extra: self.extra_buffer,
            congested,
        });
        true
    }

    /// The client answered the oldest outstanding ping.
    pub fn got_pong(&mut self) {
        self.got_pong_at(Instant::now());
    }

    pub fn got_pong_at(&mut self, now: Instant) {
        let Some(ping) = self.pings.pop_front() else {
            return;
        };

        self.last_pong = ping;
        self.last_pong_arrival = now;

        let mut rtt = ms_between(ping.time, now).max(1);
        if rtt < self.base_rtt {
            self.base_rtt = rtt;
            self.safe_base_rtt = rtt;
        }

        // sent under an older window: says nothing about the current one
        if ping.time < self.last_adjustment {
            return;
        }

        // remove the time the ping spent queued behind excess data
        let delay = scale(ping.extra, self.base_rtt, self.cong_window);
        rtt = if delay < rtt { rtt - delay } else { 1 };

        // Below wire latency means the window was underestimated; we
        // cannot tell by how much.
        rtt = rtt.max(self.base_rtt);

        // Delay based: every pong counts, not only those limited by
        // the window, or growing congestion would go unseen.
        self.min_rtt = self.min_rtt.min(rtt);
        if ping.congested {
            self.min_congested_rtt = self.min_congested_rtt.min(rtt);
        }

        self.measurements += 1;
        self.update_congestion(now);
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Whether sending more now would exceed the window.
    pub fn is_congested(&self) -> bool {
        self.is_congested_at(Instant::now())
    }

    pub fn is_congested_at(&self, now: Instant) -> bool {
        self.get_in_flight_at(now) >= self.cong_window
    }

    /// Milliseconds until [`is_congested`](Self::is_congested) turns
    /// false: `0` if it already is, `-1` if nothing has been measured
    /// to extrapolate from.
    pub fn get_uncongested_eta(&self) -> i32 {
        self.get_uncongested_eta_at(Instant::now())
    }

    pub fn get_uncongested_eta_at(&self, now: Instant) -> i32 {
        if !self.is_congested_at(now) {
            return 0;
        }
        if self.base_rtt == UNKNOWN {
            return -1;
        }

        let target = self.last_position.wrapping_sub(self.cong_window);
        let tail = self.pending_tail();
        let mut prev = self.last_pong;
        let mut eta: u32 = 0;

        // Find the ping whose pong takes us below the window; past the
        // last one, pretend a ping went out at the last update.
        for ping in self.pings.iter().copied().chain(std::iter::once(tail)) {
            let step = self.ping_interval(&prev, &ping);
            if pos_after(ping.pos, target) {
                // only part of this step is needed to reach the target
                let span = ping.pos.wrapping_sub(prev.pos);
                let needed = if pos_after(target, prev.pos) {
                    target.wrapping_sub(prev.pos)
                } else {
                    0
                };
                eta = eta.saturating_add(scale(step, needed, span));
                break;
            }
            eta = eta.saturating_add(step);
            prev = ping;
        }

        let elapsed = ms_between(self.last_pong_arrival, now);
        eta.saturating_sub(elapsed).min(i32::MAX as u32) as i32
    }

    /// Estimated bytes sent but not yet received by the client.
    pub fn get_in_flight(&self) -> u32 {
        self.get_in_flight_at(Instant::now())
    }

    pub fn get_in_flight_at(&self, now: Instant) -> u32 {
        if self.last_pong.pos == self.last_position {
            return 0;
        }

        if self.base_rtt == UNKNOWN {
            return self.last_position.wrapping_sub(self.last_pong.pos);
        }

        // Guess how far the client got towards the next pong.
        let next = self.pings.front().copied().unwrap_or_else(|| self.pending_tail());
        let eta = self.ping_interval(&self.last_pong, &next);
        let elapsed = ms_between(self.last_pong_arrival, now);

        let acked = if eta <= elapsed {
            next.pos
        } else {
            let span = next.pos.wrapping_sub(self.last_pong.pos);
            self.last_pong.pos.wrapping_add(scale(span, elapsed, eta))
        };

        self.last_position.wrapping_sub(acked)
    }

    // ── Internals ────────────────────────────────────────────────

    /// A ping as if sent at the last position update.
    fn pending_tail(&self) -> Ping {
        Ping {
            time: self.last_update,
            pos: self.last_position,
            extra: self.extra_buffer,
            congested: false,
        }
    }

    /// Expected time between the pongs for `prev` and `next`, with the
    /// buffering delay each carried taken into account.
    fn ping_interval(&self, prev: &Ping, next: &Ping) -> u32 {
        let mut ms = ms_between(prev.time, next.time);
        ms = ms.saturating_add(scale(next.extra, self.base_rtt, self.cong_window));
        ms.saturating_sub(scale(prev.extra, self.base_rtt, self.cong_window))
    }

    fn update_congestion(&mut self, now: Instant) {
        // three samples keep the noise down
        if self.measurements < 3 {
            return;
        }

        // Aim for a few ms of extra delay: a perfect window looks the
        // same as a too small one.
        let mut diff = self.min_rtt.saturating_sub(self.base_rtt);

        // A huge spike is the nearest thing to a loss we can see.
        if diff > (self.base_rtt / 2).max(100) {
            self.cong_window = scale(self.cong_window, self.base_rtt, self.min_rtt);
            self.in_slow_start = false;
        }

        if self.in_slow_start {
            if diff > 25 {
                self.cong_window = scale(self.cong_window, self.base_rtt, self.min_rtt);
                self.in_slow_start = false;
            } else {
                // only grow if the whole window was actually used
                diff = self.min_congested_rtt.saturating_sub(self.base_rtt);
                if diff < 25 {
                    self.cong_window = self.cong_window.saturating_mul(2);
                }
            }
        } else if diff > 50 {
            self.cong_window = self.cong_window.saturating_sub(4096);
        } else {
            diff = self.min_congested_rtt.saturating_sub(self.base_rtt);
            if diff < 5 {
                self.cong_window = self.cong_window.saturating_add(8192);
            } else if diff < 25 {
                self.cong_window = self.cong_window.saturating_add(4096);
            }
        }

        self.cong_window = self.cong_window.clamp(MINIMUM_WINDOW, MAXIMUM_WINDOW);

        trace!(
            rtt = self.min_rtt,
            base_rtt = self.base_rtt,
            window_kib = self.cong_window / 1024,
            slow_start = self.in_slow_start,
            mbps = self.cong_window as f64 * 8.0 / self.base_rtt.max(1) as f64 / 1000.0,
            "congestion window adjusted"
        );

        self.measurements = 0;
        self.last_adjustment = now;
        self.min_rtt = UNKNOWN;
        self.min_congested_rtt = UNKNOWN;
    }
}

// ── Tests ────────────────────────────────────────────────────────
