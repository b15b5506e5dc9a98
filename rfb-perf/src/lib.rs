//! # rfb-perf: Loopback RFB Session
//!
//! Runs an RFB server and client against each other over a local TCP
//! socket. The server animates a synthetic desktop, tracks what changed
//! and encodes updates paced by the congestion estimator; the client
//! answers Fence requests and decodes on a thread pool. The session
//! reports throughput, compression and whether both framebuffers ended
//! up identical.
//!
//! ## Modules
//!
//! - **config**: TOML configuration with per-section defaults
//! - **scene**: the synthetic desktop and its change reporting
//! - **session**: server loop, client loop and the final report

pub mod config;
pub mod scene;
pub mod session;
