//! rfb-perf entry point.
//!
//! ```text
//! rfb-perf                      Run with rfb-perf.toml (or defaults)
//! rfb-perf --config <path>      Load a custom config TOML
//! rfb-perf --gen-config         Write default config to stdout
//! rfb-perf --encoding zrle      Override the preferred encoding
//! rfb-perf --json               Print the report as JSON
//! ```

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rfb_core::encoding;
use rfb_perf::config::PerfConfig;
use rfb_perf::session::PerfSession;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "rfb-perf", about = "Loopback RFB session benchmark")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "rfb-perf.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Preferred encoding, overriding the config file.
    #[arg(short, long)]
    encoding: Option<String>,

    /// Number of frames, overriding the config file.
    #[arg(short, long)]
    frames: Option<u32>,

    /// Print the session report as JSON.
    #[arg(long)]
    json: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&PerfConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = PerfConfig::load(&cli.config);
    if let Some(enc) = cli.encoding {
        config.encoding.preferred = enc;
    }
    if let Some(frames) = cli.frames {
        config.session.frames = frames;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let session_config = config.to_session_config();
    info!("rfb-perf v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "framebuffer: {}x{} {}",
        session_config.width, session_config.height, session_config.pf
    );
    info!(
        "frames: {} every {:?}",
        session_config.frames, session_config.frame_interval
    );
    info!("preferred encoding: {}", encoding::name(session_config.encodings[0]));

    let session = PerfSession::new(session_config);
    let stop = session.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, stopping after the current frame");
        stop.store(false, Ordering::SeqCst);
    });

    let report = session.run().await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    info!(
        "{} frames, {} updates, {} bytes in {} ms",
        report.frames, report.updates_sent, report.bytes_sent, report.elapsed_ms
    );
    info!(
        "encode ratio {:.2}, decode ratio {:.2}",
        report.encode.ratio(),
        report.decode.ratio()
    );
    info!(
        "congestion: window {} bytes, base rtt {:?} ms, {} frames held back",
        report.congestion_window, report.base_rtt_ms, report.congested_frames
    );
    if report.framebuffer_match {
        info!("client framebuffer matches");
    } else {
        return Err("client framebuffer does not match the server's".into());
    }
    Ok(())
}
