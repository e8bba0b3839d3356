mod cli;
mod discovery;
mod error;
mod fanout;
mod h264;
mod input_inject;
mod pipeline;
mod registry;
mod session;
mod socket;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mirror_wire::{MetadataPayload, ServerConfig};
use nix::sys::signal::{self, SigHandler, Signal};
use tracing_subscriber::EnvFilter;

use crate::input_inject::{InputInjector, NullInjector};
use crate::pipeline::{FrameSource, SyntheticEncoder, SyntheticSource, VideoEncoder};
use crate::session::ServerSession;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: i32) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs SIGINT/SIGTERM handlers that flip [`SHUTDOWN_REQUESTED`] and
/// ignores SIGPIPE, which otherwise kills the process the first time a
/// client disconnects mid-write.
fn install_signal_handlers() -> Result<()> {
    unsafe {
        signal::signal(Signal::SIGINT, SigHandler::Handler(request_shutdown))
            .context("install SIGINT handler")?;
        signal::signal(Signal::SIGTERM, SigHandler::Handler(request_shutdown))
            .context("install SIGTERM handler")?;
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn).context("ignore SIGPIPE")?;
    }
    Ok(())
}

/// Loads configuration from `path` if it exists, falling back to defaults
/// (with a warning) otherwise — the file is optional, CLI flags and
/// defaults are always enough to start.
fn load_config(path: Option<&str>) -> Result<ServerConfig> {
    let Some(path) = path else {
        return Ok(ServerConfig::default());
    };
    let path = Path::new(path);
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(ServerConfig::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: ServerConfig = toml::from_str(&contents).context("failed to parse config TOML")?;
    tracing::info!(path = %path.display(), "loaded configuration");
    Ok(config)
}

fn build_metadata(config: &ServerConfig) -> MetadataPayload {
    let model = std::env::var("HOSTNAME").unwrap_or_else(|_| "mirrorctl-host".to_string());
    MetadataPayload {
        model,
        manufacturer: "mirrorctl".to_string(),
        android_version: env!("CARGO_PKG_VERSION").to_string(),
        api_level: 0,
        screen_width: config.video.width,
        screen_height: config.video.height,
        screen_density: 0,
        video_codec: "h264".to_string(),
        audio_codec: "none".to_string(),
        video_bitrate_kbps: config.video.bitrate_kbps,
        audio_bitrate_kbps: 0,
        fps: config.video.fps,
        audio_sample_rate: 0,
        audio_channels: 0,
    }
}

#[cfg(feature = "gst-x11-backend")]
fn build_backends(
    config: &ServerConfig,
) -> Result<(Box<dyn FrameSource>, Box<dyn VideoEncoder>, Box<dyn InputInjector>)> {
    let display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0".to_string());
    let source = pipeline::X11Capture::new(&display).context("failed to initialize X11 capture")?;
    let width = source.width();
    let height = source.height();
    let encoder = pipeline::GstEncoder::new(
        width,
        height,
        config.video.fps,
        config.video.bitrate_kbps,
        config.video.encoder.as_deref(),
    )
    .context("failed to initialize GStreamer encoder")?;
    let injector = input_inject::LinuxInputInjector::new(width, height)
        .context("failed to initialize uinput input injector")?;
    Ok((Box::new(source), Box::new(encoder), Box::new(injector)))
}

#[cfg(not(feature = "gst-x11-backend"))]
fn build_backends(
    config: &ServerConfig,
) -> Result<(Box<dyn FrameSource>, Box<dyn VideoEncoder>, Box<dyn InputInjector>)> {
    tracing::warn!("gst-x11-backend disabled, running with synthetic capture/encode and no input injection");
    let source = SyntheticSource::new(config.video.width, config.video.height, config.video.fps);
    let encoder = SyntheticEncoder::new(config.video.fps.max(1));
    Ok((Box::new(source), Box::new(encoder), Box::new(NullInjector)))
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let parsed = match cli::parse_args(args).context("failed to parse arguments")? {
        Some(parsed) => parsed,
        None => {
            println!("{}", cli::usage());
            return Ok(());
        }
    };

    let mut config = load_config(parsed.config_path.as_deref())?;
    cli::apply_overrides(&mut config, &parsed);

    let filter = if parsed.debug {
        EnvFilter::new("debug")
    } else if parsed.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.session.log_level.clone()))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{issue}");
            } else {
                tracing::warn!("{issue}");
            }
        }
        if has_errors {
            anyhow::bail!("configuration has {} issue(s), fix the ERROR(s) above and restart", issues.len());
        }
    }

    install_signal_handlers()?;

    let metadata = build_metadata(&config);
    let (source, encoder, injector) = build_backends(&config)?;

    let session = Arc::new(ServerSession::new(config, source, encoder, injector, metadata));
    session.initialize().context("failed to initialize server session")?;
    session.start().context("failed to start server session")?;

    tracing::info!("mirrorctl-server running, press Ctrl+C to stop");
    while !SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    tracing::info!("shutdown requested, stopping server session");
    session.stop().context("failed to stop server session cleanly")?;
    tracing::info!("mirrorctl-server shut down cleanly");
    Ok(())
}
