use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mirror_wire::ControllerConfig;
use nix::sys::signal::{self, SigHandler, Signal};
use tracing_subscriber::EnvFilter;

use mirrorctl::connection::{ChannelSink, ConnectionEvent};
use mirrorctl::controller::MultiSessionController;
use mirrorctl::decoder::{H264Decoder, SyntheticDecoder};
use mirrorctl::deploy::AdbDeployer;
use mirrorctl::discovery::DiscoveryClient;
use mirrorctl::cli;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: i32) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs SIGINT/SIGTERM handlers that flip [`SHUTDOWN_REQUESTED`] and
/// ignores SIGPIPE, which otherwise kills the process the first time a
/// remote connection disconnects mid-write.
fn install_signal_handlers() -> Result<()> {
    unsafe {
        signal::signal(Signal::SIGINT, SigHandler::Handler(request_shutdown)).context("install SIGINT handler")?;
        signal::signal(Signal::SIGTERM, SigHandler::Handler(request_shutdown)).context("install SIGTERM handler")?;
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn).context("ignore SIGPIPE")?;
    }
    Ok(())
}

/// Loads controller configuration from `path` if it exists, falling back to
/// defaults (with a warning) otherwise, matching
/// `mirrorctl_server::main::load_config`.
fn load_config(path: Option<&str>) -> Result<ControllerConfig> {
    let Some(path) = path else {
        return Ok(ControllerConfig::default());
    };
    let path = Path::new(path);
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(ControllerConfig::default());
    }
    let contents = std::fs::read_to_string(path).with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: ControllerConfig = toml::from_str(&contents).context("failed to parse config TOML")?;
    tracing::info!(path = %path.display(), "loaded configuration");
    Ok(config)
}

#[cfg(feature = "openh264-backend")]
fn decoder_factory() -> Arc<dyn Fn() -> Box<dyn H264Decoder> + Send + Sync> {
    Arc::new(|| match mirrorctl::decoder::openh264_backend::OpenH264Decoder::new() {
        Ok(decoder) => Box::new(decoder) as Box<dyn H264Decoder>,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize openh264 decoder, falling back to a synthetic one");
            Box::new(SyntheticDecoder::new(1080, 1920))
        }
    })
}

#[cfg(not(feature = "openh264-backend"))]
fn decoder_factory() -> Arc<dyn Fn() -> Box<dyn H264Decoder> + Send + Sync> {
    tracing::warn!("openh264-backend disabled, decoding frames with a synthetic placeholder decoder");
    Arc::new(|| Box::new(SyntheticDecoder::new(1080, 1920)) as Box<dyn H264Decoder>)
}

/// Broadcasts discovery requests for a few seconds and prints every peer
/// seen, for `--discover` runs.
fn run_discovery(discovery_port: u16) -> Result<()> {
    let client = DiscoveryClient::bind().context("failed to bind discovery socket")?;
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    let mut last_broadcast = std::time::Instant::now() - Duration::from_secs(1);
    while std::time::Instant::now() < deadline {
        if last_broadcast.elapsed() >= Duration::from_secs(1) {
            client.broadcast_request(discovery_port, now_ms())?;
            last_broadcast = std::time::Instant::now();
        }
        let _ = client.poll_once(now_ms())?;
    }
    for peer in client.snapshot() {
        println!(
            "{}\t{}\t{} {}\t{}:{}",
            peer.response.device_id, peer.response.device_name, peer.response.device_manufacturer,
            peer.response.device_model, peer.address, peer.response.server_port
        );
    }
    Ok(())
}

fn now_ms() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
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
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
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

    if parsed.discover {
        return run_discovery(mirror_wire::DISCOVERY_PORT);
    }

    let device_id = parsed.device_id.context("--device is required unless --discover is given")?;
    let address_str = parsed.address.context("--address is required unless --discover is given")?;
    let (host, port_str) = address_str.rsplit_once(':').context("--address must be HOST:PORT")?;
    let address: IpAddr = host.parse().context("invalid --address host")?;
    let port: u16 = port_str.parse().context("invalid --address port")?;

    let deployer = Arc::new(AdbDeployer::new(config.adb_path.clone()));
    let artifact_dir = PathBuf::from(std::env::var("MIRRORCTL_ARTIFACT_DIR").unwrap_or_else(|_| ".".to_string()));

    let (tx, rx) = std::sync::mpsc::channel();
    let controller = Arc::new(MultiSessionController::new(deployer, artifact_dir, decoder_factory(), Arc::new(ChannelSink(tx))));

    controller.start_streaming(&device_id, address, Some(port)).context("failed to start streaming session")?;
    if let Some(session) = controller.session(&device_id) {
        session.connection.request_stream(true).context("failed to request video stream")?;
    }

    tracing::info!(%device_id, "mirrorctl running, press Ctrl+C to stop");
    while !SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok((device, ConnectionEvent::StreamingError(reason))) => {
                tracing::error!(device, reason, "device connection gave up, shutting down");
                break;
            }
            Ok((device, ConnectionEvent::ErrorMessage { code, message })) => {
                tracing::warn!(device, code, message, "server reported an error");
            }
            Ok(_) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::info!("shutdown requested, stopping all sessions");
    controller.stop_all();
    tracing::info!("mirrorctl shut down cleanly");
    Ok(())
}
