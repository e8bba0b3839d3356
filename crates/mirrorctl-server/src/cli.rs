//! Command-line flag parsing for `mirrorctl-server` (spec.md §6.4). No
//! argument-parsing crate is used here: the flag surface is small and fixed.

use anyhow::Context;

pub struct CliArgs {
    pub config_path: Option<String>,
    pub port: Option<u16>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bitrate_kbps: Option<u32>,
    pub fps: Option<u32>,
    pub verbose: bool,
    pub debug: bool,
}

pub fn usage() -> &'static str {
    "mirrorctl-server [OPTIONS]\n\n\
     OPTIONS:\n\
     \x20   -c, --config <PATH>      Load configuration from PATH (TOML)\n\
     \x20   -p, --port <PORT>        Streaming TCP port [default: 8080]\n\
     \x20   -w, --width <PIXELS>     Capture width\n\
     \x20   -h, --height <PIXELS>    Capture height\n\
     \x20   -b, --bitrate <KBPS>     Video bitrate in kbps\n\
     \x20   -f, --fps <FPS>          Capture/encode frame rate\n\
     \x20   -v, --verbose            Enable verbose (info) logging\n\
     \x20   -d, --debug              Enable debug logging\n\
     \x20       --help               Print this message and exit"
}

/// Parses `args` (normally `std::env::args().skip(1)`). Returns `Ok(None)`
/// when `--help` was given, so the caller can print usage and exit 0.
pub fn parse_args(args: Vec<String>) -> anyhow::Result<Option<CliArgs>> {
    let mut config_path = None;
    let mut port = None;
    let mut width = None;
    let mut height = None;
    let mut bitrate_kbps = None;
    let mut fps = None;
    let mut verbose = false;
    let mut debug = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" => return Ok(None),
            "-c" | "--config" => {
                i += 1;
                config_path = Some(args.get(i).context("missing --config value")?.clone());
            }
            "-p" | "--port" => {
                i += 1;
                port = Some(args.get(i).context("missing --port value")?.parse().context("invalid --port value")?);
            }
            "-w" | "--width" => {
                i += 1;
                width = Some(args.get(i).context("missing --width value")?.parse().context("invalid --width value")?);
            }
            "-h" | "--height" => {
                i += 1;
                height = Some(args.get(i).context("missing --height value")?.parse().context("invalid --height value")?);
            }
            "-b" | "--bitrate" => {
                i += 1;
                bitrate_kbps =
                    Some(args.get(i).context("missing --bitrate value")?.parse().context("invalid --bitrate value")?);
            }
            "-f" | "--fps" => {
                i += 1;
                fps = Some(args.get(i).context("missing --fps value")?.parse().context("invalid --fps value")?);
            }
            "-v" | "--verbose" => verbose = true,
            "-d" | "--debug" => debug = true,
            other => anyhow::bail!("unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(Some(CliArgs {
        config_path,
        port,
        width,
        height,
        bitrate_kbps,
        fps,
        verbose,
        debug,
    }))
}

/// CLI flags always win over file configuration (spec.md §6.4).
pub fn apply_overrides(config: &mut mirror_wire::ServerConfig, args: &CliArgs) {
    if let Some(port) = args.port {
        config.network.port = port;
    }
    if let Some(width) = args.width {
        config.video.width = width;
    }
    if let Some(height) = args.height {
        config.video.height = height;
    }
    if let Some(bitrate) = args.bitrate_kbps {
        config.video.bitrate_kbps = bitrate;
    }
    if let Some(fps) = args.fps {
        config.video.fps = fps;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_short_flags() {
        let parsed = parse_args(args(&["-p", "9090", "-w", "1920", "-h", "1080", "-b", "6000", "-f", "60"]))
            .unwrap()
            .unwrap();
        assert_eq!(parsed.port, Some(9090));
        assert_eq!(parsed.width, Some(1920));
        assert_eq!(parsed.height, Some(1080));
        assert_eq!(parsed.bitrate_kbps, Some(6000));
        assert_eq!(parsed.fps, Some(60));
    }

    #[test]
    fn parses_long_flags_and_switches() {
        let parsed = parse_args(args(&["--port", "9090", "--verbose", "--debug"])).unwrap().unwrap();
        assert_eq!(parsed.port, Some(9090));
        assert!(parsed.verbose);
        assert!(parsed.debug);
    }

    #[test]
    fn help_short_circuits_to_none() {
        assert!(parse_args(args(&["--help"])).unwrap().is_none());
    }

    #[test]
    fn rejects_unknown_flag() {
        assert!(parse_args(args(&["--bogus"])).is_err());
    }

    #[test]
    fn rejects_missing_value() {
        assert!(parse_args(args(&["--port"])).is_err());
    }

    #[test]
    fn rejects_non_numeric_value() {
        assert!(parse_args(args(&["--port", "not-a-number"])).is_err());
    }

    #[test]
    fn overrides_apply_on_top_of_file_config() {
        let mut config = mirror_wire::ServerConfig::default();
        let parsed = parse_args(args(&["--port", "9999", "--fps", "24"])).unwrap().unwrap();
        apply_overrides(&mut config, &parsed);
        assert_eq!(config.network.port, 9999);
        assert_eq!(config.video.fps, 24);
        assert_eq!(config.video.width, 1280); // untouched
    }
}
