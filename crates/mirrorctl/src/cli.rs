//! Command-line flag parsing for the `mirrorctl` binary. Same hand-rolled,
//! no-crate approach as `mirrorctl-server::cli` — the flag surface here is
//! similarly small and fixed.

use anyhow::Context;

pub struct CliArgs {
    pub config_path: Option<String>,
    pub adb_path: Option<String>,
    pub device_id: Option<String>,
    pub address: Option<String>,
    pub discover: bool,
    pub verbose: bool,
    pub debug: bool,
}

pub fn usage() -> &'static str {
    "mirrorctl [OPTIONS]\n\n\
     OPTIONS:\n\
     \x20   -c, --config <PATH>     Load controller settings from PATH (TOML)\n\
     \x20       --adb <PATH>        Path to the adb executable [default: adb]\n\
     \x20       --device <ID>       Device id to connect to (adb serial)\n\
     \x20       --address <HOST:PORT>  Address of an already-running remote server\n\
     \x20       --discover          Broadcast a discovery request and print responses\n\
     \x20   -v, --verbose           Enable verbose (info) logging\n\
     \x20   -d, --debug             Enable debug logging\n\
     \x20       --help              Print this message and exit"
}

/// Parses `args` (normally `std::env::args().skip(1)`). Returns `Ok(None)`
/// when `--help` was given, so the caller can print usage and exit 0.
pub fn parse_args(args: Vec<String>) -> anyhow::Result<Option<CliArgs>> {
    let mut config_path = None;
    let mut adb_path = None;
    let mut device_id = None;
    let mut address = None;
    let mut discover = false;
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
            "--adb" => {
                i += 1;
                adb_path = Some(args.get(i).context("missing --adb value")?.clone());
            }
            "--device" => {
                i += 1;
                device_id = Some(args.get(i).context("missing --device value")?.clone());
            }
            "--address" => {
                i += 1;
                address = Some(args.get(i).context("missing --address value")?.clone());
            }
            "--discover" => discover = true,
            "-v" | "--verbose" => verbose = true,
            "-d" | "--debug" => debug = true,
            other => anyhow::bail!("unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(Some(CliArgs { config_path, adb_path, device_id, address, discover, verbose, debug }))
}

/// CLI flags always win over file configuration, matching
/// `mirrorctl_server::cli::apply_overrides`.
pub fn apply_overrides(config: &mut mirror_wire::ControllerConfig, args: &CliArgs) {
    if let Some(adb_path) = &args.adb_path {
        config.adb_path = adb_path.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_device_and_address() {
        let parsed = parse_args(args(&["--device", "emulator-5554", "--address", "127.0.0.1:8080"])).unwrap().unwrap();
        assert_eq!(parsed.device_id, Some("emulator-5554".to_string()));
        assert_eq!(parsed.address, Some("127.0.0.1:8080".to_string()));
    }

    #[test]
    fn parses_discover_and_switches() {
        let parsed = parse_args(args(&["--discover", "-v", "-d"])).unwrap().unwrap();
        assert!(parsed.discover);
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
        assert!(parse_args(args(&["--device"])).is_err());
    }

    #[test]
    fn overrides_apply_adb_path_on_top_of_file_config() {
        let mut config = mirror_wire::ControllerConfig::default();
        let parsed = parse_args(args(&["--adb", "/opt/platform-tools/adb"])).unwrap().unwrap();
        apply_overrides(&mut config, &parsed);
        assert_eq!(config.adb_path, "/opt/platform-tools/adb");
    }
}
