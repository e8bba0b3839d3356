//! Remote server bring-up (spec.md §4.8): query the device's architecture,
//! push the matching server binary + shared library, make it executable,
//! start it detached with its logs redirected, then poll for readiness.
//!
//! Grounded in `examples/other_examples/.../scrcpy.rs` (`push_scrcpy_server`,
//! `start_server`): `adb -s <id> push`, `adb -s <id> shell <command>`,
//! spawn detached with piped/redirected output, then a short retry-connect
//! loop before declaring the remote process ready. The concrete shell
//! mechanism is pluggable behind [`DeviceDeployer`] since it is an external
//! collaborator (spec.md §1, "device-side OS shell invocation"); the
//! default [`AdbDeployer`] is one concrete implementation of it.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::error::DeployError;

pub trait DeviceDeployer: Send + Sync {
    fn architecture(&self, device_id: &str) -> Result<String, DeployError>;
    fn push(&self, device_id: &str, local_path: &Path, remote_path: &str) -> Result<(), DeployError>;
    fn chmod_executable(&self, device_id: &str, remote_path: &str) -> Result<(), DeployError>;
    fn start_detached(&self, device_id: &str, remote_path: &str, args: &[String], log_path: &str) -> Result<(), DeployError>;
    fn is_running(&self, device_id: &str, process_name: &str) -> Result<bool, DeployError>;
    fn tail_log(&self, device_id: &str, log_path: &str, lines: usize) -> Result<String, DeployError>;
    fn kill_by_name(&self, device_id: &str, process_name: &str) -> Result<(), DeployError>;
}

/// `std::process::Command`-backed `adb` implementation, grounded directly
/// in the scrcpy.rs reference file's invocation shape.
pub struct AdbDeployer {
    adb_path: String,
}

impl AdbDeployer {
    pub fn new(adb_path: String) -> Self {
        Self { adb_path }
    }

    fn run(&self, args: &[&str]) -> Result<std::process::Output, DeployError> {
        Command::new(&self.adb_path)
            .args(args)
            .output()
            .map_err(|e| DeployError::StartFailed(format!("failed to run adb: {e}")))
    }
}

impl DeviceDeployer for AdbDeployer {
    fn architecture(&self, device_id: &str) -> Result<String, DeployError> {
        let output = self
            .run(&["-s", device_id, "shell", "getprop", "ro.product.cpu.abi"])
            .map_err(|e| DeployError::ArchitectureQueryFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(DeployError::ArchitectureQueryFailed(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn push(&self, device_id: &str, local_path: &Path, remote_path: &str) -> Result<(), DeployError> {
        let local = local_path.to_str().ok_or_else(|| DeployError::PushFailed("non-UTF8 local path".to_string()))?;
        let output = self.run(&["-s", device_id, "push", local, remote_path]).map_err(|e| DeployError::PushFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(DeployError::PushFailed(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(())
    }

    fn chmod_executable(&self, device_id: &str, remote_path: &str) -> Result<(), DeployError> {
        let output = self
            .run(&["-s", device_id, "shell", "chmod", "755", remote_path])
            .map_err(|e| DeployError::ChmodFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(DeployError::ChmodFailed(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(())
    }

    fn start_detached(&self, device_id: &str, remote_path: &str, args: &[String], log_path: &str) -> Result<(), DeployError> {
        let joined_args = args.join(" ");
        let command = format!("nohup {remote_path} {joined_args} > {log_path} 2>&1 &");
        let mut child = Command::new(&self.adb_path)
            .args(["-s", device_id, "shell", &command])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| DeployError::StartFailed(e.to_string()))?;
        // The shell backgrounds the remote process with `&` and returns
        // immediately; we still wait on the local adb-shell invocation so
        // its own process doesn't linger as a zombie.
        let _ = child.wait();
        Ok(())
    }

    fn is_running(&self, device_id: &str, process_name: &str) -> Result<bool, DeployError> {
        let output = self
            .run(&["-s", device_id, "shell", "pidof", process_name])
            .map_err(|e| DeployError::StartFailed(e.to_string()))?;
        Ok(output.status.success() && !output.stdout.is_empty())
    }

    fn tail_log(&self, device_id: &str, log_path: &str, lines: usize) -> Result<String, DeployError> {
        let output = self
            .run(&["-s", device_id, "shell", "tail", &format!("-n{lines}"), log_path])
            .map_err(|e| DeployError::StartFailed(e.to_string()))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn kill_by_name(&self, device_id: &str, process_name: &str) -> Result<(), DeployError> {
        let output = self
            .run(&["-s", device_id, "shell", "pkill", "-f", process_name])
            .map_err(|e| DeployError::StopFailed(e.to_string()))?;
        // pkill exits non-zero when no matching process was found; that's
        // not a failure worth propagating here.
        let _ = output;
        Ok(())
    }
}

/// Picks the server binary + companion library for `architecture` out of
/// `artifact_dir`, named `mirrorctl-server-<arch>` and `libmirrorctl-<arch>.so`.
pub fn artifact_paths(artifact_dir: &Path, architecture: &str) -> (std::path::PathBuf, std::path::PathBuf) {
    (
        artifact_dir.join(format!("mirrorctl-server-{architecture}")),
        artifact_dir.join(format!("libmirrorctl-{architecture}.so")),
    )
}

const REMOTE_BIN_PATH: &str = "/data/local/tmp/mirrorctl-server";
const REMOTE_LIB_PATH: &str = "/data/local/tmp/libmirrorctl.so";
const REMOTE_LOG_PATH: &str = "/data/local/tmp/mirrorctl-server.log";
const PROCESS_NAME: &str = "mirrorctl-server";
const READINESS_WAIT: Duration = Duration::from_millis(3_000);

/// Full bring-up sequence per spec.md §4.8: query arch, push binary +
/// library, chmod, start detached, then probe readiness once after a fixed
/// wait. On failure, fetches the remote log tail for diagnostics.
pub fn deploy_and_start(
    deployer: &dyn DeviceDeployer,
    device_id: &str,
    artifact_dir: &Path,
    port: u16,
) -> Result<(), DeployError> {
    let architecture = deployer.architecture(device_id)?;
    let (binary, library) = artifact_paths(artifact_dir, &architecture);

    deployer.push(device_id, &binary, REMOTE_BIN_PATH)?;
    deployer.push(device_id, &library, REMOTE_LIB_PATH)?;
    deployer.chmod_executable(device_id, REMOTE_BIN_PATH)?;

    let args = vec!["--port".to_string(), port.to_string()];
    deployer.start_detached(device_id, REMOTE_BIN_PATH, &args, REMOTE_LOG_PATH)?;

    std::thread::sleep(READINESS_WAIT);
    if deployer.is_running(device_id, PROCESS_NAME)? {
        return Ok(());
    }

    let tail = deployer.tail_log(device_id, REMOTE_LOG_PATH, 50).unwrap_or_else(|_| "(log unavailable)".to_string());
    tracing::error!(device_id, log_tail = %tail, "remote server did not become ready");
    Err(DeployError::NotReady)
}

pub fn stop(deployer: &dyn DeviceDeployer, device_id: &str) -> Result<(), DeployError> {
    deployer.kill_by_name(device_id, PROCESS_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeDeployer {
        running: Mutex<bool>,
        started: Mutex<bool>,
    }

    impl DeviceDeployer for FakeDeployer {
        fn architecture(&self, _device_id: &str) -> Result<String, DeployError> {
            Ok("arm64-v8a".to_string())
        }
        fn push(&self, _device_id: &str, _local_path: &Path, _remote_path: &str) -> Result<(), DeployError> {
            Ok(())
        }
        fn chmod_executable(&self, _device_id: &str, _remote_path: &str) -> Result<(), DeployError> {
            Ok(())
        }
        fn start_detached(&self, _device_id: &str, _remote_path: &str, _args: &[String], _log_path: &str) -> Result<(), DeployError> {
            *self.started.lock().unwrap() = true;
            *self.running.lock().unwrap() = true;
            Ok(())
        }
        fn is_running(&self, _device_id: &str, _process_name: &str) -> Result<bool, DeployError> {
            Ok(*self.running.lock().unwrap())
        }
        fn tail_log(&self, _device_id: &str, _log_path: &str, _lines: usize) -> Result<String, DeployError> {
            Ok(String::new())
        }
        fn kill_by_name(&self, _device_id: &str, _process_name: &str) -> Result<(), DeployError> {
            *self.running.lock().unwrap() = false;
            Ok(())
        }
    }

    #[test]
    fn successful_bring_up_reports_ready() {
        let deployer = FakeDeployer::default();
        let result = deploy_and_start(&deployer, "dev1", Path::new("/artifacts"), 8080);
        assert!(result.is_ok());
        assert!(*deployer.started.lock().unwrap());
    }

    #[test]
    fn failed_readiness_probe_surfaces_not_ready() {
        struct NeverRuns;
        impl DeviceDeployer for NeverRuns {
            fn architecture(&self, _: &str) -> Result<String, DeployError> {
                Ok("arm64-v8a".to_string())
            }
            fn push(&self, _: &str, _: &Path, _: &str) -> Result<(), DeployError> {
                Ok(())
            }
            fn chmod_executable(&self, _: &str, _: &str) -> Result<(), DeployError> {
                Ok(())
            }
            fn start_detached(&self, _: &str, _: &str, _: &[String], _: &str) -> Result<(), DeployError> {
                Ok(())
            }
            fn is_running(&self, _: &str, _: &str) -> Result<bool, DeployError> {
                Ok(false)
            }
            fn tail_log(&self, _: &str, _: &str, _: usize) -> Result<String, DeployError> {
                Ok("boot failure".to_string())
            }
            fn kill_by_name(&self, _: &str, _: &str) -> Result<(), DeployError> {
                Ok(())
            }
        }
        let result = deploy_and_start(&NeverRuns, "dev1", Path::new("/artifacts"), 8080);
        assert!(matches!(result, Err(DeployError::NotReady)));
    }

    #[test]
    fn artifact_paths_are_named_per_architecture() {
        let (bin, lib) = artifact_paths(Path::new("/artifacts"), "arm64-v8a");
        assert_eq!(bin, Path::new("/artifacts/mirrorctl-server-arm64-v8a"));
        assert_eq!(lib, Path::new("/artifacts/libmirrorctl-arm64-v8a.so"));
    }
}
