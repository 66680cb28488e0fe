//! Process spawning
//!
//! Everything the supervisor runs goes through [`ProcessLauncher`], so tests
//! can substitute harmless processes for OpenVPN and `launchctl`.

use crate::launch::CommandSpec;
use std::io;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// `PATH` given to spawned processes
const SAFE_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";

/// Spawns processes for the supervisor
pub trait ProcessLauncher: Send + Sync {
    /// Spawn `spec`; the child is killed if the handle is dropped
    fn spawn(&self, spec: &CommandSpec) -> io::Result<Child>;
}

/// Spawns real processes with a scrubbed environment
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn spawn(&self, spec: &CommandSpec) -> io::Result<Child> {
        debug!("Spawning {} with {} args", spec.program.display(), spec.args.len());

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .env_clear()
            .env("PATH", SAFE_PATH)
            .current_dir("/")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if spec.own_process_group {
            command.process_group(0);
        }

        command.spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_and_wait() {
        let spec = CommandSpec::new("/bin/sh").arg("-c").arg("exit 3");
        let mut child = SystemLauncher.spawn(&spec).unwrap();

        let status = child.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_environment_scrubbed() {
        let spec = CommandSpec::new("/bin/sh")
            .arg("-c")
            .arg("test -z \"$HOME\" && test \"$PATH\" = /usr/bin:/bin:/usr/sbin:/sbin");
        let mut child = SystemLauncher.spawn(&spec).unwrap();

        assert!(child.wait().await.unwrap().success());
    }

    #[test]
    fn test_missing_program() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();

        let spec = CommandSpec::new("/nonexistent/openvpn-xyz");
        assert!(SystemLauncher.spawn(&spec).is_err());
    }
}
