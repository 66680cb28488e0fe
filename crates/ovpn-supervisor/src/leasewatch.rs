//! Lease-watch daemon
//!
//! While a session runs, a launchd job re-runs the verified lease-watch
//! script whenever the system network configuration changes. The helper
//! writes the job's plist and loads it with `launchctl`, and unloads and
//! removes it when the session ends.

use crate::launch::CommandSpec;
use crate::launcher::ProcessLauncher;
use ovpn_protocol::HelperError;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// launchd job label
pub const LEASEWATCH_LABEL: &str = "org.eduvpn.app.leasewatch";

/// Directory whose changes trigger the script
pub const WATCH_PATH: &str = "/Library/Preferences/SystemConfiguration";

/// Default directory for lease-watch plists
pub const DEFAULT_LEASEWATCH_DIR: &str = "/Library/Application Support/eduVPN";

/// Default `launchctl` location
pub const DEFAULT_LAUNCHCTL: &str = "/bin/launchctl";

/// Installs and removes the lease-watch launchd job
#[derive(Debug, Clone)]
pub struct LeasewatchDaemon {
    dir: PathBuf,
    launchctl: PathBuf,
}

impl LeasewatchDaemon {
    pub fn new(dir: impl Into<PathBuf>, launchctl: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            launchctl: launchctl.into(),
        }
    }

    /// Plists may only be written directly inside the configured directory
    pub fn check_plist_path(&self, plist: &Path) -> Result<(), HelperError> {
        let allowed = plist.is_absolute()
            && plist.parent() == Some(self.dir.as_path())
            && plist.extension().is_some_and(|ext| ext == "plist");

        if allowed {
            Ok(())
        } else {
            warn!(
                "Refusing lease-watch plist {} outside {}",
                plist.display(),
                self.dir.display()
            );
            Err(HelperError::Unknown)
        }
    }

    /// Write the plist for `script` and load it
    pub async fn install(
        &self,
        plist: &Path,
        script: &Path,
        launcher: &dyn ProcessLauncher,
    ) -> io::Result<()> {
        // Replace rather than write through whatever is there
        match tokio::fs::remove_file(plist).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(plist)
            .await?;
        file.write_all(render_plist(script).as_bytes()).await?;
        file.flush().await?;

        if let Err(e) = self.launchctl("load", plist, launcher).await {
            // Sessions only track plists that loaded
            if let Err(cleanup) = tokio::fs::remove_file(plist).await {
                warn!("Could not remove {}: {}", plist.display(), cleanup);
            }
            return Err(e);
        }
        info!("Lease-watch loaded from {}", plist.display());
        Ok(())
    }

    /// Unload the job and delete its plist
    pub async fn remove(&self, plist: &Path, launcher: &dyn ProcessLauncher) -> io::Result<()> {
        let unloaded = self.launchctl("unload", plist, launcher).await;
        tokio::fs::remove_file(plist).await?;
        unloaded?;

        info!("Lease-watch removed");
        Ok(())
    }

    async fn launchctl(
        &self,
        verb: &str,
        plist: &Path,
        launcher: &dyn ProcessLauncher,
    ) -> io::Result<()> {
        let spec = CommandSpec::new(&self.launchctl).arg(verb).arg(plist);
        let status = launcher.spawn(&spec)?.wait().await?;

        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("launchctl {} exited with {}", verb, status)))
        }
    }
}

impl Default for LeasewatchDaemon {
    fn default() -> Self {
        Self::new(DEFAULT_LEASEWATCH_DIR, DEFAULT_LAUNCHCTL)
    }
}

/// launchd job definition running `script` on network changes
pub fn render_plist(script: &Path) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>Label</key>
	<string>{}</string>
	<key>ProgramArguments</key>
	<array>
		<string>{}</string>
	</array>
	<key>WatchPaths</key>
	<array>
		<string>{}</string>
	</array>
</dict>
</plist>
"#,
        LEASEWATCH_LABEL,
        xml_escape(&script.to_string_lossy()),
        WATCH_PATH
    )
}

fn xml_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::SystemLauncher;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn daemon(dir: &Path) -> LeasewatchDaemon {
        // `true` accepts and ignores the launchctl arguments
        LeasewatchDaemon::new(dir, "true")
    }

    #[test]
    fn test_plist_path_restricted() {
        let daemon = daemon(Path::new("/Library/Application Support/eduVPN"));

        assert!(
            daemon
                .check_plist_path(Path::new("/Library/Application Support/eduVPN/LeaseWatch.plist"))
                .is_ok()
        );
        for bad in [
            "/Library/LaunchDaemons/evil.plist",
            "/Library/Application Support/eduVPN/LeaseWatch.sh",
            "/Library/Application Support/eduVPN/sub/LeaseWatch.plist",
            "LeaseWatch.plist",
        ] {
            assert_eq!(
                daemon.check_plist_path(Path::new(bad)),
                Err(HelperError::Unknown),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn test_render_plist() {
        let plist = render_plist(Path::new("/Applications/A&B.app/leasewatch.sh"));

        assert!(plist.contains("<string>org.eduvpn.app.leasewatch</string>"));
        assert!(plist.contains("<string>/Applications/A&amp;B.app/leasewatch.sh</string>"));
        assert!(plist.contains("<string>/Library/Preferences/SystemConfiguration</string>"));
    }

    #[tokio::test]
    async fn test_install_and_remove() {
        let dir = TempDir::new().unwrap();
        let plist = dir.path().join("LeaseWatch.plist");
        std::fs::write(&plist, "stale").unwrap();
        let daemon = daemon(dir.path());

        daemon
            .install(&plist, Path::new("/opt/leasewatch.sh"), &SystemLauncher)
            .await
            .unwrap();

        let written = std::fs::read_to_string(&plist).unwrap();
        assert!(written.contains("/opt/leasewatch.sh"));
        let mode = std::fs::metadata(&plist).unwrap().permissions().mode();
        assert_eq!(mode & 0o022, 0);

        daemon.remove(&plist, &SystemLauncher).await.unwrap();
        assert!(!plist.exists());
    }

    #[tokio::test]
    async fn test_launchctl_failure_reported() {
        let dir = TempDir::new().unwrap();
        let plist = dir.path().join("LeaseWatch.plist");
        let daemon = LeasewatchDaemon::new(dir.path(), "false");

        let result = daemon
            .install(&plist, Path::new("/opt/leasewatch.sh"), &SystemLauncher)
            .await;
        assert!(result.is_err());
        assert!(!plist.exists());
    }
}
