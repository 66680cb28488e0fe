//! Helper configuration
//!
//! Read once at startup from a TOML file installed next to the helper.
//! Every field has a default, so a missing file or an empty one yields the
//! stock eduVPN setup.
//!
//! ```toml
//! socket_path = "/var/run/org.eduvpn.app.openvpnhelper.socket"
//! allowed_uids = [501]
//! shutdown_grace_secs = 5
//! extra_dangerous_commands = ["setenv"]
//!
//! [trust]
//! kind = "code_signature"
//! team_id = "ZYJ4TZX4UU"
//! ```

use ovpn_protocol::SERVICE_NAME;
use ovpn_supervisor::{
    DEFAULT_LAUNCHCTL, DEFAULT_LEASEWATCH_DIR, DEFAULT_MANAGEMENT_SOCKET, DEFAULT_RUNTIME_DIR,
    DEFAULT_SHUTDOWN_GRACE, SupervisorSettings,
};
use ovpn_trust::{ConfigSanitizer, DangerousCommandSet, TrustedIdentity};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the helper looks for its configuration
pub const DEFAULT_CONFIG_PATH: &str =
    "/Library/PrivilegedHelperTools/org.eduvpn.app.openvpnhelper.toml";

/// Default log filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "ovpn_helper=info,ovpn_supervisor=info,ovpn_trust=info";

/// Helper configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HelperConfig {
    /// Control socket the app connects to
    pub socket_path: PathBuf,
    /// Uids allowed to connect; empty allows any local user
    pub allowed_uids: Vec<u32>,
    /// OpenVPN management socket
    pub management_socket: PathBuf,
    /// Seconds between SIGTERM and SIGKILL on close
    pub shutdown_grace_secs: u64,
    /// Directory lease-watch plists may be written to
    pub leasewatch_dir: PathBuf,
    /// `launchctl` binary
    pub launchctl_path: PathBuf,
    /// Root-only directory sessions are staged in
    pub runtime_dir: PathBuf,
    /// `tracing` filter directives
    pub log_filter: String,
    /// Directives forbidden on top of the built-in set
    pub extra_dangerous_commands: Vec<String>,
    /// Identity every executable and script must carry
    pub trust: TrustedIdentity,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(format!("/var/run/{}.socket", SERVICE_NAME)),
            allowed_uids: Vec::new(),
            management_socket: PathBuf::from(DEFAULT_MANAGEMENT_SOCKET),
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE.as_secs(),
            leasewatch_dir: PathBuf::from(DEFAULT_LEASEWATCH_DIR),
            launchctl_path: PathBuf::from(DEFAULT_LAUNCHCTL),
            runtime_dir: PathBuf::from(DEFAULT_RUNTIME_DIR),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            extra_dangerous_commands: Vec::new(),
            trust: TrustedIdentity::default(),
        }
    }
}

impl HelperConfig {
    /// Load `path`; `Ok(None)` if it does not exist
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        match Self::from_toml_file(path) {
            Ok(config) => Ok(Some(config)),
            Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject settings the helper cannot run safely with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shutdown_grace_secs == 0 {
            return Err(ConfigError::Invalid(
                "shutdown_grace_secs must be at least 1".to_string(),
            ));
        }

        let paths = [
            ("socket_path", &self.socket_path),
            ("management_socket", &self.management_socket),
            ("leasewatch_dir", &self.leasewatch_dir),
            ("launchctl_path", &self.launchctl_path),
            ("runtime_dir", &self.runtime_dir),
        ];
        for (name, path) in paths {
            if !path.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "{} must be absolute, got {}",
                    name,
                    path.display()
                )));
            }
        }

        match &self.trust {
            TrustedIdentity::CodeSignature {
                team_id,
                codesign_path,
            } => {
                if team_id.trim().is_empty() {
                    return Err(ConfigError::Invalid("trust.team_id is empty".to_string()));
                }
                if !codesign_path.is_absolute() {
                    return Err(ConfigError::Invalid(
                        "trust.codesign_path must be absolute".to_string(),
                    ));
                }
            }
            TrustedIdentity::Manifest { digests, .. } => {
                if digests.is_empty() {
                    return Err(ConfigError::Invalid(
                        "trust.digests lists no artifacts".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Grace period as a duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Sanitizer with the configured extra directives
    pub fn sanitizer(&self) -> ConfigSanitizer {
        ConfigSanitizer::new(DangerousCommandSet::with_extra(
            &self.extra_dangerous_commands,
        ))
    }

    /// Supervisor settings from this configuration
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            management_socket: self.management_socket.clone(),
            shutdown_grace: self.shutdown_grace(),
            leasewatch_dir: self.leasewatch_dir.clone(),
            launchctl_path: self.launchctl_path.clone(),
            runtime_dir: self.runtime_dir.clone(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[source] io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
