//! Start request

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything the app hands over to start an OpenVPN session.
///
/// All paths are caller-supplied and untrusted until the helper has
/// verified them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    /// OpenVPN binary
    pub launch_path: PathBuf,
    /// OpenVPN configuration file
    pub config_path: PathBuf,
    /// Script run by OpenVPN after the tunnel comes up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_script: Option<PathBuf>,
    /// Script run by OpenVPN when the tunnel goes down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down_script: Option<PathBuf>,
    /// Where the lease-watch launchd plist is installed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leasewatch_plist: Option<PathBuf>,
    /// Script the lease-watch daemon runs on network changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leasewatch_script: Option<PathBuf>,
    /// Options appended to the up/down script command lines
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub script_options: Vec<String>,
}

impl StartRequest {
    /// Create a request with only the required paths
    pub fn new(launch_path: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            launch_path: launch_path.into(),
            config_path: config_path.into(),
            up_script: None,
            down_script: None,
            leasewatch_plist: None,
            leasewatch_script: None,
            script_options: Vec::new(),
        }
    }

    pub fn with_up_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.up_script = Some(path.into());
        self
    }

    pub fn with_down_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.down_script = Some(path.into());
        self
    }

    pub fn with_leasewatch(
        mut self,
        plist: impl Into<PathBuf>,
        script: impl Into<PathBuf>,
    ) -> Self {
        self.leasewatch_plist = Some(plist.into());
        self.leasewatch_script = Some(script.into());
        self
    }

    pub fn with_script_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script_options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Does OpenVPN need to run any external script?
    pub fn has_scripts(&self) -> bool {
        self.up_script.is_some() || self.down_script.is_some()
    }

    /// Lease-watch pair, present only when both halves were supplied
    pub fn leasewatch(&self) -> Option<(&Path, &Path)> {
        match (&self.leasewatch_plist, &self.leasewatch_script) {
            (Some(plist), Some(script)) => Some((plist.as_path(), script.as_path())),
            _ => None,
        }
    }
}
