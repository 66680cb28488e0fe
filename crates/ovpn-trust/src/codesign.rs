//! Apple code-signature verification
//!
//! Shells out to `codesign`, which validates the signature, checks it has
//! not been revoked, and evaluates our designated requirement.

use crate::identity::{IdentityVerifier, TrustFailure};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Verifies artifacts against a developer team's signing certificate
#[derive(Debug, Clone)]
pub struct CodesignVerifier {
    /// `codesign` tool to run
    codesign_path: PathBuf,
    /// Requirement text, `=`-prefixed so codesign reads it inline
    requirement: String,
}

impl CodesignVerifier {
    /// Create a verifier for `team_id`
    pub fn new(team_id: &str, codesign_path: PathBuf) -> Self {
        Self {
            codesign_path,
            requirement: format!("={}", Self::requirement_for(team_id)),
        }
    }

    /// Designated requirement for artifacts signed by `team_id`
    pub fn requirement_for(team_id: &str) -> String {
        format!(
            "anchor apple generic and certificate leaf[subject.OU] = \"{}\"",
            team_id.replace('"', "")
        )
    }

    /// Arguments passed to `codesign` for `path`
    fn arguments<'a>(&'a self, path: &'a Path) -> [&'a std::ffi::OsStr; 5] {
        [
            "--verify".as_ref(),
            "--strict".as_ref(),
            "--test-requirement".as_ref(),
            self.requirement.as_ref(),
            path.as_os_str(),
        ]
    }
}

impl IdentityVerifier for CodesignVerifier {
    fn verify(&self, path: &Path) -> Result<(), TrustFailure> {
        debug!("codesign check of {}", path.display());

        let output = Command::new(&self.codesign_path)
            .args(self.arguments(path))
            .stdin(Stdio::null())
            .output()
            .map_err(TrustFailure::Tool)?;

        if output.status.success() {
            Ok(())
        } else {
            Err(TrustFailure::SignatureRejected {
                path: path.to_path_buf(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
