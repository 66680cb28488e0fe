//! Trusted identity and artifact verification
//!
//! The helper runs with elevated privileges and is driven by a process the
//! user does not re-authenticate for every connection. Any path it executes
//! must therefore be proven to come from us; otherwise any local caller
//! could escalate to running arbitrary code as root.

use crate::codesign::CodesignVerifier;
use crate::manifest::ManifestVerifier;
use ovpn_protocol::HelperError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Team identifier the eduVPN app is signed with
const DEFAULT_TEAM_ID: &str = "ZYJ4TZX4UU";

fn default_codesign_path() -> PathBuf {
    PathBuf::from("/usr/bin/codesign")
}

/// Reference identity every artifact is checked against.
///
/// Established once at startup from the helper configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrustedIdentity {
    /// Apple code signature anchored at our developer team
    CodeSignature {
        team_id: String,
        #[serde(default = "default_codesign_path")]
        codesign_path: PathBuf,
    },
    /// Ownership plus a list of known SHA-256 digests (platforms without
    /// code signing)
    Manifest {
        #[serde(default)]
        owner_uid: u32,
        digests: BTreeSet<String>,
    },
}

impl TrustedIdentity {
    /// Code-signing identity for a team
    pub fn code_signature(team_id: impl Into<String>) -> Self {
        TrustedIdentity::CodeSignature {
            team_id: team_id.into(),
            codesign_path: default_codesign_path(),
        }
    }

    /// Manifest identity
    pub fn manifest<I, S>(owner_uid: u32, digests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TrustedIdentity::Manifest {
            owner_uid,
            digests: digests
                .into_iter()
                .map(|d| d.into().to_ascii_lowercase())
                .collect(),
        }
    }
}

impl Default for TrustedIdentity {
    fn default() -> Self {
        Self::code_signature(DEFAULT_TEAM_ID)
    }
}

/// What an artifact is used for; decides the error reported on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactRole {
    /// The OpenVPN binary itself
    Binary,
    UpScript,
    DownScript,
    LeasewatchScript,
}

impl ArtifactRole {
    /// Error reported when an artifact in this role fails verification
    pub fn signature_error(&self) -> HelperError {
        match self {
            ArtifactRole::Binary => HelperError::BinarySignatureNotSignedByUs,
            ArtifactRole::UpScript => HelperError::UpScriptSignatureNotSignedByUs,
            ArtifactRole::DownScript => HelperError::DownScriptSignatureNotSignedByUs,
            ArtifactRole::LeasewatchScript => HelperError::LeasewatchScriptSignatureNotSignedByUs,
        }
    }
}

impl fmt::Display for ArtifactRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArtifactRole::Binary => "openvpn binary",
            ArtifactRole::UpScript => "up script",
            ArtifactRole::DownScript => "down script",
            ArtifactRole::LeasewatchScript => "leasewatch script",
        };
        f.write_str(name)
    }
}

/// Why an artifact was not trusted.
///
/// Only ever logged; the app receives the role-specific [`HelperError`].
#[derive(Debug, thiserror::Error)]
pub enum TrustFailure {
    #[error("Path is not absolute: {0}")]
    NotAbsolute(PathBuf),

    #[error("Cannot inspect {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Not a regular file: {0}")]
    NotRegularFile(PathBuf),

    #[error("{path} is owned by uid {uid}, expected {expected}")]
    WrongOwner { path: PathBuf, uid: u32, expected: u32 },

    #[error("{path} is writable by group or others (mode {mode:o})")]
    Writable { path: PathBuf, mode: u32 },

    #[error("{path} has unknown digest {digest}")]
    UnknownDigest { path: PathBuf, digest: String },

    #[error("Signature of {path} rejected: {detail}")]
    SignatureRejected { path: PathBuf, detail: String },

    #[error("Could not run signature check: {0}")]
    Tool(#[source] std::io::Error),
}

/// Capability to decide whether a file comes from the trusted identity.
pub trait IdentityVerifier: Send + Sync {
    /// Succeeds only if the file at `path` is ours and unmodified
    fn verify(&self, path: &Path) -> Result<(), TrustFailure>;
}

/// Build the production verifier for an identity
pub fn verifier_for(identity: &TrustedIdentity) -> Arc<dyn IdentityVerifier> {
    match identity {
        TrustedIdentity::CodeSignature {
            team_id,
            codesign_path,
        } => Arc::new(CodesignVerifier::new(team_id, codesign_path.clone())),
        TrustedIdentity::Manifest { owner_uid, digests } => {
            Arc::new(ManifestVerifier::new(*owner_uid, digests.iter().cloned()))
        }
    }
}

/// Verify one artifact and map a failure to its role's error
pub fn verify_artifact(
    verifier: &dyn IdentityVerifier,
    path: &Path,
    role: ArtifactRole,
) -> Result<(), HelperError> {
    if !path.is_absolute() {
        warn!("Refusing {}: {}", role, TrustFailure::NotAbsolute(path.to_path_buf()));
        return Err(role.signature_error());
    }

    match verifier.verify(path) {
        Ok(()) => {
            debug!("Verified {} at {}", role, path.display());
            Ok(())
        }
        Err(failure) => {
            warn!("Untrusted {}: {}", role, failure);
            Err(role.signature_error())
        }
    }
}
