//! OpenVPN Helper Trust Checks
//!
//! Everything the privileged helper verifies before it runs anything:
//!
//! - **Code identity**: the OpenVPN binary and every script must be signed
//!   (or, with a manifest identity, owned and hashed) by us.
//! - **Configuration**: the OpenVPN config must not contain directives that
//!   execute commands, since OpenVPN will run them with our privileges.
//!
//! Both checks are synchronous and touch the filesystem; async callers run
//! them on the blocking pool.

mod codesign;
mod identity;
mod manifest;
mod sanitizer;

pub use codesign::CodesignVerifier;
pub use identity::{
    ArtifactRole, IdentityVerifier, TrustFailure, TrustedIdentity, verifier_for, verify_artifact,
};
pub use manifest::{ManifestVerifier, sha256_hex};
pub use sanitizer::{ConfigSanitizer, DEFAULT_DANGEROUS_COMMANDS, DangerousCommandSet};
