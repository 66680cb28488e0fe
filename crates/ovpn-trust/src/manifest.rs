//! Manifest verification
//!
//! For platforms without code signing: an artifact is trusted when it is a
//! regular file owned by the expected user, cannot be modified by anyone
//! else, and its SHA-256 digest is one we shipped.

use crate::identity::{IdentityVerifier, TrustFailure};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Group- and world-write bits
const FOREIGN_WRITE_BITS: u32 = 0o022;

/// Verifies artifacts against ownership and a digest allowlist
#[derive(Debug, Clone)]
pub struct ManifestVerifier {
    owner_uid: u32,
    digests: BTreeSet<String>,
}

impl ManifestVerifier {
    /// Create a verifier; digests are hex, any case
    pub fn new<I, S>(owner_uid: u32, digests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            owner_uid,
            digests: digests
                .into_iter()
                .map(|d| d.into().to_ascii_lowercase())
                .collect(),
        }
    }

    /// No digest known, nothing can be trusted
    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

impl IdentityVerifier for ManifestVerifier {
    fn verify(&self, path: &Path) -> Result<(), TrustFailure> {
        let unreadable = |source| TrustFailure::Unreadable {
            path: path.to_path_buf(),
            source,
        };

        // Symlinks are refused rather than followed
        let metadata = std::fs::symlink_metadata(path).map_err(unreadable)?;
        if !metadata.file_type().is_file() {
            return Err(TrustFailure::NotRegularFile(path.to_path_buf()));
        }
        if metadata.uid() != self.owner_uid {
            return Err(TrustFailure::WrongOwner {
                path: path.to_path_buf(),
                uid: metadata.uid(),
                expected: self.owner_uid,
            });
        }
        if metadata.mode() & FOREIGN_WRITE_BITS != 0 {
            return Err(TrustFailure::Writable {
                path: path.to_path_buf(),
                mode: metadata.mode() & 0o7777,
            });
        }

        let digest = sha256_hex(path).map_err(unreadable)?;
        if self.digests.contains(&digest) {
            Ok(())
        } else {
            Err(TrustFailure::UnknownDigest {
                path: path.to_path_buf(),
                digest,
            })
        }
    }
}

/// Lowercase hex SHA-256 of a file's contents
pub fn sha256_hex(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;

    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn artifact(dir: &TempDir, name: &str, contents: &[u8], mode: u32) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    fn owner_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().uid()
    }

    #[test]
    fn test_known_sha256() {
        let dir = TempDir::new().unwrap();
        let path = artifact(&dir, "empty", b"", 0o755);

        assert_eq!(
            sha256_hex(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_trusted_artifact() {
        let dir = TempDir::new().unwrap();
        let path = artifact(&dir, "openvpn", b"#!/bin/sh\nexit 0\n", 0o755);
        let digest = sha256_hex(&path).unwrap();

        let verifier = ManifestVerifier::new(owner_of(&path), [digest.to_uppercase()]);
        assert!(verifier.verify(&path).is_ok());
    }

    #[test]
    fn test_modified_artifact_rejected() {
        let dir = TempDir::new().unwrap();
        let path = artifact(&dir, "openvpn", b"original", 0o755);
        let verifier = ManifestVerifier::new(owner_of(&path), [sha256_hex(&path).unwrap()]);

        fs::write(&path, b"tampered").unwrap();
        assert!(matches!(
            verifier.verify(&path),
            Err(TrustFailure::UnknownDigest { .. })
        ));
    }

    #[test]
    fn test_wrong_owner_rejected() {
        let dir = TempDir::new().unwrap();
        let path = artifact(&dir, "up.sh", b"echo up", 0o755);
        let digest = sha256_hex(&path).unwrap();

        let verifier = ManifestVerifier::new(owner_of(&path).wrapping_add(1), [digest]);
        assert!(matches!(
            verifier.verify(&path),
            Err(TrustFailure::WrongOwner { .. })
        ));
    }

    #[test]
    fn test_world_writable_rejected() {
        let dir = TempDir::new().unwrap();
        let path = artifact(&dir, "down.sh", b"echo down", 0o777);
        let digest = sha256_hex(&path).unwrap();

        let verifier = ManifestVerifier::new(owner_of(&path), [digest]);
        assert!(matches!(
            verifier.verify(&path),
            Err(TrustFailure::Writable { .. })
        ));
    }

    #[test]
    fn test_symlink_rejected() {
        let dir = TempDir::new().unwrap();
        let target = artifact(&dir, "openvpn", b"binary", 0o755);
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let verifier = ManifestVerifier::new(owner_of(&target), [sha256_hex(&target).unwrap()]);
        assert!(matches!(
            verifier.verify(&link),
            Err(TrustFailure::NotRegularFile(_))
        ));
    }

    #[test]
    fn test_missing_file_rejected() {
        let verifier = ManifestVerifier::new(0, Vec::<String>::new());
        assert!(verifier.is_empty());
        assert!(matches!(
            verifier.verify(Path::new("/nonexistent/openvpn-xyz")),
            Err(TrustFailure::Unreadable { .. })
        ));
    }
}
