//! Session staging
//!
//! Everything OpenVPN will execute or read is copied into a directory only
//! the helper can write, and verified there. Whatever the app does to its
//! own files afterwards, the session runs exactly what was checked.
//!
//! ```text
//!   <runtime_dir>/                    0700, owned by the helper
//!     session-<id>/                   0700
//!       openvpn/openvpn               copy of the binary
//!       up/client.up.eduvpn.sh        copies keep their file names
//!       config.ovpn                   0600, the bytes the sanitizer passed
//! ```

use nix::fcntl::OFlag;
use nix::unistd::geteuid;
use std::fs::{DirBuilder, File, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default directory for session copies
pub const DEFAULT_RUNTIME_DIR: &str = "/var/run/org.eduvpn.app.openvpnhelper";

/// Largest artifact that will be copied
pub const MAX_ARTIFACT_LEN: u64 = 64 * 1024 * 1024;

/// Name of the staged configuration
pub const STAGED_CONFIG: &str = "config.ovpn";

const PRIVATE_DIR_MODE: u32 = 0o700;
const ARTIFACT_MODE: u32 = 0o700;
const CONFIG_MODE: u32 = 0o600;

/// The helper's runtime directory
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fresh, empty directory for session `id`
    pub fn create(&self, id: u64) -> io::Result<SessionStage> {
        self.ensure_root()?;

        let dir = self.root.join(format!("session-{}", id));
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => debug!("Removed leftover {}", dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        DirBuilder::new().mode(PRIVATE_DIR_MODE).create(&dir)?;

        Ok(SessionStage { dir })
    }

    /// Create the root if needed and make sure nobody else can write it
    fn ensure_root(&self) -> io::Result<()> {
        match DirBuilder::new()
            .recursive(true)
            .mode(PRIVATE_DIR_MODE)
            .create(&self.root)
        {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }

        let metadata = std::fs::symlink_metadata(&self.root)?;
        if !metadata.file_type().is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", self.root.display()),
            ));
        }
        let euid = geteuid().as_raw();
        if metadata.uid() != euid {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!(
                    "{} is owned by uid {}, not {}",
                    self.root.display(),
                    metadata.uid(),
                    euid
                ),
            ));
        }
        if metadata.mode() & 0o077 != 0 {
            std::fs::set_permissions(&self.root, Permissions::from_mode(PRIVATE_DIR_MODE))?;
        }
        Ok(())
    }
}

/// One session's private directory
#[derive(Debug)]
pub struct SessionStage {
    dir: PathBuf,
}

impl SessionStage {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Copy the file at `source` into subdirectory `slot`
    ///
    /// The source is opened once, refusing a final symlink and anything but
    /// a regular file, and the copy is read through that descriptor.
    pub fn copy_artifact(&self, source: &Path, slot: &str) -> io::Result<PathBuf> {
        let file = open_regular(source)?;
        let len = file.metadata()?.len();
        if len > MAX_ARTIFACT_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is {} bytes", source.display(), len),
            ));
        }

        let name = source.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "path has no file name")
        })?;
        let slot_dir = self.dir.join(slot);
        DirBuilder::new().mode(PRIVATE_DIR_MODE).create(&slot_dir)?;
        let target = slot_dir.join(name);

        // Extended attributes come along, so do detached script signatures
        std::fs::copy(descriptor_path(&file), &target)?;
        std::fs::set_permissions(&target, Permissions::from_mode(ARTIFACT_MODE))?;

        Ok(target)
    }

    /// Write the checked configuration
    pub fn write_config(&self, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.dir.join(STAGED_CONFIG);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(CONFIG_MODE)
            .open(&path)?;
        file.write_all(bytes)?;
        file.flush()?;

        Ok(path)
    }

    /// Delete the directory and everything in it
    pub fn remove(&self) -> io::Result<()> {
        std::fs::remove_dir_all(&self.dir)
    }
}

fn open_regular(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags((OFlag::O_NOFOLLOW | OFlag::O_NONBLOCK).bits())
        .open(path)?;

    if file.metadata()?.file_type().is_file() {
        Ok(file)
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a regular file", path.display()),
        ))
    }
}

/// Path that reopens an already open file, not whatever its name points to now
fn descriptor_path(file: &File) -> PathBuf {
    PathBuf::from(format!("/dev/fd/{}", file.as_raw_fd()))
}
