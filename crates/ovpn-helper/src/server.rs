//! Privileged control endpoint
//!
//! Listens on a Unix socket the unprivileged app can reach, hands each
//! connection to [`handle_connection`], and on shutdown closes any running
//! session before removing the socket.
//!
//! The socket is world-connectable, so every peer is identified by the
//! kernel-reported uid. With `allowed_uids` configured, anyone else is
//! dropped before a single frame is read.

use crate::handler::handle_connection;
use ovpn_protocol::HelperError;
use ovpn_supervisor::Supervisor;
use std::fs::Permissions;
use std::future::Future;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

/// Socket mode; the app runs as the logged-in user
const SOCKET_MODE: u32 = 0o666;

/// Bound control socket
pub struct ControlEndpoint {
    listener: UnixListener,
    path: PathBuf,
    supervisor: Supervisor,
    allowed_uids: Vec<u32>,
}

impl ControlEndpoint {
    /// Bind `path`, replacing a stale socket left by a previous run
    pub fn bind(path: &Path, supervisor: Supervisor) -> io::Result<Self> {
        match std::fs::symlink_metadata(path) {
            Ok(metadata) if metadata.file_type().is_socket() => {
                debug!("Removing stale socket {}", path.display());
                std::fs::remove_file(path)?;
            }
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a socket", path.display()),
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, Permissions::from_mode(SOCKET_MODE))?;
        info!("Control endpoint listening on {}", path.display());

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            supervisor,
            allowed_uids: Vec::new(),
        })
    }

    /// Only admit peers running as one of `uids`; empty admits any local user
    pub fn with_allowed_uids(mut self, uids: Vec<u32>) -> Self {
        self.allowed_uids = uids;
        self
    }

    /// Uid of an acceptable peer
    fn admit(&self, stream: &UnixStream, conn_id: u64) -> Option<u32> {
        let uid = match stream.peer_cred() {
            Ok(cred) => cred.uid(),
            Err(e) => {
                warn!("Connection {}: no peer credentials: {}", conn_id, e);
                return None;
            }
        };

        if self.allowed_uids.is_empty() || self.allowed_uids.contains(&uid) {
            Some(uid)
        } else {
            warn!("Connection {}: refusing uid {}", conn_id, uid);
            None
        }
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve(self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut next_conn: u64 = 0;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        next_conn += 1;
                        if let Some(uid) = self.admit(&stream, next_conn) {
                            let supervisor = self.supervisor.clone();
                            tokio::spawn(handle_connection(stream, supervisor, next_conn, uid));
                        }
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
            }
        }

        info!("Shutting down control endpoint");
        match self.supervisor.stop().await {
            Ok(ended) => info!("Closed session {} on shutdown", ended.session_id),
            Err(HelperError::NotRunning) => {}
            Err(e) => warn!("Could not close session on shutdown: {}", e),
        }

        drop(self.listener);
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Could not remove {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovpn_protocol::{ClientFrame, FrameReader, HelperFrame, StartRequest, write_frame};
    use ovpn_supervisor::{SupervisorSettings, SystemLauncher};
    use nix::unistd::geteuid;
    use ovpn_trust::{ConfigSanitizer, IdentityVerifier, TrustFailure};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::BufReader;
    use tokio::sync::oneshot;

    struct TrustNothing;

    impl IdentityVerifier for TrustNothing {
        fn verify(&self, path: &Path) -> Result<(), TrustFailure> {
            Err(TrustFailure::NotRegularFile(path.to_path_buf()))
        }
    }

    fn supervisor(dir: &TempDir) -> Supervisor {
        let settings = SupervisorSettings {
            runtime_dir: dir.path().join("run"),
            ..SupervisorSettings::default()
        };
        Supervisor::new(
            Arc::new(TrustNothing),
            ConfigSanitizer::default(),
            Arc::new(SystemLauncher),
            settings,
        )
    }

    fn serve(endpoint: ControlEndpoint) -> (oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(endpoint.serve(async {
            let _ = stop_rx.await;
        }));
        (stop_tx, server)
    }

    #[tokio::test]
    async fn test_serve_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("helper.sock");
        let endpoint = ControlEndpoint::bind(&path, supervisor(&dir))
            .unwrap()
            .with_allowed_uids(vec![geteuid().as_raw()]);

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, SOCKET_MODE);

        let (stop_tx, server) = serve(endpoint);

        let stream = UnixStream::connect(&path).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut frames = FrameReader::new(BufReader::new(read));

        let start = ClientFrame::Start {
            id: 1,
            request: StartRequest::new("/usr/sbin/openvpn", "/tmp/x.ovpn"),
        };
        write_frame(&mut write, &start).await.unwrap();
        let reply: Option<HelperFrame> = frames.next_frame().await.unwrap();
        assert_eq!(
            reply,
            Some(HelperFrame::StartReply {
                id: 1,
                error: Some(HelperError::BinarySignatureNotSignedByUs)
            })
        );

        stop_tx.send(()).unwrap();
        server.await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_unlisted_uid_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("helper.sock");
        let other = geteuid().as_raw().wrapping_add(1);
        let endpoint = ControlEndpoint::bind(&path, supervisor(&dir))
            .unwrap()
            .with_allowed_uids(vec![other]);
        let (stop_tx, server) = serve(endpoint);

        let stream = UnixStream::connect(&path).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut frames = FrameReader::new(BufReader::new(read));

        // The write may race the close; only the missing reply matters
        let _ = write_frame(&mut write, &ClientFrame::GetVersion { id: 1 }).await;
        let reply = tokio::time::timeout(
            Duration::from_secs(5),
            frames.next_frame::<HelperFrame>(),
        )
        .await
        .unwrap();
        assert!(matches!(reply, Ok(None) | Err(_)));

        stop_tx.send(()).unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_socket_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("helper.sock");

        let first = ControlEndpoint::bind(&path, supervisor(&dir)).unwrap();
        drop(first);
        assert!(path.exists());

        assert!(ControlEndpoint::bind(&path, supervisor(&dir)).is_ok());
    }

    #[tokio::test]
    async fn test_refuses_to_replace_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("helper.sock");
        std::fs::write(&path, "keep me").unwrap();

        assert!(ControlEndpoint::bind(&path, supervisor(&dir)).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me");
    }
}
