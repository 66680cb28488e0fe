//! Session state
//!
//! The helper supervises at most one OpenVPN process. Its lifecycle:
//!
//! ```text
//!            start ok                 close / exit
//!   Idle ──────────▶ Starting ──▶ Running ──▶ Stopping ──▶ Idle
//!     ▲                 │
//!     └── start failed ─┘
//! ```

use ovpn_protocol::StartRequest;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Supervisor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No OpenVPN process
    Idle,
    /// Checks passed or in progress, spawn pending
    Starting,
    /// OpenVPN is running
    Running,
    /// Termination requested, waiting for exit
    Stopping,
}

impl SessionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }
}

/// The live supervised process
#[derive(Debug, Clone)]
pub struct HelperSession {
    /// Monotonic session number
    pub id: u64,
    /// OpenVPN process id (also its process group id)
    pub pid: u32,
    /// Request as the app sent it
    pub request: StartRequest,
    /// Private directory holding the verified copies OpenVPN runs from
    pub stage_dir: PathBuf,
    /// Uid of the client that started the session, if known
    pub owner_uid: Option<u32>,
    /// Lease-watch plist, if the daemon was loaded
    pub leasewatch_plist: Option<PathBuf>,
    /// Current state (Running or Stopping)
    pub state: SessionState,
    /// When the process was spawned
    pub started_at: Instant,
}

impl HelperSession {
    /// Time since spawn
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Root and the client that started the session may close it
    pub fn closable_by(&self, uid: u32) -> bool {
        uid == 0 || self.owner_uid.is_none_or(|owner| owner == uid)
    }
}

/// How the OpenVPN process exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code; `None` when killed by a signal or not observable
    pub code: Option<i32>,
}

/// Sent once when a session ends, however it ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnded {
    pub session_id: u64,
    pub exit: Option<ExitReport>,
    /// Ended by `close` rather than on its own
    pub requested: bool,
}

/// Where a session's termination is reported
pub type TerminationSink = mpsc::UnboundedSender<SessionEnded>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state() {
        assert!(SessionState::Idle.is_idle());
        assert!(SessionState::Running.is_running());
        assert!(!SessionState::Stopping.is_running());
        assert!(!SessionState::Starting.is_idle());
    }

    #[test]
    fn test_closable_by() {
        let mut session = HelperSession {
            id: 1,
            pid: 4242,
            request: StartRequest::new("/opt/openvpn", "/tmp/eduvpn.ovpn"),
            stage_dir: PathBuf::from("/var/run/org.eduvpn.app.openvpnhelper/session-1"),
            owner_uid: Some(501),
            leasewatch_plist: None,
            state: SessionState::Running,
            started_at: Instant::now(),
        };

        assert!(session.closable_by(501));
        assert!(session.closable_by(0));
        assert!(!session.closable_by(502));

        session.owner_uid = None;
        assert!(session.closable_by(502));
    }
}
