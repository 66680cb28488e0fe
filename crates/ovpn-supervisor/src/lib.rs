//! OpenVPN Process Supervision
//!
//! Starts OpenVPN from a verified [`StartRequest`](ovpn_protocol::StartRequest),
//! keeps track of it, and tears it down again:
//!
//! - **Staging**: private copies of everything OpenVPN executes or reads
//! - **Launch**: fixed argument list around the staged paths
//! - **Spawn hook**: all process creation goes through [`ProcessLauncher`]
//! - **Lease-watch**: launchd job re-running a script on network changes
//! - **Supervisor**: the single session, its state, and termination reports

mod launch;
mod launcher;
mod leasewatch;
mod session;
mod staging;
mod supervisor;

pub use launch::{CommandSpec, escape_word, log_path, openvpn_command, script_command};
pub use launcher::{ProcessLauncher, SystemLauncher};
pub use leasewatch::{
    DEFAULT_LAUNCHCTL, DEFAULT_LEASEWATCH_DIR, LEASEWATCH_LABEL, LeasewatchDaemon, WATCH_PATH,
    render_plist,
};
pub use session::{ExitReport, HelperSession, SessionEnded, SessionState, TerminationSink};
pub use staging::{
    DEFAULT_RUNTIME_DIR, MAX_ARTIFACT_LEN, STAGED_CONFIG, SessionStage, StagingArea,
};
pub use supervisor::{
    DEFAULT_MANAGEMENT_SOCKET, DEFAULT_SHUTDOWN_GRACE, Supervisor, SupervisorSettings,
};
