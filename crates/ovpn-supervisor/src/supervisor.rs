//! Process Supervisor
//!
//! Owns the single OpenVPN session.
//!
//! # Locking
//!
//! Every operation that touches the session takes one `tokio::sync::Mutex`,
//! so `start`, `close` and exit handling are serialized. A monitor task per
//! session waits for the child; on exit it publishes the status first (so a
//! `close` holding the lock sees it), then takes the lock and finalizes only
//! if its session is still the current one. Finalizing removes the session
//! from the slot, so each session ends exactly once.
//!
//! ```text
//!   start ──▶ lock ──▶ stage + verify + sanitize ──▶ spawn ──▶ slot = Some
//!                                                      │
//!                                    monitor: wait ──▶ publish exit ──▶ lock ──▶ finish?
//!   close ──▶ lock ──▶ slot.take ──▶ SIGTERM ──▶ grace ──▶ SIGKILL ──▶ finish
//! ```
//!
//! OpenVPN runs in its own process group. Signals go to the whole group, and
//! finishing a session kills whatever is left in it, so scripts OpenVPN
//! started cannot outlive the session.

use crate::launch::{log_path, openvpn_command};
use crate::launcher::ProcessLauncher;
use crate::leasewatch::{DEFAULT_LAUNCHCTL, DEFAULT_LEASEWATCH_DIR, LeasewatchDaemon};
use crate::session::{ExitReport, HelperSession, SessionEnded, SessionState, TerminationSink};
use crate::staging::{DEFAULT_RUNTIME_DIR, SessionStage, StagingArea};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use ovpn_protocol::{HelperError, StartRequest};
use ovpn_trust::{ArtifactRole, ConfigSanitizer, IdentityVerifier, verify_artifact};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

/// Default management socket the app connects to
pub const DEFAULT_MANAGEMENT_SOCKET: &str = "/private/tmp/eduvpn.socket";

/// Default time OpenVPN gets to exit after SIGTERM
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Supervisor settings
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Passed to OpenVPN as `--management <path> unix`
    pub management_socket: PathBuf,
    /// SIGTERM to SIGKILL delay
    pub shutdown_grace: Duration,
    /// Directory lease-watch plists must live in
    pub leasewatch_dir: PathBuf,
    /// `launchctl` binary
    pub launchctl_path: PathBuf,
    /// Private directory for session copies
    pub runtime_dir: PathBuf,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            management_socket: PathBuf::from(DEFAULT_MANAGEMENT_SOCKET),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            leasewatch_dir: PathBuf::from(DEFAULT_LEASEWATCH_DIR),
            launchctl_path: PathBuf::from(DEFAULT_LAUNCHCTL),
            runtime_dir: PathBuf::from(DEFAULT_RUNTIME_DIR),
        }
    }
}

/// Session held in the slot
struct ActiveSession {
    session: HelperSession,
    stage: SessionStage,
    exit_rx: watch::Receiver<Option<ExitReport>>,
    notifier: Option<TerminationSink>,
}

struct Inner {
    verifier: Arc<dyn IdentityVerifier>,
    sanitizer: ConfigSanitizer,
    launcher: Arc<dyn ProcessLauncher>,
    leasewatch: LeasewatchDaemon,
    staging: StagingArea,
    settings: SupervisorSettings,
    slot: Mutex<Option<ActiveSession>>,
    state_tx: watch::Sender<SessionState>,
    next_id: AtomicU64,
}

/// Supervises the OpenVPN process
///
/// Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Create an idle supervisor
    pub fn new(
        verifier: Arc<dyn IdentityVerifier>,
        sanitizer: ConfigSanitizer,
        launcher: Arc<dyn ProcessLauncher>,
        settings: SupervisorSettings,
    ) -> Self {
        let leasewatch = LeasewatchDaemon::new(&settings.leasewatch_dir, &settings.launchctl_path);
        let staging = StagingArea::new(&settings.runtime_dir);
        let (state_tx, _) = watch::channel(SessionState::Idle);

        Self {
            inner: Arc::new(Inner {
                verifier,
                sanitizer,
                launcher,
                leasewatch,
                staging,
                settings,
                slot: Mutex::new(None),
                state_tx,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    /// Follow state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Snapshot of the live session
    pub async fn session(&self) -> Option<HelperSession> {
        self.inner
            .slot
            .lock()
            .await
            .as_ref()
            .map(|active| active.session.clone())
    }

    /// Verify `request` and start OpenVPN
    ///
    /// `notifier` receives one [`SessionEnded`] when this session ends.
    /// Nothing is spawned unless every check passes.
    pub async fn start(
        &self,
        request: StartRequest,
        notifier: Option<TerminationSink>,
    ) -> Result<(), HelperError> {
        self.start_with(None, request, notifier).await
    }

    /// [`start`](Self::start) on behalf of the client running as `uid`
    pub async fn start_for(
        &self,
        uid: u32,
        request: StartRequest,
        notifier: Option<TerminationSink>,
    ) -> Result<(), HelperError> {
        self.start_with(Some(uid), request, notifier).await
    }

    /// Stop OpenVPN; succeeds immediately when nothing is running
    pub async fn close(&self) -> Result<(), HelperError> {
        self.close_with(None).await
    }

    /// [`close`](Self::close) on behalf of the client running as `uid`
    ///
    /// Refused when the session belongs to another, non-root client.
    pub async fn close_for(&self, uid: u32) -> Result<(), HelperError> {
        self.close_with(Some(uid)).await
    }

    /// Stop OpenVPN and wait for it to exit
    ///
    /// Fails with [`HelperError::NotRunning`] when there is no session.
    pub async fn stop(&self) -> Result<SessionEnded, HelperError> {
        self.stop_with(None).await
    }

    async fn start_with(
        &self,
        owner: Option<u32>,
        request: StartRequest,
        notifier: Option<TerminationSink>,
    ) -> Result<(), HelperError> {
        let mut slot = self.inner.slot.lock().await;

        if let Some(active) = slot.as_ref() {
            warn!(
                "Start rejected: session {} (pid {}) is still {:?}",
                active.session.id, active.session.pid, active.session.state
            );
            return Err(HelperError::Unknown);
        }

        self.inner.set_state(SessionState::Starting);
        match self.launch(owner, request, notifier).await {
            Ok(active) => {
                info!(
                    "OpenVPN running: session {} pid {}",
                    active.session.id, active.session.pid
                );
                *slot = Some(active);
                self.inner.set_state(SessionState::Running);
                Ok(())
            }
            Err(e) => {
                self.inner.set_state(SessionState::Idle);
                Err(e)
            }
        }
    }

    async fn close_with(&self, caller: Option<u32>) -> Result<(), HelperError> {
        match self.stop_with(caller).await {
            Ok(_) => Ok(()),
            Err(HelperError::NotRunning) => {
                debug!("Close with no running session");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn stop_with(&self, caller: Option<u32>) -> Result<SessionEnded, HelperError> {
        let mut slot = self.inner.slot.lock().await;

        if let (Some(uid), Some(active)) = (caller, slot.as_ref()) {
            if !active.session.closable_by(uid) {
                warn!(
                    "Uid {} may not close session {} started by uid {:?}",
                    uid, active.session.id, active.session.owner_uid
                );
                return Err(HelperError::Unknown);
            }
        }

        let Some(mut active) = slot.take() else {
            return Err(HelperError::NotRunning);
        };

        active.session.state = SessionState::Stopping;
        self.inner.set_state(SessionState::Stopping);
        info!("Stopping OpenVPN pid {}", active.session.pid);

        let exit = self.inner.terminate(&mut active).await;
        Ok(self.inner.finish(active, exit, true).await)
    }

    async fn launch(
        &self,
        owner: Option<u32>,
        request: StartRequest,
        notifier: Option<TerminationSink>,
    ) -> Result<ActiveSession, HelperError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        let checked = request.clone();
        let (stage, staged) = tokio::task::spawn_blocking(move || inner.prepare(id, &checked))
            .await
            .map_err(|e| {
                error!("Verification task failed: {}", e);
                HelperError::Unknown
            })??;

        let (child, pid) = match self.spawn_openvpn(&request, &staged) {
            Ok(spawned) => spawned,
            Err(e) => {
                discard(&stage);
                return Err(e);
            }
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(monitor(Arc::clone(&self.inner), id, child, exit_tx));

        let mut leasewatch_plist = None;
        if let Some((plist, script)) = staged.leasewatch() {
            match self
                .inner
                .leasewatch
                .install(plist, script, self.inner.launcher.as_ref())
                .await
            {
                Ok(()) => leasewatch_plist = Some(plist.to_path_buf()),
                Err(e) => warn!("Lease-watch not installed: {}", e),
            }
        }

        Ok(ActiveSession {
            session: HelperSession {
                id,
                pid,
                request,
                stage_dir: stage.path().to_path_buf(),
                owner_uid: owner,
                leasewatch_plist,
                state: SessionState::Running,
                started_at: Instant::now(),
            },
            stage,
            exit_rx,
            notifier,
        })
    }

    /// Spawn OpenVPN from the staged copies, logging next to the app's config
    fn spawn_openvpn(
        &self,
        request: &StartRequest,
        staged: &StartRequest,
    ) -> Result<(Child, u32), HelperError> {
        if let Some((plist, _)) = request.leasewatch() {
            self.inner.leasewatch.check_plist_path(plist)?;
        }

        let spec = openvpn_command(
            staged,
            &log_path(&request.config_path),
            &self.inner.settings.management_socket,
        );
        let child = self.inner.launcher.spawn(&spec).map_err(|e| {
            error!("Failed to spawn {}: {}", spec.program.display(), e);
            HelperError::Unknown
        })?;
        let Some(pid) = child.id() else {
            error!("OpenVPN exited before it could be tracked");
            return Err(HelperError::Unknown);
        };

        Ok((child, pid))
    }
}

impl Inner {
    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }

    /// Stage and check everything session `id` will use
    ///
    /// Returns the stage and a copy of `request` pointing into it.
    fn prepare(
        &self,
        id: u64,
        request: &StartRequest,
    ) -> Result<(SessionStage, StartRequest), HelperError> {
        let stage = self.staging.create(id).map_err(|e| {
            error!(
                "Cannot create session directory in {}: {}",
                self.staging.root().display(),
                e
            );
            HelperError::Unknown
        })?;

        match self.stage_request(&stage, request) {
            Ok(staged) => Ok((stage, staged)),
            Err(e) => {
                discard(&stage);
                Err(e)
            }
        }
    }

    /// Binary, then scripts, then configuration
    fn stage_request(
        &self,
        stage: &SessionStage,
        request: &StartRequest,
    ) -> Result<StartRequest, HelperError> {
        let mut staged = request.clone();
        staged.launch_path =
            self.stage_artifact(stage, &request.launch_path, ArtifactRole::Binary)?;

        let scripts = [
            (&mut staged.up_script, ArtifactRole::UpScript),
            (&mut staged.down_script, ArtifactRole::DownScript),
            (&mut staged.leasewatch_script, ArtifactRole::LeasewatchScript),
        ];
        for (script, role) in scripts {
            if let Some(path) = script {
                let copy = self.stage_artifact(stage, path, role)?;
                *path = copy;
            }
        }

        if !request.config_path.is_absolute() {
            warn!(
                "Refusing relative configuration path {}",
                request.config_path.display()
            );
            return Err(HelperError::UnreadableConfigurationFile);
        }
        let config = self.sanitizer.load(&request.config_path)?;
        staged.config_path = stage.write_config(&config).map_err(|e| {
            error!("Cannot stage configuration: {}", e);
            HelperError::Unknown
        })?;

        Ok(staged)
    }

    /// Copy one artifact into the stage and verify the copy
    fn stage_artifact(
        &self,
        stage: &SessionStage,
        path: &Path,
        role: ArtifactRole,
    ) -> Result<PathBuf, HelperError> {
        if !path.is_absolute() {
            warn!("Refusing {} at relative path {}", role, path.display());
            return Err(role.signature_error());
        }

        let copy = stage.copy_artifact(path, slot_for(role)).map_err(|e| {
            warn!("Cannot copy {} from {}: {}", role, path.display(), e);
            role.signature_error()
        })?;
        verify_artifact(self.verifier.as_ref(), &copy, role)?;

        Ok(copy)
    }

    /// SIGTERM, grace period, then SIGKILL to the whole process group
    async fn terminate(&self, active: &mut ActiveSession) -> Option<ExitReport> {
        let pgid = Pid::from_raw(active.session.pid as i32);
        signal_group(pgid, Signal::SIGTERM);

        let grace = self.settings.shutdown_grace;
        if let Ok(exit) = tokio::time::timeout(grace, wait_exit(&mut active.exit_rx)).await {
            return exit;
        }

        warn!("OpenVPN pid {} ignored SIGTERM for {:?}, killing", pgid, grace);
        signal_group(pgid, Signal::SIGKILL);
        wait_exit(&mut active.exit_rx).await
    }

    /// Clean up after a session and report its end
    async fn finish(
        &self,
        active: ActiveSession,
        exit: Option<ExitReport>,
        requested: bool,
    ) -> SessionEnded {
        signal_group(Pid::from_raw(active.session.pid as i32), Signal::SIGKILL);

        if let Some(plist) = &active.session.leasewatch_plist {
            if let Err(e) = self.leasewatch.remove(plist, self.launcher.as_ref()).await {
                warn!("Lease-watch cleanup failed: {}", e);
            }
        }
        discard(&active.stage);

        let ended = SessionEnded {
            session_id: active.session.id,
            exit,
            requested,
        };
        if let Some(notifier) = &active.notifier {
            if notifier.send(ended.clone()).is_err() {
                debug!("Session {} ended after its client went away", ended.session_id);
            }
        }

        self.set_state(SessionState::Idle);
        info!(
            "Session {} ended after {:?} (exit code {:?})",
            ended.session_id,
            active.session.uptime(),
            exit.and_then(|e| e.code)
        );
        ended
    }
}

/// Subdirectory of the stage an artifact is copied into
fn slot_for(role: ArtifactRole) -> &'static str {
    match role {
        ArtifactRole::Binary => "openvpn",
        ArtifactRole::UpScript => "up",
        ArtifactRole::DownScript => "down",
        ArtifactRole::LeasewatchScript => "leasewatch",
    }
}

fn discard(stage: &SessionStage) {
    if let Err(e) = stage.remove() {
        warn!("Could not remove {}: {}", stage.path().display(), e);
    }
}

/// Signal every process in the group; an empty group is not an error
fn signal_group(pgid: Pid, signal: Signal) {
    match killpg(pgid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => error!("{} to group {} failed: {}", signal, pgid, e),
    }
}

/// Waits for the child, then finalizes if `close` did not get there first
async fn monitor(
    inner: Arc<Inner>,
    session_id: u64,
    mut child: Child,
    exit_tx: watch::Sender<Option<ExitReport>>,
) {
    let exit = match child.wait().await {
        Ok(status) => ExitReport {
            code: status.code(),
        },
        Err(e) => {
            error!("Lost track of OpenVPN: {}", e);
            ExitReport { code: None }
        }
    };
    exit_tx.send_replace(Some(exit));

    let mut slot = inner.slot.lock().await;
    match slot.take_if(|active| active.session.id == session_id) {
        Some(active) => {
            warn!("OpenVPN exited on its own (code {:?})", exit.code);
            inner.finish(active, Some(exit), false).await;
        }
        None => debug!("Session {} already finalized", session_id),
    }
}

/// Exit published by the monitor; `None` if the monitor is gone
async fn wait_exit(exit_rx: &mut watch::Receiver<Option<ExitReport>>) -> Option<ExitReport> {
    match exit_rx.wait_for(Option::is_some).await {
        Ok(exit) => *exit,
        Err(_) => None,
    }
}
