//! Connection handler
//!
//! One task per app connection. Requests are read in order, but each runs
//! in its own task so a slow `close` does not hold up `get_version`. Replies
//! and notifications funnel through one writer task.
//!
//! ```text
//!   socket ──▶ reader loop ──▶ spawn per request ──┐
//!                                                  ├──▶ out channel ──▶ writer ──▶ socket
//!   supervisor ──▶ SessionEnded ──▶ notifier ──────┘
//! ```

use ovpn_protocol::{ClientFrame, FrameReader, HELPER_VERSION, HelperFrame, write_frame};
use ovpn_supervisor::{SessionEnded, Supervisor};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// `task_terminated` notifications awaiting an ack, by sequence number
#[derive(Debug, Default)]
struct PendingAcks {
    next_seq: u64,
    unacked: BTreeMap<u64, u64>,
}

impl PendingAcks {
    /// Register a notification for `session_id`, returning its sequence
    fn push(&mut self, session_id: u64) -> u64 {
        self.next_seq += 1;
        self.unacked.insert(self.next_seq, session_id);
        self.next_seq
    }

    fn ack(&mut self, seq: u64) -> Option<u64> {
        self.unacked.remove(&seq)
    }
}

/// Serve one app connection, from a peer running as `uid`, until it closes
pub async fn handle_connection(
    stream: UnixStream,
    supervisor: Supervisor,
    conn_id: u64,
    uid: u32,
) {
    let (read, mut write) = stream.into_split();
    let mut frames = FrameReader::new(BufReader::new(read));

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<HelperFrame>();
    let (ended_tx, ended_rx) = mpsc::unbounded_channel::<SessionEnded>();
    let acks = Arc::new(Mutex::new(PendingAcks::default()));

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut write, &frame).await {
                debug!("Connection {}: write failed: {}", conn_id, e);
                break;
            }
        }
    });

    let notifier = tokio::spawn(forward_terminations(
        ended_rx,
        out_tx.clone(),
        Arc::clone(&acks),
        conn_id,
    ));

    info!("Connection {} opened by uid {}", conn_id, uid);

    loop {
        let frame = match frames.next_frame::<ClientFrame>().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) if e.is_recoverable() => {
                warn!("Connection {}: ignoring frame: {}", conn_id, e);
                continue;
            }
            Err(e) => {
                warn!("Connection {}: {}", conn_id, e);
                break;
            }
        };

        match frame {
            ClientFrame::GetVersion { id } => {
                let _ = out_tx.send(HelperFrame::Version {
                    id,
                    version: HELPER_VERSION.to_string(),
                });
            }
            ClientFrame::Start { id, request } => {
                info!(
                    "Connection {}: start {} with {}",
                    conn_id,
                    request.launch_path.display(),
                    request.config_path.display()
                );
                let supervisor = supervisor.clone();
                let out = out_tx.clone();
                let ended = ended_tx.clone();
                tokio::spawn(async move {
                    let result = supervisor.start_for(uid, request, Some(ended)).await;
                    let _ = out.send(HelperFrame::start_reply(id, result));
                });
            }
            ClientFrame::Close { id } => {
                info!("Connection {}: close", conn_id);
                let supervisor = supervisor.clone();
                let out = out_tx.clone();
                tokio::spawn(async move {
                    let result = supervisor.close_for(uid).await;
                    let _ = out.send(HelperFrame::close_reply(id, result));
                });
            }
            ClientFrame::TaskTerminatedAck { seq } => {
                let acked = acks.lock().map(|mut acks| acks.ack(seq)).unwrap_or(None);
                match acked {
                    Some(session) => debug!("Connection {}: session {} end acked", conn_id, session),
                    None => debug!("Connection {}: ack for unknown seq {}", conn_id, seq),
                }
            }
        }
    }

    notifier.abort();
    if let Ok(acks) = acks.lock() {
        if !acks.unacked.is_empty() {
            warn!(
                "Connection {} closed with {} unacknowledged termination notices",
                conn_id,
                acks.unacked.len()
            );
        }
    }
    info!("Connection {} closed", conn_id);
}

/// Turn session ends into `task_terminated` frames
async fn forward_terminations(
    mut ended_rx: mpsc::UnboundedReceiver<SessionEnded>,
    out: mpsc::UnboundedSender<HelperFrame>,
    acks: Arc<Mutex<PendingAcks>>,
    conn_id: u64,
) {
    while let Some(ended) = ended_rx.recv().await {
        let Ok(seq) = acks.lock().map(|mut acks| acks.push(ended.session_id)) else {
            break;
        };
        info!(
            "Connection {}: session {} terminated, notifying (seq {})",
            conn_id, ended.session_id, seq
        );
        if out.send(HelperFrame::TaskTerminated { seq }).is_err() {
            break;
        }
    }
}
