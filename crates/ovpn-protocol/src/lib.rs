//! OpenVPN Helper Protocol
//!
//! Wire types shared by the privileged helper and the unprivileged app.
//!
//! # Channels
//!
//! ```text
//! ┌──────────────┐   get_version / start / close   ┌──────────────────┐
//! │              │ ──────────────────────────────▶ │                  │
//! │  VPN app     │ ◀────────────────────────────── │  Privileged      │
//! │ (unprivileged)│   version / start_reply / ...   │  helper          │
//! │              │                                 │                  │
//! │              │ ◀─────── task_terminated ────── │                  │
//! │              │ ───── task_terminated_ack ────▶ │                  │
//! └──────────────┘                                 └──────────────────┘
//! ```
//!
//! Both directions share one Unix stream socket. Every frame is a single
//! JSON object terminated by `\n`, tagged by its `type` field.

mod codec;
mod error;
mod message;
mod request;

pub use codec::{CodecError, FrameReader, MAX_FRAME_LEN, decode_frame, encode_frame, write_frame};
pub use error::{ErrorCode, HelperError, WireError, WireErrorDecode};
pub use message::{ClientFrame, HelperFrame, RequestId};
pub use request::StartRequest;

/// Well-known service name the helper registers under.
///
/// Must match the launchd `MachServices`/socket name installed with the
/// helper on the app side.
pub const SERVICE_NAME: &str = "org.eduvpn.app.openvpnhelper";

/// Error domain carried by every error on the wire.
pub const ERROR_DOMAIN: &str = "OpenVPNHelperErrorDomain";

/// Version reported by `get_version`.
///
/// The app reinstalls the helper when this does not match its own copy.
pub const HELPER_VERSION: &str = env!("CARGO_PKG_VERSION");
