//! Frames exchanged over the control socket.

use crate::error::HelperError;
use crate::request::StartRequest;
use serde::{Deserialize, Serialize};

/// Correlates a reply with the request that caused it.
pub type RequestId = u64;

/// Frames sent from the app to the helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Ask for the helper version
    GetVersion { id: RequestId },
    /// Start an OpenVPN session
    Start { id: RequestId, request: StartRequest },
    /// Close the running session
    Close { id: RequestId },
    /// Acknowledge a `task_terminated` notification
    TaskTerminatedAck { seq: u64 },
}

impl ClientFrame {
    /// Request id, if this frame expects a reply
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ClientFrame::GetVersion { id }
            | ClientFrame::Start { id, .. }
            | ClientFrame::Close { id } => Some(*id),
            ClientFrame::TaskTerminatedAck { .. } => None,
        }
    }
}

/// Frames sent from the helper to the app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperFrame {
    /// Reply to `get_version`
    Version { id: RequestId, version: String },
    /// Reply to `start`; `error` is null on success
    StartReply {
        id: RequestId,
        error: Option<HelperError>,
    },
    /// Reply to `close`; `error` is null on success
    CloseReply {
        id: RequestId,
        error: Option<HelperError>,
    },
    /// The supervised OpenVPN process has exited
    TaskTerminated { seq: u64 },
}

impl HelperFrame {
    /// Build the reply for a finished start
    pub fn start_reply(id: RequestId, result: Result<(), HelperError>) -> Self {
        HelperFrame::StartReply {
            id,
            error: result.err(),
        }
    }

    /// Build the reply for a finished close
    pub fn close_reply(id: RequestId, result: Result<(), HelperError>) -> Self {
        HelperFrame::CloseReply {
            id,
            error: result.err(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_shape() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "type": "start",
            "id": 7,
            "request": {
                "launch_path": "/Applications/eduVPN.app/Contents/Resources/openvpn/openvpn",
                "config_path": "/tmp/org.eduvpn.app.temp/eduvpn.ovpn",
                "up_script": "/Applications/eduVPN.app/Contents/Resources/openvpn/client.up.eduvpn.sh",
                "script_options": ["-6", "-f"]
            }
        }))
        .unwrap();

        assert_eq!(frame.request_id(), Some(7));
        match frame {
            ClientFrame::Start { request, .. } => {
                assert!(request.up_script.is_some());
                assert!(request.down_script.is_none());
                assert_eq!(request.script_options.len(), 2);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_ack_has_no_request_id() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"task_terminated_ack","seq":3}"#).unwrap();
        assert_eq!(frame, ClientFrame::TaskTerminatedAck { seq: 3 });
        assert_eq!(frame.request_id(), None);
    }

    #[test]
    fn test_success_reply_has_null_error() {
        let frame = HelperFrame::start_reply(1, Ok(()));
        let json = serde_json::to_value(&frame).unwrap();

        assert_eq!(json["type"], "start_reply");
        assert!(json["error"].is_null());
    }

    #[test]
    fn test_error_reply_carries_wire_error() {
        let frame = HelperFrame::start_reply(
            2,
            Err(HelperError::DangerousCommandsInConfigurationFile(vec!["up".into()])),
        );
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["error"]["code"], 3);
        assert_eq!(json["error"]["dangerous_commands"][0], "up");

        let parsed: HelperFrame = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result: Result<ClientFrame, _> =
            serde_json::from_str(r#"{"type":"reboot","id":1}"#);
        assert!(result.is_err());
    }
}
