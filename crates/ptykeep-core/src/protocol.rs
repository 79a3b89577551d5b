//! Protocol types for client-daemon communication.
//!
//! Frames are newline-delimited JSON. Client to daemon frames are
//! [`Request`]s; daemon to client frames are [`Frame`]s, either a
//! [`Response`] correlated by request id or a pushed [`SessionEvent`]
//! for a subscribed session.

use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// A request from client to daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub command: Command,
}

/// Commands the daemon can execute.
///
/// The first frame on every connection must be `Hello`; anything else is
/// rejected until authentication succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    /// Authenticate the connection with the daemon's token.
    Hello { token: String },
    /// Attach to a live session, or spawn a new process under this id.
    CreateOrAttach(SessionSpec),
    /// Send input bytes (UTF-8 text) to a session. No-op if gone.
    Write { session_id: String, data: String },
    /// Resize a session's terminal. No-op if gone.
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    /// Deliver a POSIX signal to the child. No-op if gone.
    Signal {
        session_id: String,
        signal: Option<String>,
    },
    /// Terminate the process and remove the session. Idempotent.
    Kill {
        session_id: String,
        delete_history: bool,
    },
    /// Start receiving pushed events for a session on this connection.
    /// The response carries a scrollback snapshot taken atomically with
    /// the subscription, so snapshot-then-live has no gap.
    Subscribe { session_id: String },
    /// Stop receiving pushed events for a session on this connection.
    Unsubscribe { session_id: String },
    /// List all registered sessions.
    List,
    /// Kill every session; responds with the count killed.
    KillAll,
    /// Kill every session belonging to a workspace.
    KillForWorkspace { workspace_id: String },
    /// Shut the daemon down gracefully.
    Shutdown,
}

/// Parameters for create-or-attach.
///
/// `session_id` is the stable pane identity; it outlives any single OS
/// process. Reattaching to an exited id respawns only through this
/// explicit call, with caller-supplied cwd and dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSpec {
    pub session_id: String,
    pub workspace_id: String,
    pub tab_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    /// Command to run; empty means the default shell.
    #[serde(default)]
    pub command: Vec<String>,
}

/// A response from daemon to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl Response {
    pub fn success(id: impl Into<String>, data: ResponseData) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: ApiError) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Response payload variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    /// Outcome of create-or-attach.
    Attached {
        session_id: String,
        is_new: bool,
        was_recovered: bool,
        scrollback: String,
    },
    /// Subscription established; snapshot taken atomically with the tap.
    Subscribed {
        session_id: String,
        scrollback: String,
    },
    /// Registry listing.
    Sessions { sessions: Vec<SessionInfo> },
    /// Count of sessions killed by a bulk operation.
    Killed { count: usize },
    /// Generic acknowledgement.
    Ok { message: String },
}

/// Lifecycle of the OS process behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Running,
    Exited,
    Killed,
}

/// Information about a registered session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub workspace_id: String,
    pub tab_id: String,
    pub is_alive: bool,
    pub process_state: ProcessState,
    pub cols: u16,
    pub rows: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Whether the cwd was reported by the process or seeded from config.
    pub cwd_confirmed: bool,
    pub created_at: String,
}

/// Events delivered to session subscribers.
///
/// The daemon pushes `Data` and `Exit`. `Disconnect` and `Error` are
/// injected by the application-side session manager when the transport
/// drops or misbehaves. None of `Exit`, `Disconnect`, or `Error` ends a
/// subscription; only an explicit unsubscribe does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Data {
        data: String,
    },
    Exit {
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
    Disconnect {
        reason: String,
    },
    Error {
        detail: String,
    },
}

/// A daemon-to-client frame: either a correlated response or a pushed
/// session event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Response(Response),
    Event {
        session_id: String,
        event: SessionEvent,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_json_shape() {
        let req = Request {
            id: "1".into(),
            command: Command::Hello {
                token: "t".into(),
            },
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"action\":\"hello\""));
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn session_spec_command_defaults_empty() {
        let json = r#"{"session_id":"s","workspace_id":"w","tab_id":"t","cols":80,"rows":24}"#;
        let spec: SessionSpec = serde_json::from_str(json).unwrap();
        assert!(spec.command.is_empty());
        assert!(spec.cwd.is_none());
    }

    #[test]
    fn frame_demux_round_trip() {
        let frame = Frame::Event {
            session_id: "pane-1".into(),
            event: SessionEvent::Exit {
                exit_code: Some(0),
                signal: None,
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"kind\":\"event\""));
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);

        let resp = Frame::Response(Response::success(
            "7",
            ResponseData::Killed { count: 3 },
        ));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"kind\":\"response\""));
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn error_response_carries_api_error() {
        let resp = Response::error("9", crate::error::ApiError::not_authenticated());
        assert!(!resp.success);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("NOT_AUTHENTICATED"));
    }
}
