//! Record envelope exchanged over an authenticated connection.
//!
//! Every frame carries one JSON dictionary with a mandatory `type` tag and
//! tag-specific fields. The two directions are distinct enums: what a client
//! may ask ([`ClientRecord`]) and what the server may emit ([`ServerRecord`]).
//! Domain conflicts travel in tag-specific status fields so clients can
//! discriminate; the generic `error` record is reserved for decode,
//! authorization, and internal failures.

use serde::{Deserialize, Serialize};

/// Current unix time in seconds, the timestamp convention of the wire.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Media flavor of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Audio,
    Video,
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallKind::Audio => f.write_str("audio"),
            CallKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Success,
    Error,
}

/// Outcome of a relay attempt, reported per `message_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
    UserOffline,
}

/// Caller's synchronous view of a `call_request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    UserOffline,
    UserBusy,
    Failed,
}

/// Callee's synchronous view of a `call_answer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    Accepted,
    Rejected,
    CallNotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndStatus {
    Ended,
    AlreadyEnded,
}

/// One roster row in `user_list_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub username: String,
    pub p2p_port: u16,
    pub external_ip: String,
    pub last_seen: String,
}

/// Requests a client may issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRecord {
    Register {
        username: String,
        password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },
    Login {
        username: String,
        password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        p2p_port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        external_ip: Option<String>,
    },
    Logout {
        session_token: String,
    },
    GetUserList {
        session_token: String,
    },
    ClientInfo {
        p2p_port: u16,
        external_ip: String,
        session_token: String,
    },
    Heartbeat {
        session_token: String,
    },
    P2pMessage {
        to: String,
        message: String,
        message_id: String,
        timestamp: f64,
        session_token: String,
    },
    CallRequest {
        to: String,
        call_type: CallKind,
        call_id: String,
        session_token: String,
    },
    CallAnswer {
        call_id: String,
        // kept untyped so an unrecognized value is answered with an
        // `error` record instead of failing at decode
        answer: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_port: Option<u16>,
        session_token: String,
    },
    CallEnd {
        call_id: String,
        session_token: String,
    },
    IceCandidate {
        call_id: String,
        candidate: String,
        target_user: String,
        session_token: String,
    },
}

impl ClientRecord {
    /// Tag name as it appears on the wire, for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            ClientRecord::Register { .. } => "register",
            ClientRecord::Login { .. } => "login",
            ClientRecord::Logout { .. } => "logout",
            ClientRecord::GetUserList { .. } => "get_user_list",
            ClientRecord::ClientInfo { .. } => "client_info",
            ClientRecord::Heartbeat { .. } => "heartbeat",
            ClientRecord::P2pMessage { .. } => "p2p_message",
            ClientRecord::CallRequest { .. } => "call_request",
            ClientRecord::CallAnswer { .. } => "call_answer",
            ClientRecord::CallEnd { .. } => "call_end",
            ClientRecord::IceCandidate { .. } => "ice_candidate",
        }
    }

    /// Session token accompanying the request, when the tag carries one.
    pub fn session_token(&self) -> Option<&str> {
        match self {
            ClientRecord::Register { .. } | ClientRecord::Login { .. } => None,
            ClientRecord::Logout { session_token }
            | ClientRecord::GetUserList { session_token }
            | ClientRecord::ClientInfo { session_token, .. }
            | ClientRecord::Heartbeat { session_token }
            | ClientRecord::P2pMessage { session_token, .. }
            | ClientRecord::CallRequest { session_token, .. }
            | ClientRecord::CallAnswer { session_token, .. }
            | ClientRecord::CallEnd { session_token, .. }
            | ClientRecord::IceCandidate { session_token, .. } => Some(session_token),
        }
    }
}

/// Records the server sends, both synchronous replies and forwarded
/// side-effect records pushed through the target's own connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerRecord {
    AuthResponse {
        status: AuthStatus,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
    },
    UserListUpdate {
        users: Vec<UserSummary>,
    },
    ClientInfoAck {
        status: AuthStatus,
    },
    HeartbeatAck,
    P2pMessage {
        from: String,
        message: String,
        message_id: String,
        timestamp: f64,
    },
    MessageStatus {
        status: DeliveryStatus,
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    CallRequest {
        from: String,
        call_type: CallKind,
        call_id: String,
        timestamp: f64,
    },
    CallResponse {
        status: CallStatus,
        call_id: String,
        message: String,
    },
    CallAnswerResponse {
        status: AnswerStatus,
        call_id: String,
    },
    CallAccepted {
        from: String,
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_port: Option<u16>,
    },
    CallRejected {
        from: String,
        call_id: String,
    },
    CallEndResponse {
        status: EndStatus,
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
    },
    CallEnded {
        from: String,
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    IceCandidate {
        call_id: String,
        candidate: String,
        from_user: String,
    },
    Error {
        message: String,
    },
}

impl ServerRecord {
    pub fn error(message: impl Into<String>) -> Self {
        ServerRecord::Error {
            message: message.into(),
        }
    }

    pub fn not_authorized() -> Self {
        ServerRecord::error("not authorized")
    }
}
