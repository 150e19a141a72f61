//! GameDock wire protocol: envelope, message kinds, typed payloads.
//!
//! One persistent connection per Hub↔Agent pairing carries JSON envelopes
//! (text frames) for requests/responses/events, plus raw binary frames for
//! chunk payloads (see the `wire` module).

use std::collections::HashMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Current protocol version. Carried in the hello handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on a single JSON envelope. Chunk payloads go over binary
/// frames, so anything bigger than this is a protocol violation.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Keepalive ping interval for the persistent connection.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for the matching pong. Shorter than `PING_INTERVAL` so a dead
/// peer is detected before the next ping is due.
pub const PONG_DEADLINE: Duration = Duration::from_secs(20);

/// Per-request timeout, distinct from the keepalive interval.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Machine-readable error codes carried in [`ErrorBody::code`].
pub mod code {
    pub const PAIRING_REQUIRED: &str = "pairing_required";
    pub const PAIR_FAILED: &str = "pair_failed";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const CHECKSUM_MISMATCH: &str = "checksum_mismatch";
    pub const UNKNOWN_SESSION: &str = "unknown_session";
    pub const UNKNOWN_MESSAGE: &str = "unknown_message";
    pub const MALFORMED: &str = "malformed";
    pub const IO: &str = "io";
    pub const NOT_FOUND: &str = "not_found";
    pub const LIBRARY: &str = "library";
}

/// All message kinds. Every request kind has exactly one success-response
/// kind; any request can instead receive a generic `Error` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    // Connection bring-up and pairing.
    Hello,
    HelloAck,
    PairRequired,
    PairSubmit,
    PairResult,
    // Request/response pairs.
    Info,
    InfoResult,
    ListShortcuts,
    ShortcutsList,
    CreateShortcut,
    ShortcutCreated,
    DeleteShortcut,
    ShortcutDeleted,
    ApplyArtwork,
    ArtworkApplied,
    UploadInit,
    UploadReady,
    UploadComplete,
    UploadFinished,
    UploadCancel,
    UploadCancelled,
    // One-way events, no matching request.
    UploadProgress,
    OperationEvent,
    // Generic failure reply.
    Error,
}

/// Machine-readable code plus human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// The wire envelope. `id` is caller-generated and echoed back verbatim in
/// the reply so concurrent in-flight requests on one connection can be
/// correlated. Never mutated after send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Envelope {
    /// New request with a fresh id and encoded payload.
    pub fn request<P: Serialize>(kind: MessageKind, payload: &P) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            payload: Some(serde_json::to_value(payload).map_err(ProtocolError::Serialize)?),
            error: None,
        })
    }

    /// New request with no payload.
    pub fn request_empty(kind: MessageKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            payload: None,
            error: None,
        }
    }

    /// Success reply echoing the request id.
    pub fn reply<P: Serialize>(
        request_id: &str,
        kind: MessageKind,
        payload: &P,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: request_id.to_string(),
            kind,
            payload: Some(serde_json::to_value(payload).map_err(ProtocolError::Serialize)?),
            error: None,
        })
    }

    /// Success reply with no payload, for pure acknowledgements.
    pub fn reply_empty(request_id: &str, kind: MessageKind) -> Self {
        Self {
            id: request_id.to_string(),
            kind,
            payload: None,
            error: None,
        }
    }

    /// Generic error reply echoing the request id.
    pub fn error_reply(request_id: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            id: request_id.to_string(),
            kind: MessageKind::Error,
            payload: None,
            error: Some(ErrorBody {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }

    /// Unsolicited event. Gets its own id; nobody correlates on it.
    pub fn event<P: Serialize>(kind: MessageKind, payload: &P) -> Result<Self, ProtocolError> {
        Self::request(kind, payload)
    }

    /// Parse the payload into a typed structure. An absent payload is a
    /// no-op, not an error, so callers can safely probe optional fields.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<Option<T>, ProtocolError> {
        match &self.payload {
            None => Ok(None),
            Some(serde_json::Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(ProtocolError::Parse),
        }
    }

    /// Encode for the wire, enforcing the envelope size cap.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let s = serde_json::to_string(self).map_err(ProtocolError::Serialize)?;
        if s.len() > MAX_MESSAGE_BYTES {
            return Err(ProtocolError::TooLarge { len: s.len() });
        }
        Ok(s)
    }

    /// Decode from the wire, enforcing the envelope size cap.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        if s.len() > MAX_MESSAGE_BYTES {
            return Err(ProtocolError::TooLarge { len: s.len() });
        }
        serde_json::from_str(s).map_err(ProtocolError::Parse)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode payload: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to parse envelope: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("envelope too large ({len} bytes)")]
    TooLarge { len: usize },
}

// ---- Typed payloads. Field casing matches the legacy JSON wire shapes. ----

/// Hub -> Agent on connect. `token` absent means first contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub hub_id: String,
    pub hub_name: String,
    pub protocol_version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Agent -> Hub handshake reply. `paired` false means a pairing flow follows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAck {
    pub agent_id: String,
    pub agent_name: String,
    pub platform: String,
    pub version: String,
    pub paired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequired {
    pub expires_in_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairSubmit {
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Read-only status surface consumed by the GUI collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResult {
    pub id: String,
    pub name: String,
    pub platform: String,
    pub version: String,
    pub accept_connections: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortcutInfo {
    pub app_id: u32,
    pub name: String,
    pub exe: String,
    pub start_dir: String,
}

/// An unreadable database is reported as an empty list plus `warning`,
/// never as a listing failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortcutsList {
    pub shortcuts: Vec<ShortcutInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShortcut {
    pub name: String,
    pub exe: String,
    pub start_dir: String,
    #[serde(default)]
    pub launch_options: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortcutCreated {
    pub app_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteShortcut {
    pub app_id: u32,
}

/// Install an already-transferred image as artwork for a shortcut.
/// `slot` is one of "grid", "hero", "logo", "icon".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyArtwork {
    pub app_id: u32,
    pub slot: String,
    pub rel_path: String,
}

/// One file in an upload manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub rel_path: String,
    pub size: u64,
}

/// Destination and launch metadata for a deployed game.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    pub game_name: String,
    /// Directory name under the Agent's install root.
    pub dest_dir: String,
    /// Executable path relative to `dest_dir`.
    pub exe_rel_path: String,
    #[serde(default)]
    pub launch_options: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Sent once per session. The manifest declares every file up front.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInit {
    pub session_id: String,
    pub config: TransferConfig,
    pub files: Vec<FileEntry>,
    pub total_bytes: u64,
    /// Requested chunk size; the receiver may dictate a different one.
    pub chunk_size: u64,
}

/// Receiver's answer to `UploadInit`. `resume` maps relative path to the
/// byte offset already present on disk from a prior attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReady {
    pub session_id: String,
    pub chunk_size: u64,
    #[serde(default)]
    pub resume: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub session_id: String,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub bytes_per_sec: f64,
    pub eta_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadComplete {
    pub session_id: String,
}

/// Transfer success and finalize (shortcut registration) success are
/// reported separately: all bytes can land and the finalize step still fail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFinished {
    pub session_id: String,
    pub transfer_ok: bool,
    pub shortcut_ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCancel {
    pub session_id: String,
}

/// Operation lifecycle notification for collaborating shells.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub status: String,
    pub game_name: String,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_echoes_request_id() {
        let req = Envelope::request_empty(MessageKind::ListShortcuts);
        let resp = Envelope::reply(
            &req.id,
            MessageKind::ShortcutsList,
            &ShortcutsList {
                shortcuts: vec![],
                warning: None,
            },
        )
        .unwrap();
        assert_eq!(req.id, resp.id);
        assert_eq!(resp.kind, MessageKind::ShortcutsList);
    }

    #[test]
    fn empty_payload_parse_is_noop() {
        let env = Envelope::request_empty(MessageKind::Info);
        let parsed: Option<InfoResult> = env.parse_payload().unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn error_reply_carries_code_and_message() {
        let env = Envelope::error_reply("abc", code::UNAUTHORIZED, "no token");
        assert_eq!(env.id, "abc");
        assert_eq!(env.kind, MessageKind::Error);
        let err = env.error.unwrap();
        assert_eq!(err.code, code::UNAUTHORIZED);
        assert_eq!(err.message, "no token");
    }

    #[test]
    fn json_roundtrip_preserves_payload() {
        let init = UploadInit {
            session_id: "s1".into(),
            config: TransferConfig {
                game_name: "Celeste".into(),
                dest_dir: "celeste".into(),
                exe_rel_path: "Celeste.exe".into(),
                launch_options: String::new(),
                tags: vec!["Platformer".into()],
            },
            files: vec![FileEntry {
                rel_path: "Celeste.exe".into(),
                size: 1234,
            }],
            total_bytes: 1234,
            chunk_size: 0,
        };
        let env = Envelope::request(MessageKind::UploadInit, &init).unwrap();
        let json = env.to_json().unwrap();
        let back = Envelope::from_json(&json).unwrap();
        let parsed: UploadInit = back.parse_payload().unwrap().unwrap();
        assert_eq!(parsed.session_id, "s1");
        assert_eq!(parsed.config.game_name, "Celeste");
        assert_eq!(parsed.files, init.files);
    }

    #[test]
    fn oversized_envelope_rejected() {
        let blob = "x".repeat(MAX_MESSAGE_BYTES + 1);
        let env = Envelope::request(MessageKind::OperationEvent, &blob).unwrap();
        assert!(matches!(env.to_json(), Err(ProtocolError::TooLarge { .. })));
    }

    #[test]
    fn kind_serializes_snake_case() {
        let s = serde_json::to_string(&MessageKind::UploadProgress).unwrap();
        assert_eq!(s, "\"upload_progress\"");
    }

    #[test]
    fn pong_deadline_shorter_than_ping_interval() {
        assert!(PONG_DEADLINE < PING_INTERVAL);
    }
}
