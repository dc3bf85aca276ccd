//! Diagnostics protocol payloads.
//!
//! The diagnostics socket speaks `u32` length-prefixed JSON documents, one
//! request and one response per exchange. Everything is read-only except
//! `close_connection`.

use serde::{Deserialize, Serialize};

/// A request on the diagnostics socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DiagRequest {
    ListConnections,
    ListIntents,
    ListLocks,
    ListNotificationListeners,
    ListNotificationWait,
    TransactionDetails { uid: u64 },
    CloseConnection { uid: u64 },
}

/// Response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct DiagResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DiagResponse {
    pub fn ok<T: Serialize>(data: &T) -> DiagResponse {
        match serde_json::to_value(data) {
            Ok(value) => DiagResponse {
                ok: true,
                data: Some(value),
                error: None,
            },
            Err(err) => DiagResponse::err(format!("serialization failed: {err}")),
        }
    }

    #[must_use]
    pub fn err(message: impl Into<String>) -> DiagResponse {
        DiagResponse {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// One live connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: u64,
    pub name: String,
    /// Status string of the open transaction, if any.
    pub transaction_status: Option<String>,
}

/// One held lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub origin: u64,
    pub generation: u64,
    pub key: String,
    pub start: i64,
    pub end: i64,
    pub write: bool,
}

/// One declared intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentInfo {
    pub origin: u64,
    pub uid: u64,
    pub key: String,
    pub start: i64,
    pub end: i64,
}

/// Listeners registered on one key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerInfo {
    pub key: String,
    pub connections: Vec<u64>,
}

/// One queued notification still waiting on listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationWaitInfo {
    pub key: String,
    pub start: i64,
    pub end: i64,
    pub awaiting_send: Vec<u64>,
    pub awaiting_ack: Vec<u64>,
}

/// Details of one connection's open transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionDetails {
    pub connection: u64,
    pub write: bool,
    pub generation: u64,
    pub status: String,
    pub elapsed_secs: f64,
    pub locks_held: usize,
    pub queued_notifications: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_tag_format() {
        let raw = r#"{"op":"transaction_details","uid":12}"#;
        let req: DiagRequest = serde_json::from_str(raw).unwrap();
        assert!(matches!(req, DiagRequest::TransactionDetails { uid: 12 }));

        let listed = serde_json::to_string(&DiagRequest::ListLocks).unwrap();
        assert_eq!(listed, r#"{"op":"list_locks"}"#);
    }

    #[test]
    fn error_envelope_skips_data() {
        let raw = serde_json::to_string(&DiagResponse::err("nope")).unwrap();
        assert_eq!(raw, r#"{"ok":false,"error":"nope"}"#);
    }
}
