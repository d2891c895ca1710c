//! Connection configuration: the unit of ownership for a dispatcher and its
//! workers.
//!
//! A connection pairs a group of senders with a group of receivers. Incoming
//! JSON omits the uuid; [`Connection::validate_new`] applies the defaulting
//! rules, checks the worker types, and assigns a fresh v4 uuid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

pub const SENDER_ECHO: &str = "echo";
pub const SENDER_TWITTER: &str = "twitter";
pub const RECEIVER_HTTP: &str = "http";

/// Configuration for one side of a connection (senders or receivers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerGroup {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    #[serde(default)]
    pub uuid: String,
    pub senders: WorkerGroup,
    pub receivers: WorkerGroup,
}

/// Bucket sizes reported by `GET /connection/{uuid}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub outgoing_queued: u64,
    pub incoming_queued: u64,
    pub sent_results: u64,
    pub handled_results: u64,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("sender type must be `echo` or `twitter`, was `{0}`")]
    UnsupportedSenderType(String),
    #[error("receiver type must be `http`, was `{0}`")]
    UnsupportedReceiverType(String),
    #[error("http receivers require a `url` config entry")]
    MissingReceiverUrl,
}

impl Connection {
    /// Validate a freshly-deserialized connection, apply defaults, and assign
    /// a uuid.
    ///
    /// Defaults: missing receiver type becomes `http`, zero counts become 1.
    pub fn validate_new(&mut self) -> Result<(), ConnectionError> {
        if self.senders.kind != SENDER_ECHO && self.senders.kind != SENDER_TWITTER {
            return Err(ConnectionError::UnsupportedSenderType(
                self.senders.kind.clone(),
            ));
        }

        if self.receivers.kind.is_empty() {
            self.receivers.kind = RECEIVER_HTTP.to_owned();
        }
        if self.receivers.kind != RECEIVER_HTTP {
            return Err(ConnectionError::UnsupportedReceiverType(
                self.receivers.kind.clone(),
            ));
        }
        if self
            .receivers
            .config
            .get("url")
            .is_none_or(|url| url.is_empty())
        {
            return Err(ConnectionError::MissingReceiverUrl);
        }

        if self.senders.count == 0 {
            self.senders.count = 1;
        }
        if self.receivers.count == 0 {
            self.receivers.count = 1;
        }

        self.uuid = Uuid::new_v4().to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_connection_json() -> &'static str {
        r#"{
            "senders":   { "type": "echo", "count": 2, "config": { "pause": "100" } },
            "receivers": { "type": "http", "count": 1, "config": { "url": "http://127.0.0.1:9/sink" } }
        }"#
    }

    #[test]
    fn validate_new_assigns_uuid_and_keeps_counts() {
        let mut conn: Connection = serde_json::from_str(echo_connection_json()).unwrap();
        conn.validate_new().unwrap();
        assert_eq!(conn.uuid.len(), 36);
        assert_eq!(conn.senders.count, 2);
        assert_eq!(conn.receivers.count, 1);
    }

    #[test]
    fn validate_new_defaults_receiver_type_and_counts() {
        let mut conn: Connection = serde_json::from_str(
            r#"{
                "senders":   { "type": "echo" },
                "receivers": { "type": "", "config": { "url": "http://example/sink" } }
            }"#,
        )
        .unwrap();
        conn.validate_new().unwrap();
        assert_eq!(conn.receivers.kind, RECEIVER_HTTP);
        assert_eq!(conn.senders.count, 1);
        assert_eq!(conn.receivers.count, 1);
    }

    #[test]
    fn omitted_receiver_type_key_also_defaults_to_http() {
        // The `type` key left out entirely, not set to "".
        let mut conn: Connection = serde_json::from_str(
            r#"{
                "senders":   { "type": "echo" },
                "receivers": { "config": { "url": "http://example/sink" } }
            }"#,
        )
        .unwrap();
        conn.validate_new().unwrap();
        assert_eq!(conn.receivers.kind, RECEIVER_HTTP);
    }

    #[test]
    fn omitted_sender_type_key_is_rejected() {
        let mut conn: Connection = serde_json::from_str(
            r#"{
                "senders":   { "count": 1 },
                "receivers": { "type": "http", "config": { "url": "http://example/sink" } }
            }"#,
        )
        .unwrap();
        assert!(matches!(
            conn.validate_new(),
            Err(ConnectionError::UnsupportedSenderType(t)) if t.is_empty()
        ));
    }

    #[test]
    fn validate_new_rejects_unknown_sender_type() {
        let mut conn: Connection = serde_json::from_str(
            r#"{
                "senders":   { "type": "smtp" },
                "receivers": { "type": "http", "config": { "url": "http://example/sink" } }
            }"#,
        )
        .unwrap();
        assert!(matches!(
            conn.validate_new(),
            Err(ConnectionError::UnsupportedSenderType(t)) if t == "smtp"
        ));
    }

    #[test]
    fn validate_new_rejects_http_receiver_without_url() {
        let mut conn: Connection = serde_json::from_str(
            r#"{
                "senders":   { "type": "echo" },
                "receivers": { "type": "http" }
            }"#,
        )
        .unwrap();
        assert!(matches!(
            conn.validate_new(),
            Err(ConnectionError::MissingReceiverUrl)
        ));
    }

    #[test]
    fn connection_round_trips_through_json() {
        let mut conn: Connection = serde_json::from_str(echo_connection_json()).unwrap();
        conn.validate_new().unwrap();
        let js = serde_json::to_string(&conn).unwrap();
        let back: Connection = serde_json::from_str(&js).unwrap();
        assert_eq!(back, conn);
    }
}
