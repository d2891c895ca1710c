//! Message record and its wire representation.
//!
//! Priorities and statuses serialize as single letters (`"H"`/`"L"` and
//! `"Q"`/`"S"`/`"H"`) — the same shape the control API exposes.
//!
//! # Id encoding
//! Message ids are minted by the store from a per-connection sequence. Low
//! priority sets bit 63, so unsigned ordering of ids is exactly
//! priority-then-FIFO. Everything that orders pending work relies on this.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Set on the id of every low-priority message, shifting it behind every
/// high-priority id under unsigned comparison.
pub const LOW_PRIORITY_MASK: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    #[serde(rename = "H")]
    High,
    #[serde(rename = "L")]
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "Q")]
    Queued,
    #[serde(rename = "S")]
    Sent,
    #[serde(rename = "H")]
    Handled,
}

/// A single message moving through a connection, in either direction.
///
/// `id == 0` means "not yet assigned"; the store mints the real id on first
/// write. `finished` stays `None` until the message reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Msg {
    pub id: u64,
    pub conn_uuid: String,
    pub address: String,
    pub text: String,
    pub priority: Priority,
    pub status: Status,
    pub log: String,
    pub created: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
}

impl Default for Msg {
    fn default() -> Self {
        Msg {
            id: 0,
            conn_uuid: String::new(),
            address: String::new(),
            text: String::new(),
            priority: Priority::Low,
            status: Status::Queued,
            log: String::new(),
            created: DateTime::UNIX_EPOCH,
            finished: None,
        }
    }
}

impl Msg {
    /// Clear every field back to the unassigned state, keeping the string
    /// allocations for reuse.
    pub fn reset(&mut self) {
        self.id = 0;
        self.conn_uuid.clear();
        self.address.clear();
        self.text.clear();
        self.priority = Priority::Low;
        self.status = Status::Queued;
        self.log.clear();
        self.created = DateTime::UNIX_EPOCH;
        self.finished = None;
    }

    /// The priority band an already-minted id belongs to.
    pub fn priority_of_id(id: u64) -> Priority {
        if id & LOW_PRIORITY_MASK != 0 {
            Priority::Low
        } else {
            Priority::High
        }
    }
}
