//! Reusable message objects.
//!
//! High-throughput callers build and drop a lot of `Msg` values; the pool
//! keeps a bounded free list so their string buffers can be reused. Callers
//! acquire, use, and release — but correctness never depends on which
//! instance comes back, and releasing is always safe to skip.

use crate::msg::{Msg, Priority, Status};
use chrono::Utc;
use std::sync::Mutex;

/// Free-list cap. Beyond this, released messages are simply dropped.
const MAX_POOLED: usize = 1024;

#[derive(Debug, Default)]
pub struct MsgPool {
    free: Mutex<Vec<Msg>>,
}

impl MsgPool {
    pub fn new() -> Self {
        MsgPool::default()
    }

    /// Take a cleared message from the pool, or allocate a fresh one.
    pub fn acquire(&self) -> Msg {
        self.free.lock().unwrap().pop().unwrap_or_default()
    }

    /// Return a message to the pool.
    pub fn release(&self, mut msg: Msg) {
        msg.reset();
        let mut free = self.free.lock().unwrap();
        if free.len() < MAX_POOLED {
            free.push(msg);
        }
    }

    /// Build a queued low-priority inbound message from raw text.
    pub fn msg_from_text(&self, conn_uuid: &str, address: &str, text: &str) -> Msg {
        let mut msg = self.acquire();
        msg.conn_uuid.push_str(conn_uuid);
        msg.address.push_str(address);
        msg.text.push_str(text);
        msg.priority = Priority::Low;
        msg.status = Status::Queued;
        msg.created = Utc::now();
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_after_release_hands_back_a_cleared_msg() {
        let pool = MsgPool::new();
        let mut msg = pool.acquire();
        msg.id = 42;
        msg.text.push_str("leftover");
        msg.status = Status::Sent;
        pool.release(msg);

        let msg = pool.acquire();
        assert_eq!(msg, Msg::default());
    }

    #[test]
    fn msg_from_text_is_queued_and_low_priority() {
        let pool = MsgPool::new();
        let msg = pool.msg_from_text("conn-1", "friend", "echo: hi");
        assert_eq!(msg.id, 0);
        assert_eq!(msg.conn_uuid, "conn-1");
        assert_eq!(msg.address, "friend");
        assert_eq!(msg.text, "echo: hi");
        assert_eq!(msg.priority, Priority::Low);
        assert_eq!(msg.status, Status::Queued);
        assert!(msg.finished.is_none());
    }
}
