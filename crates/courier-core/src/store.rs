//! Durable SQLite store for connections and messages.
//!
//! # Layout
//! - `connections`: uuid → serialized connection.
//! - `msgs`: (conn_uuid, id) → canonical serialized message.
//! - `bucket_entries`: (conn_uuid, bucket, id) → queued-at timestamp; the
//!   outbox / sent / inbox / handled state buckets.
//! - `msg_seq`: per-connection monotonic id counter.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, foreign_keys=ON.
//! PRAGMA integrity_check runs at open; returns error if it fails.
//!
//! Every mutating operation runs inside one transaction: id minting, the
//! canonical write, and the bucket move commit or roll back together, so a
//! message's status and its bucket can never disagree.

use crate::connection::{Connection, ConnectionStatus};
use crate::msg::{LOW_PRIORITY_MASK, Msg, Priority, Status};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use std::path::Path;
use thiserror::Error;

const SCHEMA_SQL: &str = include_str!("storage/schema.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Integrity: {0}")]
    IntegrityCheckFailed(String),
    #[error("no connection with uuid {0}")]
    MissingConnection(String),
    #[error("no message with id {0}")]
    MissingMessage(u64),
    #[error("invalid bucket key: expected 8 bytes, got {0}")]
    InvalidKey(usize),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The four state buckets a message id can be indexed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Outbox,
    Sent,
    Inbox,
    Handled,
}

impl Bucket {
    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::Outbox => "outbox",
            Bucket::Sent => "sent",
            Bucket::Inbox => "inbox",
            Bucket::Handled => "handled",
        }
    }
}

pub struct Store {
    conn: rusqlite::Connection,
}

impl Store {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = rusqlite::Connection::open(path)?;
        let store = Store { conn };
        store.apply_pragmas()?;
        store.integrity_check()?;
        store.apply_schema()?;
        Ok(store)
    }

    /// In-memory store, for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        let store = Store { conn };
        store.apply_pragmas()?;
        store.apply_schema()?;
        Ok(store)
    }

    /// Release the underlying database handle.
    pub fn close(self) -> StoreResult<()> {
        self.conn.close().map_err(|(_, e)| StoreError::Sqlite(e))
    }

    fn apply_pragmas(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(())
    }

    fn integrity_check(&self) -> StoreResult<()> {
        let result: String = self
            .conn
            .pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if result != "ok" {
            return Err(StoreError::IntegrityCheckFailed(result));
        }
        Ok(())
    }

    fn apply_schema(&self) -> StoreResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Persist a connection and make sure its id counter exists. Idempotent;
    /// re-saving never resets the counter.
    pub fn save_connection(&mut self, connection: &Connection) -> StoreResult<()> {
        let body = serde_json::to_string(connection)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO connections (uuid, body) VALUES (?1, ?2)
             ON CONFLICT(uuid) DO UPDATE SET body = excluded.body",
            params![connection.uuid, body],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO msg_seq (conn_uuid, next_seq) VALUES (?1, 1)",
            params![connection.uuid],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn load_connection(&self, uuid: &str) -> StoreResult<Connection> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM connections WHERE uuid = ?1",
                params![uuid],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(StoreError::MissingConnection(uuid.to_owned())),
        }
    }

    pub fn load_all_connections(&self) -> StoreResult<Vec<Connection>> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM connections ORDER BY uuid")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut connections = Vec::new();
        for body in rows {
            connections.push(serde_json::from_str(&body?)?);
        }
        Ok(connections)
    }

    /// Remove a connection's metadata and its entire message tree. Callers
    /// must have stopped any running engine for it first.
    pub fn delete_connection(&mut self, connection: &Connection) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM connections WHERE uuid = ?1",
            params![connection.uuid],
        )?;
        tx.execute(
            "DELETE FROM msgs WHERE conn_uuid = ?1",
            params![connection.uuid],
        )?;
        tx.execute(
            "DELETE FROM bucket_entries WHERE conn_uuid = ?1",
            params![connection.uuid],
        )?;
        tx.execute(
            "DELETE FROM msg_seq WHERE conn_uuid = ?1",
            params![connection.uuid],
        )?;
        tx.commit()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Store a new outbound message: mints the id on first write and indexes
    /// it under the outbox.
    pub fn write_to_outbox(&mut self, msg: &mut Msg) -> StoreResult<()> {
        msg.status = Status::Queued;
        if msg.created == DateTime::UNIX_EPOCH {
            msg.created = Utc::now();
        }
        self.save_to_bucket(msg, Bucket::Outbox, None)
    }

    /// Store a new inbound message: mints the id on first write and indexes
    /// it under the inbox.
    pub fn write_to_inbox(&mut self, msg: &mut Msg) -> StoreResult<()> {
        msg.status = Status::Queued;
        if msg.created == DateTime::UNIX_EPOCH {
            msg.created = Utc::now();
        }
        self.save_to_bucket(msg, Bucket::Inbox, None)
    }

    /// Mark an outbound message terminal: updates the canonical record and
    /// moves its index entry from outbox to sent, atomically.
    pub fn mark_sent(&mut self, msg: &mut Msg, log: &str) -> StoreResult<()> {
        msg.status = Status::Sent;
        msg.finished = Some(Utc::now());
        msg.log.clear();
        msg.log.push_str(log);
        self.save_to_bucket(msg, Bucket::Sent, Some(Bucket::Outbox))
    }

    /// Mark an inbound message terminal: inbox → handled.
    pub fn mark_handled(&mut self, msg: &mut Msg, log: &str) -> StoreResult<()> {
        msg.status = Status::Handled;
        msg.finished = Some(Utc::now());
        msg.log.clear();
        msg.log.push_str(log);
        self.save_to_bucket(msg, Bucket::Handled, Some(Bucket::Inbox))
    }

    fn save_to_bucket(
        &mut self,
        msg: &mut Msg,
        add: Bucket,
        remove: Option<Bucket>,
    ) -> StoreResult<()> {
        let tx = self.conn.transaction()?;

        // Mint an id on first write: next sequence value, with the high bit
        // set for low priority.
        if msg.id == 0 {
            let next: Option<i64> = tx
                .query_row(
                    "SELECT next_seq FROM msg_seq WHERE conn_uuid = ?1",
                    params![msg.conn_uuid],
                    |row| row.get(0),
                )
                .optional()?;
            let next = next.ok_or_else(|| StoreError::MissingConnection(msg.conn_uuid.clone()))?;
            tx.execute(
                "UPDATE msg_seq SET next_seq = next_seq + 1 WHERE conn_uuid = ?1",
                params![msg.conn_uuid],
            )?;

            let mut id = next as u64;
            if msg.priority == Priority::Low {
                id |= LOW_PRIORITY_MASK;
            }
            msg.id = id;
        }

        let key = msg.id.to_be_bytes();
        let body = serde_json::to_string(msg)?;

        tx.execute(
            "INSERT INTO msgs (conn_uuid, id, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(conn_uuid, id) DO UPDATE SET body = excluded.body",
            params![msg.conn_uuid, &key[..], body],
        )?;

        tx.execute(
            "INSERT OR REPLACE INTO bucket_entries (conn_uuid, bucket, id, queued_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                msg.conn_uuid,
                add.as_str(),
                &key[..],
                Utc::now().timestamp_millis()
            ],
        )?;

        if let Some(source) = remove {
            tx.execute(
                "DELETE FROM bucket_entries WHERE conn_uuid = ?1 AND bucket = ?2 AND id = ?3",
                params![msg.conn_uuid, source.as_str(), &key[..]],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_msg(&self, conn_uuid: &str, id: u64) -> StoreResult<Msg> {
        let key = id.to_be_bytes();
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM msgs WHERE conn_uuid = ?1 AND id = ?2",
                params![conn_uuid, &key[..]],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(StoreError::MissingMessage(id)),
        }
    }

    // -----------------------------------------------------------------------
    // Bucket queries
    // -----------------------------------------------------------------------

    /// All ids in a bucket, ascending. Because ids are stored big-endian,
    /// the key order is the unsigned numeric order — high-priority ids first,
    /// FIFO within each band.
    pub fn bucket_keys(&self, conn_uuid: &str, bucket: Bucket) -> StoreResult<Vec<u64>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM bucket_entries WHERE conn_uuid = ?1 AND bucket = ?2 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![conn_uuid, bucket.as_str()], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;
        let mut keys = Vec::new();
        for key in rows {
            let key = key?;
            let bytes: [u8; 8] = key
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::InvalidKey(key.len()))?;
            keys.push(u64::from_be_bytes(bytes));
        }
        Ok(keys)
    }

    pub fn bucket_size(&self, conn_uuid: &str, bucket: Bucket) -> StoreResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM bucket_entries WHERE conn_uuid = ?1 AND bucket = ?2",
            params![conn_uuid, bucket.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Bucket sizes for the connection-status payload.
    pub fn connection_status(&self, conn_uuid: &str) -> StoreResult<ConnectionStatus> {
        Ok(ConnectionStatus {
            outgoing_queued: self.bucket_size(conn_uuid, Bucket::Outbox)?,
            incoming_queued: self.bucket_size(conn_uuid, Bucket::Inbox)?,
            sent_results: self.bucket_size(conn_uuid, Bucket::Sent)?,
            handled_results: self.bucket_size(conn_uuid, Bucket::Handled)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MsgPool;
    use tempfile::NamedTempFile;

    fn make_store() -> (Store, NamedTempFile) {
        let file = NamedTempFile::new().expect("temp file");
        let store = Store::open(file.path()).expect("open store");
        (store, file)
    }

    fn saved_connection(store: &mut Store) -> Connection {
        let mut conn: Connection = serde_json::from_str(
            r#"{
                "senders":   { "type": "echo", "count": 1, "config": {} },
                "receivers": { "type": "http", "count": 1, "config": { "url": "http://127.0.0.1:9/sink" } }
            }"#,
        )
        .unwrap();
        conn.validate_new().unwrap();
        store.save_connection(&conn).unwrap();
        conn
    }

    fn queued_msg(conn_uuid: &str, text: &str, priority: Priority) -> Msg {
        let mut msg = MsgPool::new().msg_from_text(conn_uuid, "someone", text);
        msg.priority = priority;
        msg
    }

    /// The buckets currently holding `id` — the exclusivity invariant says
    /// this is always exactly one for a stored message.
    fn buckets_containing(store: &Store, conn_uuid: &str, id: u64) -> Vec<Bucket> {
        [Bucket::Outbox, Bucket::Sent, Bucket::Inbox, Bucket::Handled]
            .into_iter()
            .filter(|&b| store.bucket_keys(conn_uuid, b).unwrap().contains(&id))
            .collect()
    }

    #[test]
    fn save_and_load_connection_round_trip() {
        let (mut store, _file) = make_store();
        let conn = saved_connection(&mut store);

        let loaded = store.load_connection(&conn.uuid).unwrap();
        assert_eq!(loaded, conn);

        // Idempotent re-save.
        store.save_connection(&conn).unwrap();
        assert_eq!(store.load_all_connections().unwrap().len(), 1);
    }

    #[test]
    fn load_connection_on_unknown_uuid_is_missing() {
        let (store, _file) = make_store();
        assert!(matches!(
            store.load_connection("nope"),
            Err(StoreError::MissingConnection(u)) if u == "nope"
        ));
    }

    #[test]
    fn write_to_outbox_mints_ids_with_the_priority_bit() {
        let (mut store, _file) = make_store();
        let conn = saved_connection(&mut store);

        let mut high = queued_msg(&conn.uuid, "first", Priority::High);
        let mut low = queued_msg(&conn.uuid, "second", Priority::Low);
        let mut high2 = queued_msg(&conn.uuid, "third", Priority::High);
        store.write_to_outbox(&mut high).unwrap();
        store.write_to_outbox(&mut low).unwrap();
        store.write_to_outbox(&mut high2).unwrap();

        assert_eq!(high.id, 1);
        assert_eq!(low.id, LOW_PRIORITY_MASK | 2);
        assert_eq!(high2.id, 3);
        assert_eq!(high.status, Status::Queued);
        assert!(high.finished.is_none());

        // Keys come back in dispatch order: high band first.
        assert_eq!(
            store.bucket_keys(&conn.uuid, Bucket::Outbox).unwrap(),
            vec![1, 3, LOW_PRIORITY_MASK | 2]
        );
    }

    #[test]
    fn write_to_outbox_without_a_saved_connection_fails() {
        let (mut store, _file) = make_store();
        let mut msg = queued_msg("ghost", "hi", Priority::High);
        assert!(matches!(
            store.write_to_outbox(&mut msg),
            Err(StoreError::MissingConnection(_))
        ));
        assert_eq!(msg.id, 0);
    }

    #[test]
    fn mark_sent_moves_the_message_atomically() {
        let (mut store, _file) = make_store();
        let conn = saved_connection(&mut store);

        let mut msg = queued_msg(&conn.uuid, "hi", Priority::High);
        store.write_to_outbox(&mut msg).unwrap();
        assert_eq!(buckets_containing(&store, &conn.uuid, msg.id), vec![Bucket::Outbox]);

        store.mark_sent(&mut msg, "delivered ok").unwrap();

        assert_eq!(store.bucket_size(&conn.uuid, Bucket::Outbox).unwrap(), 0);
        assert_eq!(store.bucket_size(&conn.uuid, Bucket::Sent).unwrap(), 1);
        assert_eq!(buckets_containing(&store, &conn.uuid, msg.id), vec![Bucket::Sent]);

        let stored = store.get_msg(&conn.uuid, msg.id).unwrap();
        assert_eq!(stored.status, Status::Sent);
        assert_eq!(stored.log, "delivered ok");
        assert!(stored.finished.unwrap() >= stored.created);
    }

    #[test]
    fn mark_handled_moves_inbox_to_handled() {
        let (mut store, _file) = make_store();
        let conn = saved_connection(&mut store);

        let mut msg = queued_msg(&conn.uuid, "echo: hi", Priority::Low);
        store.write_to_inbox(&mut msg).unwrap();
        assert_eq!(buckets_containing(&store, &conn.uuid, msg.id), vec![Bucket::Inbox]);

        store.mark_handled(&mut msg, "status: 200").unwrap();

        assert_eq!(buckets_containing(&store, &conn.uuid, msg.id), vec![Bucket::Handled]);
        let stored = store.get_msg(&conn.uuid, msg.id).unwrap();
        assert_eq!(stored.status, Status::Handled);
        assert_eq!(stored.log, "status: 200");
    }

    #[test]
    fn ids_are_assigned_exactly_once() {
        let (mut store, _file) = make_store();
        let conn = saved_connection(&mut store);

        let mut msg = queued_msg(&conn.uuid, "hi", Priority::Low);
        store.write_to_outbox(&mut msg).unwrap();
        let id = msg.id;
        store.mark_sent(&mut msg, "done").unwrap();
        assert_eq!(msg.id, id);
        assert_eq!(store.bucket_keys(&conn.uuid, Bucket::Sent).unwrap(), vec![id]);
    }

    #[test]
    fn get_msg_on_unknown_id_is_missing() {
        let (mut store, _file) = make_store();
        let conn = saved_connection(&mut store);
        assert!(matches!(
            store.get_msg(&conn.uuid, 99),
            Err(StoreError::MissingMessage(99))
        ));
    }

    #[test]
    fn connection_status_reports_all_four_buckets() {
        let (mut store, _file) = make_store();
        let conn = saved_connection(&mut store);

        let mut out = queued_msg(&conn.uuid, "a", Priority::High);
        store.write_to_outbox(&mut out).unwrap();
        let mut done = queued_msg(&conn.uuid, "b", Priority::High);
        store.write_to_outbox(&mut done).unwrap();
        store.mark_sent(&mut done, "ok").unwrap();
        let mut incoming = queued_msg(&conn.uuid, "c", Priority::Low);
        store.write_to_inbox(&mut incoming).unwrap();

        let status = store.connection_status(&conn.uuid).unwrap();
        assert_eq!(
            status,
            ConnectionStatus {
                outgoing_queued: 1,
                incoming_queued: 1,
                sent_results: 1,
                handled_results: 0,
            }
        );
    }

    #[test]
    fn operations_on_one_connection_do_not_touch_another() {
        let (mut store, _file) = make_store();
        let conn_a = saved_connection(&mut store);
        let conn_b = saved_connection(&mut store);

        let mut a1 = queued_msg(&conn_a.uuid, "a1", Priority::High);
        store.write_to_outbox(&mut a1).unwrap();
        let mut b1 = queued_msg(&conn_b.uuid, "b1", Priority::High);
        store.write_to_outbox(&mut b1).unwrap();

        // Sequences are per connection.
        assert_eq!(a1.id, 1);
        assert_eq!(b1.id, 1);

        store.mark_sent(&mut a1, "ok").unwrap();
        assert_eq!(store.bucket_size(&conn_b.uuid, Bucket::Outbox).unwrap(), 1);
        assert_eq!(store.bucket_size(&conn_b.uuid, Bucket::Sent).unwrap(), 0);
        assert!(matches!(
            store.get_msg(&conn_b.uuid, 2),
            Err(StoreError::MissingMessage(2))
        ));
    }

    #[test]
    fn delete_connection_destroys_the_whole_tree() {
        let (mut store, _file) = make_store();
        let conn = saved_connection(&mut store);

        let mut msg = queued_msg(&conn.uuid, "hi", Priority::High);
        store.write_to_outbox(&mut msg).unwrap();

        store.delete_connection(&conn).unwrap();

        assert!(store.load_connection(&conn.uuid).is_err());
        assert!(store.get_msg(&conn.uuid, msg.id).is_err());
        assert_eq!(store.bucket_size(&conn.uuid, Bucket::Outbox).unwrap(), 0);

        // Re-saving starts a fresh sequence.
        store.save_connection(&conn).unwrap();
        let mut fresh = queued_msg(&conn.uuid, "again", Priority::High);
        store.write_to_outbox(&mut fresh).unwrap();
        assert_eq!(fresh.id, 1);
    }

    #[test]
    fn store_survives_reopen_with_ids_and_buckets_intact() {
        let file = NamedTempFile::new().unwrap();
        let conn = {
            let mut store = Store::open(file.path()).unwrap();
            let conn = saved_connection(&mut store);
            let mut high = queued_msg(&conn.uuid, "h", Priority::High);
            let mut low = queued_msg(&conn.uuid, "l", Priority::Low);
            store.write_to_outbox(&mut low).unwrap();
            store.write_to_outbox(&mut high).unwrap();
            store.close().unwrap();
            conn
        };

        let store = Store::open(file.path()).unwrap();
        assert_eq!(
            store.bucket_keys(&conn.uuid, Bucket::Outbox).unwrap(),
            vec![2, LOW_PRIORITY_MASK | 1]
        );
        assert_eq!(store.load_all_connections().unwrap().len(), 1);
    }
}
