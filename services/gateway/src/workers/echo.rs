//! Echo test sender.
//!
//! Completes every outbound message locally after a configurable synthetic
//! delay, then feeds an `echo: <text>` reply back through the connection as a
//! new inbound message. Useful for exercising the full pipeline without any
//! external platform.

use super::{NextJob, next_job};
use crate::dispatcher::{Dispatcher, WorkerHandle};
use crate::engine::{EngineError, SharedStore};
use courier_core::{Connection, MsgPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Sender config key: synthetic delay in milliseconds (default 0).
pub const PAUSE: &str = "pause";

pub struct EchoSender {
    conn_uuid: String,
    idx: usize,
    pause: Duration,
    store: SharedStore,
    pool: Arc<MsgPool>,
    ready: mpsc::Sender<WorkerHandle>,
    incoming: mpsc::Sender<u64>,
    handle: WorkerHandle,
    work: mpsc::Receiver<u64>,
    done: watch::Receiver<bool>,
}

impl EchoSender {
    pub fn new(
        idx: usize,
        connection: &Connection,
        dispatcher: &Dispatcher,
        store: SharedStore,
        pool: Arc<MsgPool>,
        done: watch::Receiver<bool>,
    ) -> Result<Self, EngineError> {
        let pause = match connection.senders.config.get(PAUSE) {
            None => Duration::ZERO,
            Some(raw) => {
                let millis = raw.parse::<u64>().map_err(|_| {
                    EngineError::InvalidConfiguration(format!(
                        "`pause` must be a non-negative integer, was `{raw}`"
                    ))
                })?;
                Duration::from_millis(millis)
            }
        };

        let (handle, work) = WorkerHandle::channel(idx);
        Ok(EchoSender {
            conn_uuid: connection.uuid.clone(),
            idx,
            pause,
            store,
            pool,
            ready: dispatcher.ready_senders.clone(),
            incoming: dispatcher.incoming.clone(),
            handle,
            work,
            done,
        })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        loop {
            match next_job(&self.ready, &self.handle, &mut self.work, &mut self.done).await {
                NextJob::Shutdown => break,
                NextJob::Work(id) => {
                    if !self.process(id).await {
                        break;
                    }
                }
            }
        }
        debug!(conn = %self.conn_uuid, worker = self.idx, "echo sender exiting");
    }

    /// Handle one outbound message. Returns false when shutdown was observed
    /// mid-attempt; the message then stays queued for the next start.
    async fn process(&mut self, id: u64) -> bool {
        let loaded = { self.store.lock().await.get_msg(&self.conn_uuid, id) };
        let mut msg = match loaded {
            Ok(msg) => msg,
            Err(e) => {
                warn!(conn = %self.conn_uuid, worker = self.idx, id, error = %e, "failed to load msg");
                return true;
            }
        };

        // Synthetic transmission delay.
        if !self.pause.is_zero() {
            tokio::select! {
                biased;
                _ = self.done.changed() => {
                    self.pool.release(msg);
                    return false;
                }
                () = tokio::time::sleep(self.pause) => {}
            }
        }

        let msg_log = format!("delivered locally by echo sender {}", self.idx);
        let marked = { self.store.lock().await.mark_sent(&mut msg, &msg_log) };
        match marked {
            Ok(()) => info!(conn = %self.conn_uuid, worker = self.idx, id, "sent msg"),
            Err(e) => {
                warn!(conn = %self.conn_uuid, worker = self.idx, id, error = %e, "failed to mark msg sent");
            }
        }

        // Feed the echo back through the connection as a new inbound message.
        let reply_text = format!("echo: {}", msg.text);
        let mut reply = self
            .pool
            .msg_from_text(&self.conn_uuid, &msg.address, &reply_text);
        self.pool.release(msg);

        let written = { self.store.lock().await.write_to_inbox(&mut reply) };
        match written {
            Ok(()) => {
                let reply_id = reply.id;
                self.pool.release(reply);
                tokio::select! {
                    biased;
                    _ = self.done.changed() => return false,
                    sent = self.incoming.send(reply_id) => {
                        if sent.is_err() {
                            debug!(conn = %self.conn_uuid, worker = self.idx, reply_id, "dispatcher gone, echo reply stays queued");
                        }
                    }
                }
            }
            Err(e) => {
                warn!(conn = %self.conn_uuid, worker = self.idx, id, error = %e, "failed to store echo reply");
                self.pool.release(reply);
            }
        }

        true
    }
}
