//! Per-connection supervisor.
//!
//! A [`ConnectionEngine`] owns one dispatcher task and the configured number
//! of sender and receiver tasks. Construction validates every worker's
//! configuration before anything is spawned, so a bad connection cannot leak
//! tasks. `stop()` flips the done signal and waits for every task to exit.

use crate::config::TwitterAppConfig;
use crate::dispatcher::Dispatcher;
use crate::workers::{EchoSender, HttpForwarder, ReceiverWorker, SenderWorker, TwitterSender};
use courier_core::connection::{RECEIVER_HTTP, SENDER_ECHO, SENDER_TWITTER};
use courier_core::{Bucket, Connection, MsgPool, Store, StoreResult};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// The store handle shared by the control API, engines, and workers. Writes
/// serialise through the mutex; atomicity comes from the store's own
/// transactions.
pub type SharedStore = Arc<Mutex<Store>>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("unsupported sender type `{0}`")]
    UnsupportedSenderType(String),
    #[error("unsupported receiver type `{0}`")]
    UnsupportedReceiverType(String),
}

pub struct ConnectionEngine {
    pub connection: Connection,
    store: SharedStore,
    outgoing: mpsc::Sender<u64>,
    incoming: mpsc::Sender<u64>,
    done: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConnectionEngine {
    /// Build and start the engine for one connection: dispatcher first, then
    /// every validated worker.
    pub fn start(
        connection: Connection,
        store: SharedStore,
        pool: Arc<MsgPool>,
        twitter: Option<&TwitterAppConfig>,
    ) -> Result<Self, EngineError> {
        let nsenders = connection.senders.count as usize;
        let nreceivers = connection.receivers.count as usize;

        let (done, done_rx) = watch::channel(false);
        let (dispatcher, dispatcher_task) = Dispatcher::new(nsenders, nreceivers, done_rx.clone());

        // Construct (and validate) every worker before spawning anything.
        let mut senders: Vec<SenderWorker> = Vec::with_capacity(nsenders);
        match connection.senders.kind.as_str() {
            SENDER_ECHO => {
                for idx in 0..nsenders {
                    senders.push(SenderWorker::Echo(EchoSender::new(
                        idx,
                        &connection,
                        &dispatcher,
                        store.clone(),
                        pool.clone(),
                        done_rx.clone(),
                    )?));
                }
            }
            SENDER_TWITTER => {
                if twitter.is_none() {
                    return Err(EngineError::InvalidConfiguration(
                        "twitter senders require the [twitter] settings section".to_owned(),
                    ));
                }
                for idx in 0..nsenders {
                    let (sender, stream) = TwitterSender::new(
                        idx,
                        &connection,
                        &dispatcher,
                        store.clone(),
                        pool.clone(),
                        done_rx.clone(),
                    )?;
                    senders.push(SenderWorker::Twitter(sender, stream));
                }
            }
            other => return Err(EngineError::UnsupportedSenderType(other.to_owned())),
        }

        let mut receivers: Vec<ReceiverWorker> = Vec::with_capacity(nreceivers);
        match connection.receivers.kind.as_str() {
            RECEIVER_HTTP => {
                for idx in 0..nreceivers {
                    receivers.push(ReceiverWorker::Http(HttpForwarder::new(
                        idx,
                        &connection,
                        &dispatcher,
                        store.clone(),
                        pool.clone(),
                        done_rx.clone(),
                    )?));
                }
            }
            other => return Err(EngineError::UnsupportedReceiverType(other.to_owned())),
        }

        // All construction succeeded; start everything.
        let mut tasks = Vec::with_capacity(1 + nsenders * 2 + nreceivers);
        tasks.push(dispatcher_task.spawn());
        for sender in senders {
            sender.spawn(&mut tasks);
        }
        for receiver in receivers {
            receiver.spawn(&mut tasks);
        }

        Ok(ConnectionEngine {
            connection,
            store,
            outgoing: dispatcher.outgoing.clone(),
            incoming: dispatcher.incoming.clone(),
            done,
            tasks,
        })
    }

    /// A clone of the outgoing pipe, for the ingress path.
    pub fn outgoing(&self) -> mpsc::Sender<u64> {
        self.outgoing.clone()
    }

    /// Replay persisted outbox and inbox ids into the dispatcher. Called once
    /// after start when the connection may have a backlog from a previous
    /// process.
    pub async fn drain_backlog(&self) -> StoreResult<(usize, usize)> {
        let uuid = &self.connection.uuid;
        let (outgoing_ids, incoming_ids) = {
            let store = self.store.lock().await;
            (
                store.bucket_keys(uuid, Bucket::Outbox)?,
                store.bucket_keys(uuid, Bucket::Inbox)?,
            )
        };

        for &id in &outgoing_ids {
            if self.outgoing.send(id).await.is_err() {
                break;
            }
        }
        for &id in &incoming_ids {
            if self.incoming.send(id).await.is_err() {
                break;
            }
        }

        Ok((outgoing_ids.len(), incoming_ids.len()))
    }

    /// Signal shutdown and wait for the dispatcher and every worker to exit.
    pub async fn stop(self) {
        let _ = self.done.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!(conn = %self.connection.uuid, "connection engine stopped");
    }
}

// ---------------------------------------------------------------------------
// Process-wide startup / shutdown over the engine map
// ---------------------------------------------------------------------------

/// Start an engine for every persisted connection and replay its backlog.
///
/// A connection whose configuration can no longer be constructed (e.g. an
/// unknown worker type) is skipped with an error log; the rest of the gateway
/// keeps serving.
pub async fn start_persisted_engines(state: &crate::control_api::AppState) -> StoreResult<usize> {
    let connections = { state.store.lock().await.load_all_connections()? };

    let mut started = 0;
    for connection in connections {
        let uuid = connection.uuid.clone();
        match ConnectionEngine::start(
            connection,
            state.store.clone(),
            state.pool.clone(),
            state.twitter.as_ref(),
        ) {
            Ok(engine) => {
                match engine.drain_backlog().await {
                    Ok((outgoing, incoming)) => {
                        info!(conn = %uuid, outgoing, incoming, "connection engine started");
                    }
                    Err(e) => warn!(conn = %uuid, error = %e, "failed to replay backlog"),
                }
                state.engines.write().await.insert(uuid, engine);
                started += 1;
            }
            Err(e) => {
                error!(conn = %uuid, error = %e, "skipping connection with unusable configuration");
            }
        }
    }
    Ok(started)
}

/// Stop every running engine. Used on gateway shutdown.
pub async fn stop_all_engines(state: &crate::control_api::AppState) {
    let engines: Vec<ConnectionEngine> = {
        let mut map = state.engines.write().await;
        map.drain().map(|(_, engine)| engine).collect()
    };
    for engine in engines {
        engine.stop().await;
    }
}
