//! HTTP forwarder receiver.
//!
//! Serializes each inbound message to JSON and POSTs it to the connection's
//! configured `url`. 200 and 201 count as success; anything else is recorded
//! in the message log. Either way the message advances to handled — retries
//! are not part of this pipeline.

use super::{NextJob, next_job};
use crate::dispatcher::{Dispatcher, WorkerHandle};
use crate::engine::{EngineError, SharedStore};
use courier_core::{Connection, Msg, MsgPool};
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpForwarder {
    conn_uuid: String,
    idx: usize,
    url: String,
    client: reqwest::Client,
    store: SharedStore,
    pool: Arc<MsgPool>,
    ready: mpsc::Sender<WorkerHandle>,
    handle: WorkerHandle,
    work: mpsc::Receiver<u64>,
    done: watch::Receiver<bool>,
}

impl HttpForwarder {
    pub fn new(
        idx: usize,
        connection: &Connection,
        dispatcher: &Dispatcher,
        store: SharedStore,
        pool: Arc<MsgPool>,
        done: watch::Receiver<bool>,
    ) -> Result<Self, EngineError> {
        let url = connection
            .receivers
            .config
            .get("url")
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                EngineError::InvalidConfiguration(
                    "http receivers require a `url` config entry".to_owned(),
                )
            })?
            .clone();

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EngineError::InvalidConfiguration(format!("HTTP client error: {e}")))?;

        let (handle, work) = WorkerHandle::channel(idx);
        Ok(HttpForwarder {
            conn_uuid: connection.uuid.clone(),
            idx,
            url,
            client,
            store,
            pool,
            ready: dispatcher.ready_receivers.clone(),
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
        debug!(conn = %self.conn_uuid, worker = self.idx, "http forwarder exiting");
    }

    async fn process(&mut self, id: u64) -> bool {
        let loaded = { self.store.lock().await.get_msg(&self.conn_uuid, id) };
        let mut msg = match loaded {
            Ok(msg) => msg,
            Err(e) => {
                warn!(conn = %self.conn_uuid, worker = self.idx, id, error = %e, "failed to load msg");
                return true;
            }
        };

        let msg_log = match self.forward(&msg, id).await {
            Some(log) => log,
            None => {
                // Shutdown mid-POST; the message stays in the inbox.
                self.pool.release(msg);
                return false;
            }
        };

        let marked = { self.store.lock().await.mark_handled(&mut msg, &msg_log) };
        match marked {
            Ok(()) => info!(conn = %self.conn_uuid, worker = self.idx, id, "handled msg"),
            Err(e) => {
                warn!(conn = %self.conn_uuid, worker = self.idx, id, error = %e, "failed to mark msg handled");
            }
        }
        self.pool.release(msg);
        true
    }

    /// POST the message to the receiver URL and describe the outcome for the
    /// message log. Returns None if shutdown interrupted the request.
    async fn forward(&mut self, msg: &Msg, id: u64) -> Option<String> {
        let body = match serde_json::to_vec(msg) {
            Ok(body) => body,
            Err(e) => return Some(format!("error encoding msg ({id}): {e}")),
        };

        let request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);

        let response = tokio::select! {
            biased;
            _ = self.done.changed() => return None,
            response = request.send() => response,
        };

        Some(match response {
            Err(e) => format!("error posting msg ({id}): {e}"),
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                if status == StatusCode::OK || status == StatusCode::CREATED {
                    format!("status: {status}\n\n{body}")
                } else {
                    format!("error posting msg ({id}), received status {status}: {body}")
                }
            }
        })
    }
}
