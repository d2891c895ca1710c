//! Direct-message platform sender.
//!
//! Each worker runs two tasks sharing the connection's done signal: the
//! sender proper, which posts one direct message per outbound message, and a
//! stream task that polls the platform's DM events endpoint and injects new
//! incoming messages into the connection's inbox.
//!
//! Connection config: `access_token` and `access_token_secret` are required;
//! `api_base_url` overrides the platform endpoint (tests point it at a local
//! mock); `poll_interval_ms` tunes the stream task's cadence.

use super::{NextJob, next_job};
use crate::dispatcher::{Dispatcher, WorkerHandle};
use crate::engine::{EngineError, SharedStore};
use courier_core::{Connection, MsgPool};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const ACCESS_TOKEN: &str = "access_token";
pub const ACCESS_TOKEN_SECRET: &str = "access_token_secret";

const DEFAULT_API_BASE: &str = "https://api.twitter.com";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn required_config(connection: &Connection, key: &str) -> Result<String, EngineError> {
    connection
        .senders
        .config
        .get(key)
        .filter(|value| !value.is_empty())
        .cloned()
        .ok_or_else(|| {
            EngineError::InvalidConfiguration(format!("Missing required config field `{key}`"))
        })
}

pub struct TwitterSender {
    conn_uuid: String,
    idx: usize,
    api_base: String,
    token: String,
    client: reqwest::Client,
    store: SharedStore,
    pool: Arc<MsgPool>,
    ready: mpsc::Sender<WorkerHandle>,
    handle: WorkerHandle,
    work: mpsc::Receiver<u64>,
    done: watch::Receiver<bool>,
}

impl TwitterSender {
    /// Validate the worker config and build the sender plus its paired
    /// incoming-DM stream task. Nothing is spawned yet.
    pub fn new(
        idx: usize,
        connection: &Connection,
        dispatcher: &Dispatcher,
        store: SharedStore,
        pool: Arc<MsgPool>,
        done: watch::Receiver<bool>,
    ) -> Result<(TwitterSender, DmStreamTask), EngineError> {
        let token = required_config(connection, ACCESS_TOKEN)?;
        // The secret completes the credential pair; the platform rejects
        // tokens issued without one, so require it up front.
        required_config(connection, ACCESS_TOKEN_SECRET)?;

        let api_base = connection
            .senders
            .config
            .get("api_base_url")
            .filter(|url| !url.is_empty())
            .map_or_else(|| DEFAULT_API_BASE.to_owned(), |url| url.clone());

        let poll_interval = match connection.senders.config.get("poll_interval_ms") {
            None => DEFAULT_POLL_INTERVAL,
            Some(raw) => {
                let millis = raw.parse::<u64>().map_err(|_| {
                    EngineError::InvalidConfiguration(format!(
                        "`poll_interval_ms` must be a non-negative integer, was `{raw}`"
                    ))
                })?;
                Duration::from_millis(millis)
            }
        };

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EngineError::InvalidConfiguration(format!("HTTP client error: {e}")))?;

        let (handle, work) = WorkerHandle::channel(idx);
        let sender = TwitterSender {
            conn_uuid: connection.uuid.clone(),
            idx,
            api_base: api_base.clone(),
            token: token.clone(),
            client: client.clone(),
            store: store.clone(),
            pool: pool.clone(),
            ready: dispatcher.ready_senders.clone(),
            handle,
            work,
            done: done.clone(),
        };
        let stream = DmStreamTask {
            conn_uuid: connection.uuid.clone(),
            idx,
            api_base,
            token,
            poll_interval,
            client,
            store,
            pool,
            incoming: dispatcher.incoming.clone(),
            done,
        };
        Ok((sender, stream))
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
        debug!(conn = %self.conn_uuid, worker = self.idx, "twitter sender exiting");
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

        let url = format!(
            "{}/2/dm_conversations/with/{}/messages",
            self.api_base, msg.address
        );
        let payload = serde_json::json!({ "text": msg.text });
        let request = self.client.post(&url).bearer_auth(&self.token).json(&payload);

        let response = tokio::select! {
            biased;
            _ = self.done.changed() => {
                self.pool.release(msg);
                return false;
            }
            response = request.send() => response,
        };

        let msg_log = match response {
            Err(e) => format!("error sending DM ({id}): {e}"),
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                if status.is_success() {
                    format!("sent DM to {}, status {status}", msg.address)
                } else {
                    format!("error sending DM ({id}), received status {status}: {body}")
                }
            }
        };

        let marked = { self.store.lock().await.mark_sent(&mut msg, &msg_log) };
        match marked {
            Ok(()) => info!(conn = %self.conn_uuid, worker = self.idx, id, "sent msg"),
            Err(e) => {
                warn!(conn = %self.conn_uuid, worker = self.idx, id, error = %e, "failed to mark msg sent");
            }
        }
        self.pool.release(msg);
        true
    }
}

// ---------------------------------------------------------------------------
// Incoming DM stream
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DmEventsResponse {
    #[serde(default)]
    data: Vec<DmEvent>,
}

#[derive(Debug, Deserialize)]
struct DmEvent {
    id: String,
    event_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    sender_id: Option<String>,
}

/// Long-lived task that polls for incoming direct messages and writes them to
/// the connection's inbox.
pub struct DmStreamTask {
    conn_uuid: String,
    idx: usize,
    api_base: String,
    token: String,
    poll_interval: Duration,
    client: reqwest::Client,
    store: SharedStore,
    pool: Arc<MsgPool>,
    incoming: mpsc::Sender<u64>,
    done: watch::Receiver<bool>,
}

impl DmStreamTask {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        // Newest event id already observed. The first successful poll primes
        // the cursor without injecting anything, so restarting the gateway
        // does not replay the platform's whole DM history.
        let mut cursor: Option<String> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.done.changed() => break,
                () = tokio::time::sleep(self.poll_interval) => {}
            }

            let events = match self.poll_events().await {
                Some(Ok(events)) => events,
                Some(Err(e)) => {
                    warn!(conn = %self.conn_uuid, worker = self.idx, error = %e, "DM poll failed");
                    continue;
                }
                None => break,
            };

            let newest = events.first().map(|event| event.id.clone());
            let fresh: Vec<&DmEvent> = match &cursor {
                None => Vec::new(),
                Some(seen) => events.iter().take_while(|event| &event.id != seen).collect(),
            };

            // Events arrive newest-first; inject oldest-first.
            for event in fresh.into_iter().rev() {
                if event.event_type != "MessageCreate" {
                    continue;
                }
                let (Some(sender_id), Some(text)) = (&event.sender_id, &event.text) else {
                    continue;
                };
                info!(conn = %self.conn_uuid, worker = self.idx, from = %sender_id, "received DM");
                if !self.inject(sender_id, text).await {
                    return;
                }
            }

            if newest.is_some() {
                cursor = newest;
            }
        }
        debug!(conn = %self.conn_uuid, worker = self.idx, "DM stream exiting");
    }

    /// Fetch the latest DM events, newest first. None means shutdown.
    async fn poll_events(&mut self) -> Option<Result<Vec<DmEvent>, reqwest::Error>> {
        let url = format!("{}/2/dm_events", self.api_base);
        let request = self.client.get(&url).bearer_auth(&self.token);

        let response = tokio::select! {
            biased;
            _ = self.done.changed() => return None,
            response = request.send() => response,
        };

        Some(match response {
            Err(e) => Err(e),
            Ok(response) => match response.json::<DmEventsResponse>().await {
                Err(e) => Err(e),
                Ok(body) => Ok(body.data),
            },
        })
    }

    /// Store one incoming DM and hand it to the dispatcher. Returns false on
    /// shutdown.
    async fn inject(&mut self, sender_id: &str, text: &str) -> bool {
        let mut msg = self.pool.msg_from_text(&self.conn_uuid, sender_id, text);
        let written = { self.store.lock().await.write_to_inbox(&mut msg) };
        match written {
            Ok(()) => {
                let id = msg.id;
                self.pool.release(msg);
                tokio::select! {
                    biased;
                    _ = self.done.changed() => return false,
                    sent = self.incoming.send(id) => {
                        if sent.is_err() {
                            debug!(conn = %self.conn_uuid, worker = self.idx, id, "dispatcher gone, DM stays queued");
                        }
                    }
                }
            }
            Err(e) => {
                warn!(conn = %self.conn_uuid, worker = self.idx, error = %e, "failed to store incoming DM");
                self.pool.release(msg);
            }
        }
        true
    }
}
