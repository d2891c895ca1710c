//! Per-connection matcher between pending message ids and ready workers.
//!
//! The dispatcher is a single task: ids needing a sender arrive on `outgoing`,
//! ids needing a receiver on `incoming`, and workers advertise availability on
//! the two ready pipes. After every event the dispatcher greedily pairs the
//! smallest pending id with the earliest-registered ready worker and hands the
//! id over on that worker's private work pipe. Workers never compete for work.
//!
//! All pending/ready state is owned by the dispatcher task, so no locks are
//! involved anywhere in the matching path.

use courier_core::PriorityQueue;
use std::collections::VecDeque;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// Capacity of the outgoing/incoming id pipes. Ingress blocks when the
/// dispatcher falls this far behind.
const PENDING_PIPE_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Worker handle
// ---------------------------------------------------------------------------

/// The dispatcher's view of a worker: an index for logging and the private
/// pipe work is handed over on.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    idx: usize,
    work: mpsc::Sender<u64>,
}

impl WorkerHandle {
    /// Create a handle and the matching work receiver for one worker.
    ///
    /// The pipe holds a single id: a worker only receives work after
    /// advertising readiness, so there is never more than one hand-off in
    /// flight.
    pub fn channel(idx: usize) -> (WorkerHandle, mpsc::Receiver<u64>) {
        let (work, work_rx) = mpsc::channel(1);
        (WorkerHandle { idx, work }, work_rx)
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    async fn deliver(&self, id: u64) -> Result<(), mpsc::error::SendError<u64>> {
        self.work.send(id).await
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Send-side handles for one connection's dispatcher.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    pub outgoing: mpsc::Sender<u64>,
    pub incoming: mpsc::Sender<u64>,
    pub ready_senders: mpsc::Sender<WorkerHandle>,
    pub ready_receivers: mpsc::Sender<WorkerHandle>,
}

/// The receive side, consumed by the dispatcher task.
pub struct DispatcherTask {
    outgoing_rx: mpsc::Receiver<u64>,
    incoming_rx: mpsc::Receiver<u64>,
    senders_rx: mpsc::Receiver<WorkerHandle>,
    receivers_rx: mpsc::Receiver<WorkerHandle>,
    done: watch::Receiver<bool>,
}

impl Dispatcher {
    /// Build the pipe pair for a connection with the given worker counts.
    ///
    /// Ready pipes are sized to the worker count so advertising readiness
    /// never blocks.
    pub fn new(
        nsenders: usize,
        nreceivers: usize,
        done: watch::Receiver<bool>,
    ) -> (Dispatcher, DispatcherTask) {
        let (outgoing, outgoing_rx) = mpsc::channel(PENDING_PIPE_CAPACITY);
        let (incoming, incoming_rx) = mpsc::channel(PENDING_PIPE_CAPACITY);
        let (ready_senders, senders_rx) = mpsc::channel(nsenders.max(1));
        let (ready_receivers, receivers_rx) = mpsc::channel(nreceivers.max(1));
        (
            Dispatcher {
                outgoing,
                incoming,
                ready_senders,
                ready_receivers,
            },
            DispatcherTask {
                outgoing_rx,
                incoming_rx,
                senders_rx,
                receivers_rx,
                done,
            },
        )
    }
}

impl DispatcherTask {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut pending_outgoing = PriorityQueue::new();
        let mut pending_incoming = PriorityQueue::new();
        let mut ready_senders: VecDeque<WorkerHandle> = VecDeque::new();
        let mut ready_receivers: VecDeque<WorkerHandle> = VecDeque::new();

        loop {
            tokio::select! {
                biased;
                changed = self.done.changed() => {
                    if changed.is_err() || *self.done.borrow() {
                        break;
                    }
                }
                Some(id) = self.outgoing_rx.recv() => pending_outgoing.insert(id),
                Some(handle) = self.senders_rx.recv() => ready_senders.push_back(handle),
                Some(id) = self.incoming_rx.recv() => pending_incoming.insert(id),
                Some(handle) = self.receivers_rx.recv() => ready_receivers.push_back(handle),
                else => break,
            }

            match_pending(&mut pending_outgoing, &mut ready_senders).await;
            match_pending(&mut pending_incoming, &mut ready_receivers).await;
        }

        debug!("dispatcher exiting");
    }
}

/// Pair pending ids with ready workers until one side runs dry.
async fn match_pending(pending: &mut PriorityQueue, ready: &mut VecDeque<WorkerHandle>) {
    while !pending.is_empty() && !ready.is_empty() {
        let (Some(id), Some(worker)) = (pending.pop(), ready.pop_front()) else {
            break;
        };
        if worker.deliver(id).await.is_err() {
            // The worker already exited (shutdown). The id is still durable
            // in its bucket and is replayed on the next start.
            debug!(id, worker = worker.idx(), "worker gone, dropping hand-off");
        }
    }
}
