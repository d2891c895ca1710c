//! Worker implementations for the closed set of sender/receiver types.
//!
//! Every worker follows the same protocol with its dispatcher: publish a
//! [`WorkerHandle`] on the ready pipe, then wait on the private work pipe or
//! the done signal. Readiness is always advertised *before* blocking on work,
//! so shutdown can never wedge the dispatcher.

use crate::dispatcher::WorkerHandle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub mod echo;
pub mod http;
pub mod twitter;

pub use echo::EchoSender;
pub use http::HttpForwarder;
pub use twitter::{DmStreamTask, TwitterSender};

/// A validated, not-yet-running sender.
pub enum SenderWorker {
    Echo(EchoSender),
    /// The platform sender pairs with a long-lived task reading incoming
    /// direct messages.
    Twitter(TwitterSender, DmStreamTask),
}

impl SenderWorker {
    pub fn spawn(self, tasks: &mut Vec<JoinHandle<()>>) {
        match self {
            SenderWorker::Echo(sender) => tasks.push(sender.spawn()),
            SenderWorker::Twitter(sender, stream) => {
                tasks.push(sender.spawn());
                tasks.push(stream.spawn());
            }
        }
    }
}

/// A validated, not-yet-running receiver.
pub enum ReceiverWorker {
    Http(HttpForwarder),
}

impl ReceiverWorker {
    pub fn spawn(self, tasks: &mut Vec<JoinHandle<()>>) {
        match self {
            ReceiverWorker::Http(receiver) => tasks.push(receiver.spawn()),
        }
    }
}

/// What a worker should do next.
pub(crate) enum NextJob {
    Work(u64),
    Shutdown,
}

/// One round of the worker protocol: advertise readiness, then wait for a
/// hand-off or shutdown.
pub(crate) async fn next_job(
    ready: &mpsc::Sender<WorkerHandle>,
    handle: &WorkerHandle,
    work: &mut mpsc::Receiver<u64>,
    done: &mut watch::Receiver<bool>,
) -> NextJob {
    // The done value latches true, so this check stays valid even after a
    // previous select already observed the change.
    if *done.borrow() {
        return NextJob::Shutdown;
    }
    if ready.send(handle.clone()).await.is_err() {
        return NextJob::Shutdown;
    }
    loop {
        tokio::select! {
            biased;
            changed = done.changed() => {
                if changed.is_err() || *done.borrow() {
                    return NextJob::Shutdown;
                }
            }
            maybe = work.recv() => {
                return match maybe {
                    Some(id) => NextJob::Work(id),
                    None => NextJob::Shutdown,
                };
            }
        }
    }
}
