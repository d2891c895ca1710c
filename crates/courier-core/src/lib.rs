// courier-core: persistent message store, data model, and queue primitives
// shared by the gateway service and its tests.

pub mod connection;
pub mod msg;
pub mod pool;
pub mod queue;
pub mod store;

pub use connection::{Connection, ConnectionStatus, WorkerGroup};
pub use msg::{LOW_PRIORITY_MASK, Msg, Priority, Status};
pub use pool::MsgPool;
pub use queue::PriorityQueue;
pub use store::{Bucket, Store, StoreError, StoreResult};
