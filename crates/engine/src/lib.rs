//! Engine layer for mvstm
//!
//! This crate builds on the transaction core:
//! - Dispatchers: where callbacks and async work run
//! - Listeners and the notifier: change callbacks per object, ALL or COALESCE
//! - Async commits and transaction bodies with completion callbacks
//! - Replication: authority, replicator, transports and wire messages
//! - Configuration (`mvstm.toml`) and engine metrics
//! - `Stm`: the handle that wires all of the above

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod async_commit;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod listener;
pub mod notifier;
mod registry;
pub mod replication;
pub mod stm;

pub use async_commit::{
    callback_fn, commit_async, run_async, AsyncCallback, AsyncRunner, AsyncStats, Completion,
    RunOptions, RunOutcome,
};
pub use config::{DispatcherKind, StmConfig, CONFIG_FILE_NAME};
pub use coordinator::{StmCoordinator, StmMetrics};
pub use dispatcher::{
    inline_dispatcher, BackpressureError, Dispatcher, DispatcherStats, InlineDispatcher,
    PooledDispatcher, SerialQueue, Task, TaskPriority,
};
pub use listener::{
    Change, FieldListener, KeyListener, ListListener, Listener, ListenerId, ListenerRegistry,
};
pub use notifier::{Notifier, NotifierStats, Visitor};
pub use replication::{
    Authority, AuthorityStats, LoopbackTransport, Message, Peer, Receiver, Replicator,
    ReplicatorStats, Transport,
};
pub use stm::Stm;
