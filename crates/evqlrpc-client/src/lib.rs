//! Fan-out RPC dispatcher for the EventQL native transport.
//!
//! A [`Dispatcher`] takes a batch of [`Task`]s, each naming an ordered list of
//! candidate hosts, and runs them against the cluster from one async task.
//! Results are delivered to a [`TaskHandler`] as they arrive; an attempt that
//! breaks (connect failure, timeout, protocol error, retryable remote error)
//! moves the task to its next host.

mod config;
mod connection;
mod directory;
mod dispatcher;
mod handler;
mod pool;
mod task;

pub use config::{DispatcherConfig, PoolConfig};
pub use directory::{HostDirectory, HostEntry, StaticDirectory};
pub use dispatcher::{DispatchStats, Dispatcher};
pub use handler::{ChannelHandler, ResultAction, TaskEvent, TaskHandler};
pub use task::Task;
