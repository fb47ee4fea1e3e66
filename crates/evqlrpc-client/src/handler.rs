//! Callbacks through which the dispatcher reports task progress.
//!
//! The dispatcher calls the handler synchronously from its event loop, so
//! handlers must not block. Callers that want to process results on their own
//! tasks can use [`ChannelHandler`], which forwards every callback as a
//! [`TaskEvent`] over an unbounded channel.

use evqlrpc_common::transport::Frame;
use evqlrpc_common::{EvqlError, Result};
use tokio::sync::mpsc;

/// What the dispatcher should do after a result frame was delivered.
#[derive(Debug)]
pub enum ResultAction {
    /// Keep reading until the peer ends the exchange.
    Continue,
    /// Complete the task successfully now. The connection is closed rather
    /// than reused because the peer may still be streaming.
    Stop,
    /// Reject this host's answer. The connection is closed and the error goes
    /// through failover, so a retryable error moves the task to its next host.
    Fail(EvqlError),
}

/// Receives task lifecycle callbacks.
///
/// Every task gets exactly one [`on_task_done`](TaskHandler::on_task_done)
/// call, which hands the context back by value.
///
/// # Example
///
/// ```rust
/// use evqlrpc_client::{ResultAction, TaskHandler};
/// use evqlrpc_common::transport::Frame;
/// use evqlrpc_common::Result;
///
/// #[derive(Default)]
/// struct Collect {
///     rows: Vec<Vec<u8>>,
///     failed: usize,
/// }
///
/// impl TaskHandler for Collect {
///     type Context = Vec<u8>;
///
///     fn on_result(&mut self, ctx: &mut Vec<u8>, frame: &Frame) -> ResultAction {
///         ctx.extend_from_slice(&frame.payload);
///         ResultAction::Continue
///     }
///
///     fn on_task_done(&mut self, ctx: Vec<u8>, outcome: Result<()>) {
///         match outcome {
///             Ok(()) => self.rows.push(ctx),
///             Err(_) => self.failed += 1,
///         }
///     }
/// }
/// ```
pub trait TaskHandler {
    /// Per-task caller state, owned by the task until completion.
    type Context;

    /// An attempt against `host` started. Fires once per attempt; results
    /// delivered by an earlier, failed attempt are not retracted.
    fn on_task_started(&mut self, _ctx: &mut Self::Context, _host: &str) {}

    /// A result frame arrived for the task.
    fn on_result(&mut self, ctx: &mut Self::Context, frame: &Frame) -> ResultAction;

    /// The attempt against `host` failed with `error` and the task will move
    /// to its next host.
    fn on_failover(&mut self, _ctx: &mut Self::Context, _host: &str, _error: &EvqlError) {}

    /// The task reached a terminal state.
    fn on_task_done(&mut self, ctx: Self::Context, outcome: Result<()>);
}

/// A callback forwarded by [`ChannelHandler`].
#[derive(Debug)]
pub enum TaskEvent<C> {
    Started { context: C, host: String },
    Result { context: C, frame: Frame },
    Failover { context: C, host: String, error: String },
    Done { context: C, outcome: Result<()> },
}

impl<C> TaskEvent<C> {
    pub fn context(&self) -> &C {
        match self {
            TaskEvent::Started { context, .. }
            | TaskEvent::Result { context, .. }
            | TaskEvent::Failover { context, .. }
            | TaskEvent::Done { context, .. } => context,
        }
    }
}

/// Forwards every callback over an unbounded channel.
///
/// Contexts are cloned into each event, so they should be cheap identifiers
/// (a partition id, an index into the caller's own table). When the receiver
/// is dropped, running tasks are stopped at their next result frame.
#[derive(Debug)]
pub struct ChannelHandler<C> {
    tx: mpsc::UnboundedSender<TaskEvent<C>>,
}

impl<C> ChannelHandler<C> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskEvent<C>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl<C: Clone> TaskHandler for ChannelHandler<C> {
    type Context = C;

    fn on_task_started(&mut self, ctx: &mut C, host: &str) {
        let _ = self.tx.send(TaskEvent::Started {
            context: ctx.clone(),
            host: host.to_string(),
        });
    }

    fn on_result(&mut self, ctx: &mut C, frame: &Frame) -> ResultAction {
        let event = TaskEvent::Result {
            context: ctx.clone(),
            frame: frame.clone(),
        };
        match self.tx.send(event) {
            Ok(()) => ResultAction::Continue,
            Err(_) => ResultAction::Stop,
        }
    }

    fn on_failover(&mut self, ctx: &mut C, host: &str, error: &EvqlError) {
        let _ = self.tx.send(TaskEvent::Failover {
            context: ctx.clone(),
            host: host.to_string(),
            error: error.to_string(),
        });
    }

    fn on_task_done(&mut self, ctx: C, outcome: Result<()>) {
        let _ = self.tx.send(TaskEvent::Done {
            context: ctx,
            outcome,
        });
    }
}
