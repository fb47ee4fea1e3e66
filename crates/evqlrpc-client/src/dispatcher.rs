use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use evqlrpc_common::transport::{Frame, FrameCodec};
use evqlrpc_common::{frame_flags, opcode, EvqlError, HelloFrame, Result};
use evqlrpc_metrics::DispatchMetrics;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use slab::Slab;
use tokio::io::Ready;
use tracing::{debug, info, warn};

use crate::config::DispatcherConfig;
use crate::connection::{Connection, ConnectionState, FrameEvent};
use crate::directory::HostDirectory;
use crate::handler::{ResultAction, TaskHandler};
use crate::pool::ConnectionPool;
use crate::task::{next_failover_step, FailoverStep, Task, TaskQueue};

/// Readiness reported for one connection: slab key, connection id, result.
type ReadyEvent = (usize, u64, io::Result<Ready>);

/// Point-in-time counters of a dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Tasks enqueued since the dispatcher was created
    pub num_tasks: usize,
    /// Tasks bound to a connection right now
    pub num_tasks_running: usize,
    /// Tasks that reached a terminal state
    pub num_tasks_complete: usize,
    /// Open connections serving tasks
    pub active_connections: usize,
    /// Parked connections waiting for reuse
    pub idle_connections: usize,
}

/// Fans a batch of tasks out to remote hosts over the native transport.
///
/// The dispatcher owns every connection and task. [`execute`] drives all of
/// them from a single async task: it opens connections up to the configured
/// limits, performs the HELLO/READY handshake, sends each task's request,
/// delivers result frames to the [`TaskHandler`] and fails tasks over to
/// their next host when an attempt breaks.
///
/// # Limits
///
/// - at most `max_concurrent_tasks` tasks are bound to connections at once
/// - at most `max_concurrent_tasks_per_host` connections per host; queued
///   tasks for a saturated host are skipped, not waited on
///
/// # Example
///
/// ```rust,no_run
/// use evqlrpc_client::{ChannelHandler, Dispatcher, DispatcherConfig, StaticDirectory, Task};
/// use evqlrpc_common::opcode;
///
/// # #[tokio::main]
/// # async fn main() -> evqlrpc_common::Result<()> {
/// let directory = StaticDirectory::new()
///     .with_host("node-a", "10.0.0.1:9175".parse()?)
///     .with_host("node-b", "10.0.0.2:9175".parse()?);
/// let (handler, mut events) = ChannelHandler::new();
///
/// let mut dispatcher = Dispatcher::new(DispatcherConfig::default(), directory, handler)?;
/// dispatcher.enqueue(Task::new(opcode::QUERY_PARTIALAGGR, &b"..."[..], ["node-a", "node-b"], 0usize))?;
/// dispatcher.execute().await?;
///
/// while let Ok(event) = events.try_recv() {
///     println!("{:?}", event);
/// }
/// # Ok(())
/// # }
/// ```
///
/// # Cancellation
///
/// Dropping the future returned by [`execute`] leaves in-flight work in
/// place; call [`shutdown`] to close connections and complete the remaining
/// tasks with [`EvqlError::Shutdown`].
///
/// [`execute`]: Dispatcher::execute
/// [`shutdown`]: Dispatcher::shutdown
pub struct Dispatcher<D, H: TaskHandler> {
    config: DispatcherConfig,
    directory: D,
    handler: H,
    codec: FrameCodec,
    hello: Bytes,
    tasks: TaskQueue<H::Context>,
    connections: Slab<Connection>,
    host_connections: HashMap<String, usize>,
    pool: Option<ConnectionPool>,
    metrics: Arc<DispatchMetrics>,
    num_tasks: usize,
    num_tasks_running: usize,
    num_tasks_complete: usize,
    next_conn_id: u64,
}

impl<D: HostDirectory, H: TaskHandler> Dispatcher<D, H> {
    pub fn new(config: DispatcherConfig, directory: D, handler: H) -> Result<Self> {
        config.validate()?;
        let codec = config.codec();

        let mut hello = HelloFrame::new(config.idle_timeout_ms.saturating_mul(1000))
            .with_auth_data(config.auth_data.clone());
        if config.internal {
            hello = hello.internal();
        }
        if let Some(database) = &config.database {
            hello = hello.with_database(database.clone());
        }
        let hello = codec.encode_frame(&Frame::new(opcode::HELLO, 0, hello.encode()))?;

        let metrics = Arc::new(DispatchMetrics::new());
        let pool = config
            .pool
            .clone()
            .map(|pool| ConnectionPool::new(pool, metrics.clone()));

        Ok(Self {
            config,
            directory,
            handler,
            codec,
            hello,
            tasks: TaskQueue::new(),
            connections: Slab::new(),
            host_connections: HashMap::new(),
            pool,
            metrics,
            num_tasks: 0,
            num_tasks_running: 0,
            num_tasks_complete: 0,
            next_conn_id: 0,
        })
    }

    /// Adds a task to the current batch.
    ///
    /// The request frame is encoded here, so an oversized payload is
    /// rejected up front rather than failing on every host.
    pub fn enqueue(&mut self, mut task: Task<H::Context>) -> Result<()> {
        if task.head_host().is_none() {
            return Err(EvqlError::InvalidTask("task has no candidate hosts".to_string()));
        }

        let request = Frame::new(task.opcode(), task.flags(), task.payload().clone());
        task.request = self.codec.encode_frame(&request)?;
        task.enqueued_at = Some(Instant::now());

        self.tasks.enqueue(task);
        self.num_tasks += 1;
        self.metrics.task_enqueued();
        Ok(())
    }

    /// Runs until every enqueued task has completed.
    ///
    /// Failed attempts are retried on the task's remaining hosts and are not
    /// errors here. Returns an error only when dispatching cannot go on: a
    /// local socket could not be created, or a task failed while
    /// `tolerate_failures` is off. On error the dispatcher is shut down
    /// before returning.
    pub async fn execute(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.as_mut() {
            pool.evict_expired(Instant::now());
        }

        info!(
            tasks = self.num_tasks - self.num_tasks_complete,
            "dispatching batch"
        );

        match self.run().await {
            Ok(()) => {
                debug!(complete = self.num_tasks_complete, "batch complete");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "dispatch aborted");
                self.shutdown();
                Err(e)
            }
        }
    }

    async fn run(&mut self) -> Result<()> {
        while self.num_tasks_complete < self.num_tasks {
            self.admit()?;
            if self.num_tasks_complete >= self.num_tasks {
                break;
            }
            if self.connections.is_empty() {
                return Err(EvqlError::Resource(format!(
                    "{} tasks outstanding but none could be started",
                    self.num_tasks - self.num_tasks_complete
                )));
            }

            let deadline = self.poll_deadline(Instant::now());
            let events = self.wait(deadline).await;

            self.expire(Instant::now())?;
            for (key, id, ready) in events {
                self.on_event(key, id, ready)?;
            }
        }
        Ok(())
    }

    /// Closes all connections, including pooled ones, and completes every
    /// unfinished task with [`EvqlError::Shutdown`].
    pub fn shutdown(&mut self) {
        let keys: Vec<usize> = self.connections.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.close_connection(key, true);
        }
        if let Some(pool) = self.pool.as_mut() {
            pool.drain();
        }

        for task in self.tasks.drain() {
            self.metrics.task_failed(latency_us(task.enqueued_at));
            self.handler.on_task_done(task.context, Err(EvqlError::Shutdown));
            self.num_tasks_complete += 1;
        }

        self.num_tasks_running = 0;
        self.metrics.set_running(0);
        self.host_connections.clear();
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            num_tasks: self.num_tasks,
            num_tasks_running: self.num_tasks_running,
            num_tasks_complete: self.num_tasks_complete,
            active_connections: self.connections.len(),
            idle_connections: self.pool.as_ref().map_or(0, ConnectionPool::len),
        }
    }

    /// Shared handle to the dispatcher's counters.
    pub fn metrics(&self) -> Arc<DispatchMetrics> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Consumes the dispatcher, closing its connections, and returns the handler.
    pub fn into_handler(mut self) -> H {
        self.shutdown();
        self.handler
    }

    /// Starts queued tasks until the global limit is reached or no queued
    /// task has a host with spare capacity.
    fn admit(&mut self) -> Result<()> {
        let per_host = self.config.max_concurrent_tasks_per_host;
        while self.num_tasks_running < self.config.max_concurrent_tasks {
            let counts = &self.host_connections;
            let runnable = self
                .tasks
                .pop_runnable(None, |host| counts.get(host).copied().unwrap_or(0) < per_host);
            let task_key = match runnable {
                Some(key) => key,
                None => break,
            };

            self.num_tasks_running += 1;
            let host = self.head_host(task_key);
            match self.start_connection(task_key) {
                Ok(()) => {}
                Err(e @ EvqlError::Resource(_)) => return Err(e),
                Err(e) => self.fail_task(task_key, &host, e)?,
            }
        }
        Ok(())
    }

    fn head_host(&self, task_key: usize) -> String {
        self.tasks
            .get(task_key)
            .and_then(|t| t.head_host())
            .map(str::to_string)
            .unwrap_or_default()
    }

    /// Gets a connection to the task's head host, from the pool if one is
    /// parked there, otherwise by connecting.
    fn start_connection(&mut self, task_key: usize) -> Result<()> {
        let host = match self.tasks.get(task_key).and_then(|t| t.head_host()) {
            Some(host) => host.to_string(),
            None => return Err(EvqlError::InvalidTask("task has no hosts left".to_string())),
        };

        let entry = match self.directory.resolve(&host) {
            Some(entry) if entry.is_live => entry,
            Some(_) => return Err(EvqlError::HostUnavailable(format!("{} is marked down", host))),
            None => return Err(EvqlError::HostUnavailable(format!("unknown host {}", host))),
        };

        let now = Instant::now();
        let pooled = self.pool.as_mut().and_then(|pool| pool.checkout(&host, now));
        let (key, reused) = match pooled {
            Some(conn) => {
                debug!(host = %host, conn = conn.id, "reusing pooled connection");
                self.metrics.connection_reused(&host);
                (self.connections.insert(conn), true)
            }
            None => {
                let id = self.next_conn_id;
                self.next_conn_id += 1;
                let conn = Connection::connect(
                    id,
                    &host,
                    entry.addr,
                    self.codec,
                    now + self.config.io_timeout(),
                )?;
                self.metrics.connection_opened(&host);
                (self.connections.insert(conn), false)
            }
        };

        *self.host_connections.entry(host.clone()).or_insert(0) += 1;
        self.mark_started(task_key, &host);

        if reused {
            self.bind_task(key, task_key)
        } else {
            self.connections[key].task = Some(task_key);
            Ok(())
        }
    }

    fn mark_started(&mut self, task_key: usize, host: &str) {
        if let Some(task) = self.tasks.get_mut(task_key) {
            task.started = true;
            task.attempts += 1;
            debug!(host = %host, task = task_key, attempt = task.attempts, "task started");
            self.handler.on_task_started(&mut task.context, host);
        }
        self.metrics
            .task_started(host, self.num_tasks_running as u64);
    }

    /// Queues the task's request on a connection that finished its handshake.
    fn bind_task(&mut self, key: usize, task_key: usize) -> Result<()> {
        let request = match self.tasks.get(task_key) {
            Some(task) => task.request.clone(),
            None => return Ok(()),
        };
        let idle = self.config.idle_timeout();
        self.connections[key].send_request(task_key, &request, Instant::now(), idle);
        self.on_writable(key)
    }

    /// Nearest deadline of any connection, capped at one idle timeout from now.
    fn poll_deadline(&self, now: Instant) -> Instant {
        self.connections
            .iter()
            .filter_map(|(_, conn)| conn.next_deadline())
            .fold(now + self.config.idle_timeout(), Instant::min)
    }

    /// Waits until at least one connection is ready or `deadline` passes,
    /// then collects every readiness that is already available.
    async fn wait(&self, deadline: Instant) -> Vec<ReadyEvent> {
        let mut pending: FuturesUnordered<_> = self
            .connections
            .iter()
            .map(|(key, conn)| {
                let id = conn.id;
                let interest = conn.interest();
                let stream = conn.stream();
                async move { (key, id, stream.ready(interest).await) }
            })
            .collect();

        let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
        let first = tokio::select! {
            event = pending.next() => event,
            _ = sleep => None,
        };

        let mut events = Vec::new();
        if let Some(event) = first {
            events.push(event);
            while let Some(Some(event)) = pending.next().now_or_never() {
                events.push(event);
            }
        }
        events
    }

    fn is_current(&self, key: usize, id: u64) -> bool {
        self.connections.get(key).map_or(false, |conn| conn.id == id)
    }

    /// Fails every connection whose read or write deadline has passed.
    fn expire(&mut self, now: Instant) -> Result<()> {
        let expired: Vec<(usize, u64, bool)> = self
            .connections
            .iter()
            .filter_map(|(key, conn)| conn.expired(now).map(|read| (key, conn.id, read)))
            .collect();

        for (key, id, read) in expired {
            if !self.is_current(key, id) {
                continue;
            }
            let timeout_ms = if read {
                self.config.idle_timeout_ms
            } else {
                self.config.io_timeout_ms
            };
            self.metrics.timeout();
            self.fail_connection(key, EvqlError::Timeout(timeout_ms))?;
        }
        Ok(())
    }

    fn on_event(&mut self, key: usize, id: u64, ready: io::Result<Ready>) -> Result<()> {
        if !self.is_current(key, id) {
            return Ok(());
        }
        let ready = match ready {
            Ok(ready) => ready,
            Err(e) => return self.fail_connection(key, EvqlError::Io(e)),
        };

        if self.connections[key].state == ConnectionState::Connecting {
            if ready.is_writable() {
                self.finish_connect(key)?;
            }
            return Ok(());
        }

        if ready.is_readable() {
            self.on_readable(key, id)?;
        }
        if ready.is_writable()
            && self.is_current(key, id)
            && self.connections[key].has_pending_write()
        {
            self.on_writable(key)?;
        }
        Ok(())
    }

    fn finish_connect(&mut self, key: usize) -> Result<()> {
        let idle = self.config.idle_timeout();
        match self.connections[key].finish_connect(&self.hello, Instant::now(), idle) {
            Ok(true) => self.on_writable(key),
            Ok(false) => Ok(()),
            Err(e) => self.fail_connection(key, e),
        }
    }

    fn on_writable(&mut self, key: usize) -> Result<()> {
        let io_timeout = self.config.io_timeout();
        match self.connections[key].perform_write(Instant::now(), io_timeout) {
            Ok(_) => Ok(()),
            Err(e) => self.fail_connection(key, e),
        }
    }

    fn on_readable(&mut self, key: usize, id: u64) -> Result<()> {
        let batch = self.config.read_batch_size;
        let idle = self.config.idle_timeout();
        let outcome = match self.connections[key].perform_read(batch, Instant::now(), idle) {
            Ok(outcome) => outcome,
            Err(e) => return self.fail_connection(key, e),
        };

        loop {
            // the connection may have been closed or pooled by the last frame
            let conn = match self.connections.get_mut(key) {
                Some(conn) if conn.id == id => conn,
                _ => return Ok(()),
            };
            let decoded = match conn.next_frame() {
                Ok(Some(decoded)) => decoded,
                Ok(None) => break,
                Err(e) => return self.fail_connection(key, e),
            };
            match conn.on_frame(decoded) {
                Ok(FrameEvent::Heartbeat) => {}
                Ok(FrameEvent::Ready) => self.on_handshake_done(key)?,
                Ok(FrameEvent::Result(frame)) => self.on_result(key, frame)?,
                Err(e) => return self.fail_connection(key, e),
            }
        }

        if outcome.eof && self.is_current(key, id) {
            if self.connections[key].eof_is_error() {
                let host = self.connections[key].host.clone();
                return self.fail_connection(
                    key,
                    EvqlError::Connection(format!("connection to server {} lost", host)),
                );
            }
            self.close_connection(key, false);
        }
        Ok(())
    }

    fn on_handshake_done(&mut self, key: usize) -> Result<()> {
        match self.connections[key].task {
            Some(task_key) => self.bind_task(key, task_key),
            None => self.handle_idle(key),
        }
    }

    fn on_result(&mut self, key: usize, frame: Frame) -> Result<()> {
        let task_key = match self.connections[key].task {
            Some(task_key) => task_key,
            None => {
                return self.fail_connection(
                    key,
                    EvqlError::Protocol("result frame without a running task".to_string()),
                )
            }
        };
        let action = match self.tasks.get_mut(task_key) {
            Some(task) => self.handler.on_result(&mut task.context, &frame),
            None => ResultAction::Stop,
        };

        match action {
            ResultAction::Continue => {}
            ResultAction::Stop => {
                debug!(task = task_key, "handler stopped task");
                self.connections[key].finish_task();
                self.close_connection(key, true);
                return self.complete_task(task_key, Ok(()));
            }
            ResultAction::Fail(error) => {
                debug!(task = task_key, error = %error, "handler rejected result");
                return self.fail_connection(key, error);
            }
        }

        if frame.has_flag(frame_flags::END_OF_REQUEST) {
            self.connections[key].finish_task();
            self.complete_task(task_key, Ok(()))?;
            return self.handle_idle(key);
        }
        Ok(())
    }

    /// A connection finished its task: bind the next task queued for the
    /// same host, or park or close the connection.
    fn handle_idle(&mut self, key: usize) -> Result<()> {
        let host = self.connections[key].host.clone();

        if self.num_tasks_running < self.config.max_concurrent_tasks {
            if let Some(next) = self.tasks.pop_runnable(Some(&host), |_| true) {
                self.num_tasks_running += 1;
                self.mark_started(next, &host);
                return self.bind_task(key, next);
            }
        }

        let conn = match self.remove_connection(key) {
            Some(conn) => conn,
            None => return Ok(()),
        };
        match self.pool.as_mut() {
            Some(pool) => {
                if let Err(conn) = pool.checkin(conn, Instant::now()) {
                    conn.close(true);
                    self.metrics.connection_closed();
                }
            }
            None => {
                conn.close(true);
                self.metrics.connection_closed();
            }
        }
        Ok(())
    }

    fn remove_connection(&mut self, key: usize) -> Option<Connection> {
        let conn = self.connections.try_remove(key)?;
        if let Some(count) = self.host_connections.get_mut(&conn.host) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.host_connections.remove(&conn.host);
            }
        }
        self.metrics.connection_released(&conn.host);
        Some(conn)
    }

    fn close_connection(&mut self, key: usize, say_goodbye: bool) {
        if let Some(conn) = self.remove_connection(key) {
            conn.close(say_goodbye);
            self.metrics.connection_closed();
        }
    }

    /// Tears down a broken connection and fails over its task.
    fn fail_connection(&mut self, key: usize, error: EvqlError) -> Result<()> {
        let conn = match self.remove_connection(key) {
            Some(conn) => conn,
            None => return Ok(()),
        };
        warn!(
            host = %conn.host,
            state = conn.state.name(),
            error = %error,
            "connection failed"
        );

        let host = conn.host.clone();
        let task = conn.task;
        conn.close(false);
        self.metrics.connection_closed();

        match task {
            Some(task_key) => self.fail_task(task_key, &host, error),
            None => Ok(()),
        }
    }

    fn record_failover(&mut self, task_key: usize, host: &str, error: EvqlError) {
        self.metrics.failover(host);
        if let Some(task) = self.tasks.get_mut(task_key) {
            self.handler.on_failover(&mut task.context, host, &error);
            task.last_error = Some(error);
        }
    }

    /// An attempt against `host` failed: move the task to its next host,
    /// requeue it, or complete it with the failure.
    fn fail_task(&mut self, task_key: usize, host: &str, error: EvqlError) -> Result<()> {
        if !error.is_retryable() {
            self.metrics.host_failed(host);
            return self.complete_task(task_key, Err(error));
        }
        self.record_failover(task_key, host, error);

        loop {
            let per_host = self.config.max_concurrent_tasks_per_host;
            let counts = &self.host_connections;
            let step = match self.tasks.get_mut(task_key) {
                Some(task) => next_failover_step(task, |h| {
                    counts.get(h).copied().unwrap_or(0) < per_host
                }),
                None => return Ok(()),
            };

            match step {
                FailoverStep::Restart(next) => {
                    debug!(task = task_key, host = %next, "failing over");
                    match self.start_connection(task_key) {
                        Ok(()) => return Ok(()),
                        Err(e @ EvqlError::Resource(_)) => return Err(e),
                        Err(e) => {
                            warn!(host = %next, error = %e, "failover attempt failed");
                            self.record_failover(task_key, &next, e);
                        }
                    }
                }
                FailoverStep::Requeue => {
                    self.num_tasks_running = self.num_tasks_running.saturating_sub(1);
                    self.metrics.set_running(self.num_tasks_running as u64);
                    self.tasks.requeue(task_key);
                    return Ok(());
                }
                FailoverStep::Exhausted => {
                    let last = self
                        .tasks
                        .get_mut(task_key)
                        .and_then(|task| task.last_error.take())
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "no hosts left".to_string());
                    return self.complete_task(task_key, Err(EvqlError::HostsExhausted(last)));
                }
            }
        }
    }

    /// Reports a task's terminal outcome. Errors only when the task failed
    /// and failures are not tolerated.
    fn complete_task(&mut self, task_key: usize, outcome: Result<()>) -> Result<()> {
        let task = match self.tasks.remove(task_key) {
            Some(task) => task,
            None => return Ok(()),
        };
        self.num_tasks_running = self.num_tasks_running.saturating_sub(1);
        self.num_tasks_complete += 1;
        self.metrics.set_running(self.num_tasks_running as u64);

        let latency = latency_us(task.enqueued_at);
        let failure = match &outcome {
            Ok(()) => {
                self.metrics.task_succeeded(latency);
                None
            }
            Err(e) => {
                warn!(task = task_key, attempts = task.attempts, error = %e, "task failed");
                self.metrics.task_failed(latency);
                Some(e.to_string())
            }
        };

        self.handler.on_task_done(task.context, outcome);

        match failure {
            Some(message) if !self.config.tolerate_failures => {
                Err(EvqlError::TaskFailed(message))
            }
            _ => Ok(()),
        }
    }
}

fn latency_us(enqueued_at: Option<Instant>) -> u64 {
    enqueued_at.map_or(0, |at| at.elapsed().as_micros() as u64)
}
