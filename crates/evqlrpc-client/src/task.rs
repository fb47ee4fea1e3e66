use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use evqlrpc_common::EvqlError;
use slab::Slab;

/// One remote call together with its candidate hosts.
///
/// Hosts are tried strictly in order. A host that failed is dropped from the
/// list and never tried again for this task; duplicate host ids are removed
/// when the task is built.
///
/// # Example
///
/// ```rust
/// use evqlrpc_client::Task;
/// use evqlrpc_common::opcode;
///
/// let task = Task::new(opcode::QUERY_PARTIALAGGR, &b"..."[..], ["node-a", "node-b"], 42u32);
/// assert_eq!(task.head_host(), Some("node-a"));
/// ```
#[derive(Debug)]
pub struct Task<C> {
    opcode: u16,
    flags: u16,
    payload: Bytes,
    hosts: VecDeque<String>,
    pub(crate) context: C,
    pub(crate) request: Bytes,
    pub(crate) started: bool,
    pub(crate) attempts: u32,
    pub(crate) last_error: Option<EvqlError>,
    pub(crate) enqueued_at: Option<Instant>,
}

impl<C> Task<C> {
    pub fn new<I, S>(opcode: u16, payload: impl Into<Bytes>, hosts: I, context: C) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut deduped: VecDeque<String> = VecDeque::new();
        for host in hosts {
            let host = host.into();
            if !deduped.contains(&host) {
                deduped.push_back(host);
            }
        }

        Self {
            opcode,
            flags: 0,
            payload: payload.into(),
            hosts: deduped,
            context,
            request: Bytes::new(),
            started: false,
            attempts: 0,
            last_error: None,
            enqueued_at: None,
        }
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Hosts not yet tried, head first.
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }

    pub fn head_host(&self) -> Option<&str> {
        self.hosts.front().map(String::as_str)
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    /// Whether any attempt has been started.
    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn pop_host(&mut self) -> Option<String> {
        self.hosts.pop_front()
    }
}

/// Next move for a task whose attempt just failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FailoverStep {
    /// Start a connection to this host immediately.
    Restart(String),
    /// The next host is saturated; put the task at the back of the queue.
    Requeue,
    /// No hosts left.
    Exhausted,
}

/// Drops the failed head host and decides how the task continues.
pub(crate) fn next_failover_step<C>(
    task: &mut Task<C>,
    has_capacity: impl Fn(&str) -> bool,
) -> FailoverStep {
    task.pop_host();
    match task.head_host() {
        None => FailoverStep::Exhausted,
        Some(host) if has_capacity(host) => FailoverStep::Restart(host.to_string()),
        Some(_) => FailoverStep::Requeue,
    }
}

/// Owns every unfinished task and the FIFO run queue of tasks waiting for a
/// connection.
///
/// Tasks live in a slab for their whole life; the run queue and connections
/// refer to them by key.
#[derive(Debug)]
pub(crate) struct TaskQueue<C> {
    tasks: Slab<Task<C>>,
    runq: VecDeque<usize>,
}

impl<C> TaskQueue<C> {
    pub(crate) fn new() -> Self {
        Self {
            tasks: Slab::new(),
            runq: VecDeque::new(),
        }
    }

    /// Stores the task and appends it to the run queue.
    pub(crate) fn enqueue(&mut self, task: Task<C>) -> usize {
        let key = self.tasks.insert(task);
        self.runq.push_back(key);
        key
    }

    /// Removes and returns the first queued task whose head host has spare
    /// capacity. With `host` set, only tasks headed for that host qualify.
    ///
    /// Tasks for saturated hosts are skipped, not waited on, so one busy host
    /// never blocks work for the others.
    pub(crate) fn pop_runnable(
        &mut self,
        host: Option<&str>,
        has_capacity: impl Fn(&str) -> bool,
    ) -> Option<usize> {
        let tasks = &self.tasks;
        let pos = self.runq.iter().position(|key| {
            let head = match tasks.get(*key).and_then(|t| t.head_host()) {
                Some(head) => head,
                None => return false,
            };
            if let Some(host) = host {
                if head != host {
                    return false;
                }
            }
            has_capacity(head)
        })?;
        self.runq.remove(pos)
    }

    /// Appends a task that is already stored back onto the run queue.
    pub(crate) fn requeue(&mut self, key: usize) {
        if self.tasks.contains(key) {
            self.runq.push_back(key);
        }
    }

    pub(crate) fn get(&self, key: usize) -> Option<&Task<C>> {
        self.tasks.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: usize) -> Option<&mut Task<C>> {
        self.tasks.get_mut(key)
    }

    /// Removes a task for good, dropping it from the run queue if queued.
    pub(crate) fn remove(&mut self, key: usize) -> Option<Task<C>> {
        let task = self.tasks.try_remove(key)?;
        self.runq.retain(|k| *k != key);
        Some(task)
    }

    /// Removes every task, queued or running.
    pub(crate) fn drain(&mut self) -> Vec<Task<C>> {
        self.runq.clear();
        self.tasks.drain().collect()
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.runq.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }
}
