use std::time::Duration;

use evqlrpc_common::auth::AuthData;
use evqlrpc_common::transport::{FrameCodec, MAX_FRAME_SIZE, MAX_FRAME_SIZE_SOFT};
use evqlrpc_common::{EvqlError, Result};
use serde::Deserialize;

/// Idle connection pool configuration.
///
/// Controls how many finished connections are kept open for reuse and for how
/// long. Parked connections do not count against the per-host concurrency
/// limit.
///
/// # Default Configuration
///
/// - `max_idle_per_host`: 4
/// - `max_idle_total`: 64
/// - `max_idle_age_ms`: 30000 (30 seconds)
///
/// # Example
///
/// ```rust
/// use evqlrpc_client::PoolConfig;
///
/// let config = PoolConfig {
///     max_idle_per_host: 2,
///     max_idle_total: 16,
///     max_idle_age_ms: 5000,
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum idle connections kept for a single host
    pub max_idle_per_host: usize,
    /// Maximum idle connections kept across all hosts
    pub max_idle_total: usize,
    /// Idle connections older than this are closed instead of reused
    pub max_idle_age_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 4,
            max_idle_total: 64,
            max_idle_age_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn max_idle_age(&self) -> Duration {
        Duration::from_millis(self.max_idle_age_ms)
    }
}

/// Dispatcher configuration.
///
/// # Default Configuration
///
/// - `max_concurrent_tasks`: 64
/// - `max_concurrent_tasks_per_host`: 8
/// - `io_timeout_ms`: 1000 (connect and partial-write deadline)
/// - `idle_timeout_ms`: 1000 (no-progress read deadline while a task is bound)
/// - `tolerate_failures`: true
/// - frame limits: 256 MB hard, 1 MB soft
/// - `read_batch_size`: 4096
/// - no authentication, no database switch, INTERNAL hello flag set
/// - no connection pool
///
/// # Example
///
/// ```rust
/// use evqlrpc_client::{DispatcherConfig, PoolConfig};
///
/// let config = DispatcherConfig::default()
///     .with_max_concurrent_tasks(16)
///     .with_max_concurrent_tasks_per_host(2)
///     .with_idle_timeout_ms(5000)
///     .with_pool(PoolConfig::default());
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Upper bound on tasks in flight across all hosts
    pub max_concurrent_tasks: usize,
    /// Upper bound on active connections to a single host
    pub max_concurrent_tasks_per_host: usize,
    /// Deadline for connect and for draining a partially written buffer
    pub io_timeout_ms: u64,
    /// Deadline for read progress while a connection is handshaking or bound to a task
    pub idle_timeout_ms: u64,
    /// When false, the first terminally failed task aborts the whole batch
    pub tolerate_failures: bool,
    /// Hard frame payload ceiling
    pub max_frame_size: usize,
    /// Soft frame payload ceiling
    pub max_frame_size_soft: usize,
    /// Bytes reserved per read attempt
    pub read_batch_size: usize,
    /// Key/value pairs sent in HELLO
    pub auth_data: AuthData,
    /// Database to switch to during the handshake
    pub database: Option<String>,
    /// Announce the connection as server-to-server traffic
    pub internal: bool,
    /// Keep finished connections for reuse when set
    pub pool: Option<PoolConfig>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 64,
            max_concurrent_tasks_per_host: 8,
            io_timeout_ms: 1000,
            idle_timeout_ms: 1000,
            tolerate_failures: true,
            max_frame_size: MAX_FRAME_SIZE,
            max_frame_size_soft: MAX_FRAME_SIZE_SOFT,
            read_batch_size: 4096,
            auth_data: AuthData::default(),
            database: None,
            internal: true,
            pool: None,
        }
    }
}

impl DispatcherConfig {
    pub fn new(max_concurrent_tasks: usize, max_concurrent_tasks_per_host: usize) -> Self {
        Self {
            max_concurrent_tasks,
            max_concurrent_tasks_per_host,
            ..Self::default()
        }
    }

    pub fn with_max_concurrent_tasks(mut self, n: usize) -> Self {
        self.max_concurrent_tasks = n;
        self
    }

    pub fn with_max_concurrent_tasks_per_host(mut self, n: usize) -> Self {
        self.max_concurrent_tasks_per_host = n;
        self
    }

    pub fn with_io_timeout_ms(mut self, ms: u64) -> Self {
        self.io_timeout_ms = ms;
        self
    }

    pub fn with_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    pub fn with_tolerate_failures(mut self, tolerate: bool) -> Self {
        self.tolerate_failures = tolerate;
        self
    }

    pub fn with_frame_limits(mut self, max_frame_size: usize, max_frame_size_soft: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self.max_frame_size_soft = max_frame_size_soft;
        self
    }

    pub fn with_read_batch_size(mut self, n: usize) -> Self {
        self.read_batch_size = n;
        self
    }

    pub fn with_auth_data(mut self, auth_data: AuthData) -> Self {
        self.auth_data = auth_data;
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::with_limits(self.max_frame_size, self.max_frame_size_soft)
    }

    /// Rejects settings under which the dispatcher could never make progress.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(EvqlError::InvalidConfig(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_tasks_per_host == 0 {
            return Err(EvqlError::InvalidConfig(
                "max_concurrent_tasks_per_host must be at least 1".to_string(),
            ));
        }
        if self.io_timeout_ms == 0 || self.idle_timeout_ms == 0 {
            return Err(EvqlError::InvalidConfig(
                "io and idle timeouts must be non-zero".to_string(),
            ));
        }
        if self.max_frame_size == 0 {
            return Err(EvqlError::InvalidConfig(
                "max_frame_size must be non-zero".to_string(),
            ));
        }
        if self.read_batch_size == 0 {
            return Err(EvqlError::InvalidConfig(
                "read_batch_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
