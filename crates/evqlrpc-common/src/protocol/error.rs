use thiserror::Error;

/// Errors raised by the native transport.
///
/// The variants follow the failure taxonomy the dispatcher acts on:
///
/// - **Transport**: `Io`, `Connection`, `Timeout` (always retryable on the next host)
/// - **Protocol**: `Protocol`, `FrameTooLarge`, `UnexpectedOpcode` (fatal to the
///   connection, retryable on the next host)
/// - **Application**: `Remote` (retryable only if the peer said so)
/// - **Exhaustion**: `HostsExhausted` (terminal for the task)
#[derive(Error, Debug)]
pub enum EvqlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame too large: {len} bytes (max {max} bytes)")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Unexpected opcode 0x{opcode:04x} in state {state}")]
    UnexpectedOpcode { opcode: u16, state: &'static str },

    #[error("Remote error: {message}")]
    Remote { message: String, retryable: bool },

    #[error("Host unavailable: {0}")]
    HostUnavailable(String),

    #[error("All hosts failed; last error: {0}")]
    HostsExhausted(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Resource exhausted: {0}")]
    Resource(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Dispatcher shut down")]
    Shutdown,
}

impl EvqlError {
    /// Whether a task that hit this error may be retried on its next host.
    ///
    /// Transport and protocol failures are always retryable at the task
    /// level. Remote errors carry the peer's retryable bit. Everything else
    /// is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            EvqlError::Io(_)
            | EvqlError::Connection(_)
            | EvqlError::Timeout(_)
            | EvqlError::Protocol(_)
            | EvqlError::FrameTooLarge { .. }
            | EvqlError::UnexpectedOpcode { .. }
            | EvqlError::HostUnavailable(_)
            | EvqlError::Auth(_) => true,
            EvqlError::Remote { retryable, .. } => *retryable,
            EvqlError::HostsExhausted(_)
            | EvqlError::InvalidConfig(_)
            | EvqlError::InvalidTask(_)
            | EvqlError::Resource(_)
            | EvqlError::TaskFailed(_)
            | EvqlError::Shutdown => false,
        }
    }
}

impl From<std::net::AddrParseError> for EvqlError {
    fn from(err: std::net::AddrParseError) -> Self {
        EvqlError::HostUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EvqlError>;
