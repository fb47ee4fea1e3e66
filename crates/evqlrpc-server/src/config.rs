use std::time::Duration;

use evqlrpc_common::auth::AuthConfig;
use evqlrpc_common::transport::{FrameCodec, MAX_FRAME_SIZE, MAX_FRAME_SIZE_SOFT};
use evqlrpc_common::{EvqlError, Result};
use serde::Deserialize;

/// Native server configuration.
///
/// # Default Configuration
///
/// - `idle_timeout_ms`: 30000 (announced in READY; idle connections are
///   closed after this long without a frame)
/// - `heartbeat_interval_ms`: 250 (HEARTBEAT cadence while an operation runs;
///   clients asking for a shorter idle timeout are rejected)
/// - `handshake_timeout_ms`: 5000
/// - authentication disabled
///
/// # Example
///
/// ```rust
/// use evqlrpc_server::ServerConfig;
/// use evqlrpc_common::auth::AuthConfig;
///
/// let config = ServerConfig::default()
///     .with_heartbeat_interval_ms(100)
///     .with_auth(AuthConfig::with_token("secret"));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub idle_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    pub max_frame_size: usize,
    pub max_frame_size_soft: usize,
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30_000,
            heartbeat_interval_ms: 250,
            handshake_timeout_ms: 5_000,
            max_frame_size: MAX_FRAME_SIZE,
            max_frame_size_soft: MAX_FRAME_SIZE_SOFT,
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn with_handshake_timeout_ms(mut self, ms: u64) -> Self {
        self.handshake_timeout_ms = ms;
        self
    }

    pub fn with_frame_limits(mut self, max_frame_size: usize, max_frame_size_soft: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self.max_frame_size_soft = max_frame_size_soft;
        self
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::with_limits(self.max_frame_size, self.max_frame_size_soft)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(EvqlError::InvalidConfig(
                "heartbeat_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.idle_timeout_ms <= self.heartbeat_interval_ms {
            return Err(EvqlError::InvalidConfig(format!(
                "idle_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.idle_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.handshake_timeout_ms == 0 || self.max_frame_size == 0 {
            return Err(EvqlError::InvalidConfig(
                "handshake timeout and max frame size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
