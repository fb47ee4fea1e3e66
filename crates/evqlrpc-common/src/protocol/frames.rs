//! Payload encodings of the control frames (HELLO, READY, ERROR).
//!
//! Operation payloads are opaque to the transport; only the frames that drive
//! the connection state machine are defined here.

use bytes::{BufMut, Bytes, BytesMut};

use super::error::{EvqlError, Result};
use super::opcodes::{hello_flags, PROTOCOL_VERSION};
use super::wire::{put_lenenc, put_varuint, MessageReader};
use crate::auth::AuthData;

/// Client greeting sent right after the TCP connection is established.
///
/// # Wire Format
///
/// ```text
/// varuint version
/// varuint flags              (INTERNAL | SWITCHDB | INTERACTIVEAUTH)
/// varuint idle_timeout_us
/// lenenc  database           (only when SWITCHDB is set)
/// lenenc  auth blob          (key\0value\0key\0value\0...)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloFrame {
    pub version: u64,
    pub flags: u64,
    pub idle_timeout_us: u64,
    pub database: Option<String>,
    pub auth_data: AuthData,
}

impl HelloFrame {
    pub fn new(idle_timeout_us: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: 0,
            idle_timeout_us,
            database: None,
            auth_data: AuthData::default(),
        }
    }

    /// Marks the connection as server-to-server traffic.
    pub fn internal(mut self) -> Self {
        self.flags |= hello_flags::INTERNAL;
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.flags |= hello_flags::SWITCHDB;
        self.database = Some(database.into());
        self
    }

    pub fn with_auth_data(mut self, auth_data: AuthData) -> Self {
        self.auth_data = auth_data;
        self
    }

    pub fn is_internal(&self) -> bool {
        self.flags & hello_flags::INTERNAL != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        put_varuint(&mut buf, self.version);
        put_varuint(&mut buf, self.flags);
        put_varuint(&mut buf, self.idle_timeout_us);
        if self.flags & hello_flags::SWITCHDB != 0 {
            let database = self.database.as_deref().unwrap_or_default();
            put_lenenc(&mut buf, database.as_bytes());
        }
        put_lenenc(&mut buf, &self.auth_data.to_blob());
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = MessageReader::new(payload);
        let version = reader.read_varuint()?;
        if version != PROTOCOL_VERSION {
            return Err(EvqlError::Protocol(format!(
                "unsupported protocol version {}",
                version
            )));
        }

        let flags = reader.read_varuint()?;
        let idle_timeout_us = reader.read_varuint()?;
        let database = if flags & hello_flags::SWITCHDB != 0 {
            Some(reader.read_lenenc_string()?)
        } else {
            None
        };
        let auth_data = AuthData::from_blob(reader.read_lenenc()?)?;

        Ok(Self {
            version,
            flags,
            idle_timeout_us,
            database,
            auth_data,
        })
    }
}

/// Server acceptance of a HELLO, carrying the idle timeout the server will
/// enforce on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyFrame {
    pub idle_timeout_us: u64,
}

impl ReadyFrame {
    pub fn new(idle_timeout_us: u64) -> Self {
        Self { idle_timeout_us }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(10);
        put_varuint(&mut buf, self.idle_timeout_us);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = MessageReader::new(payload);
        Ok(Self {
            idle_timeout_us: reader.read_varuint()?,
        })
    }
}

/// Error report from the peer: a length-encoded message plus a terminator
/// byte. Retryability travels in the frame flags, not in the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub message: String,
}

impl ErrorFrame {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.message.len() + 6);
        put_lenenc(&mut buf, self.message.as_bytes());
        buf.put_u8(0);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = MessageReader::new(payload);
        let message = reader.read_lenenc_string()?;
        // older peers omit the terminator
        if reader.remaining() > 0 {
            reader.read_u8()?;
        }
        Ok(Self { message })
    }
}
