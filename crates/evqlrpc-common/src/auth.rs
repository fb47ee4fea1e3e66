//! Authentication data carried in the HELLO handshake.
//!
//! Clients attach an ordered list of key/value pairs to HELLO. On the wire the
//! pairs form a single blob of NUL-terminated strings:
//!
//! ```text
//! key\0value\0key\0value\0...
//! ```
//!
//! Servers validate the pairs against an [`AuthConfig`]. The current
//! implementation supports a shared-secret token under the `auth_token` key.
//!
//! # Example
//!
//! ```
//! use evqlrpc_common::auth::{AuthConfig, AuthData};
//!
//! let mut data = AuthData::default();
//! data.insert("auth_token", "s3cret");
//!
//! let auth = AuthConfig::with_token("s3cret");
//! assert!(auth.validate(&data));
//! ```

use std::fmt;

use serde::Deserialize;

use crate::protocol::error::{EvqlError, Result};

/// Key under which the shared-secret token travels.
pub const AUTH_TOKEN_KEY: &str = "auth_token";

/// Ordered key/value authentication pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AuthData {
    pairs: Vec<(String, String)>,
}

impl AuthData {
    /// Shorthand for auth data holding only a shared-secret token.
    pub fn with_token(token: impl Into<String>) -> Self {
        let mut data = Self::default();
        data.insert(AUTH_TOKEN_KEY, token);
        data
    }

    /// Inserts or replaces a pair. Keys and values must not contain NUL.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serializes the pairs as `key\0value\0...`.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut blob = Vec::new();
        for (key, value) in &self.pairs {
            blob.extend_from_slice(key.as_bytes());
            blob.push(0);
            blob.extend_from_slice(value.as_bytes());
            blob.push(0);
        }
        blob
    }

    /// Parses a `key\0value\0...` blob.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the blob does not end in a terminator, if a
    /// key has no value, or if any string is not valid UTF-8.
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let mut data = Self::default();
        if blob.is_empty() {
            return Ok(data);
        }
        if blob.last() != Some(&0) {
            return Err(EvqlError::Protocol("unterminated auth blob".to_string()));
        }

        let mut parts = blob[..blob.len() - 1].split(|b| *b == 0);
        while let Some(key) = parts.next() {
            let value = parts
                .next()
                .ok_or_else(|| EvqlError::Protocol("auth key without value".to_string()))?;
            data.insert(utf8(key)?, utf8(value)?);
        }

        Ok(data)
    }
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| EvqlError::Protocol(format!("invalid auth string: {}", e)))
}

/// Server-side authentication policy for incoming HELLO frames.
///
/// Authentication is optional:
/// - **Disabled**: every HELLO is accepted (default)
/// - **Token**: HELLO must carry a matching `auth_token` pair
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AuthConfig {
    token: Option<String>,
}

impl AuthConfig {
    /// Requires clients to present `token` under [`AUTH_TOKEN_KEY`].
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn requires_auth(&self) -> bool {
        self.token.is_some()
    }

    /// Validates the pairs presented in HELLO.
    ///
    /// Uses constant-time comparison for the token. Always `true` when
    /// authentication is disabled.
    pub fn validate(&self, data: &AuthData) -> bool {
        match &self.token {
            Some(expected) => data
                .get(AUTH_TOKEN_KEY)
                .map(|provided| constant_time_eq(expected, provided))
                .unwrap_or(false),
            None => true,
        }
    }
}

impl fmt::Display for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.token {
            Some(_) => write!(f, "Token(*****)"),
            None => write!(f, "Disabled"),
        }
    }
}

/// Compares two strings without short-circuiting on the first difference.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (byte_a, byte_b) in a.bytes().zip(b.bytes()) {
        result |= byte_a ^ byte_b;
    }

    result == 0
}
