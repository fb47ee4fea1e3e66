//! EventQL Native Protocol Server
//!
//! The accepting side of the native transport: it performs the HELLO/READY
//! handshake (including token authentication), answers operations through a
//! caller-supplied async handler and keeps slow operations alive with
//! HEARTBEAT frames.

pub mod config;
pub mod server;

pub use config::ServerConfig;
pub use server::{NativeServer, Operation};
