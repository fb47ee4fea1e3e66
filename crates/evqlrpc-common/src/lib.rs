//! EventQL Native RPC Common Types and Transport
//!
//! This crate provides the protocol definitions and frame transport shared by
//! the fan-out dispatcher and the native protocol server.
//!
//! # Overview
//!
//! Servers in an EventQL cluster talk to each other over the native protocol:
//! a TCP stream of binary frames. A connection opens with a HELLO/READY
//! handshake, after which operation frames (QUERY, PARTIALAGGR, ...) and their
//! results flow in request/response order. Long running operations are kept
//! alive with HEARTBEAT frames, and BYE closes a connection cleanly.
//!
//! # Components
//!
//! - [`protocol`] - Opcodes, flags, control frame payloads and the error type
//! - [`transport`] - Frame codec and async frame transport
//! - [`auth`] - Authentication pairs carried in HELLO
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use evqlrpc_common::transport::FrameCodec;
//! use evqlrpc_common::{opcode, HelloFrame};
//!
//! let hello = HelloFrame::new(1_000_000).internal();
//!
//! let codec = FrameCodec::new();
//! let mut buf = BytesMut::new();
//! codec.encode(opcode::HELLO, 0, &hello.encode(), &mut buf).unwrap();
//!
//! let decoded = codec.decode_from(&mut buf).unwrap().unwrap();
//! assert_eq!(HelloFrame::decode(&decoded.frame.payload).unwrap(), hello);
//! ```

pub mod auth;
pub mod protocol;
pub mod transport;

pub use protocol::*;
