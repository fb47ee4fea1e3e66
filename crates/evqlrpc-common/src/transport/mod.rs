//! EventQL Native Transport Layer
//!
//! This module provides the binary frame codec and an async frame transport.
//!
//! # Architecture
//!
//! Every message on a connection is a frame:
//! - **Header**: 8 bytes, `opcode:u16 | flags:u16 | length:u32`, big-endian
//! - **Payload**: `length` opaque bytes
//! - **Hard limit**: 256 MB per payload (configurable)
//! - **Soft limit**: 1 MB per payload, above which responses should be split
//!
//! # Components
//!
//! - **[`FrameCodec`]**: Encode frames and decode them out of partial buffers
//! - **[`FrameTransport`]**: Whole-frame async reads and writes (used by servers)

pub mod codec;
pub mod tcp;

pub use codec::{
    DecodedFrame, Frame, FrameCodec, FRAME_HEADER_LEN, MAX_FRAME_SIZE, MAX_FRAME_SIZE_SOFT,
};
pub use tcp::FrameTransport;
