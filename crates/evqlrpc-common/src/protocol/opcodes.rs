//! Opcode catalog and flag bits of the native protocol.
//!
//! The dispatcher only interprets the handshake, control and error opcodes;
//! every other opcode is carried opaquely between the caller and the peer.

/// Frame opcodes.
pub mod opcode {
    pub const HELLO: u16 = 0x5e00;
    pub const PING: u16 = 0x0001;
    pub const HEARTBEAT: u16 = 0x0002;
    pub const ERROR: u16 = 0x0003;
    pub const READY: u16 = 0x0004;
    pub const BYE: u16 = 0x0005;
    pub const QUERY: u16 = 0x0006;
    pub const QUERY_RESULT: u16 = 0x0007;
    pub const QUERY_CONTINUE: u16 = 0x0008;
    pub const QUERY_DISCARD: u16 = 0x0009;
    pub const QUERY_PROGRESS: u16 = 0x0010;
    pub const QUERY_NEXT: u16 = 0x0011;
    pub const QUERY_PARTIALAGGR: u16 = 0x0012;
    pub const QUERY_PARTIALAGGR_RESULT: u16 = 0x0013;

    /// Human readable opcode name for logs.
    pub fn name(op: u16) -> &'static str {
        match op {
            HELLO => "HELLO",
            PING => "PING",
            HEARTBEAT => "HEARTBEAT",
            ERROR => "ERROR",
            READY => "READY",
            BYE => "BYE",
            QUERY => "QUERY",
            QUERY_RESULT => "QUERY_RESULT",
            QUERY_CONTINUE => "QUERY_CONTINUE",
            QUERY_DISCARD => "QUERY_DISCARD",
            QUERY_PROGRESS => "QUERY_PROGRESS",
            QUERY_NEXT => "QUERY_NEXT",
            QUERY_PARTIALAGGR => "QUERY_PARTIALAGGR",
            QUERY_PARTIALAGGR_RESULT => "QUERY_PARTIALAGGR_RESULT",
            _ => "UNKNOWN",
        }
    }
}

/// Frame header flag bits.
pub mod frame_flags {
    /// Last frame of a request/response exchange.
    pub const END_OF_REQUEST: u16 = 0x1;
    /// More frames follow for the same exchange (split oversized responses).
    pub const MORE_DATA: u16 = 0x2;
    /// Set on ERROR frames whose failure is transient.
    pub const RETRYABLE: u16 = 0x4;
}

/// Capability bits carried in the HELLO payload.
pub mod hello_flags {
    pub const INTERNAL: u64 = 0x1;
    pub const SWITCHDB: u64 = 0x2;
    pub const INTERACTIVEAUTH: u64 = 0x4;
}

/// Protocol version announced in HELLO.
pub const PROTOCOL_VERSION: u64 = 1;
