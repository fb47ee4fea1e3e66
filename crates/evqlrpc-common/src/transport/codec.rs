use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::error::{EvqlError, Result};

/// Size of the fixed frame header: `opcode:u16, flags:u16, length:u32`.
pub const FRAME_HEADER_LEN: usize = 8;

/// Hard ceiling on a frame payload (256 MB). Larger frames are rejected.
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Soft ceiling on a frame payload (1 MB). Larger frames are accepted but
/// flagged; operations should split responses above it into `MORE_DATA`
/// continuation frames.
pub const MAX_FRAME_SIZE_SOFT: usize = 1024 * 1024;

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u16,
    pub flags: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: u16, flags: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            flags,
            payload: payload.into(),
        }
    }

    /// A frame with no payload (HEARTBEAT, BYE).
    pub fn empty(opcode: u16) -> Self {
        Self::new(opcode, 0, Bytes::new())
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// A frame pulled out of a byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub frame: Frame,
    /// Header plus payload bytes the frame occupied in the buffer.
    pub consumed: usize,
    /// The payload exceeds the codec's soft ceiling.
    pub over_soft_limit: bool,
}

/// Codec for the fixed binary frame envelope.
///
/// # Wire Format
///
/// ```text
/// +-----------+-----------+--------------+------------------+
/// | opcode:16 | flags:16  | length:32    | payload (length) |
/// +-----------+-----------+--------------+------------------+
/// ```
///
/// All integers are big-endian. Decoding is non-destructive until a complete
/// frame is buffered, so callers can keep appending bytes from non-blocking
/// reads and retry.
///
/// # Example
///
/// ```
/// use bytes::BytesMut;
/// use evqlrpc_common::transport::FrameCodec;
///
/// let codec = FrameCodec::new();
/// let mut buf = BytesMut::new();
/// codec.encode(0x0006, 0, b"SELECT 1;", &mut buf).unwrap();
///
/// let decoded = codec.try_decode(&buf).unwrap().unwrap();
/// assert_eq!(decoded.frame.opcode, 0x0006);
/// assert_eq!(&decoded.frame.payload[..], b"SELECT 1;");
/// assert_eq!(decoded.consumed, buf.len());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_size: usize,
    max_frame_size_soft: usize,
}

impl FrameCodec {
    /// Creates a codec with the default hard and soft ceilings.
    pub fn new() -> Self {
        Self::with_limits(MAX_FRAME_SIZE, MAX_FRAME_SIZE_SOFT)
    }

    /// Creates a codec with custom ceilings. The soft ceiling is clamped to
    /// the hard one.
    pub fn with_limits(max_frame_size: usize, max_frame_size_soft: usize) -> Self {
        let max_frame_size = max_frame_size.min(u32::MAX as usize);
        Self {
            max_frame_size,
            max_frame_size_soft: max_frame_size_soft.min(max_frame_size),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn max_frame_size_soft(&self) -> usize {
        self.max_frame_size_soft
    }

    /// Appends one encoded frame to `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`EvqlError::FrameTooLarge`] if the payload exceeds the hard
    /// ceiling; nothing is written in that case.
    pub fn encode(&self, opcode: u16, flags: u16, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        if payload.len() > self.max_frame_size {
            return Err(EvqlError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(FRAME_HEADER_LEN + payload.len());
        dst.put_u16(opcode);
        dst.put_u16(flags);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(payload);
        Ok(())
    }

    /// Encodes a [`Frame`] into a new buffer.
    pub fn encode_frame(&self, frame: &Frame) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + frame.payload.len());
        self.encode(frame.opcode, frame.flags, &frame.payload, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Parses a header, validating the declared length against the hard
    /// ceiling. Returns `(opcode, flags, length)`.
    pub fn decode_header(&self, header: &[u8; FRAME_HEADER_LEN]) -> Result<(u16, u16, usize)> {
        let mut cursor = &header[..];
        let opcode = cursor.get_u16();
        let flags = cursor.get_u16();
        let len = cursor.get_u32() as usize;
        if len > self.max_frame_size {
            return Err(EvqlError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }
        Ok((opcode, flags, len))
    }

    /// Attempts to decode one frame from the front of `buf` without consuming
    /// it.
    ///
    /// Returns `Ok(None)` while the frame is incomplete. An oversize length is
    /// rejected as soon as the header is available, before any payload is
    /// buffered or allocated.
    pub fn try_decode(&self, buf: &[u8]) -> Result<Option<DecodedFrame>> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&buf[..FRAME_HEADER_LEN]);
        let (opcode, flags, len) = self.decode_header(&header)?;

        let total = FRAME_HEADER_LEN + len;
        if buf.len() < total {
            return Ok(None);
        }

        Ok(Some(DecodedFrame {
            frame: Frame {
                opcode,
                flags,
                payload: Bytes::copy_from_slice(&buf[FRAME_HEADER_LEN..total]),
            },
            consumed: total,
            over_soft_limit: len > self.max_frame_size_soft,
        }))
    }

    /// Decodes one frame from the front of `buf`, consuming its bytes.
    ///
    /// The payload is split off the buffer without copying.
    pub fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<DecodedFrame>> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&buf[..FRAME_HEADER_LEN]);
        let (opcode, flags, len) = self.decode_header(&header)?;

        let total = FRAME_HEADER_LEN + len;
        if buf.len() < total {
            // make room for the rest of the frame in one allocation
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_LEN);
        let payload = buf.split_to(len).freeze();

        Ok(Some(DecodedFrame {
            frame: Frame {
                opcode,
                flags,
                payload,
            },
            consumed: total,
            over_soft_limit: len > self.max_frame_size_soft,
        }))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
