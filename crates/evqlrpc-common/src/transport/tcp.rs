use std::io::ErrorKind;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::protocol::error::{EvqlError, Result};
use crate::transport::codec::{Frame, FrameCodec, FRAME_HEADER_LEN};

/// Async frame transport for blocking-style peers.
///
/// The dispatcher drives its sockets through readiness and never uses this
/// type. Servers and tests that own one connection per task read and write
/// whole frames through it instead.
///
/// # Example
///
/// ```no_run
/// use evqlrpc_common::opcode;
/// use evqlrpc_common::transport::{Frame, FrameTransport};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut stream = tokio::net::TcpStream::connect("127.0.0.1:9175").await?;
/// let transport = FrameTransport::new();
///
/// transport.write_frame(&mut stream, &Frame::empty(opcode::PING)).await?;
/// let reply = transport.read_frame(&mut stream).await?;
/// # let _ = reply;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameTransport {
    codec: FrameCodec,
}

impl FrameTransport {
    pub fn new() -> Self {
        Self::with_codec(FrameCodec::new())
    }

    pub fn with_codec(codec: FrameCodec) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Writes one frame and flushes the stream.
    pub async fn write_frame<S>(&self, stream: &mut S, frame: &Frame) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let encoded = self.codec.encode_frame(frame)?;
        stream
            .write_all(&encoded)
            .await
            .map_err(|e| map_io_error(e, "writing frame"))?;
        stream
            .flush()
            .await
            .map_err(|e| map_io_error(e, "flushing stream"))?;
        trace!(opcode = frame.opcode, len = frame.payload.len(), "frame written");
        Ok(())
    }

    /// Reads exactly one frame.
    ///
    /// The declared length is validated before the payload buffer is
    /// allocated.
    pub async fn read_frame<S>(&self, stream: &mut S) -> Result<Frame>
    where
        S: AsyncRead + Unpin,
    {
        self.read_frame_opt(stream).await?.ok_or_else(|| {
            EvqlError::Connection("connection closed by peer".to_string())
        })
    }

    /// Reads one frame, returning `Ok(None)` on a clean end of stream before
    /// any header byte arrived.
    pub async fn read_frame_opt<S>(&self, stream: &mut S) -> Result<Option<Frame>>
    where
        S: AsyncRead + Unpin,
    {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut filled = 0;
        while filled < FRAME_HEADER_LEN {
            let n = stream
                .read(&mut header[filled..])
                .await
                .map_err(|e| map_io_error(e, "reading frame header"))?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(EvqlError::Connection(
                    "connection lost inside frame header".to_string(),
                ));
            }
            filled += n;
        }

        let (opcode, flags, len) = self.codec.decode_header(&header)?;

        let mut payload = BytesMut::zeroed(len);
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| map_io_error(e, "reading frame payload"))?;

        trace!(opcode, flags, len, "frame read");
        Ok(Some(Frame {
            opcode,
            flags,
            payload: payload.freeze(),
        }))
    }
}

/// Maps I/O errors onto the connection-level error variants.
fn map_io_error(err: std::io::Error, context: &str) -> EvqlError {
    match err.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected => {
            EvqlError::Connection(format!("{}: connection lost", context))
        }
        _ => EvqlError::Io(err),
    }
}
