use std::fmt;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use evqlrpc_common::transport::{DecodedFrame, Frame, FrameCodec};
use evqlrpc_common::{frame_flags, opcode, ErrorFrame, EvqlError, ReadyFrame, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// Connection lifecycle.
///
/// ```text
/// CONNECTING -> CONNECTED -> HANDSHAKE -> READY -> RUNNING -> READY | IDLE | CLOSE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Connecting,
    Connected,
    Handshake,
    Ready,
    Running,
    Idle,
    Close,
}

impl ConnectionState {
    pub(crate) fn name(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Handshake => "HANDSHAKE",
            ConnectionState::Ready => "READY",
            ConnectionState::Running => "RUNNING",
            ConnectionState::Idle => "IDLE",
            ConnectionState::Close => "CLOSE",
        }
    }

    fn handshake_done(self) -> bool {
        matches!(
            self,
            ConnectionState::Ready | ConnectionState::Running | ConnectionState::Idle
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a decoded frame means for the dispatcher.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FrameEvent {
    /// The handshake completed.
    Ready,
    /// Keepalive from the peer; nothing to deliver.
    Heartbeat,
    /// A frame for the bound task.
    Result(Frame),
}

/// Outcome of draining the socket.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadOutcome {
    pub(crate) bytes: usize,
    pub(crate) eof: bool,
}

/// One outbound connection to a host.
///
/// Owns the socket plus its read and write buffers. All I/O is non-blocking:
/// the dispatcher waits for readiness and then calls [`perform_read`] or
/// [`perform_write`], which move as many bytes as the socket accepts.
///
/// [`perform_read`]: Connection::perform_read
/// [`perform_write`]: Connection::perform_write
pub(crate) struct Connection {
    /// Unique for the dispatcher's lifetime, unlike the slab key.
    pub(crate) id: u64,
    pub(crate) host: String,
    pub(crate) addr: SocketAddr,
    pub(crate) state: ConnectionState,
    pub(crate) task: Option<usize>,
    pub(crate) read_deadline: Option<Instant>,
    pub(crate) write_deadline: Option<Instant>,
    /// Idle timeout the peer announced in READY.
    pub(crate) peer_idle_timeout: Option<Duration>,
    stream: TcpStream,
    codec: FrameCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("task", &self.task)
            .field("buffered_read", &self.read_buf.len())
            .field("buffered_write", &self.write_buf.len())
            .finish()
    }
}

/// `connect()` on a non-blocking socket reports an in-flight handshake this way.
fn connect_in_progress(err: &io::Error) -> bool {
    is_einprogress(err) || err.kind() == ErrorKind::WouldBlock
}

#[cfg(unix)]
fn is_einprogress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(not(unix))]
fn is_einprogress(_err: &io::Error) -> bool {
    false
}

impl Connection {
    /// Starts a non-blocking connect to `addr`.
    ///
    /// Failing to create or register the socket is a local resource problem
    /// and is returned as [`EvqlError::Resource`]; an immediate connect
    /// refusal is an ordinary connection error.
    pub(crate) fn connect(
        id: u64,
        host: &str,
        addr: SocketAddr,
        codec: FrameCodec,
        connect_deadline: Instant,
    ) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| EvqlError::Resource(format!("socket() creation failed: {}", e)))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| EvqlError::Resource(format!("failed to set O_NONBLOCK: {}", e)))?;
        socket
            .set_nodelay(true)
            .map_err(|e| EvqlError::Resource(format!("failed to set TCP_NODELAY: {}", e)))?;

        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(e) => {
                return Err(EvqlError::Connection(format!(
                    "connect to {} ({}) failed: {}",
                    host, addr, e
                )))
            }
        }

        let stream = TcpStream::from_std(socket.into())
            .map_err(|e| EvqlError::Resource(format!("failed to register socket: {}", e)))?;

        debug!(host = %host, addr = %addr, conn = id, "opening connection");

        Ok(Self {
            id,
            host: host.to_string(),
            addr,
            state: ConnectionState::Connecting,
            task: None,
            read_deadline: None,
            write_deadline: Some(connect_deadline),
            peer_idle_timeout: None,
            stream,
            codec,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
        })
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Readiness the event loop should wait for.
    pub(crate) fn interest(&self) -> Interest {
        if self.state == ConnectionState::Connecting {
            // a failed connect reports writable too; read readiness is never
            // cleared until the handshake starts
            Interest::WRITABLE
        } else if self.write_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// Earliest pending deadline.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        match (self.read_deadline, self.write_deadline) {
            (Some(r), Some(w)) => Some(r.min(w)),
            (r, w) => r.or(w),
        }
    }

    /// Which deadline has passed, if any: `Some(true)` for the read deadline,
    /// `Some(false)` for the write deadline.
    pub(crate) fn expired(&self, now: Instant) -> Option<bool> {
        if self.read_deadline.map_or(false, |d| d <= now) {
            Some(true)
        } else if self.write_deadline.map_or(false, |d| d <= now) {
            Some(false)
        } else {
            None
        }
    }

    pub(crate) fn has_pending_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Completes a non-blocking connect after write readiness and queues HELLO.
    ///
    /// Returns `Ok(false)` if the wakeup was spurious and the connect is still
    /// in flight.
    pub(crate) fn finish_connect(
        &mut self,
        hello: &Bytes,
        now: Instant,
        idle_timeout: Duration,
    ) -> Result<bool> {
        if let Some(e) = self.stream.take_error()? {
            return Err(EvqlError::Connection(format!(
                "connect to {} ({}) failed: {}",
                self.host, self.addr, e
            )));
        }

        match self.stream.peer_addr() {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotConnected => {
                // clear the cached readiness so the loop waits again
                let _ = self.stream.try_io(Interest::WRITABLE, || {
                    Err::<(), _>(io::Error::from(ErrorKind::WouldBlock))
                });
                return Ok(false);
            }
            Err(e) => {
                return Err(EvqlError::Connection(format!(
                    "connect to {} ({}) failed: {}",
                    self.host, self.addr, e
                )))
            }
        }

        self.state = ConnectionState::Connected;
        self.write_deadline = None;
        self.read_deadline = Some(now + idle_timeout);
        trace!(host = %self.host, conn = self.id, "connected, sending HELLO");

        self.write_buf.extend_from_slice(hello);
        self.state = ConnectionState::Handshake;
        Ok(true)
    }

    /// Queues the bound task's request frame and enters `RUNNING`.
    pub(crate) fn send_request(
        &mut self,
        task: usize,
        request: &Bytes,
        now: Instant,
        idle_timeout: Duration,
    ) {
        self.task = Some(task);
        self.write_buf.extend_from_slice(request);
        self.state = ConnectionState::Running;
        self.read_deadline = Some(now + idle_timeout);
    }

    /// The bound task finished; the connection waits for its next use.
    pub(crate) fn finish_task(&mut self) -> Option<usize> {
        self.state = ConnectionState::Ready;
        self.read_deadline = None;
        self.task.take()
    }

    /// Parks the connection in the idle pool.
    pub(crate) fn park(&mut self) {
        self.state = ConnectionState::Idle;
        self.task = None;
        self.read_deadline = None;
        self.write_deadline = None;
    }

    /// Takes a parked connection back into service.
    pub(crate) fn unpark(&mut self) {
        self.state = ConnectionState::Ready;
    }

    /// Writes as much of the write buffer as the socket accepts.
    ///
    /// A partially drained buffer arms the write deadline; an empty one
    /// clears it.
    pub(crate) fn perform_write(&mut self, now: Instant, io_timeout: Duration) -> Result<usize> {
        let mut written = 0;
        while !self.write_buf.is_empty() {
            match self.stream.try_write(&self.write_buf) {
                Ok(0) => {
                    return Err(EvqlError::Connection(format!(
                        "connection to {} closed while writing",
                        self.host
                    )))
                }
                Ok(n) => {
                    self.write_buf.advance(n);
                    written += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(EvqlError::Io(e)),
            }
        }

        if self.write_buf.is_empty() {
            self.write_deadline = None;
        } else {
            self.write_deadline = Some(now + io_timeout);
        }
        Ok(written)
    }

    /// Reads until the socket would block or reports end of stream.
    ///
    /// Any progress pushes the read deadline out while the connection is
    /// waiting on the peer.
    pub(crate) fn perform_read(
        &mut self,
        batch_size: usize,
        now: Instant,
        idle_timeout: Duration,
    ) -> Result<ReadOutcome> {
        let mut outcome = ReadOutcome::default();
        loop {
            self.read_buf.reserve(batch_size);
            match self.stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => {
                    outcome.eof = true;
                    break;
                }
                Ok(n) => outcome.bytes += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(EvqlError::Io(e)),
            }
        }

        if outcome.bytes > 0 && self.awaiting_peer() {
            self.read_deadline = Some(now + idle_timeout);
        }
        Ok(outcome)
    }

    fn awaiting_peer(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Handshake | ConnectionState::Running
        )
    }

    /// Whether end of stream at this point loses work.
    pub(crate) fn eof_is_error(&self) -> bool {
        self.task.is_some() || self.awaiting_peer() || !self.read_buf.is_empty()
    }

    /// Pops the next complete frame off the read buffer.
    pub(crate) fn next_frame(&mut self) -> Result<Option<DecodedFrame>> {
        self.codec.decode_from(&mut self.read_buf)
    }

    /// Interprets a frame in the current state.
    pub(crate) fn on_frame(&mut self, decoded: DecodedFrame) -> Result<FrameEvent> {
        let frame = decoded.frame;
        if decoded.over_soft_limit {
            warn!(
                host = %self.host,
                opcode = opcode::name(frame.opcode),
                len = frame.payload.len(),
                "frame above soft size limit"
            );
        }

        match (self.state, frame.opcode) {
            (_, opcode::BYE) => Err(EvqlError::Connection(format!(
                "server {} said BYE",
                self.host
            ))),
            (ConnectionState::Handshake, opcode::ERROR) => {
                let message = error_message(&frame);
                Err(EvqlError::Connection(format!(
                    "handshake rejected by {}: {}",
                    self.host, message
                )))
            }
            (_, opcode::ERROR) => Err(EvqlError::Remote {
                message: error_message(&frame),
                retryable: frame.has_flag(frame_flags::RETRYABLE),
            }),
            (ConnectionState::Handshake, opcode::READY) => {
                let ready = ReadyFrame::decode(&frame.payload)?;
                if ready.idle_timeout_us > 0 {
                    self.peer_idle_timeout = Some(Duration::from_micros(ready.idle_timeout_us));
                }
                self.state = ConnectionState::Ready;
                self.read_deadline = None;
                debug!(host = %self.host, conn = self.id, "handshake complete");
                Ok(FrameEvent::Ready)
            }
            (state, opcode::HEARTBEAT) if state.handshake_done() || state == ConnectionState::Handshake => {
                trace!(host = %self.host, conn = self.id, "heartbeat");
                Ok(FrameEvent::Heartbeat)
            }
            (ConnectionState::Running, op) if op != opcode::HELLO && op != opcode::READY => {
                Ok(FrameEvent::Result(frame))
            }
            (state, op) => Err(EvqlError::UnexpectedOpcode {
                opcode: op,
                state: state.name(),
            }),
        }
    }

    /// Checks whether a parked connection survived its idle period.
    ///
    /// Bytes that arrived meanwhile stay buffered for the next read.
    pub(crate) fn probe_alive(&mut self) -> bool {
        self.read_buf.reserve(64);
        match self.stream.try_read_buf(&mut self.read_buf) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    /// Closes the socket, announcing BYE first when the handshake had
    /// completed. The BYE write is best effort and never waits.
    pub(crate) fn close(mut self, say_goodbye: bool) {
        if say_goodbye && self.state.handshake_done() && self.write_buf.is_empty() {
            if let Ok(bye) = self.codec.encode_frame(&Frame::empty(opcode::BYE)) {
                let _ = self.stream.try_write(&bye);
            }
        }
        self.state = ConnectionState::Close;
        debug!(host = %self.host, conn = self.id, "connection closed");
    }
}

fn error_message(frame: &Frame) -> String {
    ErrorFrame::decode(&frame.payload)
        .map(|e| e.message)
        .unwrap_or_else(|e| format!("unreadable ERROR frame: {}", e))
}
