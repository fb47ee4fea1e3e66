use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use evqlrpc_common::transport::{Frame, FrameTransport};
use evqlrpc_common::{
    frame_flags, opcode, ErrorFrame, EvqlError, HelloFrame, ReadyFrame, Result,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;

/// One operation received on an established connection.
#[derive(Debug, Clone)]
pub struct Operation {
    pub opcode: u16,
    pub flags: u16,
    pub payload: Bytes,
    pub peer: SocketAddr,
    /// Database selected in HELLO, if any.
    pub database: Option<String>,
    /// The peer announced itself as server-to-server traffic.
    pub internal: bool,
}

/// Accepting side of the native protocol.
///
/// Each connection runs on its own tokio task: HELLO/READY handshake, then
/// operations answered one at a time until the peer says BYE, disconnects
/// or stays idle past the idle timeout. While an operation's handler runs,
/// HEARTBEAT frames keep the client's idle deadline from firing.
///
/// # Example
///
/// ```no_run
/// use evqlrpc_common::opcode;
/// use evqlrpc_common::transport::Frame;
/// use evqlrpc_server::{NativeServer, ServerConfig};
///
/// # #[tokio::main]
/// # async fn main() -> evqlrpc_common::Result<()> {
/// let server = NativeServer::bind("127.0.0.1:9175", ServerConfig::default()).await?;
/// server
///     .run_with_handler(|op| async move {
///         Ok::<_, evqlrpc_common::EvqlError>(vec![Frame::new(opcode::QUERY_RESULT, 0, op.payload)])
///     })
///     .await
/// # }
/// ```
pub struct NativeServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
}

impl NativeServer {
    /// Binds a listener on `bind_addr` (e.g. `"0.0.0.0:9175"`).
    pub async fn bind(bind_addr: &str, config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            EvqlError::Connection(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        Ok(Self {
            listener,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| EvqlError::Connection(format!("Failed to get local addr: {}", e)))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accepts connections forever, answering operations with `handler`.
    ///
    /// The handler's frames are sent in order; the server sets `MORE_DATA` on
    /// all but the last and `END_OF_REQUEST` on the last. A handler error is
    /// reported as an ERROR frame whose retryable bit follows
    /// [`EvqlError::is_retryable`].
    pub async fn run_with_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Operation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Frame>>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        info!(
            addr = ?self.listener.local_addr().ok(),
            auth = %self.config.auth,
            "native server listening"
        );

        loop {
            let (stream, peer) = self.listener.accept().await.map_err(|e| {
                EvqlError::Connection(format!("Failed to accept connection: {}", e))
            })?;
            debug!(peer = %peer, "connection accepted");

            let handler = handler.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                match handle_connection(stream, peer, config, handler).await {
                    Ok(()) => debug!(peer = %peer, "connection finished"),
                    Err(e) => warn!(peer = %peer, error = %e, "connection error"),
                }
            });
        }
    }
}

async fn handle_connection<F, Fut>(
    mut stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    handler: Arc<F>,
) -> Result<()>
where
    F: Fn(Operation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Frame>>> + Send + 'static,
{
    stream.set_nodelay(true)?;
    let transport = FrameTransport::with_codec(config.codec());

    let hello = match handshake(&mut stream, &transport, &config).await? {
        Some(hello) => hello,
        None => return Ok(()),
    };

    loop {
        let next = timeout(config.idle_timeout(), transport.read_frame_opt(&mut stream));
        let frame = match next.await {
            Ok(frame) => frame?,
            Err(_) => {
                debug!(peer = %peer, "idle timeout, closing");
                return Ok(());
            }
        };
        let frame = match frame {
            Some(frame) => frame,
            None => return Ok(()),
        };

        match frame.opcode {
            opcode::BYE => return Ok(()),
            opcode::HEARTBEAT => continue,
            opcode::PING => {
                transport
                    .write_frame(&mut stream, &Frame::empty(opcode::HEARTBEAT))
                    .await?;
            }
            op => {
                let operation = Operation {
                    opcode: op,
                    flags: frame.flags,
                    payload: frame.payload,
                    peer,
                    database: hello.database.clone(),
                    internal: hello.is_internal(),
                };
                run_operation(&mut stream, &transport, &config, &*handler, operation).await?;
            }
        }
    }
}

/// Reads HELLO and answers READY, or ERROR when the peer is rejected.
///
/// Returns `None` if the peer hung up before saying hello.
async fn handshake(
    stream: &mut TcpStream,
    transport: &FrameTransport,
    config: &ServerConfig,
) -> Result<Option<HelloFrame>> {
    let first = timeout(config.handshake_timeout(), transport.read_frame_opt(stream));
    let frame = match first.await {
        Ok(frame) => frame?,
        Err(_) => return Err(EvqlError::Timeout(config.handshake_timeout_ms)),
    };
    let frame = match frame {
        Some(frame) => frame,
        None => return Ok(None),
    };

    if frame.opcode != opcode::HELLO {
        let message = format!("expected HELLO, got {}", opcode::name(frame.opcode));
        send_error(stream, transport, &message, false).await?;
        return Err(EvqlError::Protocol(message));
    }

    let hello = match HelloFrame::decode(&frame.payload) {
        Ok(hello) => hello,
        Err(e) => {
            send_error(stream, transport, &e.to_string(), false).await?;
            return Err(e);
        }
    };

    if hello.idle_timeout_us <= config.heartbeat_interval_ms.saturating_mul(1000) {
        let message = format!(
            "idle timeout {}us is below the heartbeat interval {}ms",
            hello.idle_timeout_us, config.heartbeat_interval_ms
        );
        send_error(stream, transport, &message, false).await?;
        return Err(EvqlError::Protocol(message));
    }

    if !config.auth.validate(&hello.auth_data) {
        send_error(stream, transport, "authentication failed", false).await?;
        return Err(EvqlError::Auth("invalid credentials in HELLO".to_string()));
    }

    let ready = ReadyFrame::new(config.idle_timeout_ms.saturating_mul(1000));
    transport
        .write_frame(stream, &Frame::new(opcode::READY, 0, ready.encode()))
        .await?;
    debug!(
        internal = hello.is_internal(),
        database = ?hello.database,
        "handshake complete"
    );
    Ok(Some(hello))
}

/// Runs one operation, sending HEARTBEAT frames until the handler finishes.
async fn run_operation<F, Fut>(
    stream: &mut TcpStream,
    transport: &FrameTransport,
    config: &ServerConfig,
    handler: &F,
    operation: Operation,
) -> Result<()>
where
    F: Fn(Operation) -> Fut,
    Fut: Future<Output = Result<Vec<Frame>>>,
{
    let op = operation.opcode;
    let response = handler(operation);
    tokio::pin!(response);

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    heartbeat.tick().await;

    let result = loop {
        tokio::select! {
            result = &mut response => break result,
            _ = heartbeat.tick() => {
                transport
                    .write_frame(stream, &Frame::empty(opcode::HEARTBEAT))
                    .await?;
            }
        }
    };

    match result {
        Ok(frames) if frames.is_empty() => {
            send_error(stream, transport, "operation produced no result", false).await
        }
        Ok(frames) => {
            let last = frames.len() - 1;
            for (i, mut frame) in frames.into_iter().enumerate() {
                if i == last {
                    frame.flags |= frame_flags::END_OF_REQUEST;
                } else {
                    frame.flags |= frame_flags::MORE_DATA;
                }
                transport.write_frame(stream, &frame).await?;
            }
            Ok(())
        }
        Err(e) => {
            debug!(opcode = opcode::name(op), error = %e, "operation failed");
            let message = match &e {
                EvqlError::Remote { message, .. } => message.clone(),
                other => other.to_string(),
            };
            send_error(stream, transport, &message, e.is_retryable()).await
        }
    }
}

async fn send_error(
    stream: &mut TcpStream,
    transport: &FrameTransport,
    message: &str,
    retryable: bool,
) -> Result<()> {
    let flags = if retryable { frame_flags::RETRYABLE } else { 0 };
    let frame = Frame::new(opcode::ERROR, flags, ErrorFrame::new(message).encode());
    transport.write_frame(stream, &frame).await
}
