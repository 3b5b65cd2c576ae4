//! TCP observer transport: newline-delimited JSON.
//!
//! Each accepted stream is split. The write half becomes a [`TcpConnection`]
//! registered with the [`ConnectionRegistry`]; the read half is served by a
//! per-client task that answers request lines until EOF, then disconnects.

use crate::kernel::SimulationKernel;
use crate::protocol::{self, ObserverRequest, ObserverResponse, ProtocolError, MAX_REQUEST_SIZE};
use crate::registry::{Connection, ConnectionRegistry, DeliveryError};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Write side of an observer stream. Writes are serialized so state lines
/// and request replies never interleave.
pub struct TcpConnection {
    peer: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
}

impl TcpConnection {
    pub fn new(peer: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            peer,
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&self, payload: &str) -> Result<(), DeliveryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeliveryError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(payload.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Error during close of {} (ignorable): {}", self.peer, e);
        }
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

/// Accept observers until the listener fails permanently. Accept errors on
/// individual connections are logged and skipped.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    kernel: Arc<SimulationKernel>,
) {
    match listener.local_addr() {
        Ok(addr) => info!("🌐 Observer server listening on {}", addr),
        Err(e) => warn!("Observer server listening on unknown address: {}", e),
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let registry = Arc::clone(&registry);
                let kernel = Arc::clone(&kernel);
                tokio::spawn(async move {
                    handle_observer(stream, addr, registry, kernel).await;
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Register one observer and serve its requests until it goes away.
pub async fn handle_observer(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    kernel: Arc<SimulationKernel>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
    }
    let (reader, writer) = stream.into_split();
    let connection = Arc::new(TcpConnection::new(addr, writer));
    let id = registry.add(connection.clone());

    if let Err(e) = serve_requests(reader, &connection, &kernel).await {
        warn!("Client {} error: {}", addr, e);
    }

    registry.disconnect(id).await;
    debug!("🔌 Client {} ({}) handler finished", addr, id);
}

enum RequestLine {
    Line(String),
    TooLong,
    Eof,
}

/// Read one request line, buffering at most `MAX_REQUEST_SIZE` bytes of it.
/// The rest of an oversized line is discarded as it arrives.
async fn next_request<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<RequestLine>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = MAX_REQUEST_SIZE as u64 + 1;
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(RequestLine::Eof);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if read as u64 == limit {
        skip_line(reader).await?;
        return Ok(RequestLine::TooLong);
    }
    Ok(RequestLine::Line(String::from_utf8_lossy(buf).into_owned()))
}

async fn skip_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let (consumed, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            }
        };
        reader.consume(consumed);
        if done {
            return Ok(());
        }
    }
}

async fn serve_requests(
    reader: OwnedReadHalf,
    connection: &TcpConnection,
    kernel: &SimulationKernel,
) -> Result<(), DeliveryError> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(MAX_REQUEST_SIZE + 1);

    loop {
        let parsed = match next_request(&mut reader, &mut buf).await? {
            RequestLine::Eof => return Ok(()),
            RequestLine::TooLong => Err(ProtocolError::MessageTooLarge),
            RequestLine::Line(line) if line.trim().is_empty() => continue,
            RequestLine::Line(line) => protocol::parse_request(&line),
        };

        let response = match parsed {
            Ok(ObserverRequest::Ping) => ObserverResponse::Pong,
            Ok(ObserverRequest::Status) => ObserverResponse::Status(kernel.status()),
            Err(e) => {
                warn!("Bad request from {}: {}", connection.peer(), e);
                ObserverResponse::Error {
                    message: e.to_string(),
                }
            }
        };

        match protocol::encode_response(&response) {
            Ok(encoded) => connection.send(&encoded).await?,
            Err(e) => error!("Failed to encode response for {}: {}", connection.peer(), e),
        }
    }
}
