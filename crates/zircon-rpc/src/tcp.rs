//! TCP transport.
//!
//! [`TcpSocket`] splits the stream into independent read/write halves so
//! sending and receiving never contend on one lock; receives are
//! length-delimited by the frame header (`read_exact` of the 8-byte
//! header, then of the declared payload).

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use zircon_types::ServerAddress;

use crate::error::{FrameDefect, RpcError};
use crate::message::{FrameHeader, FRAME_HEADER_SIZE, FRAME_MAX_SIZE};
use crate::socket::{Listener, Socket};

fn eof_as_disconnect(err: std::io::Error) -> RpcError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        RpcError::Disconnected
    } else {
        RpcError::Io(err)
    }
}

/// A framed TCP connection.
pub struct TcpSocket {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    peer: ServerAddress,
}

impl TcpSocket {
    pub fn from_stream(stream: tokio::net::TcpStream) -> Result<Self, RpcError> {
        let peer = ServerAddress::from(stream.peer_addr()?.to_string());
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer,
        })
    }

    /// Dial `address` (a `host:port` string).
    pub async fn connect(address: &ServerAddress) -> Result<Self, RpcError> {
        let stream = tokio::net::TcpStream::connect(address.as_str())
            .await
            .map_err(|_| RpcError::Unreachable(address.to_string()))?;
        Self::from_stream(stream)
    }
}

#[async_trait]
impl Socket for TcpSocket {
    async fn send(&self, frame: Bytes) -> Result<(), RpcError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes, RpcError> {
        let mut reader = self.reader.lock().await;

        let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
        reader
            .read_exact(&mut header_bytes)
            .await
            .map_err(eof_as_disconnect)?;
        let header = FrameHeader::from_bytes(&header_bytes);

        let size = header.size as usize;
        if size > FRAME_MAX_SIZE {
            return Err(FrameDefect::Oversize(size).into());
        }

        let mut frame = BytesMut::zeroed(FRAME_HEADER_SIZE + size);
        frame[..FRAME_HEADER_SIZE].copy_from_slice(&header_bytes);
        reader
            .read_exact(&mut frame[FRAME_HEADER_SIZE..])
            .await
            .map_err(eof_as_disconnect)?;
        Ok(frame.freeze())
    }

    fn peer(&self) -> ServerAddress {
        self.peer.clone()
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// A TCP listener yielding [`TcpSocket`]s.
pub struct TcpListener {
    inner: tokio::net::TcpListener,
    local_addr: ServerAddress,
}

impl TcpListener {
    /// Bind to `address` (`host:port`; port 0 picks a free one, and
    /// `local_addr` reports the resolved port).
    pub async fn bind(address: &str) -> Result<Self, RpcError> {
        let inner = tokio::net::TcpListener::bind(address)
            .await
            .map_err(|_| RpcError::Unreachable(address.to_string()))?;
        let local_addr = ServerAddress::from(inner.local_addr()?.to_string());
        tracing::info!(%local_addr, "tcp listener bound");
        Ok(Self { inner, local_addr })
    }
}

#[async_trait]
impl Listener for TcpListener {
    type Socket = TcpSocket;

    async fn accept(&self) -> Result<TcpSocket, RpcError> {
        let (stream, _) = self.inner.accept().await?;
        TcpSocket::from_stream(stream)
    }

    fn local_addr(&self) -> ServerAddress {
        self.local_addr.clone()
    }
}

/// Dials [`TcpSocket`]s for the client connection pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl crate::client::Connector<TcpSocket> for TcpConnector {
    async fn connect(&self, address: &ServerAddress) -> Result<TcpSocket, RpcError> {
        TcpSocket::connect(address).await
    }
}
