//! The transport seam.
//!
//! A [`Socket`] exchanges complete frames (header + payload); a
//! [`Listener`] yields connected sockets. Implementations are
//! transport-specific: TCP in [`crate::tcp`], in-memory mocks in tests.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use zircon_types::ServerAddress;

use crate::error::{FrameDefect, RpcError};
use crate::message::{FrameHeader, FRAME_HEADER_SIZE, FRAME_MAX_SIZE};

/// An abstract message-oriented connection.
#[async_trait]
pub trait Socket: Send + Sync + 'static {
    /// Send one complete frame (header included).
    async fn send(&self, frame: Bytes) -> Result<(), RpcError>;

    /// Receive one complete frame (header included).
    async fn recv(&self) -> Result<Bytes, RpcError>;

    /// Remote peer, for logging.
    fn peer(&self) -> ServerAddress;

    /// Close the connection gracefully.
    async fn close(&self);
}

/// Accepts incoming connections.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    type Socket: Socket;

    async fn accept(&self) -> Result<Self::Socket, RpcError>;

    /// The address this listener is bound to (with the resolved port).
    fn local_addr(&self) -> ServerAddress;
}

/// Frame a payload and send it.
pub async fn send_frame<S: Socket + ?Sized>(socket: &S, payload: &[u8]) -> Result<(), RpcError> {
    if payload.len() > FRAME_MAX_SIZE {
        return Err(FrameDefect::Oversize(payload.len()).into());
    }
    let header = FrameHeader::for_payload(payload);
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);
    socket.send(frame.freeze()).await
}

/// Receive one frame and validate it, returning the payload.
pub async fn recv_frame<S: Socket + ?Sized>(socket: &S) -> Result<Bytes, RpcError> {
    let frame = socket.recv().await?;
    if frame.len() < FRAME_HEADER_SIZE {
        return Err(FrameDefect::Short(frame.len()).into());
    }
    let header_bytes: [u8; FRAME_HEADER_SIZE] = frame[..FRAME_HEADER_SIZE]
        .try_into()
        .expect("length checked above");
    let header = FrameHeader::from_bytes(&header_bytes);

    let payload = &frame[FRAME_HEADER_SIZE..];
    if payload.len() < header.size as usize {
        return Err(FrameDefect::Short(frame.len()).into());
    }
    let payload = &payload[..header.size as usize];
    header.validate(payload)?;
    Ok(Bytes::copy_from_slice(payload))
}


#[cfg(test)]
mod tests {
    use super::mock::{framed, MockSocket};
    use super::*;
    use std::collections::VecDeque;

    #[tokio::test]
    async fn test_send_recv_roundtrip() {
        let socket = MockSocket::new("peer:1", VecDeque::new());
        send_frame(&socket, b"hello frames").await.unwrap();

        let sent = socket.sent.lock()[0].clone();
        socket.inbox.lock().push_back(sent);
        let payload = recv_frame(&socket).await.unwrap();
        assert_eq!(payload, Bytes::from_static(b"hello frames"));
    }

    #[tokio::test]
    async fn test_recv_rejects_short_frame() {
        let socket = MockSocket::new(
            "peer:1",
            VecDeque::from(vec![Bytes::from_static(b"abc")]),
        );
        assert!(matches!(
            recv_frame(&socket).await,
            Err(RpcError::BadFrame(FrameDefect::Short(3)))
        ));
    }

    #[tokio::test]
    async fn test_recv_rejects_corrupt_frame() {
        let mut frame = framed(b"payload").to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let socket = MockSocket::new("peer:1", VecDeque::from(vec![Bytes::from(frame)]));
        assert!(matches!(
            recv_frame(&socket).await,
            Err(RpcError::BadFrame(FrameDefect::Crc { .. }))
        ));
    }

    #[tokio::test]
    async fn test_recv_empty_inbox_is_closed() {
        let socket = MockSocket::new("peer:1", VecDeque::new());
        assert!(matches!(
            recv_frame(&socket).await,
            Err(RpcError::Disconnected)
        ));
    }
}
