// SPDX-License-Identifier: AGPL-3.0
// LAN Shuttle Core - Framed connection handle

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::protocol::{CodecError, Frame, FrameCodec, Header};
use crate::types::{ShuttleError, ShuttleResult};

/// Any byte stream a link can run over (TCP, relay splice, in-memory pipe)
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// A bidirectional, framed link to one peer
pub struct Connection {
    framed: Framed<BoxedTransport, FrameCodec>,
    peer: String,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

fn map_codec_error(err: CodecError) -> ShuttleError {
    match err {
        CodecError::Io(e) => ShuttleError::TransportDisconnected(e.to_string()),
        CodecError::Malformed(msg) => ShuttleError::Protocol(msg),
    }
}

impl Connection {
    pub fn new<T: Transport + 'static>(io: T, peer: impl Into<String>) -> Self {
        let boxed: BoxedTransport = Box::new(io);
        Self {
            framed: Framed::new(boxed, FrameCodec),
            peer: peer.into(),
        }
    }

    /// Address or description of the remote side
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send(&mut self, frame: impl Into<Frame>) -> ShuttleResult<()> {
        self.framed.send(frame.into()).await.map_err(map_codec_error)
    }

    /// Send, treating a peer that stops reading for `timeout` as gone
    pub async fn send_timeout(
        &mut self,
        frame: impl Into<Frame>,
        timeout: Duration,
    ) -> ShuttleResult<()> {
        let sent = tokio::time::timeout(timeout, self.send(frame)).await;
        match sent {
            Ok(result) => result,
            Err(_) => Err(ShuttleError::TransportDisconnected(format!(
                "{} stopped reading for {:?}",
                self.peer, timeout
            ))),
        }
    }

    /// Next frame; a closed stream is a disconnect
    pub async fn recv(&mut self) -> ShuttleResult<Frame> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => Err(map_codec_error(e)),
            None => Err(ShuttleError::TransportDisconnected(format!(
                "{} closed the connection",
                self.peer
            ))),
        }
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> ShuttleResult<Frame> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| {
                ShuttleError::TransportDisconnected(format!(
                    "no frame from {} within {:?}",
                    self.peer, timeout
                ))
            })?
    }

    /// Receive a frame that must not carry chunk data
    pub async fn recv_header(&mut self, timeout: Duration) -> ShuttleResult<Header> {
        Ok(self.recv_timeout(timeout).await?.header)
    }

    /// Give back the raw stream plus any bytes already read past the last frame
    pub fn into_inner(self) -> (BoxedTransport, BytesMut) {
        let parts = self.framed.into_parts();
        (parts.io, parts.read_buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AckStatus;

    #[tokio::test]
    async fn test_frames_cross_a_pipe() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut left = Connection::new(a, "left");
        let mut right = Connection::new(b, "right");

        left.send(Header::Ack {
            file_index: 0,
            chunk_index: 1,
            status: AckStatus::Ok,
        })
        .await
        .unwrap();

        let header = right.recv_header(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(header, Header::Ack { chunk_index: 1, .. }));
    }

    #[tokio::test]
    async fn test_closed_peer_is_disconnect() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = Connection::new(a, "left");
        drop(b);

        assert!(matches!(
            left.recv().await,
            Err(ShuttleError::TransportDisconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_send_timeout_when_peer_stops_reading() {
        let (a, _b) = tokio::io::duplex(1024);
        let mut left = Connection::new(a, "left");
        let frame = Frame::chunk(0, 0, 0, bytes::Bytes::from(vec![7u8; 8192]));
        let result = left.send_timeout(frame, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ShuttleError::TransportDisconnected(_))));
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let (a, _b) = tokio::io::duplex(1024);
        let mut left = Connection::new(a, "left");
        let result = left.recv_timeout(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ShuttleError::TransportDisconnected(_))));
    }
}
