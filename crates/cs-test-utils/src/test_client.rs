//! Raw RESP test client.
//!
//! A thin framed wrapper over a `TcpStream` so tests can speak the wire
//! protocol directly: send token arrays, receive frames with a deadline, and
//! assert the peer closed the connection.

use cs_resp::{Frame, FrameError, RespCodec};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// Default deadline for a single expected frame.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestClient {
    framed: Framed<TcpStream, RespCodec>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(TestClient {
            framed: Framed::new(stream, RespCodec::new()),
        })
    }

    /// Send one command as an array of bulk strings.
    pub async fn send_tokens<I, S>(&mut self, tokens: I) -> Result<(), FrameError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.framed.send(Frame::array_of(tokens)).await
    }

    /// Send an arbitrary frame (for malformed-shape tests).
    pub async fn send_frame(&mut self, frame: Frame) -> Result<(), FrameError> {
        self.framed.send(frame).await
    }

    /// Receive the next frame, panicking on timeout, close, or decode error.
    pub async fn recv(&mut self) -> Result<Frame, FrameError> {
        match tokio::time::timeout(RECV_TIMEOUT, self.framed.next()).await {
            Err(_) => panic!("timed out waiting for a frame"),
            Ok(None) => panic!("connection closed while a frame was expected"),
            Ok(Some(result)) => result,
        }
    }

    /// Receive the next frame or `None` if the peer closes first.
    pub async fn recv_or_eof(&mut self) -> Option<Frame> {
        match tokio::time::timeout(RECV_TIMEOUT, self.framed.next()).await {
            Err(_) => panic!("timed out waiting for a frame or close"),
            Ok(None) => None,
            Ok(Some(result)) => Some(result.expect("decode error")),
        }
    }

    /// Assert the peer closes the connection within the deadline.
    pub async fn expect_eof(&mut self) {
        match tokio::time::timeout(RECV_TIMEOUT, self.framed.next()).await {
            Err(_) => panic!("timed out waiting for the peer to close"),
            Ok(None) => {}
            Ok(Some(frame)) => panic!("expected close, got frame: {frame:?}"),
        }
    }
}
