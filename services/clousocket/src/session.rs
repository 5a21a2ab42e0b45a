//! Per-connection session runtime.
//!
//! An admitted connection is driven by two cooperative loops under one
//! `select!`: the heartbeat loop (adaptive keepalive cycle) and the I/O loop
//! (frame reads, deserialization, dispatch).  Whichever loop exits first
//! cancels the other, and the socket is closed exactly once on the way out.
//!
//! # Heartbeat cycle
//! sleep `current_interval`; then, under the `hb-timeout` deadline, wait for
//! the peer's pong, recompute the interval, and send `HEARTBEAT ACK <ms>`.
//! A missed deadline sends a best-effort `HEARTBEAT TIMEOUT` and ends the
//! session.
//!
//! The pong is signaled by the I/O loop for any decoded frame whose command
//! lowercases to `heartbeat`, including ones carrying extra tokens.  Such
//! frames never reach a handler and do not count as activity.

use crate::catalog::{CommandTree, Deserializer, DeserializeError};
use crate::handlers::{HandlerContext, HandlerRegistry};
use crate::heartbeat::HeartbeatState;
use crate::store::StoreClient;
use cs_resp::{Frame, FrameError, RespCodec};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Notify;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

/// Writer half of a session, shared between the heartbeat loop and command
/// handlers.
pub type FrameWriter = Arc<tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, RespCodec>>>;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("heartbeat timed out")]
    HeartbeatTimeout,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("handler '{function}' failed: {reason}")]
    Handler { function: String, reason: String },
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session {
    peer: SocketAddr,
    heartbeat: Mutex<HeartbeatState>,
    heartbeat_timeout: Duration,
    pong: Notify,
    deserializer: Arc<Deserializer>,
    handlers: Arc<HandlerRegistry>,
    store: Arc<StoreClient>,
}

impl Session {
    pub fn new(
        peer: SocketAddr,
        heartbeat: HeartbeatState,
        heartbeat_timeout: Duration,
        deserializer: Arc<Deserializer>,
        handlers: Arc<HandlerRegistry>,
        store: Arc<StoreClient>,
    ) -> Self {
        Session {
            peer,
            heartbeat: Mutex::new(heartbeat),
            heartbeat_timeout,
            pong: Notify::new(),
            deserializer,
            handlers,
            store,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Drive the session to completion.  Returns `Ok(())` when the peer
    /// closes the connection; every other exit is a [`SessionError`].
    pub async fn run(&self, stream: TcpStream) -> Result<(), SessionError> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, RespCodec::new());
        let writer: FrameWriter =
            Arc::new(tokio::sync::Mutex::new(FramedWrite::new(write_half, RespCodec::new())));

        // All-for-one: the first loop to finish takes the other down with it.
        let result = tokio::select! {
            r = self.heartbeat_loop(&writer) => r,
            r = self.io_loop(&mut reader, &writer) => r,
        };

        // Single close point for the socket; the read half drops with
        // `reader` when we return.
        let mut w = writer.lock().await;
        if let Err(e) = SinkExt::<Frame>::close(&mut *w).await {
            debug!(peer = %self.peer, error = %e, "error closing session socket");
        }
        result
    }

    async fn heartbeat_loop(&self, writer: &FrameWriter) -> Result<(), SessionError> {
        loop {
            let interval = self.heartbeat.lock().unwrap().current_interval();
            tokio::time::sleep(interval).await;

            // The deadline covers the pong wait and the ACK send together.
            let cycle = async {
                self.pong.notified().await;
                let interval_ms = {
                    let mut hb = self.heartbeat.lock().unwrap();
                    hb.advance();
                    hb.current_millis()
                };
                send_frame(writer, Frame::heartbeat_ack(interval_ms)).await
            };
            match tokio::time::timeout(self.heartbeat_timeout, cycle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_deadline) => {
                    // Best effort: the peer may already be gone.
                    let _ = send_frame(writer, Frame::heartbeat_timeout()).await;
                    return Err(SessionError::HeartbeatTimeout);
                }
            }
        }
    }

    async fn io_loop(
        &self,
        reader: &mut FramedRead<OwnedReadHalf, RespCodec>,
        writer: &FrameWriter,
    ) -> Result<(), SessionError> {
        while let Some(decoded) = reader.next().await {
            let frame = decoded?;
            let tokens = frame.tokens()?;
            if tokens.is_empty() {
                continue;
            }

            let tree = match self.deserializer.deserialize(&tokens) {
                Ok(tree) => tree,
                Err(DeserializeError::CommandNotFound(name)) => {
                    let _ = send_frame(writer, Frame::unknown_command(&name)).await;
                    return Err(SessionError::UnknownCommand(name));
                }
            };

            let command = tree
                .command_name()
                .expect("deserializer always roots trees at a Command");
            if command == "heartbeat" {
                self.pong.notify_one();
                continue;
            }

            self.heartbeat.lock().unwrap().touch();
            self.dispatch(&tree, writer).await?;
        }
        // Peer closed the connection.
        Ok(())
    }

    async fn dispatch(&self, tree: &CommandTree, writer: &FrameWriter) -> Result<(), SessionError> {
        let Some(function) = self.deserializer.table().resolve(tree) else {
            // Descriptor without a bare-command function, or a catalog /
            // registry mismatch; survivable.
            warn!(peer = %self.peer, command = ?tree.command_name(), "no function registered for command");
            let _ = send_frame(
                writer,
                Frame::Error("ERR command has no registered handler".to_owned()),
            )
            .await;
            return Ok(());
        };
        let Some(handler) = self.handlers.get(function) else {
            warn!(peer = %self.peer, function, "descriptor names an unknown handler function");
            let _ = send_frame(
                writer,
                Frame::Error("ERR command has no registered handler".to_owned()),
            )
            .await;
            return Ok(());
        };

        let ctx = HandlerContext {
            writer: writer.clone(),
            store: self.store.clone(),
            peer: self.peer,
        };
        let args = tree.data_args();
        debug!(peer = %self.peer, function, args = args.len(), "dispatching command");
        handler(ctx, args).await.map_err(|e| SessionError::Handler {
            function: function.to_owned(),
            reason: e.to_string(),
        })
    }
}

async fn send_frame(writer: &FrameWriter, frame: Frame) -> Result<(), SessionError> {
    let mut w = writer.lock().await;
    w.send(frame).await.map_err(SessionError::from)
}
