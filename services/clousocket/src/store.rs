//! Upstream store client pool.
//!
//! A fixed pool of worker tasks, each owning at most one persistent RESP
//! connection to the backing key/value store, drains a shared in-queue of
//! `(command tokens, correlation id)` items.  Replies land on an out-queue
//! and a single router task completes the per-request oneshot waiters, so
//! every `execute` call resolves with exactly its own reply.
//!
//! A worker that hits a connection or protocol error posts a typed error for
//! the failed correlation id (callers never hang), drops its connection, and
//! redials on the next item.  In-flight commands are not replayed across a
//! reconnect.

use crate::config::StoreTarget;
use crate::queue::IoQueue;
use cs_resp::{Frame, RespCodec};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::codec::Framed;
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store connect failed: {0}")]
    Connect(String),
    #[error("store i/o failed: {0}")]
    Io(String),
    #[error("store protocol error: {0}")]
    Protocol(String),
    #[error("store client shut down")]
    Closed,
}

type StoreResult = Result<Frame, StoreError>;
type PendingMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<StoreResult>>>>;

/// In-queue headroom per pooled connection.
const QUEUE_DEPTH_PER_CONN: usize = 32;

// ---------------------------------------------------------------------------
// StoreClient
// ---------------------------------------------------------------------------

pub struct StoreClient {
    in_queue: IoQueue<Vec<String>>,
    out_queue: IoQueue<StoreResult>,
    pending: PendingMap,
    pool_size: usize,
}

impl StoreClient {
    /// Spawn the worker pool and reply router.  Connections are dialed
    /// lazily, on each worker's first item.
    pub fn start(target: StoreTarget, pool_size: usize) -> Arc<Self> {
        let depth = pool_size * QUEUE_DEPTH_PER_CONN;
        let in_queue: IoQueue<Vec<String>> = IoQueue::new(depth);
        let out_queue: IoQueue<StoreResult> = IoQueue::new(depth);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        for worker_id in 0..pool_size {
            tokio::spawn(store_worker(
                worker_id,
                target.clone(),
                in_queue.clone(),
                out_queue.clone(),
            ));
        }
        tokio::spawn(route_replies(out_queue.clone(), pending.clone()));

        Arc::new(StoreClient {
            in_queue,
            out_queue,
            pending,
            pool_size,
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Run one command upstream and await its correlated reply.
    pub async fn execute<I, S>(&self, tokens: I) -> StoreResult
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        let cid = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(cid, tx);

        if self.in_queue.append(tokens, cid).await.is_err() {
            self.pending.lock().unwrap().remove(&cid);
            return Err(StoreError::Closed);
        }

        match rx.await {
            Ok(result) => result,
            // Router gone: shutdown raced our request.
            Err(_) => Err(StoreError::Closed),
        }
    }

    /// Close both queues.  Workers and the router observe end-of-stream and
    /// exit; callers still waiting observe [`StoreError::Closed`].
    pub async fn shutdown(&self) {
        self.in_queue.close();
        self.out_queue.close();
        // Waiters whose reply will never be routed get dropped senders, which
        // their `execute` maps to `Closed`.
        self.pending.lock().unwrap().clear();
    }
}

// ---------------------------------------------------------------------------
// Worker / router bodies
// ---------------------------------------------------------------------------

type StoreConn = Framed<TcpStream, RespCodec>;

async fn store_worker(
    worker_id: usize,
    target: StoreTarget,
    in_queue: IoQueue<Vec<String>>,
    out_queue: IoQueue<StoreResult>,
) {
    let mut conn: Option<StoreConn> = None;
    while let Some((tokens, cid)) = in_queue.recv().await {
        let result = match ensure_connected(&mut conn, &target).await {
            Ok(()) => {
                let framed = conn.as_mut().expect("connection present after ensure_connected");
                exchange(framed, tokens).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            warn!(worker = worker_id, %cid, error = %e, "store command failed");
            conn = None;
        }
        if out_queue.append(result, cid).await.is_err() {
            break;
        }
    }
    debug!(worker = worker_id, "store worker exiting");
}

/// Dial and handshake (`AUTH`, `SELECT`) if this worker has no live
/// connection.
async fn ensure_connected(
    conn: &mut Option<StoreConn>,
    target: &StoreTarget,
) -> Result<(), StoreError> {
    if conn.is_some() {
        return Ok(());
    }
    let stream = TcpStream::connect(&target.addr)
        .await
        .map_err(|e| StoreError::Connect(format!("{}: {}", target.addr, e)))?;
    let mut framed = Framed::new(stream, RespCodec::new());

    if let Some(password) = &target.password {
        let reply = exchange(
            &mut framed,
            vec!["AUTH".to_owned(), password.clone()],
        )
        .await?;
        if let Frame::Error(e) = reply {
            return Err(StoreError::Connect(format!("AUTH rejected: {e}")));
        }
    }
    if target.db != 0 {
        let reply = exchange(
            &mut framed,
            vec!["SELECT".to_owned(), target.db.to_string()],
        )
        .await?;
        if let Frame::Error(e) = reply {
            return Err(StoreError::Connect(format!("SELECT rejected: {e}")));
        }
    }

    debug!(addr = %target.addr, "store connection established");
    *conn = Some(framed);
    Ok(())
}

/// Send one command and await its single reply frame.  An upstream `-ERR`
/// reply is a valid payload and is relayed, not treated as a failure.
async fn exchange(conn: &mut StoreConn, tokens: Vec<String>) -> StoreResult {
    conn.send(Frame::array_of(tokens))
        .await
        .map_err(|e| StoreError::Io(e.to_string()))?;
    match conn.next().await {
        None => Err(StoreError::Io("connection closed by store".to_owned())),
        Some(Err(e)) => Err(StoreError::Protocol(e.to_string())),
        Some(Ok(frame)) => Ok(frame),
    }
}

async fn route_replies(out_queue: IoQueue<StoreResult>, pending: PendingMap) {
    while let Some((result, cid)) = out_queue.recv().await {
        let waiter = pending.lock().unwrap().remove(&cid);
        match waiter {
            // The waiter may have been dropped (caller gave up); ignore.
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => warn!(%cid, "store reply without a waiter dropped"),
        }
    }
    debug!("store reply router exiting");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cs_test_utils::MockStoreServer;

    fn target_for(addr: std::net::SocketAddr) -> StoreTarget {
        StoreTarget {
            addr: addr.to_string(),
            password: None,
            db: 0,
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let mock = MockStoreServer::start().await.unwrap();
        let client = StoreClient::start(target_for(mock.local_addr()), 2);

        let set = client.execute(["SET", "k", "v"]).await.unwrap();
        assert_eq!(set, Frame::Simple("OK".to_owned()));
        let get = client.execute(["GET", "k"]).await.unwrap();
        assert_eq!(get, Frame::Bulk("v".to_owned()));
    }

    #[tokio::test]
    async fn upstream_error_reply_is_relayed_not_fatal() {
        let mock = MockStoreServer::start().await.unwrap();
        let client = StoreClient::start(target_for(mock.local_addr()), 1);

        let reply = client.execute(["NOSUCH"]).await.unwrap();
        assert!(matches!(reply, Frame::Error(_)));

        // The connection survives and the next command succeeds.
        let pong = client.execute(["PING"]).await.unwrap();
        assert_eq!(pong, Frame::Simple("PONG".to_owned()));
    }

    #[tokio::test]
    async fn unreachable_store_yields_connect_error_not_a_hang() {
        // Bind-then-drop to get a port with no listener behind it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = StoreClient::start(target_for(addr), 1);
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            client.execute(["GET", "k"]),
        )
        .await
        .expect("execute must resolve, not hang");
        assert!(matches!(result, Err(StoreError::Connect(_))));
    }

    #[tokio::test]
    async fn execute_after_shutdown_returns_closed() {
        let mock = MockStoreServer::start().await.unwrap();
        let client = StoreClient::start(target_for(mock.local_addr()), 1);
        client.shutdown().await;
        assert_eq!(
            client.execute(["GET", "k"]).await,
            Err(StoreError::Closed)
        );
    }

    #[tokio::test]
    async fn concurrent_callers_get_their_own_replies() {
        let mock = MockStoreServer::start().await.unwrap();
        for i in 0..20 {
            mock.insert(&format!("key-{i}"), &format!("value-{i}")).await;
        }
        let client = StoreClient::start(target_for(mock.local_addr()), 3);

        let mut calls = Vec::new();
        for i in 0..20 {
            let client = client.clone();
            calls.push(tokio::spawn(async move {
                (i, client.execute(["GET", &format!("key-{i}")]).await)
            }));
        }
        for call in calls {
            let (i, result) = call.await.unwrap();
            assert_eq!(result.unwrap(), Frame::Bulk(format!("value-{i}")));
        }
    }
}
