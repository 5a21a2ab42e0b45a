//! Connection admission pipeline.
//!
//! Every accepted connection passes through the gatehouse before a session
//! is created.  A fixed pool of workers drains admission jobs from a shared
//! queue and evaluates an ordered rule chain against each connection; the
//! first rule returning `false` short-circuits the chain.  The stream itself
//! travels through the pool and comes back with the verdict, so rules may
//! inspect or even write to the socket.
//!
//! A rule that errors produces a failed (denying) verdict instead of leaving
//! the caller waiting.

pub mod rules;

use crate::queue::IoQueue;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

pub use rules::{AdmissionRule, BaselineRule, RuleError, SessionCapacityRule};

// ---------------------------------------------------------------------------
// Verdict and error types
// ---------------------------------------------------------------------------

/// Outcome of one admission evaluation.
#[derive(Debug)]
pub enum Verdict {
    Admitted,
    /// A rule returned `false`; `rule` names it.
    Denied { rule: &'static str },
    /// A rule errored; treated as deny.
    Failed(RuleError),
}

impl Verdict {
    pub fn admitted(&self) -> bool {
        matches!(self, Verdict::Admitted)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("gatehouse shut down")]
    Closed,
}

// ---------------------------------------------------------------------------
// Gatehouse
// ---------------------------------------------------------------------------

struct AdmitJob {
    stream: TcpStream,
    peer: SocketAddr,
}

type VerdictReply = (TcpStream, Verdict);
type PendingMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<VerdictReply>>>>;

/// Admission jobs queued per worker before backpressure.
const QUEUE_DEPTH_PER_WORKER: usize = 16;

pub struct Gatehouse {
    in_queue: IoQueue<AdmitJob>,
    out_queue: IoQueue<VerdictReply>,
    pending: PendingMap,
}

impl Gatehouse {
    /// Spawn `worker_count` admission workers over the given rule chain.
    pub fn start(rules: Vec<Arc<dyn AdmissionRule>>, worker_count: usize) -> Arc<Self> {
        let depth = worker_count * QUEUE_DEPTH_PER_WORKER;
        let in_queue: IoQueue<AdmitJob> = IoQueue::new(depth);
        let out_queue: IoQueue<VerdictReply> = IoQueue::new(depth);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let rules: Arc<[Arc<dyn AdmissionRule>]> = rules.into();
        for worker_id in 0..worker_count {
            tokio::spawn(gate_worker(
                worker_id,
                rules.clone(),
                in_queue.clone(),
                out_queue.clone(),
            ));
        }
        tokio::spawn(route_verdicts(out_queue.clone(), pending.clone()));

        Arc::new(Gatehouse {
            in_queue,
            out_queue,
            pending,
        })
    }

    /// Evaluate the rule chain against one connection.  The stream is handed
    /// to the pool and returned alongside the verdict.
    pub async fn admit(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(TcpStream, Verdict), GateError> {
        let cid = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(cid, tx);

        if self
            .in_queue
            .append(AdmitJob { stream, peer }, cid)
            .await
            .is_err()
        {
            self.pending.lock().unwrap().remove(&cid);
            return Err(GateError::Closed);
        }

        rx.await.map_err(|_| GateError::Closed)
    }

    /// Close both queues; workers and the router observe end-of-stream and
    /// exit.
    pub async fn shutdown(&self) {
        self.in_queue.close();
        self.out_queue.close();
        self.pending.lock().unwrap().clear();
    }
}

async fn gate_worker(
    worker_id: usize,
    rules: Arc<[Arc<dyn AdmissionRule>]>,
    in_queue: IoQueue<AdmitJob>,
    out_queue: IoQueue<VerdictReply>,
) {
    while let Some((job, cid)) = in_queue.recv().await {
        let AdmitJob { mut stream, peer } = job;
        let mut verdict = Verdict::Admitted;
        for rule in rules.iter() {
            match rule.handle(&mut stream, peer).await {
                Ok(true) => debug!(worker = worker_id, %peer, rule = rule.name(), "rule passed"),
                Ok(false) => {
                    debug!(worker = worker_id, %peer, rule = rule.name(), "rule denied");
                    verdict = Verdict::Denied { rule: rule.name() };
                    break;
                }
                Err(e) => {
                    warn!(worker = worker_id, %peer, rule = rule.name(), error = %e, "rule failed");
                    verdict = Verdict::Failed(e);
                    break;
                }
            }
        }
        if out_queue.append((stream, verdict), cid).await.is_err() {
            break;
        }
    }
    debug!(worker = worker_id, "gatehouse worker exiting");
}

async fn route_verdicts(out_queue: IoQueue<VerdictReply>, pending: PendingMap) {
    while let Some((reply, cid)) = out_queue.recv().await {
        let waiter = pending.lock().unwrap().remove(&cid);
        match waiter {
            Some(tx) => {
                // A dropped waiter also drops the stream, closing the socket.
                let _ = tx.send(reply);
            }
            None => warn!(%cid, "admission verdict without a waiter dropped"),
        }
    }
    debug!("gatehouse verdict router exiting");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
