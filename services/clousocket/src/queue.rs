//! Correlated work channel shared by the worker pools.
//!
//! An [`IoQueue`] carries `(payload, correlation id)` pairs from many
//! producers to many competing consumers; each item is delivered to exactly
//! one consumer.  The channel is bounded, so producers apply backpressure by
//! awaiting `append` instead of buffering without limit.
//!
//! `close` propagates end-of-stream immediately: blocked producers fail,
//! blocked consumers return `None`, and undelivered items are discarded.
//! The close signal is a watch flag rather than the channel itself so that a
//! consumer parked inside `recv` never has to be woken through the shared
//! receiver.

use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use uuid::Uuid;

/// The queue was closed; no further items can be appended.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("io queue closed")]
pub struct QueueClosed;

/// Bounded multi-producer channel whose receiver is shared by all consumers.
pub struct IoQueue<T> {
    tx: mpsc::Sender<(T, Uuid)>,
    rx: Arc<Mutex<mpsc::Receiver<(T, Uuid)>>>,
    closed_tx: Arc<watch::Sender<bool>>,
}

impl<T> Clone for IoQueue<T> {
    fn clone(&self) -> Self {
        IoQueue {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            closed_tx: self.closed_tx.clone(),
        }
    }
}

impl<T: Send> IoQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (closed_tx, _) = watch::channel(false);
        IoQueue {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            closed_tx: Arc::new(closed_tx),
        }
    }

    /// Enqueue one item.  Awaits while the queue is full; fails after
    /// [`IoQueue::close`], including for producers already parked on a full
    /// queue.
    pub async fn append(&self, payload: T, cid: Uuid) -> Result<(), QueueClosed> {
        let mut closed_rx = self.closed_tx.subscribe();
        tokio::select! {
            biased;
            _ = closed_rx.wait_for(|closed| *closed) => Err(QueueClosed),
            sent = self.tx.send((payload, cid)) => sent.map_err(|_| QueueClosed),
        }
    }

    /// Dequeue the next item.  Consumers holding clones of the queue compete;
    /// each item is observed by exactly one of them.  Returns `None` once the
    /// queue is closed.
    pub async fn recv(&self) -> Option<(T, Uuid)> {
        let mut closed_rx = self.closed_tx.subscribe();
        tokio::select! {
            biased;
            _ = closed_rx.wait_for(|closed| *closed) => None,
            item = async { self.rx.lock().await.recv().await } => item,
        }
    }

    /// Close the queue: every producer and consumer observes end-of-stream
    /// promptly.  Items never delivered are dropped.
    pub fn close(&self) {
        let _ = self.closed_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn fifo_order_under_a_single_producer() {
        let queue: IoQueue<u32> = IoQueue::new(16);
        let cids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for (i, cid) in cids.iter().enumerate() {
            queue.append(i as u32, *cid).await.unwrap();
        }
        for (i, cid) in cids.iter().enumerate() {
            let (payload, got) = queue.recv().await.unwrap();
            assert_eq!(payload, i as u32);
            assert_eq!(got, *cid);
        }
    }

    #[tokio::test]
    async fn competing_consumers_each_item_delivered_once() {
        let queue: IoQueue<u32> = IoQueue::new(128);
        const ITEMS: usize = 100;
        let delivered = Arc::new(AtomicUsize::new(0));

        let mut consumers = Vec::new();
        for _ in 0..4 {
            let q = queue.clone();
            let delivered = delivered.clone();
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some((payload, _cid)) = q.recv().await {
                    seen.push(payload);
                    delivered.fetch_add(1, Ordering::SeqCst);
                }
                seen
            }));
        }

        for i in 0..ITEMS {
            queue.append(i as u32, Uuid::new_v4()).await.unwrap();
        }
        // Close only after everything is delivered; close discards leftovers.
        while delivered.load(Ordering::SeqCst) < ITEMS {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        queue.close();

        let mut all = std::collections::HashSet::new();
        for consumer in consumers {
            for payload in consumer.await.unwrap() {
                assert!(all.insert(payload), "item {payload} delivered twice");
            }
        }
        assert_eq!(all.len(), ITEMS, "every item delivered exactly once");
    }

    #[tokio::test]
    async fn append_after_close_fails() {
        let queue: IoQueue<&str> = IoQueue::new(4);
        queue.close();
        assert_eq!(
            queue.append("late", Uuid::new_v4()).await,
            Err(QueueClosed)
        );
    }

    #[tokio::test]
    async fn close_unblocks_idle_consumers() {
        let queue: IoQueue<&str> = IoQueue::new(4);
        let q = queue.clone();
        let parked = tokio::spawn(async move { q.recv().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!parked.is_finished(), "consumer should be parked while empty");

        queue.close();
        let result = tokio::time::timeout(Duration::from_secs(1), parked)
            .await
            .expect("close must wake the parked consumer")
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn close_is_end_of_stream_for_every_handle() {
        let queue: IoQueue<&str> = IoQueue::new(4);
        queue.append("undelivered", Uuid::new_v4()).await.unwrap();
        queue.close();

        assert_eq!(queue.recv().await, None);
        assert_eq!(queue.clone().recv().await, None);
    }

    #[tokio::test]
    async fn bounded_queue_applies_backpressure() {
        let queue: IoQueue<u32> = IoQueue::new(1);
        queue.append(1, Uuid::new_v4()).await.unwrap();

        // Second append must block until a consumer makes room.
        let q = queue.clone();
        let blocked = tokio::spawn(async move { q.append(2, Uuid::new_v4()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "append should wait while full");

        assert_eq!(queue.recv().await.map(|(p, _)| p), Some(1));
        blocked.await.unwrap().unwrap();
        assert_eq!(queue.recv().await.map(|(p, _)| p), Some(2));
    }

    #[tokio::test]
    async fn close_unblocks_parked_producers() {
        let queue: IoQueue<u32> = IoQueue::new(1);
        queue.append(1, Uuid::new_v4()).await.unwrap();

        let q = queue.clone();
        let blocked = tokio::spawn(async move { q.append(2, Uuid::new_v4()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        queue.close();
        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("close must wake the parked producer")
            .unwrap();
        assert_eq!(result, Err(QueueClosed));
    }
}
