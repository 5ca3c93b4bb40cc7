//! runtime/queue.rs — one FIFO queue per scheduling priority level (spec
//! §3 "Shared state", §5). Delivery is at-least-once: a message stays
//! invisible to other receivers for its visibility timeout and is put back
//! on the queue if nobody deletes it in time. Workers poll queues from the
//! highest priority level down (spec §5); this trait only exposes the
//! per-queue primitives, the polling order lives in the worker loop.

use crate::runtime::error::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub receipt_handle: String,
    pub body: String,
}

#[async_trait]
pub trait QueueService: Send + Sync {
    async fn send(&self, priority: usize, body: String) -> Result<()>;

    /// Returns `None` if the queue is empty. A returned message is
    /// invisible to other receivers until `visibility_timeout` elapses or
    /// it is deleted, whichever comes first.
    async fn receive(
        &self,
        priority: usize,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>>;

    async fn delete(&self, priority: usize, receipt_handle: &str) -> Result<()>;

    async fn change_visibility(
        &self,
        priority: usize,
        receipt_handle: &str,
        visibility_timeout: Duration,
    ) -> Result<()>;

    async fn purge(&self, priority: usize) -> Result<()>;
}

struct InFlight {
    priority: usize,
    body: String,
    visible_at: Instant,
}

pub struct InMemoryQueue {
    queues: Vec<Mutex<VecDeque<String>>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl InMemoryQueue {
    pub fn new(num_priorities: usize) -> Self {
        let mut queues = Vec::with_capacity(num_priorities);
        for _ in 0..num_priorities {
            queues.push(Mutex::new(VecDeque::new()));
        }
        InMemoryQueue {
            queues,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Requeue any in-flight message at this priority whose visibility
    /// window has lapsed without a delete — the at-least-once redelivery
    /// path (spec S4).
    async fn reclaim_expired(&self, priority: usize) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut guard = self.in_flight.lock().await;
            guard.retain(|handle, msg| {
                if msg.priority == priority && msg.visible_at <= now {
                    expired.push((handle.clone(), msg.body.clone()));
                    false
                } else {
                    true
                }
            });
        }
        if !expired.is_empty() {
            let mut q = self.queues[priority].lock().await;
            for (_, body) in expired {
                q.push_back(body);
            }
        }
    }
}

#[async_trait]
impl QueueService for InMemoryQueue {
    async fn send(&self, priority: usize, body: String) -> Result<()> {
        self.queues[priority].lock().await.push_back(body);
        Ok(())
    }

    async fn receive(
        &self,
        priority: usize,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>> {
        self.reclaim_expired(priority).await;
        let body = self.queues[priority].lock().await.pop_front();
        let Some(body) = body else { return Ok(None) };
        let receipt_handle = Uuid::new_v4().to_string();
        self.in_flight.lock().await.insert(
            receipt_handle.clone(),
            InFlight {
                priority,
                body: body.clone(),
                visible_at: Instant::now() + visibility_timeout,
            },
        );
        Ok(Some(QueueMessage {
            receipt_handle,
            body,
        }))
    }

    async fn delete(&self, _priority: usize, receipt_handle: &str) -> Result<()> {
        self.in_flight.lock().await.remove(receipt_handle);
        Ok(())
    }

    async fn change_visibility(
        &self,
        _priority: usize,
        receipt_handle: &str,
        visibility_timeout: Duration,
    ) -> Result<()> {
        if let Some(msg) = self.in_flight.lock().await.get_mut(receipt_handle) {
            msg.visible_at = Instant::now() + visibility_timeout;
        }
        Ok(())
    }

    async fn purge(&self, priority: usize) -> Result<()> {
        self.queues[priority].lock().await.clear();
        self.in_flight
            .lock()
            .await
            .retain(|_, msg| msg.priority != priority);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receive_makes_message_invisible_until_deleted() {
        let q = InMemoryQueue::new(1);
        q.send(0, "block-1".into()).await.unwrap();
        let msg = q.receive(0, Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(msg.body, "block-1");
        assert!(q.receive(0, Duration::from_secs(30)).await.unwrap().is_none());
        q.delete(0, &msg.receipt_handle).await.unwrap();
    }

    #[tokio::test]
    async fn expired_visibility_redelivers() {
        let q = InMemoryQueue::new(1);
        q.send(0, "block-1".into()).await.unwrap();
        let msg = q
            .receive(0, Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let redelivered = q.receive(0, Duration::from_secs(30)).await.unwrap();
        assert!(redelivered.is_some());
        assert_ne!(redelivered.unwrap().receipt_handle, msg.receipt_handle);
    }

    #[tokio::test]
    async fn purge_drops_queued_and_in_flight() {
        let q = InMemoryQueue::new(2);
        q.send(0, "a".into()).await.unwrap();
        q.send(0, "b".into()).await.unwrap();
        let _in_flight = q.receive(0, Duration::from_secs(30)).await.unwrap();
        q.purge(0).await.unwrap();
        assert!(q.receive(0, Duration::from_secs(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn priorities_are_independent() {
        let q = InMemoryQueue::new(2);
        q.send(1, "high".into()).await.unwrap();
        assert!(q.receive(0, Duration::from_secs(1)).await.unwrap().is_none());
        assert!(q.receive(1, Duration::from_secs(1)).await.unwrap().is_some());
    }
}
