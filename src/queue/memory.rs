//! In-memory `Queue<M>` — a `tokio::sync::Mutex<VecDeque<Envelope<M>>>`
//! FIFO, standing in for a managed queue in single-process operation and
//! tests, the same role `MemoryStore` plays for `StateStore`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;

use super::{Envelope, Queue, Receipt, WakeupMessage, WorkItemUpdateMessage};

/// Messages that support wake-up-style coalescing declare a dedup key.
/// Messages with no meaningful coalescing (plain update messages) use the
/// default `None`, so `send` always appends them.
pub trait Coalesce {
    fn coalesce_key(&self) -> Option<String> {
        None
    }
}

impl Coalesce for WorkItemUpdateMessage {}

impl Coalesce for WakeupMessage {
    fn coalesce_key(&self) -> Option<String> {
        Some(self.service_id.clone())
    }
}

struct Inner<M> {
    pending: VecDeque<Envelope<M>>,
    in_flight: HashMap<Receipt, M>,
}

impl<M> Default for Inner<M> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
        }
    }
}

pub struct InMemoryQueue<M> {
    inner: Arc<Mutex<Inner<M>>>,
    next_receipt: AtomicU64,
}

impl<M> Clone for InMemoryQueue<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            next_receipt: AtomicU64::new(self.next_receipt.load(Ordering::Relaxed)),
        }
    }
}

impl<M> Default for InMemoryQueue<M> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            next_receipt: AtomicU64::new(1),
        }
    }
}

impl<M> InMemoryQueue<M> {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_receipt(&self) -> Receipt {
        Receipt(self.next_receipt.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl<M> Queue<M> for InMemoryQueue<M>
where
    M: Coalesce + Clone + Send + Sync + 'static,
{
    async fn send(&self, message: M) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(key) = message.coalesce_key() {
            let already_pending = inner
                .pending
                .iter()
                .any(|env| env.body.coalesce_key().as_deref() == Some(key.as_str()));
            if already_pending {
                return Ok(());
            }
        }
        let receipt = self.next_receipt();
        inner.pending.push_back(Envelope {
            receipt,
            body: message,
        });
        Ok(())
    }

    async fn receive(&self, max: usize) -> Result<Vec<Envelope<M>>> {
        let mut inner = self.inner.lock().await;
        let mut out = Vec::with_capacity(max.min(inner.pending.len()));
        for _ in 0..max {
            let Some(env) = inner.pending.pop_front() else {
                break;
            };
            inner.in_flight.insert(env.receipt, env.body.clone());
            out.push(env);
        }
        Ok(out)
    }

    async fn ack(&self, receipt: Receipt) -> Result<()> {
        self.inner.lock().await.in_flight.remove(&receipt);
        Ok(())
    }

    async fn len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_preserved() {
        let q: InMemoryQueue<WorkItemUpdateMessage> = InMemoryQueue::new();
        for i in 0..3 {
            q.send(sample_update(i)).await.unwrap();
        }
        let received = q.receive(10).await.unwrap();
        assert_eq!(received.len(), 3);
        assert_eq!(received[0].body.workflow_step_index, 0);
        assert_eq!(received[2].body.workflow_step_index, 2);
    }

    #[tokio::test]
    async fn receive_caps_at_max() {
        let q: InMemoryQueue<WorkItemUpdateMessage> = InMemoryQueue::new();
        for i in 0..5 {
            q.send(sample_update(i)).await.unwrap();
        }
        let received = q.receive(2).await.unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(q.len().await, 3);
    }

    #[tokio::test]
    async fn ack_removes_in_flight_and_does_not_redeliver() {
        let q: InMemoryQueue<WorkItemUpdateMessage> = InMemoryQueue::new();
        q.send(sample_update(0)).await.unwrap();
        let received = q.receive(1).await.unwrap();
        q.ack(received[0].receipt).await.unwrap();
        assert_eq!(q.len().await, 0);
        assert!(q.inner.lock().await.in_flight.is_empty());
    }

    #[tokio::test]
    async fn wakeup_messages_coalesce_by_service_id() {
        let q: InMemoryQueue<WakeupMessage> = InMemoryQueue::new();
        q.send(WakeupMessage {
            service_id: "subsetter".into(),
        })
        .await
        .unwrap();
        q.send(WakeupMessage {
            service_id: "subsetter".into(),
        })
        .await
        .unwrap();
        q.send(WakeupMessage {
            service_id: "query-cmr".into(),
        })
        .await
        .unwrap();
        assert_eq!(q.len().await, 2);
    }

    fn sample_update(step_index: i32) -> WorkItemUpdateMessage {
        WorkItemUpdateMessage {
            work_item_id: crate::model::WorkItemId::new(),
            status: crate::model::WorkItemStatus::Successful,
            message: None,
            message_category: None,
            hits: None,
            results: vec![],
            output_item_sizes: vec![],
            total_items_size: None,
            duration_ms: None,
            workflow_step_index: step_index,
            scroll_id: None,
            bbox: None,
            temporal_start: None,
            temporal_end: None,
        }
    }
}
