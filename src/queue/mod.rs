//! Queue abstraction: one `Queue<M>` trait generalizing both queue roles
//! spec.md §4.2 describes — the work-item update queue (small/large
//! severity) and the scheduler wake-up queue — the way the teacher's
//! `JobQueue` trait generalizes `claim`/`heartbeat`/`ack` over one job row
//! shape to many command types.
//!
//! At-least-once delivery: a message stays invisible to other receivers
//! once handed out, but is only removed from the queue once `ack`'d by
//! its receipt. A receiver that dies before acking leaves the message to
//! be redelivered.

pub mod memory;
pub mod messages;

use async_trait::async_trait;

use crate::error::Result;

pub use messages::{WakeupMessage, WorkItemUpdateMessage};

/// Opaque delivery receipt. Only `ack`-able once; acking an unknown or
/// already-acked receipt is a no-op, matching at-least-once semantics
/// where a duplicate ack must never panic a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Receipt(pub u64);

/// A delivered message paired with the receipt needed to acknowledge it.
#[derive(Debug, Clone)]
pub struct Envelope<M> {
    pub receipt: Receipt,
    pub body: M,
}

#[async_trait]
pub trait Queue<M: Send + Sync + 'static>: Send + Sync {
    /// Enqueues a message. Implementations that coalesce (the wake-up
    /// queue) may fold this into an already-pending entry instead of
    /// appending.
    async fn send(&self, message: M) -> Result<()>;

    /// Receives up to `max` messages without blocking. Returns fewer (or
    /// zero) when the queue currently holds less than `max`.
    async fn receive(&self, max: usize) -> Result<Vec<Envelope<M>>>;

    /// Deletes the message the receipt refers to. Processors must call
    /// this even when processing failed — an unacked bad message would
    /// otherwise block the queue forever, per spec.md §4.2's rationale.
    async fn ack(&self, receipt: Receipt) -> Result<()>;

    /// Number of messages currently visible (not yet received).
    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
