//! Outbound mailbox: per-peer FIFO of frames waiting for a link.
//!
//! Queues live in memory only and are lost on restart. Flushing is driven by
//! the node, which owns the links; this type only keeps order.

use std::collections::{HashMap, VecDeque};

use tracing::warn;

use crate::identity::ServerId;
use crate::message::FederationMessage;

#[derive(Debug, Default)]
pub struct OutboundMailbox {
    queues: HashMap<ServerId, VecDeque<FederationMessage>>,
    /// Per-peer cap; `None` is unbounded.
    capacity: Option<usize>,
}

impl OutboundMailbox {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            queues: HashMap::new(),
            capacity,
        }
    }

    /// Append a message to the peer's queue. When the queue is at capacity
    /// the oldest message is evicted and returned.
    pub fn enqueue(
        &mut self,
        server_id: &ServerId,
        message: FederationMessage,
    ) -> Option<FederationMessage> {
        let queue = self.queues.entry(server_id.clone()).or_default();
        let evicted = match self.capacity {
            Some(cap) if queue.len() >= cap => queue.pop_front(),
            _ => None,
        };
        if let Some(old) = &evicted {
            warn!(
                "Mailbox for {server_id} is full; dropped oldest queued {} frame",
                old.wire_type()
            );
        }
        queue.push_back(message);
        evicted
    }

    /// Take every queued message for a peer, oldest first, leaving the queue
    /// empty.
    pub fn take(&mut self, server_id: &ServerId) -> Vec<FederationMessage> {
        self.queues
            .remove(server_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Put messages that could not be delivered back at the head of the
    /// queue, ahead of anything queued since, keeping their order. The
    /// capacity still holds: the oldest overflow is dropped and its count
    /// returned.
    pub fn restore(&mut self, server_id: &ServerId, messages: Vec<FederationMessage>) -> usize {
        if messages.is_empty() {
            return 0;
        }
        let queue = self.queues.entry(server_id.clone()).or_default();
        for message in messages.into_iter().rev() {
            queue.push_front(message);
        }

        let overflow = self.capacity.map_or(0, |cap| queue.len().saturating_sub(cap));
        if overflow > 0 {
            queue.drain(..overflow);
            warn!("Mailbox for {server_id} is full; dropped {overflow} oldest queued frame(s)");
        }
        overflow
    }

    /// Drop a peer's queue entirely.
    pub fn remove(&mut self, server_id: &ServerId) -> usize {
        self.queues.remove(server_id).map_or(0, |q| q.len())
    }

    pub fn len(&self, server_id: &ServerId) -> usize {
        self.queues.get(server_id).map_or(0, VecDeque::len)
    }

    /// Sum of all queue lengths.
    pub fn total(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
