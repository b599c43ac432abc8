//! Pending-work queue.
//!
//! FIFO of ports that currently require processing. Membership is
//! queried through the queue itself, so ports carry no list state.

use alloc::collections::VecDeque;

use crate::driver::PortId;

#[derive(Default)]
pub(crate) struct PendingQueue {
    inner: VecDeque<PortId>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            inner: VecDeque::new(),
        }
    }

    /// Enqueue a port unless it is already waiting. Returns `true`
    /// when the port was actually inserted.
    pub fn push(&mut self, id: PortId) -> bool {
        if self.contains(id) {
            return false;
        }
        self.inner.push_back(id);
        true
    }

    pub fn pop(&mut self) -> Option<PortId> {
        self.inner.pop_front()
    }

    pub fn contains(&self, id: PortId) -> bool {
        self.inner.iter().any(|&p| p == id)
    }

    /// Remove a port regardless of its position. Used when a port
    /// leaves service outside the normal drain order.
    pub fn remove(&mut self, id: PortId) -> bool {
        if let Some(pos) = self.inner.iter().position(|&p| p == id) {
            self.inner.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
