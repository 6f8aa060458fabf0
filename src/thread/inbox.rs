//! Bounded per-thread wake queue with merge-on-dequeue.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Semaphore};

use crate::thread::WakeMessage;

/// FIFO of pending wake messages.
///
/// Capacity is enforced with a semaphore: producers take a slot before
/// pushing and consumers hand slots back after popping, so a full inbox makes
/// `push` wait instead of dropping.
pub struct Inbox {
    queue: Mutex<VecDeque<WakeMessage>>,
    slots: Semaphore,
}

impl Inbox {
    /// Create an inbox holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            slots: Semaphore::new(capacity.max(1)),
        }
    }

    /// Append a message, waiting while the inbox is full.
    pub async fn push(&self, msg: WakeMessage) {
        match self.slots.acquire().await {
            Ok(permit) => permit.forget(),
            // Only reachable if the semaphore is closed, which never happens.
            Err(_) => tracing::warn!("inbox slot semaphore closed; enqueuing anyway"),
        }
        self.queue.lock().await.push_back(msg);
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// Pop the head message with every contiguous mergeable message folded in.
    ///
    /// Returns the merged message and how many raw messages it absorbed
    /// (including itself).
    pub async fn take_merged(&self) -> Option<(WakeMessage, usize)> {
        let mut queue = self.queue.lock().await;
        let mut head = queue.pop_front()?;
        let mut taken = 1;
        while queue.front().is_some_and(|next| head.can_merge(next)) {
            if let Some(next) = queue.pop_front() {
                head.absorb(next);
                taken += 1;
            }
        }
        drop(queue);
        self.slots.add_permits(taken);
        Some((head, taken))
    }

    /// Pop contiguous head messages that are mergeable with `driver`.
    ///
    /// Stops at the first message that is not, leaving it at the head.
    pub async fn drain_mergeable(&self, driver: &WakeMessage) -> Vec<WakeMessage> {
        let mut queue = self.queue.lock().await;
        let mut out = Vec::new();
        while queue.front().is_some_and(|next| driver.can_merge(next)) {
            if let Some(next) = queue.pop_front() {
                out.push(next);
            }
        }
        drop(queue);
        if !out.is_empty() {
            self.slots.add_permits(out.len());
        }
        out
    }
}
