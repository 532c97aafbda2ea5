use std::collections::VecDeque;

/// FIFO admission queue with optional backpressure.
///
/// Key properties:
/// - Items leave in insertion order.
/// - Cancellation removes an item without perturbing the order of the rest.
/// - `try_push` rejects once `max_len` items are pending.

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkId(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("work queue full ({max_len} pending)")]
pub struct WorkQueueFull {
    pub max_len: usize,
}

#[derive(Debug)]
pub struct WorkQueue<T> {
    next_id: u64,
    items: VecDeque<(WorkId, T)>,
    max_len: Option<usize>,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            items: VecDeque::new(),
            max_len: None,
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            max_len: Some(max_len),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, payload: T) -> WorkId {
        let id = WorkId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.items.push_back((id, payload));
        id
    }

    pub fn try_push(&mut self, payload: T) -> Result<WorkId, WorkQueueFull> {
        if let Some(max_len) = self.max_len
            && self.items.len() >= max_len
        {
            return Err(WorkQueueFull { max_len });
        }
        Ok(self.push(payload))
    }

    /// Removes a pending item. Returns it if it had not been popped yet.
    pub fn cancel(&mut self, id: WorkId) -> Option<T> {
        let idx = self.items.iter().position(|(i, _)| *i == id)?;
        self.items.remove(idx).map(|(_, payload)| payload)
    }

    /// 0-based position of a pending item.
    pub fn position(&self, id: WorkId) -> Option<usize> {
        self.items.iter().position(|(i, _)| *i == id)
    }

    pub fn pop_next(&mut self) -> Option<(WorkId, T)> {
        self.items.pop_front()
    }
}
