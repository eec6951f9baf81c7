use parking_lot::Mutex;
use std::collections::VecDeque;

/// FIFO of whole messages with an optional capacity.
#[derive(Debug)]
pub(crate) struct MessageQueue {
    items: Mutex<VecDeque<Vec<u8>>>,
    limit: Option<usize>,
}

/// The queue was at capacity.
#[derive(Debug)]
pub(crate) struct QueueAtCapacity {
    pub(crate) limit: usize,
}

impl MessageQueue {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            limit,
        }
    }

    pub(crate) fn push(&self, message: Vec<u8>) -> Result<(), QueueAtCapacity> {
        let mut items = self.items.lock();
        if let Some(limit) = self.limit {
            if items.len() >= limit {
                return Err(QueueAtCapacity { limit });
            }
        }
        items.push_back(message);
        Ok(())
    }

    pub(crate) fn pop(&self) -> Option<Vec<u8>> {
        self.items.lock().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Drops every queued message and returns how many there were.
    pub(crate) fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let count = items.len();
        items.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let queue = MessageQueue::new(None);
        for msg in [b"one".to_vec(), b"two".to_vec(), b"three".to_vec()] {
            queue.push(msg).unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().unwrap(), b"one");
        assert_eq!(queue.pop().unwrap(), b"two");
        assert_eq!(queue.pop().unwrap(), b"three");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn limit_rejects_without_growing() {
        let queue = MessageQueue::new(Some(1));
        queue.push(vec![1]).unwrap();
        let rejected = queue.push(vec![2]).unwrap_err();
        assert_eq!(rejected.limit, 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap(), vec![1]);
    }

    #[test]
    fn clear_reports_dropped_count() {
        let queue = MessageQueue::new(None);
        queue.push(vec![1]).unwrap();
        queue.push(vec![2]).unwrap();
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
