//! Thread-safe FIFO queue shared between callback and application threads.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Unbounded FIFO with an optional stop flag.
///
/// After [`Queue::stop`] further pushes are discarded, while already queued
/// items can still be popped.
#[derive(Debug)]
pub struct Queue<T> {
    inner: Mutex<QueueInner<T>>,
}

#[derive(Debug)]
struct QueueInner<T> {
    items: VecDeque<T>,
    stopped: bool,
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                stopped: false,
            }),
        }
    }

    /// Append at the tail. Returns false if the queue is stopped.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return false;
        }
        inner.items.push_back(item);
        true
    }

    /// Put an item back at the head, ahead of everything queued.
    ///
    /// Used to return a partially consumed head item; ignores the stop flag.
    pub fn push_front(&self, item: T) {
        self.inner.lock().items.push_front(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Run `f` against the head item without removing it.
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.inner.lock().items.front().map(f)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Drop every queued item.
    pub fn clear(&self) {
        self.inner.lock().items.clear();
    }

    pub fn stop(&self) {
        self.inner.lock().stopped = true;
    }

    pub fn resume(&self) {
        self.inner.lock().stopped = false;
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = Queue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.peek_with(|head| *head), Some(2));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_push_front_goes_first() {
        let queue = Queue::new();
        queue.push(2);
        queue.push_front(1);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stop_rejects_push_but_keeps_items() {
        let queue = Queue::new();
        queue.push("a");
        queue.stop();
        assert!(!queue.push("b"));
        assert_eq!(queue.pop(), Some("a"));
        assert_eq!(queue.pop(), None);

        queue.resume();
        assert!(queue.push("c"));
    }
}
