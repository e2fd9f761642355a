//! A bounded queue delivering values in key order, plus a one-shot
//! thread wrapper. Producers register themselves so consumers can tell
//! a drained queue from a finished one.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};
use std::thread::JoinHandle;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue has no producers")]
    QueueWithoutProducers,
}

struct Entry<K, V> {
    key: K,
    seq: u64,
    value: V,
}

impl<K: Ord, V> PartialEq for Entry<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.seq == other.seq
    }
}

impl<K: Ord, V> Eq for Entry<K, V> {}

impl<K: Ord, V> PartialOrd for Entry<K, V> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, V> Ord for Entry<K, V> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Ties resolve in insertion order.
        self.key
            .cmp(&other.key)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

struct State<K, V> {
    heap: BinaryHeap<Reverse<Entry<K, V>>>,
    producers: usize,
    next_seq: u64,
}

pub struct BoundedOrderedQueue<K, V> {
    capacity: usize,
    state: Mutex<State<K, V>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<K: Ord, V> BoundedOrderedQueue<K, V> {
    /// A queue with one registered producer.
    pub fn new(capacity: usize) -> BoundedOrderedQueue<K, V> {
        assert!(capacity > 0);
        BoundedOrderedQueue {
            capacity,
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                producers: 1,
                next_seq: 0,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    pub fn add_producer(&self) {
        let mut state = self.state.lock().unwrap();
        state.producers += 1;
    }

    /// Deregister one producer. Consumers blocked on an empty queue are
    /// woken when the last producer leaves.
    pub fn remove_producer(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.producers > 0);
        state.producers -= 1;
        if state.producers == 0 {
            drop(state);
            self.not_empty.notify_all();
        }
    }

    /// Insert a pair, blocking while the queue is at capacity.
    pub fn push(&self, key: K, value: V) {
        let mut state = self.state.lock().unwrap();
        while state.heap.len() >= self.capacity {
            state = self.not_full.wait(state).unwrap();
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Reverse(Entry { key, seq, value }));
        drop(state);
        self.not_empty.notify_one();
    }

    /// Remove the pair with the smallest key, blocking while the queue
    /// is empty and producers remain.
    pub fn pop(&self) -> Result<(K, V), QueueError> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(Reverse(entry)) = state.heap.pop() {
                drop(state);
                self.not_full.notify_one();
                return Ok((entry.key, entry.value));
            }
            if state.producers == 0 {
                return Err(QueueError::QueueWithoutProducers);
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }
}

/// A one-shot worker thread with an explicit join.
pub struct Task {
    handle: Option<JoinHandle<()>>,
}

impl Task {
    pub fn spawn<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            handle: Some(std::thread::spawn(f)),
        }
    }

    pub fn wait(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.join().expect("task panicked");
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ordered_pop() {
        let queue = BoundedOrderedQueue::new(10);
        queue.push(3, "c");
        queue.push(1, "a");
        queue.push(2, "b");
        assert_eq!(queue.pop().unwrap(), (1, "a"));
        assert_eq!(queue.pop().unwrap(), (2, "b"));
        assert_eq!(queue.pop().unwrap(), (3, "c"));
    }

    #[test]
    fn test_no_producers() {
        let queue: BoundedOrderedQueue<u32, ()> = BoundedOrderedQueue::new(4);
        queue.push(1, ());
        queue.remove_producer();
        assert_eq!(queue.pop().unwrap(), (1, ()));
        assert_eq!(queue.pop(), Err(QueueError::QueueWithoutProducers));
    }

    #[test]
    fn test_blocking_push_and_cross_thread_pop() {
        let queue = Arc::new(BoundedOrderedQueue::new(2));
        let producer_queue = queue.clone();
        let producer = Task::spawn(move || {
            for i in 0..20u32 {
                producer_queue.push(i, i * 2);
            }
            producer_queue.remove_producer();
        });
        let mut seen = Vec::new();
        while let Ok((key, value)) = queue.pop() {
            assert_eq!(value, key * 2);
            seen.push(key);
        }
        producer.wait();
        assert_eq!(seen.len(), 20);
    }

    #[test]
    fn test_pop_waits_for_producer() {
        let queue = Arc::new(BoundedOrderedQueue::new(2));
        let producer_queue = queue.clone();
        let producer = Task::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            producer_queue.push(7u32, "late");
            producer_queue.remove_producer();
        });
        assert_eq!(queue.pop().unwrap(), (7, "late"));
        producer.wait();
    }
}
