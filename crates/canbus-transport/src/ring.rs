//! Bounded ring queues.
//!
//! `RingQueue` has N slots and holds at most N-1 items: full is
//! `next(head) == tail`, empty is `head == tail`. A failed push hands the
//! item back and leaves the queue untouched.
//!
//! `SharedRing` wraps one behind a mutex taken for the duration of a single
//! push or pop, with a `Notify` so one async consumer can wait for items.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

pub struct RingQueue<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
}

impl<T> RingQueue<T> {
    /// Create a ring with `slots` slots (minimum 2).
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(2);
        Self {
            slots: (0..slots).map(|_| None).collect(),
            head: 0,
            tail: 0,
        }
    }

    fn next(&self, n: usize) -> usize {
        (n + 1) % self.slots.len()
    }

    /// Usable capacity: one slot is always kept empty.
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        self.next(self.head) == self.tail
    }

    pub fn len(&self) -> usize {
        (self.head + self.slots.len() - self.tail) % self.slots.len()
    }

    pub fn room(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.slots[self.head] = Some(item);
        self.head = self.next(self.head);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let item = self.slots[self.tail].take();
        self.tail = self.next(self.tail);
        item
    }

    pub fn clear(&mut self) {
        while self.pop().is_some() {}
    }
}

pub struct SharedRing<T> {
    ring: Mutex<RingQueue<T>>,
    ready: Arc<Notify>,
}

impl<T> SharedRing<T> {
    pub fn new(slots: usize) -> Self {
        Self::with_notify(slots, Arc::new(Notify::new()))
    }

    /// Share a wakeup with other rings so one task can drain several.
    pub fn with_notify(slots: usize, ready: Arc<Notify>) -> Self {
        Self {
            ring: Mutex::new(RingQueue::new(slots)),
            ready,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingQueue<T>> {
        // Every critical section leaves the ring consistent, so a poisoned
        // lock is still safe to use.
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, item: T) -> Result<(), T> {
        self.lock().push(item)?;
        self.ready.notify_one();
        Ok(())
    }

    /// Push as many items as fit; returns how many were accepted.
    pub fn push_all(&self, items: impl IntoIterator<Item = T>) -> usize {
        let mut accepted = 0;
        {
            let mut ring = self.lock();
            for item in items {
                if ring.push(item).is_err() {
                    break;
                }
                accepted += 1;
            }
        }
        if accepted > 0 {
            self.ready.notify_one();
        }
        accepted
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop()
    }

    /// Wait until an item is available. Single consumer.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.ready.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[test]
    fn test_full_push_fails_without_change() {
        let mut ring = RingQueue::new(4);
        assert_eq!(ring.capacity(), 3);
        for i in 0..3 {
            ring.push(i).unwrap();
        }
        assert!(ring.is_full());
        assert_eq!(ring.push(99), Err(99));
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.pop(), Some(0));
    }

    #[test]
    fn test_empty_pop_fails_without_change() {
        let mut ring: RingQueue<u8> = RingQueue::new(4);
        assert_eq!(ring.pop(), None);
        assert!(ring.is_empty());
        assert_eq!(ring.room(), 3);
    }

    #[test]
    fn test_fifo_order_across_wrap() {
        let mut ring = RingQueue::new(5);
        for round in 0..3 {
            for i in 0..4 {
                ring.push(round * 10 + i).unwrap();
            }
            let out: Vec<_> = std::iter::from_fn(|| ring.pop()).collect();
            assert_eq!(out, (0..4).map(|i| round * 10 + i).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_push_all_stops_when_full() {
        let ring = SharedRing::new(4);
        assert_eq!(ring.push_all(0..10), 3);
        assert_eq!(ring.len(), 3);
    }

    #[tokio::test]
    async fn test_async_pop_wakes_on_push() {
        let ring = Arc::new(SharedRing::new(8));
        let consumer = {
            let ring = ring.clone();
            tokio::spawn(async move { ring.pop().await })
        };
        tokio::task::yield_now().await;
        ring.push(7u32).unwrap();
        assert_eq!(consumer.await.unwrap(), 7);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(u16),
        Pop,
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![any::<u16>().prop_map(Op::Push), Just(Op::Pop)]
    }

    proptest! {
        #[test]
        fn prop_matches_bounded_fifo(slots in 2usize..16, ops in prop::collection::vec(arb_op(), 0..200)) {
            let mut ring = RingQueue::new(slots);
            let mut model = VecDeque::new();
            for op in ops {
                match op {
                    Op::Push(v) => {
                        let accepted = ring.push(v).is_ok();
                        prop_assert_eq!(accepted, model.len() < slots - 1);
                        if accepted {
                            model.push_back(v);
                        }
                    }
                    Op::Pop => prop_assert_eq!(ring.pop(), model.pop_front()),
                }
                prop_assert_eq!(ring.len(), model.len());
            }
        }
    }
}
