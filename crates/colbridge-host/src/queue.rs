//! Bounded hand-off queue between the engine thread and a pull consumer.
//!
//! The producer blocks while `capacity` items are buffered. Either side can
//! end the exchange: the producer with [`complete`](BoundedBatchQueue::complete)
//! or [`fail`](BoundedBatchQueue::fail), the consumer with
//! [`close`](BoundedBatchQueue::close), which wakes a blocked producer with
//! [`BridgeError::ConsumerClosed`].

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use colbridge_core::Error as CoreError;

use crate::error::{BridgeError, Result};

struct State<T> {
    items: VecDeque<T>,
    complete: bool,
    closed: bool,
    fault: Option<BridgeError>,
    high_water: usize,
}

impl<T> State<T> {
    fn finished(&self) -> bool {
        self.complete || self.fault.is_some()
    }
}

pub struct BoundedBatchQueue<T> {
    cap: usize,
    state: Mutex<State<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> BoundedBatchQueue<T> {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            state: Mutex::new(State {
                items: VecDeque::new(),
                complete: false,
                closed: false,
                fault: None,
                high_water: 0,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // A panicking peer is reported through its own channel; the queue
        // state itself stays consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_locked(&self, st: &mut State<T>, v: T) {
        st.items.push_back(v);
        st.high_water = st.high_water.max(st.items.len());
        self.not_empty.notify_one();
    }

    /// Block until there is room, then enqueue.
    pub fn put(&self, v: T) -> Result<()> {
        let mut st = self.lock();
        loop {
            if st.closed {
                return Err(BridgeError::ConsumerClosed);
            }
            if st.finished() {
                return Err(CoreError::Invariant("put after the queue was finished".into()).into());
            }
            if st.items.len() < self.cap {
                self.push_locked(&mut st, v);
                return Ok(());
            }
            st = self
                .not_full
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Enqueue without blocking; hands the item back when full or ended.
    pub fn try_put(&self, v: T) -> std::result::Result<(), T> {
        let mut st = self.lock();
        if st.closed || st.finished() || st.items.len() >= self.cap {
            return Err(v);
        }
        self.push_locked(&mut st, v);
        Ok(())
    }

    /// Block for the next item. Buffered items drain before the end is
    /// reported: `Ok(None)` for completion or close, `Err` for a fault.
    pub fn take(&self) -> Result<Option<T>> {
        let mut st = self.lock();
        loop {
            if let Some(v) = st.items.pop_front() {
                self.not_full.notify_one();
                return Ok(Some(v));
            }
            if let Some(e) = &st.fault {
                return Err(e.clone());
            }
            if st.complete || st.closed {
                return Ok(None);
            }
            st = self
                .not_empty
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn try_take(&self) -> Option<T> {
        let mut st = self.lock();
        let v = st.items.pop_front();
        if v.is_some() {
            self.not_full.notify_one();
        }
        v
    }

    /// Producer finished normally.
    pub fn complete(&self) {
        let mut st = self.lock();
        st.complete = true;
        self.not_empty.notify_all();
    }

    /// Producer failed. The first fault wins.
    pub fn fail(&self, e: BridgeError) {
        let mut st = self.lock();
        if st.fault.is_none() && !st.complete {
            st.fault = Some(e);
        }
        self.not_empty.notify_all();
    }

    /// Consumer is done. Buffered items are dropped.
    pub fn close(&self) {
        let mut st = self.lock();
        st.closed = true;
        st.items.clear();
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Largest number of items ever buffered at once.
    pub fn high_water_mark(&self) -> usize {
        self.lock().high_water
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_try_put_respects_capacity() {
        let q = BoundedBatchQueue::with_capacity(2);
        assert!(q.try_put(1).is_ok());
        assert!(q.try_put(2).is_ok());
        assert_eq!(q.try_put(3), Err(3));
        assert_eq!(q.try_take(), Some(1));
        assert!(q.try_put(3).is_ok());
        assert_eq!(q.high_water_mark(), 2);
    }

    #[test]
    fn test_items_drain_before_completion() {
        let q = BoundedBatchQueue::with_capacity(4);
        q.put("a").unwrap();
        q.put("b").unwrap();
        q.complete();
        assert_eq!(q.take().unwrap(), Some("a"));
        assert_eq!(q.take().unwrap(), Some("b"));
        assert_eq!(q.take().unwrap(), None);
        assert!(q.put("c").is_err());
    }

    #[test]
    fn test_fault_reported_after_items() {
        let q = BoundedBatchQueue::with_capacity(4);
        q.put(1).unwrap();
        q.fail(BridgeError::Source("first".into()));
        q.fail(BridgeError::Source("second".into()));
        assert_eq!(q.take().unwrap(), Some(1));
        let err = q.take().unwrap_err();
        assert!(err.to_string().contains("first"));
    }

    #[test]
    fn test_blocked_producer_wakes_on_close() {
        let q = Arc::new(BoundedBatchQueue::with_capacity(1));
        q.put(0).unwrap();
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.put(1))
        };
        q.close();
        let res = producer.join().unwrap();
        assert!(matches!(res, Err(BridgeError::ConsumerClosed)));
        assert_eq!(q.take().unwrap(), None);
    }

    #[test]
    fn test_backpressure_bounds_buffer() {
        let q = Arc::new(BoundedBatchQueue::with_capacity(3));
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for i in 0..100 {
                    q.put(i).unwrap();
                }
                q.complete();
            })
        };
        let mut seen = Vec::new();
        while let Some(v) = q.take().unwrap() {
            seen.push(v);
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        assert!(q.high_water_mark() <= 3);
    }
}
