//! `schedq`: the priority queue behind realmhost's timer service.
//!
//! Two layers:
//! - [`PriorityQueue`]: a plain array-backed binary min-heap.
//! - [`SharedQueue`]: a thread-safe wrapper whose sweep path takes an
//!   upgradeable read lock, so "peek, and only pop if due" is one round
//!   trip and concurrent peekers don't serialize on a write lock.

use parking_lot::{RwLock, RwLockUpgradableReadGuard};

/// Returned by `peek`/`dequeue` on an empty queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptyQueue;

impl std::fmt::Display for EmptyQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue is empty")
    }
}

impl std::error::Error for EmptyQueue {}

#[derive(Debug, Clone)]
struct Entry<P, T> {
    pri: P,
    item: T,
}

/// Binary min-heap keyed by `P`. Smallest priority dequeues first.
#[derive(Debug)]
pub struct PriorityQueue<P, T> {
    entries: Vec<Entry<P, T>>,
}

impl<P: Ord, T> PriorityQueue<P, T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            entries: Vec::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn enqueue(&mut self, item: T, pri: P) {
        self.entries.push(Entry { pri, item });
        self.sift_up(self.entries.len() - 1);
    }

    pub fn peek(&self) -> Result<(&T, &P), EmptyQueue> {
        let e = self.entries.first().ok_or(EmptyQueue)?;
        Ok((&e.item, &e.pri))
    }

    pub fn dequeue(&mut self) -> Result<(T, P), EmptyQueue> {
        if self.entries.is_empty() {
            return Err(EmptyQueue);
        }
        let last = self.entries.len() - 1;
        self.entries.swap(0, last);
        let e = self.entries.pop().ok_or(EmptyQueue)?;
        if !self.entries.is_empty() {
            self.sift_down(0);
        }
        Ok((e.item, e.pri))
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.entries[i].pri >= self.entries[parent].pri {
                break;
            }
            self.entries.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.entries.len();
        loop {
            let l = 2 * i + 1;
            let r = 2 * i + 2;
            let mut min = i;
            if l < n && self.entries[l].pri < self.entries[min].pri {
                min = l;
            }
            if r < n && self.entries[r].pri < self.entries[min].pri {
                min = r;
            }
            if min == i {
                break;
            }
            self.entries.swap(i, min);
            i = min;
        }
    }
}

impl<P: Ord, T> Default for PriorityQueue<P, T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe min-queue.
///
/// `dequeue_if` is the sweep primitive: it holds an upgradeable read
/// lock while the caller decides whether the minimum is due, and only
/// upgrades to exclusive when it actually pops.
#[derive(Debug)]
pub struct SharedQueue<P, T> {
    inner: RwLock<PriorityQueue<P, T>>,
}

impl<P: Ord, T> SharedQueue<P, T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PriorityQueue::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn enqueue(&self, item: T, pri: P) {
        self.inner.write().enqueue(item, pri);
    }

    pub fn dequeue(&self) -> Result<(T, P), EmptyQueue> {
        self.inner.write().dequeue()
    }

    /// Pop the minimum entry only if `pred` accepts it.
    ///
    /// Returns `Ok(None)` when the minimum was left in place.
    pub fn dequeue_if(
        &self,
        pred: impl FnOnce(&T, &P) -> bool,
    ) -> Result<Option<(T, P)>, EmptyQueue> {
        let guard = self.inner.upgradable_read();
        let (item, pri) = guard.peek()?;
        if !pred(item, pri) {
            return Ok(None);
        }
        let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
        Ok(Some(guard.dequeue()?))
    }

    pub fn peek_priority(&self) -> Result<P, EmptyQueue>
    where
        P: Clone,
    {
        let guard = self.inner.read();
        let (_, pri) = guard.peek()?;
        Ok(pri.clone())
    }

    /// Point-in-time snapshot in ascending priority order.
    pub fn sorted_snapshot(&self) -> Vec<(T, P)>
    where
        P: Clone,
        T: Clone,
    {
        let guard = self.inner.read();
        let mut v: Vec<(T, P)> = guard
            .entries
            .iter()
            .map(|e| (e.item.clone(), e.pri.clone()))
            .collect();
        drop(guard);
        v.sort_by(|a, b| a.1.cmp(&b.1));
        v
    }
}

impl<P: Ord, T> Default for SharedQueue<P, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dequeues_in_nondecreasing_priority_order() {
        let mut q = PriorityQueue::new();
        for p in [5u64, 1, 9, 3, 3, 7, 0, 2] {
            q.enqueue(p * 10, p);
        }
        let mut last = 0u64;
        let mut n = 0;
        while let Ok((item, pri)) = q.dequeue() {
            assert!(pri >= last);
            assert_eq!(item, pri * 10);
            last = pri;
            n += 1;
        }
        assert_eq!(n, 8);
    }

    #[test]
    fn len_tracks_enqueues_minus_dequeues() {
        let mut q = PriorityQueue::new();
        for i in 0..100u32 {
            q.enqueue(i, i);
        }
        for _ in 0..37 {
            q.dequeue().unwrap();
        }
        assert_eq!(q.len(), 63);
    }

    #[test]
    fn empty_queue_fails() {
        let mut q: PriorityQueue<u32, &str> = PriorityQueue::new();
        assert_eq!(q.peek().unwrap_err(), EmptyQueue);
        assert_eq!(q.dequeue().unwrap_err(), EmptyQueue);
        q.enqueue("x", 1);
        q.dequeue().unwrap();
        assert_eq!(q.dequeue().unwrap_err(), EmptyQueue);
    }

    #[test]
    fn dequeue_if_only_pops_when_due() {
        let q = SharedQueue::new();
        q.enqueue("late", 20u64);
        q.enqueue("due", 5u64);

        let now = 10u64;
        let got = q.dequeue_if(|_, pri| *pri <= now).unwrap();
        assert_eq!(got, Some(("due", 5)));

        let got = q.dequeue_if(|_, pri| *pri <= now).unwrap();
        assert_eq!(got, None);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn snapshot_is_sorted_and_detached() {
        let q = SharedQueue::new();
        for p in [4u32, 2, 8, 6] {
            q.enqueue(p, p);
        }
        let snap = q.sorted_snapshot();
        assert_eq!(
            snap.iter().map(|(_, p)| *p).collect::<Vec<_>>(),
            vec![2, 4, 6, 8]
        );
        // Mutating after the snapshot does not change it.
        q.enqueue(1, 1);
        assert_eq!(snap.len(), 4);
    }

    #[test]
    fn shared_queue_usable_across_threads() {
        let q = std::sync::Arc::new(SharedQueue::new());
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let q = q.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..250u64 {
                    q.enqueue(t, t * 1000 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.len(), 1000);

        let mut last = 0u64;
        while let Ok((_, pri)) = q.dequeue() {
            assert!(pri >= last);
            last = pri;
        }
    }
}
