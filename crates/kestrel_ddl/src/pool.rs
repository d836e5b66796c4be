//! Bounded DDL worker pools.
//!
//! One pool per worker class; both ship with capacity 1. The selector's
//! runnability predicates lean on that cardinality, so growing a pool also
//! means revisiting the predicates (see `job::id_sets_overlap`).

use std::fmt;

use parking_lot::Mutex;

/// Worker class a job is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    General,
    Reorg,
}

impl WorkerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerKind::General => "general",
            WorkerKind::Reorg => "reorg",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A checked-out DDL worker.
#[derive(Debug)]
pub struct Worker {
    pub id: u64,
    pub kind: WorkerKind,
}

/// Fixed-size, non-blocking worker pool.
#[derive(Debug)]
pub struct WorkerPool {
    kind: WorkerKind,
    capacity: usize,
    free: Mutex<Vec<Worker>>,
}

impl WorkerPool {
    pub fn new(kind: WorkerKind, capacity: usize) -> WorkerPool {
        let free = (0..capacity as u64).map(|id| Worker { id, kind }).collect();
        WorkerPool {
            kind,
            capacity,
            free: Mutex::new(free),
        }
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Non-blocking acquire; `None` when the pool is exhausted.
    pub fn get(&self) -> Option<Worker> {
        self.free.lock().pop()
    }

    pub fn put(&self, worker: Worker) {
        debug_assert_eq!(worker.kind, self.kind);
        let mut free = self.free.lock();
        debug_assert!(free.len() < self.capacity, "worker returned twice");
        free.push(worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion_is_non_blocking() {
        let pool = WorkerPool::new(WorkerKind::General, 1);
        let w = pool.get().expect("one worker");
        assert!(pool.get().is_none());
        pool.put(w);
        assert!(pool.get().is_some());
    }

    #[test]
    fn test_pool_capacity() {
        let pool = WorkerPool::new(WorkerKind::Reorg, 2);
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.available(), 2);
        let _w = pool.get();
        assert_eq!(pool.available(), 1);
    }
}
