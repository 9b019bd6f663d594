//! Bounded worker pool for the parallel schedule.
//!
//! A dedicated rayon pool caps concurrency at `workers` threads, independent
//! of the global pool. Indexed parallel iterators collect in input order, so
//! the caller can reduce results single-threaded.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::error::BatchError;

pub struct WorkerPool {
    pool: ThreadPool,
}

impl WorkerPool {
    /// Pool of `workers` threads (at least one).
    pub fn new(workers: usize) -> Result<Self, BatchError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("batch-worker-{i}"))
            .build()?;
        Ok(Self { pool })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `work` over `items` inside the pool. Output is in input order.
    pub fn map<I, T, F>(&self, items: Vec<I>, work: F) -> Vec<T>
    where
        I: Send,
        T: Send,
        F: Fn(I) -> T + Sync + Send,
    {
        if items.is_empty() {
            return Vec::new();
        }
        self.pool.install(|| items.into_par_iter().map(&work).collect())
    }
}

/// One-shot helper: build a pool of `workers` threads and map `items` on it.
pub fn run_bounded<I, T, F>(items: Vec<I>, workers: usize, work: F) -> Result<Vec<T>, BatchError>
where
    I: Send,
    T: Send,
    F: Fn(I) -> T + Sync + Send,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }
    Ok(WorkerPool::new(workers)?.map(items, work))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn results_keep_input_order() {
        let items: Vec<u64> = (0..50).collect();
        let out = run_bounded(items, 8, |n| {
            // Later items finish first
            std::thread::sleep(Duration::from_micros((50 - n) * 20));
            n * 2
        })
        .unwrap();
        assert_eq!(out, (0..50).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn never_exceeds_worker_count() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        run_bounded((0..40).collect::<Vec<_>>(), 3, |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
            active.fetch_sub(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn runs_on_multiple_threads() {
        let ids = Mutex::new(HashSet::new());
        run_bounded((0..16).collect::<Vec<_>>(), 4, |_| {
            std::thread::sleep(Duration::from_millis(5));
            ids.lock().unwrap().insert(std::thread::current().id());
        })
        .unwrap();
        assert!(ids.lock().unwrap().len() > 1);
    }

    #[test]
    fn empty_input_spawns_nothing() {
        let out: Vec<u8> = run_bounded(Vec::<u8>::new(), 8, |n| n).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn zero_workers_still_runs() {
        assert_eq!(run_bounded(vec![1, 2, 3], 0, |n| n + 1).unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn pool_is_reused_across_chunks() {
        let pool = WorkerPool::new(2).unwrap();
        assert_eq!(pool.workers(), 2);
        assert_eq!(pool.map(vec![1, 2, 3], |n| n * 10), vec![10, 20, 30]);
        assert_eq!(pool.map(vec![4, 5], |n| n * 10), vec![40, 50]);
    }

    #[test]
    fn work_runs_on_pool_threads() {
        let pool = WorkerPool::new(2).unwrap();
        let names = pool.map((0..6).collect::<Vec<_>>(), |_| {
            std::thread::current().name().unwrap_or_default().to_string()
        });
        assert!(names.iter().all(|n| n.starts_with("batch-worker-")));
    }
}
