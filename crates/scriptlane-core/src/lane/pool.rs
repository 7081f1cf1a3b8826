//! Fixed pool of lanes with round-robin assignment.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::config::Engine;
use crate::error::{Error, Result};

use super::worker::LaneHandle;

/// Fixed set of lanes shared by all executions.
///
/// Lane threads are detached: they do not keep the process alive and are not
/// joined on dispose. Work still queued when the pool is disposed is dropped.
pub struct LanePool {
    /// One handle per lane, indexed by lane number.
    lanes: Vec<LaneHandle>,
    /// Round-robin cursor.
    next: AtomicUsize,
    disposed: AtomicBool,
}

impl LanePool {
    /// Spawn `count` lanes sharing `engine`.
    pub fn new(count: usize, engine: Arc<Engine>) -> Result<Self> {
        if count == 0 {
            return Err(Error::config("lane pool needs at least one lane"));
        }

        let mut lanes = Vec::with_capacity(count);
        for index in 0..count {
            match LaneHandle::spawn(index, Arc::clone(&engine)) {
                Ok((lane, _thread)) => lanes.push(lane),
                Err(e) => {
                    for lane in &lanes {
                        lane.shutdown();
                    }
                    return Err(e);
                }
            }
        }

        tracing::debug!("Started lane pool with {} lanes", count);
        Ok(Self {
            lanes,
            next: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    /// Pick the next lane in round-robin order.
    ///
    /// Concurrent callers may observe the cursor in any order, which can skew
    /// fairness but always yields a valid lane.
    pub fn next_lane(&self) -> Result<LaneHandle> {
        if self.is_disposed() {
            return Err(Error::lane("lane pool has been disposed"));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.lanes.len();
        Ok(self.lanes[index].clone())
    }

    /// Get a lane by index.
    pub fn lane(&self, index: usize) -> Option<&LaneHandle> {
        self.lanes.get(index)
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Shut every lane down. Calling this more than once has no further effect.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        for lane in &self.lanes {
            lane.shutdown();
        }
        tracing::debug!("Disposed lane pool with {} lanes", self.lanes.len());
    }
}

impl Drop for LanePool {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::thread;
    use std::time::{Duration, Instant};

    fn pool(count: usize) -> LanePool {
        LanePool::new(count, Arc::new(Engine::default())).unwrap()
    }

    #[test]
    fn test_round_robin_visits_each_lane_once() {
        let pool = pool(4);
        let mut seen: Vec<usize> = (0..4).map(|_| pool.next_lane().unwrap().index()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_round_robin_wraps() {
        let pool = pool(3);
        let picks: Vec<usize> = (0..7).map(|_| pool.next_lane().unwrap().index()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_concurrent_assignment_stays_in_range() {
        let pool = Arc::new(pool(3));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    (0..100)
                        .map(|_| pool.next_lane().unwrap().index())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut counts = [0usize; 3];
        for handle in handles {
            for index in handle.join().unwrap() {
                counts[index] += 1;
            }
        }
        assert_eq!(counts.iter().sum::<usize>(), 800);
    }

    #[test]
    fn test_zero_lanes_rejected() {
        let err = LanePool::new(0, Arc::new(Engine::default())).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let pool = pool(2);
        pool.dispose();
        pool.dispose();
        assert!(pool.is_disposed());
        assert_eq!(pool.next_lane().unwrap_err().kind(), ErrorKind::Lane);

        // Lane threads wind down shortly after the shutdown message
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.lane(0).unwrap().is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!pool.lane(0).unwrap().is_running());
    }
}
