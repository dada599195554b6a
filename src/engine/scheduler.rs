//! Dependency tracking and concurrency limiting for parallel step workers.
//!
//! Steps call [`DepGraph::wait_for_deps`] before starting and
//! [`DepGraph::mark_done`] when finished. The [`Condvar`] wakes all waiting
//! workers whenever a new completion is recorded, so each worker re-checks
//! its own prerequisite set.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

/// Shared completion state for dependency-driven step scheduling.
///
/// Unlike a plain completion set, each entry records whether the step ended
/// successfully — a worker whose prerequisite finished in failure must not
/// run, it must skip.
#[derive(Debug, Default)]
pub struct DepGraph {
    /// Step id to "ended successfully" for every finished step.
    done: Mutex<HashMap<String, bool>>,
    /// Notified whenever a step finishes.
    condvar: Condvar,
}

/// What a worker learned about its prerequisites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepsStatus {
    /// Every prerequisite finished successfully.
    Ready,
    /// At least one prerequisite failed or was skipped.
    Blocked,
}

impl DepGraph {
    /// Create an empty graph with no finished steps.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until every id in `deps` has finished, then report whether all
    /// of them succeeded.
    pub fn wait_for_deps(&self, deps: &[String]) -> DepsStatus {
        if deps.is_empty() {
            return DepsStatus::Ready;
        }
        let mut done = self
            .done
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while !deps.iter().all(|d| done.contains_key(d)) {
            done = self
                .condvar
                .wait(done)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        let all_ok = deps.iter().all(|d| done.get(d) == Some(&true));
        drop(done);
        if all_ok {
            DepsStatus::Ready
        } else {
            DepsStatus::Blocked
        }
    }

    /// Record a step as finished and wake all waiting workers.
    pub fn mark_done(&self, id: &str, success: bool) {
        let mut done = self
            .done
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        done.insert(id.to_string(), success);
        drop(done);
        self.condvar.notify_all();
    }
}

/// Counting semaphore bounding how many steps execute at once.
///
/// Workers blocked on [`DepGraph::wait_for_deps`] hold no permit, so a deep
/// dependency chain never deadlocks the limit — only actively probing or
/// applying steps count against it.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    /// Create a semaphore with `permits` concurrent slots (minimum one).
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits.max(1)),
            condvar: Condvar::new(),
        }
    }

    /// Block until a slot is free, returning a guard that releases it.
    pub fn acquire(&self) -> Permit<'_> {
        let mut permits = self
            .permits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while *permits == 0 {
            permits = self
                .condvar
                .wait(permits)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        *permits -= 1;
        drop(permits);
        Permit { semaphore: self }
    }
}

/// RAII guard for one semaphore slot.
#[derive(Debug)]
pub struct Permit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut permits = self
            .semaphore
            .permits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *permits += 1;
        drop(permits);
        self.semaphore.condvar.notify_one();
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    // -----------------------------------------------------------------------
    // DepGraph
    // -----------------------------------------------------------------------

    #[test]
    fn no_deps_does_not_block() {
        let graph = DepGraph::new();
        assert_eq!(graph.wait_for_deps(&[]), DepsStatus::Ready);
    }

    #[test]
    fn satisfied_deps_do_not_block() {
        let graph = DepGraph::new();
        graph.mark_done("a", true);
        assert_eq!(graph.wait_for_deps(&["a".to_string()]), DepsStatus::Ready);
    }

    #[test]
    fn failed_dep_reports_blocked() {
        let graph = DepGraph::new();
        graph.mark_done("a", false);
        assert_eq!(graph.wait_for_deps(&["a".to_string()]), DepsStatus::Blocked);
    }

    #[test]
    fn mixed_deps_report_blocked() {
        let graph = DepGraph::new();
        graph.mark_done("a", true);
        graph.mark_done("b", false);
        let deps = vec!["a".to_string(), "b".to_string()];
        assert_eq!(graph.wait_for_deps(&deps), DepsStatus::Blocked);
    }

    #[test]
    fn mark_done_notifies_waiters() {
        let graph = Arc::new(DepGraph::new());
        let g = Arc::clone(&graph);
        let handle = std::thread::spawn(move || g.wait_for_deps(&["a".to_string()]));
        std::thread::sleep(Duration::from_millis(50));
        graph.mark_done("a", true);
        assert_eq!(
            handle.join().expect("waiter thread should complete"),
            DepsStatus::Ready
        );
    }

    #[test]
    fn multiple_deps_all_required() {
        let graph = Arc::new(DepGraph::new());
        let g = Arc::clone(&graph);
        let handle =
            std::thread::spawn(move || g.wait_for_deps(&["a".to_string(), "b".to_string()]));
        graph.mark_done("a", true);
        // Only one dep finished, the waiter must still be blocked.
        std::thread::sleep(Duration::from_millis(50));
        graph.mark_done("b", true);
        assert_eq!(
            handle.join().expect("waiter thread should complete"),
            DepsStatus::Ready
        );
    }

    // -----------------------------------------------------------------------
    // Semaphore
    // -----------------------------------------------------------------------

    #[test]
    fn semaphore_limits_concurrent_holders() {
        let semaphore = Arc::new(Semaphore::new(2));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|s| {
            for _ in 0..8 {
                let semaphore = Arc::clone(&semaphore);
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                s.spawn(move || {
                    let _permit = semaphore.acquire();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        assert!(peak.load(Ordering::SeqCst) <= 2, "peak: {peak:?}");
    }

    #[test]
    fn zero_permits_is_clamped_to_one() {
        let semaphore = Semaphore::new(0);
        let _permit = semaphore.acquire();
    }
}
