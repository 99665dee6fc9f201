//! Bounded worker pool plus an explicit completion barrier.

use anyhow::Result;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::error;

use crate::error::WeaveError;
use crate::pipeline::Phase;

pub fn build_pool(workers: usize) -> Result<ThreadPool> {
    Ok(ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("creation-worker-{i}"))
        .build()?)
}

#[derive(Debug, Default)]
struct GroupState {
    pending: usize,
    completed: usize,
    failures: Vec<String>,
}

/// Tracks tasks spawned onto a pool for one phase. [`TaskGroup::wait`]
/// returns once every task has finished, successfully or not.
#[derive(Debug, Clone)]
pub struct TaskGroup {
    phase: Phase,
    inner: Arc<(Mutex<GroupState>, Condvar)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSummary {
    pub completed: usize,
    pub failures: Vec<String>,
}

impl TaskGroup {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            inner: Arc::new((Mutex::new(GroupState::default()), Condvar::new())),
        }
    }

    /// Runs `task` on `pool`. Errors and panics are logged and counted
    /// against the group; they never reach sibling tasks.
    pub fn spawn<F>(&self, pool: &ThreadPool, label: impl Into<String>, task: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.state().pending += 1;
        let group = self.clone();
        let label = label.into();
        pool.spawn(move || {
            let failure = match catch_unwind(AssertUnwindSafe(task)) {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{label}: {e:#}")),
                Err(panic) => Some(format!("{label}: panicked: {}", panic_message(&*panic))),
            };
            if let Some(message) = &failure {
                error!(phase = %group.phase, "{message}");
            }
            group.finish(failure);
        });
    }

    /// Blocks until every spawned task has finished or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<GroupSummary, WeaveError> {
        let deadline = Instant::now() + timeout;
        let (_, done) = &*self.inner;
        let mut state = self.state();
        while state.pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                return Err(WeaveError::Timeout {
                    phase: self.phase,
                    pending: state.pending,
                    timeout,
                });
            }
            state = match done.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        Ok(GroupSummary {
            completed: state.completed,
            failures: state.failures.clone(),
        })
    }

    fn finish(&self, failure: Option<String>) {
        let (_, done) = &*self.inner;
        let mut state = self.state();
        state.pending -= 1;
        match failure {
            Some(message) => state.failures.push(message),
            None => state.completed += 1,
        }
        done.notify_all();
    }

    fn state(&self) -> MutexGuard<'_, GroupState> {
        let (lock, _) = &*self.inner;
        lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wait_returns_after_all_tasks() {
        let pool = build_pool(4).unwrap();
        let group = TaskGroup::new(Phase::Scan);
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..32 {
            let counter = Arc::clone(&counter);
            group.spawn(&pool, format!("task-{i}"), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let summary = group.wait(Duration::from_secs(10)).unwrap();
        assert_eq!(summary.completed, 32);
        assert!(summary.failures.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn errors_and_panics_are_counted_without_stopping_siblings() {
        let pool = build_pool(2).unwrap();
        let group = TaskGroup::new(Phase::Scan);
        group.spawn(&pool, "ok", || Ok(()));
        group.spawn(&pool, "fails", || anyhow::bail!("broken input"));
        group.spawn(&pool, "panics", || panic!("boom"));
        group.spawn(&pool, "ok-too", || Ok(()));

        let summary = group.wait(Duration::from_secs(10)).unwrap();
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failures.len(), 2);
        assert!(summary.failures.iter().any(|f| f.contains("broken input")));
        assert!(summary.failures.iter().any(|f| f.contains("boom")));
    }

    #[test]
    fn deadline_surfaces_as_timeout() {
        let pool = build_pool(1).unwrap();
        let group = TaskGroup::new(Phase::Clean);
        group.spawn(&pool, "slow", || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        match group.wait(Duration::from_millis(20)) {
            Err(WeaveError::Timeout { phase, pending, .. }) => {
                assert_eq!(phase, Phase::Clean);
                assert_eq!(pending, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
