//! Rayon-backed scheduler.

use rayon::{ThreadPool, ThreadPoolBuilder};

use super::{TaskGroup, TaskScheduler};
use crate::error::TaskError;

/// Runs each dependency level as one parallel wave on a rayon pool.
///
/// A panicking task is re-raised on the thread calling `execute` once the
/// wave has finished.
pub struct RayonScheduler {
    pool: ThreadPool,
}

impl RayonScheduler {
    /// Builds a pool with `threads` workers; `0` lets rayon decide.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::PoolBuild`] if the threads cannot be spawned.
    pub fn new(threads: usize) -> Result<Self, TaskError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("ember-worker-{i}"))
            .build()
            .map_err(|e| TaskError::PoolBuild(e.to_string()))?;
        tracing::info!(threads = pool.current_num_threads(), "rayon scheduler started");
        Ok(Self { pool })
    }
}

impl std::fmt::Debug for RayonScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayonScheduler")
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl TaskScheduler for RayonScheduler {
    fn name(&self) -> &'static str {
        "rayon"
    }

    fn execute(&self, group: TaskGroup<'_>) -> Result<(), TaskError> {
        for level in group.into_levels()? {
            match level.len() {
                0 => {}
                1 => {
                    // Not worth a pool round trip
                    for (_, task) in level {
                        task();
                    }
                }
                _ => self.pool.scope(|scope| {
                    for (name, task) in level {
                        scope.spawn(move |_| {
                            let _span = tracing::trace_span!("task", name).entered();
                            task();
                        });
                    }
                }),
            }
        }
        Ok(())
    }

    fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_waves_respect_edges() {
        let scheduler = RayonScheduler::new(4).unwrap();
        let first_done = AtomicUsize::new(0);
        let seen_by_second = AtomicUsize::new(usize::MAX);

        let mut group = TaskGroup::new();
        let mut firsts = Vec::new();
        for _ in 0..8 {
            firsts.push(group.submit(
                "first",
                Box::new(|| {
                    first_done.fetch_add(1, Ordering::SeqCst);
                }),
            ));
        }
        let second = group.submit(
            "second",
            Box::new(|| {
                seen_by_second.store(first_done.load(Ordering::SeqCst), Ordering::SeqCst);
            }),
        );
        for first in firsts {
            group.depends_on(second, first).unwrap();
        }

        scheduler.execute(group).unwrap();
        assert_eq!(seen_by_second.load(Ordering::SeqCst), 8);
        assert_eq!(scheduler.name(), "rayon");
    }
}
