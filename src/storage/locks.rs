//! Per-task-name write locks.
//!
//! One logical lock per task name, held only for the duration of a single
//! durable write. Unrelated task names never contend.

use crate::models::{PerduraError, Result};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Registry of exclusive locks keyed by task name.
#[derive(Debug, Default)]
pub struct TaskLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TaskLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the exclusive lock for `task_name`.
    pub fn with_lock<T>(&self, task_name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.lock_for(task_name);
        let _guard: MutexGuard<'_, ()> = lock
            .lock()
            .map_err(|_| PerduraError::Internal(format!("write lock poisoned for '{task_name}'")))?;
        f()
    }

    /// Drop the lock entry for `task_name` unless someone still holds it.
    pub fn release(&self, task_name: &str) {
        self.locks
            .remove_if(task_name, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Number of task names currently tracked.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn lock_for(&self, task_name: &str) -> Arc<Mutex<()>> {
        // Clone the Arc out so the shard guard is released before blocking.
        Arc::clone(
            self.locks
                .entry(task_name.to_string())
                .or_default()
                .value(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_same_name_is_serialized() {
        let locks = Arc::new(TaskLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    locks
                        .with_lock("task", || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_inside.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(2));
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_different_names_get_different_locks() {
        let locks = TaskLocks::new();
        locks
            .with_lock("a", || locks.with_lock("b", || Ok(())))
            .unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_release_prunes_idle_entries_only() {
        let locks = TaskLocks::new();
        locks.with_lock("a", || Ok(())).unwrap();
        locks
            .with_lock("b", || {
                locks.release("b");
                Ok(())
            })
            .unwrap();
        assert_eq!(locks.len(), 2);

        locks.release("a");
        locks.release("b");
        locks.release("never-locked");
        assert!(locks.is_empty());
    }
}
