//! Coalescing work queue keyed by object identity.
//!
//! - A key queued twice before a worker picks it up is processed once.
//! - A key being processed is never handed to a second worker.
//! - A key added while in flight is queued again once `done` is called.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Keys waiting to be processed (queued or re-added while in flight).
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shut_down: bool,
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a key as needing work.
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock().expect("work queue lock");
        if state.shut_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().expect("work queue lock");
                if state.shut_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Finish processing a key, re-queueing it if it was added meanwhile.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock().expect("work queue lock");
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shut_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Wake all waiting workers and make `get` return `None`.
    pub fn shutdown(&self) {
        self.state.lock().expect("work queue lock").shut_down = true;
        self.notify.notify_waiters();
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state.lock().expect("work queue lock").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let queue = WorkQueue::new();
        queue.add("default/web");
        queue.add("default/web");
        queue.add("default/api");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some("default/web"));
        assert_eq!(queue.get().await.as_deref(), Some("default/api"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn in_flight_key_is_not_handed_out_twice() {
        let queue = WorkQueue::new();
        queue.add("default/web");
        let key = queue.get().await.unwrap();

        // Re-added while processing: held back until done.
        queue.add("default/web");
        queue.add("default/web");
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("default/web"));
        queue.done("default/web");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn done_without_readd_does_not_requeue() {
        let queue = WorkQueue::new();
        queue.add("a");
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn waiting_worker_wakes_on_add() {
        let queue = Arc::new(WorkQueue::new());
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.add("default/web");
        assert_eq!(worker.await.unwrap().as_deref(), Some("default/web"));
    }

    #[tokio::test]
    async fn shutdown_releases_workers() {
        let queue = Arc::new(WorkQueue::new());
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shutdown();
        for w in workers {
            assert_eq!(w.await.unwrap(), None);
        }
        queue.add("late");
        assert!(queue.is_empty());
    }
}
