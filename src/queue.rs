use std::{
    collections::{
        HashSet,
        VecDeque,
    },
    hash::Hash,
    sync::{
        Mutex,
        MutexGuard,
        PoisonError,
    },
};
use tokio::sync::Notify;

/// Deduplicating work queue between the watchers and the reconciler.
///
/// An item is pending at most once. An item that is added again while it is being processed is handed out again
/// after [`ChangeQueue::done`] was called for it, so updates arriving mid-flight are never lost and the same item is
/// never processed concurrently.
pub struct ChangeQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

struct QueueState<T> {
    /// Pending items in FIFO order.
    queue: VecDeque<T>,
    /// Items that need processing, pending or re-added while processing.
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

impl<T> Default for ChangeQueue<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }
}

impl<T> ChangeQueue<T>
where
    T: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `item` as needing processing. No-op if it is already pending or the queue shut down.
    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            // handed out again by `done`
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Waits for the next item. Returns `None` once the queue is shut down and drained.
    ///
    /// The returned item counts as processing until it is passed to [`ChangeQueue::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks `item` as processed, re-queueing it if it was added while processing.
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stops accepting items and wakes all waiting [`ChangeQueue::get`] calls.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
