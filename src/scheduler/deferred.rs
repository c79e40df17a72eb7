use serde::{Deserialize, Serialize};

/// Handle identifying one scheduled task.
///
/// Handles are never reused within a queue, so a stale handle can be
/// cancelled or compared safely after its task fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskHandle(u64);

#[derive(Debug)]
struct PendingTask<K> {
    handle: TaskHandle,
    deadline_ms: f64,
    key: K,
}

/// Cancellable callback-after-delay queue.
///
/// Nothing runs on its own: the owner asks for [`DeferredQueue::next_deadline`]
/// to know when to wake up and drains due tasks with [`DeferredQueue::take_due`].
/// A task is delivered at most once; cancelling a fired or unknown handle is a
/// no-op.
#[derive(Debug)]
pub struct DeferredQueue<K> {
    next_id: u64,
    pending: Vec<PendingTask<K>>,
}

impl<K> DeferredQueue<K> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: Vec::new(),
        }
    }

    /// Schedule `key` to become due `delay_ms` after `now_ms`.
    pub fn schedule(&mut self, now_ms: f64, delay_ms: f64, key: K) -> TaskHandle {
        self.schedule_at(now_ms + delay_ms.max(0.0), key)
    }

    pub fn schedule_at(&mut self, deadline_ms: f64, key: K) -> TaskHandle {
        let handle = TaskHandle(self.next_id);
        self.next_id += 1;
        self.pending.push(PendingTask {
            handle,
            deadline_ms,
            key,
        });
        handle
    }

    /// Cancel a pending task. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        match self.pending.iter().position(|task| task.handle == handle) {
            Some(idx) => {
                self.pending.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, handle: TaskHandle) -> bool {
        self.pending.iter().any(|task| task.handle == handle)
    }

    pub fn deadline(&self, handle: TaskHandle) -> Option<f64> {
        self.pending
            .iter()
            .find(|task| task.handle == handle)
            .map(|task| task.deadline_ms)
    }

    pub fn next_deadline(&self) -> Option<f64> {
        self.pending
            .iter()
            .map(|task| task.deadline_ms)
            .reduce(f64::min)
    }

    /// Remove and return every task whose deadline is at or before `now_ms`,
    /// ordered by deadline and then by scheduling order.
    pub fn take_due(&mut self, now_ms: f64) -> Vec<(TaskHandle, K)> {
        let mut due = Vec::new();
        let mut idx = 0;
        while idx < self.pending.len() {
            if self.pending[idx].deadline_ms <= now_ms {
                due.push(self.pending.swap_remove(idx));
            } else {
                idx += 1;
            }
        }

        due.sort_by(|a, b| {
            a.deadline_ms
                .total_cmp(&b.deadline_ms)
                .then(a.handle.cmp(&b.handle))
        });
        due.into_iter().map(|task| (task.handle, task.key)).collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<K> Default for DeferredQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_fire_in_deadline_order() {
        let mut queue = DeferredQueue::new();
        queue.schedule(0.0, 300.0, "c");
        queue.schedule(0.0, 100.0, "a");
        queue.schedule(0.0, 200.0, "b");

        assert_eq!(queue.next_deadline(), Some(100.0));
        assert!(queue.take_due(50.0).is_empty());

        let fired: Vec<_> = queue.take_due(250.0).into_iter().map(|(_, k)| k).collect();
        assert_eq!(fired, vec!["a", "b"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_deadline(), Some(300.0));
    }

    #[test]
    fn same_deadline_keeps_scheduling_order() {
        let mut queue = DeferredQueue::new();
        for key in 0..5 {
            queue.schedule(10.0, 0.0, key);
        }
        let fired: Vec<_> = queue.take_due(10.0).into_iter().map(|(_, k)| k).collect();
        assert_eq!(fired, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cancelled_task_never_fires() {
        let mut queue = DeferredQueue::new();
        let keep = queue.schedule(0.0, 10.0, "keep");
        let drop = queue.schedule(0.0, 10.0, "drop");

        assert!(queue.cancel(drop));
        assert!(!queue.cancel(drop), "second cancel is a no-op");
        assert!(queue.is_pending(keep));

        let fired = queue.take_due(10.0);
        assert_eq!(fired, vec![(keep, "keep")]);
    }

    #[test]
    fn fired_task_is_delivered_once() {
        let mut queue = DeferredQueue::new();
        let handle = queue.schedule(0.0, 5.0, ());
        assert_eq!(queue.take_due(5.0).len(), 1);
        assert!(queue.take_due(100.0).is_empty());
        assert!(!queue.cancel(handle));
        assert!(queue.is_empty());
    }

    #[test]
    fn negative_delay_is_due_immediately() {
        let mut queue = DeferredQueue::new();
        let handle = queue.schedule(40.0, -10.0, ());
        assert_eq!(queue.deadline(handle), Some(40.0));
    }

    #[test]
    fn handles_are_unique() {
        let mut queue = DeferredQueue::new();
        let a = queue.schedule(0.0, 1.0, ());
        queue.take_due(1.0);
        let b = queue.schedule(0.0, 1.0, ());
        assert_ne!(a, b);
    }
}
