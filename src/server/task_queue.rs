//! Deferred work, grounded on `redis-go`'s `internal/queue.TaskQueue`
//! (`Task{callback any, args []any}` invoked via `reflect.Value.Call`,
//! drained FIFO each loop iteration). Rust has no reflection, so a task here
//! is simply a boxed closure over the loop's shared state — the direct,
//! zero-cost equivalent recorded in the data model.

use std::sync::{Arc, Mutex};

use crate::net::multiplexer::Multiplexer;
use crate::server::state::ServerState;

pub type Task = Box<dyn FnOnce(&ServerState, &mut Multiplexer) + Send>;

/// FIFO queue of deferred tasks, drained once per poll cycle. Used for the
/// `WAIT` collector handing its result back to the loop thread. A task push
/// from a non-loop thread also wakes the loop's `mio::Poll` via the
/// registered `Waker`, so a pending `WAIT` reply isn't stuck behind the next
/// unrelated readiness event.
#[derive(Default)]
pub struct TaskQueue {
    tasks: Mutex<Vec<Task>>,
    waker: Mutex<Option<Arc<mio::Waker>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_waker(&self, waker: Arc<mio::Waker>) {
        *self.waker.lock().unwrap() = Some(waker);
    }

    pub fn push(&self, task: Task) {
        self.tasks.lock().unwrap().push(task);
        if let Some(waker) = self.waker.lock().unwrap().as_ref() {
            let _ = waker.wake();
        }
    }

    /// Removes and returns every task currently queued, in FIFO order.
    pub fn drain(&self) -> Vec<Task> {
        std::mem::take(&mut *self.tasks.lock().unwrap())
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_tasks_in_fifo_order() {
        let queue = TaskQueue::new();
        for _ in 0..3 {
            queue.push(Box::new(|_state: &ServerState, _multiplexer: &mut Multiplexer| {}));
        }
        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert!(queue.is_empty());
    }
}
