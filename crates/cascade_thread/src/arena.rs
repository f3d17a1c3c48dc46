//! Per-worker arena allocation.

use bumpalo::Bump;
use std::cell::RefCell;

pub type Arena = Bump;

thread_local! {
    static THREAD_LOCAL_ARENA: RefCell<Bump> = RefCell::new(Arena::new());
}

/// Thread-local arenas for allocating memory that will not outlive the task
/// currently executing on the worker.
///
/// Each [`WorkerPool`](crate::WorkerPool) worker resets its arena after every
/// task, reclaiming all task-scoped allocations in bulk. Tasks opt in by
/// allocating through [`TaskArenas::with`]; nothing in the runtime requires
/// them to.
#[derive(Debug)]
pub struct TaskArenas;

impl TaskArenas {
    /// Calls the given closure with the calling thread's task arena.
    ///
    /// Allocations made through the arena are reclaimed when the current task
    /// finishes, so they must not escape the task.
    pub fn with<R>(f: impl FnOnce(&Arena) -> R) -> R {
        THREAD_LOCAL_ARENA.with(|arena| f(&arena.borrow()))
    }

    /// Resets the calling thread's task arena, reclaiming all allocations
    /// made through it since the last reset.
    pub(crate) fn reset() {
        THREAD_LOCAL_ARENA.with(|arena| {
            let mut arena = arena.borrow_mut();
            if arena.allocated_bytes() > 0 {
                cascade_log::debug!(
                    "Resetting task arena with {} allocated bytes",
                    arena.allocated_bytes()
                );
            }
            arena.reset();
        });
    }
}
