//! Worker pool implementation.

use crate::arena::TaskArenas;
use anyhow::{Result, bail};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::{
    fmt,
    num::NonZeroUsize,
    panic,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Instant,
};

/// A nullary unit of work executed by a [`WorkerPool`] worker.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub type PoolResult = Result<(), PoolError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolError {
    ChannelDisconnected,
    PoolJoined,
}

/// A growable set of worker threads executing queued tasks.
///
/// Workers block on a shared unbounded FIFO queue of instructions. The pool
/// starts with a fixed number of workers and grows one worker at a time
/// through [`add_worker`](Self::add_worker); it never shrinks until
/// [`join`](Self::join). Tasks may themselves submit further tasks.
///
/// A panicking task is caught and logged by the worker that ran it; the
/// worker and the pool survive.
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    channel: PoolChannel,
    progress: Arc<ExecutionProgress>,
    workers: Mutex<Vec<Worker>>,
    worker_count: AtomicUsize,
}

#[derive(Debug)]
struct Worker {
    handle: JoinHandle<()>,
}

/// The instruction queue shared between task submitters and all workers.
#[derive(Clone, Debug)]
struct PoolChannel {
    sender: Sender<WorkerInstruction>,
    receiver: Receiver<WorkerInstruction>,
}

/// Tracking of outstanding tasks, used by [`WorkerPool::join`] to wait for
/// the queue and all in-flight tasks to drain.
#[derive(Debug)]
struct ExecutionProgress {
    pending_task_count: AtomicUsize,
    wait_mutex: Mutex<()>,
    no_pending_tasks_condvar: Condvar,
    panic_count: AtomicUsize,
    is_joining: AtomicBool,
}

enum WorkerInstruction {
    Execute(Task),
    Terminate,
}

impl WorkerPool {
    /// Creates a new pool with the given number of worker threads. Workers
    /// are named after the pool.
    ///
    /// # Errors
    /// Returns an error if a worker thread could not be spawned.
    pub fn new(name: impl Into<String>, initial_workers: NonZeroUsize) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let pool = Self {
            name: name.into(),
            channel: PoolChannel { sender, receiver },
            progress: Arc::new(ExecutionProgress::new()),
            workers: Mutex::new(Vec::with_capacity(initial_workers.get())),
            worker_count: AtomicUsize::new(0),
        };
        for _ in 0..initial_workers.get() {
            pool.add_worker()?;
        }
        Ok(pool)
    }

    /// Returns the current number of worker threads in the pool.
    pub fn worker_count(&self) -> usize {
        self.worker_count.load(Ordering::Acquire)
    }

    /// Returns the number of task panics caught since the pool was created.
    pub fn panic_count(&self) -> usize {
        self.progress.panic_count()
    }

    /// Enqueues the given task for execution by the first available worker.
    ///
    /// # Errors
    /// Returns an error if [`join`](Self::join) has begun, or if the
    /// instruction queue has become disconnected.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> PoolResult {
        self.progress.add_pending_task();

        if self.progress.is_joining() {
            self.progress.register_completed_task();
            return Err(PoolError::PoolJoined);
        }

        self.channel
            .send(WorkerInstruction::Execute(Box::new(task)))
            .inspect_err(|_| {
                // The queued task will never run, so the pending count must
                // be rolled back
                self.progress.register_completed_task();
            })
    }

    /// Grows the pool by one worker thread.
    ///
    /// # Errors
    /// Returns an error if the pool has been joined or the thread could not
    /// be spawned.
    pub fn add_worker(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        // Checked under the workers lock so a worker cannot be spawned into
        // a pool that join() is already terminating
        if self.progress.is_joining() {
            bail!("Cannot add a worker to a joined pool");
        }

        let worker_id = workers.len() as u64;
        workers.push(Worker::spawn(
            &self.name,
            worker_id,
            self.channel.clone(),
            Arc::clone(&self.progress),
        )?);
        self.worker_count.store(workers.len(), Ordering::Release);
        Ok(())
    }

    /// Waits until all outstanding tasks have completed, then terminates and
    /// joins every worker. Subsequent [`submit`](Self::submit) and
    /// [`add_worker`](Self::add_worker) calls fail. Calling `join` again
    /// behaves as the first call that already completed.
    pub fn join(&self) {
        if self.progress.begin_join() {
            // Another join already ran (or is running); just wait out any
            // remaining tasks
            self.progress.wait_for_no_pending_tasks();
            return;
        }

        self.progress.wait_for_no_pending_tasks();

        let mut workers = self.workers.lock();
        for _ in 0..workers.len() {
            // Workers exit on the terminate instruction, which sits behind
            // all previously queued tasks in the FIFO
            let _ = self.channel.send(WorkerInstruction::Terminate);
        }
        for worker in workers.drain(..) {
            worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join();
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelDisconnected => write!(f, "Worker pool instruction queue disconnected"),
            Self::PoolJoined => write!(f, "Task submitted to a joined worker pool"),
        }
    }
}

impl std::error::Error for PoolError {}

impl Worker {
    fn spawn(
        pool_name: &str,
        worker_id: u64,
        channel: PoolChannel,
        progress: Arc<ExecutionProgress>,
    ) -> Result<Self> {
        let handle = thread::Builder::new()
            .name(format!("{pool_name} worker {worker_id}"))
            .spawn(move || {
                cascade_log::trace!("Worker {worker_id} spawned");

                loop {
                    let Some(instruction) = channel.wait_for_next_instruction() else {
                        // Queue disconnected
                        break;
                    };

                    match instruction {
                        WorkerInstruction::Execute(task) => {
                            cascade_log::trace!("Worker {worker_id} picked up a task");
                            let task_start = Instant::now();

                            if let Err(cause) = panic::catch_unwind(panic::AssertUnwindSafe(task)) {
                                progress.register_panic();
                                cascade_log::error!("Task panicked: {cause:?}");
                            }

                            cascade_log::trace!(
                                "Worker {worker_id} finished its task after {:.2} ms",
                                task_start.elapsed().as_secs_f64() * 1e3
                            );
                            TaskArenas::reset();
                            progress.register_completed_task();
                        }
                        WorkerInstruction::Terminate => {
                            cascade_log::trace!("Worker {worker_id} terminating");
                            break;
                        }
                    }
                }
            })?;
        Ok(Self { handle })
    }

    fn join(self) {
        if let Err(err) = self.handle.join() {
            cascade_log::error!("Worker thread failed to join: {err:?}");
        }
    }
}

impl PoolChannel {
    fn send(&self, instruction: WorkerInstruction) -> PoolResult {
        self.sender
            .send(instruction)
            .map_err(|_| PoolError::ChannelDisconnected)
    }

    /// Returns [`None`] if the queue was disconnected.
    fn wait_for_next_instruction(&self) -> Option<WorkerInstruction> {
        self.receiver.recv().ok()
    }
}

impl ExecutionProgress {
    fn new() -> Self {
        Self {
            pending_task_count: AtomicUsize::new(0),
            wait_mutex: Mutex::default(),
            no_pending_tasks_condvar: Condvar::new(),
            panic_count: AtomicUsize::new(0),
            is_joining: AtomicBool::new(false),
        }
    }

    fn add_pending_task(&self) {
        self.pending_task_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the count of pending tasks, waking any thread waiting in
    /// [`wait_for_no_pending_tasks`](Self::wait_for_no_pending_tasks) when
    /// the count reaches zero.
    fn register_completed_task(&self) {
        let previous_count = self.pending_task_count.fetch_sub(1, Ordering::AcqRel);
        assert!(previous_count > 0, "Underflow when registering executed task");

        if previous_count == 1 {
            // Lock the wait mutex before notifying so that the notification
            // cannot fall between a waiter's check of `pending_task_count`
            // and its call to `wait`
            let _guard = self.wait_mutex.lock();
            self.no_pending_tasks_condvar.notify_all();
        }
    }

    fn wait_for_no_pending_tasks(&self) {
        if self.pending_task_count.load(Ordering::Acquire) == 0 {
            return;
        }

        let mut guard = self.wait_mutex.lock();
        while self.pending_task_count.load(Ordering::Acquire) != 0 {
            self.no_pending_tasks_condvar.wait(&mut guard);
        }
    }

    fn register_panic(&self) {
        self.panic_count.fetch_add(1, Ordering::AcqRel);
    }

    fn panic_count(&self) -> usize {
        self.panic_count.load(Ordering::Acquire)
    }

    fn is_joining(&self) -> bool {
        self.is_joining.load(Ordering::Acquire)
    }

    /// Marks the pool as joining. Returns whether it already was.
    fn begin_join(&self) -> bool {
        self.is_joining.swap(true, Ordering::AcqRel)
    }
}
