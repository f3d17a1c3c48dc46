//! Nets and their scheduler.

use crate::{
    IndexMap, IndexSet,
    action::{Action, ActionHandler, ActionId},
    observer::NetObserver,
    runner,
    transition::{DEFAULT_EVALUATION_DELAY, Transition, TransitionId, TransitionPredicate},
};
use anyhow::{Result, bail};
use cascade_thread::WorkerPool;
use parking_lot::{Condvar, Mutex, RwLock};
use std::{
    collections::VecDeque,
    fmt,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

/// Number of workers a net's pool starts out with. The scheduler grows the
/// pool whenever the number of active states reaches the worker count.
const INITIAL_WORKERS: NonZeroUsize = NonZeroUsize::new(4).unwrap();

/// How long the manager backs off between cycles while activations are
/// pending below their token threshold.
const MANAGER_IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// A Petri net: a graph of [`Action`]s and [`Transition`]s together with the
/// machinery to execute it concurrently.
///
/// A net is built up with [`add_action`](Self::add_action) and
/// [`connect`](Self::connect), then driven by [`run`](Self::run). While the
/// net is running its structure is frozen; only token counters change.
/// Execution ends when no action is active anymore, or on
/// [`stop`](Self::stop).
pub struct Net {
    inner: Arc<NetInner>,
}

pub(crate) struct NetInner {
    name: String,
    graph: RwLock<NetGraph>,
    /// The activation lock: protects both scheduler queues, `active_states`,
    /// and every action's token counter.
    state: Mutex<SchedulerState>,
    activation_condition: Condvar,
    running: AtomicBool,
    observer: RwLock<Option<Arc<dyn NetObserver>>>,
    manager: Mutex<Option<ManagerHandle>>,
    pool: Mutex<Option<Arc<WorkerPool>>>,
}

struct NetGraph {
    actions: IndexMap<ActionId, ActionNode>,
    next_transition_id: u64,
}

struct ActionNode {
    action: Arc<Action>,
    transitions: Vec<Arc<Transition>>,
}

struct SchedulerState {
    /// Actions that have received tokens and await promotion. Keyed by
    /// action identity; insertion is idempotent, so several tokens arriving
    /// for the same action in one cycle coalesce.
    to_be_activated: IndexSet<ActionId>,
    /// Actions whose activation has finished, in completion order.
    to_be_disabled: VecDeque<ActionId>,
    /// Number of in-flight runners plus `to_be_activated` entries at or
    /// above their token threshold.
    active_states: usize,
}

struct ManagerHandle {
    thread_id: ThreadId,
    handle: JoinHandle<()>,
}

impl Net {
    /// Creates an empty net with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(NetInner {
                name: name.into(),
                graph: RwLock::new(NetGraph {
                    actions: IndexMap::default(),
                    next_transition_id: 0,
                }),
                state: Mutex::new(SchedulerState {
                    to_be_activated: IndexSet::default(),
                    to_be_disabled: VecDeque::new(),
                    active_states: 0,
                }),
                activation_condition: Condvar::new(),
                running: AtomicBool::new(false),
                observer: RwLock::new(None),
                manager: Mutex::new(None),
                pool: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the net is currently executing.
    pub fn running(&self) -> bool {
        self.inner.running()
    }

    /// Adds an action with the given handler to the net.
    ///
    /// If `active`, the action is part of the initial marking: its token
    /// counter is preloaded to the firing threshold and it activates as soon
    /// as the net runs.
    ///
    /// # Errors
    /// Returns an error if the net is running, the id is already registered,
    /// or `required_tokens` is zero.
    pub fn add_action(
        &self,
        id: impl Into<ActionId>,
        name: impl Into<String>,
        handler: impl ActionHandler + 'static,
        required_tokens: usize,
        active: bool,
    ) -> Result<ActionId> {
        self.insert_action(
            id.into(),
            name.into(),
            Some(Box::new(handler)),
            required_tokens,
            active,
        )
    }

    /// Adds an action without a handler; on activation it logs and produces
    /// [`ActionResult::OK`](crate::ActionResult::OK).
    ///
    /// # Errors
    /// As for [`add_action`](Self::add_action).
    pub fn add_default_action(
        &self,
        id: impl Into<ActionId>,
        name: impl Into<String>,
        required_tokens: usize,
        active: bool,
    ) -> Result<ActionId> {
        self.insert_action(id.into(), name.into(), None, required_tokens, active)
    }

    /// Connects two actions with a transition guarded by the given
    /// predicate, using the default evaluation delay.
    ///
    /// # Errors
    /// Returns an error if the net is running or either endpoint is unknown.
    pub fn connect(
        &self,
        from: impl Into<ActionId>,
        to: impl Into<ActionId>,
        predicate: impl TransitionPredicate + 'static,
    ) -> Result<TransitionId> {
        self.insert_transition(
            from.into(),
            to.into(),
            Box::new(predicate),
            DEFAULT_EVALUATION_DELAY,
        )
    }

    /// Like [`connect`](Self::connect), with an explicit minimum delay
    /// between predicate evaluations.
    pub fn connect_with_delay(
        &self,
        from: impl Into<ActionId>,
        to: impl Into<ActionId>,
        predicate: impl TransitionPredicate + 'static,
        delay: Duration,
    ) -> Result<TransitionId> {
        self.insert_transition(from.into(), to.into(), Box::new(predicate), delay)
    }

    /// Returns the action registered under the given id.
    pub fn action(&self, id: impl Into<ActionId>) -> Option<Arc<Action>> {
        self.inner.action(id.into())
    }

    /// Installs an observer notified of state changes. Only legal while the
    /// net is not running.
    ///
    /// # Errors
    /// Returns an error if the net is running.
    pub fn set_observer(&self, observer: Arc<dyn NetObserver>) -> Result<()> {
        if self.running() {
            bail!("Cannot install an observer on a running net");
        }
        *self.inner.observer.write() = Some(observer);
        Ok(())
    }

    /// Starts executing the net on a manager thread and a worker pool.
    ///
    /// # Errors
    /// Returns an error if the net is already running, if the initial
    /// marking is empty, or if the threads could not be spawned.
    pub fn run(&self) -> Result<()> {
        if self.running() {
            bail!("Net {} is already running", self.inner.name);
        }

        if self.inner.state.lock().to_be_activated.is_empty() {
            cascade_log::error!("Net {} has no active state; refusing to run", self.inner.name);
            bail!("Net {} has no active state", self.inner.name);
        }

        let pool = Arc::new(WorkerPool::new(self.inner.name.clone(), INITIAL_WORKERS)?);
        *self.inner.pool.lock() = Some(Arc::clone(&pool));

        self.inner.running.store(true, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("{} states manager", self.inner.name))
            .spawn(move || manage_states(&inner, &pool));

        match spawned {
            Ok(handle) => {
                *self.inner.manager.lock() = Some(ManagerHandle {
                    thread_id: handle.thread().id(),
                    handle,
                });
                Ok(())
            }
            Err(err) => {
                self.inner.running.store(false, Ordering::Release);
                if let Some(pool) = self.inner.pool.lock().take() {
                    pool.join();
                }
                Err(err.into())
            }
        }
    }

    /// Stops the net: running action handlers complete, runners exit their
    /// poll loop at the next sleep boundary, and the manager and pool are
    /// joined. Stopping a net that is not running has no effect.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub(crate) fn inner(&self) -> &Arc<NetInner> {
        &self.inner
    }

    fn insert_action(
        &self,
        id: ActionId,
        name: String,
        handler: Option<Box<dyn ActionHandler>>,
        required_tokens: usize,
        active: bool,
    ) -> Result<ActionId> {
        if self.running() {
            bail!("Cannot modify the running net {}", self.inner.name);
        }
        let Some(required_tokens) = NonZeroUsize::new(required_tokens) else {
            bail!("Action {id} must require at least one token");
        };

        let mut state = self.inner.state.lock();
        let mut graph = self.inner.graph.write();

        if graph.actions.contains_key(&id) {
            bail!("Action id {id} is already registered in net {}", self.inner.name);
        }

        let action = Arc::new(Action::new(id, name, handler, required_tokens));
        if active {
            // Initially active states are preloaded so the manager can
            // promote them on the first cycle
            action.fill_tokens();
            state.to_be_activated.insert(id);
            state.active_states += 1;
        }
        graph.actions.insert(
            id,
            ActionNode {
                action,
                transitions: Vec::new(),
            },
        );
        Ok(id)
    }

    fn insert_transition(
        &self,
        from: ActionId,
        to: ActionId,
        predicate: Box<dyn TransitionPredicate>,
        delay: Duration,
    ) -> Result<TransitionId> {
        if self.running() {
            bail!("Cannot modify the running net {}", self.inner.name);
        }

        let mut graph = self.inner.graph.write();
        if !graph.actions.contains_key(&to) {
            bail!("Cannot connect to unknown action {to}");
        }
        let id = TransitionId::from_u64(graph.next_transition_id);
        let Some(node) = graph.actions.get_mut(&from) else {
            bail!("Cannot connect from unknown action {from}");
        };

        node.transitions.push(Arc::new(Transition::new(
            id,
            format!("{from}->{to}"),
            from,
            to,
            predicate,
            delay,
        )));
        graph.next_transition_id += 1;
        Ok(id)
    }
}

impl NetInner {
    pub(crate) fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn action(&self, id: ActionId) -> Option<Arc<Action>> {
        self.graph
            .read()
            .actions
            .get(&id)
            .map(|node| Arc::clone(&node.action))
    }

    /// Snapshots the outgoing transitions of the given action.
    pub(crate) fn outgoing_transitions(&self, id: ActionId) -> Vec<Arc<Transition>> {
        self.graph
            .read()
            .actions
            .get(&id)
            .map(|node| node.transitions.iter().map(Arc::clone).collect())
            .unwrap_or_default()
    }

    pub(crate) fn observer(&self) -> Option<Arc<dyn NetObserver>> {
        self.observer.read().clone()
    }

    /// Visits every action node in insertion order. Used for structural
    /// digests.
    pub(crate) fn visit_structure(
        &self,
        mut visit: impl FnMut(&Arc<Action>, &[Arc<Transition>]),
    ) {
        for node in self.graph.read().actions.values() {
            visit(&node.action, &node.transitions);
        }
    }

    /// Delivers the result of a finished activation: tokens for every
    /// fulfilled transition's successor, then marks the action for
    /// deactivation and wakes the manager.
    ///
    /// Returns `true` if at least one successor was newly scheduled.
    pub(crate) fn deliver_tokens(&self, fulfilled: &[Arc<Transition>]) -> bool {
        let mut delivered = false;
        let mut state = self.state.lock();
        for transition in fulfilled {
            let id = transition.next();
            let Some(next) = self.action(id) else {
                continue;
            };

            // `active_states` counts runners plus queued entries at or above
            // their threshold, so a queued entry contributes exactly once:
            // when a token delivery first takes it over the line
            let required = next.required_tokens().get();
            let was_counted =
                state.to_be_activated.contains(&id) && next.current_tokens() >= required;

            next.deposit_token();
            state.to_be_activated.insert(id);

            if !was_counted && next.current_tokens() >= required {
                state.active_states += 1;
            }
            delivered = true;
        }
        delivered
    }

    /// Marks the given action's activation as finished and signals the
    /// manager. Called exactly once per activation, from the runner.
    pub(crate) fn deactivate(&self, id: ActionId) {
        let mut state = self.state.lock();
        state.to_be_disabled.push_back(id);
        // Notifying under the lock ensures the manager cannot miss the
        // wakeup between re-checking its predicate and blocking
        self.activation_condition.notify_all();
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        {
            let _state = self.state.lock();
            self.activation_condition.notify_all();
        }

        // stop() may be called by the manager itself, which cannot join its
        // own thread; the handle is dropped and the thread exits on its own
        if let Some(manager) = self.manager.lock().take()
            && thread::current().id() != manager.thread_id
        {
            let _ = manager.handle.join();
        }

        if let Some(pool) = self.pool.lock().take() {
            pool.join();
        }

        if let Some(observer) = self.observer() {
            observer.net_stopped();
        }
    }

    /// Removes the next entry from the deactivation queue, updates the
    /// active-state count, and notifies the observer. The pop happens here
    /// rather than in the manager loop so an override point sees the popped
    /// entry.
    fn disable_state(&self, state: &mut SchedulerState) {
        let Some(id) = state.to_be_disabled.pop_front() else {
            return;
        };
        state.active_states -= 1;

        if let Some(observer) = self.observer()
            && let Some(action) = self.action(id)
        {
            observer.state_disabled(&action);
        }
    }

    /// Notifies the observer and submits a runner for the given action.
    fn enable_state(self: &Arc<Self>, action: &Arc<Action>, pool: &Arc<WorkerPool>) {
        if let Some(observer) = self.observer() {
            observer.state_enabled(action);
        }

        let inner = Arc::clone(self);
        let runner_action = Arc::clone(action);
        if let Err(err) = pool.submit(move || runner::execute_state(&inner, &runner_action)) {
            cascade_log::error!("Failed to submit runner for action {}: {err}", action.id());
        }
    }
}

/// The manager loop: drains finished activations, promotes actions whose
/// token threshold is met, and terminates the net when nothing is active
/// anymore.
fn manage_states(inner: &Arc<NetInner>, pool: &Arc<WorkerPool>) {
    while inner.running() {
        let mut state = inner.state.lock();
        inner.activation_condition.wait_while(&mut state, |state| {
            inner.running()
                && state.to_be_activated.is_empty()
                && state.to_be_disabled.is_empty()
        });

        if !inner.running() {
            return;
        }

        while !state.to_be_disabled.is_empty() {
            inner.disable_state(&mut state);
        }

        let candidates: Vec<ActionId> = state.to_be_activated.iter().copied().collect();
        for id in candidates {
            let Some(action) = inner.action(id) else {
                state.to_be_activated.swap_remove(&id);
                continue;
            };

            if action.current_tokens() >= action.required_tokens().get() {
                if state.active_states >= pool.worker_count() {
                    cascade_log::info!(
                        "Pool of net {} too small; growing to {} workers",
                        inner.name,
                        pool.worker_count() + 1
                    );
                    if let Err(err) = pool.add_worker() {
                        cascade_log::error!("Failed to grow worker pool: {err:#}");
                    }
                }

                action.consume_required_tokens();
                inner.enable_state(&action, pool);
                state.to_be_activated.swap_remove(&id);
            }
        }

        let active_states = state.active_states;
        let starved = !state.to_be_activated.is_empty();
        drop(state);

        if active_states == 0 {
            if starved {
                cascade_log::warn!(
                    "Net {} has states waiting for tokens that can never arrive; \
                     the pending states are discarded",
                    inner.name
                );
            }
            inner.stop();
            return;
        }

        if starved {
            // Entries below threshold stay queued; back off briefly instead
            // of spinning through the non-empty queue
            thread::sleep(MANAGER_IDLE_BACKOFF);
        }
    }
}

impl Drop for Net {
    fn drop(&mut self) {
        self.stop();
        if let Some(manager) = self.inner.manager.lock().take() {
            let _ = manager.handle.join();
        }
    }
}

impl fmt::Debug for Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Net")
            .field("name", &self.inner.name)
            .field("running", &self.running())
            .finish()
    }
}
