//! The debug session endpoint.

use crate::{
    HashMap, HashSet,
    action::{Action, ActionId},
    debug::protocol::{self, ActiveState, Command, Event, PROTOCOL_VERSION},
    net::Net,
    observer::NetObserver,
};
use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use serde_json::json;
use std::{
    fmt,
    io::{self, BufReader},
    net::{Shutdown, TcpListener, TcpStream},
    ops::ControlFlow,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Cadence of the heartbeat `ack` events.
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

/// How long the client may stay silent before the session drops it.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(3);

/// Poll interval of the non-blocking accept loop.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Instantiates the net a [`DebugSession`] controls.
///
/// This is the session's interface to however nets come into existence
/// (typically a compiled net description); the session itself neither knows
/// nor cares.
pub trait NetFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Hex identity of the net this factory builds, compared against the
    /// hash the client presents in the `hello` handshake.
    fn hash(&self) -> String;

    /// Builds a fresh, not-yet-running net.
    fn build(&self) -> Result<Net>;
}

/// A protocol endpoint coupling a net to an external debugger UI.
///
/// The session listens on a TCP port for exactly one client at a time. A
/// reception thread reads and dispatches commands; a heartbeat thread emits
/// periodic liveness `ack`s and flushes `states` events whenever the active
/// set changes. Socket failures terminate the session without affecting the
/// engine.
pub struct DebugSession {
    inner: Arc<SessionInner>,
    reception: Mutex<Option<JoinHandle<()>>>,
}

struct SessionInner {
    factory: Box<dyn NetFactory>,
    port: u16,
    running: AtomicBool,
    state: Mutex<SessionState>,
    net: Mutex<Option<Net>>,
    paused: Mutex<bool>,
    pause_condition: Condvar,
    active: Mutex<ActiveStates>,
    state_change_condition: Condvar,
    breakpoints: Mutex<HashSet<ActionId>>,
    /// The write half of the client connection; doubles as the send mutex
    /// serializing all outgoing frames.
    client: Mutex<Option<TcpStream>>,
    last_heard: Mutex<Instant>,
    net_stopped_notice: AtomicBool,
    bound_port: Mutex<Option<u16>>,
}

/// The active-state multiset and its change flag, guarded by one mutex (the
/// state-change mutex).
struct ActiveStates {
    depths: HashMap<ActionId, usize>,
    changed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Idle,
    Connected,
    Running,
    Stopped,
}

/// Observer adapter installed on the session's net. Holds the session
/// weakly so a discarded session cannot be kept alive by its net.
struct SessionObserver {
    session: Weak<SessionInner>,
}

impl DebugSession {
    /// Creates a session for nets built by the given factory, listening on
    /// the given port once started.
    pub fn new(factory: impl NetFactory + 'static, port: u16) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                factory: Box::new(factory),
                port,
                running: AtomicBool::new(false),
                state: Mutex::new(SessionState::Idle),
                net: Mutex::new(None),
                paused: Mutex::new(false),
                pause_condition: Condvar::new(),
                active: Mutex::new(ActiveStates {
                    depths: HashMap::default(),
                    changed: false,
                }),
                state_change_condition: Condvar::new(),
                breakpoints: Mutex::new(HashSet::default()),
                client: Mutex::new(None),
                last_heard: Mutex::new(Instant::now()),
                net_stopped_notice: AtomicBool::new(false),
                bound_port: Mutex::new(None),
            }),
            reception: Mutex::new(None),
        }
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// The port the listener is actually bound to. Differs from
    /// [`port`](Self::port) when the session was configured with port 0.
    pub fn local_port(&self) -> Option<u16> {
        *self.inner.bound_port.lock()
    }

    pub fn running(&self) -> bool {
        self.inner.running()
    }

    /// Binds the listener and spawns the reception thread.
    ///
    /// # Errors
    /// Returns an error if the session is already running, the port cannot
    /// be bound, or the thread cannot be spawned.
    pub fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            anyhow::bail!("Debug session is already running");
        }

        let listener = TcpListener::bind(("127.0.0.1", self.inner.port)).inspect_err(|_| {
            self.inner.running.store(false, Ordering::Release);
        })?;
        listener.set_nonblocking(true).inspect_err(|_| {
            self.inner.running.store(false, Ordering::Release);
        })?;
        *self.inner.bound_port.lock() = listener.local_addr().ok().map(|addr| addr.port());

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(format!("{} debug reception", self.inner.factory.name()))
            .spawn(move || serve(&inner, &listener))
            .inspect_err(|_| {
                self.inner.running.store(false, Ordering::Release);
            })?;
        *self.reception.lock() = Some(handle);
        Ok(())
    }

    /// Tears the session down: disconnects the client, stops and discards
    /// the net, and joins the session threads. Idempotent.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.release_pause();
        self.inner.drop_client(Some("session stopped"));

        if let Some(net) = self.inner.net.lock().take() {
            net.stop();
        }

        if let Some(handle) = self.reception.lock().take() {
            let _ = handle.join();
        }
        *self.inner.state.lock() = SessionState::Idle;
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugSession")
            .field("port", &self.inner.port)
            .field("running", &self.running())
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

/// Accept loop of the reception thread. Serves one client at a time; a
/// further connection attempt is not accepted until the current client
/// terminates.
fn serve(inner: &Arc<SessionInner>, listener: &TcpListener) {
    while inner.running() {
        match listener.accept() {
            Ok((stream, peer)) => {
                cascade_log::info!("Debugger client connected from {peer}");
                handle_client(inner, stream);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => {
                cascade_log::error!("Failed to accept debugger client: {err}");
                break;
            }
        }
    }
}

/// Read-dispatch loop for one client connection.
fn handle_client(inner: &Arc<SessionInner>, stream: TcpStream) {
    // The listener is non-blocking; the per-client stream must not be
    if let Err(err) = stream.set_nonblocking(false) {
        cascade_log::error!("Failed to configure the client stream: {err}");
        return;
    }
    let _ = stream.set_nodelay(true);
    let write_half = match stream.try_clone() {
        Ok(write_half) => write_half,
        Err(err) => {
            cascade_log::error!("Failed to clone the client stream: {err}");
            return;
        }
    };

    *inner.client.lock() = Some(write_half);
    *inner.last_heard.lock() = Instant::now();
    *inner.state.lock() = SessionState::Connected;

    let heartbeat = {
        let inner = Arc::clone(inner);
        thread::Builder::new()
            .name(format!("{} debug heartbeat", inner.factory.name()))
            .spawn(move || run_heartbeat(&inner))
    };
    let heartbeat = match heartbeat {
        Ok(handle) => Some(handle),
        Err(err) => {
            cascade_log::error!("Failed to spawn the heartbeat thread: {err}");
            None
        }
    };

    // The accepted stream is blocking; teardown paths unblock this loop by
    // shutting the socket down
    let mut reader = BufReader::new(stream);
    while inner.running() && inner.has_client() {
        match protocol::read_frame::<Command>(&mut reader) {
            Ok(command) => {
                *inner.last_heard.lock() = Instant::now();
                if dispatch(inner, command).is_break() {
                    break;
                }
            }
            Err(err) => {
                if inner.running() && inner.has_client() {
                    cascade_log::debug!("Debugger connection closed: {err:#}");
                }
                break;
            }
        }
    }

    inner.drop_client(None);
    if let Some(handle) = heartbeat {
        let _ = handle.join();
    }
    if inner.running() {
        *inner.state.lock() = SessionState::Idle;
    }
    cascade_log::info!("Debugger client disconnected");
}

fn dispatch(inner: &Arc<SessionInner>, command: Command) -> ControlFlow<()> {
    match command {
        Command::Hello { version, hash } => {
            if version != PROTOCOL_VERSION {
                inner.send_event(&Event::Error {
                    message: format!(
                        "Version mismatch: client {version}, session {PROTOCOL_VERSION}"
                    ),
                });
                return ControlFlow::Break(());
            }
            let expected = inner.factory.hash();
            if hash != expected {
                inner.send_event(&Event::Error {
                    message: format!("Net hash mismatch: client {hash}, session {expected}"),
                });
                return ControlFlow::Break(());
            }
            inner.send_event(&Event::Ack(
                json!({"version": PROTOCOL_VERSION, "hash": expected}),
            ));
        }
        Command::Start {} => match inner.start_net() {
            Ok(()) => inner.send_event(&Event::Ack(json!({"what": "start"}))),
            Err(err) => {
                cascade_log::error!("Failed to start the net: {err:#}");
                inner.send_event(&Event::Error {
                    message: format!("{err:#}"),
                });
            }
        },
        Command::Stop {} => {
            inner.stop_net();
            inner.send_event(&Event::Ack(json!({"what": "stop"})));
        }
        Command::Pause { pause } => {
            inner.set_pause(pause);
            inner.send_event(&Event::Ack(json!({"what": "pause", "pause": pause})));
        }
        Command::Reload {} => match inner.reload_net() {
            Ok(()) => inner.send_event(&Event::Ack(json!({"what": "reload"}))),
            Err(err) => {
                cascade_log::error!("Failed to reload the net: {err:#}");
                inner.send_event(&Event::Error {
                    message: format!("{err:#}"),
                });
            }
        },
        Command::Breakpoints { ids } => {
            let count = inner.update_breakpoints(&ids);
            inner.send_event(&Event::Ack(json!({"what": "breakpoints", "count": count})));
        }
        Command::Exit {} => {
            inner.send_event(&Event::Exit {
                reason: "client request".to_string(),
            });
            // The net, if running, keeps running; only the session ends
            inner.running.store(false, Ordering::Release);
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

/// Heartbeat loop: flushes `states` on change, emits a liveness `ack` once
/// per period, and drops a client that has gone silent.
fn run_heartbeat(inner: &Arc<SessionInner>) {
    let mut last_beat = Instant::now();

    while inner.running() && inner.has_client() {
        let states = {
            let mut active = inner.active.lock();
            let _ = inner
                .state_change_condition
                .wait_for(&mut active, HEARTBEAT_PERIOD);
            if active.changed {
                active.changed = false;
                let mut states: Vec<ActiveState> = active
                    .depths
                    .iter()
                    .map(|(id, &count)| ActiveState {
                        id: id.as_u64(),
                        count,
                    })
                    .collect();
                states.sort_unstable_by_key(|state| state.id);
                Some(states)
            } else {
                None
            }
        };

        if !inner.running() || !inner.has_client() {
            break;
        }

        if let Some(states) = states {
            inner.send_event(&Event::States { states });
        }

        if inner.net_stopped_notice.swap(false, Ordering::AcqRel) {
            inner.send_event(&Event::Ack(json!({"what": "stopped"})));
        }

        if last_beat.elapsed() >= HEARTBEAT_PERIOD {
            inner.send_event(&Event::Ack(json!({"what": "heartbeat"})));
            last_beat = Instant::now();
        }

        if inner.last_heard.lock().elapsed() > CLIENT_TIMEOUT {
            cascade_log::warn!(
                "Debugger client silent for more than {CLIENT_TIMEOUT:?}; dropping the connection"
            );
            inner.drop_client(Some("client timeout"));
            break;
        }
    }
}

impl SessionInner {
    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn has_client(&self) -> bool {
        self.client.lock().is_some()
    }

    /// Writes one event frame to the client, if any. A failed write drops
    /// the client; the engine is unaffected.
    fn send_event(&self, event: &Event) {
        let mut client = self.client.lock();
        let Some(stream) = client.as_mut() else {
            return;
        };
        if let Err(err) = protocol::write_frame(stream, event) {
            cascade_log::error!("Failed to write to the debugger client: {err:#}");
            let _ = stream.shutdown(Shutdown::Both);
            *client = None;
            drop(client);
            self.notify_state_change();
        }
    }

    fn start_net(self: &Arc<Self>) -> Result<()> {
        let mut net = self.net.lock();
        if net.is_none() {
            *net = Some(self.build_net()?);
        }
        let Some(net) = net.as_ref() else {
            return Ok(());
        };
        net.run()?;
        self.net_stopped_notice.store(false, Ordering::Release);
        *self.state.lock() = SessionState::Running;
        Ok(())
    }

    fn stop_net(&self) {
        // Release any runner blocked at the enable checkpoint first, or the
        // pool join would wait on it forever
        self.release_pause();
        if let Some(net) = &*self.net.lock() {
            net.stop();
        }
        *self.state.lock() = SessionState::Stopped;
    }

    fn reload_net(self: &Arc<Self>) -> Result<()> {
        self.release_pause();
        if let Some(net) = self.net.lock().take() {
            net.stop();
        }

        {
            let mut active = self.active.lock();
            active.depths.clear();
            active.changed = true;
            self.state_change_condition.notify_all();
        }

        *self.net.lock() = Some(self.build_net()?);
        *self.state.lock() = SessionState::Connected;
        Ok(())
    }

    fn build_net(self: &Arc<Self>) -> Result<Net> {
        let net = self.factory.build()?;
        net.set_observer(Arc::new(SessionObserver {
            session: Arc::downgrade(self),
        }))?;
        Ok(net)
    }

    fn set_pause(&self, pause: bool) {
        let mut paused = self.paused.lock();
        *paused = pause;
        if !pause {
            self.pause_condition.notify_all();
        }
        cascade_log::info!("Net execution {}", if pause { "paused" } else { "resumed" });
    }

    fn release_pause(&self) {
        let mut paused = self.paused.lock();
        *paused = false;
        self.pause_condition.notify_all();
    }

    /// Replaces the breakpoint set, skipping ids the current net does not
    /// know. Returns the size of the new set.
    fn update_breakpoints(&self, ids: &[u64]) -> usize {
        let net = self.net.lock();
        let mut breakpoints = self.breakpoints.lock();
        breakpoints.clear();
        for &id in ids {
            let id = ActionId::from_u64(id);
            if let Some(net) = net.as_ref()
                && net.action(id).is_none()
            {
                cascade_log::warn!("Ignoring breakpoint on unknown action {id}");
                continue;
            }
            breakpoints.insert(id);
        }
        breakpoints.len()
    }

    /// Sends the client away and wakes the heartbeat so it can exit.
    fn drop_client(&self, reason: Option<&str>) {
        {
            let mut client = self.client.lock();
            if let Some(stream) = client.as_mut() {
                if let Some(reason) = reason {
                    let _ = protocol::write_frame(
                        stream,
                        &Event::Exit {
                            reason: reason.to_string(),
                        },
                    );
                }
                let _ = stream.shutdown(Shutdown::Both);
            }
            *client = None;
        }
        // A headless net must not stay paused with nobody left to resume it
        self.release_pause();
        self.notify_state_change();
    }

    fn notify_state_change(&self) {
        let _active = self.active.lock();
        self.state_change_condition.notify_all();
    }
}

impl NetObserver for SessionObserver {
    fn state_enabled(&self, action: &Action) {
        let Some(session) = self.session.upgrade() else {
            return;
        };

        if session.breakpoints.lock().contains(&action.id()) {
            cascade_log::info!("Hit breakpoint on action {} ({})", action.name(), action.id());
            *session.paused.lock() = true;
        }

        let mut active = session.active.lock();
        *active.depths.entry(action.id()).or_insert(0) += 1;
        active.changed = true;
        session.state_change_condition.notify_all();
    }

    fn state_disabled(&self, action: &Action) {
        let Some(session) = self.session.upgrade() else {
            return;
        };

        let mut active = session.active.lock();
        if let Some(depth) = active.depths.get_mut(&action.id()) {
            *depth -= 1;
            if *depth == 0 {
                active.depths.remove(&action.id());
            }
        }
        active.changed = true;
        session.state_change_condition.notify_all();
    }

    fn enable_checkpoint(&self, _action: &Action) {
        let Some(session) = self.session.upgrade() else {
            return;
        };

        let mut paused = session.paused.lock();
        while *paused {
            session.pause_condition.wait(&mut paused);
        }
    }

    fn net_stopped(&self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };

        *session.state.lock() = SessionState::Stopped;
        session.net_stopped_notice.store(true, Ordering::Release);

        let mut active = session.active.lock();
        active.changed = true;
        session.state_change_condition.notify_all();
    }
}
