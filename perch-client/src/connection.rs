//! One live connection: shared state, the loop-side connection task, and the
//! blocking application-facing surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use perch_core::protocol::Phase;
use perch_core::{ProtocolState, WireAction, MAX_UNACKED};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, warn};

use crate::arbitrator::Arbitrator;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::handler;
use crate::listeners::Listeners;
use crate::room::RoomState;
use crate::transport::Transport;

/// Messages from caller threads to the connection task.
pub(crate) enum OutMsg {
    /// A complete wire frame, already encoded under the state lock.
    Text(String),
    /// Send the close call and shut the transport down.
    Close,
}

/// Knobs for a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Forced-ack window: an ack frame is sent once this many messages are
    /// unacknowledged.
    pub unacked_window: u64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            unacked_window: MAX_UNACKED,
        }
    }
}

/// State shared between the connection task, caller threads, and handlers.
pub(crate) struct Shared {
    arbitrator: Arc<Arbitrator>,
    state: Mutex<ProtocolState>,
    exception: Mutex<Option<Error>>,
    registries: Mutex<HashMap<ThreadId, Arc<Mutex<Listeners>>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<OutMsg>>>,
    room: Mutex<RoomState>,
    callbacks: Mutex<HashMap<String, std_mpsc::SyncSender<Value>>>,
    next_callback: AtomicU64,
}

impl Shared {
    pub(crate) fn new(arbitrator: Arc<Arbitrator>, options: ConnectionOptions) -> Shared {
        Shared {
            arbitrator,
            state: Mutex::new(ProtocolState::with_window(options.unacked_window)),
            exception: Mutex::new(None),
            registries: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
            room: Mutex::new(RoomState::default()),
            callbacks: Mutex::new(HashMap::new()),
            next_callback: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> &Mutex<ProtocolState> {
        &self.state
    }

    pub(crate) fn room(&self) -> &Mutex<RoomState> {
        &self.room
    }

    pub(crate) fn arbitrator(&self) -> &Arc<Arbitrator> {
        &self.arbitrator
    }

    /// Create the outbound channel; called once when the transport opens.
    pub(crate) fn attach_outbound(&self) -> mpsc::UnboundedReceiver<OutMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock().unwrap() = Some(tx);
        rx
    }

    pub(crate) fn send_out(&self, msg: OutMsg) -> Result<()> {
        match &*self.outbound.lock().unwrap() {
            Some(tx) => tx.send(msg).map_err(|_| Error::NotConnected),
            None => Err(Error::NotConnected),
        }
    }

    /// Re-raise the stored fatal error, if any.
    pub(crate) fn check(&self) -> Result<()> {
        match &*self.exception.lock().unwrap() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Store a fatal error (first one wins) and wake every blocked thread.
    pub(crate) fn fail(&self, err: Error) {
        {
            let mut slot = self.exception.lock().unwrap();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.arbitrator.awaken();
    }

    /// Tear the connection down, with or without a fatal error.
    pub(crate) fn finish(&self, err: Option<Error>) {
        self.state.lock().unwrap().mark_closed();
        *self.outbound.lock().unwrap() = None;
        match err {
            Some(e) => self.fail(e),
            None => self.arbitrator.awaken(),
        }
    }

    /// Fan one event out to every thread's registry. Registries without an
    /// interested callback drop it.
    pub(crate) fn enqueue_event(&self, event: Event) {
        let registries = self.registries.lock().unwrap();
        for registry in registries.values() {
            registry.lock().unwrap().enqueue(&event);
        }
    }

    fn registry_for(&self, thread: ThreadId) -> Arc<Mutex<Listeners>> {
        self.registries
            .lock()
            .unwrap()
            .entry(thread)
            .or_default()
            .clone()
    }

    fn existing_registry(&self, thread: ThreadId) -> Option<Arc<Mutex<Listeners>>> {
        self.registries.lock().unwrap().get(&thread).cloned()
    }

    /// Allocate a server-callback id and the channel its result arrives on.
    pub(crate) fn register_callback(&self) -> (String, std_mpsc::Receiver<Value>) {
        let id = self.next_callback.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = std_mpsc::sync_channel(1);
        self.callbacks.lock().unwrap().insert(id.clone(), tx);
        (id, rx)
    }

    pub(crate) fn resolve_callback(&self, id: &str, value: Value) {
        if let Some(tx) = self.callbacks.lock().unwrap().remove(id) {
            let _ = tx.send(value);
        }
    }

    pub(crate) fn forget_callback(&self, id: &str) {
        self.callbacks.lock().unwrap().remove(id);
    }
}

/// Handle to a live connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub(crate) fn new(shared: Arc<Shared>) -> Connection {
        Connection { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn connected(&self) -> bool {
        self.shared.state.lock().unwrap().connected()
    }

    /// Issue an application call. The envelope is encoded on the loop thread
    /// under the state lock, so sequence ids match wire order.
    pub fn make_call(&self, method: &str, args: Vec<Value>) -> Result<()> {
        self.shared.check()?;
        let shared = self.shared.clone();
        let method = method.to_owned();
        self.shared.arbitrator.run_sync(move || {
            let frame = {
                let mut state = shared.state.lock().unwrap();
                if !state.connected() {
                    return Err(Error::NotConnected);
                }
                state.encode_call(&method, &args)
            };
            shared.send_out(OutMsg::Text(frame))
        })?
    }

    /// Register a callback for `kind` events on the calling thread's registry.
    /// Fails immediately when the connection already died.
    pub fn add_listener(
        &self,
        kind: &str,
        callback: impl FnMut(&Event) -> bool + Send + 'static,
    ) -> Result<()> {
        self.shared.check()?;
        if !self.shared.state.lock().unwrap().connected() {
            return Err(Error::NotConnected);
        }
        let registry = self.shared.registry_for(thread::current().id());
        registry.lock().unwrap().add(kind, Box::new(callback));
        Ok(())
    }

    /// Block the calling thread, delivering its events as they arrive, until
    /// its last callback detaches or the connection ends.
    pub fn listen(&self) -> Result<()> {
        listen_shared(&[&self.shared])
    }

    /// Ask the connection task to send the close call and stop. Does not wait
    /// for the transport teardown.
    pub fn close(&self) -> Result<()> {
        let shared = self.shared.clone();
        self.shared.arbitrator.run_sync(move || {
            shared.state.lock().unwrap().begin_close();
            // Already gone is fine.
            let _ = shared.send_out(OutMsg::Close);
        })
    }
}

/// Drain loop shared by [`Connection::listen`] and `Room::listen_many`: wait
/// on the arbitrator condition, deliver this thread's queued events, repeat.
/// Exits when no attached callback remains or every connection is closed; a
/// stored fatal error is re-raised instead.
pub(crate) fn listen_shared(shareds: &[&Arc<Shared>]) -> Result<()> {
    let thread = thread::current().id();
    let registries: Vec<_> = shareds
        .iter()
        .filter_map(|s| s.existing_registry(thread))
        .collect();
    if !registries.iter().any(|r| r.lock().unwrap().active()) {
        return Err(Error::NoListeners);
    }

    let condition = shareds[0].arbitrator.condition().clone();
    let (lock, cvar) = &*condition;
    let mut generation = lock.lock().unwrap();
    loop {
        for shared in shareds {
            shared.check()?;
        }

        let mut delivered = 0;
        let mut active = false;
        for registry in &registries {
            let mut work = registry.lock().unwrap().take_work();
            if !work.is_empty() {
                // Callbacks run without the registry lock so they can add
                // listeners; the condition mutex stays held, which only the
                // Awakener competes for.
                delivered += work.run();
            }
            let mut reg = registry.lock().unwrap();
            reg.merge_back(work);
            if reg.active() {
                active = true;
            }
        }
        if !active {
            return Ok(());
        }
        if delivered > 0 {
            continue;
        }
        for shared in shareds {
            shared.check()?;
        }
        if !shareds.iter().any(|s| s.state.lock().unwrap().connected()) {
            return Ok(());
        }
        generation = cvar.wait(generation).unwrap();
    }
}

enum Step {
    Out(Option<OutMsg>),
    In(Result<Option<String>>),
    Tick,
}

/// The per-connection loop task: multiplexes outbound frames, inbound frames,
/// and the keep-alive ticker. Runs until close or a fatal error, then records
/// the outcome in the shared state and wakes all blocked threads.
pub(crate) async fn run_connection<T: Transport>(
    shared: Arc<Shared>,
    mut transport: T,
    mut out_rx: mpsc::UnboundedReceiver<OutMsg>,
) {
    let mut period = shared.state.lock().unwrap().ping_interval();
    let mut ticker = interval_at(Instant::now() + period, period);

    let outcome = loop {
        let step = tokio::select! {
            msg = out_rx.recv() => Step::Out(msg),
            frame = transport.recv() => Step::In(frame),
            _ = ticker.tick() => Step::Tick,
        };
        match step {
            Step::Out(Some(OutMsg::Text(frame))) => {
                debug!(frame = %frame, "send");
                if let Err(e) = transport.send(frame).await {
                    break Some(e);
                }
            }
            Step::Out(Some(OutMsg::Close)) | Step::Out(None) => {
                let frame = shared.state.lock().unwrap().encode_close_call();
                let _ = transport.send(frame).await;
                break None;
            }
            Step::In(Ok(Some(text))) => {
                debug!(frame = %text, "recv");
                let actions = match shared.state.lock().unwrap().on_frame(&text) {
                    Ok(actions) => actions,
                    Err(e) => {
                        warn!(frame = %text, error = %e, "dropping malformed frame");
                        continue;
                    }
                };
                match apply_actions(&shared, &mut transport, actions).await {
                    Some(outcome) => break outcome,
                    None => {}
                }
                // The open frame can rewrite the ping interval.
                let now = shared.state.lock().unwrap().ping_interval();
                if now != period {
                    period = now;
                    ticker = interval_at(Instant::now() + period, period);
                }
            }
            Step::In(Ok(None)) => {
                let phase = shared.state.lock().unwrap().phase();
                break match phase {
                    Phase::Closing | Phase::Closed => None,
                    _ => Some(Error::Transport("connection closed unexpectedly".into())),
                };
            }
            Step::In(Err(e)) => break Some(e),
            Step::Tick => {
                let keepalive = shared.state.lock().unwrap().on_keepalive();
                match keepalive {
                    Ok(actions) => match apply_actions(&shared, &mut transport, actions).await {
                        Some(outcome) => break outcome,
                        None => {}
                    },
                    Err(e) => break Some(e.into()),
                }
            }
        }
    };

    let _ = transport.close().await;
    shared.finish(outcome);
}

/// Perform the actions the protocol state asked for. `Some(outcome)` ends the
/// connection task, cleanly for `None` and fatally for `Some(error)`.
async fn apply_actions<T: Transport>(
    shared: &Arc<Shared>,
    transport: &mut T,
    actions: Vec<WireAction>,
) -> Option<Option<Error>> {
    for action in actions {
        match action {
            WireAction::Send(frame) => {
                debug!(frame = %frame, "send");
                if let Err(e) = transport.send(frame).await {
                    return Some(Some(e));
                }
            }
            WireAction::Dispatch(messages) => handler::dispatch(shared, messages),
            WireAction::Close => return Some(None),
            WireAction::Fatal(e) => return Some(Some(e.into())),
        }
    }
    None
}
