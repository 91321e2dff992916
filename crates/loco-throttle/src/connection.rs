//! Per-connection task
//!
//! Every command-station link is driven by one spawned task that owns the
//! stream, the [`TrafficController`] and the [`AddressTable`]. Throttles,
//! managers and traffic handles talk to it through an mpsc channel and wait
//! on oneshot replies, so all state transitions for a connection happen in
//! one place and in arrival order.
//!
//! The loop writes whatever the traffic controller releases, then waits for
//! the first of: a caller command, bytes from the stream, or the earliest
//! reply/grace deadline.

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use loco_protocol::{
    Address, Binding, Decoded, FrameBuffer, LocoRef, LocoState, Protocol, ResponseMatcher,
    StateUpdate, ThrottleCommand, VendorAdapter, VendorEvent,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::allocation::{
    Action, AddressStatus, AddressTable, Grant, NotHeld, ShareMode, ThrottleId,
};
use crate::config::ConnectionConfig;
use crate::error::ThrottleError;
use crate::events::{ConnectionEvent, ThrottleEvent};
use crate::listeners::{Listener, ListenerId, ListenerRegistry};
use crate::registry::ConnectionId;
use crate::throttle::Change;
use crate::traffic::{
    Closed, Completion, Failure, Priority, RequestId, TrafficController, TrafficSettings,
};

type Reply<T> = oneshot::Sender<Result<T, ThrottleError>>;

/// Reply channel of a pending throttle request
pub(crate) type GrantReply = Reply<ThrottleGrant>;

/// What the connection task hands a successful requester
#[derive(Debug)]
pub(crate) struct ThrottleGrant {
    pub(crate) id: ThrottleId,
    pub(crate) address: Address,
    pub(crate) mode: ShareMode,
    pub(crate) released: Arc<AtomicBool>,
    pub(crate) state: watch::Receiver<LocoState>,
}

/// Messages accepted by the connection task
pub(crate) enum ConnectionCommand {
    RequestThrottle {
        address: Address,
        mode: ShareMode,
        reply: GrantReply,
    },
    Mutate {
        throttle: ThrottleId,
        change: Change,
        reply: Reply<()>,
    },
    Release {
        throttle: ThrottleId,
        reply: Reply<()>,
    },
    AddThrottleListener {
        throttle: ThrottleId,
        listener: Box<dyn Listener<ThrottleEvent>>,
        reply: Reply<ListenerId>,
    },
    RemoveThrottleListener {
        throttle: ThrottleId,
        id: ListenerId,
        reply: Reply<bool>,
    },
    AddressStatus {
        address: Address,
        reply: oneshot::Sender<AddressStatus>,
    },
    Enqueue {
        frame: Vec<u8>,
        matcher: Option<ResponseMatcher>,
        priority: Priority,
        accepted: Reply<RequestId>,
        done: Reply<()>,
    },
    Cancel {
        id: RequestId,
        reply: oneshot::Sender<bool>,
    },
    AddListener {
        listener: Box<dyn Listener<ConnectionEvent>>,
        reply: oneshot::Sender<ListenerId>,
    },
    RemoveListener {
        id: ListenerId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Send a command and wait for its reply
///
/// A closed channel or a dropped reply both mean the task is gone.
pub(crate) async fn call<R>(
    tx: &mpsc::Sender<ConnectionCommand>,
    make: impl FnOnce(oneshot::Sender<R>) -> ConnectionCommand,
) -> Result<R, ThrottleError> {
    let (reply, rx) = oneshot::channel();
    tx.send(make(reply))
        .await
        .map_err(|_| ThrottleError::ConnectionLost)?;
    rx.await.map_err(|_| ThrottleError::ConnectionLost)
}

/// Who is waiting on a traffic request
enum Origin {
    External(Reply<()>),
    Acquire(Address),
    /// State query for an address granted without a round trip
    Seed(Address),
    Release(Address),
    Mutation {
        throttle: ThrottleId,
        address: Address,
        change: Change,
        reply: Reply<()>,
    },
}

struct ThrottleEntry {
    address: Address,
    released: Arc<AtomicBool>,
    listeners: ListenerRegistry<ThrottleEvent>,
}

/// Mutation held back until the session knows the hardware state
struct Deferred {
    throttle: ThrottleId,
    change: Change,
    reply: Reply<()>,
}

/// Cached state of one controlled locomotive
struct LocoSession {
    /// Last state the command station confirmed
    confirmed: LocoState,
    /// Confirmed state plus every change still in flight
    projected: LocoState,
    /// Mutations queued or on the wire
    pending: usize,
    /// Outstanding state query; mutations wait in `deferred` until it ends
    seed: Option<RequestId>,
    deferred: Vec<Deferred>,
    state_tx: watch::Sender<LocoState>,
}

impl LocoSession {
    fn new(state: LocoState) -> Self {
        let (state_tx, _) = watch::channel(state);
        Self {
            confirmed: state,
            projected: state,
            pending: 0,
            seed: None,
            deferred: Vec::new(),
            state_tx,
        }
    }

    /// Frames are encoded from `projected`, so it only falls back to the
    /// confirmed state once nothing is outstanding
    fn settle(&mut self, change: Change) {
        self.pending = self.pending.saturating_sub(1);
        if self.pending == 0 {
            self.projected = self.confirmed;
        } else {
            change.revert(&mut self.projected, &self.confirmed);
        }
    }
}

/// Fold a broadcast or echo into `state`
fn absorb(update: &StateUpdate, state: &mut LocoState) {
    update.apply_to(state);
    if update.emergency_stop {
        state.speed_step = 0;
    }
}

/// One event per field that differs between `before` and `after`
fn state_events(
    address: Address,
    before: &LocoState,
    after: &LocoState,
    steps: u8,
    max_function: u8,
) -> Vec<ThrottleEvent> {
    let mut events = Vec::new();
    if before.speed_step != after.speed_step {
        events.push(Change::Speed(after.speed_step).event(address, after, steps));
    }
    if before.direction != after.direction {
        events.push(Change::Direction(after.direction).event(address, after, steps));
    }
    for index in 0..=max_function {
        let on = after.functions.get(index);
        if before.functions.get(index) != on {
            events.push(Change::Function { index, on }.event(address, after, steps));
        }
    }
    events
}

enum Wake {
    Command(Option<ConnectionCommand>),
    Read(std::io::Result<usize>),
    Timer,
}

/// State owned by one connection task
pub(crate) struct ConnectionTask<IO> {
    id: ConnectionId,
    name: String,
    protocol: Protocol,
    config: ConnectionConfig,
    adapter: Arc<dyn VendorAdapter>,
    io: IO,
    frames: Box<dyn FrameBuffer>,
    traffic: TrafficController<Origin>,
    table: AddressTable<GrantReply>,
    throttles: HashMap<ThrottleId, ThrottleEntry>,
    locos: HashMap<Address, LocoSession>,
    listeners: ListenerRegistry<ConnectionEvent>,
}

impl<IO> ConnectionTask<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(
        id: ConnectionId,
        config: ConnectionConfig,
        adapter: Arc<dyn VendorAdapter>,
        io: IO,
    ) -> Self {
        Self {
            id,
            name: config.name.clone(),
            protocol: adapter.protocol(),
            traffic: TrafficController::new(TrafficSettings::from(&config)),
            table: AddressTable::new(
                config.contention,
                adapter.requires_acquisition_round_trip(),
                |reply: &GrantReply| !reply.is_closed(),
            ),
            frames: adapter.frame_buffer(),
            config,
            adapter,
            io,
            throttles: HashMap::new(),
            locos: HashMap::new(),
            listeners: ListenerRegistry::new(),
        }
    }

    /// Run until shutdown, stream EOF or an I/O error
    pub(crate) async fn run(mut self, mut cmd_rx: mpsc::Receiver<ConnectionCommand>) {
        info!(
            "Connection {} ({}) started, {}",
            self.id,
            self.name,
            self.protocol.name()
        );
        let mut buf = vec![0u8; 1024];

        loop {
            if let Err(e) = self.pump().await {
                warn!("Write error on connection {}: {}", self.id, e);
                break;
            }

            let deadline = match (self.traffic.next_deadline(), self.table.next_grace_deadline()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            let wake = tokio::select! {
                cmd = cmd_rx.recv() => Wake::Command(cmd),
                result = self.io.read(&mut buf) => Wake::Read(result),
                _ = sleep_until(deadline) => Wake::Timer,
            };

            match wake {
                Wake::Command(Some(ConnectionCommand::Shutdown)) | Wake::Command(None) => {
                    info!("Shutdown requested for connection {}", self.id);
                    self.release_all().await;
                    break;
                }
                Wake::Command(Some(cmd)) => self.handle_command(cmd),
                Wake::Read(Ok(0)) => {
                    info!("Connection {} closed by the command station", self.id);
                    break;
                }
                Wake::Read(Ok(n)) => self.on_bytes(&buf[..n]),
                Wake::Read(Err(e)) if e.kind() == ErrorKind::WouldBlock => {}
                Wake::Read(Err(e)) => {
                    warn!("Read error on connection {}: {}", self.id, e);
                    break;
                }
                Wake::Timer => {
                    if let Err(e) = self.on_timer().await {
                        warn!("Write error on connection {}: {}", self.id, e);
                        break;
                    }
                }
            }
        }

        self.teardown();
        cmd_rx.close();
        let mut refused = 0;
        while cmd_rx.try_recv().is_ok() {
            refused += 1;
        }
        if refused > 0 {
            debug!("Dropped {} command(s) after connection {} closed", refused, self.id);
        }
        info!("Connection {} ended", self.id);
    }

    fn handle_command(&mut self, cmd: ConnectionCommand) {
        match cmd {
            ConnectionCommand::RequestThrottle {
                address,
                mode,
                reply,
            } => self.request_throttle(address, mode, reply),
            ConnectionCommand::Mutate {
                throttle,
                change,
                reply,
            } => self.mutate(throttle, change, reply),
            ConnectionCommand::Release { throttle, reply } => self.release(throttle, reply),
            ConnectionCommand::AddThrottleListener {
                throttle,
                listener,
                reply,
            } => {
                let result = match self.throttles.get_mut(&throttle) {
                    Some(entry) => Ok(entry.listeners.add(listener)),
                    None => Err(ThrottleError::NotHeld),
                };
                let _ = reply.send(result);
            }
            ConnectionCommand::RemoveThrottleListener { throttle, id, reply } => {
                let result = match self.throttles.get_mut(&throttle) {
                    Some(entry) => Ok(entry.listeners.remove(id)),
                    None => Err(ThrottleError::NotHeld),
                };
                let _ = reply.send(result);
            }
            ConnectionCommand::AddressStatus { address, reply } => {
                let _ = reply.send(self.table.status(address));
            }
            ConnectionCommand::Enqueue {
                frame,
                matcher,
                priority,
                accepted,
                done,
            } => {
                let result = self
                    .traffic
                    .enqueue(frame, matcher, priority, Origin::External(done))
                    .map_err(|_| ThrottleError::ConnectionLost);
                let _ = accepted.send(result);
            }
            ConnectionCommand::Cancel { id, reply } => {
                let token = self.traffic.cancel(id);
                let cancelled = token.is_some();
                if let Some(token) = token {
                    self.complete(
                        Completion {
                            id,
                            token,
                            outcome: Err(Failure::Cancelled),
                        },
                        None,
                    );
                }
                let _ = reply.send(cancelled);
            }
            ConnectionCommand::AddListener { listener, reply } => {
                let _ = reply.send(self.listeners.add(listener));
            }
            ConnectionCommand::RemoveListener { id, reply } => {
                let _ = reply.send(self.listeners.remove(id));
            }
            ConnectionCommand::Shutdown => {}
        }
    }

    fn request_throttle(&mut self, address: Address, mode: ShareMode, reply: GrantReply) {
        if mode == ShareMode::Shared && !self.config.allows_sharing(address.number()) {
            let _ = reply.send(Err(ThrottleError::UnsupportedSharingMode));
            return;
        }
        debug!("Connection {} request for {} ({:?})", self.id, address, mode);
        let actions = self.table.request(address, mode, reply);
        self.run_actions(actions);
    }

    fn mutate(&mut self, throttle: ThrottleId, change: Change, reply: Reply<()>) {
        let Some(address) = self.throttles.get(&throttle).map(|e| e.address) else {
            let _ = reply.send(Err(ThrottleError::NotHeld));
            return;
        };
        let (Some(binding), Some(session)) =
            (self.table.binding(address), self.locos.get_mut(&address))
        else {
            let _ = reply.send(Err(ThrottleError::NotHeld));
            return;
        };
        if session.seed.is_some() {
            debug!("{} {} waits for the state of {}", throttle, change.name(), address);
            session.deferred.push(Deferred {
                throttle,
                change,
                reply,
            });
            return;
        }

        let mut target = session.projected;
        change.apply(&mut target);
        let cmd = change.command(binding, target);
        let frame = match self.adapter.encode(&cmd) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = reply.send(Err(ThrottleError::from_encode(e)));
                return;
            }
        };
        let matcher = self.adapter.response_matcher(&cmd);
        session.projected = target;
        session.pending += 1;
        debug!("{} {} -> {:?}", throttle, change.name(), target);

        let origin = Origin::Mutation {
            throttle,
            address,
            change,
            reply,
        };
        if let Err(Closed(Origin::Mutation { reply, .. })) =
            self.traffic.enqueue(frame, matcher, change.priority(), origin)
        {
            if let Some(session) = self.locos.get_mut(&address) {
                session.settle(change);
            }
            let _ = reply.send(Err(ThrottleError::ConnectionLost));
        }
    }

    fn release(&mut self, throttle: ThrottleId, reply: Reply<()>) {
        match self.table.release(throttle) {
            Err(NotHeld(_)) => {
                let _ = reply.send(Err(ThrottleError::NotHeld));
            }
            Ok(actions) => {
                if let Some(entry) = self.throttles.remove(&throttle) {
                    entry.released.store(true, Ordering::SeqCst);
                    info!("{} released {}", throttle, entry.address);
                }
                let _ = reply.send(Ok(()));
                self.run_actions(actions);
            }
        }
    }

    /// Carry out table actions, including any they trigger in turn
    fn run_actions(&mut self, actions: Vec<Action<GrantReply>>) {
        let mut pending: VecDeque<_> = actions.into();
        while let Some(action) = pending.pop_front() {
            match action {
                Action::SendAcquire { address } => {
                    let cmd = ThrottleCommand::Acquire { address };
                    let more = match self.adapter.encode(&cmd) {
                        Ok(frame) => {
                            let matcher = self.adapter.response_matcher(&cmd);
                            match self.traffic.enqueue(
                                frame,
                                matcher,
                                Priority::Normal,
                                Origin::Acquire(address),
                            ) {
                                Ok(_) => Vec::new(),
                                Err(_) => self.table.acquire_failed(address, "connection lost"),
                            }
                        }
                        Err(e) => self.table.acquire_failed(address, &e.to_string()),
                    };
                    pending.extend(more);
                }
                Action::SendRelease { address, binding } => {
                    if let Some(session) = self.locos.remove(&address) {
                        for waiting in session.deferred {
                            let _ = waiting.reply.send(Err(ThrottleError::NotHeld));
                        }
                    }
                    let cmd = ThrottleCommand::Release { binding };
                    let more = match self.adapter.encode(&cmd) {
                        Ok(frame) => {
                            let matcher = self.adapter.response_matcher(&cmd);
                            match self.traffic.enqueue(
                                frame,
                                matcher,
                                Priority::Normal,
                                Origin::Release(address),
                            ) {
                                Ok(_) => Vec::new(),
                                Err(_) => self.table.released(address),
                            }
                        }
                        Err(e) => {
                            warn!("Cannot encode release for {}: {}", address, e);
                            self.table.released(address)
                        }
                    };
                    pending.extend(more);
                }
                Action::Grant(grant) => pending.extend(self.grant(grant)),
                Action::Refuse {
                    address,
                    waiter,
                    reason,
                } => {
                    warn!("Acquisition of {} failed: {}", address, reason);
                    let _ = waiter.send(Err(ThrottleError::AcquisitionFailed {
                        address,
                        reason: reason.clone(),
                    }));
                    self.listeners
                        .broadcast(&ConnectionEvent::AcquisitionFailed { address, reason });
                }
                Action::Dispossess { address, throttle } => {
                    if let Some(mut entry) = self.throttles.remove(&throttle) {
                        info!("{} dispossessed of {}", throttle, address);
                        entry.released.store(true, Ordering::SeqCst);
                        entry
                            .listeners
                            .broadcast(&ThrottleEvent::Dispossessed { address });
                    }
                }
            }
        }
    }

    fn grant(&mut self, grant: Grant<GrantReply>) -> Vec<Action<GrantReply>> {
        let Grant {
            address,
            throttle,
            mode,
            waiter,
            ..
        } = grant;
        let fresh = !self.locos.contains_key(&address);
        let session = self
            .locos
            .entry(address)
            .or_insert_with(|| LocoSession::new(LocoState::default()));
        let released = Arc::new(AtomicBool::new(false));
        let handle = ThrottleGrant {
            id: throttle,
            address,
            mode,
            released: Arc::clone(&released),
            state: session.state_tx.subscribe(),
        };
        self.throttles.insert(
            throttle,
            ThrottleEntry {
                address,
                released,
                listeners: ListenerRegistry::new(),
            },
        );
        info!("{} granted {} ({:?})", throttle, address, mode);

        if waiter.send(Ok(handle)).is_ok() {
            if fresh && !self.adapter.requires_acquisition_round_trip() {
                self.seed(address);
            }
            return Vec::new();
        }
        debug!("Requester for {} went away, releasing {}", address, throttle);
        self.throttles.remove(&throttle);
        self.table.release(throttle).unwrap_or_default()
    }

    /// Ask the command station what a freshly granted address is doing
    fn seed(&mut self, address: Address) {
        let cmd = ThrottleCommand::Acquire { address };
        let frame = match self.adapter.encode(&cmd) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("No state query for {}: {}", address, e);
                return;
            }
        };
        let matcher = self.adapter.response_matcher(&cmd);
        if let Ok(id) = self
            .traffic
            .enqueue(frame, matcher, Priority::Normal, Origin::Seed(address))
        {
            if let Some(session) = self.locos.get_mut(&address) {
                session.seed = Some(id);
            }
        }
    }

    fn seeded(&mut self, id: RequestId, address: Address, update: Option<&StateUpdate>) {
        let deferred = match self.locos.get_mut(&address) {
            Some(session) if session.seed == Some(id) => {
                session.seed = None;
                std::mem::take(&mut session.deferred)
            }
            _ => return,
        };
        match update {
            Some(update) => self.apply_remote(address, update),
            None => warn!("State of {} unknown, assuming stopped", address),
        }
        for Deferred {
            throttle,
            change,
            reply,
        } in deferred
        {
            self.mutate(throttle, change, reply);
        }
    }

    /// Route a finished traffic request to whoever is waiting on it
    fn complete(&mut self, completion: Completion<Origin>, event: Option<&VendorEvent>) {
        let Completion { id, token, outcome } = completion;
        let update = match event {
            Some(VendorEvent::LocoUpdate { update, .. }) => Some(update),
            _ => None,
        };
        match token {
            Origin::External(done) => {
                let _ = done.send(outcome.map_err(ThrottleError::from));
            }
            Origin::Acquire(address) => match outcome {
                Ok(()) => {
                    let (binding, state) = match event {
                        Some(VendorEvent::SlotData { slot, state, .. }) => (
                            Binding {
                                address,
                                slot: Some(*slot),
                            },
                            *state,
                        ),
                        _ => (Binding::unslotted(address), LocoState::default()),
                    };
                    debug!("{} bound to {:?}", address, binding.slot);
                    self.locos.insert(address, LocoSession::new(state));
                    let actions = self.table.acquired(address, binding);
                    self.run_actions(actions);
                }
                Err(Failure::ConnectionLost) => {}
                Err(failure) => {
                    let reason = ThrottleError::from(failure).to_string();
                    let actions = self.table.acquire_failed(address, &reason);
                    self.run_actions(actions);
                }
            },
            Origin::Seed(address) => {
                let update = if outcome.is_ok() { update } else { None };
                self.seeded(id, address, update);
            }
            Origin::Release(address) => match outcome {
                Ok(()) => {
                    let actions = self.table.released(address);
                    self.run_actions(actions);
                }
                Err(Failure::ConnectionLost) => {}
                Err(failure) => {
                    warn!(
                        "Release of {} unconfirmed ({:?}), freeing after grace period",
                        address, failure
                    );
                    self.table
                        .release_unconfirmed(address, Instant::now(), self.config.release_grace());
                }
            },
            Origin::Mutation {
                throttle,
                address,
                change,
                reply,
            } => match outcome {
                Ok(()) => {
                    let steps = self.adapter.speed_steps();
                    let max_function = self.adapter.max_function();
                    let events = self.locos.get_mut(&address).map(|session| {
                        let before = session.confirmed;
                        change.apply(&mut session.confirmed);
                        // the reply reports what the hardware now does, which
                        // can include fields an earlier failed frame carried
                        if let Some(update) = update {
                            absorb(update, &mut session.confirmed);
                        }
                        session.settle(change);
                        let after = session.confirmed;
                        session.state_tx.send_replace(after);

                        let mut events = state_events(address, &before, &after, steps, max_function);
                        let own = change.event(address, &after, steps);
                        if !events.contains(&own) {
                            events.insert(0, own);
                        }
                        events
                    });
                    for event in events.unwrap_or_default() {
                        self.notify_holders(address, &event);
                    }
                    let _ = reply.send(Ok(()));
                }
                Err(failure) => {
                    if let Some(session) = self.locos.get_mut(&address) {
                        session.settle(change);
                    }
                    let err = ThrottleError::from(failure);
                    if !matches!(err, ThrottleError::ConnectionLost) {
                        warn!("{} {} on {} failed: {}", throttle, change.name(), address, err);
                        if let Some(entry) = self.throttles.get_mut(&throttle) {
                            entry.listeners.broadcast(&ThrottleEvent::CommandFailed {
                                address,
                                command: change.name(),
                                reason: err.to_string(),
                            });
                        }
                    }
                    let _ = reply.send(Err(err));
                }
            },
        }
    }

    fn notify_holders(&mut self, address: Address, event: &ThrottleEvent) {
        for id in self.table.holders_of(address) {
            if let Some(entry) = self.throttles.get_mut(id) {
                entry.listeners.broadcast(event);
            }
        }
    }

    fn on_bytes(&mut self, data: &[u8]) {
        self.frames.push_bytes(data);
        while let Some(frame) = self.frames.next_frame() {
            debug!("Connection {} in: {:02X?}", self.id, frame);
            self.listeners.broadcast(&ConnectionEvent::FrameIn {
                data: frame.clone(),
                protocol: self.protocol,
            });
            match self.adapter.decode(&frame) {
                Decoded::Event(event) => match self.traffic.on_event(&event) {
                    Some(done) => self.complete(done, Some(&event)),
                    None => self.on_unsolicited(event),
                },
                Decoded::Unrecognized => debug!("Connection {} ignored frame", self.id),
            }
        }
    }

    fn on_unsolicited(&mut self, event: VendorEvent) {
        match &event {
            VendorEvent::Fault(kind) => {
                warn!("Connection {} fault: {:?}", self.id, kind);
                self.listeners.broadcast(&ConnectionEvent::Fault(kind.clone()));
                return;
            }
            VendorEvent::LocoUpdate { loco, update } => {
                let address = match loco {
                    LocoRef::Address(a) => self
                        .table
                        .active_addresses()
                        .into_iter()
                        .find(|held| held.number() == a.number()),
                    LocoRef::Slot(slot) => self.table.address_for_slot(*slot),
                };
                if let Some(address) = address {
                    self.apply_remote(address, update);
                }
            }
            _ => {}
        }
        self.listeners.broadcast(&ConnectionEvent::Unsolicited(event));
    }

    /// A change made by someone else on the layout
    fn apply_remote(&mut self, address: Address, update: &StateUpdate) {
        let Some(session) = self.locos.get_mut(&address) else {
            return;
        };
        let before = session.confirmed;
        absorb(update, &mut session.confirmed);
        absorb(update, &mut session.projected);
        let after = session.confirmed;
        if before == after {
            return;
        }
        session.state_tx.send_replace(after);
        debug!("{} changed remotely: {:?}", address, after);

        let events = state_events(
            address,
            &before,
            &after,
            self.adapter.speed_steps(),
            self.adapter.max_function(),
        );
        for event in &events {
            self.notify_holders(address, event);
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        debug!("Connection {} out: {:02X?}", self.id, frame);
        self.io.write_all(frame).await?;
        self.io.flush().await?;
        self.listeners.broadcast(&ConnectionEvent::FrameOut {
            data: frame.to_vec(),
            protocol: self.protocol,
        });
        Ok(())
    }

    /// Write everything the window allows
    async fn pump(&mut self) -> std::io::Result<()> {
        while let Some(transmission) = self.traffic.next_transmission(Instant::now()) {
            self.write_frame(&transmission.frame).await?;
            if let Some(done) = self.traffic.on_written(transmission.id) {
                self.complete(done, None);
            }
        }
        Ok(())
    }

    async fn on_timer(&mut self) -> std::io::Result<()> {
        let now = Instant::now();
        let expired = self.traffic.on_deadline(now);
        for transmission in expired.retransmit {
            self.write_frame(&transmission.frame).await?;
        }
        for done in expired.failed {
            self.complete(done, None);
        }
        let actions = self.table.expire_grace(now);
        self.run_actions(actions);
        Ok(())
    }

    /// Hand every active address back on an orderly shutdown
    async fn release_all(&mut self) {
        for address in self.table.active_addresses() {
            let Some(binding) = self.table.binding(address) else {
                continue;
            };
            match self.adapter.encode(&ThrottleCommand::Release { binding }) {
                Ok(frame) => {
                    if let Err(e) = self.write_frame(&frame).await {
                        warn!("Could not release {} on shutdown: {}", address, e);
                        return;
                    }
                }
                Err(e) => debug!("No release frame for {}: {}", address, e),
            }
        }
    }

    /// Fail everything outstanding exactly once
    fn teardown(&mut self) {
        for done in self.traffic.disconnect() {
            self.complete(done, None);
        }
        let (holders, waiters) = self.table.drain();
        for (address, waiter) in waiters {
            debug!("Failing pending request for {}", address);
            let _ = waiter.send(Err(ThrottleError::ConnectionLost));
        }
        for (throttle, address) in holders {
            if let Some(mut entry) = self.throttles.remove(&throttle) {
                entry.released.store(true, Ordering::SeqCst);
                entry
                    .listeners
                    .broadcast(&ThrottleEvent::ConnectionLost { address });
            }
        }
        self.throttles.clear();
        self.locos.clear();
        self.listeners.broadcast(&ConnectionEvent::Disconnected);
    }
}

/// Raw access to a connection's traffic controller
///
/// Lets callers put arbitrary vendor frames on the wire with the same
/// ordering, retry and matching rules as throttle commands.
#[derive(Clone)]
pub struct TrafficHandle {
    cmd_tx: mpsc::Sender<ConnectionCommand>,
}

impl TrafficHandle {
    pub(crate) fn new(cmd_tx: mpsc::Sender<ConnectionCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Queue a frame; resolves once the request is accepted, not sent
    pub async fn enqueue(
        &self,
        frame: Vec<u8>,
        matcher: Option<ResponseMatcher>,
        priority: Priority,
    ) -> Result<RequestTicket, ThrottleError> {
        let (done, done_rx) = oneshot::channel();
        let id = call(&self.cmd_tx, |accepted| ConnectionCommand::Enqueue {
            frame,
            matcher,
            priority,
            accepted,
            done,
        })
        .await??;
        Ok(RequestTicket { id, done: done_rx })
    }

    /// Withdraw a request that has not been transmitted yet
    pub async fn cancel(&self, id: RequestId) -> Result<bool, ThrottleError> {
        call(&self.cmd_tx, |reply| ConnectionCommand::Cancel { id, reply }).await
    }
}

/// Accepted request; await [`RequestTicket::wait`] for its outcome
#[derive(Debug)]
pub struct RequestTicket {
    id: RequestId,
    done: oneshot::Receiver<Result<(), ThrottleError>>,
}

impl RequestTicket {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait until the request is confirmed or fails
    pub async fn wait(self) -> Result<(), ThrottleError> {
        self.done.await.map_err(|_| ThrottleError::ConnectionLost)?
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
