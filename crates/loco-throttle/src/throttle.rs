//! Caller-facing throttle handle
//!
//! A [`Throttle`] is a cheap handle onto state owned by the connection task.
//! Mutators suspend the caller until the command station confirms (or the
//! request fails); the cached state is only ever moved by confirmations, so
//! a failed command leaves it untouched.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use loco_protocol::{
    speed_to_step, step_to_speed, Address, Binding, Direction, LocoState, ThrottleCommand,
    VendorAdapter,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::allocation::{ShareMode, ThrottleId};
use crate::connection::{call, ConnectionCommand, ThrottleGrant};
use crate::error::ThrottleError;
use crate::events::ThrottleEvent;
use crate::listeners::{ChannelListener, Listener, ListenerId};
use crate::registry::ConnectionId;
use crate::traffic::Priority;

/// One requested state change, applied to a projected or confirmed state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Change {
    Speed(u8),
    Direction(Direction),
    Function { index: u8, on: bool },
    EmergencyStop,
}

impl Change {
    pub(crate) fn apply(&self, state: &mut LocoState) {
        match *self {
            Change::Speed(step) => state.speed_step = step,
            Change::Direction(direction) => state.direction = direction,
            Change::Function { index, on } => state.functions.set(index, on),
            Change::EmergencyStop => state.speed_step = 0,
        }
    }

    /// Put the field this change touched back to its confirmed value
    pub(crate) fn revert(&self, projected: &mut LocoState, confirmed: &LocoState) {
        match *self {
            Change::Speed(_) | Change::EmergencyStop => projected.speed_step = confirmed.speed_step,
            Change::Direction(_) => projected.direction = confirmed.direction,
            Change::Function { index, .. } => projected
                .functions
                .set(index, confirmed.functions.get(index)),
        }
    }

    pub(crate) fn command(&self, binding: Binding, target: LocoState) -> ThrottleCommand {
        match *self {
            Change::Speed(_) => ThrottleCommand::SetSpeed { binding, target },
            Change::Direction(_) => ThrottleCommand::SetDirection { binding, target },
            Change::Function { index, .. } => ThrottleCommand::SetFunction {
                binding,
                index,
                target,
            },
            Change::EmergencyStop => ThrottleCommand::EmergencyStop { binding, target },
        }
    }

    pub(crate) fn priority(&self) -> Priority {
        match self {
            Change::EmergencyStop => Priority::High,
            _ => Priority::Normal,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Change::Speed(_) => "speed",
            Change::Direction(_) => "direction",
            Change::Function { .. } => "function",
            Change::EmergencyStop => "estop",
        }
    }

    /// Listener notification for a confirmed change
    pub(crate) fn event(&self, address: Address, state: &LocoState, steps: u8) -> ThrottleEvent {
        match *self {
            Change::Speed(_) | Change::EmergencyStop => ThrottleEvent::SpeedChanged {
                address,
                speed: step_to_speed(state.speed_step, steps),
            },
            Change::Direction(_) => ThrottleEvent::DirectionChanged {
                address,
                direction: state.direction,
            },
            Change::Function { index, .. } => ThrottleEvent::FunctionChanged {
                address,
                index,
                on: state.functions.get(index),
            },
        }
    }
}

/// Control handle for one address
///
/// Dropping a throttle that still holds its address releases it.
pub struct Throttle {
    id: ThrottleId,
    address: Address,
    mode: ShareMode,
    connection: ConnectionId,
    adapter: Arc<dyn VendorAdapter>,
    cmd_tx: mpsc::Sender<ConnectionCommand>,
    released: Arc<AtomicBool>,
    state: watch::Receiver<LocoState>,
}

impl fmt::Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("mode", &self.mode)
            .field("connection", &self.connection)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Throttle {
    pub(crate) fn new(
        grant: ThrottleGrant,
        connection: ConnectionId,
        adapter: Arc<dyn VendorAdapter>,
        cmd_tx: mpsc::Sender<ConnectionCommand>,
    ) -> Self {
        Self {
            id: grant.id,
            address: grant.address,
            mode: grant.mode,
            connection,
            adapter,
            cmd_tx,
            released: grant.released,
            state: grant.state,
        }
    }

    pub fn id(&self) -> ThrottleId {
        self.id
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn mode(&self) -> ShareMode {
        self.mode
    }

    /// Connection the address belongs to
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Whether the handle was released, dispossessed or lost its connection
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Last confirmed state
    pub fn state(&self) -> LocoState {
        *self.state.borrow()
    }

    /// Confirmed speed as a fraction of full speed
    pub fn speed(&self) -> f32 {
        step_to_speed(self.state().speed_step, self.adapter.speed_steps())
    }

    pub fn direction(&self) -> Direction {
        self.state().direction
    }

    pub fn function(&self, index: u8) -> bool {
        self.state().functions.get(index)
    }

    /// Receiver that observes every confirmed state change
    pub fn watch(&self) -> watch::Receiver<LocoState> {
        self.state.clone()
    }

    /// Set speed as a fraction in `[0, 1]`
    pub async fn set_speed(&self, speed: f32) -> Result<(), ThrottleError> {
        self.ensure_held()?;
        if !(0.0..=1.0).contains(&speed) {
            return Err(ThrottleError::InvalidValue(format!(
                "speed {} is outside [0, 1]",
                speed
            )));
        }
        let step = speed_to_step(speed, self.adapter.speed_steps());
        self.mutate(Change::Speed(step)).await
    }

    pub async fn set_direction(&self, direction: Direction) -> Result<(), ThrottleError> {
        self.ensure_held()?;
        self.mutate(Change::Direction(direction)).await
    }

    /// Switch function output `index`
    pub async fn set_function(&self, index: u8, on: bool) -> Result<(), ThrottleError> {
        self.ensure_held()?;
        let max = self.adapter.max_function();
        if index > max {
            return Err(ThrottleError::Capability(format!(
                "function F{} (highest is F{})",
                index, max
            )));
        }
        self.mutate(Change::Function { index, on }).await
    }

    /// Stop immediately; jumps ahead of queued normal-priority commands
    pub async fn emergency_stop(&self) -> Result<(), ThrottleError> {
        self.ensure_held()?;
        self.mutate(Change::EmergencyStop).await
    }

    /// Give up the address; the handle is unusable afterwards
    pub async fn release(&self) -> Result<(), ThrottleError> {
        self.ensure_held()?;
        let id = self.id;
        call(&self.cmd_tx, |reply| ConnectionCommand::Release { throttle: id, reply }).await??;
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Register a listener for this throttle's events
    pub async fn add_listener<L>(&self, listener: L) -> Result<ListenerId, ThrottleError>
    where
        L: Listener<ThrottleEvent> + 'static,
    {
        self.ensure_held()?;
        let id = self.id;
        call(&self.cmd_tx, |reply| ConnectionCommand::AddThrottleListener {
            throttle: id,
            listener: Box::new(listener),
            reply,
        })
        .await?
    }

    /// Remove a listener, returning whether it was registered
    pub async fn remove_listener(&self, listener: ListenerId) -> Result<bool, ThrottleError> {
        self.ensure_held()?;
        let id = self.id;
        call(&self.cmd_tx, |reply| ConnectionCommand::RemoveThrottleListener {
            throttle: id,
            id: listener,
            reply,
        })
        .await?
    }

    /// Channel of this throttle's events
    pub async fn subscribe(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<ThrottleEvent>, ThrottleError> {
        let (listener, rx) = ChannelListener::new();
        self.add_listener(listener).await?;
        Ok(rx)
    }

    fn ensure_held(&self) -> Result<(), ThrottleError> {
        if self.is_released() {
            Err(ThrottleError::NotHeld)
        } else {
            Ok(())
        }
    }

    async fn mutate(&self, change: Change) -> Result<(), ThrottleError> {
        let id = self.id;
        call(&self.cmd_tx, |reply| ConnectionCommand::Mutate {
            throttle: id,
            change,
            reply,
        })
        .await?
    }
}

impl Drop for Throttle {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let (reply, _) = tokio::sync::oneshot::channel();
        let release = ConnectionCommand::Release {
            throttle: self.id,
            reply,
        };
        match self.cmd_tx.try_send(release) {
            Ok(()) => {}
            Err(TrySendError::Full(release)) => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let cmd_tx = self.cmd_tx.clone();
                    runtime.spawn(async move {
                        let _ = cmd_tx.send(release).await;
                    });
                }
                Err(_) => warn!("Command queue full, {} not released on drop", self.address),
            },
            Err(TrySendError::Closed(_)) => {
                debug!("Connection gone, nothing to release for {}", self.address)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loco_protocol::FunctionSet;

    const A3: Address = Address::short(3);

    #[test]
    fn test_change_apply_and_revert() {
        let confirmed = LocoState {
            speed_step: 40,
            direction: Direction::Forward,
            functions: FunctionSet::default().with(0, true),
        };
        let mut projected = confirmed;
        Change::Speed(90).apply(&mut projected);
        Change::Function { index: 0, on: false }.apply(&mut projected);
        Change::Direction(Direction::Reverse).apply(&mut projected);

        Change::Speed(90).revert(&mut projected, &confirmed);
        assert_eq!(projected.speed_step, 40);
        // other fields keep their projection
        assert!(!projected.functions.get(0));
        assert_eq!(projected.direction, Direction::Reverse);

        Change::EmergencyStop.apply(&mut projected);
        assert_eq!(projected.speed_step, 0);
    }

    #[test]
    fn test_change_command_and_priority() {
        let binding = Binding::unslotted(A3);
        let target = LocoState::default();
        assert_eq!(
            Change::EmergencyStop.command(binding, target),
            ThrottleCommand::EmergencyStop { binding, target }
        );
        assert_eq!(Change::EmergencyStop.priority(), Priority::High);
        assert_eq!(Change::Speed(1).priority(), Priority::Normal);
        assert_eq!(
            Change::Function { index: 4, on: true }.command(binding, target).name(),
            "function"
        );
    }

    #[tokio::test]
    async fn test_drop_releases_through_a_full_queue() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(1);
        assert!(cmd_tx.try_send(ConnectionCommand::Shutdown).is_ok());
        let (_state_tx, state) = watch::channel(LocoState::default());
        let grant = ThrottleGrant {
            id: ThrottleId(7),
            address: A3,
            mode: ShareMode::Exclusive,
            released: Arc::new(AtomicBool::new(false)),
            state,
        };
        let adapter = loco_protocol::create_adapter(loco_protocol::Protocol::DccEx);
        drop(Throttle::new(grant, ConnectionId::next(), adapter, cmd_tx));

        assert!(matches!(cmd_rx.recv().await, Some(ConnectionCommand::Shutdown)));
        match cmd_rx.recv().await {
            Some(ConnectionCommand::Release { throttle, .. }) => assert_eq!(throttle, ThrottleId(7)),
            _ => panic!("expected a release"),
        }
    }

    #[test]
    fn test_change_event() {
        let state = LocoState {
            speed_step: 63,
            ..Default::default()
        };
        match Change::Speed(63).event(A3, &state, 126) {
            ThrottleEvent::SpeedChanged { speed, .. } => assert!((speed - 0.5).abs() < 1e-6),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            Change::Function { index: 2, on: true }.event(A3, &state, 126),
            ThrottleEvent::FunctionChanged {
                address: A3,
                index: 2,
                on: false
            }
        );
    }
}
