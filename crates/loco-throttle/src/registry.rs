//! Connection registry
//!
//! A [`LayoutConnection`] is one running link to a command station: its
//! identity, a [`ThrottleManager`], a [`TrafficHandle`] and the task that
//! drives them. A [`ConnectionList`] keeps several of them, one of which is
//! the default.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use loco_protocol::{create_adapter, Protocol, VendorAdapter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ConnectionConfig, TransportConfig};
use crate::connection::{call, ConnectionCommand, ConnectionTask, TrafficHandle};
use crate::error::ThrottleError;
use crate::events::ConnectionEvent;
use crate::listeners::{ChannelListener, Listener, ListenerId};
use crate::manager::ThrottleManager;
use crate::transport::{self, AsyncIo};

static NEXT_CONNECTION: AtomicU32 = AtomicU32::new(1);

/// Identity of one connection; scopes addresses, throttles and traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One running command-station connection
pub struct LayoutConnection {
    id: ConnectionId,
    name: String,
    protocol: Protocol,
    manager: ThrottleManager,
    traffic: TrafficHandle,
    cmd_tx: mpsc::Sender<ConnectionCommand>,
    task: JoinHandle<()>,
}

impl fmt::Debug for LayoutConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayoutConnection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl LayoutConnection {
    /// Open the configured serial or TCP transport and start the connection
    pub async fn open(config: ConnectionConfig) -> Result<Self, ThrottleError> {
        config.validate()?;
        let io = transport::open(&config.transport).await?;
        Self::with_io(config, io)
    }

    /// Start a connection over an already-open stream
    ///
    /// This is how virtual command stations are attached. Must be called
    /// from within a tokio runtime.
    pub fn with_io<IO: AsyncIo>(config: ConnectionConfig, io: IO) -> Result<Self, ThrottleError> {
        let adapter = create_adapter(config.protocol);
        Self::with_adapter(config, adapter, io)
    }

    /// Start a connection with a custom vendor adapter
    pub fn with_adapter<IO: AsyncIo>(
        config: ConnectionConfig,
        adapter: Arc<dyn VendorAdapter>,
        io: IO,
    ) -> Result<Self, ThrottleError> {
        config.validate()?;
        let id = ConnectionId::next();
        let name = config.name.clone();
        let protocol = adapter.protocol();
        if let TransportConfig::Serial { port, .. } = &config.transport {
            info!("Connection {} '{}' on {}", id, name, port);
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_queue);
        let task = ConnectionTask::new(id, config, Arc::clone(&adapter), io);
        let task = tokio::spawn(task.run(cmd_rx));

        Ok(Self {
            id,
            name,
            protocol,
            manager: ThrottleManager::new(id, adapter, cmd_tx.clone()),
            traffic: TrafficHandle::new(cmd_tx.clone()),
            cmd_tx,
            task,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Throttle manager for this connection
    pub fn manager(&self) -> &ThrottleManager {
        &self.manager
    }

    /// Raw traffic access for this connection
    pub fn traffic(&self) -> &TrafficHandle {
        &self.traffic
    }

    /// Register a connection-wide listener (traffic monitor, faults)
    pub async fn add_listener<L>(&self, listener: L) -> Result<ListenerId, ThrottleError>
    where
        L: Listener<ConnectionEvent> + 'static,
    {
        call(&self.cmd_tx, |reply| ConnectionCommand::AddListener {
            listener: Box::new(listener),
            reply,
        })
        .await
    }

    pub async fn remove_listener(&self, id: ListenerId) -> Result<bool, ThrottleError> {
        call(&self.cmd_tx, |reply| ConnectionCommand::RemoveListener { id, reply }).await
    }

    /// Channel of every connection event
    pub async fn subscribe(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<ConnectionEvent>, ThrottleError> {
        let (listener, rx) = ChannelListener::new();
        self.add_listener(listener).await?;
        Ok(rx)
    }

    /// Whether the connection task has stopped accepting commands
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    /// Release held addresses, stop the task and wait for it
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(ConnectionCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!("Connection {} task ended abnormally: {}", self.id, e);
        }
    }
}

/// Set of open connections with a default
#[derive(Debug, Default)]
pub struct ConnectionList {
    connections: Vec<LayoutConnection>,
    default: Option<ConnectionId>,
}

impl ConnectionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection; the first one added becomes the default
    pub fn add(&mut self, connection: LayoutConnection) -> ConnectionId {
        let id = connection.id();
        self.default.get_or_insert(id);
        self.connections.push(connection);
        id
    }

    pub fn get(&self, id: ConnectionId) -> Option<&LayoutConnection> {
        self.connections.iter().find(|c| c.id() == id)
    }

    /// Look a connection up by its display name
    pub fn by_name(&self, name: &str) -> Option<&LayoutConnection> {
        self.connections.iter().find(|c| c.name() == name)
    }

    pub fn default_connection(&self) -> Option<&LayoutConnection> {
        self.get(self.default?)
    }

    /// Make `id` the default; false if it is not in the list
    pub fn set_default(&mut self, id: ConnectionId) -> bool {
        if self.get(id).is_none() {
            return false;
        }
        self.default = Some(id);
        true
    }

    /// Take a connection out of the list without stopping it
    pub fn remove(&mut self, id: ConnectionId) -> Option<LayoutConnection> {
        let index = self.connections.iter().position(|c| c.id() == id)?;
        let connection = self.connections.remove(index);
        if self.default == Some(id) {
            self.default = self.connections.first().map(|c| c.id());
        }
        Some(connection)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayoutConnection> {
        self.connections.iter()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Shut every connection down
    pub async fn shutdown_all(&mut self) {
        self.default = None;
        for connection in self.connections.drain(..) {
            connection.shutdown().await;
        }
    }
}
