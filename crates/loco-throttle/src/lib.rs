//! Throttle acquisition and command dispatch for model-railroad command stations
//!
//! This crate sits between user-facing throttles and a command station link.
//! Each connection runs as one tokio task that owns:
//!
//! - a [`TrafficController`]: single writer, priority queue, in-flight
//!   window, reply matching, retry and timeout
//! - an [`AddressTable`]: the per-address allocation state machine with
//!   exclusive/shared control, FIFO queueing or steal on contention
//! - listener registries for throttle events and connection-wide traffic
//!
//! Callers reach the task through a [`ThrottleManager`], the [`Throttle`]
//! handles it grants, and a [`TrafficHandle`] for raw frames.
//!
//! # Example
//!
//! ```no_run
//! use loco_protocol::Address;
//! use loco_throttle::{ConnectionConfig, LayoutConnection, ShareMode};
//!
//! # async fn demo() -> Result<(), loco_throttle::ThrottleError> {
//! let config = ConnectionConfig::load("layout.json".as_ref())?;
//! let connection = LayoutConnection::open(config).await?;
//! let throttle = connection
//!     .manager()
//!     .request_throttle(Address::short(3), ShareMode::Exclusive)
//!     .await?;
//! throttle.set_speed(0.5).await?;
//! throttle.release().await?;
//! # Ok(())
//! # }
//! ```

pub mod allocation;
pub mod config;
mod connection;
pub mod error;
pub mod events;
pub mod listeners;
pub mod manager;
pub mod paths;
pub mod registry;
pub mod throttle;
pub mod traffic;
pub mod transport;

pub use allocation::{AddressStatus, AddressTable, AllocationState, ShareMode, ThrottleId};
pub use config::{ConnectionConfig, ContentionPolicy, TransportConfig};
pub use connection::{RequestTicket, TrafficHandle};
pub use error::ThrottleError;
pub use events::{ConnectionEvent, ThrottleEvent};
pub use listeners::{ChannelListener, Listener, ListenerError, ListenerId, ListenerRegistry};
pub use manager::ThrottleManager;
pub use paths::PathResolver;
pub use registry::{ConnectionId, ConnectionList, LayoutConnection};
pub use throttle::Throttle;
pub use traffic::{Priority, RequestId, TrafficController, TrafficSettings};
