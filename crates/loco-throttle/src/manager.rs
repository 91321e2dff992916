//! Throttle manager: the entry point for acquiring addresses

use std::fmt;
use std::sync::Arc;

use loco_protocol::{Address, Protocol, VendorAdapter};
use tokio::sync::mpsc;

use crate::allocation::{AddressStatus, ShareMode};
use crate::connection::{call, ConnectionCommand};
use crate::error::ThrottleError;
use crate::registry::ConnectionId;
use crate::throttle::Throttle;

/// Hands out throttles for one connection
///
/// Cloning is cheap; every clone talks to the same connection task.
#[derive(Clone)]
pub struct ThrottleManager {
    connection: ConnectionId,
    adapter: Arc<dyn VendorAdapter>,
    cmd_tx: mpsc::Sender<ConnectionCommand>,
}

impl fmt::Debug for ThrottleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottleManager")
            .field("connection", &self.connection)
            .field("protocol", &self.adapter.protocol())
            .finish()
    }
}

impl ThrottleManager {
    pub(crate) fn new(
        connection: ConnectionId,
        adapter: Arc<dyn VendorAdapter>,
        cmd_tx: mpsc::Sender<ConnectionCommand>,
    ) -> Self {
        Self {
            connection,
            adapter,
            cmd_tx,
        }
    }

    /// Acquire control of `address`
    ///
    /// Suspends until the address is granted. With the queue contention
    /// policy that includes waiting for the current holder to release.
    pub async fn request_throttle(
        &self,
        address: Address,
        mode: ShareMode,
    ) -> Result<Throttle, ThrottleError> {
        if !self.adapter.supports_address(address) {
            return Err(ThrottleError::AddressOutOfRange(address));
        }
        if mode == ShareMode::Shared && !self.adapter.supports_shared_addressing() {
            return Err(ThrottleError::UnsupportedSharingMode);
        }
        let grant = call(&self.cmd_tx, |reply| ConnectionCommand::RequestThrottle {
            address,
            mode,
            reply,
        })
        .await??;
        Ok(Throttle::new(
            grant,
            self.connection,
            Arc::clone(&self.adapter),
            self.cmd_tx.clone(),
        ))
    }

    /// Allocation state, holders and queue length of `address`
    pub async fn address_status(&self, address: Address) -> Result<AddressStatus, ThrottleError> {
        call(&self.cmd_tx, |reply| ConnectionCommand::AddressStatus { address, reply }).await
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn protocol(&self) -> Protocol {
        self.adapter.protocol()
    }

    /// Whether shared throttles can be requested at all
    pub fn supports_sharing(&self) -> bool {
        self.adapter.supports_shared_addressing()
    }
}
