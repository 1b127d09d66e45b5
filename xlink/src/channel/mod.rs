//! Channel lifecycle shared by the datagram and pub/sub transports.
//!
//! ```text
//! Created ──configure──▶ Configured ──connect──▶ Connected ──disconnect──▶ Disconnected
//!                            ▲                                                 │
//!                            └────────────────────── connect ──────────────────┘
//! ```

use std::future::Future;

use crate::config::TransportConfig;
use crate::error::{Error, Result};

pub mod datagram;
mod listener;
mod peers;
pub mod pubsub;

pub use datagram::{DatagramChannel, Delivery, ReceiveStats, StatsSnapshot};
pub use listener::{Handler, HandlerResult, STOP_GRACE};
pub use pubsub::{Message, PubSubChannel, Role};

/// Lifecycle contract implemented by every transport variant.
pub trait Channel: Send {
    /// Merges `options` over the current configuration.
    ///
    /// The merged set is validated as a whole; on error the previous
    /// configuration stays in force. Changes apply on the next `connect`.
    fn configure(&mut self, options: TransportConfig) -> Result<()>;

    /// Acquires the socket. Fails with a connection-state error when already
    /// connected.
    fn connect(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Stops any listener and releases the socket. No-op when not connected.
    fn disconnect(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn is_connected(&self) -> bool;

    fn state(&self) -> ChannelState;

    fn config(&self) -> &TransportConfig;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Created,
    Configured,
    Connected,
    Disconnected,
}

/// State checks every variant applies the same way.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    name: &'static str,
    state: ChannelState,
}

impl Lifecycle {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            state: ChannelState::Created,
        }
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    pub(crate) fn configured(&mut self) {
        if self.state == ChannelState::Created {
            self.state = ChannelState::Configured;
        }
    }

    pub(crate) fn begin_connect(&self) -> Result<()> {
        if self.is_connected() {
            return Err(Error::ConnectionState(format!("{} is already connected", self.name)));
        }
        Ok(())
    }

    pub(crate) fn ensure_connected(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::not_connected(self.name));
        }
        Ok(())
    }

    pub(crate) fn mark_connected(&mut self) {
        self.state = ChannelState::Connected;
    }

    /// Returns whether the channel was connected.
    pub(crate) fn mark_disconnected(&mut self) -> bool {
        let was_connected = self.is_connected();
        if was_connected {
            self.state = ChannelState::Disconnected;
        }
        was_connected
    }
}
