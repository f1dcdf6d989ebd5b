//! The network-link contract the transport layer runs on.
//!
//! A link moves raw transport protocol data units (TPDUs) between this
//! endpoint and the bus. The transport layer consumes the [`NetworkLink`]
//! trait and never cares whether frames travel over TP1, powerline, RF, or
//! an in-memory [bus](crate::links::Bus); medium-specific framing belongs
//! to the link implementation.

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::address::{IndividualAddress, KnxAddress};
use crate::error::Error;

/// Frame priority, encoded in two bits of the frame control field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    System,
    Urgent,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// The 2-bit control-field encoding.
    pub const fn bits(self) -> u8 {
        match self {
            Priority::System => 0b00,
            Priority::Normal => 0b01,
            Priority::Urgent => 0b10,
            Priority::Low => 0b11,
        }
    }

    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Priority::System,
            0b01 => Priority::Normal,
            0b10 => Priority::Urgent,
            _ => Priority::Low,
        }
    }
}

/// The physical medium behind a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnxMedium {
    Tp1,
    Pl110,
    Rf,
    KnxIp,
}

impl KnxMedium {
    /// The default individual address scans use to reach unconfigured
    /// devices on a line of this medium: `0.line.255`.
    pub fn default_device(self, line: u8) -> IndividualAddress {
        IndividualAddress::new(0, line, 0xFF)
    }
}

/// Medium kind and local device address of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediumInfo {
    pub medium: KnxMedium,
    /// The individual address this endpoint sends from.
    pub address: IndividualAddress,
}

/// Immutable capture of one inbound data unit.
#[derive(Debug, Clone)]
pub struct FrameEvent {
    pub source: IndividualAddress,
    pub destination: KnxAddress,
    pub priority: Priority,
    /// The raw TPDU, first byte carrying the transport control bits.
    pub tpdu: Vec<u8>,
    pub received: Instant,
}

/// What a link reports to its subscribers.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// An inbound frame.
    Indication(FrameEvent),
    /// The link was closed and will not deliver further frames.
    Closed,
}

/// A shared handle to a network link.
pub type SharedLink = Arc<dyn NetworkLink>;

/// Frame transport below the transport layer.
///
/// Implementations fan inbound frames out to every subscriber in arrival
/// order; a subscriber that falls behind loses the oldest events and is
/// told so through the channel, it is never able to stall the link.
#[async_trait::async_trait]
pub trait NetworkLink: Send + Sync + 'static {
    /// Sends a TPDU without waiting for the medium.
    async fn send_request(
        &self,
        destination: KnxAddress,
        priority: Priority,
        tpdu: &[u8],
    ) -> Result<(), Error>;

    /// Sends a TPDU and waits for the medium confirmation.
    async fn send_request_wait(
        &self,
        destination: KnxAddress,
        priority: Priority,
        tpdu: &[u8],
    ) -> Result<(), Error>;

    /// Registers for inbound frames and the close event.
    fn subscribe(&self) -> broadcast::Receiver<LinkEvent>;

    /// Medium kind and local device address.
    fn medium(&self) -> MediumInfo;

    fn is_open(&self) -> bool;

    /// Closes the link. Subscribers receive [`LinkEvent::Closed`].
    async fn close(&self);

    /// A short name for log output.
    fn name(&self) -> &str;
}

impl fmt::Debug for dyn NetworkLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkLink")
            .field("name", &self.name())
            .field("medium", &self.medium())
            .field("open", &self.is_open())
            .finish()
    }
}
