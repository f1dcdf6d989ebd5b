//! A management stack for KNX installations: connection-oriented
//! transport over a raw frame link, the application-layer management
//! services, and the procedures built from them.
//!
//! # Organization
//!
//! - [`address`] and [`link`] provide the bus vocabulary and the contract
//!   a frame link has to fulfil
//! - [`transport`] multiplexes per-peer connections over one link and
//!   implements sequencing, acknowledgements, retransmission, and idle
//!   disconnects
//! - [`management`] implements the device-management services and the
//!   composed procedures
//! - [`property`] is the uniform property-access surface over remote and
//!   local back-ends
//! - [`links`] carries the in-memory bus used by tests and examples
//!
//! # Layering
//!
//! A [`TransportLayer`] binds to one [`link::NetworkLink`] and owns a
//! table of [`transport::Destination`]s, one per remote device. The
//! [`ManagementClient`] sits on top and correlates service requests with
//! their responses; [`ManagementProcedures`] composes the client calls
//! into workflows like scanning a subnet or assigning an address. All
//! blocking operations are async and resolve when the matching frame,
//! acknowledgement, or timeout arrives.

pub mod address;
pub use address::{GroupAddress, IndividualAddress, KnxAddress};

pub mod error;
pub use error::Error;

pub mod link;
pub use link::{FrameEvent, KnxMedium, LinkEvent, MediumInfo, NetworkLink, Priority, SharedLink};

pub mod links;

pub mod transport;
pub use transport::{ConnState, Destination, DisconnectedBy, TransportEvent, TransportLayer};

pub mod management;
pub use management::procedures::ManagementProcedures;
pub use management::{DeviceDescriptor, EraseCode, ManagementClient, SerialNumber};

pub mod property;
pub use property::{Description, PropertyAdapter, PropertyClient, RemotePropertyAdapter};

use dashmap::DashMap;
use std::hash::BuildHasherDefault;
pub type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;
