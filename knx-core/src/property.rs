//! Uniform property access over interface objects.
//!
//! [`PropertyAdapter`] is the facade the tooling layers program against:
//! the [`RemotePropertyAdapter`] here runs over the management client,
//! while local back-ends (USB, IP device management) live in their own
//! crates and only implement the trait.

use std::fmt::{self, Display};
use std::sync::Arc;

use crate::error::Error;
use crate::management::ManagementClient;
use crate::transport::Destination;

mod client;
pub use client::PropertyClient;

/// Property identifiers of the device object the management procedures
/// rely on.
pub mod pid {
    pub const OBJECT_TYPE: u8 = 1;
    pub const LOAD_STATE_CONTROL: u8 = 5;
    pub const RUN_STATE_CONTROL: u8 = 6;
    pub const SERIAL_NUMBER: u8 = 11;
    pub const DEVICE_CONTROL: u8 = 14;
    pub const PROGMODE: u8 = 54;
    pub const MAX_APDULENGTH: u8 = 56;
}

/// A property description as exchanged on the wire: 7 bytes.
///
/// ```text
/// byte 0: object index
/// byte 1: PID
/// byte 2: property index
/// byte 3: bit 7 write enabled, bits 0..=5 property data type
/// byte 4..=5: maximum elements, big-endian
/// byte 6: bits 4..=7 read level, bits 0..=3 write level
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Description {
    pub object_index: u8,
    pub pid: u8,
    pub property_index: u8,
    pub write_enabled: bool,
    pub pdt: u8,
    pub max_elements: u16,
    pub read_level: u8,
    pub write_level: u8,
}

impl Description {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != 7 {
            return Err(Error::InvalidResponse(
                "property description must be 7 bytes".into(),
            ));
        }
        Ok(Self {
            object_index: bytes[0],
            pid: bytes[1],
            property_index: bytes[2],
            write_enabled: bytes[3] & 0x80 != 0,
            pdt: bytes[3] & 0x3F,
            max_elements: u16::from_be_bytes([bytes[4], bytes[5]]),
            read_level: bytes[6] >> 4,
            write_level: bytes[6] & 0x0F,
        })
    }

    pub fn to_bytes(&self) -> [u8; 7] {
        let max = self.max_elements.to_be_bytes();
        [
            self.object_index,
            self.pid,
            self.property_index,
            ((self.write_enabled as u8) << 7) | (self.pdt & 0x3F),
            max[0],
            max[1],
            (self.read_level << 4) | (self.write_level & 0x0F),
        ]
    }
}

impl Display for Description {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OI {} PID {} idx {} PDT 0x{:02x}{} max {} r/w {}/{}",
            self.object_index,
            self.pid,
            self.property_index,
            self.pdt,
            if self.write_enabled { " w" } else { "" },
            self.max_elements,
            self.read_level,
            self.write_level,
        )
    }
}

/// Decodes the separate current-element count, a 2- or 4-byte big-endian
/// value.
pub fn parse_current_elements(data: &[u8]) -> Result<u32, Error> {
    match data.len() {
        2 => Ok(u16::from_be_bytes([data[0], data[1]]) as u32),
        4 => Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]])),
        _ => Err(Error::InvalidResponse(
            "current element count must be 2 or 4 bytes".into(),
        )),
    }
}

/// The uniform property surface across remote and local back-ends.
#[async_trait::async_trait]
pub trait PropertyAdapter: Send + Sync {
    /// A short name identifying the back-end, for log output.
    fn name(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn get_property(
        &self,
        object_index: u8,
        property_id: u8,
        start: u16,
        elements: u8,
    ) -> Result<Vec<u8>, Error>;

    async fn set_property(
        &self,
        object_index: u8,
        property_id: u8,
        start: u16,
        elements: u8,
        data: &[u8],
    ) -> Result<(), Error>;

    async fn get_description(
        &self,
        object_index: u8,
        property_id: u8,
        property_index: u8,
    ) -> Result<Description, Error>;

    async fn close(&self);
}

/// Property access to one remote device through the management client.
pub struct RemotePropertyAdapter {
    client: Arc<ManagementClient>,
    destination: Arc<Destination>,
    name: String,
}

impl RemotePropertyAdapter {
    pub fn new(client: Arc<ManagementClient>, destination: Arc<Destination>) -> Self {
        let name = format!("remote property access {}", destination.address());
        Self {
            client,
            destination,
            name,
        }
    }

    pub fn destination(&self) -> &Arc<Destination> {
        &self.destination
    }

    /// Reads the current number of elements of a property.
    pub async fn current_elements(
        &self,
        object_index: u8,
        property_id: u8,
    ) -> Result<u32, Error> {
        let data = self
            .client
            .read_property(&self.destination, object_index, property_id, 0, 1)
            .await?;
        parse_current_elements(&data)
    }
}

#[async_trait::async_trait]
impl PropertyAdapter for RemotePropertyAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        !self.destination.is_destroyed() && !self.client.transport().is_detached()
    }

    async fn get_property(
        &self,
        object_index: u8,
        property_id: u8,
        start: u16,
        elements: u8,
    ) -> Result<Vec<u8>, Error> {
        self.client
            .read_property(&self.destination, object_index, property_id, start, elements)
            .await
    }

    async fn set_property(
        &self,
        object_index: u8,
        property_id: u8,
        start: u16,
        elements: u8,
        data: &[u8],
    ) -> Result<(), Error> {
        self.client
            .write_property(
                &self.destination,
                object_index,
                property_id,
                start,
                elements,
                data,
            )
            .await
            .map(|_| ())
    }

    async fn get_description(
        &self,
        object_index: u8,
        property_id: u8,
        property_index: u8,
    ) -> Result<Description, Error> {
        self.client
            .read_property_description(&self.destination, object_index, property_id, property_index)
            .await
    }

    async fn close(&self) {
        self.client
            .transport()
            .destroy_destination(&self.destination)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_round_trip() {
        let bytes = [3, 56, 7, 0x80 | 0x04, 0x01, 0x00, 0x32];
        let description = Description::from_bytes(&bytes).unwrap();
        assert_eq!(description.object_index, 3);
        assert_eq!(description.pid, 56);
        assert_eq!(description.property_index, 7);
        assert!(description.write_enabled);
        assert_eq!(description.pdt, 4);
        assert_eq!(description.max_elements, 256);
        assert_eq!(description.read_level, 3);
        assert_eq!(description.write_level, 2);
        assert_eq!(description.to_bytes(), bytes);
    }

    #[test]
    fn description_rejects_wrong_length() {
        assert!(Description::from_bytes(&[0; 6]).is_err());
        assert!(Description::from_bytes(&[0; 8]).is_err());
    }

    #[test]
    fn current_elements_widths() {
        assert_eq!(parse_current_elements(&[0x00, 0x05]).unwrap(), 5);
        assert_eq!(
            parse_current_elements(&[0x00, 0x01, 0x00, 0x00]).unwrap(),
            0x10000
        );
        assert!(parse_current_elements(&[1, 2, 3]).is_err());
    }
}
