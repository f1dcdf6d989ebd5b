//! KNX bus addresses.
//!
//! An individual address identifies one device on the bus and is written
//! `area.line.device`. A group address identifies a logical datapoint group
//! and is written `main/middle/sub`. Group address 0 designates the
//! broadcast.

use std::fmt::{self, Display};
use std::str::FromStr;

/// A 16-bit individual (physical) device address.
///
/// The raw value splits into a 4-bit area, a 4-bit line, and an 8-bit
/// device part. Device 0 addresses the line coupler (router) of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndividualAddress(u16);

impl IndividualAddress {
    /// The default individual address assigned to factory-fresh devices,
    /// `15.15.255`.
    pub const DEFAULT_DEVICE: IndividualAddress = IndividualAddress(0xFFFF);

    /// Creates an address from its three parts. The area and line parts
    /// are truncated to 4 bits.
    pub const fn new(area: u8, line: u8, device: u8) -> Self {
        Self((((area & 0x0F) as u16) << 12) | (((line & 0x0F) as u16) << 8) | device as u16)
    }

    /// Creates an address from the 16-bit wire representation.
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// The 16-bit wire representation, big-endian on the bus.
    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn area(self) -> u8 {
        (self.0 >> 12) as u8
    }

    pub const fn line(self) -> u8 {
        ((self.0 >> 8) & 0x0F) as u8
    }

    pub const fn device(self) -> u8 {
        self.0 as u8
    }

    /// Whether this address belongs to a coupler, i.e. the device part
    /// is 0.
    pub const fn is_router(self) -> bool {
        self.0 & 0xFF == 0
    }

    pub const fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }
}

impl From<u16> for IndividualAddress {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area(), self.line(), self.device())
    }
}

impl FromStr for IndividualAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let area = next_part(&mut parts, 15)?;
        let line = next_part(&mut parts, 15)?;
        let device = next_part(&mut parts, 255)?;
        if parts.next().is_some() {
            return Err(AddressParseError);
        }
        Ok(Self::new(area, line, device))
    }
}

/// A 16-bit group address in 3-level `main/middle/sub` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupAddress(u16);

impl GroupAddress {
    /// Group address 0, the bus-wide broadcast.
    pub const BROADCAST: GroupAddress = GroupAddress(0);

    pub const fn new(main: u8, middle: u8, sub: u8) -> Self {
        Self((((main & 0x1F) as u16) << 11) | (((middle & 0x07) as u16) << 8) | sub as u16)
    }

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn main(self) -> u8 {
        (self.0 >> 11) as u8
    }

    pub const fn middle(self) -> u8 {
        ((self.0 >> 8) & 0x07) as u8
    }

    pub const fn sub(self) -> u8 {
        self.0 as u8
    }

    pub const fn is_broadcast(self) -> bool {
        self.0 == 0
    }

    pub const fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl From<u16> for GroupAddress {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.main(), self.middle(), self.sub())
    }
}

/// Either kind of destination address a frame can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnxAddress {
    Individual(IndividualAddress),
    Group(GroupAddress),
}

impl KnxAddress {
    /// Whether this is the bus-wide broadcast destination.
    pub fn is_broadcast(self) -> bool {
        matches!(self, KnxAddress::Group(g) if g.is_broadcast())
    }
}

impl From<IndividualAddress> for KnxAddress {
    fn from(a: IndividualAddress) -> Self {
        KnxAddress::Individual(a)
    }
}

impl From<GroupAddress> for KnxAddress {
    fn from(a: GroupAddress) -> Self {
        KnxAddress::Group(a)
    }
}

impl Display for KnxAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnxAddress::Individual(a) => a.fmt(f),
            KnxAddress::Group(a) => a.fmt(f),
        }
    }
}

/// The string was not a valid dotted or slashed address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressParseError;

impl Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("malformed KNX address")
    }
}

impl std::error::Error for AddressParseError {}

fn next_part(parts: &mut std::str::Split<'_, char>, max: u8) -> Result<u8, AddressParseError> {
    let part = parts.next().ok_or(AddressParseError)?;
    let value: u8 = part.parse().map_err(|_| AddressParseError)?;
    if value > max {
        return Err(AddressParseError);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn individual_parts() {
        let addr = IndividualAddress::new(1, 1, 5);
        assert_eq!(addr.raw(), 0x1105);
        assert_eq!(addr.area(), 1);
        assert_eq!(addr.line(), 1);
        assert_eq!(addr.device(), 5);
        assert_eq!(addr.to_string(), "1.1.5");
        assert!(!addr.is_router());
        assert!(IndividualAddress::new(15, 3, 0).is_router());
    }

    #[test]
    fn individual_round_trip() {
        let addr = IndividualAddress::from_raw(0xFF7E);
        assert_eq!(IndividualAddress::from_bytes(addr.to_bytes()), addr);
        assert_eq!("15.15.126".parse::<IndividualAddress>().unwrap(), addr);
    }

    #[test]
    fn individual_parse_rejects_junk() {
        assert!("1.1".parse::<IndividualAddress>().is_err());
        assert!("16.0.0".parse::<IndividualAddress>().is_err());
        assert!("1.1.5.2".parse::<IndividualAddress>().is_err());
        assert!("1.x.5".parse::<IndividualAddress>().is_err());
    }

    #[test]
    fn group_broadcast() {
        assert!(GroupAddress::BROADCAST.is_broadcast());
        assert!(KnxAddress::Group(GroupAddress::from_raw(0)).is_broadcast());
        assert!(!KnxAddress::Individual(IndividualAddress::new(1, 1, 5)).is_broadcast());
        assert_eq!(GroupAddress::new(1, 2, 3).to_string(), "1/2/3");
    }
}
