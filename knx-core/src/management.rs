//! Application-layer management services.
//!
//! [`ManagementClient`] turns the transport layer into a request/response
//! engine for the KNX device-management services: address assignment,
//! device descriptors, restart, property and memory access, ADC reads,
//! authorization, and network parameters.
//!
//! Every request validates its arguments locally before any I/O, sends
//! point-to-point (connection-oriented or connectionless, following the
//! destination's mode) or as a system broadcast, and then filters inbound
//! frames by service code, sender, and ASDU length. Request/response
//! cycles are serialized on one per-client mutex; the response subscription
//! is taken out before the request leaves, so a fast responder cannot slip
//! through a correlation window.

use std::fmt::{self, Display};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};

use crate::address::IndividualAddress;
use crate::error::Error;
use crate::link::{FrameEvent, Priority};
use crate::property::{pid, Description};
use crate::transport::{ConnState, Destination, TransportEvent, TransportLayer};

pub mod apdu;
pub mod procedures;

use self::apdu::svc;

/// Default window for a management service response.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for service data in one APDU.
const MAX_ASDU: usize = 252;

/// A device's 6-byte factory serial number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SerialNumber([u8; 6]);

impl SerialNumber {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl From<[u8; 6]> for SerialNumber {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Device descriptor type 0, the 16-bit mask version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceDescriptor(u16);

impl DeviceDescriptor {
    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    /// Medium/profile nibble of the mask version.
    pub const fn medium_type(self) -> u8 {
        (self.0 >> 12) as u8
    }

    /// Firmware type nibble.
    pub const fn firmware_type(self) -> u8 {
        ((self.0 >> 8) & 0x0F) as u8
    }

    pub const fn version(self) -> u8 {
        self.0 as u8
    }
}

impl Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// Erase scope of a master reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EraseCode {
    ConfirmedRestart = 1,
    FactoryReset = 2,
    ResetIndividualAddress = 3,
    ResetApplicationProgram = 4,
    ResetApplicationParameters = 5,
    ResetLinks = 6,
    FactoryResetWithoutIndividualAddress = 7,
}

fn erase_status(code: u8) -> Option<&'static str> {
    match code {
        0 => None,
        1 => Some("master reset: access denied"),
        2 => Some("master reset: unsupported erase code"),
        3 => Some("master reset: invalid channel"),
        _ => Some("master reset: unknown error"),
    }
}

/// Which frames complete a pending request.
struct Expected {
    service: u16,
    from: Option<IndividualAddress>,
    min_asdu: usize,
    max_asdu: usize,
}

impl Expected {
    fn from_peer(service: u16, from: IndividualAddress, asdu: std::ops::RangeInclusive<usize>) -> Self {
        Self {
            service,
            from: Some(from),
            min_asdu: *asdu.start(),
            max_asdu: *asdu.end(),
        }
    }

    fn from_any(service: u16, asdu: std::ops::RangeInclusive<usize>) -> Self {
        Self {
            service,
            from: None,
            min_asdu: *asdu.start(),
            max_asdu: *asdu.end(),
        }
    }
}

/// The management client. One per transport layer; concurrent callers
/// queue on the internal request/response mutex.
pub struct ManagementClient {
    transport: Arc<TransportLayer>,
    cycle: tokio::sync::Mutex<()>,
    response_timeout: Mutex<Duration>,
}

impl ManagementClient {
    pub fn new(transport: Arc<TransportLayer>) -> Self {
        Self {
            transport,
            cycle: tokio::sync::Mutex::new(()),
            response_timeout: Mutex::new(RESPONSE_TIMEOUT),
        }
    }

    pub fn transport(&self) -> &Arc<TransportLayer> {
        &self.transport
    }

    pub fn response_timeout(&self) -> Duration {
        *self.response_timeout.lock().unwrap()
    }

    pub fn set_response_timeout(&self, window: Duration) {
        *self.response_timeout.lock().unwrap() = window;
    }

    /// Creates a destination for point-to-point services.
    pub fn create_destination(
        &self,
        address: IndividualAddress,
        connection_oriented: bool,
    ) -> Result<Arc<Destination>, Error> {
        self.transport.create_destination(address, connection_oriented)
    }

    pub fn create_destination_with(
        &self,
        address: IndividualAddress,
        connection_oriented: bool,
        keep_alive: bool,
        verify_mode: bool,
    ) -> Result<Arc<Destination>, Error> {
        self.transport
            .create_destination_with(address, connection_oriented, keep_alive, verify_mode)
    }

    /// Detaches the underlying transport layer. The network link is left
    /// open; this client and its destinations become unusable.
    pub async fn detach(&self) {
        self.transport.detach().await;
    }

    // Address services (system broadcast).

    /// Assigns `address` to the devices currently in programming mode.
    pub async fn write_address(&self, address: IndividualAddress) -> Result<(), Error> {
        let _cycle = self.cycle.lock().await;
        let apdu = apdu::make(svc::IND_ADDR_WRITE, &address.to_bytes());
        self.transport.broadcast(true, Priority::System, &apdu).await
    }

    /// Reads the addresses of devices in programming mode. With
    /// `one_only`, returns after the first responder (a missing response
    /// is a timeout error); otherwise collects every responder within the
    /// response window, possibly none.
    pub async fn read_address(&self, one_only: bool) -> Result<Vec<IndividualAddress>, Error> {
        self.read_address_within(one_only, self.response_timeout()).await
    }

    pub(crate) async fn read_address_within(
        &self,
        one_only: bool,
        window: Duration,
    ) -> Result<Vec<IndividualAddress>, Error> {
        let _cycle = self.cycle.lock().await;
        let mut events = self.transport.subscribe();
        let apdu = apdu::make(svc::IND_ADDR_READ, &[]);
        self.transport.broadcast(true, Priority::System, &apdu).await?;
        let deadline = Instant::now() + window;
        let expected = Expected::from_any(svc::IND_ADDR_RESPONSE, 0..=0);
        if one_only {
            let (source, _) = self.wait_response(&mut events, &expected, deadline, None).await?;
            Ok(vec![source])
        } else {
            let mut addresses = Vec::new();
            for (source, _) in self.collect_responses(&mut events, &expected, deadline).await? {
                if !addresses.contains(&source) {
                    addresses.push(source);
                }
            }
            Ok(addresses)
        }
    }

    /// Reads the individual address of the device with the given serial
    /// number.
    pub async fn read_address_by_serial(
        &self,
        serial: SerialNumber,
    ) -> Result<IndividualAddress, Error> {
        let _cycle = self.cycle.lock().await;
        let mut events = self.transport.subscribe();
        let apdu = apdu::make(svc::IND_ADDR_SN_READ, serial.as_bytes());
        self.transport.broadcast(true, Priority::System, &apdu).await?;
        let deadline = Instant::now() + self.response_timeout();
        let expected = Expected::from_any(svc::IND_ADDR_SN_RESPONSE, 10..=10);
        loop {
            let (source, apdu) = self.wait_response(&mut events, &expected, deadline, None).await?;
            if apdu::asdu(&apdu)[..6] == serial.as_bytes()[..] {
                return Ok(source);
            }
            // A different device answered a concurrent scan; keep waiting.
        }
    }

    /// Assigns `address` to the device with the given serial number.
    pub async fn write_address_by_serial(
        &self,
        serial: SerialNumber,
        address: IndividualAddress,
    ) -> Result<(), Error> {
        let _cycle = self.cycle.lock().await;
        let mut asdu = Vec::with_capacity(12);
        asdu.extend_from_slice(serial.as_bytes());
        asdu.extend_from_slice(&address.to_bytes());
        asdu.extend_from_slice(&[0; 4]);
        let apdu = apdu::make(svc::IND_ADDR_SN_WRITE, &asdu);
        self.transport.broadcast(true, Priority::System, &apdu).await
    }

    // Domain address services (system broadcast).

    /// Writes a 2-byte (PL) or 6-byte (RF) domain address to devices in
    /// programming mode.
    pub async fn write_domain_address(&self, domain: &[u8]) -> Result<(), Error> {
        if domain.len() != 2 && domain.len() != 6 {
            return Err(Error::IllegalArgument("domain address must be 2 or 6 bytes"));
        }
        let _cycle = self.cycle.lock().await;
        let apdu = apdu::make(svc::DOMAIN_WRITE, domain);
        self.transport.broadcast(true, Priority::System, &apdu).await
    }

    /// Reads the domain addresses of all devices in programming mode.
    pub async fn read_domain_addresses(
        &self,
    ) -> Result<Vec<(IndividualAddress, Vec<u8>)>, Error> {
        let _cycle = self.cycle.lock().await;
        let mut events = self.transport.subscribe();
        let apdu = apdu::make(svc::DOMAIN_READ, &[]);
        self.transport.broadcast(true, Priority::System, &apdu).await?;
        let deadline = Instant::now() + self.response_timeout();
        let expected = Expected::from_any(svc::DOMAIN_RESPONSE, 2..=6);
        let mut domains = Vec::new();
        for (source, apdu) in self.collect_responses(&mut events, &expected, deadline).await? {
            let asdu = apdu::asdu(&apdu);
            if asdu.len() == 2 || asdu.len() == 6 {
                domains.push((source, asdu.to_vec()));
            } else {
                tracing::warn!(source = %source, len = asdu.len(), "odd domain address length");
            }
        }
        Ok(domains)
    }

    /// Selective domain address read on powerline: asks devices in
    /// `domain` with addresses in `start..start+range` to respond.
    pub async fn read_domain_address_selective(
        &self,
        domain: [u8; 2],
        start: IndividualAddress,
        range: u8,
    ) -> Result<Vec<(IndividualAddress, Vec<u8>)>, Error> {
        let _cycle = self.cycle.lock().await;
        let mut events = self.transport.subscribe();
        let mut asdu = Vec::with_capacity(5);
        asdu.extend_from_slice(&domain);
        asdu.extend_from_slice(&start.to_bytes());
        asdu.push(range);
        let apdu = apdu::make(svc::DOMAIN_SELECTIVE_READ, &asdu);
        self.transport.broadcast(true, Priority::System, &apdu).await?;
        let deadline = Instant::now() + self.response_timeout();
        let expected = Expected::from_any(svc::DOMAIN_RESPONSE, 2..=2);
        let responses = self.collect_responses(&mut events, &expected, deadline).await?;
        Ok(responses
            .into_iter()
            .map(|(source, apdu)| (source, apdu::asdu(&apdu).to_vec()))
            .collect())
    }

    // Point-to-point services.

    /// Reads a device descriptor of the given type (0..=63).
    pub async fn read_device_descriptor(
        &self,
        destination: &Arc<Destination>,
        descriptor_type: u8,
    ) -> Result<Vec<u8>, Error> {
        if descriptor_type > 63 {
            return Err(Error::IllegalArgument("descriptor type exceeds 63"));
        }
        let request = apdu::make(svc::DEVICE_DESC_READ | descriptor_type as u16, &[]);
        let expected = Expected::from_peer(
            svc::DEVICE_DESC_RESPONSE,
            destination.address(),
            1..=MAX_ASDU,
        );
        let response = self.transact(destination, &request, &expected).await?;
        if apdu::service_payload(&response) != descriptor_type {
            return Err(Error::invalid("descriptor type mismatch in response"));
        }
        Ok(apdu::asdu(&response).to_vec())
    }

    /// Reads descriptor type 0, the mask version.
    pub async fn read_device_descriptor0(
        &self,
        destination: &Arc<Destination>,
    ) -> Result<DeviceDescriptor, Error> {
        let raw = self.read_device_descriptor(destination, 0).await?;
        if raw.len() != 2 {
            return Err(Error::invalid("mask version must be 2 bytes"));
        }
        Ok(DeviceDescriptor::from_bytes([raw[0], raw[1]]))
    }

    /// Basic restart. No response is defined; for a connection-oriented
    /// destination the peer closes the connection while rebooting, which
    /// this call waits out before forcing a local disconnect.
    pub async fn restart(&self, destination: &Arc<Destination>) -> Result<(), Error> {
        let _cycle = self.cycle.lock().await;
        let request = apdu::make(svc::RESTART, &[0x00]);
        self.send_to(destination, &request).await?;
        self.await_peer_disconnect(destination).await;
        Ok(())
    }

    /// Master reset. Returns the worst-case time until the device is
    /// ready again; a non-zero erase status is reported as a remote
    /// error.
    pub async fn restart_master_reset(
        &self,
        destination: &Arc<Destination>,
        erase: EraseCode,
        channel: u8,
    ) -> Result<Duration, Error> {
        let _cycle = self.cycle.lock().await;
        let mut events = self.transport.subscribe();
        let request = apdu::make(svc::RESTART, &[0x01, erase as u8, channel]);
        self.send_to(destination, &request).await?;
        let deadline = Instant::now() + self.response_timeout();
        let expected = Expected::from_peer(svc::RESTART, destination.address(), 4..=4);
        let response = self
            .wait_response(&mut events, &expected, deadline, Some(destination))
            .await?
            .1;
        let asdu = apdu::asdu(&response);
        // Response bit 0x20 set on the echoed restart type.
        if asdu[0] != 0x21 {
            return Err(Error::invalid("restart response type mismatch"));
        }
        let process_time = Duration::from_secs(u16::from_be_bytes([asdu[2], asdu[3]]) as u64);
        let status = asdu[1];
        if let Some(reason) = erase_status(status) {
            return Err(Error::remote(reason));
        }
        self.await_peer_disconnect(destination).await;
        Ok(process_time)
    }

    /// Reads `elements` values of a property starting at `start`.
    pub async fn read_property(
        &self,
        destination: &Arc<Destination>,
        object_index: u8,
        property_id: u8,
        start: u16,
        elements: u8,
    ) -> Result<Vec<u8>, Error> {
        validate_property_args(start, elements)?;
        let request = apdu::make(
            svc::PROPERTY_READ,
            &apdu::property_asdu(object_index, property_id, start, elements),
        );
        let expected =
            Expected::from_peer(svc::PROPERTY_RESPONSE, destination.address(), 4..=MAX_ASDU);
        let response = self.transact(destination, &request, &expected).await?;
        let data = check_property_response(
            &response,
            object_index,
            property_id,
            start,
            elements,
        )?;
        Ok(data.to_vec())
    }

    /// Writes property values and verifies the echoed data. Properties
    /// that mutate on accept (load/run state controls) skip the
    /// comparison and their echoed state is returned instead.
    pub async fn write_property(
        &self,
        destination: &Arc<Destination>,
        object_index: u8,
        property_id: u8,
        start: u16,
        elements: u8,
        data: &[u8],
    ) -> Result<Vec<u8>, Error> {
        validate_property_args(start, elements)?;
        if data.is_empty() || data.len() > MAX_ASDU - 4 {
            return Err(Error::IllegalArgument("property data length out of range"));
        }
        let mut asdu = apdu::property_asdu(object_index, property_id, start, elements).to_vec();
        asdu.extend_from_slice(data);
        let request = apdu::make(svc::PROPERTY_WRITE, &asdu);
        let expected =
            Expected::from_peer(svc::PROPERTY_RESPONSE, destination.address(), 4..=MAX_ASDU);
        let response = self.transact(destination, &request, &expected).await?;
        let returned = check_property_response(
            &response,
            object_index,
            property_id,
            start,
            elements,
        )?;
        let mutates = matches!(property_id, pid::LOAD_STATE_CONTROL | pid::RUN_STATE_CONTROL);
        if !mutates && returned != data {
            return Err(Error::remote("property write: device stored different data"));
        }
        Ok(returned.to_vec())
    }

    /// Reads a property description, selecting by PID, or by property
    /// index when `property_id` is 0.
    pub async fn read_property_description(
        &self,
        destination: &Arc<Destination>,
        object_index: u8,
        property_id: u8,
        property_index: u8,
    ) -> Result<Description, Error> {
        let index = if property_id == 0 { property_index } else { 0 };
        let request = apdu::make(
            svc::PROPERTY_DESC_READ,
            &[object_index, property_id, index],
        );
        let expected = Expected::from_peer(
            svc::PROPERTY_DESC_RESPONSE,
            destination.address(),
            7..=7,
        );
        let response = self.transact(destination, &request, &expected).await?;
        let description = Description::from_bytes(apdu::asdu(&response))?;
        if description.object_index != object_index
            || (property_id != 0 && description.pid != property_id)
        {
            return Err(Error::invalid("property description for wrong property"));
        }
        Ok(description)
    }

    /// Reads up to 63 bytes of device memory. Memory services require a
    /// connection-oriented destination.
    pub async fn read_memory(
        &self,
        destination: &Arc<Destination>,
        start: u16,
        count: usize,
    ) -> Result<Vec<u8>, Error> {
        require_connection(destination)?;
        if count == 0 || count > 63 {
            return Err(Error::IllegalArgument("memory read length out of 1..=63"));
        }
        let request = apdu::make(svc::MEMORY_READ | count as u16, &start.to_be_bytes());
        let expected =
            Expected::from_peer(svc::MEMORY_RESPONSE, destination.address(), 2..=65);
        let response = self.transact(destination, &request, &expected).await?;
        let data = check_memory_response(&response, start)?;
        if data.is_empty() {
            return Err(Error::remote("memory read failed on device"));
        }
        if data.len() != count {
            return Err(Error::invalid("memory response length mismatch"));
        }
        Ok(data.to_vec())
    }

    /// Writes up to 63 bytes of device memory. On a destination in verify
    /// mode the device echoes the written range, which is compared
    /// against the submitted data.
    pub async fn write_memory(
        &self,
        destination: &Arc<Destination>,
        start: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        require_connection(destination)?;
        if data.is_empty() || data.len() > 63 {
            return Err(Error::IllegalArgument("memory write length out of 1..=63"));
        }
        let mut asdu = Vec::with_capacity(2 + data.len());
        asdu.extend_from_slice(&start.to_be_bytes());
        asdu.extend_from_slice(data);
        let request = apdu::make(svc::MEMORY_WRITE | data.len() as u16, &asdu);
        if !destination.verify_mode() {
            let _cycle = self.cycle.lock().await;
            return self.send_to(destination, &request).await;
        }
        let expected =
            Expected::from_peer(svc::MEMORY_RESPONSE, destination.address(), 2..=65);
        let response = self.transact(destination, &request, &expected).await?;
        let echoed = check_memory_response(&response, start)?;
        if echoed.is_empty() {
            return Err(Error::remote("memory write failed on device"));
        }
        if echoed != data {
            return Err(Error::remote("memory write verification failed"));
        }
        Ok(())
    }

    /// Reads an A/D converter channel, summing `repeat` samples.
    pub async fn read_adc(
        &self,
        destination: &Arc<Destination>,
        channel: u8,
        repeat: u8,
    ) -> Result<u16, Error> {
        require_connection(destination)?;
        if channel > 63 {
            return Err(Error::IllegalArgument("ADC channel exceeds 63"));
        }
        let request = apdu::make(svc::ADC_READ | channel as u16, &[repeat]);
        let expected = Expected::from_peer(svc::ADC_RESPONSE, destination.address(), 3..=3);
        let response = self.transact(destination, &request, &expected).await?;
        if apdu::service_payload(&response) != channel {
            return Err(Error::invalid("ADC channel mismatch in response"));
        }
        let asdu = apdu::asdu(&response);
        if asdu[0] == 0 {
            return Err(Error::remote("ADC read failed on device"));
        }
        Ok(u16::from_be_bytes([asdu[1], asdu[2]]))
    }

    /// Requests an access level with the given key. Returns the granted
    /// level, 0 being the highest.
    pub async fn authorize(
        &self,
        destination: &Arc<Destination>,
        key: [u8; 4],
    ) -> Result<u8, Error> {
        require_connection(destination)?;
        let mut asdu = [0u8; 5];
        asdu[1..].copy_from_slice(&key);
        let request = apdu::make(svc::AUTHORIZE_READ, &asdu);
        let expected =
            Expected::from_peer(svc::AUTHORIZE_RESPONSE, destination.address(), 1..=1);
        let response = self.transact(destination, &request, &expected).await?;
        let level = apdu::asdu(&response)[0];
        if level > 15 {
            return Err(Error::invalid("authorization level exceeds 15"));
        }
        Ok(level)
    }

    /// Sets the key for an access level. Returns the level the device
    /// granted the change for.
    pub async fn write_key(
        &self,
        destination: &Arc<Destination>,
        level: u8,
        key: [u8; 4],
    ) -> Result<u8, Error> {
        require_connection(destination)?;
        if level > 15 {
            return Err(Error::IllegalArgument("access level exceeds 15"));
        }
        let mut asdu = [0u8; 5];
        asdu[0] = level;
        asdu[1..].copy_from_slice(&key);
        let request = apdu::make(svc::KEY_WRITE, &asdu);
        let expected = Expected::from_peer(svc::KEY_RESPONSE, destination.address(), 1..=1);
        let response = self.transact(destination, &request, &expected).await?;
        let granted = apdu::asdu(&response)[0];
        if granted == 0xFF {
            return Err(Error::remote("key write refused"));
        }
        Ok(granted)
    }

    /// Reads a network parameter, unicast to one device or broadcast to
    /// all. Returns the responders with the bytes following the echoed
    /// (object type, PID) header.
    pub async fn read_network_parameter(
        &self,
        remote: Option<IndividualAddress>,
        object_type: u16,
        property_id: u8,
        test_info: &[u8],
    ) -> Result<Vec<(IndividualAddress, Vec<u8>)>, Error> {
        if test_info.len() > MAX_ASDU - 3 {
            return Err(Error::IllegalArgument("network parameter test info too long"));
        }
        let _cycle = self.cycle.lock().await;
        let mut events = self.transport.subscribe();
        let mut asdu = Vec::with_capacity(3 + test_info.len());
        asdu.extend_from_slice(&object_type.to_be_bytes());
        asdu.push(property_id);
        asdu.extend_from_slice(test_info);
        let request = apdu::make(svc::NETWORK_PARAM_READ, &asdu);
        match remote {
            Some(address) => {
                self.transport.send_data(address, Priority::Low, &request).await?
            }
            None => self.transport.broadcast(true, Priority::System, &request).await?,
        }
        let deadline = Instant::now() + self.response_timeout();
        let expected = Expected {
            service: svc::NETWORK_PARAM_RESPONSE,
            from: remote,
            min_asdu: 3,
            max_asdu: MAX_ASDU,
        };
        let raw = if remote.is_some() {
            vec![self.wait_response(&mut events, &expected, deadline, None).await?]
        } else {
            self.collect_responses(&mut events, &expected, deadline).await?
        };
        let mut responses = Vec::new();
        for (source, apdu) in raw {
            let asdu = apdu::asdu(&apdu);
            if apdu::network_param_object_type(asdu) != Some(object_type) || asdu[2] != property_id
            {
                tracing::warn!(source = %source, "network parameter response for wrong parameter");
                continue;
            }
            responses.push((source, asdu[3..].to_vec()));
        }
        Ok(responses)
    }

    /// Writes a network parameter, unicast or broadcast. No response is
    /// defined.
    pub async fn write_network_parameter(
        &self,
        remote: Option<IndividualAddress>,
        object_type: u16,
        property_id: u8,
        value: &[u8],
    ) -> Result<(), Error> {
        if value.is_empty() || value.len() > MAX_ASDU - 3 {
            return Err(Error::IllegalArgument("network parameter value length out of range"));
        }
        let _cycle = self.cycle.lock().await;
        let mut asdu = Vec::with_capacity(3 + value.len());
        asdu.extend_from_slice(&object_type.to_be_bytes());
        asdu.push(property_id);
        asdu.extend_from_slice(value);
        let request = apdu::make(svc::NETWORK_PARAM_WRITE, &asdu);
        match remote {
            Some(address) => self.transport.send_data(address, Priority::Low, &request).await,
            None => self.transport.broadcast(true, Priority::System, &request).await,
        }
    }

    /// Reads the serial numbers reachable through `destination` within
    /// `window`, the collection step of a serial-number scan. The read
    /// goes out once; every device answering with a serial-number
    /// property response is collected, whatever its source address.
    pub async fn read_serial_numbers(
        &self,
        destination: &Arc<Destination>,
        window: Duration,
    ) -> Result<Vec<(IndividualAddress, SerialNumber)>, Error> {
        let _cycle = self.cycle.lock().await;
        let mut events = self.transport.subscribe();
        let request = apdu::make(
            svc::PROPERTY_READ,
            &apdu::property_asdu(0, pid::SERIAL_NUMBER, 1, 1),
        );
        match self.send_to(destination, &request).await {
            Ok(()) => {}
            // Nobody serves the default address: an empty installation.
            Err(Error::Disconnect { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        let deadline = Instant::now() + window;
        let expected = Expected::from_any(svc::PROPERTY_RESPONSE, 10..=10);
        let mut serials = Vec::new();
        for (source, apdu) in self.collect_responses(&mut events, &expected, deadline).await? {
            let Some((fields, data)) = apdu::parse_property_asdu(apdu::asdu(&apdu)) else {
                continue;
            };
            if fields.pid != pid::SERIAL_NUMBER || data.len() != 6 {
                continue;
            }
            let serial = SerialNumber::new(data.try_into().unwrap());
            if !serials.contains(&(source, serial)) {
                serials.push((source, serial));
            }
        }
        Ok(serials)
    }

    // Request plumbing.

    /// Sends point-to-point following the destination's mode.
    async fn send_to(&self, destination: &Arc<Destination>, apdu: &[u8]) -> Result<(), Error> {
        if destination.is_connection_oriented() {
            self.transport
                .send_connected(destination, Priority::Low, apdu)
                .await
        } else {
            self.transport
                .send_data(destination.address(), Priority::Low, apdu)
                .await
        }
    }

    /// One serialized request/response cycle against a destination.
    async fn transact(
        &self,
        destination: &Arc<Destination>,
        request: &[u8],
        expected: &Expected,
    ) -> Result<Vec<u8>, Error> {
        let _cycle = self.cycle.lock().await;
        let mut events = self.transport.subscribe();
        self.send_to(destination, request).await?;
        let deadline = Instant::now() + self.response_timeout();
        let (_, apdu) = self
            .wait_response(&mut events, expected, deadline, Some(destination))
            .await?;
        Ok(apdu)
    }

    /// Waits for the first frame matching `expected`. A connection
    /// teardown of `peer` or a transport detach aborts the wait.
    async fn wait_response(
        &self,
        events: &mut broadcast::Receiver<TransportEvent>,
        expected: &Expected,
        deadline: Instant,
        peer: Option<&Arc<Destination>>,
    ) -> Result<(IndividualAddress, Vec<u8>), Error> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout("management service response"));
            }
            match timeout(deadline - now, events.recv()).await {
                Err(_) => return Err(Error::Timeout("management service response")),
                Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                    tracing::warn!(missed, "management client lagging behind transport events");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(Error::Interrupted),
                Ok(Ok(event)) => match event {
                    TransportEvent::Connected(frame)
                    | TransportEvent::Individual(frame)
                    | TransportEvent::Broadcast(frame) => {
                        if let Some(apdu) = match_frame(&frame, expected)? {
                            return Ok((frame.source, apdu));
                        }
                    }
                    TransportEvent::Disconnected { address, initiator } => {
                        if let Some(peer) = peer {
                            if peer.is_connection_oriented() && peer.address() == address {
                                return Err(Error::Disconnect { address, initiator });
                            }
                        }
                    }
                    TransportEvent::Detached => return Err(Error::Interrupted),
                    TransportEvent::Group(_) => {}
                },
            }
        }
    }

    /// Accumulates every frame matching `expected` until the deadline.
    /// Running out the clock is not an error here; frames with violating
    /// lengths are logged and skipped.
    async fn collect_responses(
        &self,
        events: &mut broadcast::Receiver<TransportEvent>,
        expected: &Expected,
        deadline: Instant,
    ) -> Result<Vec<(IndividualAddress, Vec<u8>)>, Error> {
        let mut collected = Vec::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(collected);
            }
            match timeout(deadline - now, events.recv()).await {
                Err(_) => return Ok(collected),
                Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                    tracing::warn!(missed, "management client lagging behind transport events");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(Error::Interrupted),
                Ok(Ok(event)) => match event {
                    TransportEvent::Connected(frame)
                    | TransportEvent::Individual(frame)
                    | TransportEvent::Broadcast(frame) => match match_frame(&frame, expected) {
                        Ok(Some(apdu)) => collected.push((frame.source, apdu)),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(source = %frame.source, error = %e, "dropping response");
                        }
                    },
                    TransportEvent::Detached => return Err(Error::Interrupted),
                    _ => {}
                },
            }
        }
    }

    /// After a restart, a connection-oriented peer closes the connection
    /// on its own; wait that out, then force the local side down.
    async fn await_peer_disconnect(&self, destination: &Arc<Destination>) {
        if !destination.is_connection_oriented() {
            return;
        }
        let mut watch = destination.state_watch();
        let wait = async {
            loop {
                if matches!(
                    *watch.borrow_and_update(),
                    ConnState::Disconnected | ConnState::Destroyed
                ) {
                    break;
                }
                if watch.changed().await.is_err() {
                    break;
                }
            }
        };
        let _ = timeout(self.transport.config().idle_timeout, wait).await;
        let _ = self.transport.disconnect(destination).await;
    }
}

impl fmt::Debug for ManagementClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementClient")
            .field("transport", &self.transport)
            .field("response_timeout", &self.response_timeout())
            .finish()
    }
}

fn require_connection(destination: &Destination) -> Result<(), Error> {
    if !destination.is_connection_oriented() {
        return Err(Error::IllegalArgument(
            "service requires a connection-oriented destination",
        ));
    }
    Ok(())
}

fn validate_property_args(start: u16, elements: u8) -> Result<(), Error> {
    if start > 0x0FFF {
        return Err(Error::IllegalArgument("property start index exceeds 0xFFF"));
    }
    if elements == 0 || elements > 15 {
        return Err(Error::IllegalArgument("property element count out of 1..=15"));
    }
    Ok(())
}

/// Applies the response filter. `Ok(None)` means "not ours, keep
/// waiting"; a length violation on an otherwise matching frame is a
/// protocol error.
fn match_frame(frame: &FrameEvent, expected: &Expected) -> Result<Option<Vec<u8>>, Error> {
    let Some(apdu) = apdu::from_tpdu(&frame.tpdu) else {
        return Ok(None);
    };
    if apdu::service(&apdu) != Some(expected.service) {
        return Ok(None);
    }
    if let Some(from) = expected.from {
        if frame.source != from {
            return Ok(None);
        }
    }
    let len = apdu.len() - 2;
    if len < expected.min_asdu || len > expected.max_asdu {
        return Err(Error::invalid(format!(
            "ASDU length {len} outside {}..={}",
            expected.min_asdu, expected.max_asdu
        )));
    }
    Ok(Some(apdu))
}

/// Validates the header of a property response against the request and
/// returns the data. A granted element count of zero is the device
/// refusing access.
fn check_property_response<'a>(
    response: &'a [u8],
    object_index: u8,
    property_id: u8,
    start: u16,
    elements: u8,
) -> Result<&'a [u8], Error> {
    let Some((fields, data)) = apdu::parse_property_asdu(apdu::asdu(response)) else {
        return Err(Error::invalid("truncated property response"));
    };
    if fields.object_index != object_index || fields.pid != property_id || fields.start != start {
        return Err(Error::invalid("property response for wrong property"));
    }
    if fields.elements == 0 {
        return Err(Error::remote("property access denied"));
    }
    if fields.elements != elements {
        return Err(Error::invalid("property response element count mismatch"));
    }
    if data.is_empty() {
        return Err(Error::invalid("property response carries no data"));
    }
    Ok(data)
}

/// Validates a memory response echo and returns the data bytes. An echoed
/// count of zero (empty data) signals a device-side failure, which the
/// caller maps to its service-specific error.
fn check_memory_response<'a>(response: &'a [u8], start: u16) -> Result<&'a [u8], Error> {
    let asdu = apdu::asdu(response);
    if asdu.len() < 2 {
        return Err(Error::invalid("truncated memory response"));
    }
    if u16::from_be_bytes([asdu[0], asdu[1]]) != start {
        return Err(Error::invalid("memory response for wrong address"));
    }
    let data = &asdu[2..];
    if data.len() != apdu::service_payload(response) as usize {
        return Err(Error::invalid("memory response count disagrees with data"));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_number_formats_as_hex_pairs() {
        let serial = SerialNumber::new([0x00, 0xFA, 0x12, 0x34, 0x56, 0x78]);
        assert_eq!(serial.to_string(), "00:fa:12:34:56:78");
    }

    #[test]
    fn device_descriptor_fields() {
        let descriptor = DeviceDescriptor::from_bytes([0x07, 0xB0]);
        assert_eq!(descriptor.to_string(), "07B0");
        assert_eq!(descriptor.medium_type(), 0);
        assert_eq!(descriptor.firmware_type(), 7);
        assert_eq!(descriptor.version(), 0xB0);
    }

    #[test]
    fn property_response_checks() {
        // Granted count zero: access denied.
        let denied = apdu::make(svc::PROPERTY_RESPONSE, &[0, 11, 0x01, 0x01]);
        assert!(matches!(
            check_property_response(&denied, 0, 11, 1, 1),
            Err(Error::Remote(_))
        ));

        // Count differing from the request: invalid response.
        let twice = apdu::make(svc::PROPERTY_RESPONSE, &[0, 11, 0x21, 0x01, 0xAB, 0xCD]);
        assert!(matches!(
            check_property_response(&twice, 0, 11, 1, 1),
            Err(Error::InvalidResponse(_))
        ));

        // Matching response returns the data.
        let good = apdu::make(svc::PROPERTY_RESPONSE, &[0, 11, 0x11, 0x01, 0xAB]);
        assert_eq!(check_property_response(&good, 0, 11, 1, 1).unwrap(), &[0xAB]);

        // Wrong object index.
        assert!(matches!(
            check_property_response(&good, 1, 11, 1, 1),
            Err(Error::InvalidResponse(_))
        ));
    }

    #[test]
    fn memory_response_checks() {
        let good = apdu::make(svc::MEMORY_RESPONSE | 2, &[0x00, 0x60, 0xDE, 0xAD]);
        assert_eq!(check_memory_response(&good, 0x0060).unwrap(), &[0xDE, 0xAD]);

        let failed = apdu::make(svc::MEMORY_RESPONSE, &[0x00, 0x60]);
        assert_eq!(check_memory_response(&failed, 0x0060).unwrap(), &[] as &[u8]);

        let wrong_addr = apdu::make(svc::MEMORY_RESPONSE | 2, &[0x00, 0x61, 0xDE, 0xAD]);
        assert!(check_memory_response(&wrong_addr, 0x0060).is_err());

        let short_count = apdu::make(svc::MEMORY_RESPONSE | 3, &[0x00, 0x60, 0xDE, 0xAD]);
        assert!(check_memory_response(&short_count, 0x0060).is_err());
    }

    #[test]
    fn erase_status_table() {
        assert!(erase_status(0).is_none());
        assert!(erase_status(1).unwrap().contains("access denied"));
        assert!(erase_status(2).unwrap().contains("unsupported"));
        assert!(erase_status(3).unwrap().contains("invalid channel"));
        assert!(erase_status(9).unwrap().contains("unknown"));
    }

    mod response_filter {
        use super::*;
        use crate::address::KnxAddress;

        fn frame(tpdu: Vec<u8>, source: IndividualAddress) -> FrameEvent {
            FrameEvent {
                source,
                destination: KnxAddress::Individual(IndividualAddress::new(0, 0, 1)),
                priority: Priority::Low,
                tpdu,
                received: Instant::now(),
            }
        }

        const PEER: IndividualAddress = IndividualAddress::new(1, 1, 5);
        const OTHER: IndividualAddress = IndividualAddress::new(1, 1, 9);

        #[test]
        fn matching_frame_is_returned() {
            let expected = Expected::from_peer(svc::PROPERTY_RESPONSE, PEER, 4..=10);
            let tpdu = apdu::make(svc::PROPERTY_RESPONSE, &[0, 11, 0x11, 0x01, 0xAB]);
            let matched = match_frame(&frame(tpdu.clone(), PEER), &expected).unwrap();
            assert_eq!(matched, Some(tpdu));
        }

        #[test]
        fn wrong_service_or_sender_keeps_waiting() {
            let expected = Expected::from_peer(svc::PROPERTY_RESPONSE, PEER, 4..=10);
            let wrong_service = apdu::make(svc::PROPERTY_DESC_RESPONSE, &[0; 7]);
            assert_eq!(
                match_frame(&frame(wrong_service, PEER), &expected).unwrap(),
                None
            );
            let wrong_sender = apdu::make(svc::PROPERTY_RESPONSE, &[0, 11, 0x11, 0x01, 0xAB]);
            assert_eq!(
                match_frame(&frame(wrong_sender, OTHER), &expected).unwrap(),
                None
            );
        }

        #[test]
        fn matching_frame_with_bad_length_is_a_violation() {
            let expected = Expected::from_peer(svc::PROPERTY_RESPONSE, PEER, 4..=4);
            let oversized = apdu::make(svc::PROPERTY_RESPONSE, &[0, 11, 0x11, 0x01, 0xAB]);
            assert!(matches!(
                match_frame(&frame(oversized, PEER), &expected),
                Err(Error::InvalidResponse(_))
            ));
        }

        #[test]
        fn broadcast_filter_accepts_any_sender() {
            let expected = Expected::from_any(svc::IND_ADDR_RESPONSE, 0..=0);
            let tpdu = apdu::make(svc::IND_ADDR_RESPONSE, &[]);
            assert!(match_frame(&frame(tpdu.clone(), PEER), &expected)
                .unwrap()
                .is_some());
            assert!(match_frame(&frame(tpdu, OTHER), &expected)
                .unwrap()
                .is_some());
        }
    }
}
