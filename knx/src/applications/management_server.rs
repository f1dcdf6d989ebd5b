//! An in-memory KNX device serving the management protocol.
//!
//! The server attaches to a [`Bus`], runs a transport layer in
//! serve-incoming mode, and answers the management services from a small
//! device model: serial number, mask version, programming-mode flag, a
//! device-object property set, and a memory image. It exists so scenarios
//! can exercise the client stack against believable peers; it is not a
//! product device.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use knx_core::links::{Bus, BusLink};
use knx_core::management::apdu::{self, svc};
use knx_core::property::{pid, Description};
use knx_core::transport::{TransportConfig, TransportEvent, TransportLayer};
use knx_core::{
    FrameEvent, IndividualAddress, NetworkLink, Priority, SerialNumber, SharedLink,
};

/// How a [`ManagementServer`] presents itself on the bus.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub address: IndividualAddress,
    pub serial: SerialNumber,
    /// Mask version reported as device descriptor type 0.
    pub descriptor: u16,
    pub programming_mode: bool,
    /// Refuse transport connections, like a device that only speaks
    /// connectionless.
    pub connectionless_only: bool,
    /// Whether the device object carries the programming-mode property;
    /// without it, clients fall back to the memory location.
    pub has_progmode_property: bool,
    pub max_apdu_length: u16,
    pub memory_size: usize,
    /// Key granting access level 0; any key is accepted when unset.
    pub auth_key: Option<[u8; 4]>,
    pub domain: [u8; 2],
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: IndividualAddress::DEFAULT_DEVICE,
            serial: SerialNumber::new([0; 6]),
            descriptor: 0x07B0,
            programming_mode: false,
            connectionless_only: false,
            has_progmode_property: true,
            max_apdu_length: 15,
            memory_size: 256,
            auth_key: None,
            domain: [0, 0],
        }
    }
}

struct DeviceState {
    serial: SerialNumber,
    descriptor: u16,
    programming_mode: AtomicBool,
    has_progmode_property: bool,
    max_apdu_length: u16,
    device_control: AtomicU8,
    auth_key: Option<[u8; 4]>,
    domain: Mutex<[u8; 2]>,
    memory: Mutex<Vec<u8>>,
}

/// The running device.
pub struct ManagementServer {
    link: Arc<BusLink>,
    transport: Arc<TransportLayer>,
    state: Arc<DeviceState>,
}

impl ManagementServer {
    /// Attaches the device to the bus and starts serving. Must be called
    /// from within a tokio runtime.
    pub fn start(bus: &Bus, config: DeviceConfig) -> Self {
        let link = bus.attach(config.address);
        let shared: SharedLink = link.clone();
        let transport = TransportLayer::new(
            shared,
            TransportConfig {
                serve_incoming: !config.connectionless_only,
                ..Default::default()
            },
        );
        let state = Arc::new(DeviceState {
            serial: config.serial,
            descriptor: config.descriptor,
            programming_mode: AtomicBool::new(config.programming_mode),
            has_progmode_property: config.has_progmode_property,
            max_apdu_length: config.max_apdu_length,
            device_control: AtomicU8::new(0),
            auth_key: config.auth_key,
            domain: Mutex::new(config.domain),
            memory: Mutex::new(vec![0; config.memory_size]),
        });
        tokio::spawn(run(transport.clone(), link.clone(), state.clone()));
        Self {
            link,
            transport,
            state,
        }
    }

    pub fn address(&self) -> IndividualAddress {
        self.link.medium().address
    }

    pub fn serial(&self) -> SerialNumber {
        self.state.serial
    }

    pub fn programming_mode(&self) -> bool {
        self.state.programming_mode.load(Ordering::SeqCst)
    }

    pub fn set_programming_mode(&self, on: bool) {
        self.state.programming_mode.store(on, Ordering::SeqCst);
    }

    /// A copy of the device memory in the given range, for assertions.
    pub fn memory_at(&self, start: u16, len: usize) -> Vec<u8> {
        let memory = self.state.memory.lock().unwrap();
        memory[start as usize..start as usize + len].to_vec()
    }

    /// Takes the device off the bus.
    pub async fn stop(&self) {
        self.transport.detach().await;
        self.link.close().await;
    }
}

async fn run(transport: Arc<TransportLayer>, link: Arc<BusLink>, state: Arc<DeviceState>) {
    let mut events = transport.subscribe();
    loop {
        match events.recv().await {
            Ok(TransportEvent::Connected(frame)) => {
                serve_p2p(&transport, &state, frame, true).await;
            }
            Ok(TransportEvent::Individual(frame)) => {
                serve_p2p(&transport, &state, frame, false).await;
            }
            Ok(TransportEvent::Broadcast(frame)) => {
                serve_broadcast(&transport, &link, &state, frame).await;
            }
            Ok(TransportEvent::Detached) => break,
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "device lagging behind its transport");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn serve_p2p(
    transport: &Arc<TransportLayer>,
    state: &DeviceState,
    frame: FrameEvent,
    connected: bool,
) {
    let Some(request) = apdu::from_tpdu(&frame.tpdu) else {
        return;
    };
    let Some(service) = apdu::service(&request) else {
        return;
    };
    let mut drop_connection = false;
    let reply = match service {
        svc::DEVICE_DESC_READ => {
            let descriptor_type = apdu::service_payload(&request);
            (descriptor_type == 0).then(|| {
                apdu::make(svc::DEVICE_DESC_RESPONSE, &state.descriptor.to_be_bytes())
            })
        }
        svc::PROPERTY_READ => state.property_read(&request),
        svc::PROPERTY_WRITE => state.property_write(&request),
        svc::PROPERTY_DESC_READ => state.property_describe(&request),
        svc::MEMORY_READ => state.memory_read(&request),
        svc::MEMORY_WRITE => state.memory_write(&request),
        svc::ADC_READ => {
            let channel = apdu::service_payload(&request);
            let repeat = apdu::asdu(&request).first().copied().unwrap_or(0);
            if repeat == 0 {
                Some(apdu::make(svc::ADC_RESPONSE | channel as u16, &[0, 0, 0]))
            } else {
                // A deterministic stand-in for a converter reading.
                let sum = ((channel as u16) << 8) | repeat as u16;
                let mut asdu = vec![repeat];
                asdu.extend_from_slice(&sum.to_be_bytes());
                Some(apdu::make(svc::ADC_RESPONSE | channel as u16, &asdu))
            }
        }
        svc::AUTHORIZE_READ => {
            let asdu = apdu::asdu(&request);
            (asdu.len() == 5).then(|| {
                let key: [u8; 4] = asdu[1..5].try_into().unwrap();
                let level = match state.auth_key {
                    Some(expected) if expected != key => 15,
                    _ => 0,
                };
                apdu::make(svc::AUTHORIZE_RESPONSE, &[level])
            })
        }
        svc::KEY_WRITE => {
            let level = apdu::asdu(&request).first().copied().unwrap_or(15);
            Some(apdu::make(svc::KEY_RESPONSE, &[level]))
        }
        svc::RESTART => {
            let asdu = apdu::asdu(&request);
            drop_connection = connected;
            state.programming_mode.store(false, Ordering::SeqCst);
            if asdu.first() == Some(&0x01) {
                let erase = asdu.get(1).copied().unwrap_or(0);
                let status = if (1..=7).contains(&erase) { 0 } else { 2 };
                Some(apdu::make(svc::RESTART, &[0x21, status, 0x00, 0x05]))
            } else {
                None
            }
        }
        svc::NETWORK_PARAM_READ => state.network_param_reply(apdu::asdu(&request)),
        _ => None,
    };

    if let Some(reply) = reply {
        let result = if connected {
            match transport.get_destination(frame.source) {
                Some(destination) => {
                    transport
                        .send_connected(&destination, Priority::Low, &reply)
                        .await
                }
                None => Ok(()),
            }
        } else {
            transport.send_data(frame.source, Priority::Low, &reply).await
        };
        if let Err(e) = result {
            tracing::debug!(peer = %frame.source, error = %e, "device reply failed");
        }
    }
    if drop_connection {
        if let Some(destination) = transport.get_destination(frame.source) {
            let _ = transport.disconnect(&destination).await;
        }
    }
}

async fn serve_broadcast(
    transport: &Arc<TransportLayer>,
    link: &Arc<BusLink>,
    state: &DeviceState,
    frame: FrameEvent,
) {
    let Some(request) = apdu::from_tpdu(&frame.tpdu) else {
        return;
    };
    let Some(service) = apdu::service(&request) else {
        return;
    };
    let asdu = apdu::asdu(&request);
    let programming = state.programming_mode.load(Ordering::SeqCst);
    let reply = match service {
        svc::IND_ADDR_READ if programming => Some(apdu::make(svc::IND_ADDR_RESPONSE, &[])),
        svc::IND_ADDR_WRITE if programming && asdu.len() == 2 => {
            link.set_address(IndividualAddress::from_bytes([asdu[0], asdu[1]]));
            None
        }
        svc::IND_ADDR_SN_READ if asdu == state.serial.as_bytes().as_slice() => {
            let mut response = Vec::with_capacity(10);
            response.extend_from_slice(state.serial.as_bytes());
            response.extend_from_slice(&*state.domain.lock().unwrap());
            response.extend_from_slice(&[0, 0]);
            Some(apdu::make(svc::IND_ADDR_SN_RESPONSE, &response))
        }
        svc::IND_ADDR_SN_WRITE
            if asdu.len() == 12 && asdu[..6] == state.serial.as_bytes()[..] =>
        {
            link.set_address(IndividualAddress::from_bytes([asdu[6], asdu[7]]));
            None
        }
        svc::DOMAIN_WRITE if programming && asdu.len() == 2 => {
            *state.domain.lock().unwrap() = [asdu[0], asdu[1]];
            None
        }
        svc::DOMAIN_READ if programming => {
            Some(apdu::make(svc::DOMAIN_RESPONSE, &*state.domain.lock().unwrap()))
        }
        svc::DOMAIN_SELECTIVE_READ if asdu.len() == 5 => {
            let domain_matches = asdu[..2] == state.domain.lock().unwrap()[..];
            let start = u16::from_be_bytes([asdu[2], asdu[3]]);
            let range = asdu[4] as u32;
            let own = link.medium().address.raw() as u32;
            if domain_matches && own >= start as u32 && own < start as u32 + range {
                Some(apdu::make(svc::DOMAIN_RESPONSE, &*state.domain.lock().unwrap()))
            } else {
                None
            }
        }
        _ => None,
    };
    if let Some(reply) = reply {
        if let Err(e) = transport.broadcast(true, Priority::System, &reply).await {
            tracing::debug!(error = %e, "device broadcast reply failed");
        }
        return;
    }

    // Network parameter reads are answered point-to-point.
    if service == svc::NETWORK_PARAM_READ {
        if let Some(reply) = state.network_param_reply(asdu) {
            if let Err(e) = transport.send_data(frame.source, Priority::Low, &reply).await {
                tracing::debug!(error = %e, "network parameter reply failed");
            }
        }
    }
}

impl DeviceState {
    fn network_param_reply(&self, asdu: &[u8]) -> Option<Vec<u8>> {
        if asdu.len() < 3 {
            return None;
        }
        let object_type = apdu::network_param_object_type(asdu)?;
        if object_type != 0 || asdu[2] != pid::SERIAL_NUMBER {
            return None;
        }
        let mut response = asdu.to_vec();
        response.extend_from_slice(self.serial.as_bytes());
        Some(apdu::make(svc::NETWORK_PARAM_RESPONSE, &response))
    }

    fn property_value(&self, property_id: u8) -> Option<Vec<u8>> {
        match property_id {
            pid::OBJECT_TYPE => Some(vec![0, 0]),
            pid::SERIAL_NUMBER => Some(self.serial.as_bytes().to_vec()),
            pid::MAX_APDULENGTH => Some(self.max_apdu_length.to_be_bytes().to_vec()),
            pid::DEVICE_CONTROL => Some(vec![self.device_control.load(Ordering::SeqCst)]),
            pid::PROGMODE if self.has_progmode_property => {
                Some(vec![self.programming_mode.load(Ordering::SeqCst) as u8])
            }
            _ => None,
        }
    }

    fn property_denied(&self, fields: apdu::PropertyFields) -> Vec<u8> {
        apdu::make(
            svc::PROPERTY_RESPONSE,
            &apdu::property_asdu(fields.object_index, fields.pid, fields.start, 0),
        )
    }

    fn property_reply(&self, fields: apdu::PropertyFields, data: &[u8]) -> Vec<u8> {
        let mut asdu =
            apdu::property_asdu(fields.object_index, fields.pid, fields.start, fields.elements)
                .to_vec();
        asdu.extend_from_slice(data);
        apdu::make(svc::PROPERTY_RESPONSE, &asdu)
    }

    fn property_read(&self, request: &[u8]) -> Option<Vec<u8>> {
        let (fields, _) = apdu::parse_property_asdu(apdu::asdu(request))?;
        if fields.object_index != 0 || fields.elements != 1 {
            return Some(self.property_denied(fields));
        }
        match fields.start {
            // Element 0 holds the current element count.
            0 => match self.property_value(fields.pid) {
                Some(_) => Some(self.property_reply(fields, &[0, 1])),
                None => Some(self.property_denied(fields)),
            },
            1 => match self.property_value(fields.pid) {
                Some(value) => Some(self.property_reply(fields, &value)),
                None => Some(self.property_denied(fields)),
            },
            _ => Some(self.property_denied(fields)),
        }
    }

    fn property_write(&self, request: &[u8]) -> Option<Vec<u8>> {
        let (fields, data) = apdu::parse_property_asdu(apdu::asdu(request))?;
        if fields.object_index != 0 || fields.elements != 1 || fields.start != 1 {
            return Some(self.property_denied(fields));
        }
        match fields.pid {
            pid::PROGMODE if self.has_progmode_property && data.len() == 1 => {
                self.programming_mode.store(data[0] & 0x01 != 0, Ordering::SeqCst);
                Some(self.property_reply(fields, data))
            }
            pid::DEVICE_CONTROL if data.len() == 1 => {
                self.device_control.store(data[0], Ordering::SeqCst);
                Some(self.property_reply(fields, data))
            }
            _ => Some(self.property_denied(fields)),
        }
    }

    /// The device object's properties in index order.
    fn property_ids(&self) -> Vec<u8> {
        let mut ids = vec![pid::OBJECT_TYPE, pid::SERIAL_NUMBER, pid::DEVICE_CONTROL];
        if self.has_progmode_property {
            ids.push(pid::PROGMODE);
        }
        ids.push(pid::MAX_APDULENGTH);
        ids
    }

    fn property_describe(&self, request: &[u8]) -> Option<Vec<u8>> {
        let asdu = apdu::asdu(request);
        if asdu.len() != 3 || asdu[0] != 0 {
            return None;
        }
        let ids = self.property_ids();
        // PID 0 selects by property index instead.
        let (property_id, index) = if asdu[1] == 0 {
            let index = asdu[2];
            (*ids.get(index as usize)?, index)
        } else {
            let index = ids.iter().position(|&id| id == asdu[1])?;
            (asdu[1], index as u8)
        };
        let writable = matches!(property_id, pid::PROGMODE | pid::DEVICE_CONTROL);
        let description = Description {
            object_index: 0,
            pid: property_id,
            property_index: index,
            write_enabled: writable,
            pdt: match property_id {
                pid::SERIAL_NUMBER => 0x16,
                pid::MAX_APDULENGTH => 0x04,
                _ => 0x02,
            },
            max_elements: 1,
            read_level: 3,
            write_level: if writable { 3 } else { 0 },
        };
        Some(apdu::make(svc::PROPERTY_DESC_RESPONSE, &description.to_bytes()))
    }

    fn memory_read(&self, request: &[u8]) -> Option<Vec<u8>> {
        let count = apdu::service_payload(request) as usize;
        let asdu = apdu::asdu(request);
        if asdu.len() != 2 {
            return None;
        }
        let start = u16::from_be_bytes([asdu[0], asdu[1]]) as usize;
        let memory = self.memory.lock().unwrap();
        if start + count > memory.len() {
            return Some(apdu::make(svc::MEMORY_RESPONSE, asdu));
        }
        let mut response = asdu.to_vec();
        response.extend_from_slice(&memory[start..start + count]);
        Some(apdu::make(svc::MEMORY_RESPONSE | count as u16, &response))
    }

    fn memory_write(&self, request: &[u8]) -> Option<Vec<u8>> {
        let count = apdu::service_payload(request) as usize;
        let asdu = apdu::asdu(request);
        if asdu.len() != 2 + count {
            return None;
        }
        let start = u16::from_be_bytes([asdu[0], asdu[1]]) as usize;
        let data = &asdu[2..];
        let echo = self.device_control.load(Ordering::SeqCst) & 0x04 != 0;
        {
            let mut memory = self.memory.lock().unwrap();
            if start + count > memory.len() {
                return Some(apdu::make(svc::MEMORY_RESPONSE, &asdu[..2]));
            }
            memory[start..start + count].copy_from_slice(data);
        }
        // The programming-mode flag shadows its memory location.
        if (start..start + count).contains(&0x60) {
            let mode = data[0x60 - start] & 0x01 != 0;
            self.programming_mode.store(mode, Ordering::SeqCst);
        }
        echo.then(|| apdu::make(svc::MEMORY_RESPONSE | count as u16, asdu))
    }
}
