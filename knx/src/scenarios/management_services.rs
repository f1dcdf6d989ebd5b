//! Point-to-point management services against an in-memory device.

use std::sync::Arc;
use std::time::Duration;

use knx_core::transport::ConnState;
use knx_core::{
    Error, EraseCode, IndividualAddress, KnxMedium, NetworkLink, PropertyClient,
    RemotePropertyAdapter, SerialNumber,
};
use knx_core::links::Bus;

use super::support::{client, next_tpdu};
use crate::applications::{DeviceConfig, ManagementServer};

const CLIENT: IndividualAddress = IndividualAddress::new(1, 1, 1);
const DEVICE: IndividualAddress = IndividualAddress::new(1, 1, 5);
const SERIAL: [u8; 6] = [0x00, 0xFA, 0x10, 0x20, 0x30, 0x40];

fn device(bus: &Bus) -> ManagementServer {
    ManagementServer::start(
        bus,
        DeviceConfig {
            address: DEVICE,
            serial: SerialNumber::new(SERIAL),
            ..Default::default()
        },
    )
}

/// Reads the serial-number property; the request APDU is checked byte by
/// byte on a bus monitor.
pub async fn property_read() {
    let bus = Bus::new(KnxMedium::Tp1);
    let _device = device(&bus);
    let (_link, _transport, mc) = client(&bus, CLIENT);
    let monitor = bus.attach(IndividualAddress::new(0, 0, 250));
    let mut monitor_rx = monitor.subscribe();

    let destination = mc.create_destination(DEVICE, true).unwrap();
    let data = mc.read_property(&destination, 0, 11, 1, 1).await.unwrap();
    assert_eq!(data, SERIAL);

    // Connect, then the numbered request with sequence 0.
    assert_eq!(next_tpdu(&mut monitor_rx, CLIENT).await, vec![0x80]);
    assert_eq!(
        next_tpdu(&mut monitor_rx, CLIENT).await,
        vec![0x43, 0xD5, 0x00, 0x0B, 0x10, 0x01]
    );
}

/// A property the device does not carry comes back as granted-count zero,
/// which the client reports as a remote error.
pub async fn property_denied() {
    let bus = Bus::new(KnxMedium::Tp1);
    let _device = device(&bus);
    let (_link, _transport, mc) = client(&bus, CLIENT);

    let destination = mc.create_destination(DEVICE, true).unwrap();
    let result = mc.read_property(&destination, 0, 200, 1, 1).await;
    assert!(matches!(result, Err(Error::Remote(_))));
}

/// Property descriptions decode the full 7-byte structure.
pub async fn property_description() {
    let bus = Bus::new(KnxMedium::Tp1);
    let _device = device(&bus);
    let (_link, _transport, mc) = client(&bus, CLIENT);

    let destination = mc.create_destination(DEVICE, true).unwrap();
    let description = mc
        .read_property_description(&destination, 0, 11, 0)
        .await
        .unwrap();
    assert_eq!(description.object_index, 0);
    assert_eq!(description.pid, 11);
    assert!(!description.write_enabled);
    assert_eq!(description.max_elements, 1);

    let writable = mc
        .read_property_description(&destination, 0, 54, 0)
        .await
        .unwrap();
    assert!(writable.write_enabled);
}

/// The property facade walks the device object's descriptions and reads
/// through the typed client.
pub async fn property_scan() {
    let bus = Bus::new(KnxMedium::Tp1);
    let _device = device(&bus);
    let (_link, _transport, mc) = client(&bus, CLIENT);
    // Indexes past the last property end the walk with a quiet device;
    // a short window keeps that bearable.
    mc.set_response_timeout(Duration::from_millis(500));

    let destination = mc.create_destination(DEVICE, true).unwrap();
    let adapter = Arc::new(RemotePropertyAdapter::new(mc.clone(), destination));
    let properties = PropertyClient::new(adapter);

    let descriptions = properties.scan(0).await.unwrap();
    let pids: Vec<u8> = descriptions.iter().map(|d| d.pid).collect();
    assert_eq!(pids, vec![1, 11, 14, 54, 56]);
    for (index, description) in descriptions.iter().enumerate() {
        assert_eq!(description.property_index, index as u8);
        assert_eq!(description.object_index, 0);
    }

    assert_eq!(properties.get(0, 11).await.unwrap(), SERIAL);
    assert_eq!(properties.current_elements(0, 11).await.unwrap(), 1);
    assert!(properties.is_open());
    properties.close().await;
    assert!(!properties.is_open());
}

/// A single-responder address read returns the one device in programming
/// mode, and times out when nobody is.
pub async fn read_single_programming_device() {
    let bus = Bus::new(KnxMedium::Tp1);
    let device = device(&bus);
    device.set_programming_mode(true);
    let (_link, _transport, mc) = client(&bus, CLIENT);

    assert_eq!(mc.read_address(true).await.unwrap(), vec![DEVICE]);

    device.set_programming_mode(false);
    assert!(matches!(mc.read_address(true).await, Err(Error::Timeout(_))));
}

/// Descriptor type 0 is the mask version.
pub async fn device_descriptor() {
    let bus = Bus::new(KnxMedium::Tp1);
    let _device = device(&bus);
    let (_link, _transport, mc) = client(&bus, CLIENT);

    let destination = mc.create_destination(DEVICE, true).unwrap();
    let descriptor = mc.read_device_descriptor0(&destination).await.unwrap();
    assert_eq!(descriptor.raw(), 0x07B0);
    assert!(mc.read_device_descriptor(&destination, 64).await.is_err());
}

/// ADC reads and the authorize/key handshake.
pub async fn adc_and_authorization() {
    let bus = Bus::new(KnxMedium::Tp1);
    let _device = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: DEVICE,
            serial: SerialNumber::new(SERIAL),
            auth_key: Some([0xDE, 0xAD, 0xBE, 0xEF]),
            ..Default::default()
        },
    );
    let (_link, _transport, mc) = client(&bus, CLIENT);

    let destination = mc.create_destination(DEVICE, true).unwrap();
    let value = mc.read_adc(&destination, 1, 2).await.unwrap();
    assert_eq!(value, 0x0102);
    assert!(matches!(
        mc.read_adc(&destination, 64, 1).await,
        Err(Error::IllegalArgument(_))
    ));
    assert!(matches!(
        mc.read_adc(&destination, 1, 0).await,
        Err(Error::Remote(_))
    ));

    assert_eq!(mc.authorize(&destination, [0; 4]).await.unwrap(), 15);
    assert_eq!(
        mc.authorize(&destination, [0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap(),
        0
    );
    assert_eq!(mc.write_key(&destination, 2, [1, 2, 3, 4]).await.unwrap(), 2);
}

/// Basic restart: no response, the device clears programming mode and
/// drops the connection, and the client ends up disconnected.
pub async fn restart_basic() {
    let bus = Bus::new(KnxMedium::Tp1);
    let device = device(&bus);
    device.set_programming_mode(true);
    let (_link, _transport, mc) = client(&bus, CLIENT);

    let destination = mc.create_destination(DEVICE, true).unwrap();
    mc.read_device_descriptor0(&destination).await.unwrap();
    mc.restart(&destination).await.unwrap();

    assert!(!device.programming_mode());
    assert_eq!(destination.state(), ConnState::Disconnected);
}

/// Master reset returns the worst-case recovery time.
pub async fn master_reset() {
    let bus = Bus::new(KnxMedium::Tp1);
    let _device = device(&bus);
    let (_link, _transport, mc) = client(&bus, CLIENT);

    let destination = mc.create_destination(DEVICE, true).unwrap();
    let process_time = mc
        .restart_master_reset(&destination, EraseCode::ConfirmedRestart, 0)
        .await
        .unwrap();
    assert_eq!(process_time, Duration::from_secs(5));
    assert_eq!(destination.state(), ConnState::Disconnected);
}

/// Two callers share one client; their request/response cycles queue on
/// the client mutex and both complete.
pub async fn concurrent_requests_queue() {
    let bus = Bus::new(KnxMedium::Tp1);
    let _first = device(&bus);
    let second_address = IndividualAddress::new(1, 1, 9);
    let _second = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: second_address,
            serial: SerialNumber::new([0x00, 0xFA, 9, 9, 9, 9]),
            descriptor: 0x091A,
            ..Default::default()
        },
    );
    let (_link, _transport, mc) = client(&bus, CLIENT);

    let descriptor = tokio::spawn({
        let mc = mc.clone();
        async move {
            let destination = mc.create_destination(DEVICE, true)?;
            mc.read_device_descriptor0(&destination).await
        }
    });
    let serial = tokio::spawn({
        let mc = mc.clone();
        async move {
            let destination = mc.create_destination(second_address, true)?;
            mc.read_property(&destination, 0, 11, 1, 1).await
        }
    });

    assert_eq!(descriptor.await.unwrap().unwrap().raw(), 0x07B0);
    assert_eq!(serial.await.unwrap().unwrap(), [0x00, 0xFA, 9, 9, 9, 9]);
}

/// Network parameter reads, broadcast and unicast.
pub async fn network_parameter() {
    let bus = Bus::new(KnxMedium::Tp1);
    let _device = device(&bus);
    let (_link, _transport, mc) = client(&bus, CLIENT);

    let responses = mc.read_network_parameter(None, 0, 11, &[]).await.unwrap();
    assert_eq!(responses, vec![(DEVICE, SERIAL.to_vec())]);

    let responses = mc
        .read_network_parameter(Some(DEVICE), 0, 11, &[])
        .await
        .unwrap();
    assert_eq!(responses, vec![(DEVICE, SERIAL.to_vec())]);
}
