//! Chunked memory transfers and the write-verification modes.

use std::sync::Arc;

use knx_core::links::Bus;
use knx_core::management::apdu::svc;
use knx_core::{
    Error, IndividualAddress, KnxMedium, ManagementClient, ManagementProcedures,
};

use super::support::{client, settle};
use crate::applications::{BusMonitor, DeviceConfig, ManagementServer};

const CLIENT: IndividualAddress = IndividualAddress::new(0, 0, 1);
const DEVICE: IndividualAddress = IndividualAddress::new(1, 1, 5);

fn device(bus: &Bus) -> ManagementServer {
    ManagementServer::start(
        bus,
        DeviceConfig {
            address: DEVICE,
            memory_size: 512,
            ..Default::default()
        },
    )
}

fn procedures(mc: Arc<ManagementClient>) -> ManagementProcedures {
    ManagementProcedures::new(mc)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

/// A 40-byte block travels in chunks sized to the device's maximum APDU
/// length (15, leaving 12 data bytes per request) and comes back intact.
pub async fn chunked_memory_roundtrip() {
    let bus = Bus::new(KnxMedium::Tp1);
    let device = device(&bus);
    let (_link, _transport, mc) = client(&bus, CLIENT);
    let monitor = BusMonitor::start(&bus, IndividualAddress::new(0, 0, 250));
    let procedures = procedures(mc);

    let data = pattern(40);
    procedures
        .write_memory(DEVICE, 0x0100, &data, false, false)
        .await
        .unwrap();
    assert_eq!(device.memory_at(0x0100, 40), data);
    settle().await;
    assert_eq!(monitor.count_service(svc::MEMORY_WRITE), 4);

    monitor.take();
    let read = procedures.read_memory(DEVICE, 0x0100, 40).await.unwrap();
    assert_eq!(read, data);
    settle().await;
    assert_eq!(monitor.count_service(svc::MEMORY_READ), 4);
}

/// Verify-by-read fetches every chunk back after writing it.
pub async fn verify_write() {
    let bus = Bus::new(KnxMedium::Tp1);
    let device = device(&bus);
    let (_link, _transport, mc) = client(&bus, CLIENT);
    let monitor = BusMonitor::start(&bus, IndividualAddress::new(0, 0, 250));
    let procedures = procedures(mc);

    let data = pattern(30);
    procedures
        .write_memory(DEVICE, 0x0040, &data, true, false)
        .await
        .unwrap();
    assert_eq!(device.memory_at(0x0040, 30), data);
    settle().await;
    assert_eq!(monitor.count_service(svc::MEMORY_WRITE), 3);
    assert_eq!(monitor.count_service(svc::MEMORY_READ), 3);
}

/// Verify-by-server flips the device-control bit so the device echoes
/// every written range, which the client compares.
pub async fn verify_by_server() {
    let bus = Bus::new(KnxMedium::Tp1);
    let device = device(&bus);
    let (_link, _transport, mc) = client(&bus, CLIENT);
    let procedures = procedures(mc);

    let data = pattern(20);
    procedures
        .write_memory(DEVICE, 0x0080, &data, false, true)
        .await
        .unwrap();
    assert_eq!(device.memory_at(0x0080, 20), data);

    // Asking for both verification modes at once is a caller error.
    assert!(matches!(
        procedures.write_memory(DEVICE, 0, &[1], true, true).await,
        Err(Error::IllegalArgument(_))
    ));
}

/// A verify-mode destination at the client level compares the echoed
/// bytes of a single write.
pub async fn verify_mode_write() {
    let bus = Bus::new(KnxMedium::Tp1);
    let device = device(&bus);
    let (_link, _transport, mc) = client(&bus, CLIENT);

    let destination = mc
        .create_destination_with(DEVICE, true, false, true)
        .unwrap();
    // The device only echoes with its control bit set.
    mc.write_property(&destination, 0, 14, 1, 1, &[0x04])
        .await
        .unwrap();
    mc.write_memory(&destination, 0x0020, &[0xAB, 0xCD, 0xEF])
        .await
        .unwrap();
    assert_eq!(device.memory_at(0x0020, 3), vec![0xAB, 0xCD, 0xEF]);
}

/// Memory services insist on a connection-oriented destination.
pub async fn memory_requires_connection() {
    let bus = Bus::new(KnxMedium::Tp1);
    let _device = device(&bus);
    let (_link, _transport, mc) = client(&bus, CLIENT);

    let destination = mc.create_destination(DEVICE, false).unwrap();
    assert!(matches!(
        mc.read_memory(&destination, 0, 4).await,
        Err(Error::IllegalArgument(_))
    ));
    assert!(matches!(
        mc.write_memory(&destination, 0, &[1]).await,
        Err(Error::IllegalArgument(_))
    ));
    // Out-of-range lengths fail before any I/O, whatever the mode.
    assert!(matches!(
        mc.read_memory(&destination, 0, 64).await,
        Err(Error::IllegalArgument(_))
    ));
}
