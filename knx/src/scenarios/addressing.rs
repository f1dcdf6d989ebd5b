//! Address assignment workflows and programming mode.

use std::sync::Arc;

use knx_core::links::Bus;
use knx_core::{
    IndividualAddress, KnxMedium, ManagementClient, ManagementProcedures, SerialNumber,
};

use super::support::client;
use crate::applications::{DeviceConfig, ManagementServer};

const CLIENT: IndividualAddress = IndividualAddress::new(0, 0, 1);
const SERIAL: [u8; 6] = [0x00, 0xFA, 0xAA, 0xBB, 0xCC, 0xDD];

fn procedures(mc: Arc<ManagementClient>) -> ManagementProcedures {
    ManagementProcedures::new(mc)
}

/// A factory-fresh device in programming mode receives its address, is
/// verified under it, and is restarted out of programming mode.
pub async fn assign_address() {
    let bus = Bus::new(KnxMedium::Tp1);
    let device = ManagementServer::start(
        &bus,
        DeviceConfig {
            serial: SerialNumber::new(SERIAL),
            programming_mode: true,
            ..Default::default()
        },
    );
    let (_link, _transport, mc) = client(&bus, CLIENT);
    let procedures = procedures(mc);

    let target = IndividualAddress::new(1, 1, 10);
    assert!(procedures.write_address(target).await.unwrap());
    assert_eq!(device.address(), target);
    assert!(!device.programming_mode());
    assert!(procedures.is_address_occupied(target).await.unwrap());
}

/// The target address belongs to a device outside programming mode:
/// nothing is reassigned.
pub async fn occupied_address_not_reassigned() {
    let bus = Bus::new(KnxMedium::Tp1);
    let owner = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: IndividualAddress::new(1, 1, 10),
            ..Default::default()
        },
    );
    let fresh = ManagementServer::start(
        &bus,
        DeviceConfig {
            serial: SerialNumber::new(SERIAL),
            programming_mode: true,
            ..Default::default()
        },
    );
    let (_link, _transport, mc) = client(&bus, CLIENT);
    let procedures = procedures(mc);

    assert!(!procedures
        .write_address(IndividualAddress::new(1, 1, 10))
        .await
        .unwrap());
    assert_eq!(owner.address(), IndividualAddress::new(1, 1, 10));
    assert_eq!(fresh.address(), IndividualAddress::DEFAULT_DEVICE);
    assert!(fresh.programming_mode());
}

/// Reset drives a stray device back to the default address.
pub async fn reset_address() {
    let bus = Bus::new(KnxMedium::Tp1);
    let device = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: IndividualAddress::new(1, 1, 10),
            programming_mode: true,
            ..Default::default()
        },
    );
    let (_link, _transport, mc) = client(&bus, CLIENT);
    let procedures = procedures(mc);

    procedures.reset_address().await.unwrap();
    assert_eq!(device.address(), IndividualAddress::DEFAULT_DEVICE);
    assert!(!device.programming_mode());
    assert!(procedures.read_address().await.unwrap().is_empty());
}

/// Serial-number addressing works without programming mode.
pub async fn serial_number_addressing() {
    let bus = Bus::new(KnxMedium::Tp1);
    let serial = SerialNumber::new(SERIAL);
    let device = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: IndividualAddress::new(1, 1, 30),
            serial,
            ..Default::default()
        },
    );
    let (_link, _transport, mc) = client(&bus, CLIENT);

    assert_eq!(
        mc.read_address_by_serial(serial).await.unwrap(),
        IndividualAddress::new(1, 1, 30)
    );
    let target = IndividualAddress::new(1, 1, 20);
    mc.write_address_by_serial(serial, target).await.unwrap();
    assert_eq!(device.address(), target);
    assert_eq!(mc.read_address_by_serial(serial).await.unwrap(), target);

    // The composed procedure assigns and verifies in one step.
    let procedures = procedures(mc);
    let target = IndividualAddress::new(1, 1, 21);
    procedures
        .write_address_by_serial(serial, target)
        .await
        .unwrap();
    assert_eq!(device.address(), target);
}

/// Programming mode through the device-object property.
pub async fn programming_mode_property() {
    let bus = Bus::new(KnxMedium::Tp1);
    let device = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: IndividualAddress::new(1, 1, 7),
            ..Default::default()
        },
    );
    let (_link, _transport, mc) = client(&bus, CLIENT);
    let procedures = procedures(mc);

    procedures
        .set_programming_mode(device.address(), true)
        .await
        .unwrap();
    assert!(device.programming_mode());
    procedures
        .set_programming_mode(device.address(), false)
        .await
        .unwrap();
    assert!(!device.programming_mode());
}

/// A device without the programming-mode property is driven through its
/// memory location, with the parity bit maintained.
pub async fn programming_mode_memory_fallback() {
    let bus = Bus::new(KnxMedium::Tp1);
    let device = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: IndividualAddress::new(1, 1, 7),
            has_progmode_property: false,
            ..Default::default()
        },
    );
    let (_link, _transport, mc) = client(&bus, CLIENT);
    let procedures = procedures(mc);

    procedures
        .set_programming_mode(device.address(), true)
        .await
        .unwrap();
    assert!(device.programming_mode());
    assert_eq!(device.memory_at(0x60, 1), vec![0x81]);

    procedures
        .set_programming_mode(device.address(), false)
        .await
        .unwrap();
    assert!(!device.programming_mode());
    assert_eq!(device.memory_at(0x60, 1), vec![0x00]);
}

/// Domain addresses: broadcast write, read, and the selective read.
pub async fn domain_addressing() {
    let bus = Bus::new(KnxMedium::Tp1);
    let device = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: IndividualAddress::new(1, 1, 7),
            programming_mode: true,
            ..Default::default()
        },
    );
    let (_link, _transport, mc) = client(&bus, CLIENT);

    mc.write_domain_address(&[0x12, 0x34]).await.unwrap();
    let domains = mc.read_domain_addresses().await.unwrap();
    assert_eq!(domains, vec![(device.address(), vec![0x12, 0x34])]);

    let selective = mc
        .read_domain_address_selective([0x12, 0x34], IndividualAddress::new(1, 1, 0), 16)
        .await
        .unwrap();
    assert_eq!(selective, vec![(device.address(), vec![0x12, 0x34])]);

    let nobody = mc
        .read_domain_address_selective([0x56, 0x78], IndividualAddress::new(1, 1, 0), 16)
        .await
        .unwrap();
    assert!(nobody.is_empty());

    assert!(mc.write_domain_address(&[1, 2, 3]).await.is_err());

    // The composed procedure writes and verifies in one step.
    let procedures = procedures(mc);
    procedures.write_domain_address(&[0x9A, 0xBC]).await.unwrap();
    let domains = procedures.client().read_domain_addresses().await.unwrap();
    assert_eq!(domains, vec![(device.address(), vec![0x9A, 0xBC])]);
}
