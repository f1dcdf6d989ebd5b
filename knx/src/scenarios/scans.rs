//! Installation scans: routers, line devices, serial numbers, and the
//! occupancy probe.

use std::sync::Arc;

use knx_core::links::Bus;
use knx_core::{
    IndividualAddress, KnxMedium, ManagementClient, ManagementProcedures, SerialNumber,
};

use super::support::client;
use crate::applications::{DeviceConfig, ManagementServer};

const CLIENT: IndividualAddress = IndividualAddress::new(0, 0, 1);

fn procedures(mc: Arc<ManagementClient>) -> ManagementProcedures {
    ManagementProcedures::new(mc)
}

/// Two couplers on the backbone answer the router scan; nothing else
/// does.
pub async fn scan_routers() {
    let bus = Bus::new(KnxMedium::Tp1);
    let _coupler_a = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: IndividualAddress::new(1, 0, 0),
            ..Default::default()
        },
    );
    let _coupler_b = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: IndividualAddress::new(5, 0, 0),
            ..Default::default()
        },
    );
    // A line device must not show up in a router scan.
    let _device = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: IndividualAddress::new(1, 1, 4),
            ..Default::default()
        },
    );
    let (_link, _transport, mc) = client(&bus, CLIENT);

    let routers = procedures(mc).scan_network_routers().await.unwrap();
    assert_eq!(
        routers,
        vec![IndividualAddress::new(1, 0, 0), IndividualAddress::new(5, 0, 0)]
    );
}

/// A line scan finds both a connection-oriented device and one that only
/// speaks connectionless (it refuses the connect, which is still a
/// remote-terminated connection).
pub async fn scan_devices() {
    let bus = Bus::new(KnxMedium::Tp1);
    let _served = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: IndividualAddress::new(1, 1, 4),
            ..Default::default()
        },
    );
    let _connectionless = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: IndividualAddress::new(1, 1, 9),
            connectionless_only: true,
            ..Default::default()
        },
    );
    // A device on another line stays invisible.
    let _elsewhere = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: IndividualAddress::new(1, 2, 4),
            ..Default::default()
        },
    );
    let (_link, _transport, mc) = client(&bus, CLIENT);

    let devices = procedures(mc).scan_network_devices(1, 1).await.unwrap();
    assert_eq!(
        devices,
        vec![IndividualAddress::new(1, 1, 4), IndividualAddress::new(1, 1, 9)]
    );
}

/// The serial-number scan reaches the unconfigured device waiting on the
/// medium's default address; configured devices stay silent.
pub async fn scan_serials() {
    let bus = Bus::new(KnxMedium::Tp1);
    let unconfigured_serial = SerialNumber::new([0x00, 0xFA, 1, 2, 3, 4]);
    let _unconfigured = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: IndividualAddress::new(0, 1, 255),
            serial: unconfigured_serial,
            ..Default::default()
        },
    );
    let _configured = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: IndividualAddress::new(1, 1, 4),
            serial: SerialNumber::new([0x00, 0xFA, 9, 9, 9, 9]),
            ..Default::default()
        },
    );
    let (_link, _transport, mc) = client(&bus, CLIENT);

    let serials = procedures(mc).scan_serial_numbers(1).await.unwrap();
    assert_eq!(
        serials,
        vec![(IndividualAddress::new(0, 1, 255), unconfigured_serial)]
    );
}

/// Occupancy: a present device counts, a refusing connectionless device
/// counts, an empty address does not.
pub async fn address_occupancy() {
    let bus = Bus::new(KnxMedium::Tp1);
    let _served = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: IndividualAddress::new(1, 1, 4),
            ..Default::default()
        },
    );
    let _connectionless = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: IndividualAddress::new(1, 1, 9),
            connectionless_only: true,
            ..Default::default()
        },
    );
    let (_link, _transport, mc) = client(&bus, CLIENT);
    let procedures = procedures(mc);

    assert!(procedures
        .is_address_occupied(IndividualAddress::new(1, 1, 4))
        .await
        .unwrap());
    assert!(procedures
        .is_address_occupied(IndividualAddress::new(1, 1, 9))
        .await
        .unwrap());
    assert!(!procedures
        .is_address_occupied(IndividualAddress::new(1, 1, 200))
        .await
        .unwrap());
}
