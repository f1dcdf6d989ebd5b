//! Brings up an in-memory device and reads its identity: mask version,
//! serial number, and the device-object property descriptions.

use std::sync::Arc;
use std::time::Duration;

use knx::applications::{DeviceConfig, ManagementServer};
use knx_core::links::Bus;
use knx_core::transport::{TransportConfig, TransportLayer};
use knx_core::{
    IndividualAddress, KnxMedium, ManagementClient, PropertyClient, RemotePropertyAdapter,
    SerialNumber,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let bus = Bus::new(KnxMedium::Tp1);
    let device = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: IndividualAddress::new(1, 1, 5),
            serial: SerialNumber::new([0x00, 0xFA, 0x12, 0x34, 0x56, 0x78]),
            ..Default::default()
        },
    );

    let link = bus.attach(IndividualAddress::new(0, 0, 1));
    let transport = TransportLayer::new(link, TransportConfig::default());
    let client = Arc::new(ManagementClient::new(transport));
    // The description walk ends on a silent device; keep that short.
    client.set_response_timeout(Duration::from_millis(500));

    let destination = client.create_destination(device.address(), true)?;
    let descriptor = client.read_device_descriptor0(&destination).await?;
    println!("device {}: mask version {descriptor}", device.address());

    let serial = client.read_property(&destination, 0, 11, 1, 1).await?;
    println!("serial number {}", SerialNumber::new(serial.as_slice().try_into()?));

    let properties = PropertyClient::new(Arc::new(RemotePropertyAdapter::new(
        client.clone(),
        destination,
    )));
    for description in properties.scan(0).await? {
        println!("  {description}");
    }

    device.stop().await;
    Ok(())
}
