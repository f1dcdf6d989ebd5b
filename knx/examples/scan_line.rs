//! Scans line 1.1 of an in-memory installation. The probe runs in real
//! time, pacing 256 connects and waiting out the disconnect timeout, so
//! expect it to take half a minute.

use std::sync::Arc;

use knx::applications::{DeviceConfig, ManagementServer};
use knx_core::links::Bus;
use knx_core::transport::{TransportConfig, TransportLayer};
use knx_core::{IndividualAddress, KnxMedium, ManagementClient, ManagementProcedures};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let bus = Bus::new(KnxMedium::Tp1);
    for device in [4, 9, 200] {
        ManagementServer::start(
            &bus,
            DeviceConfig {
                address: IndividualAddress::new(1, 1, device),
                ..Default::default()
            },
        );
    }

    let link = bus.attach(IndividualAddress::new(0, 0, 1));
    let transport = TransportLayer::new(link, TransportConfig::default());
    let client = Arc::new(ManagementClient::new(transport));
    let procedures = ManagementProcedures::new(client);

    println!("scanning 1.1.0 through 1.1.255");
    for address in procedures.scan_network_devices(1, 1).await? {
        println!("  device at {address}");
    }
    Ok(())
}
