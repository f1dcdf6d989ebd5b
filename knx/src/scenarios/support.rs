//! Shared wiring for the scenarios.

use std::sync::Arc;
use std::time::Duration;

use knx_core::links::{Bus, BusLink};
use knx_core::transport::{TransportConfig, TransportLayer};
use knx_core::{IndividualAddress, LinkEvent, ManagementClient};
use tokio::sync::broadcast;
use tokio::time::timeout;

/// A client stack: link endpoint, transport layer, and management client.
pub(crate) fn client(
    bus: &Bus,
    address: IndividualAddress,
) -> (Arc<BusLink>, Arc<TransportLayer>, Arc<ManagementClient>) {
    let link = bus.attach(address);
    let transport = TransportLayer::new(link.clone(), TransportConfig::default());
    let client = Arc::new(ManagementClient::new(transport.clone()));
    (link, transport, client)
}

/// Lets background tasks drain their event queues before assertions.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// The next TPDU sent by `source`, skipping everything else on the bus.
/// Panics after a virtual minute without one.
pub(crate) async fn next_tpdu(
    rx: &mut broadcast::Receiver<LinkEvent>,
    source: IndividualAddress,
) -> Vec<u8> {
    loop {
        let event = timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("bus endpoint closed");
        match event {
            LinkEvent::Indication(frame) if frame.source == source => return frame.tpdu,
            _ => {}
        }
    }
}

