//! Detach and teardown behaviour.

use std::time::Duration;

use knx_core::links::Bus;
use knx_core::transport::{ConnState, TransportEvent};
use knx_core::{Error, IndividualAddress, KnxMedium, NetworkLink, Priority};
use tokio::time::{sleep, timeout};

use super::support::client;
use crate::applications::{DeviceConfig, ManagementServer};

const CLIENT: IndividualAddress = IndividualAddress::new(0, 0, 1);
const DEVICE: IndividualAddress = IndividualAddress::new(1, 1, 5);

/// Detach destroys every destination, notifies subscribers once, and
/// leaves the layer permanently unusable. The link itself stays open.
pub async fn detach_is_terminal() {
    let bus = Bus::new(KnxMedium::Tp1);
    let _device = ManagementServer::start(
        &bus,
        DeviceConfig {
            address: DEVICE,
            ..Default::default()
        },
    );
    let (link, transport, mc) = client(&bus, CLIENT);
    let mut events = transport.subscribe();

    let destination = mc.create_destination(DEVICE, true).unwrap();
    transport.connect(&destination).await.unwrap();

    mc.detach().await;
    assert!(transport.is_detached());
    assert_eq!(destination.state(), ConnState::Destroyed);
    assert!(link.is_open());

    let mut saw_detached = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, TransportEvent::Detached) {
            saw_detached = true;
        }
    }
    assert!(saw_detached);

    assert!(matches!(
        mc.create_destination(DEVICE, true),
        Err(Error::IllegalState(_))
    ));
    assert!(matches!(mc.read_address(false).await, Err(Error::IllegalState(_))));

    // Detaching again is a no-op.
    mc.detach().await;
}

/// Closing the link detaches the layer from the inside.
pub async fn link_close_detaches() {
    let bus = Bus::new(KnxMedium::Tp1);
    let (link, transport, mc) = client(&bus, CLIENT);
    let destination = mc.create_destination(DEVICE, true).unwrap();

    link.close().await;
    // The dispatch task picks the close event up asynchronously.
    for _ in 0..10 {
        if transport.is_detached() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(transport.is_detached());
    assert_eq!(destination.state(), ConnState::Destroyed);
    assert!(matches!(
        transport
            .send_data(DEVICE, Priority::Low, &[0x00, 0x00])
            .await,
        Err(Error::IllegalState(_))
    ));
}

/// Destroying a destination mid-send aborts the send with a disconnect
/// error instead of letting it run out its retransmissions.
pub async fn destroy_aborts_send() {
    let bus = Bus::new(KnxMedium::Tp1);
    let (_link, transport, _mc) = client(&bus, CLIENT);
    // Nobody at the peer address: the send would retry for 12 seconds.
    let destination = transport.create_destination(DEVICE, true).unwrap();
    transport.connect(&destination).await.unwrap();

    let send = tokio::spawn({
        let transport = transport.clone();
        let destination = destination.clone();
        async move {
            transport
                .send_connected(&destination, Priority::Low, &[0x00, 0x80, 0x00])
                .await
        }
    });
    sleep(Duration::from_secs(1)).await;
    transport.destroy_destination(&destination).await;

    let result = timeout(Duration::from_secs(2), send)
        .await
        .expect("send did not abort on destroy")
        .unwrap();
    assert!(matches!(result, Err(Error::Disconnect { .. })));
    assert_eq!(destination.state(), ConnState::Destroyed);
    assert!(transport.get_destination(DEVICE).is_none());
}
