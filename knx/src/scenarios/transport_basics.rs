//! Raw transport-layer exchanges against a hand-scripted peer.

use std::time::Duration;

use knx_core::links::Bus;
use knx_core::transport::{ConnState, DisconnectedBy, TransportConfig, TransportEvent, TransportLayer};
use knx_core::{Error, IndividualAddress, KnxAddress, KnxMedium, NetworkLink, Priority};
use tokio::time::sleep;

use super::support::next_tpdu;

const CLIENT: IndividualAddress = IndividualAddress::new(1, 1, 1);
const PEER: IndividualAddress = IndividualAddress::new(1, 1, 5);

/// Connect, send one acknowledged TSDU, disconnect; every byte checked.
pub async fn connect_roundtrip() {
    let bus = Bus::new(KnxMedium::Tp1);
    let link = bus.attach(CLIENT);
    let transport = TransportLayer::new(link, TransportConfig::default());
    let peer = bus.attach(PEER);
    let mut peer_rx = peer.subscribe();

    let destination = transport.create_destination(PEER, true).unwrap();
    transport.connect(&destination).await.unwrap();
    assert_eq!(next_tpdu(&mut peer_rx, CLIENT).await, vec![0x80]);
    assert_eq!(destination.state(), ConnState::OpenIdle);

    let send = tokio::spawn({
        let transport = transport.clone();
        let destination = destination.clone();
        async move {
            transport
                .send_connected(&destination, Priority::Low, &[0x00, 0x80, 0x00])
                .await
        }
    });
    assert_eq!(next_tpdu(&mut peer_rx, CLIENT).await, vec![0x40, 0x80, 0x00]);
    peer.send_request(KnxAddress::Individual(CLIENT), Priority::System, &[0xC2])
        .await
        .unwrap();
    send.await.unwrap().unwrap();

    transport.disconnect(&destination).await.unwrap();
    assert_eq!(next_tpdu(&mut peer_rx, CLIENT).await, vec![0x81]);
    assert_eq!(destination.state(), ConnState::Disconnected);
    assert_eq!(destination.disconnected_by(), Some(DisconnectedBy::Local));
}

/// A NACK makes the sender repeat; the following ACK completes the send
/// and advances the sequence counter.
pub async fn nack_then_ack() {
    let bus = Bus::new(KnxMedium::Tp1);
    let link = bus.attach(CLIENT);
    let transport = TransportLayer::new(link, TransportConfig::default());
    let peer = bus.attach(PEER);
    let mut peer_rx = peer.subscribe();

    let destination = transport.create_destination(PEER, true).unwrap();
    transport.connect(&destination).await.unwrap();
    next_tpdu(&mut peer_rx, CLIENT).await;

    // Three clean exchanges move seq_send to 3.
    for seq in 0u8..3 {
        let send = tokio::spawn({
            let transport = transport.clone();
            let destination = destination.clone();
            async move {
                transport
                    .send_connected(&destination, Priority::Low, &[0x00, 0x81, seq])
                    .await
            }
        });
        assert_eq!(
            next_tpdu(&mut peer_rx, CLIENT).await,
            vec![0x40 | (seq << 2), 0x81, seq]
        );
        peer.send_request(
            KnxAddress::Individual(CLIENT),
            Priority::System,
            &[0xC2 | (seq << 2)],
        )
        .await
        .unwrap();
        send.await.unwrap().unwrap();
    }

    let send = tokio::spawn({
        let transport = transport.clone();
        let destination = destination.clone();
        async move {
            transport
                .send_connected(&destination, Priority::Low, &[0x00, 0x81, 0xAA])
                .await
        }
    });
    assert_eq!(next_tpdu(&mut peer_rx, CLIENT).await[0], 0x40 | (3 << 2));
    peer.send_request(KnxAddress::Individual(CLIENT), Priority::System, &[0xCF])
        .await
        .unwrap();
    // The NACK triggers a repeat of the same sequence number.
    assert_eq!(next_tpdu(&mut peer_rx, CLIENT).await[0], 0x40 | (3 << 2));
    peer.send_request(KnxAddress::Individual(CLIENT), Priority::System, &[0xCE])
        .await
        .unwrap();
    send.await.unwrap().unwrap();

    // seq_send is now 4.
    let send = tokio::spawn({
        let transport = transport.clone();
        let destination = destination.clone();
        async move {
            transport
                .send_connected(&destination, Priority::Low, &[0x00, 0x81, 0xBB])
                .await
        }
    });
    assert_eq!(next_tpdu(&mut peer_rx, CLIENT).await[0], 0x40 | (4 << 2));
    peer.send_request(
        KnxAddress::Individual(CLIENT),
        Priority::System,
        &[0xC2 | (4 << 2)],
    )
    .await
    .unwrap();
    send.await.unwrap().unwrap();
}

/// A repeated inbound TSDU is acknowledged again but not delivered again.
pub async fn duplicate_data_filter() {
    let bus = Bus::new(KnxMedium::Tp1);
    let link = bus.attach(CLIENT);
    let transport = TransportLayer::new(link, TransportConfig::default());
    let mut events = transport.subscribe();
    let peer = bus.attach(PEER);
    let mut peer_rx = peer.subscribe();

    let destination = transport.create_destination(PEER, true).unwrap();
    transport.connect(&destination).await.unwrap();
    next_tpdu(&mut peer_rx, CLIENT).await;

    let data = [0x40, 0x01, 0x40];
    for _ in 0..2 {
        peer.send_request(KnxAddress::Individual(CLIENT), Priority::Low, &data)
            .await
            .unwrap();
        assert_eq!(next_tpdu(&mut peer_rx, CLIENT).await, vec![0xC2]);
    }

    let mut delivered = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, TransportEvent::Connected(_)) {
            delivered += 1;
        }
    }
    assert_eq!(delivered, 1);

    // The expected sequence moved to 1 exactly once.
    peer.send_request(
        KnxAddress::Individual(CLIENT),
        Priority::Low,
        &[0x44, 0x01, 0x40],
    )
    .await
    .unwrap();
    assert_eq!(next_tpdu(&mut peer_rx, CLIENT).await, vec![0xC6]);
}

/// Four unacknowledged attempts exhaust the budget: the destination is
/// disconnected and the send fails.
pub async fn retransmit_exhaust() {
    let bus = Bus::new(KnxMedium::Tp1);
    let link = bus.attach(CLIENT);
    let transport = TransportLayer::new(link, TransportConfig::default());
    let peer = bus.attach(PEER);
    let mut peer_rx = peer.subscribe();

    let destination = transport.create_destination(PEER, true).unwrap();
    transport.connect(&destination).await.unwrap();
    next_tpdu(&mut peer_rx, CLIENT).await;

    let send = tokio::spawn({
        let transport = transport.clone();
        let destination = destination.clone();
        async move {
            transport
                .send_connected(&destination, Priority::Low, &[0x00, 0x81, 0x00])
                .await
        }
    });
    for _ in 0..4 {
        assert_eq!(next_tpdu(&mut peer_rx, CLIENT).await, vec![0x40, 0x81, 0x00]);
    }
    assert_eq!(next_tpdu(&mut peer_rx, CLIENT).await, vec![0x81]);
    assert!(matches!(
        send.await.unwrap(),
        Err(Error::Disconnect {
            initiator: DisconnectedBy::Local,
            ..
        })
    ));
    assert_eq!(destination.state(), ConnState::Disconnected);
}

/// Broadcast and group frames bypass the connection machinery and reach
/// listeners verbatim, even when their payload looks like a control
/// code.
pub async fn group_and_broadcast_passthrough() {
    let bus = Bus::new(KnxMedium::Tp1);
    let link = bus.attach(CLIENT);
    let transport = TransportLayer::new(link, TransportConfig::default());
    let mut events = transport.subscribe();
    let peer = bus.attach(PEER);

    let group = KnxAddress::Group(knx_core::GroupAddress::new(1, 2, 3));
    peer.send_request(group, Priority::Normal, &[0x00, 0x81, 0x01])
        .await
        .unwrap();
    let broadcast = KnxAddress::Group(knx_core::GroupAddress::BROADCAST);
    peer.send_request(broadcast, Priority::System, &[0x80])
        .await
        .unwrap();

    sleep(Duration::from_millis(1)).await;
    let mut saw_group = false;
    let mut saw_broadcast = false;
    while let Ok(event) = events.try_recv() {
        match event {
            TransportEvent::Group(frame) => {
                assert_eq!(frame.tpdu, vec![0x00, 0x81, 0x01]);
                saw_group = true;
            }
            TransportEvent::Broadcast(frame) => {
                assert_eq!(frame.tpdu, vec![0x80]);
                saw_broadcast = true;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(saw_group && saw_broadcast);
    // No session sprang up from the broadcast control byte.
    assert!(transport.get_destination(PEER).is_none());
}

/// A keep-alive connection stays open through long silences.
pub async fn keep_alive_connection() {
    let bus = Bus::new(KnxMedium::Tp1);
    let link = bus.attach(CLIENT);
    let transport = TransportLayer::new(link, TransportConfig::default());
    let peer = bus.attach(PEER);
    let mut peer_rx = peer.subscribe();

    let destination = transport
        .create_destination_with(PEER, true, true, false)
        .unwrap();
    transport.connect(&destination).await.unwrap();
    assert_eq!(next_tpdu(&mut peer_rx, CLIENT).await, vec![0x80]);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(destination.state(), ConnState::OpenIdle);
    // In particular, no disconnect went out.
    assert!(peer_rx.try_recv().is_err());
}

/// Six idle seconds close a connection without keep-alive.
pub async fn idle_timeout() {
    let bus = Bus::new(KnxMedium::Tp1);
    let link = bus.attach(CLIENT);
    let transport = TransportLayer::new(link, TransportConfig::default());
    let peer = bus.attach(PEER);
    let mut peer_rx = peer.subscribe();

    let destination = transport.create_destination(PEER, true).unwrap();
    transport.connect(&destination).await.unwrap();
    assert_eq!(next_tpdu(&mut peer_rx, CLIENT).await, vec![0x80]);

    assert_eq!(next_tpdu(&mut peer_rx, CLIENT).await, vec![0x81]);
    assert_eq!(destination.state(), ConnState::Disconnected);
    assert_eq!(destination.disconnected_by(), Some(DisconnectedBy::Local));
}
