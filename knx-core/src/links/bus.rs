//! An in-memory multi-drop bus.
//!
//! Every endpoint attached to a [`Bus`] sees every frame sent by every
//! other endpoint, like devices sharing one TP1 segment. The bus can be
//! told to drop frames, either a deterministic count of upcoming frames or
//! randomly with a seeded generator, to exercise retransmission paths.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::address::{IndividualAddress, KnxAddress};
use crate::error::Error;
use crate::link::{FrameEvent, KnxMedium, LinkEvent, MediumInfo, NetworkLink, Priority};

/// Per-endpoint event buffer. Scans touching a whole line produce a few
/// hundred events back to back, so leave headroom.
const EVENT_CAPACITY: usize = 512;

/// A shared in-memory bus that [`BusLink`] endpoints attach to.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    medium: KnxMedium,
    endpoints: Mutex<Vec<Endpoint>>,
    faults: Mutex<Faults>,
    next_id: AtomicUsize,
}

struct Endpoint {
    id: usize,
    events: broadcast::Sender<LinkEvent>,
}

#[derive(Default)]
struct Faults {
    drop_next: usize,
    loss: Option<Loss>,
}

struct Loss {
    probability: f64,
    rng: SmallRng,
}

impl Bus {
    pub fn new(medium: KnxMedium) -> Self {
        Self {
            inner: Arc::new(BusInner {
                medium,
                endpoints: Mutex::new(Vec::new()),
                faults: Mutex::new(Faults::default()),
                next_id: AtomicUsize::new(0),
            }),
        }
    }

    /// Attaches a new endpoint sending from `address`.
    pub fn attach(&self, address: IndividualAddress) -> Arc<BusLink> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        self.inner.endpoints.lock().unwrap().push(Endpoint {
            id,
            events: events.clone(),
        });
        Arc::new(BusLink {
            id,
            name: format!("bus endpoint {address}"),
            address: Mutex::new(address),
            open: AtomicBool::new(true),
            events,
            bus: self.inner.clone(),
        })
    }

    /// Silently discards the next `count` frames, regardless of sender.
    pub fn drop_next(&self, count: usize) {
        self.inner.faults.lock().unwrap().drop_next = count;
    }

    /// Drops each frame with the given probability, reproducibly seeded.
    pub fn set_loss(&self, probability: f64, seed: u64) {
        self.inner.faults.lock().unwrap().loss = Some(Loss {
            probability,
            rng: SmallRng::seed_from_u64(seed),
        });
    }
}

impl BusInner {
    fn swallows(&self) -> bool {
        let mut faults = self.faults.lock().unwrap();
        if faults.drop_next > 0 {
            faults.drop_next -= 1;
            return true;
        }
        if let Some(loss) = faults.loss.as_mut() {
            return loss.rng.gen_bool(loss.probability);
        }
        false
    }

    fn deliver(&self, from: usize, frame: FrameEvent) {
        if self.swallows() {
            tracing::debug!(source = %frame.source, "bus dropped a frame");
            return;
        }
        let endpoints = self.endpoints.lock().unwrap();
        for endpoint in endpoints.iter() {
            if endpoint.id != from {
                // A send only fails when the endpoint has no subscribers.
                let _ = endpoint.events.send(LinkEvent::Indication(frame.clone()));
            }
        }
    }

    fn detach(&self, id: usize) {
        self.endpoints.lock().unwrap().retain(|e| e.id != id);
    }
}

/// One endpoint of an in-memory [`Bus`].
pub struct BusLink {
    id: usize,
    name: String,
    address: Mutex<IndividualAddress>,
    open: AtomicBool,
    events: broadcast::Sender<LinkEvent>,
    bus: Arc<BusInner>,
}

impl BusLink {
    /// Changes the individual address this endpoint sends from, the way a
    /// real device applies an address assignment.
    pub fn set_address(&self, address: IndividualAddress) {
        *self.address.lock().unwrap() = address;
    }

    fn send(&self, destination: KnxAddress, priority: Priority, tpdu: &[u8]) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::LinkClosed);
        }
        let frame = FrameEvent {
            source: *self.address.lock().unwrap(),
            destination,
            priority,
            tpdu: tpdu.to_vec(),
            received: Instant::now(),
        };
        self.bus.deliver(self.id, frame);
        Ok(())
    }
}

#[async_trait::async_trait]
impl NetworkLink for BusLink {
    async fn send_request(
        &self,
        destination: KnxAddress,
        priority: Priority,
        tpdu: &[u8],
    ) -> Result<(), Error> {
        self.send(destination, priority, tpdu)
    }

    async fn send_request_wait(
        &self,
        destination: KnxAddress,
        priority: Priority,
        tpdu: &[u8],
    ) -> Result<(), Error> {
        // The in-memory medium confirms instantly.
        self.send(destination, priority, tpdu)
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    fn medium(&self) -> MediumInfo {
        MediumInfo {
            medium: self.bus.medium,
            address: *self.address.lock().unwrap(),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.bus.detach(self.id);
            let _ = self.events.send(LinkEvent::Closed);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::GroupAddress;

    fn frame_of(event: LinkEvent) -> FrameEvent {
        match event {
            LinkEvent::Indication(frame) => frame,
            LinkEvent::Closed => panic!("expected a frame"),
        }
    }

    #[tokio::test]
    async fn frames_reach_all_other_endpoints() {
        let bus = Bus::new(KnxMedium::Tp1);
        let a = bus.attach(IndividualAddress::new(1, 1, 1));
        let b = bus.attach(IndividualAddress::new(1, 1, 2));
        let c = bus.attach(IndividualAddress::new(1, 1, 3));
        let mut rx_b = b.subscribe();
        let mut rx_c = c.subscribe();

        a.send_request(
            KnxAddress::Group(GroupAddress::BROADCAST),
            Priority::System,
            &[0x80],
        )
        .await
        .unwrap();

        for rx in [&mut rx_b, &mut rx_c] {
            let frame = frame_of(rx.recv().await.unwrap());
            assert_eq!(frame.source, IndividualAddress::new(1, 1, 1));
            assert_eq!(frame.tpdu, vec![0x80]);
        }
    }

    #[tokio::test]
    async fn sender_does_not_hear_itself() {
        let bus = Bus::new(KnxMedium::Tp1);
        let a = bus.attach(IndividualAddress::new(1, 1, 1));
        let b = bus.attach(IndividualAddress::new(1, 1, 2));
        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();

        a.send_request(
            KnxAddress::Individual(IndividualAddress::new(1, 1, 2)),
            Priority::Normal,
            &[0x00, 0x00],
        )
        .await
        .unwrap();

        assert!(rx_b.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn drop_next_swallows_frames() {
        let bus = Bus::new(KnxMedium::Tp1);
        let a = bus.attach(IndividualAddress::new(1, 1, 1));
        let b = bus.attach(IndividualAddress::new(1, 1, 2));
        let mut rx_b = b.subscribe();

        bus.drop_next(1);
        let dst = KnxAddress::Individual(IndividualAddress::new(1, 1, 2));
        a.send_request(dst, Priority::Normal, &[0x80]).await.unwrap();
        a.send_request(dst, Priority::Normal, &[0x81]).await.unwrap();

        let frame = frame_of(rx_b.recv().await.unwrap());
        assert_eq!(frame.tpdu, vec![0x81]);
    }

    #[tokio::test]
    async fn closed_link_rejects_and_notifies() {
        let bus = Bus::new(KnxMedium::Tp1);
        let a = bus.attach(IndividualAddress::new(1, 1, 1));
        let mut rx_a = a.subscribe();

        a.close().await;
        assert!(!a.is_open());
        assert!(matches!(rx_a.recv().await.unwrap(), LinkEvent::Closed));

        let result = a
            .send_request(
                KnxAddress::Group(GroupAddress::BROADCAST),
                Priority::Normal,
                &[0x80],
            )
            .await;
        assert_eq!(result, Err(Error::LinkClosed));
    }
}
