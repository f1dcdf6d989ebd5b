//! A passive bus monitor.
//!
//! Attaches its own endpoint and records every frame on the bus, with a
//! decoder that renders transport control and application service in the
//! style of a busmonitor log line. Scenarios use it to assert on raw
//! traffic without scripting their own receivers.

use std::sync::{Arc, Mutex};

use knx_core::links::Bus;
use knx_core::management::apdu;
use knx_core::transport::tpdu::Tpdu;
use knx_core::{FrameEvent, IndividualAddress, LinkEvent, NetworkLink};

/// Records everything a bus endpoint hears.
pub struct BusMonitor {
    frames: Arc<Mutex<Vec<FrameEvent>>>,
}

impl BusMonitor {
    /// Attaches a monitoring endpoint; the address only names the
    /// endpoint, the monitor never transmits.
    pub fn start(bus: &Bus, address: IndividualAddress) -> Self {
        let link = bus.attach(address);
        let frames: Arc<Mutex<Vec<FrameEvent>>> = Arc::default();
        let mut events = link.subscribe();
        let recorded = frames.clone();
        tokio::spawn(async move {
            // The link stays alive as long as this task runs.
            let _link = link;
            loop {
                match events.recv().await {
                    Ok(LinkEvent::Indication(frame)) => {
                        tracing::trace!("{}", describe_frame(&frame));
                        recorded.lock().unwrap().push(frame);
                    }
                    Ok(LinkEvent::Closed) | Err(_) => break,
                }
            }
        });
        Self { frames }
    }

    /// Everything recorded so far.
    pub fn frames(&self) -> Vec<FrameEvent> {
        self.frames.lock().unwrap().clone()
    }

    /// Removes and returns the recording, starting a fresh capture.
    pub fn take(&self) -> Vec<FrameEvent> {
        std::mem::take(&mut self.frames.lock().unwrap())
    }

    /// How many recorded frames carry the given application service.
    pub fn count_service(&self, service: u16) -> usize {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame_service(frame) == Some(service))
            .count()
    }

    /// Frames sent by one endpoint, in order.
    pub fn frames_from(&self, source: IndividualAddress) -> Vec<FrameEvent> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame.source == source)
            .cloned()
            .collect()
    }
}

fn frame_service(frame: &FrameEvent) -> Option<u16> {
    match frame.tpdu.first().copied().and_then(Tpdu::parse)? {
        Tpdu::Data { .. } | Tpdu::DataConnected { .. } => {
            apdu::service(&apdu::from_tpdu(&frame.tpdu)?)
        }
        _ => None,
    }
}

/// One busmonitor log line for a frame.
pub fn describe_frame(frame: &FrameEvent) -> String {
    let head = format!("{} -> {}", frame.source, frame.destination);
    match frame.tpdu.first().copied().and_then(Tpdu::parse) {
        Some(Tpdu::Connect) => format!("{head}: connect"),
        Some(Tpdu::Disconnect) => format!("{head}: disconnect"),
        Some(Tpdu::Ack { seq }) => format!("{head}: ack {seq}"),
        Some(Tpdu::Nack { seq }) => format!("{head}: nack {seq}"),
        Some(Tpdu::Data { .. }) => format!("{head}: {}", describe_data(&frame.tpdu)),
        Some(Tpdu::DataConnected { seq, .. }) => {
            format!("{head}: seq {seq} {}", describe_data(&frame.tpdu))
        }
        None => match frame.tpdu.first() {
            Some(control) => format!("{head}: reserved control 0x{control:02x}"),
            None => format!("{head}: empty frame"),
        },
    }
}

fn describe_data(tpdu: &[u8]) -> String {
    match apdu::from_tpdu(tpdu).and_then(|apdu| apdu::service(&apdu)) {
        Some(service) => format!("{} {:02x?}", apdu::service_name(service), &tpdu[2..]),
        None => format!("data {tpdu:02x?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knx_core::{KnxAddress, Priority};
    use tokio::time::Instant;

    fn frame(tpdu: Vec<u8>) -> FrameEvent {
        FrameEvent {
            source: IndividualAddress::new(1, 1, 1),
            destination: KnxAddress::Individual(IndividualAddress::new(1, 1, 5)),
            priority: Priority::System,
            tpdu,
            received: Instant::now(),
        }
    }

    #[test]
    fn control_frames_decode() {
        assert_eq!(describe_frame(&frame(vec![0x80])), "1.1.1 -> 1.1.5: connect");
        assert_eq!(
            describe_frame(&frame(vec![0x81])),
            "1.1.1 -> 1.1.5: disconnect"
        );
        assert_eq!(describe_frame(&frame(vec![0xC6])), "1.1.1 -> 1.1.5: ack 1");
    }

    #[test]
    fn data_frames_name_the_service() {
        let line = describe_frame(&frame(vec![0x43, 0xD5, 0x00, 0x0B, 0x10, 0x01]));
        assert!(line.contains("seq 0"));
        assert!(line.contains("property value read"));
    }

    #[test]
    fn service_counting_skips_control_frames() {
        let frames = [
            frame(vec![0x80]),
            frame(vec![0x43, 0xD5, 0x00, 0x0B, 0x10, 0x01]),
        ];
        assert_eq!(frame_service(&frames[0]), None);
        assert_eq!(
            frame_service(&frames[1]),
            Some(knx_core::management::apdu::svc::PROPERTY_READ)
        );
    }
}
