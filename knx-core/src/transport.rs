//! Transport layer 4: connection-oriented, sequenced delivery over one
//! shared link.
//!
//! The transport layer multiplexes any number of [`Destination`]s over a
//! single [`NetworkLink`]. For connection-oriented destinations it runs
//! the L4 state machine: numbered data TPDUs, acknowledgements, bounded
//! retransmission, idle-timeout disconnects. Broadcast, group, and
//! connectionless frames pass through untouched.
//!
//! Inbound frames are dispatched by one task owned by the layer; listeners
//! subscribe through [`TransportLayer::subscribe`] and receive
//! [`TransportEvent`]s in arrival order. The dispatch task never holds the
//! outbound send gate while delivering, so a listener can issue sends from
//! its event loop without deadlocking.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::timeout;
use tokio_util::time::delay_queue::{self, DelayQueue};

use crate::address::{GroupAddress, IndividualAddress, KnxAddress};
use crate::error::Error;
use crate::link::{FrameEvent, LinkEvent, MediumInfo, Priority, SharedLink};
use crate::FxDashMap;

mod destination;
pub use destination::{ConnState, Destination, DisconnectedBy};
use destination::{Action, ConnectStart, SendSignal};

pub mod tpdu;
use tpdu::Tpdu;

/// How long a numbered data TPDU waits for its acknowledgement.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Send attempts per TSDU: one initial transmission plus three repeats.
pub const MAX_SEND_ATTEMPTS: usize = 4;

/// Idle time after which a connection without keep-alive is dropped. Also
/// the longest a peer-initiated disconnect can take to arrive.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(6);

/// Largest TSDU the transport layer accepts from above.
const MAX_TSDU: usize = 254;

/// Tuning knobs for a [`TransportLayer`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub ack_timeout: Duration,
    pub max_send_attempts: usize,
    pub idle_timeout: Duration,
    /// Accept unsolicited inbound connects by creating a served
    /// destination, the minimal device-side behaviour.
    pub serve_incoming: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ack_timeout: ACK_TIMEOUT,
            max_send_attempts: MAX_SEND_ATTEMPTS,
            idle_timeout: DISCONNECT_TIMEOUT,
            serve_incoming: false,
        }
    }
}

/// What the transport layer reports to its subscribers.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A frame addressed to the bus-wide broadcast.
    Broadcast(FrameEvent),
    /// A frame addressed to a group.
    Group(FrameEvent),
    /// Connectionless data addressed to this endpoint.
    Individual(FrameEvent),
    /// Sequenced data from an open connection, already acknowledged and
    /// de-duplicated.
    Connected(FrameEvent),
    /// A connection-oriented destination left the open state.
    Disconnected {
        address: IndividualAddress,
        initiator: DisconnectedBy,
    },
    /// The layer detached from its link and is unusable from now on.
    Detached,
}

enum TimerCmd {
    Arm(IndividualAddress),
    Disarm(IndividualAddress),
    Shutdown,
}

/// The per-link transport layer. Construct with [`TransportLayer::new`];
/// the returned `Arc` is the only handle, background tasks hold weak
/// references and stop when it drops.
pub struct TransportLayer {
    link: SharedLink,
    config: TransportConfig,
    destinations: FxDashMap<IndividualAddress, Arc<Destination>>,
    /// Serializes connected sends; only one may be in flight per layer so
    /// that responses stay correlated to their requests.
    send_gate: tokio::sync::Mutex<()>,
    events: broadcast::Sender<TransportEvent>,
    timer: mpsc::UnboundedSender<TimerCmd>,
    detached: OnceLock<()>,
    detach_notify: Arc<Notify>,
}

impl TransportLayer {
    /// Binds a new transport layer to `link` and starts its dispatch and
    /// timer tasks. Must be called from within a tokio runtime.
    pub fn new(link: SharedLink, config: TransportConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(512);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let layer = Arc::new(Self {
            link,
            config,
            destinations: FxDashMap::default(),
            send_gate: tokio::sync::Mutex::new(()),
            events,
            timer: timer_tx,
            detached: OnceLock::new(),
            detach_notify: Arc::new(Notify::new()),
        });
        tokio::spawn(dispatch(
            Arc::downgrade(&layer),
            layer.link.subscribe(),
            layer.detach_notify.clone(),
        ));
        tokio::spawn(idle_timer(
            Arc::downgrade(&layer),
            timer_rx,
            layer.config.idle_timeout,
        ));
        layer
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn link(&self) -> &SharedLink {
        &self.link
    }

    pub fn medium(&self) -> MediumInfo {
        self.link.medium()
    }

    /// Registers for transport events. Events sent before the call are
    /// not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.get().is_some()
    }

    fn ensure_attached(&self) -> Result<(), Error> {
        if self.is_detached() {
            return Err(Error::IllegalState("transport layer is detached"));
        }
        Ok(())
    }

    /// Creates the destination record for `address`. Fails if one already
    /// exists; a destroyed destination frees its slot.
    pub fn create_destination(
        &self,
        address: IndividualAddress,
        connection_oriented: bool,
    ) -> Result<Arc<Destination>, Error> {
        self.create_destination_with(address, connection_oriented, false, false)
    }

    pub fn create_destination_with(
        &self,
        address: IndividualAddress,
        connection_oriented: bool,
        keep_alive: bool,
        verify_mode: bool,
    ) -> Result<Arc<Destination>, Error> {
        self.ensure_attached()?;
        match self.destinations.entry(address) {
            Entry::Occupied(_) => {
                tracing::error!(peer = %address, "destination already exists");
                Err(Error::IllegalState("destination already exists for address"))
            }
            Entry::Vacant(entry) => {
                let destination = Arc::new(Destination::new(
                    address,
                    connection_oriented,
                    keep_alive,
                    verify_mode,
                ));
                entry.insert(destination.clone());
                Ok(destination)
            }
        }
    }

    pub fn get_destination(&self, address: IndividualAddress) -> Option<Arc<Destination>> {
        self.destinations.get(&address).map(|e| e.value().clone())
    }

    /// Destroys a destination: pending operations fail with a disconnect
    /// error, timers are cancelled, and the address slot is freed.
    pub async fn destroy_destination(&self, destination: &Arc<Destination>) {
        self.destinations.remove(&destination.address());
        let actions = destination.destroy();
        self.run_actions(destination, None, actions).await;
    }

    /// Opens the connection to a connection-oriented destination. Returns
    /// once the connect TPDU is confirmed by the medium; an already open
    /// connection is left alone.
    pub async fn connect(&self, destination: &Arc<Destination>) -> Result<(), Error> {
        self.ensure_attached()?;
        match destination.begin_connect()? {
            ConnectStart::AlreadyOpen => self.await_not_connecting(destination).await,
            ConnectStart::Started => {
                let result = self
                    .link
                    .send_request_wait(
                        KnxAddress::Individual(destination.address()),
                        Priority::System,
                        &[tpdu::CONNECT],
                    )
                    .await;
                let actions = destination.connect_outcome(result.is_ok());
                self.run_actions(destination, None, actions).await;
                result
            }
        }
    }

    /// Waits out a concurrent connect on the same destination.
    async fn await_not_connecting(&self, destination: &Arc<Destination>) -> Result<(), Error> {
        let mut watch = destination.state_watch();
        loop {
            let state = *watch.borrow_and_update();
            match state {
                ConnState::OpenIdle | ConnState::OpenWait => return Ok(()),
                ConnState::Disconnected => {
                    return Err(Error::disconnect(
                        destination.address(),
                        destination
                            .disconnected_by()
                            .unwrap_or(DisconnectedBy::Local),
                    ))
                }
                ConnState::Destroyed => {
                    return Err(Error::IllegalState("destination is destroyed"))
                }
                ConnState::Connecting => {
                    if watch.changed().await.is_err() {
                        return Err(Error::Interrupted);
                    }
                }
            }
        }
    }

    /// Closes the connection, notifying the peer.
    pub async fn disconnect(&self, destination: &Arc<Destination>) -> Result<(), Error> {
        let actions = destination.local_disconnect()?;
        self.run_actions(destination, None, actions).await;
        Ok(())
    }

    /// Sends a TSDU over an open connection and waits for the peer's
    /// acknowledgement, retransmitting up to the configured attempt
    /// budget. A disconnected destination is connected first.
    ///
    /// Exhausting the budget disconnects the destination and fails with a
    /// disconnect error, as does a peer- or destroy-initiated teardown
    /// while waiting.
    pub async fn send_connected(
        &self,
        destination: &Arc<Destination>,
        priority: Priority,
        tsdu: &[u8],
    ) -> Result<(), Error> {
        self.ensure_attached()?;
        if !destination.is_connection_oriented() {
            return Err(Error::IllegalArgument(
                "connected send requires a connection-oriented destination",
            ));
        }
        validate_tsdu(tsdu)?;

        let _gate = self.send_gate.lock().await;
        match destination.state() {
            ConnState::Disconnected | ConnState::Connecting => self.connect(destination).await?,
            ConnState::Destroyed => return Err(Error::IllegalState("destination is destroyed")),
            ConnState::OpenIdle | ConnState::OpenWait => {}
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (seq, actions) = destination.start_send(tx)?;
        self.run_actions(destination, None, actions).await;
        let frame = tpdu::data_connected(seq, tsdu);

        let mut attempt = 0;
        while attempt < self.config.max_send_attempts {
            attempt += 1;
            if let Err(e) = self
                .link
                .send_request_wait(
                    KnxAddress::Individual(destination.address()),
                    priority,
                    &frame,
                )
                .await
            {
                let actions = destination.abort_send();
                self.run_actions(destination, None, actions).await;
                return Err(e);
            }
            // Every attempt counts as traffic for the idle disconnect.
            if !destination.keep_alive() {
                let _ = self.timer.send(TimerCmd::Arm(destination.address()));
            }
            match timeout(self.config.ack_timeout, rx.recv()).await {
                Ok(Some(SendSignal::Acked)) => return Ok(()),
                Ok(Some(SendSignal::Repeat)) => continue,
                Ok(Some(SendSignal::Closed)) | Ok(None) => {
                    return Err(Error::disconnect(
                        destination.address(),
                        destination
                            .disconnected_by()
                            .unwrap_or(DisconnectedBy::Local),
                    ))
                }
                Err(_) => continue,
            }
        }

        tracing::info!(
            peer = %destination.address(),
            attempts = attempt,
            "no acknowledgement, disconnecting"
        );
        if let Ok(actions) = destination.local_disconnect() {
            self.run_actions(destination, None, actions).await;
        }
        Err(Error::disconnect(
            destination.address(),
            DisconnectedBy::Local,
        ))
    }

    /// Sends connectionless data to an individual address.
    pub async fn send_data(
        &self,
        address: IndividualAddress,
        priority: Priority,
        tsdu: &[u8],
    ) -> Result<(), Error> {
        self.ensure_attached()?;
        validate_tsdu(tsdu)?;
        self.link
            .send_request_wait(
                KnxAddress::Individual(address),
                priority,
                &tpdu::data(tsdu),
            )
            .await
    }

    /// Sends a (system) broadcast. Whether the system flavour differs
    /// from the plain broadcast on the wire is a property of the medium;
    /// on TP1 the two coincide and the link frames both as group
    /// address 0.
    pub async fn broadcast(
        &self,
        system: bool,
        priority: Priority,
        tsdu: &[u8],
    ) -> Result<(), Error> {
        let _ = system;
        self.ensure_attached()?;
        validate_tsdu(tsdu)?;
        self.link
            .send_request_wait(
                KnxAddress::Group(GroupAddress::BROADCAST),
                priority,
                &tpdu::data(tsdu),
            )
            .await
    }

    /// Detaches from the link: all destinations are destroyed, subscribers
    /// receive [`TransportEvent::Detached`], and every further operation
    /// fails. One-shot and irreversible; the link itself stays open.
    pub async fn detach(&self) {
        self.detach_inner().await;
    }

    async fn detach_inner(&self) {
        if self.detached.set(()).is_err() {
            return;
        }
        tracing::debug!(link = self.link.name(), "detaching transport layer");
        let peers: Vec<Arc<Destination>> = self
            .destinations
            .iter()
            .map(|e| e.value().clone())
            .collect();
        self.destinations.clear();
        for destination in peers {
            let actions = destination.destroy();
            self.run_actions(&destination, None, actions).await;
        }
        let _ = self.events.send(TransportEvent::Detached);
        let _ = self.timer.send(TimerCmd::Shutdown);
        self.detach_notify.notify_one();
    }

    async fn idle_expired(&self, address: IndividualAddress) {
        if let Some(destination) = self.get_destination(address) {
            let actions = destination.idle_expired();
            if !actions.is_empty() {
                tracing::debug!(peer = %address, "idle timeout, disconnecting");
            }
            self.run_actions(&destination, None, actions).await;
        }
    }

    async fn handle_frame(&self, frame: FrameEvent) {
        match frame.destination {
            KnxAddress::Group(group) if group.is_broadcast() => {
                let _ = self.events.send(TransportEvent::Broadcast(frame));
            }
            KnxAddress::Group(_) => {
                let _ = self.events.send(TransportEvent::Group(frame));
            }
            KnxAddress::Individual(local) => {
                if local != self.link.medium().address {
                    return;
                }
                let Some(control) = frame.tpdu.first().copied().and_then(Tpdu::parse) else {
                    tracing::debug!(source = %frame.source, "dropping malformed TPDU");
                    return;
                };
                let peer = self.get_destination(frame.source);
                match control {
                    Tpdu::Data { .. } => {
                        let _ = self.events.send(TransportEvent::Individual(frame));
                    }
                    Tpdu::Connect => self.handle_connect_indication(frame.source, peer).await,
                    Tpdu::Disconnect => {
                        if let Some(destination) = peer {
                            let actions = destination.handle_disconnect_indication();
                            self.run_actions(&destination, None, actions).await;
                        }
                    }
                    Tpdu::Ack { seq } => match peer {
                        Some(destination) if destination.is_connection_oriented() => {
                            let actions = destination.handle_ack(seq);
                            self.run_actions(&destination, None, actions).await;
                        }
                        _ => self.reject_unexpected(frame.source).await,
                    },
                    Tpdu::Nack { seq } => match peer {
                        Some(destination) if destination.is_connection_oriented() => {
                            let actions = destination.handle_nack(seq);
                            self.run_actions(&destination, None, actions).await;
                        }
                        _ => self.reject_unexpected(frame.source).await,
                    },
                    Tpdu::DataConnected { seq, .. } => match peer {
                        Some(destination) if destination.is_connection_oriented() => {
                            let actions = destination.handle_data(seq);
                            self.run_actions(&destination, Some(&frame), actions).await;
                        }
                        _ => self.reject_unexpected(frame.source).await,
                    },
                }
            }
        }
    }

    async fn handle_connect_indication(
        &self,
        source: IndividualAddress,
        peer: Option<Arc<Destination>>,
    ) {
        match peer {
            Some(destination) if destination.is_connection_oriented() => {
                let actions = destination.handle_connect_indication(self.config.serve_incoming);
                self.run_actions(&destination, None, actions).await;
            }
            Some(connectionless) => {
                if self.config.serve_incoming {
                    // A served connection replaces the connectionless record.
                    self.destroy_destination(&connectionless).await;
                    self.accept_connect(source).await;
                } else {
                    self.reject_unexpected(source).await;
                }
            }
            None => {
                if self.config.serve_incoming {
                    self.accept_connect(source).await;
                } else {
                    self.reject_unexpected(source).await;
                }
            }
        }
    }

    async fn accept_connect(&self, source: IndividualAddress) {
        let destination = match self.create_destination(source, true) {
            Ok(destination) => destination,
            Err(_) => return,
        };
        tracing::debug!(peer = %source, "accepted incoming connect");
        let actions = destination.handle_connect_indication(true);
        self.run_actions(&destination, None, actions).await;
    }

    /// A control or numbered TPDU from an address we hold no session
    /// with: tell the sender its session is gone.
    async fn reject_unexpected(&self, source: IndividualAddress) {
        tracing::debug!(source = %source, "unexpected connection-oriented TPDU");
        if let Err(e) = self
            .link
            .send_request(
                KnxAddress::Individual(source),
                Priority::System,
                &[tpdu::DISCONNECT],
            )
            .await
        {
            tracing::debug!(source = %source, error = %e, "failed to reject sender");
        }
    }

    async fn run_actions(
        &self,
        destination: &Destination,
        frame: Option<&FrameEvent>,
        actions: Vec<Action>,
    ) {
        for action in actions {
            match action {
                Action::Reply(control) => {
                    let bytes = [control.control_byte()];
                    if let Err(e) = self
                        .link
                        .send_request(
                            KnxAddress::Individual(destination.address()),
                            Priority::System,
                            &bytes,
                        )
                        .await
                    {
                        tracing::debug!(
                            peer = %destination.address(),
                            error = %e,
                            "failed to send control TPDU"
                        );
                    }
                }
                Action::Deliver => {
                    if let Some(frame) = frame {
                        let _ = self.events.send(TransportEvent::Connected(frame.clone()));
                    }
                }
                Action::Disconnected(initiator) => {
                    let _ = self.events.send(TransportEvent::Disconnected {
                        address: destination.address(),
                        initiator,
                    });
                }
                Action::ArmTimer => {
                    let _ = self.timer.send(TimerCmd::Arm(destination.address()));
                }
                Action::DisarmTimer => {
                    let _ = self.timer.send(TimerCmd::Disarm(destination.address()));
                }
            }
        }
    }
}

impl std::fmt::Debug for TransportLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLayer")
            .field("link", &self.link.name())
            .field("destinations", &self.destinations.len())
            .field("detached", &self.is_detached())
            .finish()
    }
}

fn validate_tsdu(tsdu: &[u8]) -> Result<(), Error> {
    if tsdu.is_empty() || tsdu.len() > MAX_TSDU {
        return Err(Error::IllegalArgument("TSDU length out of range"));
    }
    Ok(())
}

/// Routes inbound link events into the layer until detach or link close.
async fn dispatch(
    layer: Weak<TransportLayer>,
    mut events: broadcast::Receiver<LinkEvent>,
    detach: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = detach.notified() => break,
            event = events.recv() => match event {
                Ok(LinkEvent::Indication(frame)) => {
                    let Some(layer) = layer.upgrade() else { break };
                    if layer.is_detached() {
                        break;
                    }
                    layer.handle_frame(frame).await;
                }
                Ok(LinkEvent::Closed) => {
                    if let Some(layer) = layer.upgrade() {
                        tracing::info!(link = layer.link.name(), "link closed");
                        layer.detach_inner().await;
                    }
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "transport dispatch lagging behind the link");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// The idle-disconnect service: one delay queue of (deadline, peer)
/// entries shared by all destinations of the layer.
async fn idle_timer(
    layer: Weak<TransportLayer>,
    mut commands: mpsc::UnboundedReceiver<TimerCmd>,
    idle_timeout: Duration,
) {
    let mut queue: DelayQueue<IndividualAddress> = DelayQueue::new();
    let mut keys: rustc_hash::FxHashMap<IndividualAddress, delay_queue::Key> =
        rustc_hash::FxHashMap::default();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(TimerCmd::Arm(address)) => match keys.get(&address) {
                    Some(key) => queue.reset(key, idle_timeout),
                    None => {
                        keys.insert(address, queue.insert(address, idle_timeout));
                    }
                },
                Some(TimerCmd::Disarm(address)) => {
                    if let Some(key) = keys.remove(&address) {
                        queue.remove(&key);
                    }
                }
                Some(TimerCmd::Shutdown) | None => break,
            },
            Some(expired) = queue.next(), if !keys.is_empty() => {
                let address = expired.into_inner();
                keys.remove(&address);
                let Some(layer) = layer.upgrade() else { break };
                layer.idle_expired(address).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::KnxMedium;
    use crate::links::Bus;

    const CLIENT: IndividualAddress = IndividualAddress::new(1, 1, 1);
    const PEER: IndividualAddress = IndividualAddress::new(1, 1, 5);

    fn layer_on(bus: &Bus) -> Arc<TransportLayer> {
        TransportLayer::new(bus.attach(CLIENT), TransportConfig::default())
    }

    #[tokio::test]
    async fn one_destination_per_address() {
        let bus = Bus::new(KnxMedium::Tp1);
        let layer = layer_on(&bus);
        let first = layer.create_destination(PEER, true).unwrap();
        assert!(matches!(
            layer.create_destination(PEER, false),
            Err(Error::IllegalState(_))
        ));
        layer.destroy_destination(&first).await;
        // A destroyed destination frees its address slot.
        layer.create_destination(PEER, false).unwrap();
    }

    #[tokio::test]
    async fn tsdu_length_is_validated() {
        let bus = Bus::new(KnxMedium::Tp1);
        let layer = layer_on(&bus);
        assert!(matches!(
            layer.send_data(PEER, Priority::Low, &[]).await,
            Err(Error::IllegalArgument(_))
        ));
        let oversized = vec![0u8; 255];
        assert!(matches!(
            layer.broadcast(true, Priority::Low, &oversized).await,
            Err(Error::IllegalArgument(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn served_connection_survives_a_dropped_frame() {
        let bus = Bus::new(KnxMedium::Tp1);
        let client = layer_on(&bus);
        let server = TransportLayer::new(
            bus.attach(PEER),
            TransportConfig {
                serve_incoming: true,
                ..Default::default()
            },
        );
        let mut server_events = server.subscribe();

        let destination = client.create_destination(PEER, true).unwrap();
        client.connect(&destination).await.unwrap();

        // Swallow the first data attempt; the repeat must get through.
        bus.drop_next(1);
        client
            .send_connected(&destination, Priority::Low, &[0x00, 0x80, 0x00])
            .await
            .unwrap();
        loop {
            let event = timeout(Duration::from_secs(60), server_events.recv())
                .await
                .expect("no delivery on the server side")
                .unwrap();
            if let TransportEvent::Connected(frame) = event {
                assert_eq!(frame.tpdu, vec![0x40, 0x80, 0x00]);
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_loss_exhausts_the_send_budget() {
        let bus = Bus::new(KnxMedium::Tp1);
        let layer = layer_on(&bus);
        let destination = layer.create_destination(PEER, true).unwrap();
        layer.connect(&destination).await.unwrap();

        bus.set_loss(1.0, 7);
        let result = layer
            .send_connected(&destination, Priority::Low, &[0x00, 0x80, 0x00])
            .await;
        assert!(matches!(result, Err(Error::Disconnect { .. })));
        assert_eq!(destination.state(), ConnState::Disconnected);
    }

    #[tokio::test]
    async fn detach_rejects_further_use() {
        let bus = Bus::new(KnxMedium::Tp1);
        let layer = layer_on(&bus);
        layer.detach().await;
        assert!(layer.is_detached());
        assert!(matches!(
            layer.create_destination(PEER, true),
            Err(Error::IllegalState(_))
        ));
        assert!(matches!(
            layer.send_data(PEER, Priority::Low, &[0x00, 0x00]).await,
            Err(Error::IllegalState(_))
        ));
    }
}
