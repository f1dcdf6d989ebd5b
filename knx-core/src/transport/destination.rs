//! Per-peer connection records and the L4 state machine.
//!
//! [`Destination`] keeps the whole state machine free of I/O: every
//! transition method mutates counters under the per-destination lock and
//! hands back a list of [`Action`]s for the transport layer to execute
//! (send a control TPDU, deliver a frame upward, arm or disarm the idle
//! timer). This keeps the sequencing rules testable without a link.

use std::sync::Mutex;

use tokio::sync::{mpsc, watch};

use crate::address::IndividualAddress;
use crate::error::Error;
use crate::transport::tpdu::Tpdu;

/// Connection state of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    Disconnected,
    /// A connect request is on the wire, awaiting the medium confirmation.
    Connecting,
    /// Connection open, no send in progress.
    OpenIdle,
    /// Connection open, a numbered data TPDU awaits its acknowledgement.
    OpenWait,
    /// Terminal state; a destroyed destination never leaves it.
    Destroyed,
}

/// Which endpoint terminated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectedBy {
    Local,
    Remote,
}

/// What the state machine asks the transport layer to do after a
/// transition. Actions are executed in order, outside the destination
/// lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    /// Send a control TPDU to this peer.
    Reply(Tpdu),
    /// Deliver the inbound frame to listeners.
    Deliver,
    /// Emit a disconnect notification for this peer.
    Disconnected(DisconnectedBy),
    ArmTimer,
    DisarmTimer,
}

/// Completion signal for an in-flight connected send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendSignal {
    /// The peer acknowledged the pending sequence number.
    Acked,
    /// The peer negatively acknowledged; the send loop repeats.
    Repeat,
    /// The connection went away; the send fails with a disconnect error.
    Closed,
}

/// Outcome of [`Destination::begin_connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectStart {
    /// Transitioned to [`ConnState::Connecting`]; the caller owns sending
    /// the connect TPDU.
    Started,
    /// The connection is already open or being opened elsewhere.
    AlreadyOpen,
}

struct Inner {
    state: ConnState,
    seq_send: u8,
    seq_recv: u8,
    disconnected_by: Option<DisconnectedBy>,
    pending: Option<Pending>,
}

struct Pending {
    seq: u8,
    tx: mpsc::UnboundedSender<SendSignal>,
}

/// A logical handle to one remote device's transport session.
///
/// Created through the transport layer, which keeps exactly one
/// destination per remote address. Application code observes state through
/// the accessors and [`Destination::state_watch`]; all mutation goes
/// through the owning transport layer.
pub struct Destination {
    address: IndividualAddress,
    connection_oriented: bool,
    keep_alive: bool,
    verify_mode: bool,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnState>,
}

impl Destination {
    pub(crate) fn new(
        address: IndividualAddress,
        connection_oriented: bool,
        keep_alive: bool,
        verify_mode: bool,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnState::Disconnected);
        Self {
            address,
            connection_oriented,
            keep_alive,
            verify_mode,
            inner: Mutex::new(Inner {
                state: ConnState::Disconnected,
                seq_send: 0,
                seq_recv: 0,
                disconnected_by: None,
                pending: None,
            }),
            state_tx,
        }
    }

    pub fn address(&self) -> IndividualAddress {
        self.address
    }

    pub fn is_connection_oriented(&self) -> bool {
        self.connection_oriented
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn verify_mode(&self) -> bool {
        self.verify_mode
    }

    pub fn state(&self) -> ConnState {
        self.inner.lock().unwrap().state
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == ConnState::Destroyed
    }

    /// Who terminated the last connection, if it was ever terminated.
    pub fn disconnected_by(&self) -> Option<DisconnectedBy> {
        self.inner.lock().unwrap().disconnected_by
    }

    /// A watch over the connection state, for waiting on transitions.
    pub fn state_watch(&self) -> watch::Receiver<ConnState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, inner: &mut Inner, state: ConnState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Common exit into `Disconnected`: counters reset, the pending send
    /// is failed, the idle timer is disarmed.
    fn enter_disconnected(
        &self,
        inner: &mut Inner,
        by: DisconnectedBy,
        send_frame: bool,
        actions: &mut Vec<Action>,
    ) {
        if send_frame {
            actions.push(Action::Reply(Tpdu::Disconnect));
        }
        inner.seq_send = 0;
        inner.seq_recv = 0;
        inner.disconnected_by = Some(by);
        if let Some(pending) = inner.pending.take() {
            let _ = pending.tx.send(SendSignal::Closed);
        }
        self.set_state(inner, ConnState::Disconnected);
        actions.push(Action::DisarmTimer);
        actions.push(Action::Disconnected(by));
    }

    fn arm_action(&self) -> Option<Action> {
        (!self.keep_alive).then_some(Action::ArmTimer)
    }

    // Local API transitions.

    pub(crate) fn begin_connect(&self) -> Result<ConnectStart, Error> {
        if !self.connection_oriented {
            return Err(Error::IllegalArgument(
                "connect requires a connection-oriented destination",
            ));
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            ConnState::Destroyed => Err(Error::IllegalState("destination is destroyed")),
            ConnState::OpenIdle | ConnState::OpenWait | ConnState::Connecting => {
                Ok(ConnectStart::AlreadyOpen)
            }
            ConnState::Disconnected => {
                inner.seq_send = 0;
                inner.seq_recv = 0;
                inner.disconnected_by = None;
                self.set_state(&mut inner, ConnState::Connecting);
                Ok(ConnectStart::Started)
            }
        }
    }

    pub(crate) fn connect_outcome(&self, confirmed: bool) -> Vec<Action> {
        let mut inner = self.inner.lock().unwrap();
        let mut actions = Vec::new();
        if inner.state == ConnState::Connecting {
            if confirmed {
                self.set_state(&mut inner, ConnState::OpenIdle);
                actions.extend(self.arm_action());
            } else {
                // Never was open, so no disconnect indication.
                inner.seq_send = 0;
                inner.seq_recv = 0;
                self.set_state(&mut inner, ConnState::Disconnected);
            }
        }
        actions
    }

    /// Installs the completion channel for a connected send and moves to
    /// `OpenWait`. Returns the sequence number to put on the wire.
    pub(crate) fn start_send(
        &self,
        tx: mpsc::UnboundedSender<SendSignal>,
    ) -> Result<(u8, Vec<Action>), Error> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            ConnState::OpenIdle => {
                let seq = inner.seq_send;
                inner.pending = Some(Pending { seq, tx });
                self.set_state(&mut inner, ConnState::OpenWait);
                let mut actions = Vec::new();
                actions.extend(self.arm_action());
                Ok((seq, actions))
            }
            ConnState::Destroyed => Err(Error::IllegalState("destination is destroyed")),
            _ => Err(Error::disconnect(self.address, DisconnectedBy::Local)),
        }
    }

    /// Tears down an unfinished send, restoring the idle state.
    pub(crate) fn abort_send(&self) -> Vec<Action> {
        let mut inner = self.inner.lock().unwrap();
        inner.pending = None;
        let mut actions = Vec::new();
        if inner.state == ConnState::OpenWait {
            self.set_state(&mut inner, ConnState::OpenIdle);
            actions.extend(self.arm_action());
        }
        actions
    }

    pub(crate) fn local_disconnect(&self) -> Result<Vec<Action>, Error> {
        let mut inner = self.inner.lock().unwrap();
        let mut actions = Vec::new();
        match inner.state {
            ConnState::Destroyed => Err(Error::IllegalState("destination is destroyed")),
            ConnState::Disconnected => Ok(actions),
            _ => {
                self.enter_disconnected(&mut inner, DisconnectedBy::Local, true, &mut actions);
                Ok(actions)
            }
        }
    }

    pub(crate) fn destroy(&self) -> Vec<Action> {
        let mut inner = self.inner.lock().unwrap();
        let mut actions = Vec::new();
        match inner.state {
            ConnState::Destroyed => {}
            ConnState::Disconnected => {
                if let Some(pending) = inner.pending.take() {
                    let _ = pending.tx.send(SendSignal::Closed);
                }
                self.set_state(&mut inner, ConnState::Destroyed);
            }
            _ => {
                actions.push(Action::Reply(Tpdu::Disconnect));
                inner.disconnected_by = Some(DisconnectedBy::Local);
                if let Some(pending) = inner.pending.take() {
                    let _ = pending.tx.send(SendSignal::Closed);
                }
                self.set_state(&mut inner, ConnState::Destroyed);
                actions.push(Action::DisarmTimer);
                actions.push(Action::Disconnected(DisconnectedBy::Local));
            }
        }
        actions
    }

    pub(crate) fn idle_expired(&self) -> Vec<Action> {
        let mut inner = self.inner.lock().unwrap();
        let mut actions = Vec::new();
        if self.keep_alive {
            return actions;
        }
        if matches!(inner.state, ConnState::OpenIdle | ConnState::OpenWait) {
            self.enter_disconnected(&mut inner, DisconnectedBy::Local, true, &mut actions);
        }
        actions
    }

    // Inbound transitions.

    pub(crate) fn handle_ack(&self, seq: u8) -> Vec<Action> {
        let mut inner = self.inner.lock().unwrap();
        let mut actions = Vec::new();
        if inner.state != ConnState::OpenWait {
            return actions;
        }
        if inner.pending.as_ref().map(|p| p.seq) == Some(seq) {
            inner.seq_send = (inner.seq_send + 1) & 0x0F;
            if let Some(pending) = inner.pending.take() {
                let _ = pending.tx.send(SendSignal::Acked);
            }
            self.set_state(&mut inner, ConnState::OpenIdle);
            actions.extend(self.arm_action());
        } else {
            // Acknowledgement for a sequence we never sent.
            self.enter_disconnected(&mut inner, DisconnectedBy::Local, true, &mut actions);
        }
        actions
    }

    pub(crate) fn handle_nack(&self, seq: u8) -> Vec<Action> {
        let mut inner = self.inner.lock().unwrap();
        let mut actions = Vec::new();
        if inner.state != ConnState::OpenWait {
            return actions;
        }
        if inner.pending.as_ref().map(|p| p.seq) == Some(seq) {
            // The send loop decides whether a repeat attempt is left.
            if let Some(pending) = inner.pending.as_ref() {
                let _ = pending.tx.send(SendSignal::Repeat);
            }
        } else {
            self.enter_disconnected(&mut inner, DisconnectedBy::Local, true, &mut actions);
        }
        actions
    }

    pub(crate) fn handle_data(&self, seq: u8) -> Vec<Action> {
        let mut inner = self.inner.lock().unwrap();
        let mut actions = Vec::new();
        match inner.state {
            ConnState::OpenIdle | ConnState::OpenWait | ConnState::Connecting => {
                if seq == inner.seq_recv {
                    inner.seq_recv = (inner.seq_recv + 1) & 0x0F;
                    actions.push(Action::Reply(Tpdu::Ack { seq }));
                    actions.extend(self.arm_action());
                    actions.push(Action::Deliver);
                } else if seq == (inner.seq_recv.wrapping_sub(1)) & 0x0F {
                    // Repeated TSDU: acknowledge again, deliver nothing.
                    actions.push(Action::Reply(Tpdu::Ack { seq }));
                } else {
                    actions.push(Action::Reply(Tpdu::Nack { seq }));
                }
            }
            ConnState::Disconnected => {
                actions.push(Action::Reply(Tpdu::Disconnect));
            }
            ConnState::Destroyed => {}
        }
        actions
    }

    pub(crate) fn handle_connect_indication(&self, serve: bool) -> Vec<Action> {
        let mut inner = self.inner.lock().unwrap();
        let mut actions = Vec::new();
        match inner.state {
            ConnState::Destroyed => {}
            ConnState::Disconnected if serve => {
                inner.seq_send = 0;
                inner.seq_recv = 0;
                inner.disconnected_by = None;
                self.set_state(&mut inner, ConnState::OpenIdle);
                actions.extend(self.arm_action());
            }
            ConnState::Disconnected => {
                actions.push(Action::Reply(Tpdu::Disconnect));
            }
            ConnState::Connecting | ConnState::OpenIdle | ConnState::OpenWait => {
                if serve {
                    // Repeated connect from the peer; the session stands.
                } else {
                    // The peer restarted its endpoint; drop our session.
                    self.enter_disconnected(&mut inner, DisconnectedBy::Remote, true, &mut actions);
                }
            }
        }
        actions
    }

    pub(crate) fn handle_disconnect_indication(&self) -> Vec<Action> {
        let mut inner = self.inner.lock().unwrap();
        let mut actions = Vec::new();
        match inner.state {
            ConnState::Connecting | ConnState::OpenIdle | ConnState::OpenWait => {
                self.enter_disconnected(&mut inner, DisconnectedBy::Remote, false, &mut actions);
            }
            ConnState::Disconnected | ConnState::Destroyed => {}
        }
        actions
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("address", &self.address)
            .field(
                "mode",
                &if self.connection_oriented { "CO" } else { "CL" },
            )
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_destination() -> Destination {
        let dst = Destination::new(IndividualAddress::new(1, 1, 5), true, false, false);
        assert_eq!(dst.begin_connect().unwrap(), ConnectStart::Started);
        dst.connect_outcome(true);
        assert_eq!(dst.state(), ConnState::OpenIdle);
        dst
    }

    fn signals() -> (
        mpsc::UnboundedSender<SendSignal>,
        mpsc::UnboundedReceiver<SendSignal>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn connect_walks_through_connecting() {
        let dst = Destination::new(IndividualAddress::new(1, 1, 5), true, false, false);
        assert_eq!(dst.state(), ConnState::Disconnected);
        assert_eq!(dst.begin_connect().unwrap(), ConnectStart::Started);
        assert_eq!(dst.state(), ConnState::Connecting);
        let actions = dst.connect_outcome(true);
        assert_eq!(dst.state(), ConnState::OpenIdle);
        assert!(actions.contains(&Action::ArmTimer));
    }

    #[test]
    fn connect_on_connectionless_is_rejected() {
        let dst = Destination::new(IndividualAddress::new(1, 1, 5), false, false, false);
        assert!(matches!(
            dst.begin_connect(),
            Err(Error::IllegalArgument(_))
        ));
    }

    #[test]
    fn failed_confirmation_falls_back_to_disconnected() {
        let dst = Destination::new(IndividualAddress::new(1, 1, 5), true, false, false);
        dst.begin_connect().unwrap();
        let actions = dst.connect_outcome(false);
        assert_eq!(dst.state(), ConnState::Disconnected);
        assert!(!actions.iter().any(|a| matches!(a, Action::Disconnected(_))));
    }

    #[test]
    fn ack_advances_send_sequence() {
        let dst = open_destination();
        let (tx, mut rx) = signals();
        let (seq, _) = dst.start_send(tx).unwrap();
        assert_eq!(seq, 0);
        assert_eq!(dst.state(), ConnState::OpenWait);

        dst.handle_ack(0);
        assert_eq!(rx.try_recv().unwrap(), SendSignal::Acked);
        assert_eq!(dst.state(), ConnState::OpenIdle);

        // The next send picks up the incremented counter.
        let (tx, _rx) = signals();
        let (seq, _) = dst.start_send(tx).unwrap();
        assert_eq!(seq, 1);
    }

    #[test]
    fn foreign_ack_tears_the_connection_down() {
        let dst = open_destination();
        let (tx, mut rx) = signals();
        dst.start_send(tx).unwrap();

        let actions = dst.handle_ack(7);
        assert_eq!(dst.state(), ConnState::Disconnected);
        assert_eq!(rx.try_recv().unwrap(), SendSignal::Closed);
        assert!(actions.contains(&Action::Reply(Tpdu::Disconnect)));
        assert!(actions.contains(&Action::Disconnected(DisconnectedBy::Local)));
    }

    #[test]
    fn nack_requests_a_repeat_without_state_change() {
        let dst = open_destination();
        let (tx, mut rx) = signals();
        let (seq, _) = dst.start_send(tx).unwrap();

        dst.handle_nack(seq);
        assert_eq!(rx.try_recv().unwrap(), SendSignal::Repeat);
        assert_eq!(dst.state(), ConnState::OpenWait);

        // A later ack still completes the same send.
        dst.handle_ack(seq);
        assert_eq!(rx.try_recv().unwrap(), SendSignal::Acked);
        assert_eq!(dst.state(), ConnState::OpenIdle);
    }

    #[test]
    fn in_order_data_is_acked_and_delivered() {
        let dst = open_destination();
        let actions = dst.handle_data(0);
        assert_eq!(
            actions,
            vec![
                Action::Reply(Tpdu::Ack { seq: 0 }),
                Action::ArmTimer,
                Action::Deliver
            ]
        );
        // seq_recv advanced: the same number now counts as a repeat.
        let actions = dst.handle_data(0);
        assert_eq!(actions, vec![Action::Reply(Tpdu::Ack { seq: 0 })]);
    }

    #[test]
    fn out_of_window_data_is_nacked_without_counter_change() {
        let dst = open_destination();
        let actions = dst.handle_data(5);
        assert_eq!(actions, vec![Action::Reply(Tpdu::Nack { seq: 5 })]);
        // In-order delivery still expects sequence 0.
        let actions = dst.handle_data(0);
        assert!(actions.contains(&Action::Deliver));
    }

    #[test]
    fn duplicate_window_wraps_around() {
        let dst = open_destination();
        // seq_recv is 0, so 15 is the repeated-TSDU window.
        let actions = dst.handle_data(15);
        assert_eq!(actions, vec![Action::Reply(Tpdu::Ack { seq: 15 })]);
    }

    #[test]
    fn remote_disconnect_fails_the_pending_send() {
        let dst = open_destination();
        let (tx, mut rx) = signals();
        dst.start_send(tx).unwrap();

        let actions = dst.handle_disconnect_indication();
        assert_eq!(dst.state(), ConnState::Disconnected);
        assert_eq!(dst.disconnected_by(), Some(DisconnectedBy::Remote));
        assert_eq!(rx.try_recv().unwrap(), SendSignal::Closed);
        assert!(actions.contains(&Action::Disconnected(DisconnectedBy::Remote)));
        assert!(!actions.contains(&Action::Reply(Tpdu::Disconnect)));
    }

    #[test]
    fn sequence_counters_reset_on_reconnect() {
        let dst = open_destination();
        let (tx, _rx) = signals();
        dst.start_send(tx).unwrap();
        dst.handle_ack(0);
        dst.handle_data(0);

        dst.local_disconnect().unwrap();
        assert_eq!(dst.state(), ConnState::Disconnected);

        dst.begin_connect().unwrap();
        dst.connect_outcome(true);
        let (tx, _rx) = signals();
        let (seq, _) = dst.start_send(tx).unwrap();
        assert_eq!(seq, 0);
        let actions = dst.handle_data(0);
        assert!(actions.contains(&Action::Deliver));
    }

    #[test]
    fn idle_expiry_disconnects_open_states_only() {
        let dst = open_destination();
        let actions = dst.idle_expired();
        assert_eq!(dst.state(), ConnState::Disconnected);
        assert!(actions.contains(&Action::Reply(Tpdu::Disconnect)));

        // Already disconnected: nothing more happens.
        assert!(dst.idle_expired().is_empty());
    }

    #[test]
    fn keep_alive_suppresses_idle_expiry() {
        let dst = Destination::new(IndividualAddress::new(1, 1, 5), true, true, false);
        dst.begin_connect().unwrap();
        let actions = dst.connect_outcome(true);
        assert!(actions.is_empty());
        assert!(dst.idle_expired().is_empty());
        assert_eq!(dst.state(), ConnState::OpenIdle);
    }

    #[test]
    fn destroyed_is_terminal() {
        let dst = open_destination();
        let (tx, mut rx) = signals();
        dst.start_send(tx).unwrap();

        let actions = dst.destroy();
        assert_eq!(dst.state(), ConnState::Destroyed);
        assert_eq!(rx.try_recv().unwrap(), SendSignal::Closed);
        assert!(actions.contains(&Action::Reply(Tpdu::Disconnect)));

        assert!(dst.begin_connect().is_err());
        assert!(dst.local_disconnect().is_err());
        assert!(dst.handle_data(0).is_empty());
        assert!(dst.destroy().is_empty());
        assert_eq!(dst.state(), ConnState::Destroyed);
    }

    #[test]
    fn server_accepts_connect_indication() {
        let dst = Destination::new(IndividualAddress::new(1, 1, 9), true, false, false);
        let actions = dst.handle_connect_indication(true);
        assert_eq!(dst.state(), ConnState::OpenIdle);
        assert!(actions.contains(&Action::ArmTimer));

        // A repeated connect leaves the session alone.
        assert!(dst.handle_connect_indication(true).is_empty());
        assert_eq!(dst.state(), ConnState::OpenIdle);
    }

    #[test]
    fn client_rejects_unsolicited_connect() {
        let dst = Destination::new(IndividualAddress::new(1, 1, 9), true, false, false);
        let actions = dst.handle_connect_indication(false);
        assert_eq!(actions, vec![Action::Reply(Tpdu::Disconnect)]);
        assert_eq!(dst.state(), ConnState::Disconnected);
    }

    #[test]
    fn data_while_disconnected_draws_a_disconnect() {
        let dst = Destination::new(IndividualAddress::new(1, 1, 9), true, false, false);
        let actions = dst.handle_data(0);
        assert_eq!(actions, vec![Action::Reply(Tpdu::Disconnect)]);
    }

    #[test]
    fn aborted_send_restores_the_idle_state() {
        let dst = open_destination();
        let (tx, _rx) = signals();
        dst.start_send(tx).unwrap();
        assert_eq!(dst.state(), ConnState::OpenWait);

        let actions = dst.abort_send();
        assert_eq!(dst.state(), ConnState::OpenIdle);
        assert!(actions.contains(&Action::ArmTimer));

        // The sequence number was not consumed.
        let (tx, _rx) = signals();
        let (seq, _) = dst.start_send(tx).unwrap();
        assert_eq!(seq, 0);
    }

    #[test]
    fn send_requires_an_open_connection() {
        let dst = Destination::new(IndividualAddress::new(1, 1, 9), true, false, false);
        let (tx, _rx) = signals();
        assert!(matches!(
            dst.start_send(tx),
            Err(Error::Disconnect { .. })
        ));
    }

    #[test]
    fn stale_acknowledgement_is_ignored_when_idle() {
        let dst = open_destination();
        assert!(dst.handle_ack(0).is_empty());
        assert!(dst.handle_nack(0).is_empty());
        assert_eq!(dst.state(), ConnState::OpenIdle);
    }

    #[test]
    fn state_watch_follows_transitions() {
        let dst = Destination::new(IndividualAddress::new(1, 1, 9), true, false, false);
        let watch = dst.state_watch();
        assert_eq!(*watch.borrow(), ConnState::Disconnected);
        dst.begin_connect().unwrap();
        assert_eq!(*watch.borrow(), ConnState::Connecting);
        dst.connect_outcome(true);
        assert_eq!(*watch.borrow(), ConnState::OpenIdle);
        dst.destroy();
        assert_eq!(*watch.borrow(), ConnState::Destroyed);
    }
}
