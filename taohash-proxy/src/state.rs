use std::collections::VecDeque;
use taohash_stratum::{methods, StratumMessage};
use tracing::{debug, warn};

/// Protocol state of one miner connection.
///
/// Handshake states advance monotonically; the only way backwards is the
/// error/disconnect path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerState {
    Connected,
    Subscribing,
    Subscribed,
    Authorizing,
    Authorized,
    Active,
    Error,
    Disconnecting,
    Disconnected,
}

impl MinerState {
    /// Early handshake states in which not-yet-handleable miner messages are
    /// queued instead of rejected, so a miner that races ahead does not lose
    /// the attempt.
    pub fn queues_messages(&self) -> bool {
        matches!(
            self,
            MinerState::Connected | MinerState::Subscribing | MinerState::Subscribed
        )
    }
}

/// Per-connection Stratum state machine with message queues for both
/// directions.
pub struct StateMachine {
    miner_id: String,
    state: MinerState,
    queued_miner_messages: VecDeque<StratumMessage>,
    queued_pool_messages: VecDeque<StratumMessage>,
}

impl StateMachine {
    pub fn new(miner_id: &str) -> Self {
        Self {
            miner_id: miner_id.to_string(),
            state: MinerState::Connected,
            queued_miner_messages: VecDeque::new(),
            queued_pool_messages: VecDeque::new(),
        }
    }

    pub fn state(&self) -> MinerState {
        self.state
    }

    /// Attempt a transition. Illegal transitions are refused and logged.
    pub fn transition_to(&mut self, next: MinerState) -> bool {
        if Self::is_legal(self.state, next) {
            debug!(
                "[{}] State change: {:?} -> {:?}",
                self.miner_id, self.state, next
            );
            self.state = next;
            true
        } else {
            warn!(
                "[{}] Refused state change: {:?} -> {:?}",
                self.miner_id, self.state, next
            );
            false
        }
    }

    fn is_legal(from: MinerState, to: MinerState) -> bool {
        use MinerState::*;
        match (from, to) {
            (Connected, Subscribing)
            | (Subscribing, Subscribed)
            | (Subscribed, Authorizing)
            | (Authorizing, Authorized)
            | (Authorized, Active)
            | (Active, Active) => true,
            (Disconnected, _) => false,
            (_, Error) => true,
            (_, Disconnecting) => true,
            (Disconnecting, Disconnected) => true,
            _ => false,
        }
    }

    /// Whether a miner message with this method may be handled right now.
    pub fn can_handle(&self, method: &str) -> bool {
        match method {
            methods::SUBSCRIBE => self.state == MinerState::Connected,
            methods::AUTHORIZE => self.state == MinerState::Subscribed,
            methods::SUBMIT => self.state == MinerState::Active,
            methods::SUGGEST_DIFFICULTY | methods::SUGGEST_TARGET => !matches!(
                self.state,
                MinerState::Error | MinerState::Disconnecting | MinerState::Disconnected
            ),
            _ => self.state == MinerState::Active,
        }
    }

    pub fn queue_miner_message(&mut self, message: StratumMessage) {
        self.queued_miner_messages.push_back(message);
    }

    pub fn queue_pool_message(&mut self, message: StratumMessage) {
        self.queued_pool_messages.push_back(message);
    }

    pub fn has_queued(&self) -> bool {
        !self.queued_miner_messages.is_empty() || !self.queued_pool_messages.is_empty()
    }

    pub fn take_queued_miner_messages(&mut self) -> Vec<StratumMessage> {
        self.queued_miner_messages.drain(..).collect()
    }

    pub fn take_queued_pool_messages(&mut self) -> Vec<StratumMessage> {
        self.queued_pool_messages.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> StateMachine {
        StateMachine::new("127.0.0.1:4000")
    }

    #[test]
    fn test_happy_path_is_legal() {
        let mut sm = machine();
        for next in [
            MinerState::Subscribing,
            MinerState::Subscribed,
            MinerState::Authorizing,
            MinerState::Authorized,
            MinerState::Active,
            MinerState::Active,
            MinerState::Disconnecting,
            MinerState::Disconnected,
        ] {
            assert!(sm.transition_to(next), "transition to {next:?} refused");
        }
    }

    #[test]
    fn test_skipping_states_is_refused() {
        let mut sm = machine();
        assert!(!sm.transition_to(MinerState::Subscribed));
        assert!(!sm.transition_to(MinerState::Active));
        assert_eq!(sm.state(), MinerState::Connected);
    }

    #[test]
    fn test_error_reachable_from_anywhere_but_terminal() {
        let mut sm = machine();
        assert!(sm.transition_to(MinerState::Subscribing));
        assert!(sm.transition_to(MinerState::Error));
        assert!(sm.transition_to(MinerState::Disconnecting));
        assert!(sm.transition_to(MinerState::Disconnected));
        assert!(!sm.transition_to(MinerState::Error));
        assert!(!sm.transition_to(MinerState::Connected));
    }

    #[test]
    fn test_can_handle_per_state() {
        let mut sm = machine();
        assert!(sm.can_handle(methods::SUBSCRIBE));
        assert!(!sm.can_handle(methods::AUTHORIZE));
        assert!(!sm.can_handle(methods::SUBMIT));

        sm.transition_to(MinerState::Subscribing);
        sm.transition_to(MinerState::Subscribed);
        assert!(sm.can_handle(methods::AUTHORIZE));
        assert!(!sm.can_handle(methods::SUBSCRIBE));

        sm.transition_to(MinerState::Authorizing);
        sm.transition_to(MinerState::Authorized);
        sm.transition_to(MinerState::Active);
        assert!(sm.can_handle(methods::SUBMIT));
        assert!(sm.can_handle("client.get_version"));
    }

    #[test]
    fn test_early_states_queue() {
        let sm = machine();
        assert!(sm.state().queues_messages());

        let mut sm = machine();
        sm.transition_to(MinerState::Subscribing);
        sm.transition_to(MinerState::Subscribed);
        sm.transition_to(MinerState::Authorizing);
        assert!(!sm.state().queues_messages());
    }

    #[test]
    fn test_queues_drain_in_order() {
        let mut sm = machine();
        let first = taohash_stratum::parse_line(r#"{"id":1,"method":"mining.submit","params":[]}"#)
            .unwrap();
        let second = taohash_stratum::parse_line(r#"{"id":2,"method":"mining.submit","params":[]}"#)
            .unwrap();
        sm.queue_miner_message(first);
        sm.queue_miner_message(second);

        let drained = sm.take_queued_miner_messages();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id(), Some(&1.into()));
        assert!(!sm.has_queued());
    }
}
