//! Session and mission state machine.
//!
//! A sparse `(state, event) → state` table drives every phase change;
//! undefined pairs are rejected without side effect. Each state also
//! carries the set of NID_MESSAGE values it admits inbound — the engine
//! consults it before dispatch. History is append-only and diagnostic
//! only; the protocol never reads it back.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::kpi::now_ms;
use crate::message::nid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Ready = 1,
    HandshakeInitiated = 2,
    VersionExchanged = 3,
    SessionEstablished = 4,
    TrainDataExchanged = 5,
    MaRequestReady = 6,
    MissionActive = 7,
    MissionMonitoring = 8,
    SessionTerminated = 9,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    Connected,
    Reset,
    Au1Sent,
    Disconnect,
    Au2Received,
    M32Sent,
    Timeout,
    M32Acked,
    M38Sent,
    M38Received,
    VersionMismatch,
    M8Received,
    M8Acked,
    M41Sent,
    M41Acked,
    M41Received,
    M3Sent,
    M3Received,
    TrainRejected,
    SessionTerminated,
    MonitoringStarted,
    MaExpired,
    EmergencyStop,
    PositionUpdate,
    MissionComplete,
}

/// One line of the diagnostic transition history.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: SessionState,
    pub to: SessionState,
    pub event: SessionEvent,
    pub at_ms: u64,
}

/// The exact transition table.
fn next_state(state: SessionState, event: SessionEvent) -> Option<SessionState> {
    use SessionEvent as E;
    use SessionState as S;
    Some(match (state, event) {
        (S::Disconnected, E::Connected) => S::Ready,
        (S::Disconnected, E::Reset) => S::Disconnected,
        (S::Ready, E::Au1Sent) => S::HandshakeInitiated,
        (S::Ready, E::Disconnect) => S::Disconnected,
        (S::HandshakeInitiated, E::Au2Received) => S::VersionExchanged,
        (S::HandshakeInitiated, E::M32Sent) => S::VersionExchanged,
        (S::HandshakeInitiated, E::Timeout) => S::Disconnected,
        (S::VersionExchanged, E::M32Acked) => S::SessionEstablished,
        (S::VersionExchanged, E::M38Sent) => S::VersionExchanged,
        (S::VersionExchanged, E::VersionMismatch) => S::Disconnected,
        (S::SessionEstablished, E::M8Received) => S::TrainDataExchanged,
        (S::SessionEstablished, E::M8Acked) => S::TrainDataExchanged,
        (S::SessionEstablished, E::M38Sent) => S::SessionEstablished,
        (S::SessionEstablished, E::M38Received) => S::SessionEstablished,
        (S::SessionEstablished, E::M41Sent) => S::MaRequestReady,
        (S::SessionEstablished, E::SessionTerminated) => S::Disconnected,
        (S::TrainDataExchanged, E::M3Received) => S::MissionActive,
        (S::TrainDataExchanged, E::M41Acked) => S::MaRequestReady,
        (S::TrainDataExchanged, E::M41Received) => S::TrainDataExchanged,
        (S::TrainDataExchanged, E::M8Received) => S::TrainDataExchanged,
        (S::TrainDataExchanged, E::M8Acked) => S::TrainDataExchanged,
        (S::TrainDataExchanged, E::TrainRejected) => S::Disconnected,
        (S::MaRequestReady, E::M3Sent) => S::MissionActive,
        (S::MaRequestReady, E::M3Received) => S::MissionActive,
        (S::MissionActive, E::MonitoringStarted) => S::MissionMonitoring,
        (S::MissionActive, E::MaExpired) => S::Disconnected,
        (S::MissionActive, E::EmergencyStop) => S::Disconnected,
        (S::MissionMonitoring, E::PositionUpdate) => S::MissionMonitoring,
        (S::MissionMonitoring, E::MissionComplete) => S::SessionTerminated,
        (S::SessionTerminated, E::Reset) => S::Disconnected,
        _ => return None,
    })
}

/// Inbound NID_MESSAGE admit-set per state.
pub fn admit_set(state: SessionState) -> &'static [u8] {
    use SessionState as S;
    match state {
        S::Disconnected => &[],
        S::Ready => &[nid::AU1],
        S::HandshakeInitiated => &[32, 155],
        S::VersionExchanged => &[32, 38, 146, 155, 159],
        S::SessionEstablished => &[8, 38, 129, 146, 155, 159, 157],
        S::TrainDataExchanged => &[3, 41, 157, 146, 40],
        S::MaRequestReady => &[132, 146, 129, 3],
        S::MissionActive => &[15, 16, 42, 132, 136],
        S::MissionMonitoring => &[136, 146, 150, 156],
        S::SessionTerminated => &[150, 156, 39],
    }
}

type Hook = Box<dyn FnMut(SessionState) + Send + Sync>;

pub struct SessionFsm {
    state: SessionState,
    history: Vec<TransitionRecord>,
    on_enter: HashMap<SessionState, Hook>,
    on_exit: HashMap<SessionState, Hook>,
}

impl Default for SessionFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionFsm {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            history: Vec::new(),
            on_enter: HashMap::new(),
            on_exit: HashMap::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    pub fn set_on_enter(&mut self, state: SessionState, hook: Hook) {
        self.on_enter.insert(state, hook);
    }

    pub fn set_on_exit(&mut self, state: SessionState, hook: Hook) {
        self.on_exit.insert(state, hook);
    }

    /// Apply `event`. Undefined pairs return false with no side effect.
    pub fn transition(&mut self, event: SessionEvent) -> bool {
        let Some(to) = next_state(self.state, event) else {
            warn!(state = ?self.state, ?event, "no transition defined, ignoring");
            return false;
        };
        let from = self.state;
        if let Some(hook) = self.on_exit.get_mut(&from) {
            hook(from);
        }
        self.history.push(TransitionRecord { from, to, event, at_ms: now_ms() });
        self.state = to;
        info!(?from, ?to, ?event, "session transition");
        if let Some(hook) = self.on_enter.get_mut(&to) {
            hook(to);
        }
        true
    }

    /// Membership test against the current state's admit-set.
    pub fn validate_message(&self, nid_message: u8) -> bool {
        admit_set(self.state).contains(&nid_message)
    }

    /// Unconditional return to DISCONNECTED; clears history and re-runs
    /// the DISCONNECTED enter hook.
    pub fn reset(&mut self) {
        debug!(from = ?self.state, "session reset");
        self.state = SessionState::Disconnected;
        self.history.clear();
        if let Some(hook) = self.on_enter.get_mut(&SessionState::Disconnected) {
            hook(SessionState::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn happy_path_reaches_termination() {
        use SessionEvent as E;
        let mut fsm = SessionFsm::new();
        for (event, expect) in [
            (E::Connected, SessionState::Ready),
            (E::Au1Sent, SessionState::HandshakeInitiated),
            (E::Au2Received, SessionState::VersionExchanged),
            (E::M32Acked, SessionState::SessionEstablished),
            (E::M8Acked, SessionState::TrainDataExchanged),
            (E::M41Acked, SessionState::MaRequestReady),
            (E::M3Received, SessionState::MissionActive),
            (E::MonitoringStarted, SessionState::MissionMonitoring),
            (E::PositionUpdate, SessionState::MissionMonitoring),
            (E::MissionComplete, SessionState::SessionTerminated),
            (E::Reset, SessionState::Disconnected),
        ] {
            assert!(fsm.transition(event), "{event:?} rejected in {:?}", fsm.state());
            assert_eq!(fsm.state(), expect);
        }
    }

    #[test]
    fn undefined_pair_is_a_noop_returning_false() {
        let mut fsm = SessionFsm::new();
        let before = fsm.history().len();
        assert!(!fsm.transition(SessionEvent::M3Received));
        assert_eq!(fsm.state(), SessionState::Disconnected);
        assert_eq!(fsm.history().len(), before);
    }

    #[test]
    fn history_grows_per_successful_transition_only() {
        let mut fsm = SessionFsm::new();
        assert!(fsm.transition(SessionEvent::Connected));
        assert_eq!(fsm.history().len(), 1);
        assert!(!fsm.transition(SessionEvent::MissionComplete));
        assert_eq!(fsm.history().len(), 1);
        assert!(fsm.transition(SessionEvent::Au1Sent));
        assert_eq!(fsm.history().len(), 2);
        let rec = &fsm.history()[1];
        assert_eq!(rec.from, SessionState::Ready);
        assert_eq!(rec.to, SessionState::HandshakeInitiated);
    }

    #[test]
    fn validate_message_tracks_admit_sets() {
        let mut fsm = SessionFsm::new();
        assert!(!fsm.validate_message(136));
        fsm.transition(SessionEvent::Connected);
        assert!(fsm.validate_message(nid::AU1));
        assert!(!fsm.validate_message(155));
        fsm.transition(SessionEvent::Au1Sent);
        assert!(fsm.validate_message(32));
        assert!(fsm.validate_message(155));
        assert!(!fsm.validate_message(136));
    }

    #[test]
    fn reset_clears_history_and_fires_enter_hook() {
        let entered = Arc::new(AtomicUsize::new(0));
        let mut fsm = SessionFsm::new();
        let counter = entered.clone();
        fsm.set_on_enter(
            SessionState::Disconnected,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        fsm.transition(SessionEvent::Connected);
        fsm.transition(SessionEvent::Au1Sent);
        fsm.reset();
        assert_eq!(fsm.state(), SessionState::Disconnected);
        assert!(fsm.history().is_empty());
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exit_and_enter_hooks_run_in_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut fsm = SessionFsm::new();
        let o1 = order.clone();
        fsm.set_on_exit(SessionState::Disconnected, Box::new(move |_| o1.lock().unwrap().push("exit")));
        let o2 = order.clone();
        fsm.set_on_enter(SessionState::Ready, Box::new(move |_| o2.lock().unwrap().push("enter")));
        fsm.transition(SessionEvent::Connected);
        assert_eq!(*order.lock().unwrap(), vec!["exit", "enter"]);
    }
}
