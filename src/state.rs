//! Lifecycle state machine shared by nodes, paths, hooks and queues.
//!
//! Entities move `Destroyed -> Initialized -> Parsed -> Checked -> Prepared ->
//! Started -> (Paused <-> Started) -> Stopped`. Transitions outside this order
//! are programming errors and panic.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Destroyed = 0,
    Initialized = 1,
    Parsed = 2,
    Checked = 3,
    Prepared = 4,
    Started = 5,
    Paused = 6,
    Stopping = 7,
    Stopped = 8,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Destroyed,
            1 => State::Initialized,
            2 => State::Parsed,
            3 => State::Checked,
            4 => State::Prepared,
            5 => State::Started,
            6 => State::Paused,
            7 => State::Stopping,
            8 => State::Stopped,
            _ => unreachable!("invalid state tag {}", v),
        }
    }

    /// Panics unless the entity is in the expected lifecycle state.
    #[track_caller]
    pub fn expect(self, want: State) {
        if self != want {
            panic!("lifecycle violation: in state {:?}, expected {:?}", self, want);
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Destroyed => "destroyed",
            State::Initialized => "initialized",
            State::Parsed => "parsed",
            State::Checked => "checked",
            State::Prepared => "prepared",
            State::Started => "started",
            State::Paused => "paused",
            State::Stopping => "stopping",
            State::Stopped => "stopped",
        }
    }
}

/// Atomically readable state cell. Only the owning thread moves it forward,
/// except `Stopping` which any actor may request.
pub struct AtomicState(AtomicU8);

impl AtomicState {
    pub fn new(s: State) -> Self {
        AtomicState(AtomicU8::new(s as u8))
    }

    pub fn load(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, s: State) {
        self.0.store(s as u8, Ordering::Release);
    }

    /// Panics unless the current state matches `want`, then advances to `to`.
    #[track_caller]
    pub fn advance(&self, want: State, to: State) {
        self.load().expect(want);
        self.store(to);
    }

    pub fn compare_exchange(&self, from: State, to: State) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl std::fmt::Debug for AtomicState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance() {
        let s = AtomicState::new(State::Initialized);
        s.advance(State::Initialized, State::Parsed);
        assert_eq!(s.load(), State::Parsed);
    }

    #[test]
    #[should_panic(expected = "lifecycle violation")]
    fn test_wrong_order_panics() {
        let s = AtomicState::new(State::Initialized);
        s.advance(State::Prepared, State::Started);
    }

    #[test]
    fn test_anyone_may_request_stopping() {
        let s = AtomicState::new(State::Started);
        assert!(s.compare_exchange(State::Started, State::Stopping));
        assert!(!s.compare_exchange(State::Started, State::Stopping));
    }
}
