//! Session lifecycle state machine
//!
//! A session moves between four states. Process events (ready, crash) and
//! detail-surface events (open, close) drive it jointly; the supervisor
//! consults [`SessionState::apply`] for every move so the table below is the
//! single source of truth for what is legal.
//!
//! | From     | Op           | To       |
//! |----------|--------------|----------|
//! | Stopped  | start        | Starting |
//! | Starting | server_ready | Ready    |
//! | Ready    | webview_open | Running  |
//! | Running  | webview_close| Stopped  |
//! | any      | stop         | Stopped  |
//! | live     | crash        | Stopped  |
//! | non-Stopped | start     | unchanged|

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the Studio server session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No server process
    #[default]
    Stopped,
    /// Process spawned, waiting for the health endpoint
    Starting,
    /// Health endpoint answered, no detail surface attached
    Ready,
    /// Detail surface attached
    Running,
}

/// Operations and internal events that move the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOp {
    Start,
    Stop,
    /// Process exited without being asked to (internal)
    Crash,
    /// Health probe succeeded (internal)
    ServerReady,
    WebviewOpen,
    WebviewClose,
}

/// Outcome of applying an operation to a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move to (or stay in) the given state
    To(SessionState),
    /// The operation is not legal from the current state
    Illegal,
}

impl SessionState {
    /// Look up the transition table.
    pub fn apply(self, op: SessionOp) -> Transition {
        use SessionOp as Op;
        use SessionState::*;

        match (self, op) {
            (Stopped, Op::Start) => Transition::To(Starting),
            (_, Op::Start) => Transition::To(self),
            (_, Op::Stop) => Transition::To(Stopped),
            (Starting | Ready | Running, Op::Crash) => Transition::To(Stopped),
            (Starting, Op::ServerReady) => Transition::To(Ready),
            (Ready, Op::WebviewOpen) => Transition::To(Running),
            (Running, Op::WebviewClose) => Transition::To(Stopped),
            _ => Transition::Illegal,
        }
    }

    /// Whether a server process is confirmed serving in this state
    pub fn is_live(self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Running => "running",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SessionOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Crash => "crash",
            Self::ServerReady => "server_ready",
            Self::WebviewOpen => "webview_open",
            Self::WebviewClose => "webview_close",
        }
    }
}

impl fmt::Display for SessionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_STATES: [SessionState; 4] = [
        SessionState::Stopped,
        SessionState::Starting,
        SessionState::Ready,
        SessionState::Running,
    ];

    /// Drive the table the way the supervisor does: illegal ops are no-ops,
    /// and a start from `Stopped` is followed by the automatic readiness edge.
    fn step(state: SessionState, op: SessionOp, becomes_ready: bool) -> SessionState {
        let next = match state.apply(op) {
            Transition::To(next) => next,
            Transition::Illegal => state,
        };
        if op == SessionOp::Start && state == SessionState::Stopped && becomes_ready {
            match next.apply(SessionOp::ServerReady) {
                Transition::To(ready) => ready,
                Transition::Illegal => next,
            }
        } else {
            next
        }
    }

    #[test]
    fn default_is_stopped() {
        assert_eq!(SessionState::default(), SessionState::Stopped);
    }

    #[test]
    fn start_from_stopped_begins_starting() {
        assert_eq!(
            SessionState::Stopped.apply(SessionOp::Start),
            Transition::To(SessionState::Starting)
        );
    }

    #[test]
    fn start_is_idempotent_when_not_stopped() {
        for state in [
            SessionState::Starting,
            SessionState::Ready,
            SessionState::Running,
        ] {
            assert_eq!(state.apply(SessionOp::Start), Transition::To(state));
        }
    }

    #[test]
    fn stop_converges_from_every_state() {
        for state in ALL_STATES {
            assert_eq!(
                state.apply(SessionOp::Stop),
                Transition::To(SessionState::Stopped)
            );
        }
    }

    #[test]
    fn crash_from_live_states_stops() {
        for state in [
            SessionState::Starting,
            SessionState::Ready,
            SessionState::Running,
        ] {
            assert_eq!(
                state.apply(SessionOp::Crash),
                Transition::To(SessionState::Stopped)
            );
        }
        assert_eq!(
            SessionState::Stopped.apply(SessionOp::Crash),
            Transition::Illegal
        );
    }

    #[test]
    fn server_ready_only_from_starting() {
        assert_eq!(
            SessionState::Starting.apply(SessionOp::ServerReady),
            Transition::To(SessionState::Ready)
        );
        for state in [
            SessionState::Stopped,
            SessionState::Ready,
            SessionState::Running,
        ] {
            assert_eq!(state.apply(SessionOp::ServerReady), Transition::Illegal);
        }
    }

    #[test]
    fn webview_edges() {
        assert_eq!(
            SessionState::Ready.apply(SessionOp::WebviewOpen),
            Transition::To(SessionState::Running)
        );
        assert_eq!(
            SessionState::Running.apply(SessionOp::WebviewClose),
            Transition::To(SessionState::Stopped)
        );
        assert_eq!(
            SessionState::Stopped.apply(SessionOp::WebviewOpen),
            Transition::Illegal
        );
        assert_eq!(
            SessionState::Starting.apply(SessionOp::WebviewOpen),
            Transition::Illegal
        );
        assert_eq!(
            SessionState::Ready.apply(SessionOp::WebviewClose),
            Transition::Illegal
        );
    }

    #[test]
    fn happy_path_is_repeatable() {
        let mut state = SessionState::Stopped;
        for _ in 0..5 {
            state = step(state, SessionOp::Start, true);
            assert_eq!(state, SessionState::Ready);
            state = step(state, SessionOp::WebviewOpen, true);
            assert_eq!(state, SessionState::Running);
            state = step(state, SessionOp::WebviewClose, true);
            assert_eq!(state, SessionState::Stopped);
        }
    }

    #[test]
    fn repeated_start_while_starting_does_not_become_ready() {
        let state = step(SessionState::Stopped, SessionOp::Start, false);
        assert_eq!(state, SessionState::Starting);
        assert_eq!(step(state, SessionOp::Start, true), SessionState::Starting);
    }

    #[test]
    fn state_serialization() {
        assert_eq!(
            serde_json::to_string(&SessionState::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(SessionOp::WebviewOpen.to_string(), "webview_open");
    }

    fn any_op() -> impl Strategy<Value = SessionOp> {
        prop_oneof![
            Just(SessionOp::Start),
            Just(SessionOp::Stop),
            Just(SessionOp::WebviewOpen),
            Just(SessionOp::WebviewClose),
            Just(SessionOp::Crash),
        ]
    }

    proptest! {
        #[test]
        fn any_sequence_stays_in_known_states(
            ops in proptest::collection::vec((any_op(), any::<bool>()), 0..64)
        ) {
            let mut state = SessionState::Stopped;
            for (op, ready) in ops {
                let before = state;
                state = step(state, op, ready);
                prop_assert!(ALL_STATES.contains(&state));
                match op {
                    SessionOp::Stop => prop_assert_eq!(state, SessionState::Stopped),
                    SessionOp::Crash if before != SessionState::Stopped => {
                        prop_assert_eq!(state, SessionState::Stopped)
                    }
                    SessionOp::Start if before != SessionState::Stopped => {
                        prop_assert_eq!(state, before)
                    }
                    _ => {}
                }
            }
        }
    }
}
