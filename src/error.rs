//! Error and warning types

use crate::{SessionOp, SessionState, Source};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the supervisor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StudioError {
    /// Spawn failure, early exit, or readiness timeout
    #[error("Studio server failed to start on port {port}: {reason}")]
    StartupFailure { port: u16, reason: String },
    /// Unsolicited abnormal exit while a surface was attached
    #[error("Studio server on port {port} crashed ({})", exit_label(.code))]
    Crash { port: u16, code: Option<i32> },
    /// Graceful termination did not finish in time; logged, never returned
    #[error("Studio server on port {port} did not exit within {}s, forcing termination", .grace.as_secs())]
    StopTimeout { port: u16, grace: Duration },
    #[error("cannot {op} while the session is {from}")]
    InvalidTransition { from: SessionState, op: SessionOp },
}

impl StudioError {
    pub fn startup(port: u16, reason: impl Into<String>) -> Self {
        Self::StartupFailure {
            port,
            reason: reason.into(),
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Non-fatal routing problems; logged, never returned to `send()` callers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryWarning {
    #[error("no ack for {kind} message {id} within {}ms", .timeout.as_millis())]
    AckTimeout {
        kind: String,
        id: String,
        timeout: Duration,
    },
    #[error("discarding {kind} message {id}: no sidebar registered")]
    Discarded { kind: String, id: String },
    #[error("delivering {kind} message {id} to {target} failed: {reason}")]
    EndpointFailed {
        kind: String,
        id: String,
        target: Source,
        reason: String,
    },
    #[error("dropped {count} queued message(s) older than {}s", .ttl.as_secs())]
    Expired { count: usize, ttl: Duration },
}

/// Failure reported by a surface when it cannot accept a message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct EndpointError(pub String);

impl EndpointError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn startup_failure_names_port_and_reason() {
        let err = StudioError::startup(4983, "process exited unexpectedly");
        let text = err.to_string();
        assert!(text.contains("4983"));
        assert!(text.contains("process exited unexpectedly"));
    }

    proptest! {
        #[test]
        fn startup_failure_always_carries_port_and_reason(port in any::<u16>(), reason in ".*") {
            let text = StudioError::startup(port, reason.clone()).to_string();
            prop_assert!(text.contains(&port.to_string()));
            prop_assert!(text.contains(&reason));
        }
    }

    #[test]
    fn crash_message_describes_exit() {
        let err = StudioError::Crash {
            port: 4000,
            code: Some(3),
        };
        assert_eq!(
            err.to_string(),
            "Studio server on port 4000 crashed (exit code 3)"
        );
        let err = StudioError::Crash {
            port: 4000,
            code: None,
        };
        assert!(err.to_string().contains("terminated by signal"));
    }

    #[test]
    fn invalid_transition_message() {
        let err = StudioError::InvalidTransition {
            from: SessionState::Stopped,
            op: SessionOp::WebviewOpen,
        };
        assert_eq!(err.to_string(), "cannot webview_open while the session is stopped");
    }

    #[test]
    fn ack_timeout_warning_names_type_and_id() {
        let warning = DeliveryWarning::AckTimeout {
            kind: "openFile".into(),
            id: "m1".into(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(
            warning.to_string(),
            "no ack for openFile message m1 within 5000ms"
        );
    }
}
