//! User-facing prompt shown when the server crashes under an open surface

use crate::StudioError;
use crate::logs::LogLine;
use std::future::Future;
use std::pin::Pin;
use tracing::{info, warn};

/// Choices offered by the crash prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashAction {
    Restart,
    ViewLogs,
}

impl CrashAction {
    pub fn label(self) -> &'static str {
        match self {
            Self::Restart => "Restart",
            Self::ViewLogs => "View logs",
        }
    }
}

pub type PromptFuture<'a> = Pin<Box<dyn Future<Output = Option<CrashAction>> + Send + 'a>>;

pub trait CrashPrompt: Send + Sync {
    /// Show `error` with the [`CrashAction`] choices. `None` means dismissed.
    fn ask<'a>(&'a self, error: &'a StudioError) -> PromptFuture<'a>;

    /// Present captured server output.
    fn show_logs(&self, lines: &[LogLine]);
}

/// Headless prompt: logs the crash and never chooses an action
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnlyPrompt;

impl CrashPrompt for LogOnlyPrompt {
    fn ask<'a>(&'a self, error: &'a StudioError) -> PromptFuture<'a> {
        Box::pin(async move {
            warn!("{}", error);
            None
        })
    }

    fn show_logs(&self, lines: &[LogLine]) {
        for line in lines {
            info!(target: "studio::server", "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_labels() {
        assert_eq!(CrashAction::Restart.label(), "Restart");
        assert_eq!(CrashAction::ViewLogs.label(), "View logs");
    }

    #[tokio::test]
    async fn log_only_prompt_dismisses() {
        let error = StudioError::Crash {
            port: 4983,
            code: Some(1),
        };
        assert_eq!(LogOnlyPrompt.ask(&error).await, None);
    }
}
