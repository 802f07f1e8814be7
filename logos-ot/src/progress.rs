//! Cancellable progress reporting for long waits.
//!
//! Host adapters (IDE progress bars, CLI spinners) implement
//! [`ProgressMonitor`]; the core only names subtasks and watches the
//! monitor's [`CancellationToken`] while it waits.

pub use tokio_util::sync::CancellationToken;

/// Neutral progress interface polled by blocking protocol steps.
pub trait ProgressMonitor: Send + Sync {
    /// Name the step currently being waited on.
    fn subtask(&self, name: &str);

    fn cancel_token(&self) -> &CancellationToken;

    fn is_cancelled(&self) -> bool {
        self.cancel_token().is_cancelled()
    }
}

/// Monitor that reports subtasks to the log.
#[derive(Debug, Clone, Default)]
pub struct LogProgress {
    token: CancellationToken,
}

impl LogProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self { token }
    }
}

impl ProgressMonitor for LogProgress {
    fn subtask(&self, name: &str) {
        log::debug!("progress: {name}");
    }

    fn cancel_token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_sticky() {
        let token = LogProgress::new().cancel_token().clone();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.clone().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_when_already_cancelled() {
        let progress = LogProgress::new();
        progress.cancel_token().cancel();
        assert!(progress.is_cancelled());
        tokio::time::timeout(Duration::from_millis(100), progress.cancel_token().cancelled())
            .await
            .unwrap();
    }
}
