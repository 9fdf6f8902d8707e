use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::CheckError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline and cancellation shared by every network operation of a run.
#[derive(Debug, Clone)]
pub struct CheckContext {
    timeout: Duration,
    cancel: CancellationToken,
}

impl Default for CheckContext {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl CheckContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `fut` bounded by the per-operation timeout, aborting early on
    /// cancellation. The future is dropped on either outcome.
    pub async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T, CheckError>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CheckError::Cancelled {
                operation: operation.to_string(),
            }),
            res = tokio::time::timeout(self.timeout, fut) => res.map_err(|_| CheckError::Timeout {
                operation: operation.to_string(),
                after: self.timeout,
            }),
        }
    }

    /// [`bounded`](Self::bounded) for fallible operations.
    pub async fn guard<T, F>(&self, operation: &str, fut: F) -> Result<T, CheckError>
    where
        F: Future<Output = Result<T, CheckError>>,
    {
        self.bounded(operation, fut).await?
    }

    /// Cancel this context when the process receives Ctrl-C. Must be called
    /// from within a tokio runtime.
    pub fn cancel_on_interrupt(&self) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupt received, cancelling pending operations");
                cancel.cancel();
            }
        });
    }

    /// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
    pub async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
