//! Cancellation and deadline for one admission

use std::future::Future;

use dynatrace_common::{Error, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Execution context handed in by the caller of the pipeline
///
/// Every call that leaves the process is raced against the token and the
/// deadline. Either firing aborts the pipeline with [`Error::Cancelled`].
#[derive(Clone, Debug, Default)]
pub struct MutationContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl MutationContext {
    /// Context that is cancelled through `cancel`
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Abort calls that are still running at `deadline`
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// The cancellation token of this request
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `fut` unless the request is cancelled or past its deadline first
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled(operation));
        }

        let guarded = async {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(Error::cancelled(operation)),
                result = fut => result,
            }
        };

        match self.deadline {
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return Err(Error::deadline_exceeded(operation));
                }
                tokio::time::timeout_at(deadline, guarded)
                    .await
                    .map_err(|_| Error::deadline_exceeded(operation))?
            }
            None => guarded.await,
        }
    }
}
