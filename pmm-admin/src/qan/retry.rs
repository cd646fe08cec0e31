use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use crate::error::{AdminError, Result};

/// Outcome of one attempt of a polled operation.
#[derive(Debug)]
pub enum Attempt<T> {
    Ready(T),
    /// The other side is not there yet; try again after the interval.
    NotReady,
}

/// Bounded, fixed-interval polling used while waiting for an agent to
/// connect to the QAN API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it is ready, fails, or the attempts run out.
    ///
    /// Errors from `op` are returned immediately. Running out of attempts
    /// yields `AgentRendezvousTimeout`; cancelling `cancel` yields `Cancelled`.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Attempt<T>>>,
    {
        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(AdminError::Cancelled);
            }

            match op(attempt).await? {
                Attempt::Ready(value) => return Ok(value),
                Attempt::NotReady => {
                    tracing::debug!("Attempt {}/{} not ready", attempt, self.max_attempts);
                }
            }

            if attempt < self.max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(AdminError::Cancelled),
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        }

        Err(AdminError::AgentRendezvousTimeout {
            attempts: self.max_attempts,
        })
    }
}
