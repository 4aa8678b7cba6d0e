//! Timeout budgets.
//!
//! A [`TimeoutBudget`] is computed once per logical operation and handed to
//! every sub-step (credential acquisition, proxy resolution, connect, send,
//! receive), so the sum of their waits never exceeds the caller's timeout.
//!
//! Two signals can stop an awaited step: the budget's own deadline, reported
//! as [`ChannelError::Timeout`], and an external cancellation token, reported
//! as [`ChannelError::Cancelled`]. They are never conflated.

use std::future::Future;
use std::time::Duration;

use channelrpc_core::ChannelError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A deadline shared by all steps of one operation.
#[derive(Clone, Debug)]
pub struct TimeoutBudget {
    started: Instant,
    budget: Duration,
    cancel: Option<CancellationToken>,
}

impl TimeoutBudget {
    /// Start a budget now.
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
            cancel: None,
        }
    }

    /// Also stop when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The caller's original timeout.
    pub fn original(&self) -> Duration {
        self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left, saturating at zero.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    /// Absolute deadline, or `None` when the budget is too large to represent.
    pub fn deadline(&self) -> Option<Instant> {
        self.started.checked_add(self.budget)
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Fail with `Timeout` if nothing is left, without doing any I/O.
    pub fn check(&self, what: &str) -> Result<(), ChannelError> {
        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                return Err(ChannelError::Cancelled(format!("{what} was cancelled")));
            }
        }
        if self.is_expired() {
            return Err(self.timeout_error(what));
        }
        Ok(())
    }

    fn timeout_error(&self, what: &str) -> ChannelError {
        ChannelError::Timeout(format!(
            "{what} did not complete within the allotted timeout of {:?}",
            self.budget
        ))
    }

    /// Await `fut` within the remaining budget.
    ///
    /// Elapsing the deadline yields `Timeout`; the cancellation token firing
    /// first yields `Cancelled`.
    pub async fn run<F, T>(&self, what: &str, fut: F) -> Result<T, ChannelError>
    where
        F: Future<Output = Result<T, ChannelError>>,
    {
        self.check(what)?;
        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let timed = async {
            match self.deadline() {
                Some(deadline) => tokio::time::timeout_at(deadline, fut)
                    .await
                    .map_err(|_| self.timeout_error(what))?,
                None => fut.await,
            }
        };
        tokio::select! {
            biased;
            _ = cancelled => Err(ChannelError::Cancelled(format!("{what} was cancelled"))),
            result = timed => result,
        }
    }
}
