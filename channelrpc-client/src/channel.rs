//! Channel lifecycle.
//!
//! Every channel moves through `Created → Opening → Opened → Closing →
//! Closed`, and can fault from any non-terminal state. Opening is a single
//! shared operation: concurrent callers (explicit `open` or an implicit open
//! from the first send) all await the same attempt, and an abort wakes every
//! one of them with `Cancelled`.

use std::fmt;
use std::future::Future;
use std::sync::Mutex;

use channelrpc_core::ChannelError;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::timeout::TimeoutBudget;

/// Observable channel state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommunicationState {
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
}

impl CommunicationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommunicationState::Closed | CommunicationState::Faulted)
    }
}

/// What `close` should do next.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CloseStart {
    /// The channel was open and is now `Closing`.
    Graceful,
    /// Never opened; now `Closed` with nothing to release.
    NotOpened,
    /// Already closing or closed.
    AlreadyClosed,
    Faulted,
}

pub(crate) struct Lifecycle {
    destination: String,
    state: Mutex<CommunicationState>,
    cancel: CancellationToken,
    open: OnceCell<Result<(), ChannelError>>,
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("destination", &self.destination)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Faults the channel if the open attempt is dropped before it finishes.
///
/// The open runs inside the caller's future, so an outer timeout or a
/// cancelled task can abandon it halfway. Later opens then see `Faulted`
/// instead of an `Opening` that nothing will ever complete.
struct OpenAttempt<'a> {
    lifecycle: &'a Lifecycle,
    finished: bool,
}

impl Drop for OpenAttempt<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let abandoned = self.lifecycle.with_state(|state| {
            if *state == CommunicationState::Opening {
                *state = CommunicationState::Faulted;
                true
            } else {
                false
            }
        });
        if abandoned {
            tracing::warn!(
                destination = %self.lifecycle.destination,
                "channel open abandoned before completing"
            );
        }
    }
}

impl Lifecycle {
    /// A lifecycle cancelled together with `parent`.
    pub(crate) fn new(destination: String, parent: &CancellationToken) -> Self {
        Self {
            destination,
            state: Mutex::new(CommunicationState::Created),
            cancel: parent.child_token(),
            open: OnceCell::new(),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut CommunicationState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // A cancelled token means the factory or an abort shut us down.
        if self.cancel.is_cancelled() && !guard.is_terminal() {
            *guard = CommunicationState::Closed;
        }
        f(&mut guard)
    }

    pub(crate) fn state(&self) -> CommunicationState {
        self.with_state(|state| *state)
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn budget(&self, timeout: std::time::Duration) -> TimeoutBudget {
        TimeoutBudget::new(timeout).with_cancellation(self.cancel.clone())
    }

    fn state_error(&self, state: CommunicationState) -> ChannelError {
        match state {
            CommunicationState::Faulted => ChannelError::communication(format!(
                "channel to {} is faulted",
                self.destination
            )),
            other => ChannelError::invalid_operation(format!(
                "channel to {} is {other:?}",
                self.destination
            )),
        }
    }

    /// Fail unless the channel is `Opened`.
    pub(crate) fn check_opened(&self) -> Result<(), ChannelError> {
        match self.state() {
            CommunicationState::Opened => Ok(()),
            other => Err(self.state_error(other)),
        }
    }

    /// Open the channel once, sharing the attempt with concurrent callers.
    ///
    /// `open` runs at most once. A failed open faults the channel, and every
    /// later call reports the same error. An open whose future is dropped
    /// midway also faults the channel.
    pub(crate) async fn ensure_opened<F, Fut>(&self, open: F) -> Result<(), ChannelError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), ChannelError>>,
    {
        match self.state() {
            CommunicationState::Opened => return Ok(()),
            CommunicationState::Created | CommunicationState::Opening => {}
            other => return Err(self.state_error(other)),
        }

        let attempt = self.open.get_or_init(|| async {
            let began = self.with_state(|state| {
                if *state == CommunicationState::Created {
                    *state = CommunicationState::Opening;
                    Ok(())
                } else {
                    Err(self.state_error(*state))
                }
            });
            began?;

            let mut attempt = OpenAttempt {
                lifecycle: self,
                finished: false,
            };
            let result = open().await;
            attempt.finished = true;
            self.with_state(|state| {
                if *state == CommunicationState::Opening {
                    *state = if result.is_ok() {
                        CommunicationState::Opened
                    } else {
                        CommunicationState::Faulted
                    };
                }
            });
            match &result {
                Ok(()) => tracing::debug!(destination = %self.destination, "channel opened"),
                Err(err) => tracing::warn!(
                    destination = %self.destination,
                    error = %err,
                    "channel open failed"
                ),
            }
            result
        });

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ChannelError::Cancelled(format!(
                "channel to {} was aborted while opening",
                self.destination
            ))),
            result = attempt => result.clone(),
        }
    }

    /// Move to `Faulted` unless already terminal.
    pub(crate) fn fault(&self, cause: &ChannelError) {
        let faulted = self.with_state(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = CommunicationState::Faulted;
                true
            }
        });
        if faulted {
            tracing::warn!(destination = %self.destination, error = %cause, "channel faulted");
            tracing::debug!(destination = %self.destination, "channel state -> Faulted");
        }
    }

    pub(crate) fn begin_close(&self) -> CloseStart {
        self.with_state(|state| match *state {
            CommunicationState::Opened => {
                *state = CommunicationState::Closing;
                CloseStart::Graceful
            }
            CommunicationState::Created => {
                *state = CommunicationState::Closed;
                CloseStart::NotOpened
            }
            CommunicationState::Faulted => CloseStart::Faulted,
            // An open in flight is cancelled like an abort.
            CommunicationState::Opening => {
                *state = CommunicationState::Closed;
                self.cancel.cancel();
                CloseStart::NotOpened
            }
            CommunicationState::Closing | CommunicationState::Closed => CloseStart::AlreadyClosed,
        })
    }

    pub(crate) fn end_close(&self) {
        self.with_state(|state| {
            if *state == CommunicationState::Closing {
                *state = CommunicationState::Closed;
            }
        });
        self.cancel.cancel();
        tracing::debug!(destination = %self.destination, "channel closed");
    }

    /// Terminal and idempotent. Wakes every pending operation.
    pub(crate) fn abort(&self) {
        self.with_state(|state| {
            if !state.is_terminal() {
                *state = CommunicationState::Closed;
            }
        });
        self.cancel.cancel();
    }
}
