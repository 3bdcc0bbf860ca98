//! Cancellation and deadline propagation for a single request.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CancelReason, LLMError};

/// Cancellation scope passed into every client, stream and callback operation.
///
/// A context is cheap to clone; clones share the same token, so cancelling any of
/// them cancels all. Cancellation is observed by polling ([`RequestContext::check`])
/// at defined points or by awaiting [`RequestContext::done`] while blocked on I/O.
///
/// # Examples
///
/// ```
/// use llmux::context::RequestContext;
/// use llmux::error::CancelReason;
///
/// let ctx = RequestContext::background();
/// assert!(ctx.check().is_ok());
/// ctx.cancel();
/// assert_eq!(ctx.err(), Some(CancelReason::Cancelled));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// A context that is never cancelled unless [`RequestContext::cancel`] is called.
    pub fn background() -> Self {
        Self::default()
    }

    /// Wraps an existing token, e.g. one owned by a server's shutdown logic.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().with_deadline(Instant::now() + timeout)
    }

    /// Sets the deadline, keeping an earlier one if already present.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    /// Derives a context that is cancelled with its parent but can also be cancelled
    /// on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when no deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Returns the reason this context has fired, if it has.
    pub fn err(&self) -> Option<CancelReason> {
        if self.token.is_cancelled() {
            return Some(CancelReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    /// Converts a fired context into [`LLMError::Cancelled`].
    pub fn check(&self) -> Result<(), LLMError> {
        match self.err() {
            Some(reason) => Err(LLMError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Resolves once the token is cancelled or the deadline passes.
    pub async fn done(&self) -> CancelReason {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => CancelReason::Cancelled,
                _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                CancelReason::Cancelled
            }
        }
    }
}
