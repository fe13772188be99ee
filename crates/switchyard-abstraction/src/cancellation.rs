//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is a cheap handle to independently owned state: the
//! caller keeps one clone, the execution keeps another, and either side can
//! check or cancel without racing the other. Checks are a single atomic load.
//!
//! A token whose owner has been stopped reports itself as cancelled. Code that
//! can no longer reach the owner of a token must assume the work was abandoned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Errors produced by cancellation checks.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancellationError {
    /// The token was cancelled.
    #[error("Cancelled{}", reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Cancelled {
        /// The reason supplied by the canceller, if any.
        reason: Option<String>,
    },

    /// The token's owner was stopped and its state is gone.
    #[error("Cancellation token stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
struct Cancellation {
    reason: String,
    cancelled_at: DateTime<Utc>,
}

struct TokenInner {
    conversation_id: Option<String>,
    created_at: DateTime<Utc>,
    cancelled: AtomicBool,
    stopped: AtomicBool,
    detail: Mutex<Option<Cancellation>>,
    signal: tokio_util::sync::CancellationToken,
}

/// Snapshot of a token's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    /// Conversation the token was created for.
    pub conversation_id: Option<String>,
    /// Whether the token has been cancelled.
    pub cancelled: bool,
    /// When the token was cancelled.
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Why the token was cancelled.
    pub reason: Option<String>,
    /// When the token was created.
    pub created_at: DateTime<Utc>,
}

/// Shared cancellation handle.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("conversation_id", &self.inner.conversation_id)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl CancellationToken {
    /// Creates a new, uncancelled token.
    ///
    /// # Arguments
    /// * `conversation_id` - Optional conversation the token belongs to
    #[must_use]
    pub fn new(conversation_id: Option<String>) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                conversation_id,
                created_at: Utc::now(),
                cancelled: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                detail: Mutex::new(None),
                signal: tokio_util::sync::CancellationToken::new(),
            }),
        }
    }

    /// Returns the conversation id the token was created for.
    pub fn conversation_id(&self) -> Option<&str> {
        self.inner.conversation_id.as_deref()
    }

    /// Returns `true` if the token was cancelled or its owner was stopped.
    ///
    /// Never blocks.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire) || self.inner.stopped.load(Ordering::Acquire)
    }

    /// Cancels the token.
    ///
    /// Cancelling an already-cancelled token is a no-op: the first reason and
    /// timestamp are kept.
    ///
    /// # Returns
    /// Returns `true` if this call cancelled the token, `false` if it was already cancelled.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let mut detail = self.inner.detail.lock().unwrap_or_else(PoisonError::into_inner);
        if self.inner.cancelled.load(Ordering::Acquire) {
            return false;
        }
        *detail = Some(Cancellation { reason: reason.into(), cancelled_at: Utc::now() });
        self.inner.cancelled.store(true, Ordering::Release);
        drop(detail);
        self.inner.signal.cancel();
        true
    }

    /// Returns a snapshot of the token's state.
    ///
    /// # Errors
    /// Returns `CancellationError::Stopped` once the token has been stopped.
    pub fn state(&self) -> Result<TokenState, CancellationError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(CancellationError::Stopped);
        }
        let detail = self.inner.detail.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Ok(TokenState {
            conversation_id: self.inner.conversation_id.clone(),
            cancelled: detail.is_some(),
            cancelled_at: detail.as_ref().map(|d| d.cancelled_at),
            reason: detail.map(|d| d.reason),
            created_at: self.inner.created_at,
        })
    }

    /// Stops the token's owner.
    ///
    /// Every holder observes the token as cancelled from now on, and tasks
    /// waiting on [`CancellationToken::cancelled`] are woken.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.signal.cancel();
    }

    /// Returns `Err` if the token is cancelled.
    ///
    /// Intended for engines checking at safe points.
    ///
    /// # Errors
    /// Returns `CancellationError::Cancelled` carrying the cancellation reason.
    pub fn check(&self) -> Result<(), CancellationError> {
        if !self.is_cancelled() {
            return Ok(());
        }
        let reason = self.state().ok().and_then(|s| s.reason);
        Err(CancellationError::Cancelled { reason })
    }

    /// Completes once the token is cancelled or stopped.
    pub async fn cancelled(&self) {
        self.inner.signal.cancelled().await;
    }
}

/// The result of one step of a cancellable loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<S, T> {
    /// Run another step with the new state after the poll interval.
    Continue(S),
    /// The loop finished with a result.
    Done(T),
    /// The step function asked the loop to stop early.
    Halt(T),
}

/// How a cancellable loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit<T> {
    /// The step function returned [`Step::Done`].
    Done(T),
    /// The step function returned [`Step::Halt`].
    Halted(T),
}

/// Runs `step` repeatedly until it finishes, checking `token` before every step.
///
/// Between steps the loop sleeps for `interval`; the sleep is cut short when the
/// token is cancelled.
///
/// # Errors
/// Returns `CancellationError::Cancelled` as soon as a check observes the token cancelled.
pub async fn with_cancellation<S, T, F, Fut>(
    token: &CancellationToken,
    mut state: S,
    interval: Duration,
    mut step: F,
) -> Result<LoopExit<T>, CancellationError>
where
    F: FnMut(S) -> Fut,
    Fut: Future<Output = Step<S, T>>,
{
    loop {
        token.check()?;

        match step(state).await {
            Step::Done(result) => return Ok(LoopExit::Done(result)),
            Step::Halt(value) => return Ok(LoopExit::Halted(value)),
            Step::Continue(next) => state = next,
        }

        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = token.cancelled() => {}
        }
    }
}
