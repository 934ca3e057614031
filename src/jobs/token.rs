//! Cooperative cancellation token with pause/resume.
//!
//! One token carries two different requests: a terminal *cancel* and a
//! recoverable *pause*. Checkpoints report which one was made through a
//! tagged [`Checkpoint`], and an interrupted operation gets a tagged
//! [`Interruption`], so a consumer never has to guess whether it may retry.
//!
//! For APIs that only understand plain cancellation the token also exposes
//! a [`CancellationToken`]. It is tripped by both `cancel()` and `pause()`;
//! after a pause has been honored it must be replaced with
//! [`recycle_token`](JobCancellationToken::recycle_token) since a tripped
//! token cannot be reset.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Internal state of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenState {
    Active,
    Paused,
    Cancelled,
}

/// Outcome of a cooperative checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// Keep going.
    Continue,
    /// Suspend until resumed.
    PauseRequested,
    /// Stop for good.
    CancelRequested,
}

/// Why an in-flight operation was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// Recoverable: wait for resume, then retry.
    Pause,
    /// Terminal: propagate.
    Cancel,
}

struct TokenInner {
    state: watch::Sender<TokenState>,
    external: Mutex<CancellationToken>,
}

/// Cancellation token supporting both cancel and pause/resume.
#[derive(Clone)]
pub struct JobCancellationToken {
    inner: Arc<TokenInner>,
}

impl JobCancellationToken {
    pub fn new() -> Self {
        let (state, _rx) = watch::channel(TokenState::Active);
        Self {
            inner: Arc::new(TokenInner {
                state,
                external: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    fn state(&self) -> TokenState {
        *self.inner.state.borrow()
    }

    fn external(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        match self.inner.external.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state() == TokenState::Paused
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == TokenState::Cancelled
    }

    /// Cancel terminally. Cannot be undone; repeated calls are no-ops.
    pub fn cancel(&self) {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == TokenState::Cancelled {
                return false;
            }
            *state = TokenState::Cancelled;
            true
        });
        if changed {
            debug!("Job token cancelled");
            self.external().cancel();
        }
    }

    /// Request a pause. Ignored once cancelled; idempotent.
    pub fn pause(&self) {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state != TokenState::Active {
                return false;
            }
            *state = TokenState::Paused;
            true
        });
        if changed {
            debug!("Job token paused");
            self.external().cancel();
        }
    }

    /// Clear a pause and release everything waiting on it.
    pub fn resume(&self) {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state != TokenState::Paused {
                return false;
            }
            *state = TokenState::Active;
            true
        });
        if changed {
            debug!("Job token resumed");
        }
    }

    /// Swap a tripped external token for a fresh one so that a later
    /// `cancel()` is still observable. A cancelled token keeps its tripped one.
    pub fn recycle_token(&self) {
        let mut external = self.external();
        if external.is_cancelled() && !self.is_cancelled() {
            *external = CancellationToken::new();
        }
    }

    /// The current plain cancellation token. Tripped by pause and cancel.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.external().clone()
    }

    /// Non-blocking check of what the job should do next.
    pub fn checkpoint(&self) -> Checkpoint {
        match self.state() {
            TokenState::Active => Checkpoint::Continue,
            TokenState::Paused => Checkpoint::PauseRequested,
            TokenState::Cancelled => Checkpoint::CancelRequested,
        }
    }

    /// Resolves as soon as a pause or cancel is requested.
    pub async fn interrupted(&self) -> Interruption {
        let mut rx = self.inner.state.subscribe();
        let state = match rx.wait_for(|s| *s != TokenState::Active).await {
            Ok(state) => *state,
            // The sender lives as long as `self`.
            Err(_) => TokenState::Cancelled,
        };
        match state {
            TokenState::Cancelled => Interruption::Cancel,
            _ => Interruption::Pause,
        }
    }

    /// True when `interruption` came from a pause and the token has not
    /// been cancelled since.
    pub fn is_pausing_cancellation(&self, interruption: &Interruption) -> bool {
        *interruption == Interruption::Pause && !self.is_cancelled()
    }

    /// Suspend until resumed or cancelled.
    pub async fn wait_for_resume(&self) -> Checkpoint {
        let mut rx = self.inner.state.subscribe();
        let state = match rx.wait_for(|s| *s != TokenState::Paused).await {
            Ok(state) => *state,
            Err(_) => TokenState::Cancelled,
        };
        match state {
            TokenState::Cancelled => Checkpoint::CancelRequested,
            _ => Checkpoint::Continue,
        }
    }
}

impl Default for JobCancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobCancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCancellationToken")
            .field("state", &self.state())
            .finish()
    }
}
