//! Single-shot cancelable delays.
//!
//! [`Delay`] is a one-shot timer with two settlement modes: a resolving
//! delay completes with `Ok`, a rejecting delay completes with
//! [`DelayError::Rejected`]. A delay can be tied to a
//! [`CancellationToken`], in which case the wait is abandoned the moment
//! the token fires, and it can be short-circuited from another task with
//! [`Delay::clear`], which settles it immediately using the configured
//! mode. The backoff machinery in the accept loop uses this to stop
//! waiting as soon as the server shuts down instead of sleeping out the
//! remaining interval.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How a [`Delay`] settles once it expires (or is cleared).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayMode {
    /// Settle successfully with the configured value, if any.
    Resolve,
    /// Settle with [`DelayError::Rejected`] carrying the configured value.
    Reject,
}

/// Errors produced by [`Delay::wait`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DelayError {
    /// The cancellation token fired before the delay expired.
    #[error("delay was aborted")]
    Aborted,

    /// A [`DelayMode::Reject`] delay ran to settlement.
    #[error("delay settled by rejection")]
    Rejected { value: Option<String> },
}

/// A single-shot delay supporting early cancellation and forced settlement.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use harbor::timer::Delay;
///
/// # async fn example() {
/// let delay = Delay::resolve(Duration::from_millis(20));
/// delay.wait().await.unwrap();
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Delay {
    duration: Duration,
    mode: DelayMode,
    value: Option<String>,
    cleared: CancellationToken,
    token: Option<CancellationToken>,
}

impl Delay {
    /// A delay settling with `mode` after `duration`.
    pub fn new(duration: Duration, mode: DelayMode) -> Self {
        Self {
            duration,
            mode,
            value: None,
            cleared: CancellationToken::new(),
            token: None,
        }
    }

    /// A delay that settles successfully after `duration`.
    pub fn resolve(duration: Duration) -> Self {
        Self::new(duration, DelayMode::Resolve)
    }

    /// A delay that settles with [`DelayError::Rejected`] after `duration`.
    pub fn reject(duration: Duration) -> Self {
        Self::new(duration, DelayMode::Reject)
    }

    /// A resolving delay of a uniformly chosen integer millisecond count
    /// in `[min_ms, max_ms]` inclusive.
    ///
    /// # Panics
    ///
    /// Panics if `min_ms > max_ms`.
    pub fn range(min_ms: u64, max_ms: u64) -> Self {
        let ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Self::resolve(Duration::from_millis(ms))
    }

    /// Attaches a value carried through settlement in either mode.
    #[must_use]
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Ties the delay to a cancellation token. If the token is signaled
    /// before expiry the wait fails with [`DelayError::Aborted`].
    #[must_use]
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// The scheduled duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The configured settlement mode.
    pub fn mode(&self) -> DelayMode {
        self.mode
    }

    /// Forces immediate settlement using the configured mode, bypassing
    /// the remaining wait. Callable from any task; the originally
    /// scheduled expiry has no further effect afterwards.
    pub fn clear(&self) {
        self.cleared.cancel();
    }

    /// Suspends until expiry, clearing, or abort, then settles.
    ///
    /// # Errors
    ///
    /// - [`DelayError::Aborted`] if the attached token was already
    ///   signaled, or fires mid-wait.
    /// - [`DelayError::Rejected`] if the delay was built with
    ///   [`Delay::reject`] and ran to settlement.
    pub async fn wait(&self) -> Result<Option<String>, DelayError> {
        if let Some(token) = &self.token {
            if token.is_cancelled() {
                return Err(DelayError::Aborted);
            }
        }

        let aborted = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = aborted => Err(DelayError::Aborted),
            _ = self.cleared.cancelled() => self.settle(),
            _ = tokio::time::sleep(self.duration) => self.settle(),
        }
    }

    fn settle(&self) -> Result<Option<String>, DelayError> {
        match self.mode {
            DelayMode::Resolve => Ok(self.value.clone()),
            DelayMode::Reject => Err(DelayError::Rejected {
                value: self.value.clone(),
            }),
        }
    }
}
