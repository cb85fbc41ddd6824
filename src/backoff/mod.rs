//! Exponential backoff arithmetic for the accept loop.
//!
//! Kept separate from the loop itself so the doubling/cap behavior is
//! testable without any transport in the picture. The policy is
//! stateless: the caller threads the previous delay through as
//! `Option<Duration>` and resets it to `None` after a successful accept.

use std::time::Duration;

/// Computes the next retry delay after a transient accept failure.
///
/// The first failure waits [`BackoffPolicy::INITIAL`]; each consecutive
/// failure doubles the wait, capped at [`BackoffPolicy::MAX`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use harbor::backoff::BackoffPolicy;
///
/// let policy = BackoffPolicy::default();
/// let first = policy.next(None);
/// assert_eq!(first, Duration::from_millis(5));
/// assert_eq!(policy.next(Some(first)), Duration::from_millis(10));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
}

impl BackoffPolicy {
    /// Delay after the first transient failure.
    pub const INITIAL: Duration = Duration::from_millis(5);

    /// Upper bound on the delay between retries.
    pub const MAX: Duration = Duration::from_millis(1000);

    /// A policy with custom bounds.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// The next delay given the previous one (`None` = no prior failure).
    pub fn next(&self, previous: Option<Duration>) -> Duration {
        match previous {
            None => self.initial,
            Some(delay) => (delay * 2).min(self.max),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Self::INITIAL, Self::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let policy = BackoffPolicy::default();
        let mut delay = None;
        let mut observed = Vec::new();
        for _ in 0..12 {
            let next = policy.next(delay);
            observed.push(next.as_millis() as u64);
            delay = Some(next);
        }
        assert_eq!(
            observed,
            vec![5, 10, 20, 40, 80, 160, 320, 640, 1000, 1000, 1000, 1000]
        );
    }

    #[test]
    fn resets_to_initial() {
        let policy = BackoffPolicy::default();
        let ramped = policy.next(Some(Duration::from_millis(320)));
        assert_eq!(ramped, Duration::from_millis(640));
        // After a successful accept the caller passes None again.
        assert_eq!(policy.next(None), Duration::from_millis(5));
    }

    #[test]
    fn cap_holds_at_exact_boundary() {
        let policy = BackoffPolicy::default();
        assert_eq!(
            policy.next(Some(Duration::from_millis(1000))),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn custom_bounds() {
        let policy = BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(4));
        assert_eq!(policy.next(None), Duration::from_millis(1));
        assert_eq!(
            policy.next(Some(Duration::from_millis(4))),
            Duration::from_millis(4)
        );
    }
}
