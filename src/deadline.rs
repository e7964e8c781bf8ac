use std::time::Duration;

use tokio::time::Instant;

/// An absolute monotonic instant bounding an entire establishment pipeline.
///
/// A single deadline governs every stage; each sub-stage (proxy, TLS) derives
/// its own timeout as `deadline - now` at the moment it begins, so a slow
/// early stage shrinks the budget of everything after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnectionDeadline(Instant);

impl ConnectionDeadline {
    /// A deadline at an absolute instant.
    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now() + timeout)
    }

    /// The underlying instant, for use with `tokio::time::timeout_at`.
    pub fn instant(&self) -> Instant {
        self.0
    }

    /// Time left before the deadline, or `None` when it has already passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .checked_duration_since(Instant::now())
            .filter(|remaining| !remaining.is_zero())
    }

    /// Whether the deadline lies in the past.
    pub fn has_passed(&self) -> bool {
        self.remaining().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remaining_counts_down() {
        let deadline = ConnectionDeadline::after(Duration::from_secs(10));
        let remaining = deadline.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(10));
        assert!(remaining > Duration::from_secs(9));
        assert!(!deadline.has_passed());
    }

    #[tokio::test]
    async fn past_deadline_has_no_remaining() {
        let deadline = ConnectionDeadline::at(Instant::now() - Duration::from_secs(1));
        assert!(deadline.remaining().is_none());
        assert!(deadline.has_passed());
    }
}
