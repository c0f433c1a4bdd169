use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared flag for stopping a running fit or fold-in from outside.
///
/// Clones share the flag, so a token handed to a fit can be cancelled from
/// another thread. An optional deadline acts as an implicit cancel.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone sharing the flag that also fires once `limit` has elapsed from now.
    /// The earlier of two deadlines wins.
    #[must_use]
    pub fn with_time_limit(&self, limit: Duration) -> Self {
        let deadline = Instant::now().checked_add(limit);
        let deadline = match (self.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        CancelToken {
            flag: Arc::clone(&self.flag),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_zero_time_limit_fires() {
        let token = CancelToken::new().with_time_limit(Duration::ZERO);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_long_time_limit_does_not_fire() {
        let token = CancelToken::new().with_time_limit(Duration::from_secs(3600));
        assert!(!token.is_cancelled());
    }
}
