//! Caller wait policy for queued I/O

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// How long a caller suspends before it gets a `Timeout`
///
/// A timeout only ends the caller's wait. The queued operation keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Wait {
    /// Submit and return immediately
    NoWait,
    /// Wait at most this long
    Timeout(Duration),
    /// Wait until the operation completes
    #[default]
    Infinite,
}

impl Wait {
    /// Build from a millisecond setting where `0` means infinite
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            Wait::Infinite
        } else {
            Wait::Timeout(Duration::from_millis(ms))
        }
    }

    /// Absolute deadline, `None` for infinite waits
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Wait::NoWait => Some(Instant::now()),
            Wait::Timeout(d) => Some(Instant::now() + *d),
            Wait::Infinite => None,
        }
    }

    /// Whether the caller blocks at all
    pub fn blocks(&self) -> bool {
        !matches!(self, Wait::NoWait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_millis() {
        assert_eq!(Wait::from_millis(0), Wait::Infinite);
        assert_eq!(
            Wait::from_millis(250),
            Wait::Timeout(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_deadline() {
        assert!(Wait::Infinite.deadline().is_none());
        assert!(Wait::NoWait.deadline().unwrap() <= Instant::now());
        assert!(!Wait::NoWait.blocks());
        assert!(Wait::default().blocks());
    }
}
