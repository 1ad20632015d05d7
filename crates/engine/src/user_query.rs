//! Questions the engine asks its embedder during start-up.

use std::path::Path;
use tracing::warn;

/// Answer to a start-up question
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryAnswer {
    /// Stop starting; `start` returns `Aborted`
    Abort,
    /// Proceed with what could be recovered
    Continue,
}

/// Decision hook for recoverable start-up problems.
pub trait UserQuery: Send + Sync {
    /// Storage has objects but its check file is missing or unreadable.
    ///
    /// Continuing starts from an empty tree; object ids are never reused.
    fn no_check_file(&self) -> QueryAnswer;

    /// A journal book at `path` could not be fully trusted.
    ///
    /// Continuing replays whatever records decoded.
    fn inconsistent_journal(&self, path: &Path) -> QueryAnswer;
}

/// Answers `Continue` to everything, logging each question.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractive;

impl UserQuery for NonInteractive {
    fn no_check_file(&self) -> QueryAnswer {
        warn!("Storage check file missing, continuing with an empty tree");
        QueryAnswer::Continue
    }

    fn inconsistent_journal(&self, path: &Path) -> QueryAnswer {
        warn!(path = %path.display(), "Inconsistent journal book, continuing");
        QueryAnswer::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_interactive_continues() {
        let query = NonInteractive;
        assert_eq!(query.no_check_file(), QueryAnswer::Continue);
        assert_eq!(
            query.inconsistent_journal(Path::new("book-000001.book")),
            QueryAnswer::Continue
        );
    }
}
