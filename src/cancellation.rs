//! Cancellation and deadlines for long-running operations.
//!
//! Every public operation accepts a [`CancellationToken`] (cheap to clone,
//! shareable across threads via `parking_lot`/`Arc`) and an optional
//! [`Deadline`]. Long-running loops — batch insert, index rebuild,
//! PageRank, community detection — poll [`CancellationToken::is_cancelled`]
//! and [`Deadline::is_expired`] at outer-loop boundaries only (between
//! batches, between iterations, between BFS layers), never inside an inner
//! distance computation, matching the "suspension points" design note.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Result, VectorDbError};

/// A cooperative cancellation flag. Cloning shares the same underlying
/// flag; call [`CancellationToken::cancel`] from any clone to signal every
/// holder.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// A token that is never cancelled, for callers with no cancellation
    /// need (most tests, and CLI one-shot invocations).
    pub fn none() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` if this token has been signalled, else `Ok(())`.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(VectorDbError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A wall-clock deadline for a single operation. On expiry, in-flight beam
/// search returns the best result collected so far, flagged as partial;
/// callers may opt to treat partial results as failures via search options.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(d: Duration) -> Self {
        Self { at: Instant::now() + d }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Return `Err(DeadlineExceeded)` if this deadline has passed.
    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            Err(VectorDbError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let token = CancellationToken::none();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn cancelling_one_clone_cancels_all() {
        let token = CancellationToken::none();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(VectorDbError::Cancelled)));
    }

    #[test]
    fn deadline_in_the_future_has_not_expired() {
        let deadline = Deadline::after(Duration::from_secs(60));
        assert!(!deadline.is_expired());
        assert!(deadline.check().is_ok());
    }

    #[test]
    fn deadline_in_the_past_has_expired() {
        let deadline = Deadline::after(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(deadline.is_expired());
        assert!(matches!(deadline.check(), Err(VectorDbError::DeadlineExceeded)));
    }
}
