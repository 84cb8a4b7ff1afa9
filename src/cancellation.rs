//! # Cooperative cancellation
//!
//! Interrupting a worker by injecting an asynchronous exception into a
//! specific thread has no safe Rust equivalent, so this crate does not
//! attempt it. Instead, `CancellationToken` is a cheap, cloneable flag
//! that framework code checks at suspension points (`Connection::get`,
//! the local manager's socket wait). User objectives that never call
//! back into the trial proxy (a CPU-only tight loop) are only
//! interruptible when the cluster or process supervisor reclaims the
//! worker outright; this is documented on `RemoteTrial` rather than
//! silently promised away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cooperative stop signal shared between a supervisor and the code it
/// watches over.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Trip the token. Idempotent, safe to call from any thread.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uncancelled_and_latches() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
