//! Cancellation: a process-wide shutdown flag plus per-run tokens

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide shutdown flag, set by the SIGTERM/SIGINT handler
pub fn shutdown_flag() -> &'static AtomicBool {
    static FLAG: AtomicBool = AtomicBool::new(false);
    &FLAG
}

pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

pub fn request_shutdown() {
    shutdown_flag().store(true, Ordering::Relaxed);
}

/// Cancel signal for one run.
///
/// Clones share the same flag. A token created with
/// [`CancelToken::linked_to_shutdown`] also reports cancelled once process
/// shutdown has been requested.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    follows_shutdown: bool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn linked_to_shutdown() -> Self {
        Self {
            flag: Arc::default(),
            follows_shutdown: true,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || (self.follows_shutdown && is_shutdown_requested())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_flag() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn unlinked_token_ignores_fresh_tokens() {
        let a = CancelToken::new();
        let b = CancelToken::new();
        a.cancel();
        assert!(!b.is_cancelled());
    }
}
