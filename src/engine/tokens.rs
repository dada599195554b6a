//! Named mutual-exclusion tokens for steps that share an external resource.
//!
//! Package steps all contend on the system package database; two package
//! managers running concurrently corrupt each other's locks. A step holding
//! a token keeps it across its whole probe-and-apply attempt.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// A fixed set of named locks, one per external resource.
#[derive(Debug)]
pub struct TokenSet {
    locks: HashMap<&'static str, Mutex<()>>,
}

/// Every token the engine knows about.
const TOKENS: &[&str] = &["package-db"];

impl TokenSet {
    /// Create the full token set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: TOKENS.iter().map(|&name| (name, Mutex::new(()))).collect(),
        }
    }

    /// Block until `name` is free and hold it until the guard drops.
    ///
    /// Unknown token names return `None`; the caller proceeds without
    /// exclusion.
    pub fn hold(&self, name: &str) -> Option<MutexGuard<'_, ()>> {
        self.locks
            .get(name)
            .map(|lock| lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
    }
}

impl Default for TokenSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn package_db_token_exists() {
        let tokens = TokenSet::new();
        assert!(tokens.hold("package-db").is_some());
    }

    #[test]
    fn unknown_token_is_none() {
        let tokens = TokenSet::new();
        assert!(tokens.hold("no-such-token").is_none());
    }

    #[test]
    fn holders_of_the_same_token_never_overlap() {
        let tokens = Arc::new(TokenSet::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|s| {
            for _ in 0..4 {
                let tokens = Arc::clone(&tokens);
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                s.spawn(move || {
                    let _guard = tokens.hold("package-db").expect("known token");
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(10));
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_calls_serialize_in_sequence() {
        let tokens = TokenSet::new();
        {
            let _first = tokens.hold("package-db");
        }
        // Token is free again after the guard drops.
        assert!(tokens.hold("package-db").is_some());
    }
}
