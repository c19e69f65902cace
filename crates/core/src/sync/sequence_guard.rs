//! Freshest-wins bookkeeping for operations whose responses may arrive out of order.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Token minted when an operation of some class starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceToken(pub u64);

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-class monotonic counters.
///
/// Starting an operation supersedes every earlier operation of the same class.
/// Classes are independent of each other.
#[derive(Debug, Default)]
pub struct SequenceGuard {
    counters: HashMap<String, u64>,
}

impl SequenceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints the next token for `class`; the first token of a class is `#1`.
    pub fn start_operation(&mut self, class: &str) -> SequenceToken {
        let counter = self.counters.entry(class.to_string()).or_insert(0);
        *counter += 1;
        SequenceToken(*counter)
    }

    pub fn is_current(&self, class: &str, token: SequenceToken) -> bool {
        self.counters.get(class).copied() == Some(token.0)
    }

    /// Advisory completion hook. Returns whether the finished operation was
    /// still the latest of its class.
    pub fn finish(&self, class: &str, token: SequenceToken) -> bool {
        let current = self.is_current(class, token);
        if !current {
            log::debug!("[Sync] Operation {} of class '{}' finished stale", token, class);
        }
        current
    }

    /// Latest token minted for `class`, if any.
    pub fn latest(&self, class: &str) -> Option<SequenceToken> {
        self.counters.get(class).copied().map(SequenceToken)
    }
}
