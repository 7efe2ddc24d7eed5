//! Session identifiers for log correlation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter backing [`SessionId::next`].
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique identifier attached to every accepted connection.
///
/// Format: `sess-{counter}` with the counter zero-padded to 16 hex digits.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Allocate the next session ID.
    pub fn next() -> Self {
        let count = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("sess-{:016x}", count))
    }

    /// Get the session ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
