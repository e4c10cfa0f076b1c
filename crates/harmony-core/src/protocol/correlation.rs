//! Correlation id generation for request/response matching.
//!
//! Each session owns one [`CorrelationIds`] generator.  Ids combine a random
//! per-generator prefix with an atomic counter, so they never repeat within a
//! session and are very unlikely to collide across sessions sharing a hub.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Thread-safe generator of unique correlation ids.
///
/// # Examples
///
/// ```rust
/// use harmony_core::protocol::CorrelationIds;
///
/// let ids = CorrelationIds::with_prefix("s1");
/// assert_eq!(ids.next(), "s1-0");
/// assert_eq!(ids.next(), "s1-1");
/// ```
#[derive(Debug)]
pub struct CorrelationIds {
    prefix: String,
    counter: AtomicU64,
}

impl CorrelationIds {
    /// Creates a generator with a random prefix.
    pub fn new() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self::with_prefix(&uuid[..8])
    }

    /// Creates a generator with a fixed prefix.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            counter: AtomicU64::new(0),
        }
    }

    /// Returns a fresh id.  Relaxed ordering is enough: only uniqueness matters.
    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }

    /// Number of ids handed out so far.
    pub fn issued(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ids_are_prefixed_and_sequential() {
        let ids = CorrelationIds::with_prefix("abc");
        assert_eq!(ids.next(), "abc-0");
        assert_eq!(ids.next(), "abc-1");
        assert_eq!(ids.issued(), 2);
    }

    #[test]
    fn test_random_prefixes_differ() {
        let a = CorrelationIds::new().next();
        let b = CorrelationIds::new().next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_ids_are_unique_across_threads() {
        // Arrange
        let ids = Arc::new(CorrelationIds::new());
        let thread_count = 8;
        let per_thread = 500;

        // Act
        let handles: Vec<_> = (0..thread_count)
            .map(|_| {
                let ids = Arc::clone(&ids);
                thread::spawn(move || (0..per_thread).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();
        let all: HashSet<String> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();

        // Assert
        assert_eq!(all.len(), thread_count * per_thread);
    }
}
