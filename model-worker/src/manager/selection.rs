//! Instance selection policy.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Least-in-flight selection with a rotating tie-break.
///
/// Candidates are put in a stable `(host, port)` order, rotated by a cursor that advances
/// on every call, then stably sorted by in-flight calls. Equally loaded instances therefore
/// take turns being first, so none is starved.
#[derive(Debug, Default)]
pub struct SelectionPolicy {
    cursor: AtomicUsize,
}

impl SelectionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidates in preference order.
    pub fn order<T, K, L>(&self, mut candidates: Vec<T>, sort_key: K, in_flight: L) -> Vec<T>
    where
        K: Fn(&T) -> (String, u16),
        L: Fn(&T) -> usize,
    {
        if candidates.len() < 2 {
            return candidates;
        }
        candidates.sort_by_key(|c| sort_key(c));
        let offset = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates.rotate_left(offset);
        candidates.sort_by_key(|c| in_flight(c));
        candidates
    }
}
