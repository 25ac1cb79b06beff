//! Bounded duplicate detector used during alias expansion and recipient
//! logging.
//!
//! Insertion order is also the eviction order; the filter deliberately does
//! not track recency.

use std::collections::VecDeque;

use ahash::AHashMap;

/// A bounded set of strings with FIFO eviction and an optional
/// case-folding mode.
///
/// Each remembered string carries an integer level for callers that need to
/// distinguish *where* a duplicate was first seen.
#[derive(Debug)]
pub struct DupFilter {
    seen: AHashMap<String, i32>,
    order: VecDeque<String>,
    /// Zero disables the bound.
    limit: usize,
    fold_case: bool,
}

impl DupFilter {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            seen: AHashMap::new(),
            order: VecDeque::new(),
            limit,
            fold_case: false,
        }
    }

    #[must_use]
    pub fn with_fold_case(mut self) -> Self {
        self.fold_case = true;
        self
    }

    fn fold(&self, key: &str) -> String {
        if self.fold_case {
            key.to_ascii_lowercase()
        } else {
            key.to_string()
        }
    }

    /// Remember `key` at level 0. Returns `true` the first time the key is
    /// seen.
    pub fn check_and_insert(&mut self, key: &str) -> bool {
        self.check_and_insert_level(key, 0).is_none()
    }

    /// Remember `key` with a caller-defined level. Returns the level the key
    /// was first inserted at, or `None` when the key is new.
    pub fn check_and_insert_level(&mut self, key: &str, level: i32) -> Option<i32> {
        let folded = self.fold(key);
        if let Some(prior) = self.seen.get(&folded) {
            return Some(*prior);
        }
        if self.limit > 0 && self.seen.len() >= self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(folded.clone(), level);
        self.order.push_back(folded);
        None
    }

    /// Query without updating the filter.
    #[must_use]
    pub fn check(&self, key: &str) -> Option<i32> {
        self.seen.get(&self.fold(key)).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_insert_reports_new() {
        let mut filter = DupFilter::new(10);
        assert!(filter.check_and_insert("a@example.com"));
        assert!(!filter.check_and_insert("a@example.com"));
    }

    #[test]
    fn never_exceeds_the_limit() {
        let mut filter = DupFilter::new(3);
        for i in 0..50 {
            filter.check_and_insert(&format!("user{i}@example.com"));
            assert!(filter.len() <= 3);
        }
    }

    #[test]
    fn eviction_is_fifo() {
        let mut filter = DupFilter::new(2);
        filter.check_and_insert("first");
        filter.check_and_insert("second");
        filter.check_and_insert("third");

        // "first" was evicted, so it reads as new again.
        assert!(filter.check("first").is_none());
        assert!(filter.check("second").is_some());
        assert!(filter.check("third").is_some());
    }

    #[test]
    fn fold_case_mode() {
        let mut filter = DupFilter::new(10).with_fold_case();
        assert!(filter.check_and_insert("User@Example.COM"));
        assert!(!filter.check_and_insert("user@example.com"));
    }

    #[test]
    fn levels_are_preserved() {
        let mut filter = DupFilter::new(10);
        assert_eq!(filter.check_and_insert_level("x", 7), None);
        assert_eq!(filter.check_and_insert_level("x", 9), Some(7));
        assert_eq!(filter.check("x"), Some(7));
    }

    #[test]
    fn zero_limit_is_unbounded() {
        let mut filter = DupFilter::new(0);
        for i in 0..2000 {
            filter.check_and_insert(&format!("k{i}"));
        }
        assert_eq!(filter.len(), 2000);
    }
}
