//! Connection reference counting
//!
//! Several concurrent requests may share one broker connection; the
//! counter tracks which logical owners still need it so the connection is
//! torn down exactly when the last one releases.

use std::collections::{HashMap, HashSet};

/// Reference counter keyed by connection identifier (e.g. a broker URL).
///
/// Increasing twice with the same `ref_id` is a no-op, which makes
/// acquire/release reentrant across tasks.
#[derive(Debug, Default)]
pub struct ConnRefCounter {
    refs: HashMap<String, HashSet<String>>,
}

impl ConnRefCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `ref_id` as an owner of the connection under `key`.
    pub fn increase(&mut self, key: &str, ref_id: &str) {
        self.refs
            .entry(key.to_string())
            .or_default()
            .insert(ref_id.to_string());
    }

    /// Removes `ref_id` from the owners of the connection under `key`.
    pub fn decrease(&mut self, key: &str, ref_id: &str) {
        if let Some(owners) = self.refs.get_mut(key) {
            owners.remove(ref_id);
            if owners.is_empty() {
                self.refs.remove(key);
            }
        }
    }

    /// Returns true while at least one owner holds the connection.
    pub fn has_any(&self, key: &str) -> bool {
        self.refs.get(key).map(|o| !o.is_empty()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_lifecycle() {
        let mut counter = ConnRefCounter::new();
        assert!(!counter.has_any("mqtt://broker"));

        counter.increase("mqtt://broker", "a");
        counter.increase("mqtt://broker", "b");
        assert!(counter.has_any("mqtt://broker"));

        counter.decrease("mqtt://broker", "a");
        assert!(counter.has_any("mqtt://broker"));

        counter.decrease("mqtt://broker", "b");
        assert!(!counter.has_any("mqtt://broker"));
    }

    #[test]
    fn test_counter_is_reentrant_per_ref_id() {
        let mut counter = ConnRefCounter::new();
        counter.increase("mqtt://broker", "a");
        counter.increase("mqtt://broker", "a");

        counter.decrease("mqtt://broker", "a");
        assert!(!counter.has_any("mqtt://broker"));
    }

    #[test]
    fn test_counter_keys_are_independent() {
        let mut counter = ConnRefCounter::new();
        counter.increase("mqtt://one", "a");
        counter.increase("mqtt://two", "a");

        counter.decrease("mqtt://one", "a");
        assert!(!counter.has_any("mqtt://one"));
        assert!(counter.has_any("mqtt://two"));
    }
}
