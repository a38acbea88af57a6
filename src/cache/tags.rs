//! Tag Index
//!
//! Maps invalidation tags to the keys written under them, and tracks a
//! generation counter per tag. The key sets are eventually consistent with
//! entry expiry; the generations are what make invalidation atomic.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::RwLock;

#[derive(Default)]
struct TagState {
    keys: HashMap<String, HashSet<String>>,
    generations: HashMap<String, u64>,
}

/// Tag -> keys index with per-tag generations
#[derive(Default)]
pub struct TagIndex {
    state: RwLock<TagState>,
}

impl TagIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation of each tag (unknown tags are generation 0)
    pub fn generations_for<S: AsRef<str>>(&self, tags: &[S]) -> BTreeMap<String, u64> {
        let state = self.state.read();
        tags.iter()
            .map(|t| {
                let tag = t.as_ref();
                (tag.to_string(), state.generations.get(tag).copied().unwrap_or(0))
            })
            .collect()
    }

    /// True if every recorded generation is still current
    pub fn is_current(&self, recorded: &BTreeMap<String, u64>) -> bool {
        if recorded.is_empty() {
            return true;
        }
        let state = self.state.read();
        recorded
            .iter()
            .all(|(tag, gen)| state.generations.get(tag).copied().unwrap_or(0) == *gen)
    }

    /// Register `key` under each tag, provided the generations are still
    /// current. Returns false (registering nothing) if any tag was
    /// invalidated after the generations were observed.
    pub fn register(&self, key: &str, recorded: &BTreeMap<String, u64>) -> bool {
        let mut state = self.state.write();
        let current = recorded
            .iter()
            .all(|(tag, gen)| state.generations.get(tag).copied().unwrap_or(0) == *gen);
        if !current {
            return false;
        }
        for tag in recorded.keys() {
            state
                .keys
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        true
    }

    /// Invalidate a tag: bump its generation and take its key set, in one step
    pub fn invalidate(&self, tag: &str) -> Vec<String> {
        let mut state = self.state.write();
        *state.generations.entry(tag.to_string()).or_insert(0) += 1;
        state
            .keys
            .remove(tag)
            .map(|keys| keys.into_iter().collect())
            .unwrap_or_default()
    }

    /// Drop `key` from the given tags
    pub fn unregister<'a>(&self, key: &str, tags: impl IntoIterator<Item = &'a str>) {
        let mut state = self.state.write();
        for tag in tags {
            if let Some(keys) = state.keys.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    state.keys.remove(tag);
                }
            }
        }
    }

    /// Drop `key` from every tag
    pub fn forget(&self, key: &str) {
        let mut state = self.state.write();
        state.keys.retain(|_, keys| {
            keys.remove(key);
            !keys.is_empty()
        });
    }

    /// Keys currently indexed under `tag`
    pub fn keys_for(&self, tag: &str) -> Vec<String> {
        let state = self.state.read();
        let mut keys: Vec<String> = state
            .keys
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Current generation of a tag
    pub fn generation(&self, tag: &str) -> u64 {
        self.state.read().generations.get(tag).copied().unwrap_or(0)
    }

    /// Number of tags with at least one key
    pub fn tag_count(&self) -> usize {
        self.state.read().keys.len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let index = TagIndex::new();
        let gens = index.generations_for(&["venues", "galle"]);
        assert!(index.register("k1", &gens));
        assert!(index.register("k2", &index.generations_for(&["venues"])));

        assert_eq!(index.keys_for("venues"), vec!["k1", "k2"]);
        assert_eq!(index.keys_for("galle"), vec!["k1"]);
        assert_eq!(index.tag_count(), 2);
    }

    #[test]
    fn test_invalidate_bumps_generation_and_takes_keys() {
        let index = TagIndex::new();
        let gens = index.generations_for(&["venues"]);
        index.register("k1", &gens);

        let mut keys = index.invalidate("venues");
        keys.sort();
        assert_eq!(keys, vec!["k1"]);
        assert_eq!(index.generation("venues"), 1);
        assert!(index.keys_for("venues").is_empty());
        assert!(!index.is_current(&gens));
    }

    #[test]
    fn test_stale_registration_rejected() {
        let index = TagIndex::new();
        let gens = index.generations_for(&["vendors"]);
        index.invalidate("vendors");

        assert!(!index.register("late", &gens));
        assert!(index.keys_for("vendors").is_empty());
    }

    #[test]
    fn test_untagged_always_current() {
        let index = TagIndex::new();
        assert!(index.is_current(&BTreeMap::new()));
        assert!(index.register("k", &BTreeMap::new()));
    }

    #[test]
    fn test_other_tags_untouched() {
        let index = TagIndex::new();
        let t = index.generations_for(&["t"]);
        let u = index.generations_for(&["u"]);
        index.register("a", &t);
        index.register("b", &u);

        index.invalidate("t");
        assert!(!index.is_current(&t));
        assert!(index.is_current(&u));
        assert_eq!(index.keys_for("u"), vec!["b"]);
    }

    #[test]
    fn test_unregister_and_forget() {
        let index = TagIndex::new();
        index.register("a", &index.generations_for(&["t", "u"]));
        index.register("b", &index.generations_for(&["t"]));

        index.unregister("a", ["u"]);
        assert!(index.keys_for("u").is_empty());

        index.forget("b");
        assert_eq!(index.keys_for("t"), vec!["a"]);

        index.forget("a");
        assert_eq!(index.tag_count(), 0);
    }
}
