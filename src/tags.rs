//! Bidirectional tag index for the memory tier.
//!
//! Maintains `tag → keys` and `key → tags` together under a single
//! reader-writer lock so the two directions can never be observed out of
//! step. Readers share; writers exclude all.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tracing::warn;

#[derive(Default)]
struct IndexMaps {
    tag_to_keys: HashMap<String, HashSet<String>>,
    key_to_tags: HashMap<String, HashSet<String>>,
    /// Total number of key↔tag pairings across both directions (counted once
    /// per pairing).
    mapping_count: usize,
}

/// Bidirectional key↔tag index with a mapping cap.
pub struct TagIndex {
    inner: RwLock<IndexMaps>,
    max_mappings: usize,
}

impl TagIndex {
    #[must_use]
    pub fn new(max_mappings: usize) -> Self {
        Self {
            inner: RwLock::new(IndexMaps::default()),
            max_mappings,
        }
    }

    /// Register `key` under each tag. Mappings beyond the cap are skipped
    /// (the value itself is still stored by the caller). Returns the number
    /// of mappings actually added.
    pub fn insert(&self, key: &str, tags: &[String]) -> usize {
        if tags.is_empty() {
            return 0;
        }
        let mut maps = self.inner.write();
        let mut added = 0;
        for tag in tags {
            if maps.mapping_count >= self.max_mappings {
                warn!(
                    key = %key,
                    tag = %tag,
                    cap = self.max_mappings,
                    "tag mapping cap reached, skipping new tag mappings"
                );
                break;
            }
            let fresh = maps
                .tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
            if fresh {
                maps.key_to_tags
                    .entry(key.to_string())
                    .or_default()
                    .insert(tag.clone());
                maps.mapping_count += 1;
                added += 1;
            }
        }
        added
    }

    /// Remove every mapping involving `key`. Used by the post-eviction
    /// callback and by explicit removal.
    pub fn remove_key(&self, key: &str) {
        let mut maps = self.inner.write();
        let Some(tags) = maps.key_to_tags.remove(key) else {
            return;
        };
        for tag in &tags {
            let mut removed = false;
            let mut empty = false;
            if let Some(keys) = maps.tag_to_keys.get_mut(tag) {
                removed = keys.remove(key);
                empty = keys.is_empty();
            }
            if removed {
                maps.mapping_count = maps.mapping_count.saturating_sub(1);
            }
            if empty {
                maps.tag_to_keys.remove(tag);
            }
        }
    }

    /// Remove the tag and all its mappings, returning the keys that carried
    /// it. The caller deletes the entries themselves.
    pub fn take_tag(&self, tag: &str) -> Vec<String> {
        let mut maps = self.inner.write();
        let Some(keys) = maps.tag_to_keys.remove(tag) else {
            return Vec::new();
        };
        for key in &keys {
            let mut removed = false;
            let mut empty = false;
            if let Some(tags) = maps.key_to_tags.get_mut(key) {
                removed = tags.remove(tag);
                empty = tags.is_empty();
            }
            if removed {
                maps.mapping_count = maps.mapping_count.saturating_sub(1);
            }
            if empty {
                maps.key_to_tags.remove(key);
            }
        }
        keys.into_iter().collect()
    }

    /// Keys currently carrying `tag`.
    #[must_use]
    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        self.inner
            .read()
            .tag_to_keys
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Tags currently attached to `key`.
    #[must_use]
    pub fn tags_for_key(&self, key: &str) -> Vec<String> {
        self.inner
            .read()
            .key_to_tags
            .get(key)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Tags matching a glob pattern (`*` and `?`).
    #[must_use]
    pub fn tags_matching(&self, pattern: &str) -> Vec<String> {
        self.inner
            .read()
            .tag_to_keys
            .keys()
            .filter(|tag| glob_match(pattern, tag))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn mapping_count(&self) -> usize {
        self.inner.read().mapping_count
    }

    pub fn clear(&self) {
        let mut maps = self.inner.write();
        maps.tag_to_keys.clear();
        maps.key_to_tags.clear();
        maps.mapping_count = 0;
    }
}

/// Iterative glob matcher supporting `*` (any run) and `?` (any one char).
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);

    while t < txt.len() {
        match pat.get(p) {
            Some('*') => {
                star = Some(p);
                mark = t;
                p += 1;
            }
            Some('?') => {
                p += 1;
                t += 1;
            }
            Some(&c) if txt.get(t) == Some(&c) => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some(s) => {
                    p = s + 1;
                    mark += 1;
                    t = mark;
                }
                None => return false,
            },
        }
    }
    while pat.get(p) == Some(&'*') {
        p += 1;
    }
    p == pat.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn both_directions_stay_consistent() {
        let index = TagIndex::new(100);
        index.insert("k1", &tags(&["t1", "t2"]));
        index.insert("k2", &tags(&["t1"]));

        assert_eq!(index.mapping_count(), 3);
        let mut keys = index.keys_for_tag("t1");
        keys.sort();
        assert_eq!(keys, vec!["k1", "k2"]);
        let mut ktags = index.tags_for_key("k1");
        ktags.sort();
        assert_eq!(ktags, vec!["t1", "t2"]);
    }

    #[test]
    fn remove_key_cleans_both_directions() {
        let index = TagIndex::new(100);
        index.insert("k1", &tags(&["t1", "t2"]));
        index.remove_key("k1");

        assert!(index.keys_for_tag("t1").is_empty());
        assert!(index.tags_for_key("k1").is_empty());
        assert_eq!(index.mapping_count(), 0);
    }

    #[test]
    fn take_tag_returns_keys_and_cleans_index() {
        let index = TagIndex::new(100);
        index.insert("k1", &tags(&["t1"]));
        index.insert("k2", &tags(&["t1", "t2"]));

        let mut taken = index.take_tag("t1");
        taken.sort();
        assert_eq!(taken, vec!["k1", "k2"]);
        assert!(index.keys_for_tag("t1").is_empty());
        // k2 keeps its t2 mapping
        assert_eq!(index.tags_for_key("k2"), vec!["t2"]);
        assert_eq!(index.mapping_count(), 1);
    }

    #[test]
    fn mapping_cap_skips_new_mappings() {
        let index = TagIndex::new(2);
        assert_eq!(index.insert("k1", &tags(&["t1", "t2"])), 2);
        assert_eq!(index.insert("k2", &tags(&["t3"])), 0);
        assert_eq!(index.mapping_count(), 2);
        assert!(index.keys_for_tag("t3").is_empty());
    }

    #[test]
    fn duplicate_insert_does_not_double_count() {
        let index = TagIndex::new(100);
        index.insert("k1", &tags(&["t1"]));
        index.insert("k1", &tags(&["t1"]));
        assert_eq!(index.mapping_count(), 1);
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("user:*", "user:123"));
        assert!(glob_match("user:?:a", "user:1:a"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("user:*", "order:123"));
        assert!(glob_match("a*c", "abbbc"));
        assert!(!glob_match("a*c", "abbbd"));
    }
}
