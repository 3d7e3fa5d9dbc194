//! Change classifier
//!
//! Splits an incoming batch into insert, update and skip sets by comparing
//! content hashes against the stored baseline.

use std::collections::HashMap;

use crate::hash::{ensure_hash, ContentHashed};
use crate::models::NaturalKey;

/// Natural key -> stored content hash, read once per file type per run
pub type ExistingHashIndex = HashMap<NaturalKey, String>;

/// Exact partition of one incoming batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification<R> {
    pub insert: Vec<R>,
    pub update: Vec<R>,
    pub skip: Vec<R>,
}

impl<R> Default for Classification<R> {
    fn default() -> Self {
        Self {
            insert: Vec::new(),
            update: Vec::new(),
            skip: Vec::new(),
        }
    }
}

impl<R> Classification<R> {
    pub fn len(&self) -> usize {
        self.insert.len() + self.update.len() + self.skip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records that need a write
    pub fn pending_writes(&self) -> usize {
        self.insert.len() + self.update.len()
    }
}

/// Classify records against the stored hashes
///
/// Records without a precomputed hash are hashed here. When a key occurs more
/// than once in the batch, every occurrence lands in the set decided by the
/// last one, so the final stored state matches the last occurrence and no key
/// appears in two sets.
pub fn classify<R: ContentHashed>(
    mut incoming: Vec<R>,
    existing: &ExistingHashIndex,
) -> Classification<R> {
    let mut latest: HashMap<NaturalKey, String> = HashMap::with_capacity(incoming.len());
    for record in incoming.iter_mut() {
        let hash = ensure_hash(record);
        latest.insert(record.natural_key(), hash);
    }

    let mut result = Classification::default();
    for record in incoming {
        let key = record.natural_key();
        let incoming_hash = latest.get(&key);
        match existing.get(&key) {
            None => result.insert.push(record),
            Some(stored) if Some(stored) == incoming_hash => result.skip.push(record),
            Some(_) => result.update.push(record),
        }
    }
    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::hash::{compute_hash, CanonicalFields};
    use crate::models::Artist;
    use serde_json::Value;
    use std::collections::{BTreeMap, HashSet};

    /// Genre-like record keyed by name
    #[derive(Debug, Clone)]
    struct Genre {
        name: String,
        description: String,
        hash: Option<String>,
    }

    impl ContentHashed for Genre {
        fn natural_key(&self) -> NaturalKey {
            NaturalKey::Name(self.name.clone())
        }

        fn canonical_fields(&self) -> CanonicalFields {
            BTreeMap::from([
                ("name", Value::from(self.name.as_str())),
                ("description", Value::from(self.description.as_str())),
            ])
        }

        fn content_hash(&self) -> Option<&str> {
            self.hash.as_deref()
        }

        fn set_content_hash(&mut self, hash: String) {
            self.hash = Some(hash);
        }
    }

    fn genre(name: &str, description: &str) -> Genre {
        Genre {
            name: name.to_string(),
            description: description.to_string(),
            hash: None,
        }
    }

    fn artist(id: i64, profile: &str) -> Artist {
        Artist {
            id,
            name: format!("Artist {}", id),
            profile: Some(profile.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_update_skip() {
        let unchanged = artist(1, "same");
        let changed = artist(2, "new profile");
        let fresh = artist(3, "brand new");

        let mut existing = ExistingHashIndex::new();
        existing.insert(NaturalKey::Id(1), compute_hash(&unchanged));
        existing.insert(NaturalKey::Id(2), compute_hash(&artist(2, "old profile")));

        let result = classify(vec![unchanged, changed, fresh], &existing);
        assert_eq!(result.skip.iter().map(|a| a.id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(result.update.iter().map(|a| a.id).collect::<Vec<_>>(), vec![2]);
        assert_eq!(result.insert.iter().map(|a| a.id).collect::<Vec<_>>(), vec![3]);
        assert_eq!(result.pending_writes(), 2);
    }

    #[test]
    fn test_missing_hash_computed_on_the_fly() {
        let record = artist(5, "x");
        assert!(record.content_hash.is_none());
        let result = classify(vec![record], &ExistingHashIndex::new());
        assert!(result.insert[0].content_hash.is_some());
    }

    #[test]
    fn test_name_keyed_records() {
        let mut existing = ExistingHashIndex::new();
        existing.insert(NaturalKey::from("Techno"), compute_hash(&genre("Techno", "4/4")));

        let result = classify(
            vec![genre("Techno", "4/4"), genre("House", "also 4/4")],
            &existing,
        );
        assert_eq!(result.skip.len(), 1);
        assert_eq!(result.insert.len(), 1);
        assert_eq!(result.insert[0].name, "House");
    }

    #[test]
    fn test_duplicate_keys_follow_last_occurrence() {
        let stored = artist(1, "v1");
        let mut existing = ExistingHashIndex::new();
        existing.insert(NaturalKey::Id(1), compute_hash(&stored));

        let result = classify(vec![artist(1, "v2"), artist(1, "v1")], &existing);
        assert_eq!(result.skip.len(), 2);
        assert!(result.update.is_empty());

        let result = classify(vec![artist(1, "v1"), artist(1, "v3")], &existing);
        assert_eq!(result.update.len(), 2);
        assert!(result.skip.is_empty());
    }

    #[test]
    fn test_partition_is_exact() {
        let records: Vec<Artist> = (0..50).map(|i| artist(i % 40, &format!("p{}", i % 7))).collect();
        let mut existing = ExistingHashIndex::new();
        for i in (0..40).step_by(3) {
            existing.insert(NaturalKey::Id(i), compute_hash(&artist(i, "p1")));
        }

        let result = classify(records, &existing);
        assert_eq!(result.len(), 50);

        let keys = |set: &Vec<Artist>| set.iter().map(|a| a.id).collect::<HashSet<_>>();
        let (i, u, s) = (keys(&result.insert), keys(&result.update), keys(&result.skip));
        assert!(i.is_disjoint(&u) && i.is_disjoint(&s) && u.is_disjoint(&s));
    }
}
