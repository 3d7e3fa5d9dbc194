//! Content hash engine
//!
//! Every record type declares its canonical field set through
//! [`ContentHashed::canonical_fields`]. The digest is SHA-256 over the compact
//! JSON rendering of those fields with keys in lexicographic order, so it is
//! independent of declaration order and of how a value was represented.
//!
//! Timestamps, the stored hash itself and relationship collections (images,
//! aliases, credits, labels, ...) are never part of a canonical field set.

use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

use crate::models::{Artist, CatalogRecord, Label, Master, NaturalKey, Release};

/// Canonical field name -> value
pub type CanonicalFields = BTreeMap<&'static str, Value>;

/// A record that can be matched by natural key and compared by content hash
pub trait ContentHashed {
    fn natural_key(&self) -> NaturalKey;

    fn canonical_fields(&self) -> CanonicalFields;

    /// Hash carried by the record, if one has been computed
    fn content_hash(&self) -> Option<&str>;

    fn set_content_hash(&mut self, hash: String);
}

/// Compute the digest of a record's canonical fields
pub fn compute_hash<T: ContentHashed + ?Sized>(record: &T) -> String {
    hash_fields(record.canonical_fields())
}

/// Digest of an arbitrary canonical field map
pub fn hash_fields(fields: CanonicalFields) -> String {
    let object: Map<String, Value> = fields
        .into_iter()
        .map(|(key, value)| (key.to_string(), normalize(value)))
        .collect();
    discogs_common::checksum::sha256_hex(Value::Object(object).to_string().as_bytes())
}

/// Return the record's hash, computing and storing it first if missing
pub fn ensure_hash<T: ContentHashed + ?Sized>(record: &mut T) -> String {
    if let Some(hash) = record.content_hash() {
        return hash.to_string();
    }
    let hash = compute_hash(record);
    record.set_content_hash(hash.clone());
    hash
}

/// Collapse equivalent representations onto one
///
/// Integral floats become integers and nested objects are rebuilt so their
/// keys are sorted.
fn normalize(value: Value) -> Value {
    match value {
        Value::Number(n) => Value::Number(normalize_number(n)),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, normalize(v))).collect();
            Value::Object(sorted.into_iter().collect())
        },
        other => other,
    }
}

fn normalize_number(n: Number) -> Number {
    if n.is_f64() {
        if let Some(f) = n.as_f64() {
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                return Number::from(f as i64);
            }
        }
        return n;
    }
    match n.as_i64() {
        Some(i) => Number::from(i),
        None => n,
    }
}

impl ContentHashed for Artist {
    fn natural_key(&self) -> NaturalKey {
        NaturalKey::Id(self.id)
    }

    fn canonical_fields(&self) -> CanonicalFields {
        BTreeMap::from([
            ("id", Value::from(self.id)),
            ("name", Value::from(self.name.as_str())),
            ("real_name", Value::from(self.real_name.clone())),
            ("profile", Value::from(self.profile.clone())),
            ("data_quality", Value::from(self.data_quality.clone())),
            ("urls", Value::from(self.urls.clone())),
            ("name_variations", Value::from(self.name_variations.clone())),
        ])
    }

    fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    fn set_content_hash(&mut self, hash: String) {
        self.content_hash = Some(hash);
    }
}

impl ContentHashed for Label {
    fn natural_key(&self) -> NaturalKey {
        NaturalKey::Id(self.id)
    }

    fn canonical_fields(&self) -> CanonicalFields {
        BTreeMap::from([
            ("id", Value::from(self.id)),
            ("name", Value::from(self.name.as_str())),
            ("contact_info", Value::from(self.contact_info.clone())),
            ("profile", Value::from(self.profile.clone())),
            ("data_quality", Value::from(self.data_quality.clone())),
            ("urls", Value::from(self.urls.clone())),
        ])
    }

    fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    fn set_content_hash(&mut self, hash: String) {
        self.content_hash = Some(hash);
    }
}

impl ContentHashed for Master {
    fn natural_key(&self) -> NaturalKey {
        NaturalKey::Id(self.id)
    }

    fn canonical_fields(&self) -> CanonicalFields {
        BTreeMap::from([
            ("id", Value::from(self.id)),
            ("title", Value::from(self.title.as_str())),
            ("main_release", Value::from(self.main_release)),
            ("year", Value::from(self.year)),
            ("data_quality", Value::from(self.data_quality.clone())),
            ("notes", Value::from(self.notes.clone())),
            ("genres", Value::from(self.genres.clone())),
            ("styles", Value::from(self.styles.clone())),
        ])
    }

    fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    fn set_content_hash(&mut self, hash: String) {
        self.content_hash = Some(hash);
    }
}

impl ContentHashed for Release {
    fn natural_key(&self) -> NaturalKey {
        NaturalKey::Id(self.id)
    }

    /// Tracks are canonical content of their release.
    fn canonical_fields(&self) -> CanonicalFields {
        let tracklist: Vec<Value> = self
            .tracklist
            .iter()
            .map(|t| {
                serde_json::json!({
                    "position": t.position,
                    "title": t.title,
                    "duration": t.duration,
                })
            })
            .collect();

        BTreeMap::from([
            ("id", Value::from(self.id)),
            ("title", Value::from(self.title.as_str())),
            ("status", Value::from(self.status.clone())),
            ("country", Value::from(self.country.clone())),
            ("released", Value::from(self.released.clone())),
            ("notes", Value::from(self.notes.clone())),
            ("data_quality", Value::from(self.data_quality.clone())),
            ("master_id", Value::from(self.master_id)),
            ("is_main_release", Value::from(self.is_main_release)),
            ("genres", Value::from(self.genres.clone())),
            ("styles", Value::from(self.styles.clone())),
            ("tracklist", Value::Array(tracklist)),
        ])
    }

    fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    fn set_content_hash(&mut self, hash: String) {
        self.content_hash = Some(hash);
    }
}

impl ContentHashed for CatalogRecord {
    fn natural_key(&self) -> NaturalKey {
        match self {
            CatalogRecord::Artist(r) => r.natural_key(),
            CatalogRecord::Label(r) => r.natural_key(),
            CatalogRecord::Master(r) => r.natural_key(),
            CatalogRecord::Release(r) => r.natural_key(),
        }
    }

    fn canonical_fields(&self) -> CanonicalFields {
        match self {
            CatalogRecord::Artist(r) => r.canonical_fields(),
            CatalogRecord::Label(r) => r.canonical_fields(),
            CatalogRecord::Master(r) => r.canonical_fields(),
            CatalogRecord::Release(r) => r.canonical_fields(),
        }
    }

    fn content_hash(&self) -> Option<&str> {
        match self {
            CatalogRecord::Artist(r) => r.content_hash(),
            CatalogRecord::Label(r) => r.content_hash(),
            CatalogRecord::Master(r) => r.content_hash(),
            CatalogRecord::Release(r) => r.content_hash(),
        }
    }

    fn set_content_hash(&mut self, hash: String) {
        match self {
            CatalogRecord::Artist(r) => r.set_content_hash(hash),
            CatalogRecord::Label(r) => r.set_content_hash(hash),
            CatalogRecord::Master(r) => r.set_content_hash(hash),
            CatalogRecord::Release(r) => r.set_content_hash(hash),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::{ArtistRef, Image, Track};
    use serde_json::json;

    fn artist() -> Artist {
        Artist {
            id: 1,
            name: "The Persuader".to_string(),
            real_name: Some("Jesper Dahlbäck".to_string()),
            profile: Some("Swedish techno producer".to_string()),
            data_quality: Some("Needs Vote".to_string()),
            urls: vec!["https://example.com".to_string()],
            name_variations: vec!["Persuader".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_hash_is_lowercase_sha256_hex() {
        let hash = compute_hash(&artist());
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_eq!(hash, compute_hash(&artist()));
    }

    #[test]
    fn test_known_digest_of_compact_sorted_json() {
        let fields = BTreeMap::from([("b", json!(2)), ("a", json!("x"))]);
        let expected = discogs_common::checksum::sha256_hex(br#"{"a":"x","b":2}"#);
        assert_eq!(hash_fields(fields), expected);
    }

    #[test]
    fn test_numeric_kinds_collapse() {
        let as_int = BTreeMap::from([("year", json!(1999))]);
        let as_float = BTreeMap::from([("year", json!(1999.0))]);
        let as_unsigned = BTreeMap::from([("year", Value::from(1999u64))]);
        assert_eq!(hash_fields(as_int.clone()), hash_fields(as_float));
        assert_eq!(hash_fields(as_int), hash_fields(as_unsigned));
    }

    #[test]
    fn test_nested_object_key_order_irrelevant() {
        let a = BTreeMap::from([("t", json!({"x": 1, "y": 2}))]);
        let mut reversed = Map::new();
        reversed.insert("y".to_string(), json!(2));
        reversed.insert("x".to_string(), json!(1));
        let b = BTreeMap::from([("t", Value::Object(reversed))]);
        assert_eq!(hash_fields(a), hash_fields(b));
    }

    #[test]
    fn test_relationships_and_stored_hash_excluded() {
        let base = artist();
        let mut changed = base.clone();
        changed.aliases.push(ArtistRef {
            id: Some(2),
            name: "Alias".to_string(),
        });
        changed.images.push(Image::default());
        changed.content_hash = Some("stale".to_string());
        assert_eq!(compute_hash(&base), compute_hash(&changed));
    }

    #[test]
    fn test_content_change_alters_hash() {
        let base = artist();
        let mut changed = base.clone();
        changed.profile = Some("Updated profile".to_string());
        assert_ne!(compute_hash(&base), compute_hash(&changed));

        let mut cleared = base.clone();
        cleared.real_name = None;
        assert_ne!(compute_hash(&base), compute_hash(&cleared));
    }

    #[test]
    fn test_tracklist_is_part_of_release_hash() {
        let release = Release {
            id: 7,
            title: "Stockholm".to_string(),
            tracklist: vec![Track {
                position: "A".to_string(),
                title: "Östermalm".to_string(),
                duration: Some("4:45".to_string()),
            }],
            ..Default::default()
        };
        let mut retitled = release.clone();
        retitled.tracklist[0].title = "Vasastaden".to_string();
        assert_ne!(compute_hash(&release), compute_hash(&retitled));
    }

    #[test]
    fn test_ensure_hash_computes_once() {
        let mut record = CatalogRecord::Artist(artist());
        assert!(record.content_hash().is_none());
        let hash = ensure_hash(&mut record);
        assert_eq!(record.content_hash(), Some(hash.as_str()));

        record.set_content_hash("precomputed".to_string());
        assert_eq!(ensure_hash(&mut record), "precomputed");
    }
}
