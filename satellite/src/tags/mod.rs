//! Causal tag algebra.
//!
//! A tag is `origin@ms` — the identity of one write. Tag sets are
//! unordered; the encoding sorts them so wire bytes are stable.

use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::Error;

/// Reserved origin for server-side writes.
pub const SERVER_ORIGIN: &str = "remote";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    pub origin: String,
    pub timestamp: i64,
}

impl Tag {
    pub fn new(origin: impl Into<String>, timestamp: i64) -> Self {
        Self {
            origin: origin.into(),
            timestamp,
        }
    }
}

/// Deterministic order: timestamp first, origin string breaks ties.
impl Ord for Tag {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.origin.cmp(&other.origin))
    }
}

impl PartialOrd for Tag {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.origin, self.timestamp)
    }
}

impl FromStr for Tag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Origins may contain '@', timestamps can't.
        let (origin, timestamp) = s
            .rsplit_once('@')
            .ok_or_else(|| Error::Internal(format!("malformed tag: {}", s)))?;
        let timestamp: i64 = timestamp
            .parse()
            .map_err(|_| Error::Internal(format!("malformed tag timestamp: {}", s)))?;
        Ok(Tag::new(origin, timestamp))
    }
}

/// The observed causal history of a row.
pub type TagSet = BTreeSet<Tag>;

/// Mint the tag for a write.
pub fn generate_tag(origin: &str, timestamp: i64) -> Tag {
    Tag::new(origin, timestamp)
}

/// Canonical JSON array, sorted.
pub fn encode_tags(tags: &TagSet) -> String {
    let strings: Vec<String> = tags.iter().map(|tag| tag.to_string()).collect();
    serde_json::to_string(&strings).expect("tag encoding is infallible")
}

pub fn decode_tags(raw: &str) -> Result<TagSet, Error> {
    if raw.is_empty() {
        return Ok(TagSet::new());
    }
    let strings: Vec<String> = serde_json::from_str(raw)?;
    strings.iter().map(|s| s.parse()).collect()
}

pub fn union(a: &TagSet, b: &TagSet) -> TagSet {
    a.union(b).cloned().collect()
}

pub fn difference(a: &TagSet, b: &TagSet) -> TagSet {
    a.difference(b).cloned().collect()
}

pub fn contains(set: &TagSet, tag: &Tag) -> bool {
    set.contains(tag)
}

/// Build a set from wire strings.
pub fn tags_from_strings(strings: &[String]) -> Result<TagSet, Error> {
    strings.iter().map(|s| s.parse()).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn set(tags: &[(&str, i64)]) -> TagSet {
        tags.iter().map(|(o, t)| Tag::new(*o, *t)).collect()
    }

    #[test]
    fn test_parse_roundtrip() {
        let tag: Tag = "client-a@1700000000123".parse().unwrap();
        assert_eq!(tag.origin, "client-a");
        assert_eq!(tag.timestamp, 1700000000123);
        assert_eq!(tag.to_string(), "client-a@1700000000123");

        // Origins with '@' in them still parse.
        let tag: Tag = "user@host@42".parse().unwrap();
        assert_eq!(tag.origin, "user@host");
        assert_eq!(tag.timestamp, 42);

        assert!("no-timestamp".parse::<Tag>().is_err());
        assert!("bad@stamp".parse::<Tag>().is_err());
    }

    #[test]
    fn test_encoding_is_canonical() {
        let a = set(&[("b", 2), ("a", 2), ("c", 1)]);
        // Sorted by timestamp then origin.
        assert_eq!(encode_tags(&a), r#"["c@1","a@2","b@2"]"#);
        assert_eq!(decode_tags(&encode_tags(&a)).unwrap(), a);
        assert_eq!(decode_tags("").unwrap(), TagSet::new());
        assert_eq!(decode_tags("[]").unwrap(), TagSet::new());
    }

    #[test]
    fn test_set_algebra() {
        let a = set(&[("a", 1), ("b", 2)]);
        let b = set(&[("b", 2), ("c", 3)]);

        assert_eq!(union(&a, &b), set(&[("a", 1), ("b", 2), ("c", 3)]));
        assert_eq!(difference(&a, &b), set(&[("a", 1)]));
        assert!(contains(&a, &Tag::new("b", 2)));
        // Equality is origin + exact ms.
        assert!(!contains(&a, &Tag::new("b", 3)));
    }

    #[test]
    fn test_same_origin_distinct_timestamps() {
        let tags = set(&[("a", 1), ("a", 2)]);
        assert_eq!(tags.len(), 2);
    }
}
