//! Object attributes and the metadata contract shared with other producers.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;

/// Metadata key marking an object as a derivative produced by the resizer.
pub const RESIZED_KEY: &str = "isResized";

/// The only value of [`RESIZED_KEY`] that counts as "already resized".
pub const RESIZED_VALUE: &str = "true";

/// One user metadata entry attached to an object.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MetadataEntry {
    pub key: String,
    pub value: String,
}

/// What the resizer needs to know about an object before touching it.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectAttributes {
    pub content_type: String,
    pub metadata: HashMap<String, String>,
}

impl ObjectAttributes {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// True when the object carries `isResized=true`.
    pub fn is_resized(&self) -> bool {
        self.metadata.get(RESIZED_KEY).map(String::as_str) == Some(RESIZED_VALUE)
    }
}

/// The metadata stamped onto every derivative.
pub fn resized_marker() -> HashMap<String, String> {
    HashMap::from([(RESIZED_KEY.to_string(), RESIZED_VALUE.to_string())])
}

/// Map a metadata key that arrived through a case-insensitive channel (HTTP
/// headers) back to its canonical spelling.
///
/// Only the resize marker has a canonical form; every other key is kept as-is.
pub fn canonical_metadata_key(key: &str) -> String {
    if key.eq_ignore_ascii_case(RESIZED_KEY) {
        RESIZED_KEY.to_string()
    } else {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_requires_exact_value() {
        assert!(ObjectAttributes::new("image/png")
            .with_metadata(RESIZED_KEY, "true")
            .is_resized());
        assert!(!ObjectAttributes::new("image/png")
            .with_metadata(RESIZED_KEY, "TRUE")
            .is_resized());
        assert!(!ObjectAttributes::new("image/png")
            .with_metadata("isresized", "true")
            .is_resized());
        assert!(!ObjectAttributes::new("image/png").is_resized());
    }

    #[test]
    fn header_keys_map_back_to_the_marker() {
        assert_eq!(canonical_metadata_key("isresized"), RESIZED_KEY);
        assert_eq!(canonical_metadata_key("ISRESIZED"), RESIZED_KEY);
        assert_eq!(canonical_metadata_key("author"), "author");
    }
}
