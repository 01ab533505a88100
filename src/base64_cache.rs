//! # Binary cache
//!
//! Holds the inline base64 payloads the neutralizer moved out of the
//! markup, keyed by their content hash.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

/// Content-addressed store of extracted payloads.
///
/// A cache belongs to one neutralization pass. It can be dropped as soon as
/// its consumer has expanded or abandoned the neutralized content.
#[derive(Debug, Default, Clone)]
pub struct Base64Cache {
    entries: HashMap<String, String>,
}

impl Base64Cache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `payload` and returns the key it is stored under.
    ///
    /// Storing the same payload twice is a no-op returning the same key.
    pub fn put(&mut self, payload: &str) -> String {
        let key = content_hash(payload);
        self.entries
            .entry(key.clone())
            .or_insert_with(|| payload.to_string());
        key
    }

    /// Returns the payload stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Whether something is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of stored payloads.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops all payloads.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Lowercase hex SHA-256 of `payload`.
pub fn content_hash(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_addressed() {
        let mut cache = Base64Cache::new();
        let payload = "data:image/png;base64,iVBORw0KGgo=";
        let key = cache.put(payload);
        assert_eq!(key.len(), 64);
        assert_eq!(key, content_hash(payload));
        assert_eq!(cache.get(&key), Some(payload));

        assert_eq!(cache.put(payload), key);
        assert_eq!(cache.len(), 1);

        let other = cache.put("data:image/gif;base64,R0lGOD==");
        assert_ne!(other, key);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_clear() {
        let mut cache = Base64Cache::new();
        let key = cache.put("x");
        assert!(cache.contains(&key));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&key), None);
    }

    #[test]
    fn test_known_hash() {
        assert_eq!(
            content_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
