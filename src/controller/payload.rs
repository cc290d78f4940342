//! # Payloads
//!
//! Transient values produced during a single reconciliation pass:
//!
//! - [`ResolvedSecretValue`] - one remote value as returned by a backend
//! - [`RenderedPayload`] - the final key/value map written to the store,
//!   tagged with its owner and a content hash
//!
//! Both types zero their byte buffers when dropped, so values never outlive
//! the pass that owns them.

use crate::controller::descriptor::ObjectIdentity;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

/// A remote value resolved to bytes
pub struct ResolvedSecretValue {
    pub remote_key: String,
    pub property: Option<String>,
    value: Zeroizing<Vec<u8>>,
    /// Source revision marker, when the backend versions its data
    pub revision: Option<String>,
}

impl ResolvedSecretValue {
    #[must_use]
    pub fn new(
        remote_key: impl Into<String>,
        property: Option<String>,
        value: Vec<u8>,
        revision: Option<String>,
    ) -> Self {
        Self {
            remote_key: remote_key.into(),
            property,
            value: Zeroizing::new(value),
            revision,
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.value
    }

    /// Move the bytes out, keeping them zeroed-on-drop
    #[must_use]
    pub fn into_bytes(self) -> Zeroizing<Vec<u8>> {
        self.value
    }
}

impl fmt::Debug for ResolvedSecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedSecretValue")
            .field("remote_key", &self.remote_key)
            .field("property", &self.property)
            .field("value", &"***")
            .field("revision", &self.revision)
            .finish()
    }
}

/// Resolved values keyed by local field name, assembled during one pass
pub type ResolvedFields = BTreeMap<String, Zeroizing<Vec<u8>>>;

/// How a payload is written into an existing destination object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace data, type and owner marker
    Replace,
    /// Overlay only the payload's keys, keep everything else
    MergeFields,
}

/// Final key/value map to write into the destination store
pub struct RenderedPayload {
    /// Identity of the descriptor that produced the payload
    pub owner: ObjectIdentity,
    pub secret_type: String,
    pub mode: WriteMode,
    data: BTreeMap<String, Vec<u8>>,
    content_hash: String,
}

impl RenderedPayload {
    /// Build a payload and compute its content hash
    ///
    /// The hash covers the secret type and every key/value pair in key order,
    /// so identical inputs always produce identical hashes.
    #[must_use]
    pub fn new(
        owner: ObjectIdentity,
        secret_type: impl Into<String>,
        mode: WriteMode,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Self {
        let secret_type = secret_type.into();
        let content_hash = content_hash(&secret_type, &data);
        Self {
            owner,
            secret_type,
            mode,
            data,
            content_hash,
        }
    }

    #[must_use]
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    #[must_use]
    pub fn data(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.data
    }

    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.data.keys().map(String::as_str).collect()
    }
}

impl Drop for RenderedPayload {
    fn drop(&mut self) {
        for value in self.data.values_mut() {
            value.zeroize();
        }
    }
}

impl fmt::Debug for RenderedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderedPayload")
            .field("owner", &self.owner)
            .field("secret_type", &self.secret_type)
            .field("mode", &self.mode)
            .field("keys", &self.keys())
            .field("content_hash", &self.content_hash)
            .finish()
    }
}

/// SHA-256 over type and sorted key/value pairs, hex encoded
#[must_use]
pub fn content_hash(secret_type: &str, data: &BTreeMap<String, Vec<u8>>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret_type.as_bytes());
    hasher.update([0u8]);
    for (key, value) in data {
        // Length prefixes keep ("ab","c") and ("a","bc") apart
        hasher.update((key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, Vec<u8>> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_hash_is_stable_and_order_independent() {
        let a = content_hash("Opaque", &data(&[("username", "admin"), ("password", "s3cr3t")]));
        let b = content_hash("Opaque", &data(&[("password", "s3cr3t"), ("username", "admin")]));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_hash_changes_with_content() {
        let base = content_hash("Opaque", &data(&[("password", "s3cr3t")]));
        assert_ne!(base, content_hash("Opaque", &data(&[("password", "other")])));
        assert_ne!(base, content_hash("kubernetes.io/basic-auth", &data(&[("password", "s3cr3t")])));
        assert_ne!(
            content_hash("Opaque", &data(&[("ab", "c")])),
            content_hash("Opaque", &data(&[("a", "bc")]))
        );
    }

    #[test]
    fn test_debug_redacts_values() {
        let value = ResolvedSecretValue::new("db", Some("password".to_string()), b"s3cr3t".to_vec(), None);
        assert!(!format!("{value:?}").contains("s3cr3t"));

        let payload = RenderedPayload::new(
            ObjectIdentity::new("default", "db"),
            "Opaque",
            WriteMode::Replace,
            data(&[("password", "s3cr3t")]),
        );
        let rendered = format!("{payload:?}");
        assert!(!rendered.contains("s3cr3t"));
        assert!(rendered.contains("password"));
    }
}
