//! Resource model consumed by the engine.
//!
//! The engine is resource-kind agnostic: anything implementing [`Resource`]
//! can be cached, translated into keys and reconciled. [`Object`] is a
//! generic implementation with free-form JSON spec, used by the file source
//! and throughout the tests.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::KeyError;
use crate::key::ObjectKey;

/// A tracked resource snapshot.
pub trait Resource: Clone + Send + Sync + 'static {
    /// Stable identity of the resource.
    fn key(&self) -> Result<ObjectKey, KeyError>;

    /// Opaque change-detection token. Never compared across keys.
    fn resource_version(&self) -> Option<&str>;
}

/// Object metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// A generic resource: metadata plus an arbitrary JSON spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: serde_json::Value,
}

impl Object {
    /// Create a namespaced object with the given version and spec.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        resource_version: impl Into<String>,
        spec: serde_json::Value,
    ) -> Self {
        Self {
            metadata: ObjectMeta {
                namespace: Some(namespace.into()),
                name: name.into(),
                resource_version: Some(resource_version.into()),
                labels: BTreeMap::new(),
            },
            spec,
        }
    }

    /// Fill in a missing resource version from the spec hash.
    pub fn with_derived_version(mut self) -> Self {
        if self.metadata.resource_version.is_none() {
            self.metadata.resource_version = Some(SpecHash::from_json(&self.spec).to_string());
        }
        self
    }
}

impl Resource for Object {
    fn key(&self) -> Result<ObjectKey, KeyError> {
        ObjectKey::from_meta(self.metadata.namespace.as_deref(), &self.metadata.name)
    }

    fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }
}

/// A spec hash for deterministic comparison.
///
/// Used as a resource version by sources that do not provide one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let digest = Sha256::digest(canonical.as_bytes());
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpecHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical JSON: object keys sorted, no insignificant whitespace.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", quote(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => quote(s),
        other => other.to_string(),
    }
}

fn quote(s: &str) -> String {
    // serde_json escapes strings the same way regardless of map ordering
    serde_json::Value::String(s.to_string()).to_string()
}
