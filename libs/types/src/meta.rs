//! Object metadata shared by every stored resource.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::KeyError;

/// Finalizer placed on resources that need cleanup before erasure.
pub const FINALIZER: &str = "keel.io";

/// Metadata common to all resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    pub namespace: String,

    /// Assigned by the store; bumped on every write.
    #[serde(default)]
    pub resource_version: u64,

    /// Set by the store when deletion is requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

impl ObjectMeta {
    /// Create metadata for a new object.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Store key for this object.
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.namespace, &self.name)
    }

    /// Lifecycle state derived from the deletion timestamp and finalizers.
    pub fn lifecycle(&self) -> Lifecycle {
        match (&self.deletion_timestamp, self.finalizers.is_empty()) {
            (None, _) => Lifecycle::Active,
            (Some(_), false) => Lifecycle::PendingDeletion,
            (Some(_), true) => Lifecycle::Erased,
        }
    }

    /// Returns true if the given finalizer is present.
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }
}

/// Two-phase deletion lifecycle.
///
/// The store never erases a `PendingDeletion` resource while its finalizer
/// list is non-empty. Once the last finalizer is gone the resource is
/// `Erased`: the store drops it, and later reads return NotFound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    PendingDeletion,
    Erased,
}

/// `namespace/name` key identifying a resource in the store and the queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ResourceKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new("", *name)),
            [namespace, name] if !name.is_empty() => Ok(Self::new(*namespace, *name)),
            _ => Err(KeyError::Malformed(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_parse() {
        let key: ResourceKey = "keel-system/orphan-1".parse().unwrap();
        assert_eq!(key.namespace, "keel-system");
        assert_eq!(key.name, "orphan-1");
        assert_eq!(key.to_string(), "keel-system/orphan-1");

        let bare: ResourceKey = "orphan-1".parse().unwrap();
        assert_eq!(bare.namespace, "");
        assert_eq!(bare.to_string(), "orphan-1");
    }

    #[test]
    fn test_key_parse_rejects_malformed() {
        assert!("a/b/c".parse::<ResourceKey>().is_err());
        assert!("ns/".parse::<ResourceKey>().is_err());
        assert!("".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn test_lifecycle() {
        let mut meta = ObjectMeta::new("ns", "o");
        assert_eq!(meta.lifecycle(), Lifecycle::Active);

        meta.deletion_timestamp = Some(Utc::now());
        assert_eq!(meta.lifecycle(), Lifecycle::Erased);

        meta.finalizers.push(FINALIZER.to_string());
        assert_eq!(meta.lifecycle(), Lifecycle::PendingDeletion);

        meta.deletion_timestamp = None;
        assert_eq!(meta.lifecycle(), Lifecycle::Active);
    }
}
