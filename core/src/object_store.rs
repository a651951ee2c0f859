//! Read-by-key access to the external object store.

use crate::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors returned by an [`ObjectStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreError {
    /// No object exists under the key
    #[error("Object not found: {0}")]
    NotFound(String),

    /// The store could not be reached or returned an I/O error
    #[error("Object store unavailable: {0}")]
    Unavailable(String),
}

/// Identity of one stored object version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Bucket holding the object
    pub bucket: String,
    /// Object key within the bucket
    pub key: String,
    /// Version id, when the store is versioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ObjectRef {
    /// Reference an unversioned object.
    #[must_use]
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            version: None,
        }
    }

    /// Pin the reference to a version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// `bucket/key@version`, or `bucket/key` when unversioned.
    #[must_use]
    pub fn identity(&self) -> String {
        match &self.version {
            Some(version) => format!("{}/{}@{version}", self.bucket, self.key),
            None => format!("{}/{}", self.bucket, self.key),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity())
    }
}

/// Durable blob storage, read by key.
///
/// # Dyn Compatibility
///
/// Returns boxed futures so workers can hold an `Arc<dyn ObjectStore>`.
pub trait ObjectStore: Send + Sync {
    /// Read the full contents of an object.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::NotFound`] if the key does not exist, or
    /// [`ObjectStoreError::Unavailable`] on any transport failure.
    fn get_object<'a>(&'a self, object: &'a ObjectRef)
    -> BoxFuture<'a, Result<Vec<u8>, ObjectStoreError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_includes_version_when_present() {
        let plain = ObjectRef::new("uploads", "upload/data.csv");
        assert_eq!(plain.identity(), "uploads/upload/data.csv");
        assert_eq!(
            plain.with_version("3").identity(),
            "uploads/upload/data.csv@3"
        );
    }
}
