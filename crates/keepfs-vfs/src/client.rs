//! Collection metadata client, used by `sync` to persist manifests.

use std::collections::VecDeque;

use keepfs_cas::portable_data_hash;
use parking_lot::Mutex;
use thiserror::Error;

/// Errors from the collection metadata service.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The collection identifier is unknown to the service.
    #[error("collection not found: {0}")]
    NotFound(String),

    /// Any other service failure, passed through verbatim.
    #[error("{0}")]
    Api(String),
}

/// Persists manifest text against a collection identifier.
pub trait CollectionClient: Send + Sync {
    /// Store `manifest_text` as the new content of collection `uuid`.
    ///
    /// Returns the portable data hash the service recorded.
    fn update_manifest(&self, uuid: &str, manifest_text: &str) -> Result<String, ClientError>;
}

/// A manifest update recorded by [`MemoryCollectionClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestUpdate {
    pub uuid: String,
    pub manifest_text: String,
}

/// Client that records updates in memory.
#[derive(Debug, Default)]
pub struct MemoryCollectionClient {
    updates: Mutex<Vec<ManifestUpdate>>,
    failures: Mutex<VecDeque<ClientError>>,
}

impl MemoryCollectionClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call fail with `err`.
    pub fn fail_next(&self, err: ClientError) {
        self.failures.lock().push_back(err);
    }

    /// Every successful update, oldest first.
    pub fn updates(&self) -> Vec<ManifestUpdate> {
        self.updates.lock().clone()
    }

    /// Manifest text of the most recent successful update.
    pub fn last_manifest(&self) -> Option<String> {
        self.updates.lock().last().map(|u| u.manifest_text.clone())
    }
}

impl CollectionClient for MemoryCollectionClient {
    fn update_manifest(&self, uuid: &str, manifest_text: &str) -> Result<String, ClientError> {
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        self.updates.lock().push(ManifestUpdate {
            uuid: uuid.to_owned(),
            manifest_text: manifest_text.to_owned(),
        });
        Ok(portable_data_hash(manifest_text))
    }
}
