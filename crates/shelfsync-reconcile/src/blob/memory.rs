use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{BlobStore, validate_key};
use crate::error::{ReconcileError, Result};

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// In-process blob store for tests and dry runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    state: Mutex<MemoryBlobState>,
}

#[derive(Default)]
struct MemoryBlobState {
    objects: HashMap<(String, String), StoredBlob>,
    puts: usize,
    removes: usize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryBlobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.state()
            .objects
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredBlob> {
        self.state()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn put_count(&self) -> usize {
        self.state().puts
    }

    pub fn remove_count(&self) -> usize {
        self.state().removes
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<()> {
        validate_key(key)?;
        let mut state = self.state();
        let id = (bucket.to_string(), key.to_string());
        if !upsert && state.objects.contains_key(&id) {
            return Err(ReconcileError::Blob(format!("object exists: {bucket}/{key}")));
        }
        state.objects.insert(
            id,
            StoredBlob {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        state.puts += 1;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.object(bucket, key)
            .map(|blob| blob.bytes)
            .ok_or_else(|| ReconcileError::Blob(format!("object not found: {bucket}/{key}")))
    }

    async fn remove(&self, bucket: &str, key: &str) -> Result<()> {
        let mut state = self.state();
        state.objects.remove(&(bucket.to_string(), key.to_string()));
        state.removes += 1;
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("memory://{bucket}/{key}")
    }
}
