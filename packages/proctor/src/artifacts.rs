use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArtifactStoreError {
    #[error("artifact storage: {0}")]
    Storage(String),

    #[error("artifact {0} exceeds the allowed size")]
    TooLarge(String),
}

/// Object storage for artifact bytes. The core stores only references;
/// large payloads are uploaded by agents through a presigned url.
#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    /// Store bytes under `key`, returning the storage key to reference
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, ArtifactStoreError>;

    /// A url agents can upload to directly, bypassing the session
    async fn presigned_upload(
        &self,
        key: &str,
        max_bytes: u64,
        ttl_secs: u64,
    ) -> Result<String, ArtifactStoreError>;
}

/// In-memory store for tests and the minimal single-process deployment
#[derive(Default)]
pub struct MemoryArtifactStore {
    objects: DashMap<String, (Vec<u8>, String)>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|entry| entry.0.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, ArtifactStoreError> {
        self.objects
            .insert(key.to_string(), (bytes.to_vec(), content_type.to_string()));
        Ok(key.to_string())
    }

    async fn presigned_upload(
        &self,
        key: &str,
        _max_bytes: u64,
        _ttl_secs: u64,
    ) -> Result<String, ArtifactStoreError> {
        Ok(format!("memory://{}", key))
    }
}
