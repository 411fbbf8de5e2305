use std::num::NonZeroUsize;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use proctor_types::{ServiceId, TestSpec};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("no manifest for service {0}")]
    UnknownService(ServiceId),

    #[error("manifest resolution failed: {0}")]
    Resolution(String),
}

/// Resolves the declared tests of a service at a revision. Implemented by
/// the manifest-parsing collaborator; the core only consumes it.
#[async_trait]
pub trait TestCatalog: Send + Sync + 'static {
    async fn resolve(
        &self,
        service_id: &ServiceId,
        git_ref: &str,
        git_sha: &str,
    ) -> Result<Vec<TestSpec>, CatalogError>;
}

/// Caches catalog snapshots by (service, sha). Sha-keyed entries are
/// immutable, so entries are never invalidated, only evicted.
pub struct CachedCatalog<C> {
    inner: C,
    cache: Mutex<LruCache<(ServiceId, String), Vec<TestSpec>>>,
}

impl<C: TestCatalog> CachedCatalog<C> {
    pub fn new(inner: C, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl<C: TestCatalog> TestCatalog for CachedCatalog<C> {
    async fn resolve(
        &self,
        service_id: &ServiceId,
        git_ref: &str,
        git_sha: &str,
    ) -> Result<Vec<TestSpec>, CatalogError> {
        let key = (service_id.clone(), git_sha.to_string());

        if let Some(specs) = self.cache.lock().unwrap().get(&key) {
            return Ok(specs.clone());
        }

        let specs = self.inner.resolve(service_id, git_ref, git_sha).await?;
        self.cache.lock().unwrap().put(key, specs.clone());
        Ok(specs)
    }
}

/// Catalog with preloaded specs, used by tests and the minimal deployment
#[derive(Default)]
pub struct StaticCatalog {
    specs: DashMap<ServiceId, Vec<TestSpec>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, service_id: ServiceId, specs: Vec<TestSpec>) {
        self.specs.insert(service_id, specs);
    }
}

#[async_trait]
impl TestCatalog for StaticCatalog {
    async fn resolve(
        &self,
        service_id: &ServiceId,
        _git_ref: &str,
        _git_sha: &str,
    ) -> Result<Vec<TestSpec>, CatalogError> {
        self.specs
            .get(service_id)
            .map(|specs| specs.clone())
            .ok_or_else(|| CatalogError::UnknownService(service_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCatalog {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TestCatalog for CountingCatalog {
        async fn resolve(
            &self,
            _service_id: &ServiceId,
            _git_ref: &str,
            _git_sha: &str,
        ) -> Result<Vec<TestSpec>, CatalogError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn sha_keyed_entries_resolve_once() {
        let catalog = CachedCatalog::new(
            CountingCatalog {
                calls: AtomicUsize::new(0),
            },
            8,
        );
        let service = ServiceId::new("svc-1").unwrap();

        catalog.resolve(&service, "main", "sha-1").await.unwrap();
        catalog.resolve(&service, "main", "sha-1").await.unwrap();
        assert_eq!(catalog.inner.calls.load(Ordering::SeqCst), 1);

        // a different revision is a different immutable snapshot
        catalog.resolve(&service, "main", "sha-2").await.unwrap();
        assert_eq!(catalog.inner.calls.load(Ordering::SeqCst), 2);
    }
}
