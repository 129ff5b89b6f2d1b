//! In-memory cache storage for embedders and tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_graph::Digest;

use crate::error::{Result, SolverError};
use crate::sharedref::{RefHandle, SharedRef};
use crate::storage::{CacheInfoLink, CacheKeyStorage, CacheResult, CacheResultStorage, Remote};

#[derive(Default)]
struct Inner {
    results: HashMap<Digest, Vec<CacheResult>>,
    links: HashMap<(Digest, CacheInfoLink), Vec<Digest>>,
    backlinks: HashMap<Digest, Vec<(Digest, CacheInfoLink)>>,
    ids_by_result: HashMap<String, HashSet<Digest>>,
    stored: HashMap<String, StoredResult>,
}

struct StoredResult {
    handle: RefHandle,
    created_at: DateTime<Utc>,
}

/// In-memory implementation of both cache storage contracts.
///
/// Results are held as live references (the store keeps one share per saved
/// result); nothing survives the process, so `load_remote` always reports
/// [`SolverError::NotFound`].
#[derive(Default)]
pub struct MemoryCacheStorage {
    inner: Mutex<Inner>,
}

impl MemoryCacheStorage {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CacheKeyStorage for MemoryCacheStorage {
    async fn exists(&self, id: &Digest) -> bool {
        let inner = self.lock();
        inner.results.contains_key(id) || inner.backlinks.contains_key(id)
    }

    async fn walk_results(&self, id: &Digest) -> Result<Vec<CacheResult>> {
        Ok(self.lock().results.get(id).cloned().unwrap_or_default())
    }

    async fn walk_links(&self, id: &Digest, link: &CacheInfoLink) -> Result<Vec<Digest>> {
        Ok(self
            .lock()
            .links
            .get(&(*id, link.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn walk_backlinks(&self, id: &Digest) -> Result<Vec<(Digest, CacheInfoLink)>> {
        Ok(self.lock().backlinks.get(id).cloned().unwrap_or_default())
    }

    async fn walk_ids_by_result(&self, result_id: &str) -> Result<Vec<Digest>> {
        Ok(self
            .lock()
            .ids_by_result
            .get(result_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn add_link(&self, id: &Digest, link: CacheInfoLink, target: &Digest) -> Result<()> {
        let mut inner = self.lock();
        inner
            .links
            .entry((*id, link.clone()))
            .or_default()
            .push(*target);
        inner.backlinks.entry(*target).or_default().push((*id, link));
        Ok(())
    }

    async fn add_result(&self, id: &Digest, result: CacheResult) -> Result<()> {
        let mut inner = self.lock();
        inner.ids_by_result.entry(result.id.clone()).or_default().insert(*id);
        let entries = inner.results.entry(*id).or_default();
        if !entries.iter().any(|r| r.id == result.id) {
            entries.push(result);
        }
        Ok(())
    }

    async fn has_link(&self, id: &Digest, link: &CacheInfoLink, target: &Digest) -> bool {
        self.lock()
            .links
            .get(&(*id, link.clone()))
            .is_some_and(|targets| targets.contains(target))
    }

    async fn release(&self, result_id: &str) -> Result<()> {
        let mut inner = self.lock();
        let stored = inner
            .stored
            .remove(result_id)
            .ok_or_else(|| SolverError::NotFound(format!("result {result_id}")))?;
        inner.ids_by_result.remove(result_id);
        for entries in inner.results.values_mut() {
            entries.retain(|r| r.id != result_id);
        }
        drop(inner);
        stored.handle.release()?;
        Ok(())
    }
}

#[async_trait]
impl CacheResultStorage for MemoryCacheStorage {
    async fn save(&self, result: &RefHandle) -> Result<CacheResult> {
        let handle = result.share()?;
        let id = handle.id().to_string();
        let mut inner = self.lock();
        // Saving the same artifact twice keeps the first entry (and drops the
        // extra share taken above).
        let stored = inner.stored.entry(id.clone()).or_insert(StoredResult {
            handle,
            created_at: Utc::now(),
        });
        Ok(CacheResult {
            id,
            created_at: stored.created_at,
        })
    }

    async fn load(&self, result: &CacheResult) -> Result<SharedRef> {
        let inner = self.lock();
        let stored = inner
            .stored
            .get(&result.id)
            .ok_or_else(|| SolverError::NotFound(format!("result {}", result.id)))?;
        let handle = stored
            .handle
            .share()
            .map_err(|_| SolverError::NotFound(format!("released result {}", result.id)))?;
        drop(inner);
        Ok(SharedRef::new(handle.into_origin()))
    }

    async fn load_remote(&self, result: &CacheResult) -> Result<Remote> {
        Err(SolverError::NotFound(format!(
            "result {} is process-local and has no remote form",
            result.id
        )))
    }

    async fn exists(&self, id: &str) -> bool {
        self.lock().stored.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::sharedref::ImmutableRef;

    #[derive(Debug)]
    struct FakeRef {
        name: String,
        releases: Arc<AtomicUsize>,
    }

    impl ImmutableRef for FakeRef {
        fn id(&self) -> &str {
            &self.name
        }

        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn shared(name: &str) -> (SharedRef, Arc<AtomicUsize>) {
        let releases = Arc::new(AtomicUsize::new(0));
        (
            SharedRef::new(Box::new(FakeRef {
                name: name.to_string(),
                releases: releases.clone(),
            })),
            releases,
        )
    }

    fn link(digest: Digest, input: usize, output: usize) -> CacheInfoLink {
        CacheInfoLink {
            digest,
            input,
            output,
            selector: String::new(),
        }
    }

    #[tokio::test]
    async fn save_then_load_is_identity() {
        let store = MemoryCacheStorage::new();
        let (origin, releases) = shared("artifact-1");
        let handle = origin.share().unwrap();

        let record = store.save(&handle).await.unwrap();
        assert!(CacheResultStorage::exists(&store, &record.id).await);

        let loaded = store.load(&record).await.unwrap();
        assert_eq!(loaded.id(), "artifact-1");

        // The store and the loaded wrapper both hold shares; nothing has
        // been released yet.
        drop(loaded);
        handle.release().unwrap();
        drop(origin);
        assert_eq!(releases.load(Ordering::SeqCst), 0);

        store.release(&record.id).await.unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(matches!(
            store.load(&record).await,
            Err(SolverError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn results_walk_and_release() {
        let store = MemoryCacheStorage::new();
        let (origin, _) = shared("artifact-2");
        let handle = origin.share().unwrap();
        let record = store.save(&handle).await.unwrap();

        let ck = Digest::from_bytes(b"some-key");
        store.add_result(&ck, record.clone()).await.unwrap();
        // Duplicate entries collapse.
        store.add_result(&ck, record.clone()).await.unwrap();
        assert_eq!(store.walk_results(&ck).await.unwrap().len(), 1);
        assert_eq!(
            store.walk_ids_by_result(&record.id).await.unwrap(),
            vec![ck]
        );
        assert!(CacheKeyStorage::exists(&store, &ck).await);

        store.release(&record.id).await.unwrap();
        assert!(store.walk_results(&ck).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn links_walk_both_directions() {
        let store = MemoryCacheStorage::new();
        let parent = Digest::from_bytes(b"parent-key");
        let child = Digest::from_bytes(b"child-key");
        let vertex = Digest::from_bytes(b"vertex");
        let l = link(vertex, 0, 0);

        assert!(!store.has_link(&parent, &l, &child).await);
        store.add_link(&parent, l.clone(), &child).await.unwrap();
        assert!(store.has_link(&parent, &l, &child).await);

        assert_eq!(store.walk_links(&parent, &l).await.unwrap(), vec![child]);
        assert_eq!(
            store.walk_backlinks(&child).await.unwrap(),
            vec![(parent, l)]
        );
    }

    #[tokio::test]
    async fn missing_results_are_not_found() {
        let store = MemoryCacheStorage::new();
        let record = CacheResult {
            id: "ghost".to_string(),
            created_at: Utc::now(),
        };
        assert!(matches!(
            store.load(&record).await,
            Err(SolverError::NotFound(_))
        ));
        assert!(matches!(
            store.load_remote(&record).await,
            Err(SolverError::NotFound(_))
        ));
        assert!(matches!(
            store.release("ghost").await,
            Err(SolverError::NotFound(_))
        ));
    }
}
