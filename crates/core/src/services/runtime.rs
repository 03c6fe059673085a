//! Runtime version registry.
//!
//! One instance per process, shared through an `Arc`. It caches every
//! spec version seen on chain together with its decoded module list and
//! raw metadata, and tracks the highest spec version observed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::error::{IndexerError, IndexerResult};
use crate::models::{BlockHash, RuntimeMetadata, RuntimeVersion};
use crate::ports::{BlockDecoder, BlockStore, ChainRpc, RuntimeVersionInfo};

pub struct RuntimeRegistry {
    chain: Arc<dyn ChainRpc>,
    store: Arc<dyn BlockStore>,
    decoder: Arc<dyn BlockDecoder>,
    versions: RwLock<BTreeMap<u32, RuntimeVersion>>,
    metadata: RwLock<HashMap<u32, Arc<str>>>,
    /// Highest spec version observed, 0 when none.
    current: AtomicU32,
}

impl RuntimeRegistry {
    /// Build the registry from the persisted runtime versions.
    #[instrument(skip_all)]
    pub async fn load(
        chain: Arc<dyn ChainRpc>,
        store: Arc<dyn BlockStore>,
        decoder: Arc<dyn BlockDecoder>,
    ) -> IndexerResult<Self> {
        let persisted = store.runtime_versions().await?;

        let mut versions = BTreeMap::new();
        let mut metadata = HashMap::new();
        for mut version in persisted {
            if let Some(raw) = version.raw_metadata.take() {
                metadata.insert(version.spec_version, Arc::<str>::from(raw));
            }
            versions.insert(version.spec_version, version);
        }

        let current = versions.keys().next_back().copied().unwrap_or(0);
        debug!(
            versions = versions.len(),
            current, "Runtime registry loaded"
        );

        Ok(Self {
            chain,
            store,
            decoder,
            versions: RwLock::new(versions),
            metadata: RwLock::new(metadata),
            current: AtomicU32::new(current),
        })
    }

    /// Highest spec version observed so far.
    pub fn current_spec(&self) -> Option<u32> {
        match self.current.load(Ordering::Acquire) {
            0 => None,
            spec => Some(spec),
        }
    }

    pub async fn known_versions(&self) -> Vec<u32> {
        self.versions.read().await.keys().copied().collect()
    }

    /// Record a spec version reported by the node.
    ///
    /// Returns `true` when the version was not known before.
    pub async fn register(&self, info: &RuntimeVersionInfo) -> IndexerResult<bool> {
        self.current.fetch_max(info.spec_version, Ordering::AcqRel);

        if self.versions.read().await.contains_key(&info.spec_version) {
            return Ok(false);
        }

        let version = RuntimeVersion {
            spec_version: info.spec_version,
            impl_name: info.impl_name.clone(),
            modules: Vec::new(),
            raw_metadata: None,
        };
        self.store.insert_runtime_version(&version).await?;

        let mut versions = self.versions.write().await;
        let inserted = versions.insert(info.spec_version, version).is_none();
        if inserted {
            info!(
                spec_version = info.spec_version,
                impl_name = %info.impl_name,
                "🧬 New runtime version"
            );
        }
        Ok(inserted)
    }

    /// Spec version to decode `block_number` with.
    ///
    /// Uses the node's reply when there is one. Otherwise falls back to the
    /// spec of the nearest persisted block at or below `block_number`, then to
    /// the current spec.
    pub async fn resolve_spec(
        &self,
        block_number: u64,
        reply: Option<RuntimeVersionInfo>,
    ) -> IndexerResult<u32> {
        if let Some(info) = reply {
            self.register(&info).await?;
            return Ok(info.spec_version);
        }

        if let Some(spec) = self.store.nearest_spec_version(block_number).await? {
            debug!(block = block_number, spec, "Runtime version from nearest block");
            return Ok(spec);
        }

        match self.current_spec() {
            Some(spec) => {
                debug!(block = block_number, spec, "Runtime version from current spec");
                Ok(spec)
            }
            None => Err(IndexerError::NoRuntimeMetadata(block_number)),
        }
    }

    /// Metadata for a spec version, fetched at `at` on first use.
    pub async fn metadata_for(
        &self,
        spec_version: u32,
        at: &BlockHash,
    ) -> IndexerResult<RuntimeMetadata> {
        if let Some(raw) = self.metadata.read().await.get(&spec_version) {
            return Ok(RuntimeMetadata {
                spec_version,
                raw: raw.clone(),
            });
        }

        let raw: Arc<str> = Arc::from(self.chain.metadata(at).await?);
        let metadata = RuntimeMetadata {
            spec_version,
            raw: raw.clone(),
        };

        let modules = match self.decoder.module_names(&metadata) {
            Ok(modules) => modules,
            Err(e) => {
                warn!(spec_version, error = %e, "⚠️  Could not list runtime modules");
                Vec::new()
            }
        };

        let known = self.versions.read().await.contains_key(&spec_version);
        if !known {
            // Only reached through the nearest-block fallback.
            let version = RuntimeVersion {
                spec_version,
                impl_name: String::new(),
                modules: Vec::new(),
                raw_metadata: None,
            };
            self.store.insert_runtime_version(&version).await?;
            self.versions.write().await.insert(spec_version, version);
        }

        self.store
            .set_runtime_metadata(spec_version, &raw, &modules)
            .await?;

        if let Some(version) = self.versions.write().await.get_mut(&spec_version) {
            version.modules = modules;
        }
        self.metadata.write().await.insert(spec_version, raw);
        debug!(spec_version, "Runtime metadata cached");

        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{MemoryBlockStore, ScriptedChain, StubDecoder};

    fn info(spec: u32) -> RuntimeVersionInfo {
        RuntimeVersionInfo {
            spec_version: spec,
            impl_name: "node".into(),
        }
    }

    async fn registry(store: Arc<MemoryBlockStore>) -> RuntimeRegistry {
        RuntimeRegistry::load(
            Arc::new(ScriptedChain::new()),
            store,
            Arc::new(StubDecoder),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn register_tracks_highest_spec() {
        let store = Arc::new(MemoryBlockStore::default());
        let registry = registry(store.clone()).await;

        assert!(registry.register(&info(20)).await.unwrap());
        assert!(registry.register(&info(10)).await.unwrap());
        assert!(!registry.register(&info(20)).await.unwrap());

        assert_eq!(registry.current_spec(), Some(20));
        assert_eq!(store.runtime_versions().await.unwrap().len(), 2);
    }

    // Test critique: sans réponse du noeud et sans historique, pas de métadonnées
    #[tokio::test]
    async fn resolve_without_any_bound_fails() {
        let registry = registry(Arc::new(MemoryBlockStore::default())).await;
        let err = registry.resolve_spec(7, None).await.unwrap_err();
        assert!(matches!(err, IndexerError::NoRuntimeMetadata(7)));
    }

    #[tokio::test]
    async fn resolve_falls_back_to_current_spec() {
        let registry = registry(Arc::new(MemoryBlockStore::default())).await;
        registry.register(&info(42)).await.unwrap();
        assert_eq!(registry.resolve_spec(7, None).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn metadata_is_fetched_once_and_backfilled() {
        let store = Arc::new(MemoryBlockStore::default());
        let registry = registry(store.clone()).await;
        registry.register(&info(3)).await.unwrap();

        let at = BlockHash([1; 32]);
        let first = registry.metadata_for(3, &at).await.unwrap();
        let second = registry.metadata_for(3, &at).await.unwrap();
        assert_eq!(first.raw, second.raw);

        let persisted = store.runtime_versions().await.unwrap();
        assert!(persisted[0].raw_metadata.is_some());
        assert!(!persisted[0].modules.is_empty());
    }
}
