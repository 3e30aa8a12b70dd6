// src/cache.rs

use crate::metrics;
use anyhow::{Context, Result};
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Namespaced key/value store on disk, one JSON file per entry under
/// `<root>/<session>/<namespace>/<key>.json`. The report layer uses it to
/// avoid re-fetching details it already holds; nothing in the pool or
/// pipeline depends on it.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn entry_path(&self, session: &str, namespace: &str, key: &str) -> PathBuf {
        self.root
            .join(session)
            .join(namespace)
            .join(format!("{}.json", key))
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        session: &str,
        namespace: &str,
        key: &str,
    ) -> Option<T> {
        let path = self.entry_path(session, namespace, key);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(_) => {
                metrics::increment_cache_miss(namespace);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => {
                metrics::increment_cache_hit(namespace);
                Some(value)
            }
            Err(e) => {
                debug!("discarding corrupt cache entry {}: {}", path.display(), e);
                metrics::increment_cache_miss(namespace);
                None
            }
        }
    }

    pub async fn set<T: Serialize>(
        &self,
        session: &str,
        namespace: &str,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let path = self.entry_path(session, namespace, key);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let raw = serde_json::to_string(value)?;
        tokio::fs::write(&path, raw)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Keys currently present in a namespace; the double-check pass diffs
    /// this against a fresh listing.
    pub async fn keys(&self, session: &str, namespace: &str) -> Vec<String> {
        let dir = self.root.join(session).join(namespace);
        let mut keys = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            return keys;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if let Some(name) = name.to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    keys.push(stem.to_string());
                }
            }
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_roundtrip_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());

        cache
            .set("s", "txs", "sig-1", &json!({ "fee": 5000 }))
            .await
            .unwrap();
        cache
            .set("s", "txs", "sig-2", &json!({ "fee": 7000 }))
            .await
            .unwrap();

        let value: serde_json::Value = cache.get("s", "txs", "sig-1").await.unwrap();
        assert_eq!(value["fee"], 5000);

        let mut keys = cache.keys("s", "txs").await;
        keys.sort();
        assert_eq!(keys, vec!["sig-1", "sig-2"]);
    }

    #[tokio::test]
    async fn missing_entry_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        let value: Option<serde_json::Value> = cache.get("s", "txs", "nope").await;
        assert!(value.is_none());
    }
}
