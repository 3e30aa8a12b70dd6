// src/session_store.rs

use crate::settings::EndpointConfig;
use anyhow::{Context, Result};
use log::{debug, info};
use std::path::{Path, PathBuf};

const POOL_FILENAME: &str = "rpc-pool.json";

/// Optional persistence for the probed endpoint list, so a restarted process
/// can skip re-probing. Only the endpoint identities are stored; runtime
/// health/concurrency/metrics counters are always rebuilt from zero.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn pool_path(&self, session: &str) -> PathBuf {
        self.root.join(session).join(POOL_FILENAME)
    }

    /// Returns the persisted list for a session, or `None` when absent or
    /// unreadable (a corrupt file just forces a fresh probe).
    pub async fn load(&self, session: &str) -> Option<Vec<EndpointConfig>> {
        let path = self.pool_path(session);
        let raw = tokio::fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str::<Vec<EndpointConfig>>(&raw) {
            Ok(endpoints) if !endpoints.is_empty() => {
                info!(
                    "loaded {} endpoints from {}",
                    endpoints.len(),
                    path.display()
                );
                Some(endpoints)
            }
            Ok(_) => None,
            Err(e) => {
                debug!("ignoring corrupt pool file {}: {}", path.display(), e);
                None
            }
        }
    }

    pub async fn save(&self, session: &str, endpoints: &[EndpointConfig]) -> Result<()> {
        let path = self.pool_path(session);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let raw = serde_json::to_string_pretty(endpoints)?;
        tokio::fs::write(&path, raw)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!("saved {} endpoints to {}", endpoints.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let endpoints = vec![
            EndpointConfig::new("a", "http://rpc-a"),
            EndpointConfig::new("b", "http://rpc-b"),
        ];

        store.save("profile-1", &endpoints).await.unwrap();
        let loaded = store.load("profile-1").await.unwrap();
        assert_eq!(loaded, endpoints);
    }

    #[tokio::test]
    async fn missing_session_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        assert!(store.load("nope").await.is_none());
    }

    #[tokio::test]
    async fn corrupt_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let path = dir.path().join("p").join(POOL_FILENAME);
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, "not json").await.unwrap();
        assert!(store.load("p").await.is_none());
    }
}
