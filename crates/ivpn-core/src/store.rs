//! Persisted engine configs
//!
//! The engine reads its config from disk, and the last file of each kind is
//! left in place for post-mortem inspection. Each write overwrites the
//! previous one.

use crate::document::ConfigDocument;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the live session config
pub const LIVE_CONFIG: &str = "config.json";

/// File name of the test session config
pub const TEST_CONFIG: &str = "test_config.json";

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where engine configs are written
#[derive(Debug, Clone)]
pub struct ConfigStore {
    data_dir: PathBuf,
    cache_dir: PathBuf,
}

impl ConfigStore {
    pub fn new(data_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            cache_dir: cache_dir.into(),
        }
    }

    /// Path of the live session config
    pub fn live_path(&self) -> PathBuf {
        self.data_dir.join(LIVE_CONFIG)
    }

    /// Path of the test session config
    pub fn test_path(&self) -> PathBuf {
        self.cache_dir.join(TEST_CONFIG)
    }

    /// Persist the live config, returning its path
    pub async fn write_live(&self, doc: &ConfigDocument) -> Result<PathBuf, StoreError> {
        let path = self.live_path();
        write(&path, &doc.to_json()).await?;
        Ok(path)
    }

    /// Persist a test config, returning its path
    pub async fn write_test(&self, doc: &ConfigDocument) -> Result<PathBuf, StoreError> {
        let path = self.test_path();
        write(&path, &doc.to_json()).await?;
        Ok(path)
    }
}

async fn write(path: &Path, content: &str) -> Result<(), StoreError> {
    let wrap = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(wrap)?;
    }
    tokio::fs::write(path, content).await.map_err(wrap)?;

    debug!("Wrote {} ({} bytes)", path.display(), content.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_and_overwrite() {
        let root = std::env::temp_dir().join(format!("ivpn-store-{}", std::process::id()));
        let store = ConfigStore::new(root.join("data"), root.join("cache"));

        let first = ConfigDocument::parse(r#"{"outbounds":[{"type":"direct"}]}"#).unwrap();
        let path = store.write_live(&first).await.unwrap();
        assert_eq!(path, root.join("data").join(LIVE_CONFIG));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first.to_json());

        let second = ConfigDocument::parse(r#"{"outbounds":[]}"#).unwrap();
        store.write_live(&second).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), second.to_json());

        let test_path = store.write_test(&second).await.unwrap();
        assert_eq!(test_path, root.join("cache").join(TEST_CONFIG));

        std::fs::remove_dir_all(root).unwrap();
    }
}
