// Jaskier Shared Pattern -- mcp/store
//! Persistence of server configs. Only `ServerConfig` is ever stored;
//! runtime state lives in memory.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::McpError;
use super::types::ServerConfig;

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load_server_configs(&self) -> Result<Vec<ServerConfig>, McpError>;
    async fn save_server_configs(&self, configs: &[ServerConfig]) -> Result<(), McpError>;
}

#[derive(Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    servers: Vec<ServerConfig>,
}

/// JSON file on disk: `{ "servers": [ ... ] }`. A missing file loads as empty.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigStore for JsonFileStore {
    async fn load_server_configs(&self) -> Result<Vec<ServerConfig>, McpError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("MCP: no config file at {}, starting empty", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(McpError::Persistence(format!("read {}: {e}", self.path.display())));
            }
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        let file: ConfigFile = serde_json::from_str(&raw)
            .map_err(|e| McpError::Persistence(format!("parse {}: {e}", self.path.display())))?;
        Ok(file.servers)
    }

    async fn save_server_configs(&self, configs: &[ServerConfig]) -> Result<(), McpError> {
        let body = serde_json::to_string_pretty(&ConfigFile {
            servers: configs.to_vec(),
        })
        .map_err(|e| McpError::Persistence(e.to_string()))?;
        write_atomic(&self.path, &body)
            .await
            .map_err(|e| McpError::Persistence(format!("write {}: {e}", self.path.display())))
    }
}

async fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("json.tmp");
    tokio::fs::write(&temp_path, content).await?;
    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e);
    }
    Ok(())
}

/// In-memory store for tests and ephemeral setups.
#[derive(Default)]
pub struct MemoryStore {
    configs: Mutex<Vec<ServerConfig>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new(configs: Vec<ServerConfig>) -> Self {
        Self {
            configs: Mutex::new(configs),
            saves: Mutex::new(0),
        }
    }

    pub fn snapshot(&self) -> Vec<ServerConfig> {
        self.configs.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Number of completed saves.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn load_server_configs(&self) -> Result<Vec<ServerConfig>, McpError> {
        Ok(self.snapshot())
    }

    async fn save_server_configs(&self, configs: &[ServerConfig]) -> Result<(), McpError> {
        *self.configs.lock().unwrap_or_else(|p| p.into_inner()) = configs.to_vec();
        *self.saves.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nope.json"));
        assert!(store.load_server_configs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn saves_and_reloads_configs() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("mcp_servers.json"));
        let mut cfg = ServerConfig::new("a", "Alpha", "https://alpha.example/sse");
        cfg.headers.insert("Authorization".into(), "Bearer t".into());
        cfg.enabled = false;

        store.save_server_configs(&[cfg.clone()]).await.unwrap();
        assert_eq!(store.load_server_configs().await.unwrap(), vec![cfg]);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_servers.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = JsonFileStore::new(path).load_server_configs().await.unwrap_err();
        assert!(matches!(err, McpError::Persistence(_)));
    }

    #[tokio::test]
    async fn memory_store_counts_saves() {
        let store = MemoryStore::default();
        store
            .save_server_configs(&[ServerConfig::new("x", "X", "loopback://x")])
            .await
            .unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.snapshot().len(), 1);
    }
}
