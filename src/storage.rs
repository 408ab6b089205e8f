//! JSON persistence for the two registry maps.
//!
//! Both files live in the host data directory and are written atomically
//! (temp file + rename). Absent files load as empty maps.

use crate::types::{LlmProvider, ToolProvider};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

const LLM_PROVIDERS_FILE: &str = "llm_providers.json";
const TOOL_PROVIDERS_FILE: &str = "mcp_servers.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode records: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    pub fn new(data_dir: Option<PathBuf>) -> Result<Self, StorageError> {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        fs::create_dir_all(&data_dir).map_err(|source| StorageError::Io {
            path: data_dir.clone(),
            source,
        })?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn save_llm_providers(
        &self,
        providers: &HashMap<String, LlmProvider>,
    ) -> Result<(), StorageError> {
        self.write_json(LLM_PROVIDERS_FILE, providers)
    }

    pub fn load_llm_providers(&self) -> Result<HashMap<String, LlmProvider>, StorageError> {
        self.read_json(LLM_PROVIDERS_FILE)
    }

    pub fn save_tool_providers(
        &self,
        providers: &HashMap<String, ToolProvider>,
    ) -> Result<(), StorageError> {
        self.write_json(TOOL_PROVIDERS_FILE, providers)
    }

    pub fn load_tool_providers(&self) -> Result<HashMap<String, ToolProvider>, StorageError> {
        self.read_json(TOOL_PROVIDERS_FILE)
    }

    fn write_json<T: serde::Serialize>(&self, file: &str, value: &T) -> Result<(), StorageError> {
        let encoded =
            serde_json::to_vec_pretty(value).map_err(|source| StorageError::Encode { source })?;
        let path = self.data_dir.join(file);
        let tmp = self.data_dir.join(format!("{file}.tmp"));
        fs::write(&tmp, &encoded).map_err(|source| StorageError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "Persisted registry state");
        Ok(())
    }

    fn read_json<T: serde::de::DeserializeOwned + Default>(
        &self,
        file: &str,
    ) -> Result<T, StorageError> {
        let path = self.data_dir.join(file);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(source) if source.kind() == io::ErrorKind::NotFound => {
                return Ok(T::default());
            }
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        serde_json::from_slice(&content).map_err(|source| StorageError::Decode { path, source })
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".opsrelay")
        .join("data")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProviderKind, Transport};

    #[test]
    fn absent_files_load_as_empty_maps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(Some(dir.path().to_path_buf())).expect("storage");

        assert!(storage.load_llm_providers().expect("load").is_empty());
        assert!(storage.load_tool_providers().expect("load").is_empty());
    }

    #[test]
    fn llm_providers_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(Some(dir.path().to_path_buf())).expect("storage");

        let mut provider = LlmProvider::new("main", ProviderKind::OpenAi, "gpt-4");
        provider.id = "p1".to_string();
        provider.api_key = "sk-test".to_string();
        provider.is_active = true;
        let mut providers = HashMap::new();
        providers.insert(provider.id.clone(), provider);

        storage.save_llm_providers(&providers).expect("save");
        let loaded = storage.load_llm_providers().expect("load");
        assert_eq!(providers, loaded);
    }

    #[test]
    fn tool_providers_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(Some(dir.path().to_path_buf())).expect("storage");

        let mut provider = ToolProvider::new("Desktop Commander", "npx desktop-commander", Transport::Stdio);
        provider.id = "s1".to_string();
        let mut providers = HashMap::new();
        providers.insert(provider.id.clone(), provider);

        storage.save_tool_providers(&providers).expect("save");
        let loaded = storage.load_tool_providers().expect("load");
        assert_eq!(providers, loaded);
    }
}
