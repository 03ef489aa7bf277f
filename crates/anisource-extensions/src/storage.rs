//! On-disk layout and persisted manager state.
//!
//! ```text
//! <data>/extensions/config.json
//! <data>/extensions/scripts/<id>.lua
//! <data>/extensions/icons/<id>.png
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::ExtensionError;
use crate::types::Repository;

pub const SCRIPT_EXTENSION: &str = "lua";

/// State that survives restarts. Everything else is rebuilt from scripts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedConfig {
    #[serde(default)]
    pub repositories: Vec<Repository>,
    /// Ids of installed extensions that load disabled.
    #[serde(default)]
    pub disabled: Vec<String>,
}

/// Reject ids that cannot be used as a file stem.
pub fn validate_extension_id(id: &str) -> Result<(), ExtensionError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid {
        return Err(ExtensionError::Validation(format!(
            "invalid extension id '{id}': use letters, digits, '.', '_' or '-'"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ExtensionStorage {
    root: PathBuf,
}

impl ExtensionStorage {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("extensions"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join("scripts")
    }

    pub fn icons_dir(&self) -> PathBuf {
        self.root.join("icons")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn script_path(&self, id: &str) -> PathBuf {
        self.scripts_dir().join(format!("{id}.{SCRIPT_EXTENSION}"))
    }

    pub fn icon_path(&self, id: &str) -> PathBuf {
        self.icons_dir().join(format!("{id}.png"))
    }

    pub async fn ensure_dirs(&self) -> Result<(), ExtensionError> {
        tokio::fs::create_dir_all(self.scripts_dir()).await?;
        tokio::fs::create_dir_all(self.icons_dir()).await?;
        Ok(())
    }

    /// Load `config.json`. A missing file yields the default config.
    pub async fn load_config(&self) -> Result<PersistedConfig, ExtensionError> {
        match tokio::fs::read(self.config_path()).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedConfig::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `config.json` through a temporary file and an atomic rename.
    pub async fn save_config(&self, config: &PersistedConfig) -> Result<(), ExtensionError> {
        let json = serde_json::to_vec_pretty(config)?;
        let root = self.root.clone();
        let path = self.config_path();
        tokio::task::spawn_blocking(move || -> Result<(), ExtensionError> {
            let mut temp = NamedTempFile::new_in(&root)?;
            temp.write_all(&json)?;
            temp.as_file().sync_all()?;
            temp.persist(&path).map_err(|e| ExtensionError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| ExtensionError::Runtime(format!("config writer failed: {e}")))?
    }

    /// `*.lua` files in the scripts directory, sorted by name.
    pub async fn list_scripts(&self) -> Result<Vec<PathBuf>, ExtensionError> {
        let mut scripts = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.scripts_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(scripts),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_script = path.extension().and_then(|e| e.to_str()) == Some(SCRIPT_EXTENSION);
            if is_script && entry.file_type().await?.is_file() {
                scripts.push(path);
            }
        }
        scripts.sort();
        Ok(scripts)
    }

    /// Remove a file, treating "already gone" as success.
    pub async fn remove_file(path: &Path) -> Result<(), ExtensionError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// File stem used as the registry key for scripts that failed to load.
pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let storage = ExtensionStorage::new(Path::new("/data"));
        assert_eq!(storage.config_path(), PathBuf::from("/data/extensions/config.json"));
        assert_eq!(
            storage.script_path("com.example.fox"),
            PathBuf::from("/data/extensions/scripts/com.example.fox.lua")
        );
        assert_eq!(
            storage.icon_path("com.example.fox"),
            PathBuf::from("/data/extensions/icons/com.example.fox.png")
        );
    }

    #[test]
    fn test_validate_extension_id() {
        assert!(validate_extension_id("com.example.fox").is_ok());
        assert!(validate_extension_id("my-ext_2").is_ok());
        assert!(validate_extension_id("").is_err());
        assert!(validate_extension_id("../escape").is_err());
        assert!(validate_extension_id("a/b").is_err());
        assert!(validate_extension_id(".hidden").is_err());
        assert!(validate_extension_id("space id").is_err());
    }

    #[tokio::test]
    async fn test_missing_config_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ExtensionStorage::new(dir.path());
        let config = storage.load_config().await.unwrap();
        assert_eq!(config, PersistedConfig::default());
    }

    #[tokio::test]
    async fn test_config_roundtrip_and_wire_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ExtensionStorage::new(dir.path());
        storage.ensure_dirs().await.unwrap();

        let config = PersistedConfig {
            repositories: vec![Repository {
                name: "Official".into(),
                url: "https://repo.example/index.json".into(),
                official: true,
                last_checked: None,
            }],
            disabled: vec!["com.example.fox".into()],
        };
        storage.save_config(&config).await.unwrap();
        assert_eq!(storage.load_config().await.unwrap(), config);

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(storage.config_path()).unwrap()).unwrap();
        assert_eq!(raw["disabled"][0], "com.example.fox");
        assert_eq!(raw["repositories"][0]["official"], true);
    }

    #[tokio::test]
    async fn test_corrupt_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ExtensionStorage::new(dir.path());
        storage.ensure_dirs().await.unwrap();
        std::fs::write(storage.config_path(), "{ not json").unwrap();
        assert!(matches!(
            storage.load_config().await,
            Err(ExtensionError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_list_scripts_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ExtensionStorage::new(dir.path());
        storage.ensure_dirs().await.unwrap();
        for name in ["b.lua", "a.lua", "notes.txt"] {
            std::fs::write(storage.scripts_dir().join(name), "").unwrap();
        }
        std::fs::create_dir(storage.scripts_dir().join("dir.lua")).unwrap();

        let scripts = storage.list_scripts().await.unwrap();
        let names: Vec<String> = scripts.iter().map(|p| file_stem(p)).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
