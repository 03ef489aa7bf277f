//! Data model shared between the host, the script runtime and repositories.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::ScriptRuntime;

/// Language value that matches every requested language.
pub const MULTI_LANGUAGE: &str = "multi";

// ─── Extension metadata ─────────────────────────────────────────────────

/// Identity and declared capabilities of one extension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_app_version: Option<String>,
    /// Content locale (`pt-BR`, `en`, `multi`).
    pub language: String,
    pub base_url: String,
    pub icon_url: String,
    pub author: String,
    pub nsfw: bool,
    pub has_search: bool,
    pub has_latest: bool,
    pub has_popular: bool,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl ExtensionInfo {
    /// Whether this extension serves content for `lang`.
    pub fn serves_language(&self, lang: &str) -> bool {
        self.language == lang || self.language == MULTI_LANGUAGE
    }
}

/// A search filter declared by an extension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub name: String,
    /// `select`, `checkbox` or `text`.
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
    #[serde(default)]
    pub options: Vec<FilterOption>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterOption {
    pub label: String,
    pub value: String,
}

// ─── Contract records ───────────────────────────────────────────────────

/// An anime in a listing or search result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnimeEntry {
    pub title: String,
    pub url: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

/// One page of listing results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimePage {
    pub entries: Vec<AnimeEntry>,
    pub has_next_page: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimeDetails {
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alternate_title: String,
    pub url: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub banner: String,
    pub description: String,
    /// `ongoing`, `completed`, `hiatus`.
    pub status: String,
    pub genres: Vec<String>,
    #[serde(default)]
    pub year: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub studio: String,
    /// 0-10.
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub total_episodes: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub number: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thumbnail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    pub filler: bool,
}

/// A playable stream extracted from an episode page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoSource {
    pub url: String,
    /// `1080p`, `720p`, `auto`.
    pub quality: String,
    /// `hls`, `dash`, `mp4`.
    pub format: String,
    pub server: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtitles: Vec<Subtitle>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subtitle {
    pub url: String,
    pub language: String,
    pub label: String,
    /// `vtt`, `srt`, `ass`.
    pub format: String,
    pub default: bool,
}

/// Filters applied to a search, passed to the script as a string table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters(pub HashMap<String, String>);

impl SearchFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn with_genre(self, genre: impl Into<String>) -> Self {
        self.with("genre", genre)
    }

    pub fn with_year(self, year: i32) -> Self {
        self.with("year", year.to_string())
    }

    pub fn with_status(self, status: impl Into<String>) -> Self {
        self.with("status", status)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ─── Installed extensions ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionState {
    Enabled,
    Disabled,
    Outdated,
    Error,
}

impl ExtensionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Outdated => "outdated",
            Self::Error => "error",
        }
    }
}

/// An extension registered with the manager.
///
/// `runtime` is `None` exactly when `state` is [`ExtensionState::Error`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledExtension {
    pub info: ExtensionInfo,
    pub state: ExtensionState,
    #[serde(skip)]
    pub runtime: Option<Arc<ScriptRuntime>>,
    pub script_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl InstalledExtension {
    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn is_serving(&self) -> bool {
        self.state == ExtensionState::Enabled && self.runtime.is_some()
    }
}

// ─── Repositories ───────────────────────────────────────────────────────

/// A remote catalog of installable extensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub name: String,
    /// URL of the repository's `index.json`.
    pub url: String,
    #[serde(default)]
    pub official: bool,
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
}

/// The JSON document a repository publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryIndex {
    pub version: u32,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    pub extensions: Vec<RemoteExtension>,
}

impl RepositoryIndex {
    pub fn find(&self, id: &str) -> Option<&RemoteExtension> {
        self.extensions.iter().find(|e| e.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteExtension {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default)]
    pub icon_url: String,
    pub script_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub changelog: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_filters_builders() {
        let filters = SearchFilters::new()
            .with_genre("action")
            .with_year(2023)
            .with_status("ongoing");
        assert_eq!(filters.0.get("genre").map(String::as_str), Some("action"));
        assert_eq!(filters.0.get("year").map(String::as_str), Some("2023"));
        assert_eq!(filters.0.get("status").map(String::as_str), Some("ongoing"));
    }

    #[test]
    fn test_serves_language_with_wildcard() {
        let mut info = ExtensionInfo {
            language: "pt-BR".into(),
            ..Default::default()
        };
        assert!(info.serves_language("pt-BR"));
        assert!(!info.serves_language("en"));

        info.language = MULTI_LANGUAGE.into();
        assert!(info.serves_language("en"));
        assert!(info.serves_language("ja"));
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&ExtensionState::Outdated).unwrap();
        assert_eq!(json, "\"outdated\"");
        assert_eq!(ExtensionState::Error.as_str(), "error");
    }

    #[test]
    fn test_repository_index_wire_format() {
        let json = r#"{
            "version": 1,
            "lastUpdated": "2024-05-01T12:00:00Z",
            "extensions": [{
                "id": "com.example.fox",
                "name": "Fox",
                "version": "1.2.0",
                "language": "en",
                "nsfw": false,
                "iconUrl": "https://cdn.example.com/fox.png",
                "scriptUrl": "https://cdn.example.com/fox.lua",
                "changelog": "faster search"
            }]
        }"#;
        let index: RepositoryIndex = serde_json::from_str(json).unwrap();
        assert_eq!(index.version, 1);
        assert!(index.last_updated.is_some());
        let remote = index.find("com.example.fox").unwrap();
        assert_eq!(remote.script_url, "https://cdn.example.com/fox.lua");
        assert_eq!(remote.icon_url, "https://cdn.example.com/fox.png");
        assert!(index.find("missing").is_none());
    }

    #[test]
    fn test_repository_index_rejects_missing_extensions() {
        let result = serde_json::from_str::<RepositoryIndex>(r#"{"version": 1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_extension_info_camel_case_keys() {
        let info = ExtensionInfo {
            id: "a".into(),
            base_url: "https://a.example".into(),
            has_search: true,
            ..Default::default()
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["baseUrl"], "https://a.example");
        assert_eq!(value["hasSearch"], true);
        assert!(value.get("minAppVersion").is_none());
    }
}
