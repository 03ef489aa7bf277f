//! Anisource extension host
//!
//! Lua-scripted content sources running in isolated sandboxes. Scripts are
//! installed from JSON repository indexes or local files, see only a small
//! capability surface (restricted HTTP, HTML querying, string helpers, JSON)
//! and implement a fixed six-operation contract for listing, searching and
//! resolving anime streams.

mod capabilities;
pub mod config;
pub mod error;
pub mod html;
pub mod manager;
mod marshal;
pub mod metadata;
pub mod repository;
pub mod runtime;
mod sandbox;
pub mod source;
pub mod storage;
pub mod types;

pub use config::{HostConfig, SandboxConfig, OFFICIAL_REPOSITORY_NAME};
pub use error::ExtensionError;
pub use manager::ExtensionManager;
pub use repository::{validate_repository_url, RepositoryClient};
pub use runtime::ScriptRuntime;
pub use source::{ExtensionSource, Operation};
pub use storage::{validate_extension_id, ExtensionStorage, PersistedConfig};
pub use types::{
    AnimeDetails, AnimeEntry, AnimePage, Episode, ExtensionInfo, ExtensionState, Filter,
    FilterOption, InstalledExtension, RemoteExtension, Repository, RepositoryIndex,
    SearchFilters, Subtitle, VideoSource, MULTI_LANGUAGE,
};
