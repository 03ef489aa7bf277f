//! Extension manager: installed extensions, repositories and their
//! lifecycle.
//!
//! The registry sits behind one async `RwLock`. Network fetches, downloads
//! and script validation happen outside it; the registry mutation and the
//! config write happen together under the write lock afterwards. Installs
//! and updates of the same id are serialized by a per-id lock.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tempfile::NamedTempFile;
use tokio::sync::RwLock;

use crate::config::{HostConfig, OFFICIAL_REPOSITORY_NAME};
use crate::error::ExtensionError;
use crate::repository::{validate_repository_url, RepositoryClient};
use crate::runtime::ScriptRuntime;
use crate::source::ExtensionSource;
use crate::storage::{
    file_stem, validate_extension_id, ExtensionStorage, PersistedConfig, SCRIPT_EXTENSION,
};
use crate::types::{
    AnimeDetails, AnimePage, Episode, ExtensionInfo, ExtensionState, InstalledExtension,
    RemoteExtension, Repository, SearchFilters, VideoSource,
};

/// Icons larger than this are skipped.
const MAX_ICON_BYTES: u64 = 2 * 1024 * 1024;

#[derive(Debug, Default)]
struct Registry {
    extensions: HashMap<String, InstalledExtension>,
    repositories: Vec<Repository>,
    disabled: BTreeSet<String>,
}

impl Registry {
    fn persisted(&self) -> PersistedConfig {
        PersistedConfig {
            repositories: self.repositories.clone(),
            disabled: self.disabled.iter().cloned().collect(),
        }
    }
}

type InstallLocks = std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Holds the install lock for one id. Dropping it releases the lock and
/// prunes locks nobody is holding or waiting on.
struct InstallGuard<'a> {
    locks: &'a InstallLocks,
    held: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for InstallGuard<'_> {
    fn drop(&mut self) {
        self.held.take();
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

/// A validated script waiting to be moved into managed storage.
struct Staged {
    script: NamedTempFile,
    runtime: ScriptRuntime,
}

fn error_entry(key: &str, script_path: PathBuf, error: &ExtensionError) -> InstalledExtension {
    InstalledExtension {
        info: ExtensionInfo {
            id: key.to_string(),
            name: key.to_string(),
            ..ExtensionInfo::default()
        },
        state: ExtensionState::Error,
        runtime: None,
        script_path,
        error: Some(error.to_string()),
        updated_at: Utc::now(),
    }
}

/// Registry key for a script that failed to load: its file stem, or its
/// file name when a loaded extension already owns the stem.
fn error_key(path: &Path, taken: &HashMap<String, InstalledExtension>) -> Option<String> {
    let stem = file_stem(path);
    if !taken.contains_key(&stem) {
        return Some(stem);
    }
    let name = path.file_name()?.to_string_lossy().into_owned();
    (!taken.contains_key(&name)).then_some(name)
}

fn icon_url<'a>(remote: &'a RemoteExtension, info: &'a ExtensionInfo) -> &'a str {
    if remote.icon_url.is_empty() {
        &info.icon_url
    } else {
        &remote.icon_url
    }
}

fn live_entry(
    runtime: ScriptRuntime,
    state: ExtensionState,
    script_path: PathBuf,
) -> InstalledExtension {
    InstalledExtension {
        info: runtime.info().clone(),
        state,
        runtime: Some(Arc::new(runtime)),
        script_path,
        error: None,
        updated_at: Utc::now(),
    }
}

fn persist_temp(temp: NamedTempFile, dest: &Path) -> Result<(), ExtensionError> {
    temp.persist(dest).map_err(|e| ExtensionError::Io(e.error))?;
    Ok(())
}

pub struct ExtensionManager {
    config: HostConfig,
    storage: ExtensionStorage,
    client: RepositoryClient,
    registry: RwLock<Registry>,
    install_locks: InstallLocks,
}

impl std::fmt::Debug for ExtensionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionManager")
            .field("root", &self.storage.root())
            .finish_non_exhaustive()
    }
}

impl ExtensionManager {
    /// Create a manager. Does NOT load anything; call [`initialize`].
    ///
    /// [`initialize`]: Self::initialize
    pub fn new(config: HostConfig) -> Result<Self, ExtensionError> {
        let client = RepositoryClient::new(&config)?;
        let storage = ExtensionStorage::new(&config.data_dir);
        Ok(Self {
            config,
            storage,
            client,
            registry: RwLock::new(Registry::default()),
            install_locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn storage(&self) -> &ExtensionStorage {
        &self.storage
    }

    async fn lock_install(&self, id: &str) -> InstallGuard<'_> {
        let lock = {
            let mut locks = self
                .install_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        let mut guard = InstallGuard {
            locks: &self.install_locks,
            held: None,
        };
        guard.held = Some(lock.lock_owned().await);
        guard
    }

    fn official_repository(&self) -> Repository {
        Repository {
            name: OFFICIAL_REPOSITORY_NAME.to_string(),
            url: self.config.official_repository_url.clone(),
            official: true,
            last_checked: None,
        }
    }

    async fn save(&self, registry: &Registry) -> Result<(), ExtensionError> {
        self.storage.save_config(&registry.persisted()).await
    }

    async fn instantiate(&self, script: String, chunk: &str) -> Result<ScriptRuntime, ExtensionError> {
        ScriptRuntime::load(
            script,
            &format!("{chunk}.{SCRIPT_EXTENSION}"),
            &self.config.sandbox,
            &self.config.app_version,
        )
        .await
    }

    // ── Startup ──────────────────────────────────────────────────────

    /// Load config and every script on disk.
    ///
    /// A script that fails to load is registered in the `Error` state under
    /// its file stem, or under its file name when a loaded extension already
    /// declares that id. Loading continues with the next file.
    pub async fn initialize(&self) -> Result<(), ExtensionError> {
        self.storage.ensure_dirs().await?;

        let persisted = match self.storage.load_config().await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    path = %self.storage.config_path().display(),
                    "ignoring unreadable extension config: {e}"
                );
                PersistedConfig::default()
            }
        };

        let mut repositories = persisted.repositories;
        if !repositories.iter().any(|r| r.official) {
            repositories.insert(0, self.official_repository());
        }
        let disabled: BTreeSet<String> = persisted.disabled.into_iter().collect();

        let mut loaded = Vec::new();
        for path in self.storage.list_scripts().await? {
            let result = match tokio::fs::read_to_string(&path).await {
                Ok(script) => self.instantiate(script, &file_stem(&path)).await,
                Err(e) => Err(e.into()),
            };
            loaded.push((path, result));
        }

        // Loaded ids are claimed before any failure is keyed, so a broken
        // file never shadows a working extension.
        let mut extensions: HashMap<String, InstalledExtension> = HashMap::new();
        let mut failures = Vec::new();
        for (path, result) in loaded {
            let runtime = match result {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!(path = %path.display(), "failed to load extension: {e}");
                    failures.push((path, e));
                    continue;
                }
            };
            let id = runtime.info().id.clone();
            if extensions.contains_key(&id) {
                runtime.close();
                let err = ExtensionError::Validation(format!(
                    "duplicate extension id '{id}' already loaded from another file"
                ));
                tracing::error!(path = %path.display(), extension_id = %id, "{err}");
                failures.push((path, err));
                continue;
            }
            let state = if disabled.contains(&id) {
                ExtensionState::Disabled
            } else {
                ExtensionState::Enabled
            };
            tracing::info!(
                extension_id = %id,
                version = %runtime.info().version,
                state = state.as_str(),
                "extension loaded"
            );
            extensions.insert(id, live_entry(runtime, state, path));
        }

        for (path, err) in failures {
            match error_key(&path, &extensions) {
                Some(key) => {
                    let entry = error_entry(&key, path, &err);
                    extensions.insert(key, entry);
                }
                None => {
                    tracing::warn!(path = %path.display(), "no free registry key for failed script");
                }
            }
        }

        let mut registry = self.registry.write().await;
        for old in registry.extensions.values() {
            if let Some(runtime) = &old.runtime {
                runtime.close();
            }
        }
        let failed = extensions
            .values()
            .filter(|e| e.state == ExtensionState::Error)
            .count();
        tracing::info!(
            loaded = extensions.len() - failed,
            failed,
            repositories = repositories.len(),
            "extension manager initialized"
        );
        *registry = Registry {
            extensions,
            repositories,
            disabled,
        };
        self.save(&registry).await
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// All registered extensions, sorted by id.
    pub async fn get_extensions(&self) -> Vec<InstalledExtension> {
        let registry = self.registry.read().await;
        let mut all: Vec<InstalledExtension> = registry.extensions.values().cloned().collect();
        all.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        all
    }

    pub async fn get_extension(&self, id: &str) -> Option<InstalledExtension> {
        self.registry.read().await.extensions.get(id).cloned()
    }

    /// Enabled extensions with a live runtime, sorted by id.
    pub async fn get_enabled_sources(&self) -> Vec<Arc<dyn ExtensionSource>> {
        self.sources_where(|_| true).await
    }

    /// Enabled sources serving `lang`, including `multi` sources.
    pub async fn get_sources_by_language(&self, lang: &str) -> Vec<Arc<dyn ExtensionSource>> {
        self.sources_where(|info| info.serves_language(lang)).await
    }

    async fn sources_where(
        &self,
        filter: impl Fn(&ExtensionInfo) -> bool,
    ) -> Vec<Arc<dyn ExtensionSource>> {
        let registry = self.registry.read().await;
        let mut serving: Vec<&InstalledExtension> = registry
            .extensions
            .values()
            .filter(|e| e.is_serving() && filter(&e.info))
            .collect();
        serving.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        serving
            .into_iter()
            .filter_map(|e| e.runtime.clone())
            .map(|runtime| runtime as Arc<dyn ExtensionSource>)
            .collect()
    }

    pub async fn get_repositories(&self) -> Vec<Repository> {
        self.registry.read().await.repositories.clone()
    }

    // ── Install / update / uninstall ─────────────────────────────────

    async fn download_script(
        &self,
        remote: &RemoteExtension,
    ) -> Result<(NamedTempFile, String), ExtensionError> {
        let temp = self
            .client
            .download_to_temp(
                &remote.script_url,
                &self.storage.scripts_dir(),
                self.config.max_script_bytes,
            )
            .await?;
        let script = tokio::fs::read_to_string(temp.path()).await?;
        Ok((temp, script))
    }

    /// Icon download is best-effort and runs after the script is
    /// committed.
    async fn download_icon(&self, id: &str, url: &str) {
        if url.is_empty() {
            return;
        }
        let dest = self.storage.icon_path(id);
        if let Err(e) = self.client.download(url, &dest, MAX_ICON_BYTES).await {
            tracing::warn!(extension_id = %id, url = %url, "failed to download extension icon: {e}");
        }
    }

    /// Download and validate `remote`, requiring its declared id to be `id`.
    ///
    /// A script that downloads but fails to load comes back with the error
    /// so the caller can decide whether to keep it.
    async fn stage(
        &self,
        id: &str,
        remote: &RemoteExtension,
    ) -> Result<Result<Staged, (NamedTempFile, ExtensionError)>, ExtensionError> {
        let (script_file, script) = self.download_script(remote).await?;
        let runtime = match self.instantiate(script, id).await {
            Ok(runtime) => runtime,
            Err(e) if e.is_load_failure() => return Ok(Err((script_file, e))),
            Err(e) => return Err(e),
        };
        if runtime.info().id != id {
            let declared = runtime.info().id.clone();
            runtime.close();
            return Err(ExtensionError::Validation(format!(
                "script declares id '{declared}' but '{id}' was requested"
            )));
        }
        Ok(Ok(Staged {
            script: script_file,
            runtime,
        }))
    }

    /// Move a staged script into place and register it, replacing and
    /// closing any previous runtime for the same id.
    async fn commit(
        &self,
        id: &str,
        staged: Staged,
        state: ExtensionState,
    ) -> Result<InstalledExtension, ExtensionError> {
        let script_path = self.storage.script_path(id);
        let mut registry = self.registry.write().await;

        persist_temp(staged.script, &script_path)?;

        let entry = live_entry(staged.runtime, state, script_path);
        if let Some(old) = registry.extensions.insert(id.to_string(), entry.clone()) {
            if let Some(runtime) = old.runtime {
                runtime.close();
            }
        }
        if state == ExtensionState::Enabled {
            registry.disabled.remove(id);
        }
        self.save(&registry).await?;
        Ok(entry)
    }

    /// Install (or reinstall) extension `id` from the repository index at
    /// `repo_url`.
    ///
    /// Network failures and cancellation leave no trace. A downloaded script
    /// that fails to load is kept and registered in the `Error` state,
    /// unless a working copy of the extension is already installed; the
    /// load error is returned either way.
    pub async fn install_from_repository(
        &self,
        repo_url: &str,
        id: &str,
    ) -> Result<InstalledExtension, ExtensionError> {
        validate_extension_id(id)?;
        let _installing = self.lock_install(id).await;

        tracing::info!(repo_url = %repo_url, extension_id = %id, "installing extension");

        let index = self.client.fetch_index(repo_url).await?;
        self.touch_repository(repo_url).await;
        let remote = index.find(id).cloned().ok_or_else(|| {
            ExtensionError::Validation(format!("extension '{id}' not found in repository {repo_url}"))
        })?;

        match self.stage(id, &remote).await? {
            Ok(staged) => {
                let entry = self.commit(id, staged, ExtensionState::Enabled).await?;
                self.download_icon(id, icon_url(&remote, &entry.info)).await;
                tracing::info!(
                    extension_id = %id,
                    version = %entry.info.version,
                    repo_url = %repo_url,
                    "extension installed"
                );
                Ok(entry)
            }
            Err((script_file, load_error)) => {
                let mut registry = self.registry.write().await;
                let has_working_copy = registry
                    .extensions
                    .get(id)
                    .is_some_and(|e| e.runtime.is_some());
                if has_working_copy {
                    tracing::warn!(
                        extension_id = %id,
                        "downloaded script failed to load, keeping installed version: {load_error}"
                    );
                } else {
                    let script_path = self.storage.script_path(id);
                    persist_temp(script_file, &script_path)?;
                    registry.extensions.insert(
                        id.to_string(),
                        error_entry(id, script_path, &load_error),
                    );
                    self.save(&registry).await?;
                    tracing::error!(
                        extension_id = %id,
                        "installed extension failed to load: {load_error}"
                    );
                }
                Err(load_error)
            }
        }
    }

    /// Install a local `.lua` script into managed storage.
    ///
    /// Nothing is registered when the script fails to load.
    pub async fn install_from_file(&self, path: &Path) -> Result<InstalledExtension, ExtensionError> {
        if path.extension().and_then(|e| e.to_str()) != Some(SCRIPT_EXTENSION) {
            return Err(ExtensionError::Validation(format!(
                "extension scripts must have a .{SCRIPT_EXTENSION} extension: {}",
                path.display()
            )));
        }

        let size = tokio::fs::metadata(path).await?.len();
        if size > self.config.max_script_bytes {
            return Err(ExtensionError::Validation(format!(
                "script too large: {size} bytes (max: {} bytes)",
                self.config.max_script_bytes
            )));
        }

        let script = tokio::fs::read_to_string(path).await?;
        let runtime = self.instantiate(script.clone(), &file_stem(path)).await?;
        let id = runtime.info().id.clone();
        if let Err(e) = validate_extension_id(&id) {
            runtime.close();
            return Err(e);
        }

        let _installing = self.lock_install(&id).await;

        let script_file = {
            let scripts_dir = self.storage.scripts_dir();
            tokio::task::spawn_blocking(move || -> Result<NamedTempFile, ExtensionError> {
                use std::io::Write;
                let mut temp = NamedTempFile::new_in(scripts_dir)?;
                temp.write_all(script.as_bytes())?;
                temp.as_file().sync_all()?;
                Ok(temp)
            })
            .await
            .map_err(|e| ExtensionError::Runtime(format!("script writer failed: {e}")))??
        };

        let entry = self
            .commit(
                &id,
                Staged {
                    script: script_file,
                    runtime,
                },
                ExtensionState::Enabled,
            )
            .await?;
        tracing::info!(
            extension_id = %id,
            version = %entry.info.version,
            path = %path.display(),
            "extension installed from file"
        );
        Ok(entry)
    }

    /// Update `id` to the version published in the first configured
    /// repository that lists it.
    ///
    /// The installed version keeps running untouched unless the new script
    /// downloads and loads successfully. A disabled extension stays
    /// disabled.
    pub async fn update_extension(&self, id: &str) -> Result<InstalledExtension, ExtensionError> {
        let _installing = self.lock_install(id).await;

        let current = self
            .get_extension(id)
            .await
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))?;

        let mut found = None;
        for repo in self.get_repositories().await {
            match self.client.fetch_index(&repo.url).await {
                Ok(index) => {
                    self.touch_repository(&repo.url).await;
                    if let Some(remote) = index.find(id) {
                        found = Some(remote.clone());
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(repo_url = %repo.url, "skipping unreachable repository: {e}");
                }
            }
        }
        let remote = found.ok_or_else(|| {
            ExtensionError::Validation(format!(
                "extension '{id}' is not available in any configured repository"
            ))
        })?;

        if remote.version == current.info.version && current.runtime.is_some() {
            tracing::debug!(extension_id = %id, version = %remote.version, "extension already up to date");
            return Ok(current);
        }

        tracing::info!(
            extension_id = %id,
            old_version = %current.info.version,
            new_version = %remote.version,
            "starting extension update"
        );

        let staged = match self.stage(id, &remote).await? {
            Ok(staged) => staged,
            Err((_discarded, load_error)) => {
                tracing::error!(
                    extension_id = %id,
                    "updated script failed to load, keeping installed version: {load_error}"
                );
                return Err(load_error);
            }
        };

        let state = if current.state == ExtensionState::Disabled {
            ExtensionState::Disabled
        } else {
            ExtensionState::Enabled
        };
        let entry = self.commit(id, staged, state).await?;
        self.download_icon(id, icon_url(&remote, &entry.info)).await;
        tracing::info!(
            extension_id = %id,
            old_version = %current.info.version,
            new_version = %entry.info.version,
            "extension updated"
        );
        Ok(entry)
    }

    /// Remove `id`, its script and its icon.
    pub async fn uninstall_extension(&self, id: &str) -> Result<(), ExtensionError> {
        let _installing = self.lock_install(id).await;

        let mut registry = self.registry.write().await;
        let script_path = registry
            .extensions
            .get(id)
            .map(|e| e.script_path.clone())
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))?;

        // The entry stays registered if its script cannot be deleted.
        ExtensionStorage::remove_file(&script_path).await?;
        if validate_extension_id(id).is_ok() {
            if let Err(e) = ExtensionStorage::remove_file(&self.storage.icon_path(id)).await {
                tracing::warn!(extension_id = %id, "failed to remove extension icon: {e}");
            }
        }

        let Some(entry) = registry.extensions.remove(id) else {
            return Err(ExtensionError::NotFound(id.to_string()));
        };
        if let Some(runtime) = &entry.runtime {
            runtime.close();
        }
        registry.disabled.remove(id);
        self.save(&registry).await?;

        tracing::info!(extension_id = %id, version = %entry.info.version, "extension uninstalled");
        Ok(())
    }

    // ── Enable / disable ─────────────────────────────────────────────

    /// Enable `id`. Extensions in the `Error` state cannot be enabled.
    pub async fn enable_extension(&self, id: &str) -> Result<(), ExtensionError> {
        let mut registry = self.registry.write().await;
        let entry = registry
            .extensions
            .get_mut(id)
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))?;
        if entry.state == ExtensionState::Error || entry.runtime.is_none() {
            return Err(ExtensionError::Validation(format!(
                "extension '{id}' failed to load and cannot be enabled: {}",
                entry.error.as_deref().unwrap_or("no runtime")
            )));
        }
        entry.state = ExtensionState::Enabled;
        registry.disabled.remove(id);
        self.save(&registry).await?;
        tracing::info!(extension_id = %id, "extension enabled");
        Ok(())
    }

    /// Disable `id`. The runtime stays loaded.
    pub async fn disable_extension(&self, id: &str) -> Result<(), ExtensionError> {
        let mut registry = self.registry.write().await;
        let entry = registry
            .extensions
            .get_mut(id)
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))?;
        if entry.state != ExtensionState::Error {
            entry.state = ExtensionState::Disabled;
        }
        registry.disabled.insert(id.to_string());
        self.save(&registry).await?;
        tracing::info!(extension_id = %id, "extension disabled");
        Ok(())
    }

    // ── Repositories ─────────────────────────────────────────────────

    pub async fn add_repository(&self, name: &str, url: &str) -> Result<Repository, ExtensionError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ExtensionError::Validation(
                "repository name must not be empty".into(),
            ));
        }
        validate_repository_url(url, self.config.allow_insecure_repositories)?;

        let mut registry = self.registry.write().await;
        if registry.repositories.iter().any(|r| r.url == url) {
            return Err(ExtensionError::Validation(format!(
                "repository already configured: {url}"
            )));
        }
        let repository = Repository {
            name: name.to_string(),
            url: url.to_string(),
            official: false,
            last_checked: None,
        };
        registry.repositories.push(repository.clone());
        self.save(&registry).await?;
        tracing::info!(repo_url = %url, name = %name, "repository added");
        Ok(repository)
    }

    /// Remove a repository. The official repository cannot be removed.
    pub async fn remove_repository(&self, url: &str) -> Result<(), ExtensionError> {
        let mut registry = self.registry.write().await;
        let position = registry
            .repositories
            .iter()
            .position(|r| r.url == url)
            .ok_or_else(|| ExtensionError::NotFound(format!("repository {url}")))?;
        if registry.repositories[position].official {
            return Err(ExtensionError::Validation(
                "the official repository cannot be removed".into(),
            ));
        }
        registry.repositories.remove(position);
        self.save(&registry).await?;
        tracing::info!(repo_url = %url, "repository removed");
        Ok(())
    }

    /// Record a successful index fetch for a configured repository.
    async fn touch_repository(&self, url: &str) {
        let mut registry = self.registry.write().await;
        let Some(repo) = registry.repositories.iter_mut().find(|r| r.url == url) else {
            return;
        };
        repo.last_checked = Some(Utc::now());
        if let Err(e) = self.save(&registry).await {
            tracing::warn!(repo_url = %url, "failed to persist repository check time: {e}");
        }
    }

    /// Extensions published by the repository at `url`.
    pub async fn fetch_repository_extensions(
        &self,
        url: &str,
    ) -> Result<Vec<RemoteExtension>, ExtensionError> {
        let index = self.client.fetch_index(url).await?;
        self.touch_repository(url).await;
        Ok(index.extensions)
    }

    /// Map of `id -> remote version` for installed extensions whose
    /// published version differs from the installed one.
    ///
    /// Entries that failed to load have no installed version and are left
    /// out; reinstalling them goes through [`install_from_repository`].
    /// Unreachable repositories are skipped. Extension state is not
    /// changed.
    ///
    /// [`install_from_repository`]: Self::install_from_repository
    pub async fn check_updates(&self) -> HashMap<String, String> {
        let installed: HashMap<String, String> = {
            let registry = self.registry.read().await;
            registry
                .extensions
                .iter()
                .filter(|(_, e)| e.runtime.is_some())
                .map(|(id, e)| (id.clone(), e.info.version.clone()))
                .collect()
        };

        let mut updates = HashMap::new();
        for repo in self.get_repositories().await {
            let index = match self.client.fetch_index(&repo.url).await {
                Ok(index) => index,
                Err(e) => {
                    tracing::warn!(repo_url = %repo.url, "update check skipped repository: {e}");
                    continue;
                }
            };
            self.touch_repository(&repo.url).await;
            for remote in index.extensions {
                if updates.contains_key(&remote.id) {
                    continue;
                }
                if let Some(version) = installed.get(&remote.id) {
                    if *version != remote.version {
                        updates.insert(remote.id, remote.version);
                    }
                }
            }
        }
        updates
    }

    // ── Source calls ─────────────────────────────────────────────────

    async fn runtime(&self, id: &str) -> Result<Arc<ScriptRuntime>, ExtensionError> {
        let registry = self.registry.read().await;
        let entry = registry
            .extensions
            .get(id)
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))?;
        entry.runtime.clone().ok_or_else(|| {
            ExtensionError::Validation(format!(
                "extension '{id}' has no runtime: {}",
                entry.error.as_deref().unwrap_or("failed to load")
            ))
        })
    }

    pub async fn search(
        &self,
        id: &str,
        query: &str,
        page: u32,
        filters: &SearchFilters,
    ) -> Result<AnimePage, ExtensionError> {
        self.runtime(id).await?.search(query, page, filters).await
    }

    pub async fn get_latest(&self, id: &str, page: u32) -> Result<AnimePage, ExtensionError> {
        self.runtime(id).await?.get_latest(page).await
    }

    pub async fn get_popular(&self, id: &str, page: u32) -> Result<AnimePage, ExtensionError> {
        self.runtime(id).await?.get_popular(page).await
    }

    pub async fn get_anime_details(
        &self,
        id: &str,
        url: &str,
    ) -> Result<Option<AnimeDetails>, ExtensionError> {
        self.runtime(id).await?.get_anime_details(url).await
    }

    pub async fn get_episodes(&self, id: &str, url: &str) -> Result<Vec<Episode>, ExtensionError> {
        self.runtime(id).await?.get_episodes(url).await
    }

    pub async fn get_video_sources(
        &self,
        id: &str,
        url: &str,
    ) -> Result<Vec<VideoSource>, ExtensionError> {
        self.runtime(id).await?.get_video_sources(url).await
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Close every runtime. Entries stay registered but stop serving.
    pub async fn shutdown(&self) {
        let registry = self.registry.read().await;
        for entry in registry.extensions.values() {
            if let Some(runtime) = &entry.runtime {
                runtime.close();
            }
        }
        tracing::info!(count = registry.extensions.len(), "extension runtimes closed");
    }
}
