//! Host and sandbox configuration.
//!
//! Everything the capability surface and the manager need is injected
//! through these values at construction; there is no process-wide HTTP
//! client or mutable global.

use std::path::PathBuf;
use std::time::Duration;

/// Default official repository seeded when none is configured.
pub const OFFICIAL_REPOSITORY_NAME: &str = "Anisource Official";
pub const OFFICIAL_REPOSITORY_URL: &str =
    "https://raw.githubusercontent.com/anisource/extensions/main/index.json";

/// Identification header sent with every script-issued request.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko)";

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .unwrap_or_default()
        .eq_ignore_ascii_case("true")
}

// ─── Sandbox ────────────────────────────────────────────────────────────

/// Limits and HTTP policy applied to every script runtime.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Timeout for each `http_get` / `http_post` (default: 15 s).
    pub http_timeout: Duration,
    pub user_agent: String,
    /// Maximum response body a script may fetch (default: 10 MB).
    pub max_response_bytes: usize,
    /// Maximum redirects followed per request (default: 5).
    pub max_redirects: usize,
    /// Header names scripts may set. `None` allows any non-reserved header.
    pub allowed_headers: Option<Vec<String>>,
    /// Allow requests to loopback/private addresses (default: false).
    pub allow_private_hosts: bool,
    /// Maximum Lua heap per extension (default: 64 MB).
    pub memory_limit: usize,
    /// VM instructions allowed per contract call (default: 50M).
    pub instruction_limit: u64,
    /// Wall-clock budget per contract call (default: 60 s).
    pub call_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(15),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_response_bytes: 10 * 1024 * 1024,
            max_redirects: 5,
            allowed_headers: None,
            allow_private_hosts: false,
            memory_limit: 64 * 1024 * 1024,
            instruction_limit: 50_000_000,
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            http_timeout: Duration::from_secs(env_or(
                "EXTENSION_HTTP_TIMEOUT_SECS",
                defaults.http_timeout.as_secs(),
            )),
            user_agent: std::env::var("EXTENSION_USER_AGENT").unwrap_or(defaults.user_agent),
            max_response_bytes: env_or("EXTENSION_MAX_RESPONSE_MB", 10usize) * 1024 * 1024,
            max_redirects: defaults.max_redirects,
            allowed_headers: std::env::var("EXTENSION_ALLOWED_HEADERS").ok().map(|v| {
                v.split(',')
                    .map(|h| h.trim().to_ascii_lowercase())
                    .filter(|h| !h.is_empty())
                    .collect()
            }),
            allow_private_hosts: env_flag("EXTENSION_ALLOW_PRIVATE_HOSTS"),
            memory_limit: env_or("EXTENSION_MEMORY_LIMIT_MB", 64usize) * 1024 * 1024,
            instruction_limit: env_or("EXTENSION_INSTRUCTION_LIMIT", defaults.instruction_limit),
            call_timeout: Duration::from_secs(env_or(
                "EXTENSION_CALL_TIMEOUT_SECS",
                defaults.call_timeout.as_secs(),
            )),
        }
    }
}

// ─── Host ───────────────────────────────────────────────────────────────

/// Configuration for the extension manager and repository client.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Managed data root; extensions live under `<root>/extensions`.
    pub data_dir: PathBuf,
    pub official_repository_url: String,
    /// Host version checked against a script's `minAppVersion`.
    pub app_version: semver::Version,
    /// Accept plain-HTTP and private-address repository URLs.
    pub allow_insecure_repositories: bool,
    /// Maximum size of a downloaded or installed script (default: 512 KB).
    pub max_script_bytes: u64,
    /// Timeout for index fetches and artifact downloads (default: 30 s).
    pub fetch_timeout: Duration,
    pub sandbox: SandboxConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            official_repository_url: OFFICIAL_REPOSITORY_URL.to_string(),
            app_version: semver::Version::parse(env!("CARGO_PKG_VERSION"))
                .unwrap_or_else(|_| semver::Version::new(0, 1, 0)),
            allow_insecure_repositories: false,
            max_script_bytes: 512 * 1024,
            fetch_timeout: Duration::from_secs(30),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl HostConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("EXTENSIONS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            official_repository_url: std::env::var("EXTENSIONS_OFFICIAL_REPO_URL")
                .unwrap_or(defaults.official_repository_url),
            app_version: defaults.app_version,
            allow_insecure_repositories: env_flag("EXTENSIONS_ALLOW_INSECURE_REPOS"),
            max_script_bytes: env_or("EXTENSIONS_MAX_SCRIPT_SIZE_KB", 512u64) * 1024,
            fetch_timeout: Duration::from_secs(env_or(
                "EXTENSIONS_FETCH_TIMEOUT_SECS",
                defaults.fetch_timeout.as_secs(),
            )),
            sandbox: SandboxConfig::from_env(),
        }
    }

    /// Config rooted at `data_dir`, otherwise default.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
