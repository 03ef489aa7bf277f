//! Remote repository access: index fetches and artifact downloads.

use std::path::Path;

use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use crate::capabilities::check_public_host;
use crate::config::HostConfig;
use crate::error::ExtensionError;
use crate::types::RepositoryIndex;

/// Validate a repository or artifact URL.
///
/// Only HTTPS URLs pointing at public hosts are accepted unless `insecure`
/// is set, which also allows plain HTTP and private addresses.
pub fn validate_repository_url(url: &str, insecure: bool) -> Result<(), ExtensionError> {
    let parsed = url::Url::parse(url)
        .map_err(|_| ExtensionError::Validation(format!("invalid repository URL: '{url}'")))?;

    let scheme_ok = match parsed.scheme() {
        "https" => true,
        "http" => insecure,
        _ => false,
    };
    if !scheme_ok {
        return Err(ExtensionError::Validation(format!(
            "only HTTPS repository URLs are allowed, got scheme '{}' in '{url}'",
            parsed.scheme()
        )));
    }

    if parsed.host_str().is_none() {
        return Err(ExtensionError::Validation(format!(
            "repository URL has no host: '{url}'"
        )));
    }

    if !insecure {
        check_public_host(&parsed).map_err(ExtensionError::Validation)?;
    }

    Ok(())
}

/// HTTP client for repository indexes and extension artifacts.
#[derive(Debug, Clone)]
pub struct RepositoryClient {
    client: reqwest::Client,
    insecure: bool,
}

impl RepositoryClient {
    pub fn new(config: &HostConfig) -> Result<Self, ExtensionError> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .user_agent(concat!("anisource-extensions/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            insecure: config.allow_insecure_repositories,
        })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, ExtensionError> {
        validate_repository_url(url, self.insecure)?;
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ExtensionError::Network(format!(
                "GET {url} failed: HTTP {}",
                status.as_u16()
            )));
        }
        Ok(resp)
    }

    /// Fetch and decode a repository's `index.json`.
    pub async fn fetch_index(&self, url: &str) -> Result<RepositoryIndex, ExtensionError> {
        let resp = self.get(url).await?;
        let index = resp.json::<RepositoryIndex>().await.map_err(|e| {
            ExtensionError::Network(format!("invalid repository index at {url}: {e}"))
        })?;
        tracing::debug!(
            repo_url = %url,
            extensions = index.extensions.len(),
            "fetched repository index"
        );
        Ok(index)
    }

    /// Stream `url` into a temporary file inside `dir`.
    ///
    /// The file is removed when the returned handle is dropped unless it
    /// is persisted.
    pub async fn download_to_temp(
        &self,
        url: &str,
        dir: &Path,
        max_bytes: u64,
    ) -> Result<NamedTempFile, ExtensionError> {
        let mut resp = self.get(url).await?;
        if resp.content_length().is_some_and(|len| len > max_bytes) {
            return Err(ExtensionError::Validation(format!(
                "artifact at {url} is too large (max: {max_bytes} bytes)"
            )));
        }

        let temp = NamedTempFile::new_in(dir)?;
        let mut file = tokio::fs::File::from_std(temp.reopen()?);
        let mut written: u64 = 0;
        while let Some(chunk) = resp.chunk().await? {
            written += chunk.len() as u64;
            if written > max_bytes {
                return Err(ExtensionError::Validation(format!(
                    "artifact at {url} is too large (max: {max_bytes} bytes)"
                )));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(temp)
    }

    /// Download `url` to `dest`, replacing it atomically on success.
    ///
    /// On any failure nothing is left at `dest`.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        max_bytes: u64,
    ) -> Result<u64, ExtensionError> {
        let dir = dest.parent().ok_or_else(|| {
            ExtensionError::Validation(format!("invalid destination: {}", dest.display()))
        })?;
        let temp = self.download_to_temp(url, dir, max_bytes).await?;
        let size = temp.as_file().metadata()?.len();
        temp.persist(dest).map_err(|e| ExtensionError::Io(e.error))?;
        tracing::debug!(url = %url, path = %dest.display(), size, "artifact downloaded");
        Ok(size)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> RepositoryClient {
        let config = HostConfig {
            allow_insecure_repositories: true,
            ..HostConfig::default()
        };
        RepositoryClient::new(&config).unwrap()
    }

    const INDEX: &str = r#"{
        "version": 1,
        "lastUpdated": "2024-05-01T00:00:00Z",
        "extensions": [
            { "id": "com.example.fox", "name": "Fox", "version": "2.0.0",
              "language": "en", "nsfw": false, "iconUrl": "", "scriptUrl": "https://x/fox.lua" }
        ]
    }"#;

    // ─── URL validation ─────────────────────────────────────────────

    #[test]
    fn test_validate_url_valid_https() {
        assert!(validate_repository_url("https://example.com/index.json", false).is_ok());
    }

    #[test]
    fn test_validate_url_reject_http() {
        let err = validate_repository_url("http://example.com/index.json", false).unwrap_err();
        assert!(err.to_string().contains("only HTTPS"));
    }

    #[test]
    fn test_validate_url_reject_file_and_ssh() {
        assert!(validate_repository_url("file:///etc/passwd", false).is_err());
        assert!(validate_repository_url("ssh://git@example.com/repo", false).is_err());
        assert!(validate_repository_url("file:///etc/passwd", true).is_err());
    }

    #[test]
    fn test_validate_url_reject_private_hosts() {
        for url in [
            "https://localhost/index.json",
            "https://127.0.0.1/index.json",
            "https://10.0.0.1/index.json",
            "https://172.16.0.1/index.json",
            "https://192.168.1.1/index.json",
            "https://169.254.169.254/latest",
            "https://metadata.google.internal/",
            "https://[::1]/index.json",
        ] {
            assert!(
                validate_repository_url(url, false).is_err(),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn test_validate_url_insecure_allows_local_http() {
        assert!(validate_repository_url("http://127.0.0.1:8080/index.json", true).is_ok());
    }

    #[test]
    fn test_validate_url_reject_garbage() {
        assert!(validate_repository_url("", false).is_err());
        assert!(validate_repository_url("not a url", false).is_err());
    }

    // ─── Index ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_fetch_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(INDEX))
            .mount(&server)
            .await;

        let index = client()
            .fetch_index(&format!("{}/index.json", server.uri()))
            .await
            .unwrap();
        assert_eq!(index.extensions.len(), 1);
        assert_eq!(index.find("com.example.fox").unwrap().version, "2.0.0");
    }

    #[tokio::test]
    async fn test_fetch_index_non_success_fails_closed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client()
            .fetch_index(&format!("{}/index.json", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::Network(_)));
        assert!(err.to_string().contains("HTTP 500"));
    }

    #[tokio::test]
    async fn test_fetch_index_malformed_json_fails_closed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"version\": 1"))
            .mount(&server)
            .await;

        let err = client()
            .fetch_index(&format!("{}/index.json", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::Network(_)));
    }

    // ─── Downloads ──────────────────────────────────────────────────

    #[tokio::test]
    async fn test_download_persists_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fox.lua"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Extension = { id = 'fox' }"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("fox.lua");
        let size = client()
            .download(&format!("{}/fox.lua", server.uri()), &dest, 1024)
            .await
            .unwrap();
        assert_eq!(size, 26);
        let content = std::fs::read_to_string(&dest).unwrap();
        assert!(content.contains("fox"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_download_too_large_leaves_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("big.lua");
        let err = client()
            .download(&format!("{}/big.lua", server.uri()), &dest, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::Validation(_)));
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_download_not_found_leaves_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("gone.lua");
        let err = client()
            .download(&format!("{}/gone.lua", server.uri()), &dest, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::Network(_)));
        assert!(!dest.exists());
    }
}
