//! Shared fixtures for the extension host integration tests.

#![allow(dead_code)]

use std::path::Path;

use anisource_extensions::{ExtensionManager, HostConfig, SandboxConfig};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TEMPLATE: &str = r#"
Extension = {
    id = "@ID@",
    name = "@ID@ source",
    version = "@VERSION@",
    language = "@LANG@",
}

local calls = 0

function search(query, page, filters)
    calls = calls + 1
    return {
        { title = query, url = "/" .. query .. "/" .. page, status = tostring(calls) },
    }, page < 2
end

function getLatest(page)
    return { { title = "latest " .. page, url = "/latest/" .. page } }, false
end
"#;

/// A working extension script. It defines `search` and `getLatest` only.
pub fn script(id: &str, version: &str) -> String {
    script_in(id, version, "en")
}

pub fn script_in(id: &str, version: &str, lang: &str) -> String {
    TEMPLATE
        .replace("@ID@", id)
        .replace("@VERSION@", version)
        .replace("@LANG@", lang)
}

pub const BROKEN_SCRIPT: &str = "Extension = { id = ";

pub struct Harness {
    pub server: MockServer,
    pub dir: TempDir,
    pub manager: ExtensionManager,
}

impl Harness {
    pub fn url(&self, route: &str) -> String {
        format!("{}{route}", self.server.uri())
    }

    pub fn official_url(&self) -> String {
        self.url("/official.json")
    }

    pub fn scripts_dir(&self) -> std::path::PathBuf {
        self.manager.storage().scripts_dir()
    }

    /// Serve a repository index at `route` listing `(id, version, script route)`.
    pub async fn serve_index(&self, route: &str, entries: &[(&str, &str, &str)]) {
        let extensions: Vec<_> = entries
            .iter()
            .map(|(id, version, script_route)| {
                json!({
                    "id": id,
                    "name": id,
                    "version": version,
                    "language": "en",
                    "nsfw": false,
                    "iconUrl": self.url(&format!("/icons/{id}.png")),
                    "scriptUrl": self.url(script_route),
                })
            })
            .collect();
        let body = json!({
            "version": 1,
            "lastUpdated": "2024-05-01T00:00:00Z",
            "extensions": extensions,
        });
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&self.server)
            .await;
    }

    pub async fn serve_text(&self, route: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&self.server)
            .await;
    }

    /// Serve `body` at `route` after `delay`, for stalling a download.
    pub async fn serve_text_delayed(&self, route: &str, body: &str, delay: std::time::Duration) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(body)
                    .set_delay(delay),
            )
            .mount(&self.server)
            .await;
    }

    pub async fn serve_status(&self, route: &str, status: u16) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// Write a script straight into managed storage, bypassing install.
    pub fn write_script(&self, file_name: &str, body: &str) {
        write_script(&self.scripts_dir(), file_name, body);
    }

    /// A second manager over the same data directory, as after a restart.
    pub async fn restart(&self) -> ExtensionManager {
        self.manager.shutdown().await;
        let manager = ExtensionManager::new(config(self.dir.path(), &self.official_url())).unwrap();
        manager.initialize().await.unwrap();
        manager
    }
}

pub fn write_script(dir: &Path, file_name: &str, body: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(file_name), body).unwrap();
}

pub fn config(data_dir: &Path, official_url: &str) -> HostConfig {
    HostConfig {
        official_repository_url: official_url.to_string(),
        allow_insecure_repositories: true,
        sandbox: SandboxConfig {
            allow_private_hosts: true,
            ..SandboxConfig::default()
        },
        ..HostConfig::with_data_dir(data_dir)
    }
}

/// Start a mock repository server and an uninitialized manager.
pub async fn harness_uninitialized() -> Harness {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let official = format!("{}/official.json", server.uri());
    let manager = ExtensionManager::new(config(dir.path(), &official)).unwrap();
    Harness {
        server,
        dir,
        manager,
    }
}

/// Start a mock repository server and an initialized manager. The official
/// repository answers 404 until a test mounts an index for it.
pub async fn harness() -> Harness {
    let harness = harness_uninitialized().await;
    harness.manager.initialize().await.unwrap();
    harness
}

/// Names of the files in `dir`, sorted.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
