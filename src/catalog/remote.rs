//! Remote model catalog client
//!
//! `RemoteCatalog` is injected into the catalog so tests can replace the
//! network. `HuggingFaceCatalog` talks to the HuggingFace Hub HTTP API.

use async_trait::async_trait;
use serde::Deserialize;

use super::types::{RemoteFile, RemoteModel};
use crate::error::{LifecycleError, Result};

pub const DEFAULT_REMOTE_BASE_URL: &str = "https://huggingface.co";

#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// Search repositories matching `query`
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RemoteModel>>;

    /// Files and sizes of one repository
    async fn file_metadata(&self, repo_id: &str) -> Result<Vec<RemoteFile>>;

    /// Direct download URL of a file
    fn download_url(&self, repo_id: &str, file_name: &str) -> String;
}

#[derive(Debug, Deserialize)]
struct HubModel {
    id: String,
    #[serde(default)]
    downloads: u64,
    #[serde(default)]
    likes: u64,
    #[serde(default)]
    siblings: Vec<HubSibling>,
}

#[derive(Debug, Deserialize)]
struct HubSibling {
    rfilename: String,
}

#[derive(Debug, Deserialize)]
struct HubTreeEntry {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    #[serde(default)]
    size: Option<u64>,
}

fn is_model_file(name: &str) -> bool {
    name.to_lowercase().ends_with(".gguf")
}

pub struct HuggingFaceCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HuggingFaceCatalog {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn with_default_url() -> Result<Self> {
        Self::new(DEFAULT_REMOTE_BASE_URL)
    }
}

#[async_trait]
impl RemoteCatalog for HuggingFaceCatalog {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RemoteModel>> {
        let url = format!("{}/api/models", self.base_url);
        let limit = limit.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[
                ("search", query),
                ("limit", limit.as_str()),
                ("filter", "gguf"),
                ("full", "true"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(LifecycleError::Remote(format!(
                "Search failed with status: {}",
                response.status()
            )));
        }

        let models: Vec<HubModel> = response.json().await?;
        log::debug!("Remote search '{}' returned {} repositories", query, models.len());

        Ok(models
            .into_iter()
            .map(|m| {
                let display_name = m.id.rsplit('/').next().unwrap_or(&m.id).to_string();
                RemoteModel {
                    files: m
                        .siblings
                        .into_iter()
                        .filter(|s| is_model_file(&s.rfilename))
                        .map(|s| RemoteFile {
                            file_name: s.rfilename,
                            size_bytes: None,
                        })
                        .collect(),
                    repo_id: m.id,
                    display_name,
                    downloads: m.downloads,
                    likes: m.likes,
                }
            })
            .collect())
    }

    async fn file_metadata(&self, repo_id: &str) -> Result<Vec<RemoteFile>> {
        let url = format!("{}/api/models/{}/tree/main", self.base_url, repo_id);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(LifecycleError::Remote(format!(
                "File listing for {} failed with status: {}",
                repo_id,
                response.status()
            )));
        }

        let entries: Vec<HubTreeEntry> = response.json().await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.kind == "file" && is_model_file(&e.path))
            .map(|e| RemoteFile {
                file_name: e.path,
                size_bytes: e.size,
            })
            .collect())
    }

    fn download_url(&self, repo_id: &str, file_name: &str) -> String {
        format!("{}/{}/resolve/main/{}", self.base_url, repo_id, file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_url() {
        let hub = HuggingFaceCatalog::new("https://example.org/").unwrap();
        assert_eq!(
            hub.download_url("org/repo", "model-Q4_K_M.gguf"),
            "https://example.org/org/repo/resolve/main/model-Q4_K_M.gguf"
        );
    }

    #[test]
    fn test_parses_hub_search_payload() {
        let payload = r#"[{"id":"org/Tiny-GGUF","downloads":12,"likes":3,
            "siblings":[{"rfilename":"README.md"},{"rfilename":"tiny-Q4_K_M.gguf"}]}]"#;
        let models: Vec<HubModel> = serde_json::from_str(payload).unwrap();
        assert_eq!(models[0].id, "org/Tiny-GGUF");
        assert_eq!(models[0].siblings.len(), 2);
        assert!(is_model_file(&models[0].siblings[1].rfilename));
        assert!(!is_model_file(&models[0].siblings[0].rfilename));
    }

    #[test]
    fn test_parses_hub_tree_payload() {
        let payload = r#"[{"type":"directory","path":"docs"},
            {"type":"file","path":"tiny-Q8_0.gguf","size":1234}]"#;
        let entries: Vec<HubTreeEntry> = serde_json::from_str(payload).unwrap();
        assert_eq!(entries[1].kind, "file");
        assert_eq!(entries[1].size, Some(1234));
        assert_eq!(entries[0].size, None);
    }
}
