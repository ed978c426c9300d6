//! Definition and policy sources.
//!
//! Every source returns a full set; partial updates are not supported.
//! Items that fail to parse are logged and excluded so one broken file or
//! record never blocks a reload.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use gantry_common::{GatewayError, GatewayResult};
use gantry_config::{ApiDefinition, Policy};

/// A source of API definitions.
#[async_trait]
pub trait ApiProvider: Send + Sync {
    async fn fetch_apis(&self) -> GatewayResult<Vec<ApiDefinition>>;

    /// Identity of the source, used to key emergency backups.
    fn source_id(&self) -> String;
}

/// A source of policies.
#[async_trait]
pub trait PolicyProvider: Send + Sync {
    async fn fetch_policies(&self) -> GatewayResult<HashMap<String, Policy>>;

    fn source_id(&self) -> String;
}

/// Directory of JSON definition files; each file holds one definition or
/// an array of them.
pub struct DirectoryApiSource {
    path: PathBuf,
}

impl DirectoryApiSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

fn json_files(dir: &Path) -> GatewayResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| GatewayError::Config {
        message: format!("Failed to read definition directory {:?}", dir),
        source: Some(Box::new(e)),
    })?;
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    files.sort();
    Ok(files)
}

#[async_trait]
impl ApiProvider for DirectoryApiSource {
    async fn fetch_apis(&self) -> GatewayResult<Vec<ApiDefinition>> {
        let mut defs = Vec::new();
        for file in json_files(&self.path)? {
            let raw = match std::fs::read_to_string(&file) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(file = ?file, error = %e, "Skipping unreadable definition file");
                    continue;
                }
            };
            // A file holds either one definition or an array of them
            let parsed: Result<Vec<ApiDefinition>, _> = serde_json::from_str(&raw)
                .or_else(|_| serde_json::from_str::<ApiDefinition>(&raw).map(|d| vec![d]));
            match parsed {
                Ok(mut file_defs) => {
                    info!(file = ?file, count = file_defs.len(), "Loaded API definitions");
                    defs.append(&mut file_defs);
                }
                Err(e) => {
                    warn!(file = ?file, error = %e, "Skipping unparseable definition file");
                }
            }
        }
        Ok(defs)
    }

    fn source_id(&self) -> String {
        format!("dir:{}", self.path.display())
    }
}

/// Directory (or single file) of policy JSON.
pub struct FilePolicySource {
    path: PathBuf,
}

impl FilePolicySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load_file(path: &Path) -> GatewayResult<HashMap<String, Policy>> {
        let raw = std::fs::read_to_string(path).map_err(|e| GatewayError::Config {
            message: format!("Failed to read policy file {:?}", path),
            source: Some(Box::new(e)),
        })?;
        let policies: HashMap<String, Policy> =
            serde_json::from_str(&raw).map_err(|e| GatewayError::Config {
                message: format!("Failed to parse policy file {:?}: {}", path, e),
                source: None,
            })?;
        Ok(policies)
    }
}

#[async_trait]
impl PolicyProvider for FilePolicySource {
    async fn fetch_policies(&self) -> GatewayResult<HashMap<String, Policy>> {
        if self.path.is_file() {
            let mut policies = Self::load_file(&self.path)?;
            for (id, policy) in policies.iter_mut() {
                if policy.id.is_empty() {
                    policy.id = id.clone();
                }
            }
            return Ok(policies);
        }

        let mut policies = HashMap::new();
        for file in json_files(&self.path)? {
            match std::fs::read_to_string(&file)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_str::<Policy>(&raw).map_err(|e| e.to_string()))
            {
                Ok(policy) if !policy.id.is_empty() => {
                    info!(file = ?file, policy_id = %policy.id, "Loaded policy");
                    policies.insert(policy.id.clone(), policy);
                }
                Ok(_) => {
                    warn!(file = ?file, "Skipping policy without an id");
                }
                Err(e) => {
                    warn!(file = ?file, error = %e, "Skipping unparseable policy file");
                }
            }
        }
        Ok(policies)
    }

    fn source_id(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// An empty policy source for deployments that run without policies.
pub struct NoPolicySource;

#[async_trait]
impl PolicyProvider for NoPolicySource {
    async fn fetch_policies(&self) -> GatewayResult<HashMap<String, Policy>> {
        Ok(HashMap::new())
    }

    fn source_id(&self) -> String {
        "none".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    fn def_json(api_id: &str) -> String {
        format!(
            r#"{{"api_id":"{}","name":"{}","listen_path":"/{}/",
                "target_urls":["http://127.0.0.1:8000/"]}}"#,
            api_id, api_id, api_id
        )
    }

    #[tokio::test]
    async fn directory_source_loads_valid_and_skips_broken() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "good.json", &def_json("good"));
        write_file(dir.path(), "broken.json", "{ not json at all");
        write_file(dir.path(), "ignored.txt", "not a json file");
        write_file(
            dir.path(),
            "many.json",
            &format!("[{},{}]", def_json("a"), def_json("b")),
        );

        let source = DirectoryApiSource::new(dir.path());
        let defs = source.fetch_apis().await.unwrap();

        let mut ids: Vec<&str> = defs.iter().map(|d| d.api_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "good"]);
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let source = DirectoryApiSource::new("/definitely/not/here");
        assert!(source.fetch_apis().await.is_err());
    }

    #[tokio::test]
    async fn policy_file_map_loads() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "policies.json",
            r#"{ "gold": { "rate": 100.0, "per": 60.0 },
                 "bronze": { "id": "bronze", "rate": 5.0, "per": 60.0 } }"#,
        );

        let source = FilePolicySource::new(dir.path().join("policies.json"));
        let policies = source.fetch_policies().await.unwrap();

        assert_eq!(policies.len(), 2);
        // Map key fills a missing id
        assert_eq!(policies["gold"].id, "gold");
        assert_eq!(policies["bronze"].rate, 5.0);
    }

    #[tokio::test]
    async fn policy_directory_skips_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "good.json",
            r#"{ "id": "good", "rate": 1.0, "per": 1.0 }"#,
        );
        write_file(dir.path(), "broken.json", "nope");

        let source = FilePolicySource::new(dir.path());
        let policies = source.fetch_policies().await.unwrap();
        assert_eq!(policies.len(), 1);
        assert!(policies.contains_key("good"));
    }
}
