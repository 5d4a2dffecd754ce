//! Saved registry credentials.
//!
//! Reads the engine's user-scoped configuration file
//! (`~/.docker/config.json`), which `docker login` maintains:
//!
//! ```json
//! { "auths": { "docker.mycompany.com": { "auth": "Zaoiqw0==" } } }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Credentials for one registry, as stored by `docker login`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    /// The `auths` key the token was found under.
    pub registry: String,
    /// Base64 `user:password` token.
    pub token: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("cannot determine the user home directory for the Docker config")]
    HomeNotFound,

    #[error("cannot read Docker configuration {path}; run `docker login <registry>`: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse Docker configuration {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("cannot find registry '{0}' in the Docker config; run `docker login <registry>` before building")]
    NotFound(String),

    #[error("Docker config entry for '{0}' has no auth token; run `docker login <registry>` again")]
    MissingToken(String),
}

#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
}

#[derive(Debug, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
}

/// Read-only view of a Docker configuration file.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The current user's `~/.docker/config.json`.
    pub fn user_default() -> Result<Self, CredentialError> {
        let home = dirs::home_dir().ok_or(CredentialError::HomeNotFound)?;
        Ok(Self::new(home.join(".docker").join("config.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Find the saved token for `registry_url`.
    ///
    /// The first `auths` key (in key order) containing the registry URL,
    /// without its scheme, is used.
    pub async fn lookup(&self, registry_url: &str) -> Result<RegistryAuth, CredentialError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| CredentialError::Read {
                path: self.path.clone(),
                source,
            })?;
        find_auth(&text, registry_url).map_err(|e| match e {
            LookupError::Parse(message) => CredentialError::Parse {
                path: self.path.clone(),
                message,
            },
            LookupError::Credential(e) => e,
        })
    }
}

enum LookupError {
    Parse(String),
    Credential(CredentialError),
}

fn find_auth(config_text: &str, registry_url: &str) -> Result<RegistryAuth, LookupError> {
    let config: DockerConfig =
        serde_json::from_str(config_text).map_err(|e| LookupError::Parse(e.to_string()))?;

    let needle = registry_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');

    let (key, entry) = config
        .auths
        .iter()
        .find(|(key, _)| key.contains(needle))
        .ok_or_else(|| LookupError::Credential(CredentialError::NotFound(needle.to_string())))?;

    let token = entry
        .auth
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| LookupError::Credential(CredentialError::MissingToken(key.clone())))?;

    Ok(RegistryAuth {
        registry: key.clone(),
        token: token.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const CONFIG: &str = r#"{
        "auths": {
            "https://docker.mycompany.com": { "auth": "Zaoiqw0==" },
            "other.example.com": { "username": "me" }
        }
    }"#;

    fn store_with(contents: &str) -> (tempfile::TempDir, CredentialStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, contents).expect("write config");
        (dir, CredentialStore::new(path))
    }

    #[tokio::test]
    async fn finds_token_by_substring() {
        let (_dir, store) = store_with(CONFIG);
        let auth = store.lookup("docker.mycompany.com").await.expect("lookup");
        assert_eq!(auth.token, "Zaoiqw0==");
        assert_eq!(auth.registry, "https://docker.mycompany.com");
    }

    #[tokio::test]
    async fn scheme_on_registry_url_is_ignored() {
        let (_dir, store) = store_with(CONFIG);
        let auth = store.lookup("https://docker.mycompany.com/").await.expect("lookup");
        assert_eq!(auth.token, "Zaoiqw0==");
    }

    #[tokio::test]
    async fn unknown_registry_is_not_found() {
        let (_dir, store) = store_with(CONFIG);
        assert_matches!(
            store.lookup("registry.nowhere.io").await,
            Err(CredentialError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn entry_without_token_is_rejected() {
        let (_dir, store) = store_with(CONFIG);
        assert_matches!(
            store.lookup("other.example.com").await,
            Err(CredentialError::MissingToken(_))
        );
    }

    #[tokio::test]
    async fn missing_file_is_read_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CredentialStore::new(dir.path().join("absent.json"));
        assert_matches!(
            store.lookup("docker.mycompany.com").await,
            Err(CredentialError::Read { .. })
        );
    }

    #[tokio::test]
    async fn malformed_file_is_parse_error() {
        let (_dir, store) = store_with("{ nope");
        assert_matches!(
            store.lookup("docker.mycompany.com").await,
            Err(CredentialError::Parse { .. })
        );
    }
}
