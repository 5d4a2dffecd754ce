//! HTTP reachability checks and downloads.

use std::path::Path;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("cannot write {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// Capability to query remote URLs.
#[async_trait]
pub trait UrlProbe: Send + Sync {
    /// HTTP status code returned by a GET of `url`.
    async fn status(&self, url: &str) -> Result<u16, ProbeError>;

    /// Save the body of a GET of `url` to `dest`.
    async fn download(&self, url: &str, dest: &Path) -> Result<(), ProbeError>;
}

/// [`UrlProbe`] backed by a shared `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UrlProbe for HttpProbe {
    async fn status(&self, url: &str) -> Result<u16, ProbeError> {
        let response = self.client.get(url).send().await.map_err(|e| request_error(url, e))?;
        Ok(response.status().as_u16())
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), ProbeError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| request_error(url, e))?;
        let body = response.bytes().await.map_err(|e| request_error(url, e))?;
        tokio::fs::write(dest, &body)
            .await
            .map_err(|source| ProbeError::Io {
                path: dest.display().to_string(),
                source,
            })
    }
}

fn request_error(url: &str, e: reqwest::Error) -> ProbeError {
    ProbeError::Request {
        url: url.to_string(),
        message: e.to_string(),
    }
}

/// Reason a user-supplied URL was refused before probing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("The {setting} must have TLS enabled. Provide the url with 'https' instead of 'http'.")]
pub struct InsecureUrl {
    pub setting: &'static str,
}

/// Normalise a mirror or registry URL for probing.
///
/// Plain `http://` is refused. A URL without `https://` gets it prepended.
pub fn probe_url(raw: &str, setting: &'static str) -> Result<String, InsecureUrl> {
    let raw = raw.trim();
    if raw.contains("http://") {
        return Err(InsecureUrl { setting });
    }
    if raw.contains("https://") {
        Ok(raw.to_string())
    } else {
        Ok(format!("https://{raw}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_gets_https() {
        assert_eq!(
            probe_url("registry.example.com", "registry URL").unwrap(),
            "https://registry.example.com"
        );
    }

    #[test]
    fn https_is_kept() {
        assert_eq!(
            probe_url("https://mirror.example.com/repo", "mirror URL").unwrap(),
            "https://mirror.example.com/repo"
        );
    }

    #[test]
    fn plain_http_is_refused() {
        let err = probe_url("http://mirror.example.com", "mirror URL").unwrap_err();
        assert_eq!(err.setting, "mirror URL");
        assert!(err.to_string().contains("TLS"));
    }
}
