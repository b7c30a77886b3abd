use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::{ParseError, Url};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Remote(Url),
    Local(PathBuf),
}

impl SourceLocation {
    /// Accepts http(s) and file URLs plus absolute filesystem paths. Anything
    /// without a usable path component is rejected.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        match Url::parse(value) {
            Ok(url) => match url.scheme() {
                "http" | "https" => {
                    if url.host_str().is_none() || url.path().is_empty() || url.path() == "/" {
                        return None;
                    }
                    Some(SourceLocation::Remote(url))
                }
                "file" => {
                    let path = url.to_file_path().ok()?;
                    if path.file_name().is_none() {
                        return None;
                    }
                    Some(SourceLocation::Local(path))
                }
                _ => None,
            },
            Err(ParseError::RelativeUrlWithoutBase) if value.starts_with('/') => {
                let path = PathBuf::from(value);
                path.file_name()?;
                Some(SourceLocation::Local(path))
            }
            Err(_) => None,
        }
    }

    /// Extension of the source path, used when building public image names.
    pub fn extension(&self) -> Option<String> {
        let path = match self {
            SourceLocation::Remote(url) => Path::new(url.path()).to_path_buf(),
            SourceLocation::Local(path) => path.clone(),
        };
        path.extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty())
            .map(|ext| ext.to_string())
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceLocation::Remote(url) => write!(f, "{url}"),
            SourceLocation::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source fetch from {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("source fetch from {url} failed: {status}")]
    UpstreamStatus { url: String, status: StatusCode },
    #[error("source {source_location} exceeds {max_bytes} bytes")]
    TooLarge {
        source_location: String,
        max_bytes: u64,
    },
    #[error("failed to read source {}", path.display())]
    Local {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write transient file {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Origin store collaborator: copies the source bytes into `destination`
/// and returns the number of bytes written.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source: &SourceLocation, destination: &Path) -> Result<u64, FetchError>;
}

#[derive(Clone)]
pub struct OriginFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl OriginFetcher {
    pub fn new(timeout: Duration, max_bytes: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(concat!("image-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build reqwest client")?;
        Ok(Self { client, max_bytes })
    }

    async fn fetch_remote(&self, url: &Url, destination: &Path) -> Result<u64, FetchError> {
        let request_error = |source| FetchError::Request {
            url: url.to_string(),
            source,
        };
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(request_error)?;
        if response.status() != StatusCode::OK {
            return Err(FetchError::UpstreamStatus {
                url: url.to_string(),
                status: response.status(),
            });
        }
        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(self.too_large(url.as_str()));
            }
        }
        let write_error = |source| FetchError::Write {
            path: destination.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(write_error)?;
        let mut total = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(request_error)? {
            total = total.saturating_add(chunk.len() as u64);
            if total > self.max_bytes {
                return Err(self.too_large(url.as_str()));
            }
            file.write_all(&chunk).await.map_err(write_error)?;
        }
        file.flush().await.map_err(write_error)?;
        debug!(url = %url, size = total, "fetched remote source");
        Ok(total)
    }

    async fn fetch_local(&self, path: &Path, destination: &Path) -> Result<u64, FetchError> {
        let local_error = |source| FetchError::Local {
            path: path.to_path_buf(),
            source,
        };
        let metadata = tokio::fs::metadata(path).await.map_err(local_error)?;
        if !metadata.is_file() {
            return Err(local_error(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "source is not a regular file",
            )));
        }
        if metadata.len() > self.max_bytes {
            return Err(self.too_large(&path.display().to_string()));
        }
        let copied = tokio::fs::copy(path, destination)
            .await
            .map_err(local_error)?;
        debug!(path = %path.display(), size = copied, "copied local source");
        Ok(copied)
    }

    fn too_large(&self, source_location: &str) -> FetchError {
        FetchError::TooLarge {
            source_location: source_location.to_string(),
            max_bytes: self.max_bytes,
        }
    }
}

#[async_trait]
impl SourceFetcher for OriginFetcher {
    async fn fetch(&self, source: &SourceLocation, destination: &Path) -> Result<u64, FetchError> {
        match source {
            SourceLocation::Remote(url) => self.fetch_remote(url, destination).await,
            SourceLocation::Local(path) => self.fetch_local(path, destination).await,
        }
    }
}
