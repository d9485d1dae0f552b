//! Loaders that read values from configured origins.
//!
//! A [`SourceConfig`] describes where the values of a group live. It is turned into a
//! [`Loader`] with [`SourceConfig::into_loader`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::group::Loader;

/// The origin of a group's values.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Every key is a file in `path`.
    Filesystem { path: PathBuf },
    /// Every key is fetched from `url` with the key appended as the last path segment.
    Http { url: Url },
}

impl SourceConfig {
    /// Builds the loader for this source. `client` is used by http sources.
    pub fn into_loader(self, client: Client) -> Arc<dyn Loader> {
        match self {
            Self::Filesystem { path } => Arc::new(FilesystemLoader::new(path)),
            Self::Http { url } => Arc::new(HttpLoader::new(client, url)),
        }
    }
}

/// An error loading a value from a source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The source has no value for the key.
    #[error("not found")]
    NotFound,
    /// Reading from the filesystem failed.
    #[error("io error: {0}")]
    Io(String),
    /// The upstream server could not be reached or returned an error.
    #[error("http error: {0}")]
    Http(String),
}

impl From<io::Error> for SourceError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            _ => Self::Io(err.to_string()),
        }
    }
}

impl SourceError {
    /// Whether `err` is a [`SourceError::NotFound`] returned by a loader.
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<SourceError>(), Some(SourceError::NotFound))
    }
}

/// Reads values from files in a directory.
#[derive(Debug)]
pub struct FilesystemLoader {
    root: PathBuf,
}

impl FilesystemLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves `key` to a file directly inside the root directory.
    ///
    /// Keys that would escape the root are reported as missing.
    fn path_for(&self, key: &str) -> Result<PathBuf, SourceError> {
        if key.contains(['/', '\\']) || key == "." || key == ".." {
            return Err(SourceError::NotFound);
        }
        Ok(self.root.join(key))
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>, SourceError> {
        let path = self.path_for(key)?;
        tracing::debug!(path = %path.display(), "Reading value from file");
        Ok(tokio::fs::read(&path).await?)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Loader for FilesystemLoader {
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<u8>>> {
        Box::pin(async move { Ok(self.read(key).await?) })
    }
}

/// Fetches values from an upstream HTTP server.
#[derive(Debug)]
pub struct HttpLoader {
    client: Client,
    base_url: Url,
}

impl HttpLoader {
    pub fn new(client: Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    fn url_for(&self, key: &str) -> Result<Url, SourceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::Http(format!("invalid source URL `{}`", self.base_url)))?
            .pop_if_empty()
            .push(key);
        Ok(url)
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>, SourceError> {
        let url = self.url_for(key)?;
        tracing::debug!(%url, "Fetching value from upstream");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::Http(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound);
        }
        if !status.is_success() {
            tracing::debug!(%status, "Unexpected status code from upstream");
            return Err(SourceError::Http(status.to_string()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SourceError::Http(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

impl Loader for HttpLoader {
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<u8>>> {
        Box::pin(async move { Ok(self.fetch(key).await?) })
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::extract::Path as UrlPath;
    use axum::http::StatusCode as HttpStatus;
    use axum::routing::get;

    use super::*;
    use crate::test;

    #[tokio::test]
    async fn test_filesystem_loader() {
        test::setup();
        let dir = test::tempdir();
        std::fs::write(dir.path().join("Tom"), b"630").unwrap();

        let loader = FilesystemLoader::new(dir.path());
        assert_eq!(loader.load("Tom").await.unwrap(), b"630");

        let err = loader.load("Jack").await.unwrap_err();
        assert!(SourceError::is_not_found(&err));
    }

    #[tokio::test]
    async fn test_filesystem_loader_stays_in_root() {
        test::setup();
        let dir = test::tempdir();
        let inner = dir.path().join("inner");
        std::fs::create_dir(&inner).unwrap();
        std::fs::write(dir.path().join("secret"), b"nope").unwrap();

        let loader = FilesystemLoader::new(&inner);
        for key in ["../secret", "..", "a\\b", "/etc/passwd"] {
            let err = loader.load(key).await.unwrap_err();
            assert!(SourceError::is_not_found(&err), "{key}");
        }
    }

    fn upstream() -> Router {
        Router::new().route(
            "/users/:key",
            get(|UrlPath(key): UrlPath<String>| async move {
                match key.as_str() {
                    "missing" => (HttpStatus::NOT_FOUND, String::new()),
                    "broken" => (HttpStatus::BAD_GATEWAY, String::new()),
                    key => (HttpStatus::OK, format!("user {key}")),
                }
            }),
        )
    }

    #[tokio::test]
    async fn test_http_loader() {
        test::setup();
        let server = test::Server::with_router(upstream());
        let loader = SourceConfig::Http {
            url: server.url("/users/"),
        }
        .into_loader(Client::new());

        assert_eq!(loader.load("Tom").await.unwrap(), b"user Tom");
        assert_eq!(loader.load("a b").await.unwrap(), b"user a b");

        let err = loader.load("missing").await.unwrap_err();
        assert!(SourceError::is_not_found(&err));

        let err = loader.load("broken").await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<SourceError>(),
            Some(&SourceError::Http("502 Bad Gateway".into()))
        );
    }

    #[tokio::test]
    async fn test_http_loader_without_trailing_slash() {
        test::setup();
        let server = test::Server::with_router(upstream());
        let loader = HttpLoader::new(Client::new(), server.url("/users"));

        assert_eq!(loader.load("Sam").await.unwrap(), b"user Sam");
    }
}
