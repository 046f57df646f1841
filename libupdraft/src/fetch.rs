// Copyright © 2022 The Updraft Contributors
//
// This file is part of updraft, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! The injected transport capability.
//!
//! The pipeline implements per-peer fallback on top of this primitive;
//! retry, backoff and TLS policy belong to the implementation behind it.

use std::io;

use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("request timed out")]
    Timeout,

    #[error("unsupported url scheme `{0}`")]
    UnsupportedScheme(String),

    #[error("invalid url `{0}`")]
    InvalidUrl(Url),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("transport error")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Perform a GET, return the body bytes or an error.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn get(&self, url: &Url) -> Result<Vec<u8>, Error>;
}

#[async_trait]
impl<T> Fetch for &T
where
    T: Fetch + ?Sized,
{
    async fn get(&self, url: &Url) -> Result<Vec<u8>, Error> {
        (**self).get(url).await
    }
}

/// Resolves `file://` URLs against the local filesystem.
///
/// Used by tests and by deployments whose mirrors are synced out-of-band to
/// a local path.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileFetcher;

#[async_trait]
impl Fetch for FileFetcher {
    async fn get(&self, url: &Url) -> Result<Vec<u8>, Error> {
        if url.scheme() != "file" {
            return Err(Error::UnsupportedScheme(url.scheme().to_string()));
        }
        let path = url
            .to_file_path()
            .map_err(|()| Error::InvalidUrl(url.clone()))?;
        Ok(std::fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write as _;

    #[tokio::test]
    async fn test_file_fetcher_reads_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"over the wire").unwrap();

        let url = Url::from_file_path(&path).unwrap();
        let body = FileFetcher.get(&url).await.unwrap();
        assert_eq!(body, b"over the wire");
    }

    #[tokio::test]
    async fn test_file_fetcher_rejects_other_schemes() {
        let url = Url::parse("https://mirror.example/updates/1").unwrap();
        assert!(matches!(
            FileFetcher.get(&url).await,
            Err(Error::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_file_path(dir.path().join("nope")).unwrap();
        assert!(matches!(FileFetcher.get(&url).await, Err(Error::Io(_))));
    }
}
