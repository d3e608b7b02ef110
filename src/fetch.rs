//! Remote document fetching.
//!
//! The cache never downloads anything itself; callers pair this fetcher with
//! `ContentCache::get_or_fetch`.

use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::cache::Payload;
use crate::config::FetchConfig;

/// Filename used when a URL has no usable last path segment.
pub const FALLBACK_FILENAME: &str = "document.pdf";

#[derive(Error, Debug)]
pub enum FetchError {
  #[error("Invalid locator {locator}: {source}")]
  InvalidLocator {
    locator: String,
    #[source]
    source: url::ParseError,
  },

  #[error("Failed to build HTTP client: {0}")]
  Client(#[source] reqwest::Error),

  #[error("Request to {url} failed: {source}")]
  Request {
    url: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("{url} returned HTTP {status}")]
  Status {
    url: String,
    status: reqwest::StatusCode,
  },
}

/// A downloaded document.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
  pub filename: String,
  pub bytes: Vec<u8>,
}

impl From<FetchedDocument> for Payload {
  fn from(doc: FetchedDocument) -> Self {
    Payload::Blob {
      filename: doc.filename,
      bytes: doc.bytes,
    }
  }
}

/// HTTP client for paper downloads
#[derive(Clone)]
pub struct DocumentFetcher {
  client: reqwest::Client,
}

impl DocumentFetcher {
  pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .user_agent(config.user_agent.as_str())
      .build()
      .map_err(FetchError::Client)?;

    Ok(Self { client })
  }

  /// Download `locator`. Anything other than a 2xx response is an error.
  pub async fn fetch(&self, locator: &str) -> Result<FetchedDocument, FetchError> {
    let url = Url::parse(locator).map_err(|source| FetchError::InvalidLocator {
      locator: locator.to_string(),
      source,
    })?;
    let filename = filename_for(&url);

    tracing::info!("Downloading {}", url);
    let response = self
      .client
      .get(url.clone())
      .send()
      .await
      .map_err(|source| FetchError::Request {
        url: url.to_string(),
        source,
      })?;

    let status = response.status();
    if !status.is_success() {
      return Err(FetchError::Status {
        url: url.to_string(),
        status,
      });
    }

    let bytes = response.bytes().await.map_err(|source| FetchError::Request {
      url: url.to_string(),
      source,
    })?;
    tracing::debug!("Downloaded {} bytes from {}", bytes.len(), url);

    Ok(FetchedDocument {
      filename,
      bytes: bytes.to_vec(),
    })
  }
}

/// Last non-empty path segment of `url`, or [`FALLBACK_FILENAME`].
pub fn filename_for(url: &Url) -> String {
  url
    .path_segments()
    .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
    .map(String::from)
    .unwrap_or_else(|| FALLBACK_FILENAME.to_string())
}
