//! Content-addressed store client.
//!
//! [`ContentStore`] is the boundary to the storage network: bytes in,
//! address out, and back. [`HttpContentStore`] talks to an IPFS-compatible
//! HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use ledgerchat_shared::types::ContentAddress;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContentError {
    /// The network could not be reached or failed server-side.
    #[error("Content store unavailable: {0}")]
    Unavailable(String),

    #[error("Content not found: {0}")]
    NotFound(ContentAddress),

    #[error("Invalid content store response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put(&self, bytes: &[u8]) -> Result<ContentAddress, ContentError>;
    async fn get(&self, address: &ContentAddress) -> Result<Vec<u8>, ContentError>;
}

/// Response body of `/api/v0/add`.
#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

/// Client for the IPFS HTTP API (`/api/v0/add`, `/api/v0/cat`).
#[derive(Debug, Clone)]
pub struct HttpContentStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpContentStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ContentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ContentError::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v0/{}", self.base_url, path)
    }
}

fn transport_error(e: reqwest::Error) -> ContentError {
    ContentError::Unavailable(e.to_string())
}

#[async_trait]
impl ContentStore for HttpContentStore {
    async fn put(&self, bytes: &[u8]) -> Result<ContentAddress, ContentError> {
        let part = reqwest::multipart::Part::bytes(bytes.to_vec()).file_name("blob");
        let form = reqwest::multipart::Form::new().part("file", part);

        let resp = self
            .client
            .post(self.endpoint("add"))
            .query(&[("pin", "true")])
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            warn!(%status, "content store rejected add");
            return Err(ContentError::Unavailable(format!("add returned {status}")));
        }

        let body: AddResponse = resp
            .json()
            .await
            .map_err(|e| ContentError::InvalidResponse(e.to_string()))?;

        debug!(address = %body.hash, size = bytes.len(), "content stored");
        Ok(ContentAddress::new(body.hash))
    }

    async fn get(&self, address: &ContentAddress) -> Result<Vec<u8>, ContentError> {
        let resp = self
            .client
            .post(self.endpoint("cat"))
            .query(&[("arg", address.as_str())])
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if status.is_success() {
            let bytes = resp.bytes().await.map_err(transport_error)?;
            return Ok(bytes.to_vec());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(cat_failure(address, status, &body))
    }
}

fn cat_failure(address: &ContentAddress, status: StatusCode, body: &str) -> ContentError {
    if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
        return ContentError::NotFound(address.clone());
    }
    if status.is_client_error() {
        return ContentError::InvalidResponse(format!("cat returned {status}"));
    }
    // Kubo answers unknown or malformed CIDs with a 500 carrying a message.
    let body = body.to_lowercase();
    if body.contains("not found") || body.contains("invalid cid") || body.contains("invalid path") {
        return ContentError::NotFound(address.clone());
    }
    ContentError::Unavailable(format!("cat returned {status}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_trims_trailing_slash() {
        let store = HttpContentStore::new("http://localhost:5001/", Duration::from_secs(1)).unwrap();
        assert_eq!(store.base_url(), "http://localhost:5001");
        assert_eq!(store.endpoint("add"), "http://localhost:5001/api/v0/add");
    }

    #[test]
    fn only_missing_content_is_not_found() {
        let address = ContentAddress::new("bafyabc");
        assert!(matches!(
            cat_failure(&address, StatusCode::NOT_FOUND, ""),
            ContentError::NotFound(_)
        ));
        assert!(matches!(
            cat_failure(&address, StatusCode::GONE, ""),
            ContentError::NotFound(_)
        ));
        for status in [
            StatusCode::UNAUTHORIZED,
            StatusCode::FORBIDDEN,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_REQUEST,
        ] {
            assert!(matches!(
                cat_failure(&address, status, "not found"),
                ContentError::InvalidResponse(_)
            ));
        }
        assert!(matches!(
            cat_failure(&address, StatusCode::INTERNAL_SERVER_ERROR, "invalid CID: bad"),
            ContentError::NotFound(_)
        ));
        assert!(matches!(
            cat_failure(&address, StatusCode::BAD_GATEWAY, ""),
            ContentError::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_unavailable() {
        // Port 9 (discard) is closed on test hosts; the connection is refused.
        let store = HttpContentStore::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();

        assert!(matches!(
            store.put(b"payload").await,
            Err(ContentError::Unavailable(_))
        ));
        assert!(matches!(
            store.get(&ContentAddress::new("QmMissing")).await,
            Err(ContentError::Unavailable(_))
        ));
    }
}
