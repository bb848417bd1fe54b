//! Bucket object API.
//!
//! [`BucketClient`] is the seam between the remote backend and the network.
//! [`HttpBucketClient`] talks to a data-proxy style bucket service; tests
//! substitute an in-memory implementation.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::{StorageError, StorageResult};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_LIMIT: usize = 9999;

/// One row of a delimiter listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BucketEntry {
    Object {
        key: String,
        size: u64,
        content_type: Option<String>,
        last_modified: Option<DateTime<Utc>>,
    },
    /// Common prefix, always ending in `/`.
    Prefix(String),
}

/// Object operations against one bucket. Every call carries the caller's
/// bearer token.
#[async_trait]
pub trait BucketClient: Send + Sync {
    /// Direct children of `prefix` (`""` for the bucket root, otherwise
    /// ending in `/`).
    async fn list(&self, token: &str, prefix: &str) -> StorageResult<Vec<BucketEntry>>;

    async fn get(&self, token: &str, key: &str) -> StorageResult<Bytes>;

    async fn put(&self, token: &str, key: &str, body: Bytes, content_type: &str)
    -> StorageResult<()>;

    async fn delete(&self, token: &str, key: &str) -> StorageResult<()>;

    /// Server side copy inside the bucket.
    async fn copy(&self, token: &str, key: &str, new_key: &str) -> StorageResult<()>;
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    objects: Vec<ListedObject>,
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    name: Option<String>,
    subdir: Option<String>,
    #[serde(default)]
    bytes: u64,
    last_modified: Option<String>,
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransferUrl {
    url: String,
}

/// `last_modified` arrives either as RFC 3339 or as a naive ISO timestamp.
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

impl ListedObject {
    /// Rows carrying neither a name nor a subdir are dropped.
    fn into_entry(self) -> Option<BucketEntry> {
        if let Some(subdir) = self.subdir {
            return Some(BucketEntry::Prefix(subdir));
        }
        let key = self.name?;
        Some(BucketEntry::Object {
            key,
            size: self.bytes,
            content_type: self.content_type,
            last_modified: self.last_modified.as_deref().and_then(parse_timestamp),
        })
    }
}

/// Percent-encode a key for use in a URL path, keeping `/` separators.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[derive(Clone, Debug)]
pub struct HttpBucketClient {
    http: Client,
    api_url: String,
    bucket: String,
}

impl HttpBucketClient {
    pub fn new(api_url: &str, bucket: &str, timeout: Duration) -> StorageResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| StorageError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.api_url, self.bucket, encode_key(key))
    }

    /// Send, retrying exactly once when the first attempt timed out.
    async fn send_with_retry<F>(&self, make_req: F) -> StorageResult<Response>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        match make_req().send().await {
            Ok(response) => Ok(response),
            Err(err) if err.is_timeout() => {
                warn!("bucket request timed out, retrying once");
                make_req()
                    .send()
                    .await
                    .map_err(|err| StorageError::Transport(err.to_string()))
            }
            Err(err) => Err(StorageError::Transport(err.to_string())),
        }
    }

    async fn handle_status(response: Response, what: &str) -> StorageResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "bucket request failed".to_string());
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                StorageError::Authorization(format!("{what}: {message}"))
            }
            StatusCode::NOT_FOUND => StorageError::NotFound(what.to_string()),
            _ => StorageError::Status {
                status: status.as_u16(),
                message,
            },
        })
    }

    async fn transfer_url(response: Response) -> StorageResult<String> {
        let body: TransferUrl = response
            .json()
            .await
            .map_err(|err| StorageError::Transport(err.to_string()))?;
        Ok(body.url)
    }
}

#[async_trait]
impl BucketClient for HttpBucketClient {
    async fn list(&self, token: &str, prefix: &str) -> StorageResult<Vec<BucketEntry>> {
        let url = format!("{}/{}", self.api_url, self.bucket);
        let limit = LIST_LIMIT.to_string();
        let response = self
            .send_with_retry(|| {
                self.http.get(&url).bearer_auth(token).query(&[
                    ("limit", limit.as_str()),
                    ("delimiter", "/"),
                    ("prefix", prefix),
                ])
            })
            .await?;
        let response = Self::handle_status(response, &format!("prefix `{prefix}`")).await?;
        let listing: ListResponse = response
            .json()
            .await
            .map_err(|err| StorageError::Transport(err.to_string()))?;
        debug!(prefix, entries = listing.objects.len(), "listed bucket prefix");
        Ok(listing.objects.into_iter().filter_map(ListedObject::into_entry).collect())
    }

    async fn get(&self, token: &str, key: &str) -> StorageResult<Bytes> {
        let url = self.object_url(key);
        let response = self
            .send_with_retry(|| {
                self.http
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("inline", "false"), ("redirect", "false")])
            })
            .await?;
        let response = Self::handle_status(response, &format!("object `{key}`")).await?;
        let download = Self::transfer_url(response).await?;

        let response = self.send_with_retry(|| self.http.get(&download)).await?;
        let response = Self::handle_status(response, &format!("object `{key}`")).await?;
        response
            .bytes()
            .await
            .map_err(|err| StorageError::Transport(err.to_string()))
    }

    async fn put(
        &self,
        token: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> StorageResult<()> {
        let url = self.object_url(key);
        let response = self
            .send_with_retry(|| self.http.put(&url).bearer_auth(token))
            .await?;
        let response = Self::handle_status(response, &format!("object `{key}`")).await?;
        let upload = Self::transfer_url(response).await?;

        let response = self
            .send_with_retry(|| {
                self.http
                    .put(&upload)
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(body.clone())
            })
            .await?;
        Self::handle_status(response, &format!("object `{key}`")).await?;
        debug!(key, bytes = body.len(), "uploaded object");
        Ok(())
    }

    async fn delete(&self, token: &str, key: &str) -> StorageResult<()> {
        let url = self.object_url(key);
        let response = self
            .send_with_retry(|| self.http.delete(&url).bearer_auth(token))
            .await?;
        Self::handle_status(response, &format!("object `{key}`")).await?;
        Ok(())
    }

    async fn copy(&self, token: &str, key: &str, new_key: &str) -> StorageResult<()> {
        let url = format!("{}/copy", self.object_url(key));
        let response = self
            .send_with_retry(|| {
                self.http
                    .put(&url)
                    .bearer_auth(token)
                    .query(&[("to", self.bucket.as_str()), ("name", new_key)])
            })
            .await?;
        Self::handle_status(response, &format!("object `{key}`")).await?;
        Ok(())
    }
}
