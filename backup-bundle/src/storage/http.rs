//! Storage backed by the backup server's file API.
//!
//! Objects live in a namespace (the server's job id); keys are sent as the
//! relative path. Uploads are streamed, never buffered whole in memory.
//!
//! Only `POST /api/files/upload` exists on the stock backup server. The
//! copy, object and list routes used by `copy_entry`, `read`, `download_to`
//! and `list` (`/api/files/copy`, `/api/files/object`, `/api/files/list`)
//! must be provided by the server this storage talks to; against a stock
//! server they fail with a `Storage` error carrying the HTTP status.

use super::{Storage, UploadReader};
use crate::transfer::progress_stream::ProgressStream;
use crate::utils::{BundleError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct HttpStorage {
    client: reqwest::Client,
    server_url: String,
    namespace: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    keys: Vec<String>,
}

impl HttpStorage {
    pub fn new(server_url: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            namespace: namespace.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = if token.is_empty() { None } else { Some(token) };
        self
    }

    fn url(&self, route: &str) -> String {
        format!("{}/api/files/{}", self.server_url, route)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(BundleError::Storage(format!(
            "{} failed with status {}: {}",
            what, status, error_text
        )))
    }
}

#[async_trait]
impl Storage for HttpStorage {
    async fn upload(&self, key: &str, reader: UploadReader, size: u64) -> Result<()> {
        let object = key.to_string();
        let stream = ProgressStream::new(ReaderStream::new(reader), size).with_callback(Arc::new(
            move |done, total| debug!("Uploading {}: {}/{} bytes", object, done, total),
        ));
        let counter = stream.counter();

        let request = self
            .client
            .post(self.url("upload"))
            .header("x-job-id", &self.namespace)
            .header("x-relative-path", key)
            .header("x-total-size", size.to_string())
            .header("content-type", "application/octet-stream")
            .body(reqwest::Body::wrap_stream(stream));

        let response = self.authorize(request).send().await?;
        Self::check(response, &format!("upload of {}", key)).await?;

        let sent = counter.load(Ordering::Relaxed);
        if sent != size {
            return Err(BundleError::Storage(format!(
                "short upload for {}: expected {} bytes, sent {}",
                key, size, sent
            )));
        }

        info!("Uploaded {} bytes: {}", size, key);
        Ok(())
    }

    async fn copy_entry(&self, from: &str, to: &str) -> Result<()> {
        let body = serde_json::json!({
            "job_id": self.namespace,
            "from": from,
            "to": to,
        });
        let request = self.client.post(self.url("copy")).json(&body);
        let response = self.authorize(request).send().await?;
        Self::check(response, &format!("copy of {} to {}", from, to)).await?;
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let request = self
            .client
            .get(self.url("object"))
            .query(&[("job_id", self.namespace.as_str()), ("path", key)]);
        let response = self.authorize(request).send().await?;
        let response = Self::check(response, &format!("read of {}", key)).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn download_to(&self, key: &str, dest: &Path) -> Result<()> {
        let request = self
            .client
            .get(self.url("object"))
            .query(&[("job_id", self.namespace.as_str()), ("path", key)]);
        let response = self.authorize(request).send().await?;
        let response = Self::check(response, &format!("download of {}", key)).await?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let request = self
            .client
            .get(self.url("list"))
            .query(&[("job_id", self.namespace.as_str()), ("prefix", prefix)]);
        let response = self.authorize(request).send().await?;
        let response = Self::check(response, &format!("listing of {}", prefix)).await?;
        let mut keys = response.json::<ListResponse>().await?.keys;
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let storage = HttpStorage::new("http://localhost:3000/", "db-main");
        assert_eq!(storage.url("upload"), "http://localhost:3000/api/files/upload");
        assert_eq!(storage.namespace, "db-main");
    }

    #[test]
    fn test_empty_token_is_ignored() {
        let storage = HttpStorage::new("http://localhost:3000", "db").with_token("");
        assert!(storage.token.is_none());
        let storage = storage.with_token("secret");
        assert_eq!(storage.token.as_deref(), Some("secret"));
    }
}
