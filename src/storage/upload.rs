//! Resumable object upload client.
//!
//! Implements the storage service's resumable upload protocol:
//!
//! 1. A `POST ...?uploadType=resumable` opens a session; the session URI is
//!    returned in the `Location` header.
//! 2. Chunks are `PUT` to the session URI with a `Content-Range` header.
//!    A 308 response means "keep going"; its `Range` header states how much
//!    the service has committed. 200/201 means the object is complete.
//!
//! Progress only advances to what the service confirms, so a lost connection
//! costs at most one chunk of retransmission.

use serde::Serialize;
use std::io::Read;
use std::sync::Arc;

use super::content_type::content_type_for;
use super::slice::StreamSlice;
use super::ByteStream;
use crate::error::UploadError;
use crate::http::{HttpRequest, HttpResponse, HttpTransport, RetryPolicy};

/// Default bytes per chunk (512 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResource<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<&'a str>,
}

/// A single object upload.
pub struct ResumableUpload {
    transport: Arc<dyn HttpTransport>,
    retry: RetryPolicy,
    upload_url: String,
    bucket: String,
    object_name: String,
    cache_control: Option<String>,
    chunk_size: u64,

    // Session state
    session_uri: Option<String>,
    bytes_confirmed: u64,
}

impl ResumableUpload {
    /// Creates an upload of `object_name` into `bucket`.
    ///
    /// `upload_url` is the storage upload API base, e.g.
    /// `https://www.googleapis.com/upload/storage/v1`.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        upload_url: impl Into<String>,
        bucket: impl Into<String>,
        object_name: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            retry: RetryPolicy::default(),
            upload_url: upload_url.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            object_name: object_name.into(),
            cache_control: None,
            chunk_size: DEFAULT_CHUNK_SIZE as u64,
            session_uri: None,
            bytes_confirmed: 0,
        }
    }

    pub fn with_cache_control(mut self, cache_control: Option<String>) -> Self {
        self.cache_control = cache_control;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1) as u64;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    /// Session URI, once initiated.
    pub fn session_uri(&self) -> Option<&str> {
        self.session_uri.as_deref()
    }

    /// Offset up to which the service has committed data.
    pub fn bytes_confirmed(&self) -> u64 {
        self.bytes_confirmed
    }

    /// Content type declared for the object.
    pub fn content_type(&self) -> &'static str {
        content_type_for(&self.object_name)
    }

    /// Uploads the whole stream and returns the final object resource body.
    pub async fn upload(&mut self, stream: &mut ByteStream) -> Result<Vec<u8>, UploadError> {
        tracing::info!(
            bucket = %self.bucket,
            object = %self.object_name,
            size = stream.size(),
            "Starting resumable upload"
        );
        loop {
            if let Some(body) = self.next_chunk(stream).await? {
                tracing::info!(
                    bucket = %self.bucket,
                    object = %self.object_name,
                    "Upload complete"
                );
                return Ok(body);
            }
        }
    }

    /// Sends the next chunk. Returns the completion body once the service
    /// reports the object complete, `None` while more chunks are needed.
    pub async fn next_chunk(
        &mut self,
        stream: &mut ByteStream,
    ) -> Result<Option<Vec<u8>>, UploadError> {
        let size = stream.size();
        let session_uri = match self.session_uri.clone() {
            Some(uri) => uri,
            None => {
                let uri = self.initiate(size).await?;
                self.session_uri = Some(uri.clone());
                uri
            }
        };

        let start = self.bytes_confirmed;
        let (content_range, body) = if size == 0 {
            ("bytes */0".to_string(), Vec::new())
        } else {
            let chunk_end = (start + self.chunk_size - 1).min(size - 1);
            let mut body = Vec::with_capacity((chunk_end + 1 - start) as usize);
            StreamSlice::new(stream, start, self.chunk_size)?.read_to_end(&mut body)?;
            (format!("bytes {start}-{chunk_end}/{size}"), body)
        };

        let request = HttpRequest::put(&session_uri)
            .with_header("Content-Range", content_range)
            .with_header("Content-Length", body.len().to_string())
            .with_body(body);
        let transport = &self.transport;
        let response = self
            .retry
            .execute(|| transport.send(request.clone()))
            .await?;

        match response.status {
            200 | 201 => Ok(Some(response.body)),
            308 => {
                self.record_progress(&response, size)?;
                tracing::debug!(
                    object = %self.object_name,
                    confirmed = self.bytes_confirmed,
                    size,
                    "Chunk accepted"
                );
                Ok(None)
            }
            status => Err(UploadError::Protocol {
                object: self.object_name.clone(),
                status,
                offset: start,
            }),
        }
    }

    async fn initiate(&self, size: u64) -> Result<String, UploadError> {
        let resource = ObjectResource {
            name: &self.object_name,
            cache_control: self.cache_control.as_deref(),
        };
        let body = serde_json::to_vec(&resource).map_err(std::io::Error::from)?;
        let request = HttpRequest::post(format!("{}/b/{}/o", self.upload_url, self.bucket))
            .with_query("uploadType", "resumable")
            .with_header("Content-Type", "application/json; charset=UTF-8")
            .with_header("X-Upload-Content-Type", self.content_type())
            .with_header("X-Upload-Content-Length", size.to_string())
            .with_body(body);

        let transport = &self.transport;
        let response = self
            .retry
            .execute(|| transport.send(request.clone()))
            .await?;
        if !response.is_success() {
            return Err(UploadError::Initiation {
                object: self.object_name.clone(),
                status: response.status,
            });
        }

        let uri = response
            .header("Location")
            .ok_or_else(|| UploadError::MissingSessionUri {
                object: self.object_name.clone(),
            })?
            .to_string();
        tracing::debug!(object = %self.object_name, session = %uri, "Upload session opened");
        Ok(uri)
    }

    fn record_progress(&mut self, response: &HttpResponse, size: u64) -> Result<(), UploadError> {
        self.bytes_confirmed = match response.header("Range") {
            Some(range) => {
                let end: u64 = range
                    .rsplit('-')
                    .next()
                    .and_then(|end| end.trim().parse().ok())
                    .ok_or_else(|| UploadError::MalformedRange(range.to_string()))?;
                if end >= size {
                    return Err(UploadError::MalformedRange(range.to_string()));
                }
                end + 1
            }
            // Nothing persisted: resend from the start.
            None => 0,
        };
        if let Some(location) = response.header("Location") {
            self.session_uri = Some(location.to_string());
        }
        Ok(())
    }
}
