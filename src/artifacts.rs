//! Artifact loading and saving.
//!
//! Input artifacts arrive as JSON descriptors in the instance metadata
//! attribute `artifacts`, either inline (`{"data": "..."}`) or by reference
//! (`{"url": "gs://bucket/object"}` or `{"url": "https://..."}`). Output
//! artifacts are uploaded to the job's bucket under `{job_id}/{key}` and
//! replaced by `{"url": "gs://bucket/job_id/key"}` references.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

use crate::config::CloudConfig;
use crate::context::{MetadataServer, ARTIFACTS_ATTRIBUTE};
use crate::error::ArtifactError;
use crate::http::{HttpRequest, HttpTransport, RetryPolicy};
use crate::job::Job;
use crate::storage::{ByteStream, ResumableUpload};

/// URL scheme of object storage references.
pub const STORAGE_SCHEME: &str = "gs";

static STORAGE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^gs://(?P<bucket>[^/]+)/(?P<object>.+?)/?$").expect("valid storage URL regex")
});

static HTTP_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://").expect("valid http URL regex"));

/// Artifacts of a job, keyed by name.
pub type ArtifactMap = BTreeMap<String, Artifact>;

/// A named byte payload that is an input to or output of a job.
#[derive(Debug)]
pub enum Artifact {
    /// Bytes held by this process. `save` marks output that must be uploaded.
    Pending { data: ByteStream, save: bool },
    /// Bytes stored in object storage.
    Persisted { url: String },
}

impl Artifact {
    /// New output produced by the job; uploaded on save.
    pub fn output(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Pending {
            data: ByteStream::from_bytes(bytes),
            save: true,
        }
    }

    /// New output backed by an arbitrary stream; uploaded on save.
    pub fn output_stream(data: ByteStream) -> Self {
        Self::Pending { data, save: true }
    }

    /// Input loaded from metadata; never re-uploaded.
    pub fn input(data: ByteStream) -> Self {
        Self::Pending { data, save: false }
    }

    pub fn persisted(url: impl Into<String>) -> Self {
        Self::Persisted { url: url.into() }
    }

    /// Whether this artifact will be uploaded on save.
    pub fn should_save(&self) -> bool {
        matches!(self, Self::Pending { save: true, .. })
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Persisted { url } => Some(url),
            Self::Pending { .. } => None,
        }
    }

    pub fn data_mut(&mut self) -> Option<&mut ByteStream> {
        match self {
            Self::Pending { data, .. } => Some(data),
            Self::Persisted { .. } => None,
        }
    }
}

/// Wire form of an artifact in instance metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// A parsed `gs://bucket/object` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUrl {
    pub bucket: String,
    pub object: String,
}

impl StorageUrl {
    pub fn parse(url: &str) -> Result<Self, ArtifactError> {
        let captures = STORAGE_URL
            .captures(url)
            .ok_or_else(|| ArtifactError::InvalidStorageUrl(url.to_string()))?;
        Ok(Self {
            bucket: captures["bucket"].to_string(),
            object: captures["object"].to_string(),
        })
    }

    pub fn new(bucket: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            object: object.into(),
        }
    }
}

impl std::fmt::Display for StorageUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}/{}", STORAGE_SCHEME, self.bucket, self.object)
    }
}

/// Serializes persisted artifacts as the JSON map published in metadata.
///
/// Artifacts still pending are not representable as references and are
/// skipped.
pub fn encode_artifacts(artifacts: &ArtifactMap) -> Result<String, serde_json::Error> {
    let descriptors: BTreeMap<&str, ArtifactDescriptor> = artifacts
        .iter()
        .filter_map(|(key, artifact)| {
            artifact.url().map(|url| {
                (
                    key.as_str(),
                    ArtifactDescriptor {
                        url: Some(url.to_string()),
                        data: None,
                    },
                )
            })
        })
        .collect();
    serde_json::to_string(&descriptors)
}

/// Loads input artifacts and persists output artifacts.
pub struct ArtifactManager {
    plain: Arc<dyn HttpTransport>,
    authorized: Arc<dyn HttpTransport>,
    server: Arc<MetadataServer>,
    storage_url: String,
    upload_url: String,
    bucket: String,
    chunk_size: usize,
    cache_control: Option<String>,
    retry: RetryPolicy,
}

impl ArtifactManager {
    /// Creates a manager.
    ///
    /// `plain` fetches generic `http(s)` URLs; `authorized` talks to the
    /// storage API.
    pub fn new(
        plain: Arc<dyn HttpTransport>,
        authorized: Arc<dyn HttpTransport>,
        server: Arc<MetadataServer>,
        config: &CloudConfig,
    ) -> Self {
        Self {
            plain,
            authorized,
            server,
            storage_url: config.storage_url.trim_end_matches('/').to_string(),
            upload_url: config.upload_url.clone(),
            bucket: config.bucket.clone(),
            chunk_size: config.chunk_size,
            cache_control: config.cache_control.clone(),
            retry: RetryPolicy::new(config.retry_count),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Replaces `job.artifacts` with the inputs described in metadata.
    ///
    /// A missing or malformed `artifacts` attribute yields no inputs.
    pub async fn load_artifacts(&self, job: &mut Job) -> Result<(), ArtifactError> {
        let raw = match self.server.query(ARTIFACTS_ATTRIBUTE).await? {
            Some(raw) => raw,
            None => {
                tracing::debug!(job_id = %job.id(), "No input artifacts provided");
                job.artifacts = ArtifactMap::new();
                return Ok(());
            }
        };

        let descriptors: HashMap<String, ArtifactDescriptor> = match serde_json::from_str(&raw) {
            Ok(descriptors) => descriptors,
            Err(err) => {
                tracing::warn!(job_id = %job.id(), error = %err, "Ignoring malformed artifacts attribute");
                job.artifacts = ArtifactMap::new();
                return Ok(());
            }
        };

        let mut artifacts = ArtifactMap::new();
        for (key, descriptor) in descriptors {
            let bytes = self.materialize(&key, descriptor).await?;
            tracing::info!(job_id = %job.id(), key = %key, bytes = bytes.len(), "Loaded input artifact");
            artifacts.insert(key, Artifact::input(ByteStream::from_bytes(bytes)));
        }
        job.artifacts = artifacts;
        Ok(())
    }

    async fn materialize(
        &self,
        key: &str,
        descriptor: ArtifactDescriptor,
    ) -> Result<Vec<u8>, ArtifactError> {
        match descriptor {
            ArtifactDescriptor { url: Some(url), .. } => self.read_external(key, &url).await,
            ArtifactDescriptor {
                data: Some(data), ..
            } => Ok(data.into_bytes()),
            _ => Err(ArtifactError::UnsupportedReference {
                key: key.to_string(),
                reference: "descriptor has neither url nor data".to_string(),
            }),
        }
    }

    /// Fetches the full content of an external reference.
    pub async fn read_external(&self, key: &str, url: &str) -> Result<Vec<u8>, ArtifactError> {
        let (transport, request_url) = if url.starts_with("gs://") {
            let location = StorageUrl::parse(url)?;
            let media_url = format!(
                "{}/b/{}/o/{}",
                self.storage_url,
                location.bucket,
                urlencoding::encode(&location.object)
            );
            (&self.authorized, media_url)
        } else if HTTP_URL.is_match(url) {
            (&self.plain, url.to_string())
        } else {
            return Err(ArtifactError::UnsupportedReference {
                key: key.to_string(),
                reference: url.to_string(),
            });
        };

        let mut request = HttpRequest::get(&request_url);
        if url.starts_with("gs://") {
            request = request.with_query("alt", "media");
        }

        let mut buf = Vec::new();
        let status = transport.download(request, &mut buf).await?;
        if !(200..300).contains(&status) {
            return Err(ArtifactError::Download {
                url: url.to_string(),
                status,
            });
        }
        Ok(buf)
    }

    /// Uploads every artifact marked for saving and replaces it with its
    /// storage reference. Inputs not marked for saving are dropped.
    pub async fn save_artifacts(&self, job: &mut Job) -> Result<(), ArtifactError> {
        let pending = std::mem::take(&mut job.artifacts);
        let mut saved = ArtifactMap::new();

        for (key, artifact) in pending {
            match artifact {
                Artifact::Pending {
                    mut data,
                    save: true,
                } => {
                    let url = self.save_one(job.id(), &key, &mut data).await?;
                    saved.insert(key, Artifact::Persisted { url });
                }
                Artifact::Pending { save: false, .. } => {
                    tracing::debug!(job_id = %job.id(), key = %key, "Dropping unsaved artifact");
                }
                persisted @ Artifact::Persisted { .. } => {
                    saved.insert(key, persisted);
                }
            }
        }

        job.artifacts = saved;
        Ok(())
    }

    async fn save_one(
        &self,
        job_id: &str,
        key: &str,
        data: &mut ByteStream,
    ) -> Result<String, ArtifactError> {
        let object_name = format!("{job_id}/{key}");
        let mut upload = ResumableUpload::new(
            self.authorized.clone(),
            self.upload_url.clone(),
            self.bucket.clone(),
            object_name.clone(),
        )
        .with_chunk_size(self.chunk_size)
        .with_cache_control(self.cache_control.clone())
        .with_retry_policy(self.retry.clone());

        upload
            .upload(data)
            .await
            .map_err(|source| ArtifactError::Upload {
                key: key.to_string(),
                source,
            })?;

        let url = StorageUrl::new(&self.bucket, object_name).to_string();
        tracing::info!(job_id, key, url = %url, "Saved artifact");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::{RecordingSleeper, ScriptedTransport};
    use crate::http::{HttpResponse, Method};

    const METADATA: &str = "http://metadata.test/computeMetadata/v1";
    const STORAGE: &str = "https://storage.test/storage/v1";
    const UPLOAD: &str = "https://storage.test/upload/storage/v1";

    struct Fixture {
        transport: Arc<ScriptedTransport>,
        manager: ArtifactManager,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(ScriptedTransport::new());
        let server = Arc::new(MetadataServer::new(transport.clone(), METADATA));
        let config = CloudConfig {
            bucket: "out-bucket".to_string(),
            storage_url: STORAGE.to_string(),
            upload_url: UPLOAD.to_string(),
            ..CloudConfig::default()
        };
        let manager = ArtifactManager::new(transport.clone(), transport.clone(), server, &config)
            .with_retry_policy(
                RetryPolicy::new(1).with_sleeper(Arc::new(RecordingSleeper::default())),
            );
        Fixture { transport, manager }
    }

    fn provide(transport: &ScriptedTransport, json: &str) {
        transport.always(
            Method::Get,
            &format!("{METADATA}/{ARTIFACTS_ATTRIBUTE}"),
            HttpResponse::new(200).with_body(json),
        );
    }

    fn read(job: &mut Job, key: &str) -> Vec<u8> {
        job.artifacts
            .get_mut(key)
            .and_then(Artifact::data_mut)
            .expect("artifact has data")
            .read_all()
            .unwrap()
    }

    #[test]
    fn test_storage_url_parse() {
        let url = StorageUrl::parse("gs://bucket-1/path/to/object.json").unwrap();
        assert_eq!(url.bucket, "bucket-1");
        assert_eq!(url.object, "path/to/object.json");
        assert_eq!(url.to_string(), "gs://bucket-1/path/to/object.json");

        let trailing = StorageUrl::parse("gs://b/dir/").unwrap();
        assert_eq!(trailing.object, "dir");

        assert!(StorageUrl::parse("gs://bucket-only").is_err());
        assert!(StorageUrl::parse("s3://b/o").is_err());
    }

    #[test]
    fn test_encode_artifacts_only_persisted() {
        let mut artifacts = ArtifactMap::new();
        artifacts.insert("b".to_string(), Artifact::persisted("gs://x/j/b"));
        artifacts.insert("a".to_string(), Artifact::persisted("gs://x/j/a"));
        artifacts.insert("pending".to_string(), Artifact::output("bytes"));

        let encoded = encode_artifacts(&artifacts).unwrap();
        assert_eq!(
            encoded,
            r#"{"a":{"url":"gs://x/j/a"},"b":{"url":"gs://x/j/b"}}"#
        );
    }

    #[tokio::test]
    async fn test_load_absent_attribute_is_empty() {
        let f = fixture();
        f.transport.always(
            Method::Get,
            &format!("{METADATA}/{ARTIFACTS_ATTRIBUTE}"),
            HttpResponse::new(404),
        );
        let mut job = Job::new();
        job.artifacts.insert("stale".to_string(), Artifact::output("x"));

        f.manager.load_artifacts(&mut job).await.expect("absent attribute is not an error");
        assert!(job.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_load_malformed_attribute_is_empty() {
        let f = fixture();
        provide(&f.transport, "{not json");
        let mut job = Job::new();

        f.manager.load_artifacts(&mut job).await.unwrap();
        assert!(job.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_load_inline_and_referenced_artifacts() {
        let f = fixture();
        provide(
            &f.transport,
            r#"{
                "inline": {"data": "hello"},
                "web": {"url": "http://files.test/corpus.txt"},
                "stored": {"url": "gs://in-bucket/inputs/lexicon v2.json"}
            }"#,
        );
        f.transport.on(
            Method::Get,
            "http://files.test/corpus.txt",
            HttpResponse::new(200).with_body("from the web"),
        );
        f.transport.on(
            Method::Get,
            &format!("{STORAGE}/b/in-bucket/o/inputs%2Flexicon%20v2.json"),
            HttpResponse::new(200).with_body("from storage"),
        );
        let mut job = Job::new();

        f.manager.load_artifacts(&mut job).await.expect("load should succeed");

        assert_eq!(job.artifacts.len(), 3);
        assert!(job.artifacts.values().all(|a| !a.should_save()));
        assert_eq!(read(&mut job, "inline"), b"hello");
        assert_eq!(read(&mut job, "web"), b"from the web");
        assert_eq!(read(&mut job, "stored"), b"from storage");

        let media = f
            .transport
            .requests_to(Method::Get, &format!("{STORAGE}/b/in-bucket/o/inputs%2Flexicon%20v2.json"));
        assert_eq!(media[0].query, vec![("alt".to_string(), "media".to_string())]);
    }

    #[tokio::test]
    async fn test_load_unsupported_scheme_fails() {
        let f = fixture();
        provide(&f.transport, r#"{"x": {"url": "ftp://files.test/x"}}"#);
        let mut job = Job::new();

        let err = f.manager.load_artifacts(&mut job).await.unwrap_err();
        assert!(matches!(err, ArtifactError::UnsupportedReference { ref key, .. } if key == "x"));
    }

    #[tokio::test]
    async fn test_load_descriptor_without_url_or_data_fails() {
        let f = fixture();
        provide(&f.transport, r#"{"x": {"save": true}}"#);
        let mut job = Job::new();

        let err = f.manager.load_artifacts(&mut job).await.unwrap_err();
        assert!(matches!(err, ArtifactError::UnsupportedReference { .. }));
    }

    #[tokio::test]
    async fn test_load_failed_download() {
        let f = fixture();
        provide(&f.transport, r#"{"x": {"url": "https://files.test/gone"}}"#);
        f.transport
            .on(Method::Get, "https://files.test/gone", HttpResponse::new(404));
        let mut job = Job::new();

        let err = f.manager.load_artifacts(&mut job).await.unwrap_err();
        assert!(matches!(err, ArtifactError::Download { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_save_uploads_outputs_and_drops_inputs() {
        let f = fixture();
        let session = "https://storage.test/session/1";
        f.transport.on(
            Method::Post,
            &format!("{UPLOAD}/b/out-bucket/o"),
            HttpResponse::new(200).with_header("Location", session),
        );
        f.transport
            .on(Method::Put, session, HttpResponse::new(200).with_body("{}"));

        let mut job = Job::new();
        job.artifacts.insert(
            "input".to_string(),
            Artifact::input(ByteStream::from_bytes(b"in".to_vec())),
        );
        job.artifacts
            .insert("tokens.json".to_string(), Artifact::output(b"[1,2]".to_vec()));
        job.artifacts
            .insert("prior".to_string(), Artifact::persisted("gs://elsewhere/p"));

        f.manager.save_artifacts(&mut job).await.expect("save should succeed");

        assert_eq!(job.artifacts.len(), 2);
        assert!(!job.artifacts.contains_key("input"));
        assert_eq!(
            job.artifacts["tokens.json"].url(),
            Some(format!("gs://out-bucket/{}/tokens.json", job.id()).as_str())
        );
        assert_eq!(job.artifacts["prior"].url(), Some("gs://elsewhere/p"));

        let init = &f.transport.requests_to(Method::Post, &format!("{UPLOAD}/b/out-bucket/o"))[0];
        let body: serde_json::Value = serde_json::from_slice(&init.body).unwrap();
        assert_eq!(body["name"], format!("{}/tokens.json", job.id()));
        assert_eq!(f.transport.requests_to(Method::Put, session)[0].body, b"[1,2]");
    }

    #[tokio::test]
    async fn test_save_upload_failure_names_artifact() {
        let f = fixture();
        f.transport.on(
            Method::Post,
            &format!("{UPLOAD}/b/out-bucket/o"),
            HttpResponse::new(400),
        );
        let mut job = Job::new();
        job.artifacts
            .insert("out".to_string(), Artifact::output(b"x".to_vec()));

        let err = f.manager.save_artifacts(&mut job).await.unwrap_err();
        assert!(matches!(err, ArtifactError::Upload { ref key, .. } if key == "out"));
    }
}
