//! reqwest-backed transport and the bearer-token decorator.

use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use super::{HttpRequest, HttpResponse, HttpTransport, Method};
use crate::auth::TokenSource;
use crate::error::{ConfigError, TransportError};

/// Plain HTTP transport over a shared reqwest client.
///
/// Used directly for the metadata server and generic `http(s)` artifact
/// URLs; wrapped by [`AuthorizedTransport`] for Google APIs.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a transport whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cloudjob/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn start(&self, request: HttpRequest) -> Result<reqwest::Response, TransportError> {
        let url = request.full_url();
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
        };

        let mut builder = self.client.request(method, &url);
        for (name, value) in &request.headers {
            // hyper derives Content-Length from the body
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if request.method != Method::Get {
            builder = builder.body(request.body);
        }

        builder.send().await.map_err(|e| TransportError::Request {
            url,
            message: e.to_string(),
        })
    }
}

fn response_headers(response: &reqwest::Response) -> Vec<(String, String)> {
    response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = request.url.clone();
        let response = self.start(request).await?;
        let status = response.status().as_u16();
        let headers = response_headers(&response);
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Body {
                url,
                message: e.to_string(),
            })?
            .to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    async fn download(
        &self,
        request: HttpRequest,
        sink: &mut (dyn Write + Send),
    ) -> Result<u16, TransportError> {
        let url = request.url.clone();
        let mut response = self.start(request).await?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Ok(status);
        }

        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(|e| TransportError::Body {
            url: url.clone(),
            message: e.to_string(),
        })? {
            sink.write_all(&chunk)?;
            written += chunk.len() as u64;
        }
        tracing::debug!(url = %url, bytes = written, "Download complete");
        Ok(status)
    }
}

/// Decorator that attaches an OAuth bearer token to every request.
pub struct AuthorizedTransport {
    inner: Arc<dyn HttpTransport>,
    tokens: Arc<dyn TokenSource>,
}

impl AuthorizedTransport {
    pub fn new(inner: Arc<dyn HttpTransport>, tokens: Arc<dyn TokenSource>) -> Self {
        Self { inner, tokens }
    }

    async fn authorize(&self, request: HttpRequest) -> Result<HttpRequest, TransportError> {
        let token = self.tokens.access_token().await?;
        Ok(request.with_header("Authorization", format!("Bearer {token}")))
    }
}

#[async_trait]
impl HttpTransport for AuthorizedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let request = self.authorize(request).await?;
        self.inner.send(request).await
    }

    async fn download(
        &self,
        request: HttpRequest,
        sink: &mut (dyn Write + Send),
    ) -> Result<u16, TransportError> {
        let request = self.authorize(request).await?;
        self.inner.download(request, sink).await
    }
}
