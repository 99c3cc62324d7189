//! HTTP client for the content store REST API.
//!
//! - Bearer-token auth
//! - Pooled connections with connect and request timeouts
//! - Exponential backoff with jitter
//! - Tracing spans and request metrics

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use url::Url;

use thumb_models::{
    ContentId, ContentMetadata, DerivedRecord, DerivedStatus, ObjectInfo, ParentAsset,
};

use crate::error::{ContentError, ContentResult};
use crate::metrics::record_request;
use crate::retry::{with_retry, RetryConfig};
use crate::store::{ContentFilter, ContentStore, DerivedFilter, NewDerived, Page, PageRequest};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct ContentConfig {
    /// Base URL, e.g. `http://content:8080`
    pub base_url: Url,
    /// Optional bearer token
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryConfig,
}

impl ContentConfig {
    pub fn new(base_url: &str) -> ContentResult<Self> {
        Ok(Self {
            base_url: parse_base_url(base_url)?,
            api_key: None,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        })
    }

    pub fn from_env() -> ContentResult<Self> {
        let base_url = std::env::var("CONTENT_API_URL")
            .map_err(|_| ContentError::Config("CONTENT_API_URL must be set".to_string()))?;

        let timeout_secs: u64 = std::env::var("CONTENT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let connect_timeout_secs: u64 = std::env::var("CONTENT_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        Ok(Self {
            base_url: parse_base_url(&base_url)?,
            api_key: std::env::var("CONTENT_API_KEY").ok().filter(|k| !k.is_empty()),
            timeout: Duration::from_secs(timeout_secs),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            retry: RetryConfig::from_env(),
        })
    }
}

fn parse_base_url(raw: &str) -> ContentResult<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ContentError::Config("CONTENT_API_URL cannot be empty".to_string()));
    }
    Url::parse(trimmed).map_err(|e| ContentError::Config(format!("invalid content URL '{}': {}", trimmed, e)))
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Serialize)]
struct StatusUpdate {
    status: DerivedStatus,
}

#[derive(Debug, Deserialize)]
struct PageBody<T> {
    items: Vec<T>,
    #[serde(default)]
    total: usize,
}

// =============================================================================
// Client
// =============================================================================

#[derive(Clone)]
pub struct ContentClient {
    http: Client,
    config: ContentConfig,
}

impl ContentClient {
    pub fn new(config: ContentConfig) -> ContentResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("thumb-content/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { http, config })
    }

    pub fn from_env() -> ContentResult<Self> {
        Self::new(ContentConfig::from_env()?)
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/api/v1/{}",
            self.config.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, operation: &str, path: &str, query: &[(&str, String)]) -> ContentResult<T> {
        let url = &self.url(path);
        self.execute_request(operation, path, async {
            with_retry(&self.config.retry, operation, || async move {
                let response = self
                    .authorize(self.http.get(url).query(query))
                    .send()
                    .await?;
                let response = check_status(url, response).await?;
                Ok(response.json::<T>().await?)
            })
            .await
        })
        .await
    }

    async fn send_json<B: Serialize + Sync>(
        &self,
        operation: &str,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> ContentResult<Response> {
        let url = &self.url(path);
        let method = &method;
        self.execute_request(operation, path, async {
            with_retry(&self.config.retry, operation, || async move {
                let response = self
                    .authorize(self.http.request(method.clone(), url).json(body))
                    .send()
                    .await?;
                check_status(url, response).await
            })
            .await
        })
        .await
    }

    async fn execute_request<T, F>(&self, operation: &str, path: &str, fut: F) -> ContentResult<T>
    where
        F: std::future::Future<Output = ContentResult<T>>,
    {
        let span = info_span!("content_request", operation = %operation, path = %path);
        let start = Instant::now();
        let result = fut.instrument(span).await;
        let latency_ms = start.elapsed().as_millis() as f64;

        let status = match &result {
            Ok(_) => 200,
            Err(e) => e.http_status().unwrap_or(500),
        };
        record_request(operation, status, latency_ms);

        result
    }
}

async fn check_status(url: &str, response: Response) -> ContentResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();

    if status == StatusCode::TOO_MANY_REQUESTS {
        if let Some(secs) = retry_after {
            return Err(ContentError::RateLimited(secs.saturating_mul(1000)));
        }
    }
    Err(ContentError::from_http_status(
        status.as_u16(),
        format!("{} failed: {}", url, body),
    ))
}

fn page_query(page: PageRequest) -> Vec<(&'static str, String)> {
    vec![
        ("offset", page.offset.to_string()),
        ("limit", page.limit.to_string()),
    ]
}

#[async_trait]
impl ContentStore for ContentClient {
    async fn get_content(&self, id: &ContentId) -> ContentResult<ParentAsset> {
        self.get_json("get_content", &format!("contents/{}", id), &[]).await
    }

    async fn get_metadata(&self, id: &ContentId) -> ContentResult<ContentMetadata> {
        self.get_json("get_metadata", &format!("contents/{}/metadata", id), &[])
            .await
    }

    async fn download_to(&self, id: &ContentId, dest: &Path) -> ContentResult<u64> {
        let path = format!("contents/{}/download", id);
        let url = &self.url(&path);

        self.execute_request("download", &path, async {
            with_retry(&self.config.retry, "download", || async move {
                let response = self.authorize(self.http.get(url)).send().await?;
                let response = check_status(url, response).await?;

                let mut file = tokio::fs::File::create(dest).await?;
                let mut stream = response.bytes_stream();
                let mut written = 0u64;
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk?;
                    file.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                }
                file.flush().await?;
                debug!(content_id = %id, bytes = written, "Downloaded content");
                Ok(written)
            })
            .await
        })
        .await
    }

    async fn create_derived(&self, parent: &ContentId, req: &NewDerived) -> ContentResult<DerivedRecord> {
        let response = self
            .send_json(
                "create_derived",
                reqwest::Method::POST,
                &format!("contents/{}/derived", parent),
                req,
            )
            .await?;
        Ok(response.json().await?)
    }

    async fn update_status(&self, id: &ContentId, status: DerivedStatus) -> ContentResult<()> {
        self.send_json(
            "update_status",
            reqwest::Method::PATCH,
            &format!("contents/{}/status", id),
            &StatusUpdate { status },
        )
        .await
        .map(|_| ())
    }

    async fn update_metadata(&self, id: &ContentId, metadata: &ContentMetadata) -> ContentResult<()> {
        self.send_json(
            "update_metadata",
            reqwest::Method::PUT,
            &format!("contents/{}/metadata", id),
            metadata,
        )
        .await
        .map(|_| ())
    }

    async fn upload_object(&self, id: &ContentId, path: &Path, mime_type: &str) -> ContentResult<ObjectInfo> {
        let api_path = format!("contents/{}/objects", id);
        let url = &self.url(&api_path);
        let bytes = &tokio::fs::read(path).await?;
        let file_name = &path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "thumbnail".to_string());

        self.execute_request("upload_object", &api_path, async {
            with_retry(&self.config.retry, "upload_object", || async move {
                let part = Part::bytes(bytes.clone())
                    .file_name(file_name.clone())
                    .mime_str(mime_type)?;
                let form = Form::new().part("file", part);
                let response = self
                    .authorize(self.http.post(url).multipart(form))
                    .send()
                    .await?;
                let response = check_status(url, response).await?;
                Ok(response.json::<ObjectInfo>().await?)
            })
            .await
        })
        .await
    }

    async fn list_objects(&self, id: &ContentId) -> ContentResult<Vec<ObjectInfo>> {
        self.get_json("list_objects", &format!("contents/{}/objects", id), &[])
            .await
    }

    async fn list_derived(&self, parent: &ContentId, derivation_type: &str) -> ContentResult<Vec<DerivedRecord>> {
        self.get_json(
            "list_derived",
            &format!("contents/{}/derived", parent),
            &[("derivation_type", derivation_type.to_string())],
        )
        .await
    }

    async fn list_contents(&self, filter: &ContentFilter, page: PageRequest) -> ContentResult<Page<ParentAsset>> {
        let mut query = page_query(page);
        if let Some(status) = filter.status {
            query.push(("status", status.as_str().to_string()));
        }
        if let Some(owner) = &filter.owner_id {
            query.push(("owner_id", owner.clone()));
        }
        if let Some(tenant) = &filter.tenant_id {
            query.push(("tenant_id", tenant.clone()));
        }
        if filter.originals_only {
            query.push(("originals_only", "true".to_string()));
        }

        let body: PageBody<ParentAsset> = self.get_json("list_contents", "contents", &query).await?;
        Ok(Page {
            items: body.items,
            total: body.total,
        })
    }

    async fn list_derived_records(
        &self,
        filter: &DerivedFilter,
        page: PageRequest,
    ) -> ContentResult<Page<DerivedRecord>> {
        let mut query = page_query(page);
        if !filter.statuses.is_empty() {
            let statuses: Vec<&str> = filter.statuses.iter().map(|s| s.as_str()).collect();
            query.push(("status", statuses.join(",")));
        }
        if let Some(kind) = &filter.derivation_type {
            query.push(("derivation_type", kind.clone()));
        }
        if let Some(owner) = &filter.owner_id {
            query.push(("owner_id", owner.clone()));
        }
        if let Some(tenant) = &filter.tenant_id {
            query.push(("tenant_id", tenant.clone()));
        }

        let body: PageBody<DerivedRecord> = self.get_json("list_derived_records", "derived", &query).await?;
        Ok(Page {
            items: body.items,
            total: body.total,
        })
    }
}
