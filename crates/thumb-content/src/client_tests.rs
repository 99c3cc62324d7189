//! Tests for the HTTP content client.

use std::time::Duration;

use serde_json::json;
use serial_test::serial;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use thumb_models::{ContentId, DerivedStatus, ParentStatus, THUMBNAIL_DERIVATION};

use crate::client::{ContentClient, ContentConfig};
use crate::error::ContentError;
use crate::retry::RetryConfig;
use crate::store::{ContentFilter, ContentStore, NewDerived, PageRequest};

fn client_for(server: &MockServer) -> ContentClient {
    let mut config = ContentConfig::new(&server.uri()).unwrap();
    config.api_key = Some("secret".to_string());
    config.timeout = Duration::from_secs(5);
    config.retry = RetryConfig {
        max_retries: 2,
        base_delay_ms: 1,
        max_delay_ms: 5,
    };
    ContentClient::new(config).unwrap()
}

fn parent_json(id: &ContentId) -> serde_json::Value {
    json!({
        "id": id.as_str(),
        "status": "uploaded",
        "name": "cat.png",
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": "2024-01-01T00:00:00Z"
    })
}

#[tokio::test]
async fn test_get_content_sends_bearer() {
    let server = MockServer::start().await;
    let id = ContentId::new();

    Mock::given(method("GET"))
        .and(path(format!("/api/v1/contents/{}", id)))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(parent_json(&id)))
        .expect(1)
        .mount(&server)
        .await;

    let parent = client_for(&server).get_content(&id).await.unwrap();
    assert_eq!(parent.id, id);
    assert_eq!(parent.status, ParentStatus::Uploaded);
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = MockServer::start().await;
    let id = ContentId::new();

    Mock::given(method("GET"))
        .and(path(format!("/api/v1/contents/{}", id)))
        .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
        .expect(1)
        .mount(&server)
        .await;

    let err = client_for(&server).get_content(&id).await.unwrap_err();
    assert!(matches!(err, ContentError::NotFound(_)));
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let server = MockServer::start().await;
    let id = ContentId::new();

    Mock::given(method("GET"))
        .and(path(format!("/api/v1/contents/{}/metadata", id)))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/api/v1/contents/{}/metadata", id)))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"mime_type": "image/png"})),
        )
        .mount(&server)
        .await;

    let metadata = client_for(&server).get_metadata(&id).await.unwrap();
    assert_eq!(metadata.mime_type.as_deref(), Some("image/png"));
}

#[tokio::test]
async fn test_create_derived_and_update_status() {
    let server = MockServer::start().await;
    let parent = ContentId::new();
    let child = ContentId::new();

    Mock::given(method("POST"))
        .and(path(format!("/api/v1/contents/{}/derived", parent)))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "content_id": child.as_str(),
            "parent_id": parent.as_str(),
            "variant": "thumbnail_150",
            "derivation_type": "thumbnail",
            "status": "created",
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(format!("/api/v1/contents/{}/status", child)))
        .and(body_json(json!({"status": "processing"})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let record = client
        .create_derived(
            &parent,
            &NewDerived {
                variant: "thumbnail_150".into(),
                derivation_type: THUMBNAIL_DERIVATION.into(),
                metadata: Default::default(),
            },
        )
        .await
        .unwrap();
    assert_eq!(record.content_id, child);

    client
        .update_status(&record.content_id, DerivedStatus::Processing)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_download_streams_to_file() {
    let server = MockServer::start().await;
    let id = ContentId::new();
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("source.bin");

    Mock::given(method("GET"))
        .and(path(format!("/api/v1/contents/{}/download", id)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 2048]))
        .mount(&server)
        .await;

    let written = client_for(&server).download_to(&id, &dest).await.unwrap();
    assert_eq!(written, 2048);
    assert_eq!(std::fs::read(&dest).unwrap().len(), 2048);
}

#[tokio::test]
async fn test_upload_object() {
    let server = MockServer::start().await;
    let id = ContentId::new();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("cat_small.jpg");
    std::fs::write(&file, b"jpeg").unwrap();

    Mock::given(method("POST"))
        .and(path(format!("/api/v1/contents/{}/objects", id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object_id": "obj-1",
            "content_id": id.as_str(),
            "status": "uploaded",
            "size_bytes": 4
        })))
        .expect(1)
        .mount(&server)
        .await;

    let info = client_for(&server)
        .upload_object(&id, &file, "image/jpeg")
        .await
        .unwrap();
    assert_eq!(info.object_id, "obj-1");
    assert!(info.is_uploaded());
}

#[tokio::test]
async fn test_list_contents_passes_filter() {
    let server = MockServer::start().await;
    let id = ContentId::new();

    Mock::given(method("GET"))
        .and(path("/api/v1/contents"))
        .and(query_param("status", "uploaded"))
        .and(query_param("owner_id", "owner-1"))
        .and(query_param("offset", "100"))
        .and(query_param("limit", "50"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"items": [parent_json(&id)], "total": 101})),
        )
        .mount(&server)
        .await;

    let filter = ContentFilter {
        status: Some(ParentStatus::Uploaded),
        owner_id: Some("owner-1".into()),
        ..ContentFilter::default()
    };
    let page = client_for(&server)
        .list_contents(&filter, PageRequest::new(100, 50))
        .await
        .unwrap();
    assert_eq!(page.total, 101);
    assert_eq!(page.items[0].id, id);
}

#[tokio::test]
async fn test_rate_limit_honours_retry_after() {
    let server = MockServer::start().await;
    let id = ContentId::new();

    Mock::given(method("GET"))
        .and(path(format!("/api/v1/contents/{}/objects", id)))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/api/v1/contents/{}/objects", id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let objects = client_for(&server).list_objects(&id).await.unwrap();
    assert!(objects.is_empty());
}

// =============================================================================
// Config Tests
// =============================================================================

#[test]
#[serial]
fn test_config_requires_url() {
    std::env::remove_var("CONTENT_API_URL");
    assert!(matches!(ContentConfig::from_env(), Err(ContentError::Config(_))));

    std::env::set_var("CONTENT_API_URL", "not a url");
    assert!(matches!(ContentConfig::from_env(), Err(ContentError::Config(_))));
    std::env::remove_var("CONTENT_API_URL");
}

#[test]
#[serial]
fn test_config_defaults_and_overrides() {
    std::env::set_var("CONTENT_API_URL", "http://content:8080");
    std::env::remove_var("CONTENT_API_KEY");
    std::env::set_var("CONTENT_CONNECT_TIMEOUT_SECS", "not-a-number");
    std::env::set_var("CONTENT_RETRY_BASE_MS", "50");

    let config = ContentConfig::from_env().unwrap();
    assert_eq!(config.connect_timeout, Duration::from_secs(5));
    assert_eq!(config.timeout, Duration::from_secs(30));
    assert_eq!(config.retry.base_delay_ms, 50);
    assert!(config.api_key.is_none());

    std::env::remove_var("CONTENT_API_URL");
    std::env::remove_var("CONTENT_CONNECT_TIMEOUT_SECS");
    std::env::remove_var("CONTENT_RETRY_BASE_MS");
}
