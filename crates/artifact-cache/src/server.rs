//! HTTP server for the cache protocol
//!
//! The protocol lives under `/_apis/artifactcache`; `/health` sits beside it.

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, patch, post},
    Router,
};
use cache_db::caches;
use chrono::Utc;
use tracing::{debug, info};

use crate::error::AppError;
use crate::routes;
use crate::state::AppState;
use crate::types::HealthResponse;

/// Path prefix of the cache protocol
pub const URL_BASE: &str = "/_apis/artifactcache";

/// Create the HTTP router
pub fn create_router(state: AppState, max_body_size: usize) -> Router {
    let protocol = Router::new()
        .route("/cache", get(routes::artifacts::find))
        .route("/caches", post(routes::caches::reserve))
        .route(
            "/caches/{id}",
            patch(routes::caches::upload).post(routes::caches::commit),
        )
        .route("/artifacts/{id}", get(routes::artifacts::fetch))
        .route("/clean", post(routes::caches::clean))
        .layer(middleware::from_fn_with_state(state.clone(), after_request));

    Router::new()
        .route("/health", get(health))
        .nest(URL_BASE, protocol)
        .layer(DefaultBodyLimit::max(max_body_size))
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: AppState, port: u16, max_body_size: usize) -> std::io::Result<()> {
    let router = create_router(state, max_body_size);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

/// Log the request and give retention a chance to run once it is answered
async fn after_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let response = next.run(request).await;
    debug!(%method, %uri, status = response.status().as_u16(), "Handled request");
    state.retention.trigger();
    response
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    let records = caches::stats(&state.pool).await?;
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0) as u64;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        records,
        promotion: state.promoter.stats(),
        retention: state.retention.last_stats().await,
        sweep_running: state.retention.is_running(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retention::RetentionPolicy;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use blob_store::BlobStore;
    use nexus_client::NexusClient;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const EXTERNAL_URL: &str = "http://cache.test:9900";

    async fn create_test_state(remote: Option<NexusClient>) -> (AppState, TempDir) {
        let dir = TempDir::new().unwrap();
        let blobs = Arc::new(BlobStore::new(dir.path().join("cache")));
        blobs.init().await.unwrap();
        let pool = cache_db::connect_in_memory().await.unwrap();
        cache_db::migrate(&pool).await.unwrap();

        let state = AppState::new(
            pool,
            blobs,
            remote.map(Arc::new),
            EXTERNAL_URL.to_string(),
            RetentionPolicy::default(),
        );
        (state, dir)
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    fn json_body(body: &[u8]) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    fn find_request(keys: &str, version: &str) -> Request<Body> {
        Request::builder()
            .uri(format!("{}/cache?keys={}&version={}", URL_BASE, keys, version))
            .body(Body::empty())
            .unwrap()
    }

    async fn reserve(router: &Router, key: &str, version: &str) -> i64 {
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("{}/caches", URL_BASE))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({ "key": key, "version": version }).to_string(),
            ))
            .unwrap();
        let (status, body) = send(router, request).await;
        assert_eq!(status, StatusCode::OK);
        json_body(&body)["cacheId"].as_i64().unwrap()
    }

    fn upload_request(id: impl std::fmt::Display, offset: usize, data: &[u8]) -> Request<Body> {
        Request::builder()
            .method(Method::PATCH)
            .uri(format!("{}/caches/{}", URL_BASE, id))
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/*", offset, offset + data.len() - 1),
            )
            .body(Body::from(data.to_vec()))
            .unwrap()
    }

    fn commit_request(id: impl std::fmt::Display, size: usize) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(format!("{}/caches/{}", URL_BASE, id))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "size": size }).to_string()))
            .unwrap()
    }

    fn fetch_request(id: i64) -> Request<Body> {
        Request::builder()
            .uri(format!("{}/artifacts/{}", URL_BASE, id))
            .body(Body::empty())
            .unwrap()
    }

    /// Reserve, upload in one chunk and commit
    async fn store(router: &Router, key: &str, version: &str, data: &[u8]) -> i64 {
        let id = reserve(router, key, version).await;
        let (status, _) = send(router, upload_request(id, 0, data)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(router, commit_request(id, data.len())).await;
        assert_eq!(status, StatusCode::OK);
        id
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (state, _dir) = create_test_state(None).await;
        let router = create_router(state, 1024);

        let (status, body) = send(
            &router,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let json = json_body(&body);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["records"]["complete"], 0);
        assert_eq!(json["promotion"]["enabled"], false);
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (state, _dir) = create_test_state(None).await;
        let router = create_router(state, 1 << 20);

        let data = b"hello artifact cache";
        let id = store(&router, "Cargo-Linux", "v1", data).await;

        let (status, body) = send(&router, find_request("cargo-linux", "v1")).await;
        assert_eq!(status, StatusCode::OK);
        let json = json_body(&body);
        assert_eq!(json["result"], "hit");
        assert_eq!(json["cacheKey"], "cargo-linux");
        assert_eq!(
            json["archiveLocation"],
            format!("{}{}/artifacts/{}", EXTERNAL_URL, URL_BASE, id)
        );

        let (status, body) = send(&router, fetch_request(id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, data);
    }

    #[tokio::test]
    async fn test_invisible_until_committed() {
        let (state, _dir) = create_test_state(None).await;
        let router = create_router(state, 1 << 20);

        let id = reserve(&router, "pending", "v1").await;
        let (status, _) = send(&router, upload_request(id, 0, b"data")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&router, find_request("pending", "v1")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(&router, commit_request(id, 4)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&router, find_request("pending", "v1")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_out_of_order_chunks() {
        let (state, _dir) = create_test_state(None).await;
        let router = create_router(state.clone(), 1 << 20);

        let data: Vec<u8> = (0..100u8).collect();
        let id = reserve(&router, "chunks", "v1").await;

        let (status, _) = send(&router, upload_request(id, 50, &data[50..])).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&router, upload_request(id, 0, &data[..50])).await;
        assert_eq!(status, StatusCode::OK);
        // The declared size is wrong; the stored size comes from the bytes
        let (status, _) = send(&router, commit_request(id, 42)).await;
        assert_eq!(status, StatusCode::OK);

        let record = caches::get(&state.pool, id).await.unwrap().unwrap();
        assert_eq!(record.size, Some(100));

        let (status, body) = send(&router, fetch_request(id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, data);
    }

    #[tokio::test]
    async fn test_ranged_fetch() {
        let (state, _dir) = create_test_state(None).await;
        let router = create_router(state, 1 << 20);

        let id = store(&router, "ranged", "v1", b"0123456789").await;

        let request = Request::builder()
            .uri(format!("{}/artifacts/{}", URL_BASE, id))
            .header(header::RANGE, "bytes=2-5")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(body, b"2345");
    }

    #[tokio::test]
    async fn test_double_commit_rejected() {
        let (state, _dir) = create_test_state(None).await;
        let router = create_router(state.clone(), 1 << 20);

        let id = store(&router, "twice", "v1", b"abc").await;
        let before = caches::get(&state.pool, id).await.unwrap().unwrap();

        let (status, body) = send(&router, commit_request(id, 3)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let message = json_body(&body)["error"].as_str().unwrap().to_string();
        assert!(message.contains("already complete"), "{}", message);

        // Uploads to a committed cache are rejected too
        let (status, _) = send(&router, upload_request(id, 0, b"xyz")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let after = caches::get(&state.pool, id).await.unwrap().unwrap();
        assert_eq!(after.size, Some(3));
        assert_eq!(after.used_at, before.used_at);

        let (_, body) = send(&router, fetch_request(id)).await;
        assert_eq!(body, b"abc");
    }

    #[tokio::test]
    async fn test_unknown_cache_rejected() {
        let (state, _dir) = create_test_state(None).await;
        let router = create_router(state, 1 << 20);

        let (status, body) = send(&router, upload_request(999, 0, b"data")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&body)["error"], "cache 999: not reserved");

        let (status, _) = send(&router, commit_request(999, 4)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invalid_id_and_range() {
        let (state, _dir) = create_test_state(None).await;
        let router = create_router(state.clone(), 1 << 20);

        let (status, body) = send(&router, upload_request("abc", 0, b"data")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json_body(&body)["error"].is_string());

        let (status, _) = send(&router, commit_request("abc", 4)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let request = Request::builder()
            .uri(format!("{}/artifacts/abc", URL_BASE))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let id = reserve(&router, "range", "v1").await;
        let request = Request::builder()
            .method(Method::PATCH)
            .uri(format!("{}/caches/{}", URL_BASE, id))
            .header(header::CONTENT_RANGE, "bytes nope")
            .body(Body::from("data"))
            .unwrap();
        let (status, _) = send(&router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Nothing was written for the rejected chunk
        let (status, _) = send(&router, commit_request(id, 0)).await;
        assert_eq!(status, StatusCode::OK);
        let record = caches::get(&state.pool, id).await.unwrap().unwrap();
        assert_eq!(record.size, Some(0));
    }

    #[tokio::test]
    async fn test_range_body_length_mismatch() {
        let (state, _dir) = create_test_state(None).await;
        let router = create_router(state, 1 << 20);

        let id = reserve(&router, "mismatch", "v1").await;
        let request = Request::builder()
            .method(Method::PATCH)
            .uri(format!("{}/caches/{}", URL_BASE, id))
            .header(header::CONTENT_RANGE, "bytes 0-9/*")
            .body(Body::from("short"))
            .unwrap();
        let (status, _) = send(&router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_reserve_body() {
        let (state, _dir) = create_test_state(None).await;
        let router = create_router(state, 1 << 20);

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("{}/caches", URL_BASE))
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json_body(&body)["error"]
            .as_str()
            .unwrap()
            .starts_with("invalid reserve request"));
    }

    #[tokio::test]
    async fn test_restore_key_precedence() {
        let (state, _dir) = create_test_state(None).await;
        let router = create_router(state, 1 << 20);

        store(&router, "cargo-linux-aaa", "v1", b"old").await;
        store(&router, "cargo-linux-bbb", "v1", b"new").await;
        store(&router, "cargo-linux-ccc", "v2", b"other version").await;

        // First key misses, prefix key matches the newest record of v1
        let (status, body) = send(&router, find_request("cargo-linux-zzz,cargo-linux-", "v1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["cacheKey"], "cargo-linux-bbb");

        // Exact key beats later prefix keys
        let (_, body) = send(&router, find_request("cargo-linux-aaa,cargo-linux-", "v1")).await;
        assert_eq!(json_body(&body)["cacheKey"], "cargo-linux-aaa");

        // Keys are case-insensitive
        let (status, _) = send(&router, find_request("CARGO-LINUX-AAA", "v1")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&router, find_request("cargo-linux-", "v3")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_empty_keys_miss() {
        let (state, _dir) = create_test_state(None).await;
        let router = create_router(state, 1 << 20);

        store(&router, "anything", "v1", b"data").await;

        let (status, _) = send(&router, find_request("", "v1")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&router, find_request(",,", "v1")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_missing_blob_deletes_record() {
        let (state, _dir) = create_test_state(None).await;
        let router = create_router(state.clone(), 1 << 20);

        let id = store(&router, "orphan", "v1", b"data").await;
        state.blobs.remove(id).await.unwrap();

        let (status, _) = send(&router, find_request("orphan", "v1")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(caches::get(&state.pool, id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_missing_blob() {
        let (state, _dir) = create_test_state(None).await;
        let router = create_router(state, 1 << 20);

        let (status, _) = send(&router, fetch_request(12345)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_fetch_refreshes_usage() {
        let (state, _dir) = create_test_state(None).await;
        let router = create_router(state.clone(), 1 << 20);

        let id = store(&router, "used", "v1", b"data").await;
        caches::upsert(
            &state.pool,
            &cache_db::CacheRecord {
                used_at: 0,
                ..caches::get(&state.pool, id).await.unwrap().unwrap()
            },
        )
        .await
        .unwrap();

        send(&router, fetch_request(id)).await;
        let record = caches::get(&state.pool, id).await.unwrap().unwrap();
        assert!(record.used_at > 0);
    }

    #[tokio::test]
    async fn test_clean_is_noop() {
        let (state, _dir) = create_test_state(None).await;
        let router = create_router(state, 1 << 20);

        let id = store(&router, "kept", "v1", b"data").await;

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("{}/clean", URL_BASE))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body), json!({}));

        let (_, body) = send(&router, fetch_request(id)).await;
        assert_eq!(body, b"data");
    }

    #[tokio::test]
    async fn test_body_limit() {
        let (state, _dir) = create_test_state(None).await;
        let router = create_router(state, 64);

        let id = reserve(&router, "big", "v1").await;
        let (status, _) = send(&router, upload_request(id, 0, &[0u8; 128])).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_remote_hit_preferred() {
        use wiremock::matchers::{method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/service/rest/v1/search/assets"))
            .and(query_param("name", "ci/shared-v1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{
                    "downloadUrl": "http://nexus.internal:8081/repository/cache/ci/shared-v1",
                    "path": "ci/shared-v1",
                    "lastModified": "2024-05-01T10:00:00.000+00:00"
                }],
                "continuationToken": null
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/service/rest/v1/search/assets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [] })))
            .mount(&server)
            .await;

        let remote =
            NexusClient::new(&format!("{}/repository/cache/ci", server.uri()), None).unwrap();
        let (state, _dir) = create_test_state(Some(remote)).await;
        let router = create_router(state, 1 << 20);

        let (status, body) = send(&router, find_request("shared", "v1")).await;
        assert_eq!(status, StatusCode::OK);
        let json = json_body(&body);
        assert_eq!(json["cacheKey"], "shared");
        assert_eq!(
            json["archiveLocation"],
            format!("{}/repository/cache/ci/shared-v1", server.uri())
        );

        // Remote miss falls through to the local tier
        let id = store(&router, "local-only", "v1", b"data").await;
        let (status, body) = send(&router, find_request("local-only", "v1")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json_body(&body)["archiveLocation"]
            .as_str()
            .unwrap()
            .ends_with(&format!("/artifacts/{}", id)));
    }

    #[tokio::test]
    async fn test_commit_promotes_to_remote() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/repository/cache/ci/promoted-v1"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [] })))
            .mount(&server)
            .await;

        let remote =
            NexusClient::new(&format!("{}/repository/cache/ci", server.uri()), None).unwrap();
        let (state, _dir) = create_test_state(Some(remote)).await;
        let router = create_router(state.clone(), 1 << 20);

        let data = b"promoted archive";
        store(&router, "Promoted", "v1", data).await;

        for _ in 0..200 {
            if state.promoter.stats().succeeded == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let stats = state.promoter.stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 0);

        let requests = server.received_requests().await.unwrap();
        let put = requests
            .iter()
            .find(|r| r.method == Method::PUT)
            .unwrap();
        assert_eq!(put.url.path(), "/repository/cache/ci/promoted-v1");
        assert_eq!(put.body, data);
    }

    #[tokio::test]
    async fn test_remote_failure_falls_back_to_local() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let remote =
            NexusClient::new(&format!("{}/repository/cache/ci", server.uri()), None).unwrap();
        let (state, _dir) = create_test_state(Some(remote)).await;
        let router = create_router(state, 1 << 20);

        store(&router, "fallback", "v1", b"data").await;
        let (status, body) = send(&router, find_request("fallback", "v1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["cacheKey"], "fallback");
    }
}
