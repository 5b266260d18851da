//! Router-level tests for the HTTP surface.

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use axum::Router;
    use http_body_util::BodyExt;
    use rehost_core::{Rehoster, RehosterConfig};
    use rehost_storage::{MemoryKeysetIndex, MemorySourceStore, SwarmStats};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::server::{build_router, AppState};

    struct TestApp {
        router: Router,
        store: Arc<MemorySourceStore>,
    }

    fn test_app(keys_path: Option<PathBuf>) -> TestApp {
        let store = Arc::new(MemorySourceStore::new());
        let rehoster = Arc::new(Rehoster::new(
            store.clone(),
            Arc::new(MemoryKeysetIndex::new()),
            Arc::new(SwarmStats::new()),
            RehosterConfig::default(),
        ));
        let mut state = AppState::new(rehoster);
        state.keys_path = keys_path;
        TestApp {
            router: build_router(Arc::new(state)),
            store,
        }
    }

    fn key(byte: u8) -> String {
        format!("{byte:02x}").repeat(32)
    }

    async fn send(router: &Router, method: Method, uri: &str, body: Body) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .expect("request");
        let response = router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes()
            .to_vec();
        (status, bytes)
    }

    async fn send_json(router: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
        let (status, bytes) = send(router, method, uri, Body::empty()).await;
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn declared_file(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(body.as_bytes()).expect("write");
        file
    }

    #[tokio::test]
    async fn put_with_info_is_listed() {
        let app = test_app(None);
        let (status, _) = send(
            &app.router,
            Method::PUT,
            &format!("/{}", key(1)),
            Body::from(r#"{"info":"my doc"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, listed) = send_json(&app.router, Method::GET, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed, serde_json::json!([{ "key": key(1), "info": "my doc" }]));
    }

    #[tokio::test]
    async fn put_get_delete_info_cycle() {
        let app = test_app(None);
        let uri = format!("/{}", key(2));

        let (status, _) = send(&app.router, Method::PUT, &uri, Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(app.store.is_announced(&key(2).parse().unwrap()));

        let (_, listed) = send_json(&app.router, Method::GET, "/").await;
        assert_eq!(listed, serde_json::json!([{ "key": key(2) }]));

        let (status, info) = send_json(&app.router, Method::GET, "/info").await;
        assert_eq!(status, StatusCode::OK);
        let summary = info["info"].as_str().unwrap();
        // The registry root plus the added key.
        assert!(summary.starts_with("Nr announced (served) keys: 2"), "{summary}");
        assert!(info["details"].as_str().unwrap().contains(&key(2)));

        let (status, _) = send(&app.router, Method::DELETE, &uri, Body::empty()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, listed) = send_json(&app.router, Method::GET, "/").await;
        assert_eq!(listed, serde_json::json!([]));

        // Deleting again is still fine.
        let (status, _) = send(&app.router, Method::DELETE, &uri, Body::empty()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn invalid_keys_are_rejected() {
        let app = test_app(None);
        for method in [Method::PUT, Method::DELETE] {
            let (status, body) = send_json(&app.router, method, "/not-a-key").await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(body["error"].as_str().unwrap().contains("Invalid key"));
        }
        let (_, listed) = send_json(&app.router, Method::GET, "/").await;
        assert_eq!(listed, serde_json::json!([]));
    }

    #[tokio::test]
    async fn malformed_put_body_is_rejected() {
        let app = test_app(None);
        let (status, _) = send(
            &app.router,
            Method::PUT,
            &format!("/{}", key(3)),
            Body::from("{not json"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn store_failure_is_internal_error() {
        let app = test_app(None);
        app.store.reject(key(4).parse().unwrap());
        let (status, body) = send_json(&app.router, Method::PUT, &format!("/{}", key(4))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn metrics_are_exposed() {
        let app = test_app(None);
        send(&app.router, Method::PUT, &format!("/{}", key(5)), Body::empty()).await;

        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("rehost_total_cores 2"), "{text}");
        assert!(text.contains("rehost_nr_connections 0"));
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = test_app(None);
        let (status, body) = send_json(&app.router, Method::GET, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn sync_applies_declared_file() {
        let file = declared_file(&format!(
            r#"{{"{}": {{}}, "{}": {{"info": "second"}}}}"#,
            key(6),
            key(7)
        ));
        let app = test_app(Some(file.path().to_path_buf()));
        send(&app.router, Method::PUT, &format!("/{}", key(8)), Body::empty()).await;

        let (status, outcome) = send_json(&app.router, Method::POST, "/sync").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["added"].as_array().unwrap().len(), 2);
        assert_eq!(outcome["removed"], serde_json::json!([key(8)]));

        let (_, listed) = send_json(&app.router, Method::GET, "/").await;
        let keys: Vec<_> = listed
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["key"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(keys, vec![key(6), key(7)]);
    }

    #[tokio::test]
    async fn sync_without_config_path_is_bad_request() {
        let app = test_app(None);
        let (status, body) = send_json(&app.router, Method::POST, "/sync").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["error"],
            "No config path was specified during server startup"
        );
    }

    #[tokio::test]
    async fn sync_with_deleted_file_is_bad_request() {
        let file = declared_file("{}");
        let path = file.path().to_path_buf();
        let app = test_app(Some(path.clone()));
        drop(file);

        let (status, body) = send_json(&app.router, Method::POST, "/sync").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let message = body["error"].as_str().unwrap();
        assert!(
            message.starts_with(&format!("Could not apply the config at {}:", path.display())),
            "{message}"
        );
    }

    #[tokio::test]
    async fn sync_with_failing_key_reports_outcome() {
        let file = declared_file(&format!(r#"{{"{}": {{}}, "{}": {{}}}}"#, key(9), key(10)));
        let app = test_app(Some(file.path().to_path_buf()));
        app.store.reject(key(10).parse().unwrap());

        let (status, outcome) = send_json(&app.router, Method::POST, "/sync").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(outcome["added"], serde_json::json!([key(9)]));
        assert_eq!(outcome["failures"][0]["key"], key(10));
    }
}
