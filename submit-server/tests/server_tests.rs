// ABOUTME: Tests for the submission server router and the PostgreSQL input log
// ABOUTME: PostgreSQL tests are ignored unless TEST_DATABASE_URL points at a scratch database

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use shape_sync::SyncError;
use submit_server::server::MessageResponse;
use submit_server::{router, InputLog, LogError, PgInputLog};
use tower::ServiceExt;

#[derive(Default)]
struct RecordingLog {
    batches: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl InputLog for RecordingLog {
    async fn append_inputs(&self, inputs: &[String]) -> Result<(), LogError> {
        if let Some(bad) = inputs.iter().find(|i| i.contains("boom")) {
            return Err(SyncError::InvalidInput(format!("cannot apply '{}'", bad)).into());
        }
        self.batches.lock().unwrap().push(inputs.to_vec());
        Ok(())
    }
}

fn submit_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/submit")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn read_message(resp: axum::response::Response) -> MessageResponse {
    let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = router(Arc::new(RecordingLog::default()), &["*".to_string()]);
    let resp = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
    assert_eq!(&bytes[..], b"healthy");
}

#[tokio::test]
async fn test_submit_forwards_batch() {
    let log = Arc::new(RecordingLog::default());
    let app = router(log.clone(), &["*".to_string()]);

    let resp = app
        .oneshot(submit_request(r#"["health:80|xp:5","mana:40"]"#))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(read_message(resp).await.message, "Data processed");
    let batches = log.batches.lock().unwrap();
    assert_eq!(
        *batches,
        vec![vec!["health:80|xp:5".to_string(), "mana:40".to_string()]]
    );
}

#[tokio::test]
async fn test_submit_rejects_malformed_json() {
    let log = Arc::new(RecordingLog::default());
    let app = router(log.clone(), &[]);

    let resp = app.oneshot(submit_request("{not json")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(read_message(resp).await.message.starts_with("Bad request: "));
    assert!(log.batches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_submit_reports_log_failure() {
    let log = Arc::new(RecordingLog::default());
    let app = router(log.clone(), &[]);

    let resp = app
        .oneshot(submit_request(r#"["health:1","boom:2"]"#))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let message = read_message(resp).await.message;
    assert!(message.contains("boom:2"), "unexpected message: {}", message);
    assert!(log.batches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cors_allows_listed_origin() {
    let app = router(
        Arc::new(RecordingLog::default()),
        &["http://localhost:5173".to_string()],
    );

    let resp = app
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/submit")
                .header(header::ORIGIN, "http://localhost:5173")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        resp.headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok()),
        Some("http://localhost:5173")
    );
}

#[tokio::test]
async fn test_cors_omits_unlisted_origin() {
    let app = router(
        Arc::new(RecordingLog::default()),
        &["http://localhost:5173".to_string()],
    );

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .header(header::ORIGIN, "http://evil.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(resp
        .headers()
        .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        .is_none());
}

async fn scratch_log() -> PgInputLog {
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");
    let (client, connection) = tokio_postgres::connect(&url, tokio_postgres::NoTls)
        .await
        .expect("connect to test database");
    tokio::spawn(connection);
    client
        .batch_execute("DROP TABLE IF EXISTS mutable; DROP TABLE IF EXISTS input;")
        .await
        .expect("reset tables");
    PgInputLog::from_client(client, 0)
}

#[tokio::test]
#[ignore]
async fn test_pg_bootstrap_is_one_shot() {
    let log = scratch_log().await;
    assert!(log.bootstrap().await.unwrap());
    assert!(!log.bootstrap().await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_pg_append_prunes_superseded_mutations() {
    let log = scratch_log().await;
    log.bootstrap().await.unwrap();

    log.append_inputs(&["health:80".to_string(), "health:60|xp:5".to_string()])
        .await
        .unwrap();

    let url = std::env::var("TEST_DATABASE_URL").unwrap();
    let (client, connection) = tokio_postgres::connect(&url, tokio_postgres::NoTls)
        .await
        .unwrap();
    tokio::spawn(connection);

    let rows = client
        .query(
            "SELECT key, val, event_id FROM mutable WHERE player_id = 0 ORDER BY key",
            &[],
        )
        .await
        .unwrap();
    let state: Vec<(String, i32, i32)> = rows
        .iter()
        .map(|r| (r.get(0), r.get(1), r.get(2)))
        .collect();
    assert_eq!(
        state,
        vec![
            ("health".to_string(), 60, 2),
            ("mana".to_string(), 100, 0),
            ("xp".to_string(), 5, 2),
        ]
    );
}

#[tokio::test]
#[ignore]
async fn test_pg_append_is_all_or_nothing() {
    let log = scratch_log().await;
    log.bootstrap().await.unwrap();

    let err = log
        .append_inputs(&["health:80".to_string(), "health:abc".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, LogError::Input(_)));

    let url = std::env::var("TEST_DATABASE_URL").unwrap();
    let (client, connection) = tokio_postgres::connect(&url, tokio_postgres::NoTls)
        .await
        .unwrap();
    tokio::spawn(connection);
    let row = client
        .query_one("SELECT COUNT(*) FROM input WHERE player_id = 0", &[])
        .await
        .unwrap();
    let count: i64 = row.get(0);
    assert_eq!(count, 1);
}
