//! Bearer-token authentication integration tests.

mod common;

use common::{metadata_json, TestServer};
use measurement_upload_server::config::TokenEntry;

fn enable_auth(config: &mut measurement_upload_server::Config) {
    config.auth.enabled = true;
    config.auth.tokens = vec![TokenEntry {
        token: "secret123".to_string(),
        user_id: "user-1".to_string(),
        username: "tester".to_string(),
    }];
}

#[tokio::test]
async fn test_pre_request_requires_token() {
    let server = TestServer::start_custom(enable_auth).await;
    let client = server.client();

    let response = client
        .post(server.endpoint("/measurements"))
        .header("Content-Type", "application/json; charset=UTF-8")
        .body(metadata_json("1").to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_pre_request_with_valid_token() {
    let server = TestServer::start_custom(enable_auth).await;
    let client = server.client();

    let response = client
        .post(server.endpoint("/measurements"))
        .header("Content-Type", "application/json; charset=UTF-8")
        .header("Authorization", "Bearer secret123")
        .body(metadata_json("1").to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response.headers().get("location").is_some());
}

#[tokio::test]
async fn test_unknown_token_is_rejected() {
    let server = TestServer::start_custom(enable_auth).await;
    let client = server.client();

    let response = client
        .post(server.endpoint("/measurements"))
        .header("Content-Type", "application/json; charset=UTF-8")
        .header("Authorization", "Bearer wrong")
        .body(metadata_json("1").to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_health_stays_public() {
    let server = TestServer::start_custom(enable_auth).await;
    let client = server.client();

    let response = client
        .get(server.url("/health/live"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
}
