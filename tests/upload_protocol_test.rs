//! Upload protocol integration tests: status probes, chunk sequencing,
//! resume behavior and commit.

mod common;

use common::{
    announce_measurement, put_chunk, put_status, upload_measurement, TestServer, DEVICE_ID,
};

#[tokio::test]
async fn test_status_on_empty_session() {
    let server = TestServer::start().await;
    let client = server.client();

    let upload_url = announce_measurement(&server, &client, "1").await;

    let response = put_status(&client, &upload_url, 20).await;
    assert_eq!(response.status(), 308);
    assert!(response.headers().get("range").is_none());
    assert_eq!(response.headers().get("content-length").unwrap(), "0");
}

#[tokio::test]
async fn test_chunked_upload_full_flow() {
    let server = TestServer::start().await;
    let client = server.client();

    let payload = b"0123456789abcde";
    let upload_url = announce_measurement(&server, &client, "1").await;

    let response = put_chunk(&client, &upload_url, 0, 4, 15, payload[0..5].to_vec()).await;
    assert_eq!(response.status(), 308);
    assert_eq!(response.headers().get("range").unwrap(), "bytes=0-4");

    let response = put_chunk(&client, &upload_url, 5, 9, 15, payload[5..10].to_vec()).await;
    assert_eq!(response.status(), 308);
    assert_eq!(response.headers().get("range").unwrap(), "bytes=0-9");

    let response = put_chunk(&client, &upload_url, 10, 14, 15, payload[10..15].to_vec()).await;
    assert_eq!(response.status(), 201);

    // The finalized object is byte-for-byte the uploaded payload
    let object = server.object_path(DEVICE_ID, "1", "measurement");
    let stored = std::fs::read(object).expect("finalized object missing");
    assert_eq!(stored, payload);
}

#[tokio::test]
async fn test_status_reflects_progress_and_is_idempotent() {
    let server = TestServer::start().await;
    let client = server.client();

    let upload_url = announce_measurement(&server, &client, "1").await;
    put_chunk(&client, &upload_url, 0, 4, 15, b"01234".to_vec()).await;

    let first = put_status(&client, &upload_url, 15).await;
    assert_eq!(first.status(), 308);
    assert_eq!(first.headers().get("range").unwrap(), "bytes=0-4");

    // A probe does not change the answer of the next probe
    let second = put_status(&client, &upload_url, 15).await;
    assert_eq!(second.status(), 308);
    assert_eq!(second.headers().get("range").unwrap(), "bytes=0-4");
}

#[tokio::test]
async fn test_out_of_order_chunk_is_rejected_without_growth() {
    let server = TestServer::start().await;
    let client = server.client();

    let upload_url = announce_measurement(&server, &client, "1").await;
    put_chunk(&client, &upload_url, 0, 4, 15, b"01234".to_vec()).await;

    // Skipping the middle chunk: answered with the canonical position
    let response = put_chunk(&client, &upload_url, 10, 14, 15, b"abcde".to_vec()).await;
    assert_eq!(response.status(), 308);
    assert_eq!(response.headers().get("range").unwrap(), "bytes=0-4");

    // Nothing landed
    let response = put_status(&client, &upload_url, 15).await;
    assert_eq!(response.headers().get("range").unwrap(), "bytes=0-4");

    // The upload continues normally from the acknowledged position
    let response = put_chunk(&client, &upload_url, 5, 9, 15, b"56789".to_vec()).await;
    assert_eq!(response.status(), 308);
    assert_eq!(response.headers().get("range").unwrap(), "bytes=0-9");
}

#[tokio::test]
async fn test_replayed_chunk_is_rejected_without_growth() {
    let server = TestServer::start().await;
    let client = server.client();

    let upload_url = announce_measurement(&server, &client, "1").await;
    put_chunk(&client, &upload_url, 0, 4, 15, b"01234".to_vec()).await;

    let response = put_chunk(&client, &upload_url, 0, 4, 15, b"01234".to_vec()).await;
    assert_eq!(response.status(), 308);
    assert_eq!(response.headers().get("range").unwrap(), "bytes=0-4");
}

#[tokio::test]
async fn test_oversized_chunk_is_rejected_before_storing() {
    let server = TestServer::start_custom(|config| {
        config.upload.measurement_payload_limit = 1024;
    })
    .await;
    let client = server.client();

    let upload_url = announce_measurement(&server, &client, "1").await;

    // Declares 2000 bytes against a 1024 byte ceiling
    let response = put_chunk(&client, &upload_url, 0, 1999, 4000, vec![0u8; 2000]).await;
    assert_eq!(response.status(), 422);

    // The session is gone: a malformed chunk cannot be resumed
    let response = put_status(&client, &upload_url, 4000).await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_malformed_content_range_headers() {
    let server = TestServer::start().await;
    let client = server.client();

    let upload_url = announce_measurement(&server, &client, "1").await;

    for header in ["bytes 20", "bytes */", "bytes *", "0-4/15", "bytes 5-4/15"] {
        let response = client
            .put(&upload_url)
            .header("Content-Range", header)
            .body(Vec::<u8>::new())
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 422, "accepted header {:?}", header);
    }

    let response = client
        .put(&upload_url)
        .body(Vec::<u8>::new())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422, "accepted missing header");
}

#[tokio::test]
async fn test_unknown_session_token() {
    let server = TestServer::start().await;
    let client = server.client();

    let url = server.endpoint("/measurements/(00000000000000000000000000000000)/");
    let response = put_status(&client, &url, 20).await;
    assert_eq!(response.status(), 404);

    // Tokens outside the parenthesized 32-hex form never resolve
    let url = server.endpoint("/measurements/not-a-token/");
    let response = put_status(&client, &url, 20).await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_status_after_commit() {
    let server = TestServer::start().await;
    let client = server.client();

    let upload_url = upload_measurement(&server, &client, "1", b"helloworld").await;

    // The session ends with the commit
    let response = put_status(&client, &upload_url, 10).await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_single_chunk_upload() {
    let server = TestServer::start().await;
    let client = server.client();

    let upload_url = announce_measurement(&server, &client, "1").await;

    let response = put_chunk(&client, &upload_url, 0, 9, 10, b"helloworld".to_vec()).await;
    assert_eq!(response.status(), 201);

    let stored = std::fs::read(server.object_path(DEVICE_ID, "1", "measurement")).unwrap();
    assert_eq!(stored, b"helloworld");
}

#[tokio::test]
async fn test_body_shorter_than_declared_range_fails_upload() {
    let server = TestServer::start().await;
    let client = server.client();

    let upload_url = announce_measurement(&server, &client, "1").await;

    // Declares bytes 0-9 but carries only 4
    let response = put_chunk(&client, &upload_url, 0, 9, 20, b"0123".to_vec()).await;
    assert_eq!(response.status(), 500);

    // The inconsistent session was discarded
    let response = put_status(&client, &upload_url, 20).await;
    assert_eq!(response.status(), 404);
}
