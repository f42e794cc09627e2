//! Attachment upload integration tests.

mod common;

use common::{
    attachment_json, put_chunk, put_status, upload_measurement, TestServer, DEVICE_ID,
};

async fn announce_attachment(
    server: &TestServer,
    client: &reqwest::Client,
    measurement_id: &str,
    files_size: u64,
) -> reqwest::Response {
    client
        .post(server.endpoint(&format!(
            "/measurements/{}/{}/attachments",
            DEVICE_ID, measurement_id
        )))
        .header("Content-Type", "application/json; charset=UTF-8")
        .body(attachment_json(measurement_id, files_size).to_string())
        .send()
        .await
        .expect("Failed to send attachment pre-request")
}

#[tokio::test]
async fn test_attachment_requires_stored_parent() {
    let server = TestServer::start().await;
    let client = server.client();

    let response = announce_attachment(&server, &client, "1", 10).await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_attachment_full_flow() {
    let server = TestServer::start().await;
    let client = server.client();

    upload_measurement(&server, &client, "1", b"measurement-bytes").await;

    let response = announce_attachment(&server, &client, "1", 10).await;
    assert_eq!(response.status(), 200);

    let upload_url = response
        .headers()
        .get("location")
        .expect("no Location header")
        .to_str()
        .unwrap()
        .to_string();

    let prefix = server.endpoint(&format!("/measurements/{}/1/attachments/(", DEVICE_ID));
    assert!(
        upload_url.starts_with(&prefix),
        "unexpected Location {}",
        upload_url
    );
    assert!(upload_url.ends_with(")/"));

    // Two chunks, then commit
    let response = put_chunk(&client, &upload_url, 0, 4, 10, b"log-f".to_vec()).await;
    assert_eq!(response.status(), 308);
    assert_eq!(response.headers().get("range").unwrap(), "bytes=0-4");

    let response = put_chunk(&client, &upload_url, 5, 9, 10, b"iles!".to_vec()).await;
    assert_eq!(response.status(), 201);

    let stored = std::fs::read(server.object_path(DEVICE_ID, "1", "attachment")).unwrap();
    assert_eq!(stored, b"log-files!");
}

#[tokio::test]
async fn test_attachment_conflict_after_commit() {
    let server = TestServer::start().await;
    let client = server.client();

    upload_measurement(&server, &client, "1", b"measurement-bytes").await;

    let response = announce_attachment(&server, &client, "1", 5).await;
    let upload_url = response.headers().get("location").unwrap().to_str().unwrap().to_string();
    let response = put_chunk(&client, &upload_url, 0, 4, 5, b"aaaaa".to_vec()).await;
    assert_eq!(response.status(), 201);

    // The attachment slot for this measurement is taken
    let response = announce_attachment(&server, &client, "1", 5).await;
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn test_attachment_path_and_envelope_must_agree() {
    let server = TestServer::start().await;
    let client = server.client();

    upload_measurement(&server, &client, "1", b"measurement-bytes").await;

    // Envelope declares measurement 1, path says 2
    let response = client
        .post(server.endpoint(&format!("/measurements/{}/2/attachments", DEVICE_ID)))
        .header("Content-Type", "application/json; charset=UTF-8")
        .body(attachment_json("1", 10).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);

    // Envelope declares a different device than the path
    let other_device = "00000000-4f7e-11ed-bdc3-0242ac120002";
    let response = client
        .post(server.endpoint(&format!("/measurements/{}/1/attachments", other_device)))
        .header("Content-Type", "application/json; charset=UTF-8")
        .body(attachment_json("1", 10).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);
}

#[tokio::test]
async fn test_attachment_token_bound_to_its_slot() {
    let server = TestServer::start().await;
    let client = server.client();

    upload_measurement(&server, &client, "1", b"measurement-one").await;
    upload_measurement(&server, &client, "2", b"measurement-two").await;

    let response = announce_attachment(&server, &client, "1", 10).await;
    let upload_url = response.headers().get("location").unwrap().to_str().unwrap().to_string();

    // The same token under another measurement's path does not resolve
    let foreign_url = upload_url.replace("/1/attachments", "/2/attachments");
    let response = put_status(&client, &foreign_url, 10).await;
    assert_eq!(response.status(), 404);

    // On its own path the session is alive
    let response = put_status(&client, &upload_url, 10).await;
    assert_eq!(response.status(), 308);
}

#[tokio::test]
async fn test_attachment_rejects_negative_inventory() {
    let server = TestServer::start().await;
    let client = server.client();

    upload_measurement(&server, &client, "1", b"measurement-bytes").await;

    let mut envelope = attachment_json("1", 10);
    envelope["logCount"] = serde_json::json!(-1);

    let response = client
        .post(server.endpoint(&format!("/measurements/{}/1/attachments", DEVICE_ID)))
        .header("Content-Type", "application/json; charset=UTF-8")
        .body(envelope.to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 422);
}
