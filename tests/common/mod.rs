//! Common test utilities and helpers.

use measurement_upload_server::{
    config::{
        AuthConfig, Config, GoogleConfig, LoggingConfig, MongoConfig, ServerConfig,
        StorageConfig, StorageType, UploadConfig,
    },
    create_router, AppState,
};
use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener as TokioTcpListener;

/// Device UUID used throughout the protocol tests
pub const DEVICE_ID: &str = "78370516-4f7e-11ed-bdc3-0242ac120002";

/// Test server instance
pub struct TestServer {
    pub base_url: String,
    pub state: AppState,
    pub data_dir: TempDir,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    /// Start a test server with default test configuration
    pub async fn start() -> Self {
        Self::start_custom(|_| {}).await
    }

    /// Start a test server after tweaking the configuration
    pub async fn start_custom(customize: impl FnOnce(&mut Config)) -> Self {
        let port = get_available_port();
        let data_dir = TempDir::new().expect("Failed to create temp dir");
        let base_url = format!("http://127.0.0.1:{}", port);

        let mut config = create_test_config(&data_dir, port, &base_url);
        customize(&mut config);

        let state = AppState::new(config)
            .await
            .expect("Failed to create app state");

        let app = create_router(state.clone());

        let addr: std::net::SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let listener = TokioTcpListener::bind(addr)
            .await
            .expect("Failed to bind listener");

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        // Start server in background
        tokio::spawn(async move {
            tokio::select! {
                _ = axum::serve(listener, app) => {}
                _ = shutdown_rx => {}
            }
        });

        // Give the server time to start
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            base_url,
            state,
            data_dir,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Get HTTP client.
    ///
    /// Redirects stay unfollowed because 308 is a protocol answer here,
    /// not a relocation.
    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap()
    }

    /// Absolute URL under the API endpoint
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    /// Absolute URL outside the API endpoint
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Where a finalized object lands on disk (local backend)
    pub fn object_path(&self, device_id: &str, measurement_id: &str, file_type: &str) -> PathBuf {
        self.data_dir
            .path()
            .join("data")
            .join("objects")
            .join(device_id)
            .join(measurement_id)
            .join(file_type)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Create test configuration
fn create_test_config(data_dir: &TempDir, port: u16, base_url: &str) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port,
            base_url: base_url.to_string(),
            http_endpoint: "/api/v1".to_string(),
        },
        storage: StorageConfig {
            storage_type: StorageType::Local,
            data_dir: data_dir.path().join("data"),
        },
        upload: UploadConfig {
            upload_folder: data_dir.path().join("uploads"),
            measurement_payload_limit: 10 * 1024 * 1024,
            pre_request_limit: 1024,
            upload_expiration_ms: 300_000,
        },
        logging: LoggingConfig {
            level: "warn".to_string(),
            format: "pretty".to_string(),
        },
        auth: AuthConfig::default(),
        mongodb: MongoConfig::default(),
        google: GoogleConfig::default(),
    }
}

/// Find an available TCP port
fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

/// A valid measurement metadata envelope
pub fn metadata_json(measurement_id: &str) -> serde_json::Value {
    serde_json::json!({
        "deviceId": DEVICE_ID,
        "measurementId": measurement_id,
        "osVersion": "Android 13",
        "deviceType": "Pixel 6",
        "applicationVersion": "3.2.0",
        "length": 1021.5,
        "locationCount": 0,
        "modality": "BICYCLE",
        "formatVersion": 3
    })
}

/// A valid attachment metadata envelope
pub fn attachment_json(measurement_id: &str, files_size: u64) -> serde_json::Value {
    let mut envelope = metadata_json(measurement_id);
    let object = envelope.as_object_mut().unwrap();
    object.insert("logCount".to_string(), serde_json::json!(1));
    object.insert("imageCount".to_string(), serde_json::json!(2));
    object.insert("videoCount".to_string(), serde_json::json!(0));
    object.insert("filesSize".to_string(), serde_json::json!(files_size));
    envelope
}

/// Send a measurement pre-request and return the upload URL from `Location`
pub async fn announce_measurement(
    server: &TestServer,
    client: &reqwest::Client,
    measurement_id: &str,
) -> String {
    let response = client
        .post(server.endpoint("/measurements"))
        .header("Content-Type", "application/json; charset=UTF-8")
        .body(metadata_json(measurement_id).to_string())
        .send()
        .await
        .expect("Failed to send pre-request");

    assert_eq!(response.status(), 200, "pre-request not accepted");

    response
        .headers()
        .get("location")
        .expect("no Location header on pre-request response")
        .to_str()
        .unwrap()
        .to_string()
}

/// PUT one chunk against an upload URL
pub async fn put_chunk(
    client: &reqwest::Client,
    upload_url: &str,
    from: u64,
    to: u64,
    total: u64,
    body: Vec<u8>,
) -> reqwest::Response {
    client
        .put(upload_url)
        .header("Content-Type", "application/octet-stream")
        .header("Content-Range", format!("bytes {}-{}/{}", from, to, total))
        .body(body)
        .send()
        .await
        .expect("Failed to send chunk")
}

/// PUT a status probe against an upload URL
pub async fn put_status(
    client: &reqwest::Client,
    upload_url: &str,
    total: u64,
) -> reqwest::Response {
    client
        .put(upload_url)
        .header("Content-Range", format!("bytes */{}", total))
        .send()
        .await
        .expect("Failed to send status probe")
}

/// Run a complete measurement upload, asserting the final 201
pub async fn upload_measurement(
    server: &TestServer,
    client: &reqwest::Client,
    measurement_id: &str,
    bytes: &[u8],
) -> String {
    let upload_url = announce_measurement(server, client, measurement_id).await;
    let total = bytes.len() as u64;

    let response = put_chunk(client, &upload_url, 0, total - 1, total, bytes.to_vec()).await;
    assert_eq!(response.status(), 201, "upload not committed");

    upload_url
}
