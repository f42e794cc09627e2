//! # Measurement Upload Server
//!
//! An ingestion server for large binary sensor measurements uploaded from
//! mobile devices over unreliable links.
//!
//! ## Features
//!
//! - **Resumable Uploads**: chunked uploads survive dropped connections;
//!   clients query their position and continue where they left off
//! - **Deduplication**: each `(device, measurement, file type)` slot is
//!   stored exactly once
//! - **Attachments**: logs, images and videos travel next to their parent
//!   measurement
//! - **Pluggable Storage**: local filesystem, MongoDB GridFS, or a cloud
//!   blob bucket
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                   HTTP Server                    │
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────┐  │
//! │  │ Measurements │ │ Attachments  │ │  Health  │  │
//! │  └──────────────┘ └──────────────┘ └──────────┘  │
//! ├──────────────────────────────────────────────────┤
//! │                    Services                      │
//! │  ┌──────────────┐ ┌──────────────────────────┐   │
//! │  │   Session    │ │     Storage Backend      │   │
//! │  │   Registry   │ │ (local | gridfs | google)│   │
//! │  └──────────────┘ └──────────────────────────┘   │
//! ├──────────────────────────────────────────────────┤
//! │     Upload Folder / RocksDB / MongoDB / GCS      │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Start the server
//! cargo run --release
//!
//! # Announce an upload
//! curl -X POST http://localhost:8080/api/v1/measurements \
//!   -H "Content-Type: application/json; charset=UTF-8" \
//!   -d @metadata.json -i
//!
//! # Stream the bytes to the returned Location, one chunk at a time
//! curl -X PUT "<location>" \
//!   -H "Content-Range: bytes 0-1048575/4194304" \
//!   --data-binary @chunk0
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod state;

pub use config::Config;
pub use error::{AppError, Result};
pub use middleware::BearerAuth;
pub use state::AppState;

use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info};

/// Run the measurement upload server with the given configuration.
pub async fn run(config: Config) -> anyhow::Result<()> {
    // Create application state (connects to the configured backend)
    let state = AppState::new(config.clone()).await?;

    let app = create_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .expect("Invalid server address");

    info!(
        address = %addr,
        endpoint = %config.server.http_endpoint,
        "Measurement upload server starting"
    );

    // Start the temp-file janitor
    let janitor_state = state.clone();
    tokio::spawn(async move {
        janitor_task(janitor_state).await;
    });

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Principal attachment (from config)
    let auth = BearerAuth::new(&state.config.auth);

    if state.config.auth.enabled {
        info!(
            tokens_count = state.config.auth.tokens.len(),
            "Bearer token authentication enabled"
        );
    }

    let api = handlers::measurements::routes(&state.config)
        .merge(handlers::attachments::routes(&state.config));

    let endpoint = state.config.server.http_endpoint.clone();

    Router::new()
        .nest(&endpoint, api)
        .nest("/health", handlers::health::routes())
        .layer(cors)
        .layer(auth.layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Background task sweeping abandoned uploads.
///
/// Runs on the upload expiration period: a partial file has to survive at
/// least one full window untouched before it is removed.
async fn janitor_task(state: AppState) {
    let period = state.upload_expiration();

    loop {
        tokio::time::sleep(period).await;

        let (files, sessions) = state.run_janitor_sweep().await;

        if files > 0 || sessions > 0 {
            debug!(files = files, sessions = sessions, "Janitor sweep finished");
        }
    }
}
