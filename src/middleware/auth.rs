//! Bearer-token principal middleware.
//!
//! Token validation proper (issuing, signing, expiry) happens in front of
//! this server; this middleware only resolves an accepted token to the
//! [`Principal`] the upload is attributed to and attaches it to the request.
//! Handlers pick the principal up through the `Extension` extractor.
//!
//! With authentication disabled every request runs as the anonymous
//! principal, which is what tests and single-tenant deployments use.
//!
//! # Example
//!
//! ```rust,ignore
//! let auth = BearerAuth::new(&config.auth);
//! let app = Router::new()
//!     .route("/measurements", post(pre_request))
//!     .layer(auth.layer());
//! ```

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
};
use std::{
    collections::HashMap,
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::models::Principal;

/// Bearer-token authentication middleware
#[derive(Clone)]
pub struct BearerAuth {
    /// Accepted tokens and the principals they resolve to
    principals: Arc<HashMap<String, Principal>>,
    /// Whether tokens are required
    enabled: bool,
}

impl BearerAuth {
    /// Create a new authenticator from configuration
    pub fn new(config: &AuthConfig) -> Self {
        let principals: HashMap<String, Principal> = config
            .tokens
            .iter()
            .map(|entry| {
                (
                    entry.token.clone(),
                    Principal {
                        user_id: entry.user_id.clone(),
                        username: entry.username.clone(),
                    },
                )
            })
            .collect();

        Self {
            principals: Arc::new(principals),
            enabled: config.enabled,
        }
    }

    /// Create a Tower Layer for this authenticator
    pub fn layer(&self) -> BearerAuthLayer {
        BearerAuthLayer { auth: self.clone() }
    }

    /// Resolve a token to its principal
    fn resolve(&self, token: &str) -> Option<Principal> {
        self.principals.get(token).cloned()
    }

    /// Probes stay reachable without credentials
    fn is_public(path: &str) -> bool {
        path.starts_with("/health")
    }
}

/// Tower Layer for bearer-token authentication
#[derive(Clone)]
pub struct BearerAuthLayer {
    auth: BearerAuth,
}

impl<S> Layer<S> for BearerAuthLayer {
    type Service = BearerAuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BearerAuthMiddleware {
            inner,
            auth: self.auth.clone(),
        }
    }
}

/// Bearer-token authentication middleware service
#[derive(Clone)]
pub struct BearerAuthMiddleware<S> {
    inner: S,
    auth: BearerAuth,
}

impl<S> Service<Request<Body>> for BearerAuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let path = req.uri().path().to_string();
        let mut inner = self.inner.clone();

        if BearerAuth::is_public(&path) {
            return Box::pin(async move { inner.call(req).await });
        }

        if !self.auth.enabled {
            req.extensions_mut().insert(Principal::anonymous());
            return Box::pin(async move { inner.call(req).await });
        }

        let principal = extract_bearer_token(&req).and_then(|token| self.auth.resolve(&token));

        Box::pin(async move {
            match principal {
                Some(principal) => {
                    debug!(path = %path, user_id = %principal.user_id, "Authenticated request");
                    req.extensions_mut().insert(principal);
                    inner.call(req).await
                }
                None => {
                    warn!(path = %path, "Missing or unknown bearer token");
                    Ok(unauthorized_response("Valid bearer token required"))
                }
            }
        })
    }
}

/// Extract the bearer token from the Authorization header
fn extract_bearer_token<B>(req: &Request<B>) -> Option<String> {
    let auth_header = req.headers().get("authorization")?;
    let auth_str = auth_header.to_str().ok()?;
    auth_str.strip_prefix("Bearer ").map(|token| token.to_string())
}

/// Create unauthorized response
fn unauthorized_response(message: &str) -> Response {
    let body = serde_json::json!({
        "error": "unauthorized",
        "message": message,
        "status": 401
    });

    (
        StatusCode::UNAUTHORIZED,
        [
            ("content-type", "application/json"),
            ("www-authenticate", "Bearer"),
        ],
        body.to_string(),
    )
        .into_response()
}
