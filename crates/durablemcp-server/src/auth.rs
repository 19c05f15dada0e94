//! Bearer authentication and access-token propagation.
//!
//! Two concerns compose here, mirroring the middleware split on the HTTP
//! side: verifying the bearer token on every request (rejecting with 401
//! before any MCP work), and carrying the verified [`AccessToken`] into the
//! session servicer, which may run in another process and cannot read
//! request-local state. Per-tool authorization is the tool body's concern;
//! it reads the token from its durable context and checks scopes itself.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tower::{Layer, Service};

use crate::error::ServerError;

/// A verified bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    /// The raw token.
    pub token: String,
    /// Client id the token was issued to.
    pub client_id: String,
    /// Granted scopes.
    pub scopes: Vec<String>,
    /// Expiry, when the verifier knows one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    /// Whether the token carries a scope.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// Fail with [`ServerError::PermissionDenied`] unless the token
    /// carries `scope`.
    pub fn require_scope(&self, scope: &str) -> Result<(), ServerError> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(ServerError::permission_denied(format!(
                "missing required scope '{scope}'"
            )))
        }
    }
}

/// The pluggable token verifier.
#[async_trait::async_trait]
pub trait TokenVerifier: Send + Sync + 'static {
    /// Verify a bearer token. `None` means invalid.
    async fn verify(&self, token: &str) -> Option<AccessToken>;
}

/// Authentication settings.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Scopes every request must carry, enforced at the transport layer.
    pub required_scopes: Vec<String>,
}

pub(crate) struct AuthState {
    pub(crate) config: AuthConfig,
    pub(crate) verifier: Arc<dyn TokenVerifier>,
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("required_scopes", &self.config.required_scopes)
            .finish()
    }
}

/// Tower layer installing bearer authentication in front of the MCP
/// endpoint.
#[derive(Debug, Clone)]
pub struct AuthLayer {
    state: Arc<AuthState>,
}

impl AuthLayer {
    /// Create a layer from settings and a verifier.
    pub fn new(config: AuthConfig, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            state: Arc::new(AuthState { config, verifier }),
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            state: Arc::clone(&self.state),
        }
    }
}

/// Tower service that verifies the bearer token, injects the resulting
/// [`AccessToken`] into request extensions, and rejects unauthenticated
/// requests before they reach the transport.
#[derive(Debug, Clone)]
pub struct AuthService<S> {
    inner: S,
    state: Arc<AuthState>,
}

fn bearer_token(request: &Request<Body>) -> Option<String> {
    let value = request.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
        Some(token.to_string())
    } else {
        None
    }
}

fn reject(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

impl<S> Service<Request<Body>> for AuthService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let state = Arc::clone(&self.state);
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let Some(token) = bearer_token(&request) else {
                tracing::debug!("rejecting request without bearer token");
                return Ok(reject(StatusCode::UNAUTHORIZED, "missing bearer token"));
            };

            let Some(access_token) = state.verifier.verify(&token).await else {
                tracing::debug!("rejecting request with invalid bearer token");
                return Ok(reject(StatusCode::UNAUTHORIZED, "invalid bearer token"));
            };

            if let Some(expires_at) = access_token.expires_at
                && expires_at <= Utc::now()
            {
                tracing::debug!(client_id = %access_token.client_id, "rejecting expired token");
                return Ok(reject(StatusCode::UNAUTHORIZED, "token expired"));
            }

            for scope in &state.config.required_scopes {
                if !access_token.has_scope(scope) {
                    tracing::debug!(
                        client_id = %access_token.client_id,
                        scope,
                        "rejecting token missing required scope"
                    );
                    return Ok(reject(StatusCode::FORBIDDEN, "insufficient scope"));
                }
            }

            request.extensions_mut().insert(access_token);
            inner.call(request).await
        })
    }
}
