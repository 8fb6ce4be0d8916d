//! HTTP server implementation using Axum.

use axum::extract::DefaultBodyLimit;
use axum::response::{Html, IntoResponse, Response};
use axum::{
    Router,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    routing::{get, post},
};
use base64::Engine;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use studysms_core::{SmsTransport, StudySmsConfig};
use studysms_scheduler::ParticipantDb;

/// Shared state for the gateway server.
pub struct AppState {
    pub config: StudySmsConfig,
    pub db: Arc<ParticipantDb>,
    /// `None` when Twilio credentials are missing; sending routes then fail.
    pub transport: Option<Arc<dyn SmsTransport>>,
    /// Single-flight guard for distribute requests.
    pub dispatch_lock: tokio::sync::Mutex<()>,
    /// Lock file shared with CLI dispatch runs.
    pub lock_path: PathBuf,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: StudySmsConfig,
        db: Arc<ParticipantDb>,
        transport: Option<Arc<dyn SmsTransport>>,
    ) -> Self {
        let lock_path = config.database.lock_path();
        Self {
            config,
            db,
            transport,
            dispatch_lock: tokio::sync::Mutex::new(()),
            lock_path,
            start_time: Instant::now(),
        }
    }
}

/// Serve the dashboard HTML page.
async fn dashboard_page() -> Html<&'static str> {
    Html(super::dashboard::dashboard_html())
}

/// HTTP basic auth against `auth.users`.
async fn require_basic_auth(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let credentials = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_basic_auth);

    match credentials {
        Some((user, password)) if state.config.auth.verify(&user, &password) => {
            tracing::debug!("Authenticated staff user '{user}'");
            next.run(req).await
        }
        Some((user, _)) => {
            tracing::warn!("🔒 Rejected login for '{user}'");
            unauthorized()
        }
        None => unauthorized(),
    }
}

/// Decode `Basic <base64(user:password)>`.
pub fn parse_basic_auth(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?.trim();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn unauthorized() -> Response {
    let mut response = (
        StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({"ok": false, "error": "Unauthorized"})),
    )
        .into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"studysms\", charset=\"UTF-8\""),
    );
    response
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    let upload_limit = shared.config.gateway.max_upload_bytes;

    // Protected routes: staff only
    let protected = Router::new()
        .route("/", get(dashboard_page))
        .route("/api/v1/distribute", post(super::routes::distribute))
        .route(
            "/api/v1/participants",
            get(super::routes::list_participants).post(super::routes::add_participant),
        )
        .route("/api/v1/participants/ignore", post(super::routes::set_ignore))
        .route("/api/v1/participants/phone", post(super::routes::change_number))
        .route(
            "/api/v1/participants/import",
            post(super::routes::import_participants).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/v1/messages/outgoing", get(super::routes::outgoing_messages))
        .route("/api/v1/messages/incoming", get(super::routes::incoming_messages))
        .route("/api/v1/messages/failures", get(super::routes::failed_messages))
        .route("/api/v1/test-sms", post(super::routes::test_sms))
        .route("/api/v1/reset", post(super::routes::reset))
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_basic_auth,
        ));

    // Public routes: health check and the provider's inbound webhook
    let public = Router::new()
        .route("/health", get(super::routes::health_check))
        .route("/sms", post(super::routes::inbound_sms));

    protected
        .merge(public)
        .layer(
            CorsLayer::new()
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                .allow_headers(Any)
                .allow_origin(Any)
                .max_age(std::time::Duration::from_secs(3600)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server.
pub async fn start(state: AppState) -> anyhow::Result<()> {
    if state.config.auth.users.is_empty() {
        tracing::warn!("⚠️ No [auth.users] configured: every staff request will be rejected");
    }
    if state.transport.is_none() {
        tracing::warn!("⚠️ Twilio not configured: distribute and test-sms will fail");
    }

    let addr = format!("{}:{}", state.config.gateway.host, state.config.gateway.port);
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 studysms listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_auth() {
        // "Ian:pw1"
        assert_eq!(
            parse_basic_auth("Basic SWFuOnB3MQ=="),
            Some(("Ian".to_string(), "pw1".to_string()))
        );
        assert_eq!(parse_basic_auth("Bearer SWFuOnB3MQ=="), None);
        assert_eq!(parse_basic_auth("Basic !!!"), None);
        // "nocolon"
        assert_eq!(parse_basic_auth("Basic bm9jb2xvbg=="), None);
    }
}
