//! API route handlers for the gateway.

use axum::extract::{Form, Multipart, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use studysms_channels::DryRunTransport;
use studysms_core::types::{normalize_phone, parse_date};
use studysms_core::{Direction, NewParticipant, SmsTransport, StudySmsError};
use studysms_scheduler::{ImportFormat, LogEntry, RunGuard, dispatch, import};

use super::server::AppState;

const DEFAULT_LOG_LIMIT: usize = 50;
const TEST_MESSAGE: &str = "This is a test message from the Narratives Project.";

/// Error wrapper that maps [`StudySmsError`] kinds onto HTTP status codes.
pub struct ApiError(StudySmsError);

impl From<StudySmsError> for ApiError {
    fn from(e: StudySmsError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StudySmsError::Validation(_) | StudySmsError::Schema { .. } => StatusCode::BAD_REQUEST,
            StudySmsError::NotFound(_) => StatusCode::NOT_FOUND,
            StudySmsError::Busy(_) => StatusCode::CONFLICT,
            StudySmsError::Transport(_) => StatusCode::BAD_GATEWAY,
            StudySmsError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        let mut body = serde_json::json!({
            "ok": false,
            "kind": self.0.kind(),
            "error": self.0.to_string(),
        });
        if let StudySmsError::Schema { required, found } = &self.0 {
            body["required"] = serde_json::json!(required);
            body["found"] = serde_json::json!(found);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult = std::result::Result<Json<serde_json::Value>, ApiError>;

fn live_transport(state: &AppState) -> Result<Arc<dyn SmsTransport>, ApiError> {
    state.transport.clone().ok_or_else(|| {
        ApiError(StudySmsError::Config(
            "Twilio is not configured; set [twilio] in the config file".into(),
        ))
    })
}

// ─── Public ──────────────────────────────────────

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "participants": state.db.count().unwrap_or_default(),
        "transport": state.transport.as_ref().map(|t| t.name().to_string()),
    }))
}

/// Form fields posted by the provider for an incoming text.
#[derive(Debug, Deserialize)]
pub struct InboundSms {
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "Body", default)]
    pub body: String,
    #[serde(rename = "MessageSid", default)]
    pub message_sid: Option<String>,
}

/// Inbound SMS webhook: log the message and answer with the fixed reply.
pub async fn inbound_sms(
    State(state): State<Arc<AppState>>,
    Form(sms): Form<InboundSms>,
) -> Response {
    let from = normalize_phone(&sms.from).unwrap_or_else(|_| sms.from.trim().to_string());
    tracing::info!("📩 Inbound text from {from}");
    let entry = LogEntry::received(&from, &sms.body, sms.message_sid.as_deref());
    if let Err(e) = state.db.log_message(&entry) {
        tracing::warn!("Failed to log inbound text: {e}");
    }
    (
        [(header::CONTENT_TYPE, "text/xml")],
        twiml_message(&state.config.inbound.reply),
    )
        .into_response()
}

/// `<Response><Message>..</Message></Response>` with the text escaped.
pub fn twiml_message(text: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Message>{}</Message></Response>",
        xml_escape(text)
    )
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

// ─── Dispatch ──────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct DistributeParams {
    /// Override "today" (MM/DD/YYYY).
    pub date: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

/// Run the dispatch loop once. A second request while one is running gets 409.
pub async fn distribute(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DistributeParams>,
) -> ApiResult {
    let Ok(_single_flight) = state.dispatch_lock.try_lock() else {
        return Err(StudySmsError::Busy("a distribution is already in progress".into()).into());
    };
    let _guard = RunGuard::acquire(
        &state.lock_path,
        Duration::from_secs(state.config.schedule.stale_lock_secs),
    )?;

    let today = match params.date.as_deref() {
        Some(raw) => parse_date(raw)?,
        None => state.config.schedule.today()?,
    };

    let report = if params.dry_run {
        let from = state
            .transport
            .as_ref()
            .map(|t| t.from_number().to_string())
            .unwrap_or_else(|| state.config.twilio.from_number.clone());
        dispatch::rehearse(&state.db, &DryRunTransport::new(from), today).await?
    } else {
        let transport = live_transport(&state)?;
        dispatch::run(&state.db, transport.as_ref(), today).await?
    };
    Ok(Json(serde_json::json!({
        "ok": report.is_clean(),
        "sent_count": report.sent_count(),
        "report": report,
    })))
}

// ─── Participants ──────────────────────────────────────

pub async fn list_participants(State(state): State<Arc<AppState>>) -> ApiResult {
    let roster = state.db.roster()?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "count": roster.participants.len(),
        "participants": roster.participants,
        "unreadable": roster.unreadable,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AddParticipant {
    pub subject_name: String,
    pub phone_number: String,
    pub date_of_study: String,
}

pub async fn add_participant(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddParticipant>,
) -> ApiResult {
    let participant =
        NewParticipant::parse(&body.subject_name, &body.phone_number, &body.date_of_study)?;
    let id = state.db.insert(&participant)?;
    tracing::info!("➕ Added participant {} ({})", participant.name, participant.phone_number);
    Ok(Json(serde_json::json!({
        "ok": true,
        "id": id,
        "name": participant.name,
        "phone_number": participant.phone_number,
    })))
}

#[derive(Debug, Deserialize)]
pub struct IgnoreRequest {
    pub subject_name: String,
    pub phone_number: String,
    #[serde(default = "default_true")]
    pub ignore: bool,
}

fn default_true() -> bool {
    true
}

pub async fn set_ignore(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IgnoreRequest>,
) -> ApiResult {
    let outcome = state
        .db
        .set_ignore(&body.subject_name, &body.phone_number, body.ignore)?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "ignore": body.ignore,
        "updated": outcome.updated,
        "duplicate_key": outcome.is_duplicate(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ChangeNumberRequest {
    pub subject_name: String,
    pub old_phone_number: String,
    pub new_phone_number: String,
}

pub async fn change_number(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChangeNumberRequest>,
) -> ApiResult {
    let outcome = state.db.update_phone(
        &body.subject_name,
        &body.old_phone_number,
        &body.new_phone_number,
    )?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "updated": outcome.updated,
        "duplicate_key": outcome.is_duplicate(),
    })))
}

/// Bulk import from a multipart upload (field `file`).
pub async fn import_participants(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| StudySmsError::Validation(format!("Bad upload: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let format = ImportFormat::from_file_name(&file_name)?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| StudySmsError::Validation(format!("Bad upload: {e}")))?;
        let summary = import::import_bytes(&state.db, format, &bytes)?;
        return Ok(Json(serde_json::json!({
            "ok": true,
            "file": file_name,
            "inserted": summary.inserted,
            "skipped": summary.skipped,
        })));
    }
    Err(StudySmsError::Validation("Upload must include a 'file' field".into()).into())
}

// ─── Message log ──────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LogParams {
    pub limit: Option<usize>,
}

impl LogParams {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, 1000)
    }
}

pub async fn outgoing_messages(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogParams>,
) -> ApiResult {
    let messages = state.db.messages(Direction::Outbound, params.limit())?;
    Ok(Json(serde_json::json!({"ok": true, "messages": messages})))
}

pub async fn incoming_messages(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogParams>,
) -> ApiResult {
    let messages = state.db.messages(Direction::Inbound, params.limit())?;
    Ok(Json(serde_json::json!({"ok": true, "messages": messages})))
}

pub async fn failed_messages(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogParams>,
) -> ApiResult {
    let messages = state.db.failures(params.limit())?;
    Ok(Json(serde_json::json!({"ok": true, "messages": messages})))
}

// ─── Admin ──────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TestSmsRequest {
    pub phone_number: String,
    pub body: Option<String>,
}

/// Send a one-off message to check the Twilio setup.
pub async fn test_sms(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TestSmsRequest>,
) -> ApiResult {
    let transport = live_transport(&state)?;
    let to = normalize_phone(&req.phone_number)?;
    let body = req
        .body
        .filter(|b| !b.trim().is_empty())
        .unwrap_or_else(|| TEST_MESSAGE.to_string());

    match transport.send(&to, transport.from_number(), &body).await {
        Ok(receipt) => {
            state
                .db
                .log_message(&LogEntry::sent(&to, &body, None, &receipt.sid))?;
            Ok(Json(serde_json::json!({"ok": true, "sid": receipt.sid, "to": to})))
        }
        Err(e) => {
            let error = e.to_string();
            state
                .db
                .log_message(&LogEntry::failed(&to, &body, None, &error))?;
            Err(e.into())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    #[serde(default)]
    pub confirm: String,
}

/// Delete every participant. Requires `{"confirm": "YES"}` (any case).
pub async fn reset(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResetRequest>,
) -> ApiResult {
    if !req.confirm.trim().eq_ignore_ascii_case("YES") {
        return Err(StudySmsError::Validation("Type YES to confirm the reset".into()).into());
    }
    let deleted = state.db.reset()?;
    Ok(Json(serde_json::json!({"ok": true, "deleted": deleted})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{AppState, build_router};
    use async_trait::async_trait;
    use axum::Router;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Mutex;
    use studysms_core::{SmsReceipt, StudySmsConfig};
    use studysms_scheduler::ParticipantDb;
    use tower::ServiceExt;

    // "Ian:pw1"
    const AUTH: &str = "Basic SWFuOnB3MQ==";

    struct FakeTransport {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SmsTransport for FakeTransport {
        fn name(&self) -> &str {
            "fake"
        }

        fn from_number(&self) -> &str {
            "5550001111"
        }

        async fn send(&self, to: &str, _from: &str, _body: &str) -> studysms_core::Result<SmsReceipt> {
            if to == "5559999999" {
                return Err(StudySmsError::Transport("rejected".into()));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push(to.to_string());
            Ok(SmsReceipt {
                sid: format!("SM{}", sent.len()),
                to: to.into(),
                from: "5550001111".into(),
                status: "queued".into(),
            })
        }
    }

    fn app(test: &str) -> (Router, Arc<ParticipantDb>) {
        let mut config = StudySmsConfig::default();
        config.auth.users.insert("Ian".into(), "pw1".into());
        let dir = std::env::temp_dir().join(format!("studysms-gateway-{test}"));
        std::fs::create_dir_all(&dir).ok();
        config.database.path = dir.join("participants.db").to_string_lossy().to_string();

        let db = Arc::new(ParticipantDb::open_in_memory().unwrap());
        let transport: Arc<dyn SmsTransport> = Arc::new(FakeTransport { sent: Mutex::new(Vec::new()) });
        let state = AppState::new(config, db.clone(), Some(transport));
        (build_router(state), db)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("Authorization", AUTH)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let (app, _) = app("health");
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_staff_routes_require_auth() {
        let (app, _) = app("auth");
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/v1/participants").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        // "Ian:wrong"
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("Authorization", "Basic SWFuOndyb25n")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_add_and_list_participants() {
        let (app, _) = app("add");
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/participants",
                serde_json::json!({
                    "subject_name": "ian ferguson",
                    "phone_number": "650-223-5997",
                    "date_of_study": "06/01/2022"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/participants")
                    .header("Authorization", AUTH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["count"], 1);
        assert_eq!(json["participants"][0]["name"], "Ian Ferguson");
        assert_eq!(json["participants"][0]["date_of_study"], "06/01/2022");
    }

    #[tokio::test]
    async fn test_add_invalid_participant_is_400() {
        let (app, db) = app("invalid");
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/participants",
                serde_json::json!({
                    "subject_name": "Ian Ferguson",
                    "phone_number": "call me",
                    "date_of_study": "06/01/2022"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["kind"], "validation");
        assert_eq!(db.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_distribute_sends_and_stamps() {
        let (app, db) = app("distribute");
        db.insert(&NewParticipant::parse("Ian Ferguson", "6502235997", "06/01/2022").unwrap())
            .unwrap();
        db.insert(&NewParticipant::parse("Bad Number", "5559999999", "06/01/2022").unwrap())
            .unwrap();

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/distribute?date=06/01/2022",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["sent_count"], 1);
        assert_eq!(json["ok"], false);
        assert_eq!(json["report"]["failures"][0]["phone_number"], "5559999999");

        let all = db.get_all().unwrap();
        assert!(all[0].stamp(studysms_core::Stage::Rem1).is_some());
        assert!(all[1].stamps.is_empty());
    }

    #[tokio::test]
    async fn test_distribute_dry_run_writes_nothing() {
        let (app, db) = app("dry-run");
        db.insert(&NewParticipant::parse("Ian Ferguson", "6502235997", "06/01/2022").unwrap())
            .unwrap();

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/distribute?date=06/01/2022&dry_run=true",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["sent_count"], 1);
        assert_eq!(json["report"]["dry_run"], true);
        assert_eq!(json["report"]["transport"], "dry-run");

        assert!(db.get_all().unwrap()[0].stamps.is_empty());
        assert!(db.messages(Direction::Outbound, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_distribute_busy_when_lock_held() {
        let (app, _) = app("busy");
        let lock = std::env::temp_dir()
            .join("studysms-gateway-busy")
            .join("participants.db.lock");
        let _held = RunGuard::acquire(&lock, Duration::from_secs(3600)).unwrap();

        let response = app
            .oneshot(json_request("POST", "/api/v1/distribute", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_ignore_unknown_is_404() {
        let (app, _) = app("ignore");
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/participants/ignore",
                serde_json::json!({"subject_name": "Nobody", "phone_number": "5550000000"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_import_missing_column_is_schema_error() {
        let (app, db) = app("import");
        let boundary = "XBOUNDARY";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"subs.csv\"\r\n\
             Content-Type: text/csv\r\n\r\n\
             subject_name,date_of_study\r\nIan Ferguson,06/01/2022\r\n\
             \r\n--{boundary}--\r\n"
        );
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/participants/import")
                    .header("Authorization", AUTH)
                    .header("Content-Type", format!("multipart/form-data; boundary={boundary}"))
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["kind"], "schema");
        assert_eq!(json["required"][1], "phone_number");
        assert_eq!(db.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_inbound_sms_logged_with_twiml_reply() {
        let (app, db) = app("inbound");
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sms")
                    .header("Content-Type", "application/x-www-form-urlencoded")
                    .body(Body::from("From=%2B16502235997&Body=Is+this+real%3F&MessageSid=SM42"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let xml = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(xml.contains("<Message>Give us a call at (650) 223-5997"));

        let incoming = db.messages(Direction::Inbound, 10).unwrap();
        assert_eq!(incoming[0].phone_number, "6502235997");
        assert_eq!(incoming[0].body, "Is this real?");
    }

    #[tokio::test]
    async fn test_reset_requires_confirmation() {
        let (app, db) = app("reset");
        db.insert(&NewParticipant::parse("Ian Ferguson", "6502235997", "06/01/2022").unwrap())
            .unwrap();

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/v1/reset", serde_json::json!({"confirm": "no"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(db.count().unwrap(), 1);

        let response = app
            .oneshot(json_request("POST", "/api/v1/reset", serde_json::json!({"confirm": " yes "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(db.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_test_sms_logs_outgoing() {
        let (app, db) = app("test-sms");
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/test-sms",
                serde_json::json!({"phone_number": "(650) 223-5997"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let outgoing = db.messages(Direction::Outbound, 10).unwrap();
        assert_eq!(outgoing[0].body, TEST_MESSAGE);
    }

    #[test]
    fn test_twiml_is_escaped() {
        assert_eq!(
            twiml_message("Call <us> & \"ask\""),
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Message>Call &lt;us&gt; &amp; &quot;ask&quot;</Message></Response>"
        );
    }
}
