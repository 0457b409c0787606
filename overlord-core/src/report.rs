//! Reporter endpoint: HTTP ingestion of minion lifecycle events plus the
//! health, status, queue, and answer-poll routes, and the chat webhook.
//!
//! Handlers always answer with structured JSON (`{"ok":…}` for ingestion
//! routes) and never leak a stack trace; anything unexpected becomes a 500
//! with a reason string. Event dispatch happens on a closed set of kinds,
//! parsed before any state is touched.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::chat::chat_event_from_payload;
use crate::minion::EvaluationRecord;
use crate::overlord::Overlord;

/// The closed set of minion lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Heartbeat,
    Progress,
    Question,
    Complete,
    Error,
}

impl EventKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "heartbeat" => Some(Self::Heartbeat),
            "progress" => Some(Self::Progress),
            "question" => Some(Self::Question),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// A validated `/minion/report` payload.
#[derive(Debug, Clone)]
pub struct MinionReport {
    pub minion_id: String,
    pub event: EventKind,
    pub issue: Option<u64>,
    pub message: Option<String>,
    pub data: Map<String, Value>,
    pub correlation_id: Option<String>,
}

/// How report handling failed, mapped onto status codes by the handler.
#[derive(Debug)]
pub enum ReportError {
    UnknownMinion,
    Internal(String),
}

impl ReportError {
    pub(crate) fn internal(e: impl std::fmt::Display) -> Self {
        Self::Internal(e.to_string())
    }
}

/// Validate the raw report body. Missing or malformed required fields are
/// the caller's fault (400), described precisely.
fn parse_report(value: &Value) -> Result<MinionReport, String> {
    let minion_id = value
        .get("minion_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or("missing minion_id")?
        .to_string();
    let event_text = value
        .get("event")
        .and_then(Value::as_str)
        .ok_or("missing event")?;
    let event =
        EventKind::parse(event_text).ok_or_else(|| format!("unknown event `{event_text}`"))?;

    Ok(MinionReport {
        minion_id,
        event,
        issue: value.get("issue").and_then(Value::as_u64),
        message: value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        data: value
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
        correlation_id: value
            .get("correlation_id")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Build the reporter endpoint router.
pub fn router(overlord: Arc<Overlord>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/queue", get(queue))
        .route("/minion/report", post(minion_report))
        .route("/minion/answer/:minion_id", get(minion_answer))
        .route("/chat/event", post(chat_event))
        .route("/evaluation", post(evaluation))
        .with_state(overlord)
}

fn ok() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "ok": true })))
}

fn fail(status: StatusCode, reason: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "ok": false, "error": reason })))
}

/// Bearer-token check for the ingestion routes; read-only routes stay open.
fn check_auth(overlord: &Overlord, headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    let Some(token) = &overlord.config.report_token else {
        return Ok(());
    };
    let expected = format!("Bearer {token}");
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(fail(StatusCode::UNAUTHORIZED, "bad or missing token"))
    }
}

async fn health(State(overlord): State<Arc<Overlord>>) -> Json<Value> {
    Json(overlord.health_snapshot().await)
}

async fn status(State(overlord): State<Arc<Overlord>>) -> Json<Value> {
    Json(overlord.status_snapshot().await)
}

async fn queue(State(overlord): State<Arc<Overlord>>) -> Json<Value> {
    Json(overlord.queue_snapshot().await)
}

async fn minion_answer(
    State(overlord): State<Arc<Overlord>>,
    Path(minion_id): Path<String>,
) -> Json<Value> {
    let poll = overlord.questions.poll(&minion_id).await;
    Json(serde_json::to_value(poll).unwrap_or_else(|_| json!({ "answered": false })))
}

async fn minion_report(
    State(overlord): State<Arc<Overlord>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    if let Err(denied) = check_auth(&overlord, &headers) {
        return denied.into_response();
    }

    let report = match parse_report(&payload) {
        Ok(report) => report,
        Err(reason) => {
            warn!("rejected minion report: {reason}");
            return fail(StatusCode::BAD_REQUEST, &reason).into_response();
        }
    };

    // Correlate log lines to the reporting minion even without an explicit id.
    let correlation = report
        .correlation_id
        .clone()
        .unwrap_or_else(|| report.minion_id.chars().take(14).collect());
    info!(
        correlation_id = %correlation,
        minion_id = %report.minion_id,
        event = ?report.event,
        issue = ?report.issue,
        "minion report"
    );

    match overlord.handle_report(report).await {
        Ok(()) => ok().into_response(),
        Err(ReportError::UnknownMinion) => {
            warn!("report from unknown minion");
            fail(StatusCode::NOT_FOUND, "unknown minion").into_response()
        }
        Err(ReportError::Internal(reason)) => {
            error!("minion report handling failed: {reason}");
            fail(StatusCode::INTERNAL_SERVER_ERROR, &reason).into_response()
        }
    }
}

async fn chat_event(
    State(overlord): State<Arc<Overlord>>,
    Json(payload): Json<Value>,
) -> Json<Value> {
    // The platform verifies the webhook once with a challenge echo.
    if payload.get("type").and_then(Value::as_str) == Some("url_verification") {
        return Json(json!({ "challenge": payload.get("challenge") }));
    }

    if let Some(event) = chat_event_from_payload(&payload) {
        if overlord.chat_tx.try_send(event).is_err() {
            warn!("chat event queue full; dropping event");
        }
    }
    Json(json!({ "ok": true }))
}

async fn evaluation(
    State(overlord): State<Arc<Overlord>>,
    headers: HeaderMap,
    Json(mut payload): Json<Value>,
) -> Response {
    if let Err(denied) = check_auth(&overlord, &headers) {
        return denied.into_response();
    }

    // The evaluator may omit its own timestamp.
    if payload.get("evaluated_at").is_none() {
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("evaluated_at".to_string(), json!(Utc::now().to_rfc3339()));
        }
    }

    let record: EvaluationRecord = match serde_json::from_value(payload) {
        Ok(record) => record,
        Err(e) => return fail(StatusCode::BAD_REQUEST, &e.to_string()).into_response(),
    };
    match overlord.store.save_evaluation(&record).await {
        Ok(()) => ok().into_response(),
        Err(e) => {
            error!("saving evaluation failed: {e}");
            fail(StatusCode::INTERNAL_SERVER_ERROR, "store failure").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use crate::chat::ChatEvent;
    use crate::minion::MinionStatus;
    use crate::queue::QueueMark;
    use crate::testutil::{harness, harness_with, queue_item, TestHarness};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
        auth: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        if let Some(token) = auth {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = builder
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
        send(router, "GET", uri, None, None).await
    }

    async fn report(router: &Router, body: Value) -> (StatusCode, Value) {
        send(router, "POST", "/minion/report", Some(body), None).await
    }

    fn router_for(h: &TestHarness) -> Router {
        super::router(h.overlord.clone())
    }

    // ── Read-only routes ───────────────────────────────────────────────────

    #[tokio::test]
    async fn health_reports_liveness_fields() {
        let h = harness().await;
        let (status, body) = get(&router_for(&h), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["active_minions"], 0);
        assert_eq!(body["paused"], false);
        assert_eq!(body["docker_available"], true);
    }

    #[tokio::test]
    async fn status_includes_minions_and_questions() {
        let h = harness().await;
        let id = h.overlord.dispatch("o/r", 42).await.unwrap();

        let (status, body) = get(&router_for(&h), "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active_minions"][0]["id"], id.as_str());
        assert_eq!(body["config"]["max_concurrent"], 3);
        assert!(body["pending_questions"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn queue_serves_cached_scan_and_pause_flag() {
        let h = harness().await;
        *h.overlord.queue_cache.write().await = vec![queue_item("o/r", 42, 1)];
        h.overlord.set_paused(true);

        let (_, body) = get(&router_for(&h), "/queue").await;
        assert_eq!(body["paused"], true);
        assert_eq!(body["items"][0]["number"], 42);
    }

    // ── Report validation ──────────────────────────────────────────────────

    #[tokio::test]
    async fn missing_minion_id_is_400() {
        let h = harness().await;
        let (status, body) =
            report(&router_for(&h), json!({ "event": "heartbeat" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn unknown_event_kind_is_400() {
        let h = harness().await;
        let (status, _) = report(
            &router_for(&h),
            json!({ "minion_id": "minion-x", "event": "celebrate" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_minion_is_404() {
        let h = harness().await;
        let (status, body) = report(
            &router_for(&h),
            json!({ "minion_id": "minion-ghost", "event": "heartbeat" }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown minion");
    }

    // ── Bearer auth ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn report_requires_token_when_configured() {
        let h = harness_with(|cfg| cfg.report_token = Some("sekrit".to_string())).await;
        let id = h.overlord.dispatch("o/r", 42).await.unwrap();
        let router = router_for(&h);
        let body = json!({ "minion_id": id, "event": "heartbeat" });

        let (status, _) = report(&router, body.clone()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) =
            send(&router, "POST", "/minion/report", Some(body.clone()), Some("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) =
            send(&router, "POST", "/minion/report", Some(body), Some("sekrit")).await;
        assert_eq!(status, StatusCode::OK);

        // Probes stay open.
        let (status, _) = get(&router, "/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    // ── Event flows ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn heartbeat_only_advances_heartbeat() {
        let h = harness().await;
        let id = h.overlord.dispatch("o/r", 42).await.unwrap();
        let before = h.overlord.store.get(&id).await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let (status, body) = report(
            &router_for(&h),
            json!({ "minion_id": id, "event": "heartbeat" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);

        let after = h.overlord.store.get(&id).await.unwrap().unwrap();
        assert_eq!(after.status, MinionStatus::Starting);
        assert!(after.last_heartbeat.unwrap() >= before.last_heartbeat.unwrap());
    }

    #[tokio::test]
    async fn progress_sets_working_and_relays_to_chat() {
        let h = harness().await;
        let id = h.overlord.dispatch("o/r", 42).await.unwrap();

        report(
            &router_for(&h),
            json!({
                "minion_id": id,
                "event": "progress",
                "issue": 42,
                "message": "running the tests",
            }),
        )
        .await;

        let minion = h.overlord.store.get(&id).await.unwrap().unwrap();
        assert_eq!(minion.status, MinionStatus::Working);
        assert!(h
            .chat
            .posts()
            .iter()
            .any(|p| p.text.contains("running the tests")));
    }

    #[tokio::test]
    async fn complete_archives_marks_in_review_and_kills_container() {
        let h = harness().await;
        let id = h.overlord.dispatch("o/r", 42).await.unwrap();

        let (status, _) = report(
            &router_for(&h),
            json!({
                "minion_id": id,
                "event": "complete",
                "issue": 42,
                "data": { "pr_number": 100, "pr_url": "https://github.com/o/r/pull/100" },
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        assert!(h.overlord.store.get_active().await.unwrap().is_empty());
        let history = h.overlord.store.history(Some("o/r"), None, 10).await.unwrap();
        assert_eq!(history[0].status, MinionStatus::Completed);
        assert_eq!(history[0].pr_number, Some(100));

        assert!(h.queue.marks().contains(&QueueMark::InReview {
            repo: "o/r".to_string(),
            number: 42,
            pr_number: 100
        }));
        assert!(h.runtime.killed().contains(&id));
        assert!(h
            .chat
            .posts()
            .iter()
            .any(|p| p.text.contains("completed #42")));
    }

    #[tokio::test]
    async fn complete_without_pr_skips_review_transition() {
        let h = harness().await;
        let id = h.overlord.dispatch("o/r", 42).await.unwrap();

        report(
            &router_for(&h),
            json!({ "minion_id": id, "event": "complete", "issue": 42 }),
        )
        .await;

        assert!(!h
            .queue
            .marks()
            .iter()
            .any(|m| matches!(m, QueueMark::InReview { .. })));
    }

    #[tokio::test]
    async fn error_archives_failed_and_marks_queue() {
        let h = harness().await;
        let id = h.overlord.dispatch("o/r", 42).await.unwrap();

        report(
            &router_for(&h),
            json!({
                "minion_id": id,
                "event": "error",
                "issue": 42,
                "message": "tests would not pass",
                "data": { "error_type": "test_failure", "details": "3 assertions failed" },
            }),
        )
        .await;

        let history = h.overlord.store.history(Some("o/r"), None, 10).await.unwrap();
        assert_eq!(history[0].status, MinionStatus::Failed);
        assert!(history[0]
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("test_failure:"));

        assert!(h
            .queue
            .marks()
            .iter()
            .any(|m| matches!(m, QueueMark::Failed { number: 42, .. })));
        assert!(h.runtime.killed().contains(&id));
    }

    // ── Question round-trip (ask → thread reply → poll) ────────────────────

    #[tokio::test]
    async fn question_round_trip_through_thread_reply() {
        let h = harness().await;
        let id = h.overlord.dispatch("o/r", 42).await.unwrap();
        let router = router_for(&h);

        report(
            &router,
            json!({
                "minion_id": id,
                "event": "question",
                "issue": 42,
                "message": "Which endpoint?",
            }),
        )
        .await;

        // The question reached chat and holds a thread ref.
        assert!(h
            .chat
            .posts()
            .iter()
            .any(|p| p.text.contains("Which endpoint?")));
        let thread_ref = h.overlord.questions.snapshot().await[0].thread_ref.clone();

        // Before anyone replies, the poll is unanswered.
        let (_, body) = get(&router, &format!("/minion/answer/{id}")).await;
        assert_eq!(body["answered"], false);

        // A human replies in the thread.
        h.overlord
            .handle_chat_event(ChatEvent::ThreadReply {
                thread_ref: thread_ref.clone(),
                user: "U1".to_string(),
                text: "Use /users".to_string(),
                from_bot: false,
            })
            .await;

        let (_, body) = get(&router, &format!("/minion/answer/{id}")).await;
        assert_eq!(body["answered"], true);
        assert_eq!(body["answer"], "Use /users");

        // A second reply leaves the stored answer unchanged.
        h.overlord
            .handle_chat_event(ChatEvent::ThreadReply {
                thread_ref,
                user: "U2".to_string(),
                text: "No, /accounts".to_string(),
                from_bot: false,
            })
            .await;
        let (_, body) = get(&router, &format!("/minion/answer/{id}")).await;
        assert_eq!(body["answer"], "Use /users");
    }

    #[tokio::test]
    async fn answer_poll_for_unknown_minion_is_unanswered() {
        let h = harness().await;
        let (status, body) = get(&router_for(&h), "/minion/answer/minion-ghost").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["answered"], false);
    }

    // ── Chat webhook ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn webhook_answers_url_verification_challenge() {
        let h = harness().await;
        let (status, body) = send(
            &router_for(&h),
            "POST",
            "/chat/event",
            Some(json!({ "type": "url_verification", "challenge": "abc123" })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["challenge"], "abc123");
    }

    #[tokio::test]
    async fn webhook_enqueues_normalised_events() {
        let h = harness().await;
        let mut rx = h.overlord.take_chat_rx().await.unwrap();

        send(
            &router_for(&h),
            "POST",
            "/chat/event",
            Some(json!({
                "type": "event_callback",
                "event": {
                    "type": "message",
                    "channel": "C123",
                    "user": "U1",
                    "text": "status",
                    "ts": "100.1",
                }
            })),
            None,
        )
        .await;

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ChatEvent::ChannelMessage { ref text, .. } if text == "status"));
    }

    // ── Evaluation ingestion ───────────────────────────────────────────────

    #[tokio::test]
    async fn evaluation_persists_and_reads_back() {
        let h = harness().await;
        let (status, body) = send(
            &router_for(&h),
            "POST",
            "/evaluation",
            Some(json!({
                "pr_number": 100,
                "repo": "o/r",
                "test_score": "pass",
                "lint_score": "pass",
                "review_score": "pass",
                "overall": "approved",
                "revision_number": 0,
                "feedback": null,
            })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);

        let evaluations = h.overlord.store.evaluations("o/r", 100).await.unwrap();
        assert_eq!(evaluations.len(), 1);
        assert_eq!(evaluations[0].overall, "approved");
    }

    #[tokio::test]
    async fn malformed_evaluation_is_400() {
        let h = harness().await;
        let (status, _) = send(
            &router_for(&h),
            "POST",
            "/evaluation",
            Some(json!({ "repo": "o/r" })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
