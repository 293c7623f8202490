//! REST API for the decision engine
//!
//! Thin HTTP surface over `Engine`: candidate submission and inspection,
//! evidence intake, approvals, the portfolio and the audit trail.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::OrchestrationError;
use crate::models::{
    CandidateId, Decision, EvidenceEvent, InstrumentProfile, Layer, ReEvaluationCause,
    ReEvaluationReason,
};

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct SubmitCandidateRequest {
    /// `SYMBOL@VENUE`
    pub candidate: String,
    #[serde(default)]
    pub profile: InstrumentProfile,
    #[serde(default = "default_layer")]
    pub layer: Layer,
}

fn default_layer() -> Layer {
    Layer::Screening
}

#[derive(Debug, Deserialize)]
pub struct ReEvaluateRequest {
    pub detail: String,
    #[serde(default)]
    pub target_layer: Option<Layer>,
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub decision: Decision,
    pub actor: String,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub from: u64,
    #[serde(default)]
    pub to: Option<u64>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type ApiResult = (StatusCode, Json<ApiResponse>);

fn ok<T: Serialize>(status: StatusCode, data: T) -> ApiResult {
    (status, Json(ApiResponse::success(data)))
}

fn fail(err: OrchestrationError) -> ApiResult {
    (status_for(&err), Json(ApiResponse::error(err.to_string())))
}

fn bad_request(message: String) -> ApiResult {
    (StatusCode::BAD_REQUEST, Json(ApiResponse::error(message)))
}

fn status_for(err: &OrchestrationError) -> StatusCode {
    use OrchestrationError::*;
    match err {
        CandidateNotFound(_) | ApprovalNotFound(_) | OrderNotFound(_) | CapabilityNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        DuplicateActive { .. }
        | InvalidTransition { .. }
        | AlreadyResolved(_)
        | ApprovalTimeout(_)
        | NotApproved(_)
        | VersionConflict { .. } => StatusCode::CONFLICT,
        InvalidRecommendation(_) | ContractMismatch(_) | SerializationError(_) => {
            StatusCode::BAD_REQUEST
        }
        RiskLimitBreach { .. } | InvariantViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        StateCorruption(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn parse_candidate(raw: &str) -> Result<CandidateId, ApiResult> {
    raw.parse::<CandidateId>().map_err(bad_request)
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Candidates
/// =============================

async fn submit_candidate(
    State(state): State<ApiState>,
    Json(req): Json<SubmitCandidateRequest>,
) -> ApiResult {
    let id = match parse_candidate(&req.candidate) {
        Ok(id) => id,
        Err(response) => return response,
    };
    info!(candidate = %id, layer = %req.layer, "Candidate submitted over API");

    match state
        .engine
        .submit_candidate(id, req.profile, req.layer)
        .await
    {
        Ok(task) => ok(StatusCode::ACCEPTED, task),
        Err(e) => fail(e),
    }
}

async fn list_candidates(State(state): State<ApiState>) -> ApiResult {
    ok(StatusCode::OK, state.engine.candidates().await)
}

async fn get_candidate(State(state): State<ApiState>, Path(raw): Path<String>) -> ApiResult {
    let id = match parse_candidate(&raw) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.engine.candidate_state(&id).await {
        Ok(view) => ok(StatusCode::OK, view),
        Err(e) => fail(e),
    }
}

async fn re_evaluate(
    State(state): State<ApiState>,
    Path(raw): Path<String>,
    Json(req): Json<ReEvaluateRequest>,
) -> ApiResult {
    let id = match parse_candidate(&raw) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let reason = ReEvaluationReason {
        cause: ReEvaluationCause::Manual,
        detail: req.detail,
        target_layer: req.target_layer,
    };

    match state.engine.re_evaluate(&id, reason).await {
        Ok(()) => match state.engine.candidate_state(&id).await {
            Ok(view) => ok(StatusCode::ACCEPTED, view),
            Err(e) => fail(e),
        },
        Err(e) => fail(e),
    }
}

/// =============================
/// Evidence
/// =============================

async fn publish_evidence(
    State(state): State<ApiState>,
    Json(event): Json<EvidenceEvent>,
) -> ApiResult {
    match state.engine.publish_evidence(event).await {
        Ok(outcome) => ok(StatusCode::OK, outcome),
        Err(e) => fail(e),
    }
}

/// =============================
/// Approvals
/// =============================

async fn pending_approvals(State(state): State<ApiState>) -> ApiResult {
    ok(StatusCode::OK, state.engine.pending_approvals().await)
}

async fn decide_approval(
    State(state): State<ApiState>,
    Path(request_id): Path<Uuid>,
    Json(req): Json<DecisionRequest>,
) -> ApiResult {
    if req.actor.trim().is_empty() {
        return bad_request("actor is required".to_string());
    }
    match state
        .engine
        .decide_approval(request_id, req.decision, &req.actor)
        .await
    {
        Ok(request) => ok(StatusCode::OK, request),
        Err(e) => fail(e),
    }
}

/// =============================
/// Portfolio, Orders, Audit
/// =============================

async fn portfolio(State(state): State<ApiState>) -> ApiResult {
    match state.engine.portfolio_snapshot().await {
        Ok(snapshot) => ok(StatusCode::OK, snapshot),
        Err(e) => fail(e),
    }
}

async fn orders(State(state): State<ApiState>) -> ApiResult {
    ok(StatusCode::OK, state.engine.orders().await)
}

async fn audit_trail(State(state): State<ApiState>, Query(query): Query<AuditQuery>) -> ApiResult {
    let to = query.to.unwrap_or(u64::MAX);
    if to < query.from {
        return bad_request(format!("empty range {}..{}", query.from, to));
    }
    ok(StatusCode::OK, state.engine.audit_trail(query.from..to).await)
}

async fn capabilities(State(state): State<ApiState>) -> ApiResult {
    ok(StatusCode::OK, state.engine.capabilities())
}

async fn checkpoint(State(state): State<ApiState>) -> ApiResult {
    match state.engine.checkpoint().await {
        Ok(checkpoint) => ok(
            StatusCode::OK,
            serde_json::json!({
                "anchor": checkpoint.anchor,
                "taken_at": checkpoint.taken_at,
                "candidates": checkpoint.candidates.len(),
            }),
        ),
        Err(e) => fail(e),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(engine: Arc<Engine>) -> Router {
    let state = ApiState { engine };

    Router::new()
        .route("/health", get(health))
        .route("/api/candidates", post(submit_candidate).get(list_candidates))
        .route("/api/candidates/:id", get(get_candidate))
        .route("/api/candidates/:id/re-evaluate", post(re_evaluate))
        .route("/api/evidence", post(publish_evidence))
        .route("/api/approvals", get(pending_approvals))
        .route("/api/approvals/:id/decision", post(decide_approval))
        .route("/api/portfolio", get(portfolio))
        .route("/api/orders", get(orders))
        .route("/api/audit", get(audit_trail))
        .route("/api/capabilities", get(capabilities))
        .route("/api/checkpoint", post(checkpoint))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    engine: Arc<Engine>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(engine);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{CapabilityContract, ScriptedModule, ScriptedStep};
    use crate::config::test_config;
    use crate::models::{Action, Disposition};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn engine() -> Arc<Engine> {
        let screen = ScriptedModule::new(CapabilityContract::screening("screen.test")).with_default(
            ScriptedStep::recommend(Action::Buy, 0.9, Disposition::Escalate),
        );
        let evaluate = ScriptedModule::new(CapabilityContract::deep_evaluation("evaluate.test"))
            .with_default(
                ScriptedStep::recommend(Action::Buy, 0.8, Disposition::Terminal).with_price(100.0),
            );
        Arc::new(
            Engine::builder(test_config())
                .with_module(Arc::new(screen))
                .with_module(Arc::new(evaluate))
                .build()
                .await
                .unwrap(),
        )
    }

    async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let body = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        };
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn wait_for_pending(router: &Router) -> Value {
        for _ in 0..200 {
            let (_, body) = call(router, Method::GET, "/api/approvals", None).await;
            if let Some(first) = body["data"].as_array().and_then(|a| a.first()) {
                return first.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no approval raised");
    }

    #[tokio::test]
    async fn health_is_ok() {
        let router = create_router(engine().await);
        let (status, body) = call(&router, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn candidate_submission_and_lookup() {
        let router = create_router(engine().await);

        let (status, body) = call(
            &router,
            Method::POST,
            "/api/candidates",
            Some(json!({ "candidate": "acme@xnas", "profile": { "sector": "tech", "risk_bucket": "low" } })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["candidate"], "ACME@XNAS");
        assert_eq!(body["data"]["generation"], 1);

        let (status, body) = call(&router, Method::GET, "/api/candidates/ACME@XNAS", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["candidate"]["id"], "ACME@XNAS");

        let (status, body) = call(&router, Method::GET, "/api/candidates/NOPE@XNAS", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);

        let (status, _) = call(&router, Method::GET, "/api/candidates/no-venue", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn approval_decision_moves_the_portfolio() {
        let router = create_router(engine().await);
        call(
            &router,
            Method::POST,
            "/api/candidates",
            Some(json!({ "candidate": "ACME@XNAS" })),
        )
        .await;

        let pending = wait_for_pending(&router).await;
        let request_id = pending["request_id"].as_str().unwrap().to_string();
        let uri = format!("/api/approvals/{}/decision", request_id);

        let (status, _) = call(&router, Method::POST, &uri, Some(json!({ "decision": "approve", "actor": "" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &router,
            Method::POST,
            &uri,
            Some(json!({ "decision": "approve", "actor": "alice" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["decided_by"], "alice");

        let (status, _) = call(
            &router,
            Method::POST,
            &uri,
            Some(json!({ "decision": "reject", "actor": "bob" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let mut version = 0;
        for _ in 0..200 {
            let (_, body) = call(&router, Method::GET, "/api/portfolio", None).await;
            version = body["data"]["version"].as_u64().unwrap();
            if version == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(version, 1);

        let (status, body) = call(&router, Method::GET, "/api/audit?from=1&to=4", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_approval_is_not_found() {
        let router = create_router(engine().await);
        let uri = format!("/api/approvals/{}/decision", Uuid::new_v4());
        let (status, _) = call(
            &router,
            Method::POST,
            &uri,
            Some(json!({ "decision": "approve", "actor": "alice" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
