//! HTTP-backed analysis capability
//!
//! Posts the analysis request to a remote evaluation service and maps its
//! finding onto a recommendation. Connection failures, timeouts, 429 and 5xx
//! responses are transient; other failures are not.

use super::{AnalysisError, AnalysisModule, AnalysisRequest, CapabilityContract};
use crate::error::OrchestrationError;
use crate::models::{Action, Disposition, EvidenceHandle, Recommendation};
use crate::Result;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::debug;

/// Body returned by a remote evaluation service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFinding {
    pub action: Action,
    pub confidence: f64,
    pub disposition: Disposition,
    pub rationale: String,
    #[serde(default)]
    pub reference_price: Option<f64>,
    #[serde(default)]
    pub volatility: Option<f64>,
    #[serde(default)]
    pub risk_bucket: Option<String>,
}

pub struct HttpAnalysisModule {
    contract: CapabilityContract,
    client: Client,
    url: String,
}

impl HttpAnalysisModule {
    pub fn new(contract: CapabilityContract, base_url: &str, path: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            contract,
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), path),
        })
    }

    /// Uses `ANALYSIS_API_BASE_URL` when set.
    pub fn from_env(contract: CapabilityContract, path: &str) -> Option<Result<Self>> {
        let base_url = env::var("ANALYSIS_API_BASE_URL").ok()?;
        if base_url.trim().is_empty() {
            return Some(Err(OrchestrationError::ConfigError(
                "ANALYSIS_API_BASE_URL is empty".to_string(),
            )));
        }
        Some(Self::new(contract, &base_url, path))
    }
}

fn classify_transport(e: reqwest::Error) -> AnalysisError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        AnalysisError::TransientFetch(e.to_string())
    } else {
        AnalysisError::Failed(e.to_string())
    }
}

fn classify_status(status: StatusCode, body: &str) -> AnalysisError {
    let message = format!("evaluation service returned {}: {}", status, body);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AnalysisError::TransientFetch(message)
    } else {
        AnalysisError::Failed(message)
    }
}

#[async_trait::async_trait]
impl AnalysisModule for HttpAnalysisModule {
    fn contract(&self) -> CapabilityContract {
        self.contract.clone()
    }

    async fn evaluate(&self, request: &AnalysisRequest) -> std::result::Result<Recommendation, AnalysisError> {
        debug!(url = %self.url, candidate = %request.candidate, "Calling evaluation service");

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let finding: RemoteFinding = response
            .json()
            .await
            .map_err(|e| AnalysisError::InvalidOutput(format!("invalid JSON response: {}", e)))?;

        let mut recommendation = request.recommend(
            finding.action,
            finding.confidence,
            finding.disposition,
            EvidenceHandle(finding.rationale),
        );
        recommendation.reference_price = finding.reference_price;
        recommendation.volatility = finding.volatility;
        recommendation.risk_bucket = finding.risk_bucket;

        Ok(recommendation)
    }
}

#[cfg(test)]
mod tests {
    use super::super::RequestKind;
    use super::*;
    use crate::models::{CandidateId, InstrumentProfile, Layer};
    use axum::{http::StatusCode as AxumStatus, routing::post, Json, Router};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest {
            task_id: Uuid::new_v4(),
            candidate: CandidateId::new("NVDA", "XNAS"),
            profile: InstrumentProfile::default(),
            generation: 2,
            kind: RequestKind::DeepEvaluation,
            layer: Layer::DeepEvaluation,
            evidence: Vec::new(),
            deadline: Utc::now(),
        }
    }

    #[tokio::test]
    async fn maps_remote_finding_to_recommendation() {
        let router = Router::new().route(
            "/evaluate",
            post(|| async {
                Json(json!({
                    "action": "buy",
                    "confidence": 0.7,
                    "disposition": "terminal",
                    "rationale": "doc://nvda/2",
                    "reference_price": 120.0
                }))
            }),
        );
        let base = serve(router).await;
        let module =
            HttpAnalysisModule::new(CapabilityContract::deep_evaluation("eval.http"), &base, "/evaluate").unwrap();

        let rec = module.evaluate(&request()).await.unwrap();
        assert_eq!(rec.action, Action::Buy);
        assert_eq!(rec.disposition, Disposition::Terminal);
        assert_eq!(rec.generation, 2);
        assert_eq!(rec.source_layer, Layer::DeepEvaluation);
        assert_eq!(rec.reference_price, Some(120.0));
    }

    #[tokio::test]
    async fn server_errors_are_transient_client_errors_are_not() {
        let router = Router::new()
            .route("/busy", post(|| async { (AxumStatus::SERVICE_UNAVAILABLE, "try later") }))
            .route("/bad", post(|| async { (AxumStatus::UNPROCESSABLE_ENTITY, "unknown symbol") }));
        let base = serve(router).await;

        let busy = HttpAnalysisModule::new(CapabilityContract::deep_evaluation("a"), &base, "/busy").unwrap();
        assert!(busy.evaluate(&request()).await.unwrap_err().is_transient());

        let bad = HttpAnalysisModule::new(CapabilityContract::deep_evaluation("b"), &base, "/bad").unwrap();
        assert!(!bad.evaluate(&request()).await.unwrap_err().is_transient());
    }
}
