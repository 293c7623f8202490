//! Human approval gate
//!
//! Every capital-affecting recommendation that clears risk is parked here
//! until an operator decides or the decision window lapses. Each request is
//! resolved exactly once; decisions and expiries race on the same lock.

use crate::audit::{AuditEvent, AuditLog};
use crate::config::{DefaultDecision, GatePolicy};
use crate::error::OrchestrationError;
use crate::events::{self, EngineEvent, EventSender};
use crate::models::{
    ApprovalRequest, ApprovalStatus, CandidateId, Decision, Generation, PortfolioDelta,
    Recommendation, RiskAssessment,
};
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

pub const AUTO_APPROVE_ACTOR: &str = "policy:auto-approve";
pub const AUTO_REJECT_ACTOR: &str = "policy:auto-reject";

/// Where pending requests are shown to operators.
#[async_trait::async_trait]
pub trait ApprovalSurface: Send + Sync {
    async fn present(&self, request: &ApprovalRequest);

    async fn resolved(&self, _request: &ApprovalRequest) {}
}

/// Surface that only logs; operators decide through the HTTP API.
pub struct LoggingSurface;

#[async_trait::async_trait]
impl ApprovalSurface for LoggingSurface {
    async fn present(&self, request: &ApprovalRequest) {
        info!(
            request_id = %request.request_id,
            candidate = %request.candidate,
            action = ?request.recommendation.action,
            quantity = request.delta.quantity,
            price = request.delta.price,
            materiality = request.materiality,
            deadline = %request.deadline,
            "Approval required"
        );
    }

    async fn resolved(&self, request: &ApprovalRequest) {
        info!(
            request_id = %request.request_id,
            status = ?request.status,
            decided_by = ?request.decided_by,
            "Approval resolved"
        );
    }
}

/// What the orchestrator hands the gate.
#[derive(Debug, Clone)]
pub struct ApprovalDraft {
    pub candidate: CandidateId,
    pub generation: Generation,
    pub recommendation: Recommendation,
    pub delta: PortfolioDelta,
    pub assessment: RiskAssessment,
}

pub struct HumanGate {
    policy: GatePolicy,
    requests: RwLock<HashMap<Uuid, ApprovalRequest>>,
    audit: Arc<AuditLog>,
    events: EventSender,
    surface: Arc<dyn ApprovalSurface>,
}

impl HumanGate {
    pub fn new(
        policy: GatePolicy,
        audit: Arc<AuditLog>,
        events: EventSender,
        surface: Arc<dyn ApprovalSurface>,
    ) -> Self {
        Self {
            policy,
            requests: RwLock::new(HashMap::new()),
            audit,
            events,
            surface,
        }
    }

    pub async fn raise(&self, draft: ApprovalDraft) -> Result<ApprovalRequest> {
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.policy.decision_window)
            .map_err(|e| OrchestrationError::ConfigError(format!("decision window: {}", e)))?;

        let request = ApprovalRequest {
            request_id: Uuid::new_v4(),
            candidate: draft.candidate,
            generation: draft.generation,
            materiality: draft.delta.notional(),
            base_version: draft.assessment.base_version,
            recommendation: draft.recommendation,
            delta: draft.delta,
            assessment: draft.assessment,
            created_at: now,
            deadline: now + window,
            status: ApprovalStatus::Pending,
            decided_by: None,
            decided_at: None,
        };

        self.audit
            .append(AuditEvent::ApprovalRaised {
                request: request.clone(),
            })
            .await?;

        self.requests
            .write()
            .await
            .insert(request.request_id, request.clone());

        self.surface.present(&request).await;
        Ok(request)
    }

    /// Record an operator decision. A decision that arrives after the
    /// deadline is refused and the default policy applies instead.
    pub async fn decide(&self, request_id: Uuid, decision: Decision, actor: &str) -> Result<ApprovalRequest> {
        let now = Utc::now();
        let mut requests = self.requests.write().await;

        let request = requests
            .get(&request_id)
            .ok_or(OrchestrationError::ApprovalNotFound(request_id))?;

        if request.status != ApprovalStatus::Pending {
            return Err(OrchestrationError::AlreadyResolved(request_id));
        }

        if now > request.deadline {
            let expired = self.default_resolution(request, now);
            self.resolve(&mut requests, expired).await?;
            return Err(OrchestrationError::ApprovalTimeout(request_id));
        }

        let mut resolved = request.clone();
        resolved.status = match decision {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Reject => ApprovalStatus::Rejected,
        };
        resolved.decided_by = Some(actor.to_string());
        resolved.decided_at = Some(now);

        self.resolve(&mut requests, resolved).await
    }

    /// Apply the default policy to every pending request past its deadline.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalRequest>> {
        let mut requests = self.requests.write().await;

        let due: Vec<ApprovalRequest> = requests
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending && r.deadline <= now)
            .map(|r| self.default_resolution(r, now))
            .collect();

        let mut resolved = Vec::with_capacity(due.len());
        for request in due {
            resolved.push(self.resolve(&mut requests, request).await?);
        }
        Ok(resolved)
    }

    fn default_resolution(&self, request: &ApprovalRequest, now: DateTime<Utc>) -> ApprovalRequest {
        let auto_approve = self.policy.default_decision == DefaultDecision::AutoApproveBelow
            && self
                .policy
                .materiality_threshold
                .map_or(false, |threshold| request.materiality < threshold);

        let mut resolved = request.clone();
        if auto_approve {
            resolved.status = ApprovalStatus::Approved;
            resolved.decided_by = Some(AUTO_APPROVE_ACTOR.to_string());
        } else {
            resolved.status = ApprovalStatus::Expired;
            resolved.decided_by = Some(AUTO_REJECT_ACTOR.to_string());
        }
        resolved.decided_at = Some(now);

        warn!(
            request_id = %request.request_id,
            candidate = %request.candidate,
            status = ?resolved.status,
            "Approval window lapsed; default policy applied"
        );
        resolved
    }

    async fn resolve(
        &self,
        requests: &mut HashMap<Uuid, ApprovalRequest>,
        resolved: ApprovalRequest,
    ) -> Result<ApprovalRequest> {
        self.audit
            .append(AuditEvent::ApprovalResolved {
                request: resolved.clone(),
            })
            .await?;

        requests.insert(resolved.request_id, resolved.clone());
        self.surface.resolved(&resolved).await;

        events::deliver(&self.events, EngineEvent::ApprovalResolved(resolved.clone()));

        Ok(resolved)
    }

    pub async fn get(&self, request_id: Uuid) -> Option<ApprovalRequest> {
        self.requests.read().await.get(&request_id).cloned()
    }

    pub async fn pending(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<_> = self
            .requests
            .read()
            .await
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    pub async fn all(&self) -> Vec<ApprovalRequest> {
        let mut all: Vec<_> = self.requests.read().await.values().cloned().collect();
        all.sort_by_key(|r| r.created_at);
        all
    }

    /// Reload requests after recovery. Pending ones are presented again.
    pub async fn restore(&self, restored: Vec<ApprovalRequest>) {
        let mut requests = self.requests.write().await;
        for request in restored {
            if request.status == ApprovalStatus::Pending {
                self.surface.present(&request).await;
            }
            requests.insert(request.request_id, request);
        }
    }

    /// Periodic expiry sweep.
    pub async fn run_expiry(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.policy.sweep_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.expire_due(Utc::now()).await {
                warn!(error = %e, "Approval expiry sweep failed");
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn test_draft(symbol: &str, quantity: f64, price: f64) -> ApprovalDraft {
    use crate::models::{Action, Disposition, EvidenceHandle, Layer, Verdict};

    let candidate = CandidateId::new(symbol, "XNAS");
    let delta = PortfolioDelta {
        candidate: candidate.clone(),
        quantity,
        price,
        sector: "tech".to_string(),
        risk_bucket: "low".to_string(),
        volatility: None,
    };
    ApprovalDraft {
        candidate: candidate.clone(),
        generation: 1,
        recommendation: Recommendation {
            candidate: candidate.clone(),
            generation: 1,
            action: if quantity >= 0.0 { Action::Buy } else { Action::Sell },
            confidence: 0.8,
            rationale: EvidenceHandle("doc".to_string()),
            source_layer: Layer::DeepEvaluation,
            disposition: Disposition::Terminal,
            reference_price: Some(price),
            volatility: None,
            risk_bucket: None,
        },
        delta,
        assessment: RiskAssessment {
            candidate,
            exposure_delta: 0.0,
            verdict: Verdict::Pass,
            reasons: vec![],
            base_version: 0,
            assessed_at: Utc::now(),
        },
    }
}
