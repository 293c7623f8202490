//! Core data models for the decision orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Monotonic per-candidate counter; bumped on every re-submission.
pub type Generation = u64;

//
// ================= Identifiers =================
//

/// Security identifier: symbol listed on a venue.
///
/// Serialized as `SYMBOL@VENUE` so it can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CandidateId {
    pub symbol: String,
    pub venue: String,
}

impl CandidateId {
    pub fn new(symbol: impl Into<String>, venue: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into().to_uppercase(),
            venue: venue.into().to_uppercase(),
        }
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.venue)
    }
}

impl FromStr for CandidateId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (symbol, venue) = s
            .split_once('@')
            .ok_or_else(|| format!("expected SYMBOL@VENUE, got '{}'", s))?;

        if symbol.trim().is_empty() || venue.trim().is_empty() {
            return Err(format!("empty symbol or venue in '{}'", s));
        }

        Ok(CandidateId::new(symbol.trim(), venue.trim()))
    }
}

impl From<CandidateId> for String {
    fn from(id: CandidateId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for CandidateId {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// Opaque handle into an external retrieval system. Not owned here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvidenceHandle(pub String);

/// Key that makes order submission idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    /// Orders are keyed by the approval that authorized them.
    pub fn for_approval(request_id: Uuid) -> Self {
        IdempotencyKey(format!("approval-{}", request_id))
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//
// ================= Layers & Lifecycle =================
//

/// Escalation stage served by a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Screening,
    DeepEvaluation,
}

impl Layer {
    pub const ALL: [Layer; 2] = [Layer::Screening, Layer::DeepEvaluation];

    pub fn next(self) -> Option<Layer> {
        match self {
            Layer::Screening => Some(Layer::DeepEvaluation),
            Layer::DeepEvaluation => None,
        }
    }

    /// Lifecycle state a candidate sits in while this layer works on it.
    pub fn working_state(self) -> LifecycleState {
        match self {
            Layer::Screening => LifecycleState::Screening,
            Layer::DeepEvaluation => LifecycleState::UnderEvaluation,
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Layer::Screening => "screening",
            Layer::DeepEvaluation => "deep_evaluation",
        };
        f.write_str(s)
    }
}

impl FromStr for Layer {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "screening" | "screen" | "1" => Ok(Layer::Screening),
            "deep_evaluation" | "deep-evaluation" | "evaluation" | "2" => {
                Ok(Layer::DeepEvaluation)
            }
            other => Err(format!("unknown layer '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Discovered,
    Screening,
    Discarded,
    FlaggedForDeepEval,
    UnderEvaluation,
    RecommendationReady,
    RiskCheck,
    Blocked,
    PendingApproval,
    Rejected,
    Approved,
    Executing,
    Held,
    ReEvaluationTriggered,
    Degraded,
    Closed,
}

impl LifecycleState {
    /// Terminal for the current generation; only a new generation reopens.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LifecycleState::Discarded | LifecycleState::Rejected | LifecycleState::Closed
        )
    }

    /// Analysis work is outstanding for the candidate.
    pub fn is_analysing(self) -> bool {
        matches!(
            self,
            LifecycleState::Screening
                | LifecycleState::FlaggedForDeepEval
                | LifecycleState::UnderEvaluation
                | LifecycleState::ReEvaluationTriggered
        )
    }

    /// Capital is committed or about to be; re-evaluation must wait.
    pub fn is_settling(self) -> bool {
        matches!(self, LifecycleState::Approved | LifecycleState::Executing)
    }

    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        // Any state except the settling ones may be re-opened by a new generation.
        if next == ReEvaluationTriggered {
            return !self.is_settling() && self != ReEvaluationTriggered;
        }

        matches!(
            (self, next),
            (Discovered, Screening)
                | (Discovered, UnderEvaluation)
                | (Screening, Discarded)
                | (Screening, FlaggedForDeepEval)
                | (Screening, Degraded)
                | (FlaggedForDeepEval, UnderEvaluation)
                | (UnderEvaluation, RecommendationReady)
                | (UnderEvaluation, Discarded)
                | (UnderEvaluation, Degraded)
                | (RecommendationReady, RiskCheck)
                | (RecommendationReady, Held)
                | (RecommendationReady, Closed)
                | (RecommendationReady, Degraded)
                | (RiskCheck, Blocked)
                | (RiskCheck, PendingApproval)
                | (RiskCheck, Degraded)
                | (PendingApproval, Approved)
                | (PendingApproval, Rejected)
                | (Approved, Executing)
                | (Approved, Blocked)
                | (Approved, Degraded)
                | (Executing, Held)
                | (Executing, Closed)
                | (Executing, Degraded)
                | (Held, Closed)
                | (Blocked, Closed)
                | (Degraded, Closed)
                | (ReEvaluationTriggered, Screening)
                | (ReEvaluationTriggered, UnderEvaluation)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

//
// ================= Candidate =================
//

/// Static description of the instrument, supplied at discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentProfile {
    pub sector: String,
    pub risk_bucket: String,
    /// Annualised volatility estimate, if known.
    #[serde(default)]
    pub volatility: Option<f64>,
}

impl Default for InstrumentProfile {
    fn default() -> Self {
        Self {
            sector: "unclassified".to_string(),
            risk_bucket: "unclassified".to_string(),
            volatility: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub profile: InstrumentProfile,
    pub state: LifecycleState,
    pub generation: Generation,
    pub origin_layer: Layer,
    pub evidence: Vec<EvidenceHandle>,
    pub recommendation: Option<Recommendation>,
    pub assessment: Option<RiskAssessment>,
    pub approval_id: Option<Uuid>,
    pub order_key: Option<IdempotencyKey>,
    /// Retry attempts consumed at the current layer.
    pub attempts: u32,
    pub deferred_reevaluation: Option<ReEvaluationReason>,
    pub history: Vec<CandidateEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Candidate {
    pub fn discovered(id: CandidateId, profile: InstrumentProfile, origin_layer: Layer) -> Self {
        let now = Utc::now();
        Self {
            id,
            profile,
            state: LifecycleState::Discovered,
            generation: 0,
            origin_layer,
            evidence: Vec::new(),
            recommendation: None,
            assessment: None,
            approval_id: None,
            order_key: None,
            attempts: 0,
            deferred_reevaluation: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record(&mut self, kind: CandidateEventKind) {
        let now = Utc::now();
        self.history.push(CandidateEvent {
            at: now,
            generation: self.generation,
            kind,
        });
        self.updated_at = now;
    }
}

/// Structured entry on a candidate's history. Failures land here too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateEvent {
    pub at: DateTime<Utc>,
    pub generation: Generation,
    pub kind: CandidateEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CandidateEventKind {
    Transition {
        from: LifecycleState,
        to: LifecycleState,
    },
    TaskSubmitted {
        task_id: Uuid,
        layer: Layer,
        attempt: u32,
    },
    TaskResolved {
        task_id: Uuid,
        layer: Layer,
        status: TaskStatus,
        error: Option<String>,
    },
    RetryScheduled {
        layer: Layer,
        attempt: u32,
        delay_ms: u64,
    },
    StaleResultDiscarded {
        task_id: Uuid,
        result_generation: Generation,
    },
    RiskAssessed {
        verdict: Verdict,
        reasons: Vec<ReasonCode>,
    },
    ApprovalRaised {
        request_id: Uuid,
    },
    ApprovalResolved {
        request_id: Uuid,
        status: ApprovalStatus,
    },
    OrderSubmitted {
        key: IdempotencyKey,
    },
    OrderSettled {
        key: IdempotencyKey,
        status: OrderStatus,
        filled_quantity: f64,
    },
    ReEvaluationRequested {
        reason: ReEvaluationReason,
        deferred: bool,
    },
    Failure {
        error: String,
    },
}

//
// ================= Task =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Timeout,
    Stale,
}

impl TaskStatus {
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub candidate: CandidateId,
    pub generation: Generation,
    pub layer: Layer,
    pub capability: String,
    pub status: TaskStatus,
    pub attempt: u32,
    pub deadline: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

//
// ================= Recommendation =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
    Hold,
    Increase,
    Decrease,
}

impl Action {
    /// Whether the action can change capital allocation.
    pub fn is_capital_affecting(self) -> bool {
        !matches!(self, Action::Hold)
    }
}

/// What the orchestrator should do with a layer's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// Promote to the next layer.
    Escalate,
    /// Final recommendation for this generation.
    Terminal,
    Discard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub candidate: CandidateId,
    pub generation: Generation,
    pub action: Action,
    pub confidence: f64,
    pub rationale: EvidenceHandle,
    pub source_layer: Layer,
    pub disposition: Disposition,
    #[serde(default)]
    pub reference_price: Option<f64>,
    #[serde(default)]
    pub volatility: Option<f64>,
    /// Risk bucket the analysis assigned, if it classified the instrument.
    #[serde(default)]
    pub risk_bucket: Option<String>,
}

//
// ================= Risk =================
//

/// Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Warn,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    PositionWeightNearLimit,
    PositionWeightExceeded,
    SectorWeightNearLimit,
    SectorWeightExceeded,
    RiskBucketWeightNearLimit,
    RiskBucketWeightExceeded,
    VolatilityBudgetNearLimit,
    VolatilityBudgetExceeded,
    InsufficientCash,
    InsufficientHoldings,
    InvalidPrice,
    InvalidQuantity,
    /// The projected snapshot breaks a portfolio invariant.
    InvalidProjection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub candidate: CandidateId,
    /// Change in the candidate's portfolio weight if the delta is applied.
    pub exposure_delta: f64,
    pub verdict: Verdict,
    pub reasons: Vec<ReasonCode>,
    pub base_version: u64,
    pub assessed_at: DateTime<Utc>,
}

//
// ================= Portfolio Delta =================
//

/// Signed change to one holding, priced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioDelta {
    pub candidate: CandidateId,
    /// Positive buys, negative sells.
    pub quantity: f64,
    pub price: f64,
    pub sector: String,
    pub risk_bucket: String,
    #[serde(default)]
    pub volatility: Option<f64>,
}

impl PortfolioDelta {
    pub fn notional(&self) -> f64 {
        (self.quantity * self.price).abs()
    }

    /// The same delta scaled to a (partial) fill.
    pub fn with_fill(&self, quantity: f64, price: f64) -> Self {
        Self {
            quantity,
            price,
            ..self.clone()
        }
    }
}

//
// ================= Approval =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: Uuid,
    pub candidate: CandidateId,
    pub generation: Generation,
    pub recommendation: Recommendation,
    pub delta: PortfolioDelta,
    pub assessment: RiskAssessment,
    pub materiality: f64,
    pub base_version: u64,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
}

//
// ================= Execution =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Submitted,
    PartiallyFilled,
    Filled,
    Failed,
}

impl OrderStatus {
    pub fn is_final(self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOrder {
    pub key: IdempotencyKey,
    pub approval_id: Uuid,
    pub candidate: CandidateId,
    pub generation: Generation,
    pub delta: PortfolioDelta,
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub average_fill_price: f64,
    pub applied_fills: Vec<String>,
    pub failure: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionOrder {
    /// Signed quantity still awaiting fills.
    pub fn remaining(&self) -> f64 {
        self.delta.quantity - self.filled_quantity
    }
}

/// Fill report from the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    /// Broker-assigned, strictly increasing.
    pub sequence: u64,
    pub key: IdempotencyKey,
    /// Signed, same sign as the order.
    pub quantity: f64,
    pub price: f64,
    pub filled_at: DateTime<Utc>,
}

//
// ================= Evidence / Re-evaluation =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Fundamentals,
    Sentiment,
    InstitutionalFlow,
}

/// External notification that new information exists for a candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceEvent {
    pub candidate: CandidateId,
    pub kind: EvidenceKind,
    pub magnitude: f64,
    #[serde(default)]
    pub handle: Option<EvidenceHandle>,
    #[serde(default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReEvaluationCause {
    Evidence(EvidenceKind),
    Manual,
    Recovery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReEvaluationReason {
    pub cause: ReEvaluationCause,
    pub detail: String,
    /// Narrower re-entry point than a full re-screen.
    #[serde(default)]
    pub target_layer: Option<Layer>,
}

impl ReEvaluationReason {
    pub fn manual(detail: impl Into<String>) -> Self {
        Self {
            cause: ReEvaluationCause::Manual,
            detail: detail.into(),
            target_layer: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_id_parses_and_serializes_as_string() {
        let id: CandidateId = "aapl@xnas".parse().unwrap();
        assert_eq!(id, CandidateId::new("AAPL", "XNAS"));
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"AAPL@XNAS\"");
        assert!("AAPL".parse::<CandidateId>().is_err());
    }

    #[test]
    fn lifecycle_follows_the_escalation_path() {
        use LifecycleState::*;
        let path = [
            Discovered,
            Screening,
            FlaggedForDeepEval,
            UnderEvaluation,
            RecommendationReady,
            RiskCheck,
            PendingApproval,
            Approved,
            Executing,
            Held,
            ReEvaluationTriggered,
            Screening,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
        assert!(!Screening.can_transition_to(Executing));
        assert!(!Executing.can_transition_to(ReEvaluationTriggered));
        assert!(Rejected.can_transition_to(ReEvaluationTriggered));
    }
}
