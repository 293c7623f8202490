//! Error types for the decision orchestrator

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Candidate Lifecycle Errors
    // =============================

    #[error("Duplicate active task for {candidate} at layer {layer}")]
    DuplicateActive { candidate: String, layer: String },

    #[error("Candidate not found: {0}")]
    CandidateNotFound(String),

    #[error("Invalid transition for {candidate}: {from} -> {to}")]
    InvalidTransition {
        candidate: String,
        from: String,
        to: String,
    },

    #[error("Invalid recommendation: {0}")]
    InvalidRecommendation(String),

    // =============================
    // Analysis Errors
    // =============================

    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("Capability contract mismatch: {0}")]
    ContractMismatch(String),

    #[error("Transient fetch error: {0}")]
    TransientFetchError(String),

    #[error("Analysis module timed out on task {0}")]
    ModuleTimeout(Uuid),

    // =============================
    // Risk / Portfolio Errors
    // =============================

    #[error("Risk limit breach for {candidate}: {reasons}")]
    RiskLimitBreach { candidate: String, reasons: String },

    #[error("Version conflict: expected {expected}, current {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("Mutation abandoned after {attempts} attempts")]
    MutationAbandoned { attempts: u32 },

    #[error("Portfolio invariant violated: {0}")]
    InvariantViolation(String),

    #[error("State corruption detected: {0}")]
    StateCorruption(String),

    // =============================
    // Approval / Execution Errors
    // =============================

    #[error("Approval request not found: {0}")]
    ApprovalNotFound(Uuid),

    #[error("Approval request already resolved: {0}")]
    AlreadyResolved(Uuid),

    #[error("Approval request {0} timed out without a decision")]
    ApprovalTimeout(Uuid),

    #[error("Approval request {0} is not approved")]
    NotApproved(Uuid),

    #[error("Execution order not found: {0}")]
    OrderNotFound(String),

    #[error("Broker error: {0}")]
    BrokerError(String),

    // =============================
    // Infrastructure Errors
    // =============================

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Audit error: {0}")]
    AuditError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestrationError {
    /// True for failures that must stop every further portfolio mutation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OrchestrationError::StateCorruption(_))
    }
}

impl From<sqlx::Error> for OrchestrationError {
    fn from(e: sqlx::Error) -> Self {
        OrchestrationError::DatabaseError(e.to_string())
    }
}
