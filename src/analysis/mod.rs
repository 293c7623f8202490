//! Analysis capabilities and their registry
//!
//! A capability is a pluggable module that evaluates one candidate for one
//! request kind and returns a recommendation. The engine only knows a
//! module through its declared contract. Each layer's configured capability
//! is resolved through the registry once, when the engine is built; the
//! contract is checked then, and the worker pool for that layer dispatches
//! every task to the resolved module.

pub mod http;
pub mod provider;
pub mod screener;
pub mod scripted;

pub use http::HttpAnalysisModule;
pub use provider::{DataProvider, Dataset, DatasetKind, MergedDataProvider, StaticDataProvider};
pub use screener::{CriteriaScreener, RiskBucketRules, ScreeningCriteria, ValueRange};
pub use scripted::{ScriptedModule, ScriptedStep};

use crate::error::OrchestrationError;
use crate::models::{
    Action, CandidateId, Disposition, EvidenceHandle, Generation, InstrumentProfile, Layer,
    Recommendation,
};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Failure reported by an analysis module.
///
/// Only `TransientFetch` is retried inside the worker pool; everything else
/// goes straight back to the orchestrator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("transient fetch failure: {0}")]
    TransientFetch(String),

    #[error("module output rejected: {0}")]
    InvalidOutput(String),

    #[error("analysis failed: {0}")]
    Failed(String),
}

impl AnalysisError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AnalysisError::TransientFetch(_))
    }
}

impl From<AnalysisError> for OrchestrationError {
    fn from(e: AnalysisError) -> Self {
        match e {
            AnalysisError::TransientFetch(msg) => OrchestrationError::TransientFetchError(msg),
            AnalysisError::InvalidOutput(msg) => OrchestrationError::InvalidRecommendation(msg),
            AnalysisError::Failed(msg) => OrchestrationError::InvalidRecommendation(msg),
        }
    }
}

/// Kind of request a module accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Screen,
    DeepEvaluation,
}

impl From<Layer> for RequestKind {
    fn from(layer: Layer) -> Self {
        match layer {
            Layer::Screening => RequestKind::Screen,
            Layer::DeepEvaluation => RequestKind::DeepEvaluation,
        }
    }
}

/// Declared input/output contract of a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityContract {
    pub id: String,
    pub accepts: RequestKind,
    /// Dispositions the module may return.
    pub produces: Vec<Disposition>,
}

impl CapabilityContract {
    /// Screening escalates or discards.
    pub fn screening(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            accepts: RequestKind::Screen,
            produces: vec![Disposition::Escalate, Disposition::Discard],
        }
    }

    /// Deep evaluation ends the escalation path.
    pub fn deep_evaluation(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            accepts: RequestKind::DeepEvaluation,
            produces: vec![Disposition::Terminal, Disposition::Discard],
        }
    }

    pub fn permits(&self, disposition: Disposition) -> bool {
        self.produces.contains(&disposition)
    }
}

/// Everything a module needs to evaluate one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub task_id: Uuid,
    pub candidate: CandidateId,
    pub profile: InstrumentProfile,
    pub generation: Generation,
    pub kind: RequestKind,
    pub layer: Layer,
    pub evidence: Vec<EvidenceHandle>,
    pub deadline: DateTime<Utc>,
}

impl AnalysisRequest {
    /// Recommendation stamped with this request's candidate and generation.
    pub fn recommend(
        &self,
        action: Action,
        confidence: f64,
        disposition: Disposition,
        rationale: EvidenceHandle,
    ) -> Recommendation {
        Recommendation {
            candidate: self.candidate.clone(),
            generation: self.generation,
            action,
            confidence,
            rationale,
            source_layer: self.layer,
            disposition,
            reference_price: None,
            volatility: None,
            risk_bucket: None,
        }
    }
}

/// Pluggable analysis capability.
#[async_trait::async_trait]
pub trait AnalysisModule: Send + Sync {
    fn contract(&self) -> CapabilityContract;

    async fn evaluate(&self, request: &AnalysisRequest) -> std::result::Result<Recommendation, AnalysisError>;
}

/// Capability registry for resolving modules by identifier
pub struct CapabilityRegistry {
    modules: HashMap<String, Arc<dyn AnalysisModule>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }

    /// Registers a module under its contract id, replacing any previous one.
    pub fn register(&mut self, module: Arc<dyn AnalysisModule>) {
        let contract = module.contract();
        tracing::debug!(capability = %contract.id, accepts = ?contract.accepts, "Registered capability");
        self.modules.insert(contract.id, module);
    }

    /// Module for `id`, provided its contract accepts `kind`.
    pub fn resolve(&self, id: &str, kind: RequestKind) -> Result<Arc<dyn AnalysisModule>> {
        let module = self
            .modules
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestrationError::CapabilityNotFound(id.to_string()))?;

        let contract = module.contract();
        if contract.accepts != kind {
            return Err(OrchestrationError::ContractMismatch(format!(
                "{} accepts {:?}, requested {:?}",
                id, contract.accepts, kind
            )));
        }

        Ok(module)
    }

    pub fn contracts(&self) -> Vec<CapabilityContract> {
        let mut contracts: Vec<_> = self.modules.values().map(|m| m.contract()).collect();
        contracts.sort_by(|a, b| a.id.cmp(&b.id));
        contracts
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_checks_the_declared_contract() {
        let mut registry = CapabilityRegistry::new();
        registry.register(Arc::new(ScriptedModule::new(CapabilityContract::screening(
            "screen.test",
        ))));

        assert!(registry.resolve("screen.test", RequestKind::Screen).is_ok());
        assert!(matches!(
            registry.resolve("screen.test", RequestKind::DeepEvaluation),
            Err(OrchestrationError::ContractMismatch(_))
        ));
        assert!(matches!(
            registry.resolve("missing", RequestKind::Screen),
            Err(OrchestrationError::CapabilityNotFound(_))
        ));
    }

    #[test]
    fn contracts_declare_their_dispositions() {
        let screening = CapabilityContract::screening("s");
        assert!(screening.permits(Disposition::Escalate));
        assert!(!screening.permits(Disposition::Terminal));
        assert!(CapabilityContract::deep_evaluation("d").permits(Disposition::Terminal));
    }
}
