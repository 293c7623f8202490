//! Scripted analysis capability
//!
//! Replays queued outcomes per candidate, with optional delays. Used by the
//! demo binary and by tests that need deterministic module behaviour.

use super::{AnalysisError, AnalysisModule, AnalysisRequest, CapabilityContract};
use crate::models::{Action, CandidateId, Disposition, EvidenceHandle, Recommendation};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Recommend {
        action: Action,
        confidence: f64,
        disposition: Disposition,
        reference_price: Option<f64>,
        volatility: Option<f64>,
    },
    Fail(AnalysisError),
}

#[derive(Debug, Clone)]
pub struct ScriptedStep {
    pub delay: Duration,
    pub outcome: ScriptedOutcome,
}

impl ScriptedStep {
    pub fn recommend(action: Action, confidence: f64, disposition: Disposition) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: ScriptedOutcome::Recommend {
                action,
                confidence,
                disposition,
                reference_price: None,
                volatility: None,
            },
        }
    }

    pub fn fail(error: AnalysisError) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: ScriptedOutcome::Fail(error),
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        if let ScriptedOutcome::Recommend { reference_price, .. } = &mut self.outcome {
            *reference_price = Some(price);
        }
        self
    }

    pub fn with_volatility(mut self, vol: f64) -> Self {
        if let ScriptedOutcome::Recommend { volatility, .. } = &mut self.outcome {
            *volatility = Some(vol);
        }
        self
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

pub struct ScriptedModule {
    contract: CapabilityContract,
    default_step: Option<ScriptedStep>,
    queues: Mutex<HashMap<CandidateId, VecDeque<ScriptedStep>>>,
    calls: AtomicUsize,
}

impl ScriptedModule {
    pub fn new(contract: CapabilityContract) -> Self {
        Self {
            contract,
            default_step: None,
            queues: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Step used once a candidate's queue is empty.
    pub fn with_default(mut self, step: ScriptedStep) -> Self {
        self.default_step = Some(step);
        self
    }

    pub async fn push(&self, candidate: &CandidateId, step: ScriptedStep) {
        let mut queues = self.queues.lock().await;
        queues.entry(candidate.clone()).or_default().push_back(step);
    }

    /// Total evaluations started, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl AnalysisModule for ScriptedModule {
    fn contract(&self) -> CapabilityContract {
        self.contract.clone()
    }

    async fn evaluate(&self, request: &AnalysisRequest) -> Result<Recommendation, AnalysisError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        let step = {
            let mut queues = self.queues.lock().await;
            queues
                .get_mut(&request.candidate)
                .and_then(|queue| queue.pop_front())
                .or_else(|| self.default_step.clone())
        };

        let step = step.ok_or_else(|| {
            AnalysisError::Failed(format!("no scripted outcome for {}", request.candidate))
        })?;

        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }

        match step.outcome {
            ScriptedOutcome::Fail(e) => Err(e),
            ScriptedOutcome::Recommend {
                action,
                confidence,
                disposition,
                reference_price,
                volatility,
            } => {
                let rationale = EvidenceHandle(format!(
                    "{}:{}:{}#{}",
                    self.contract.id, request.candidate, request.generation, call
                ));
                let mut recommendation = request.recommend(action, confidence, disposition, rationale);
                recommendation.reference_price = reference_price;
                recommendation.volatility = volatility;
                Ok(recommendation)
            }
        }
    }
}
