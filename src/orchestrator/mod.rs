//! Candidate orchestrator
//!
//! DISCOVER → SCREEN → EVALUATE → SIZE → RISK → APPROVE → EXECUTE → HOLD
//!
//! Owns every candidate's lifecycle. Work is handed to the layer's worker
//! pool and the candidate is parked; results, approvals and settlements come
//! back as events and are applied one at a time under the candidate's lock.
//! Every result carries the generation it was produced for, and anything
//! older than the candidate's current generation is discarded.

pub mod sizing;

pub use sizing::{ConfidenceWeightedSizer, PositionSizer, Sizing};

use crate::audit::{AuditEvent, AuditLog};
use crate::config::RetryPolicy;
use crate::error::OrchestrationError;
use crate::events::{self, EngineEvent, EventReceiver, EventSender};
use crate::execution::ExecutionDispatcher;
use crate::gate::{ApprovalDraft, HumanGate};
use crate::models::{
    ApprovalRequest, ApprovalStatus, Candidate, CandidateEventKind, CandidateId, Decision,
    Disposition, EvidenceHandle, ExecutionOrder, Generation, InstrumentProfile, Layer,
    LifecycleState, OrderStatus, ReEvaluationCause, ReEvaluationReason, Recommendation, Task,
    TaskStatus, Verdict,
};
use crate::portfolio::snapshot::QUANTITY_EPSILON;
use crate::portfolio::{PortfolioChange, PortfolioStateManager};
use crate::risk::RiskMonitor;
use crate::trigger::ReEvaluator;
use crate::worker::{WorkOutcome, WorkerPool, WorkerReport};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Actor recorded when a pending approval is withdrawn by a re-evaluation.
pub const REEVALUATION_ACTOR: &str = "system:re-evaluation";

/// A candidate together with the tasks issued for it.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateView {
    pub candidate: Candidate,
    pub tasks: Vec<Task>,
}

struct CandidateEntry {
    candidate: Candidate,
    tasks: Vec<Task>,
}

impl CandidateEntry {
    fn active_task(&self, layer: Layer) -> Option<&Task> {
        self.tasks.iter().find(|t| {
            t.layer == layer && t.generation == self.candidate.generation && t.status.is_active()
        })
    }

    fn view(&self) -> CandidateView {
        CandidateView {
            candidate: self.candidate.clone(),
            tasks: self.tasks.clone(),
        }
    }
}

/// Collaborators the orchestrator drives.
pub struct OrchestratorDeps {
    pub pools: HashMap<Layer, Arc<WorkerPool>>,
    pub retry: RetryPolicy,
    pub risk: RiskMonitor,
    pub sizer: Box<dyn PositionSizer>,
    pub portfolio: Arc<PortfolioStateManager>,
    pub gate: Arc<HumanGate>,
    pub dispatcher: Arc<ExecutionDispatcher>,
    pub audit: Arc<AuditLog>,
    pub events: EventSender,
}

pub struct Orchestrator {
    candidates: RwLock<HashMap<CandidateId, Arc<Mutex<CandidateEntry>>>>,
    pools: HashMap<Layer, Arc<WorkerPool>>,
    retry: RetryPolicy,
    risk: RiskMonitor,
    sizer: Box<dyn PositionSizer>,
    portfolio: Arc<PortfolioStateManager>,
    gate: Arc<HumanGate>,
    dispatcher: Arc<ExecutionDispatcher>,
    audit: Arc<AuditLog>,
    events: EventSender,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        Self {
            candidates: RwLock::new(HashMap::new()),
            pools: deps.pools,
            retry: deps.retry,
            risk: deps.risk,
            sizer: deps.sizer,
            portfolio: deps.portfolio,
            gate: deps.gate,
            dispatcher: deps.dispatcher,
            audit: deps.audit,
            events: deps.events,
        }
    }

    // =============================
    // Public operations
    // =============================

    /// Register a candidate. Returns false if it was already known.
    pub async fn discover(
        &self,
        id: CandidateId,
        profile: InstrumentProfile,
        origin_layer: Layer,
    ) -> Result<bool> {
        let mut candidates = self.candidates.write().await;
        if candidates.contains_key(&id) {
            return Ok(false);
        }

        self.audit
            .append(AuditEvent::CandidateDiscovered {
                candidate: id.clone(),
                profile: profile.clone(),
                origin_layer,
            })
            .await?;

        info!(candidate = %id, origin_layer = %origin_layer, sector = %profile.sector, "Candidate discovered");

        let candidate = Candidate::discovered(id.clone(), profile, origin_layer);
        candidates.insert(
            id,
            Arc::new(Mutex::new(CandidateEntry {
                candidate,
                tasks: Vec::new(),
            })),
        );
        Ok(true)
    }

    /// Enqueue analysis of a known candidate at `layer`.
    ///
    /// A candidate past discovery is reopened under a new generation. Fails
    /// with `DuplicateActive` while a task for the same layer is in flight.
    pub async fn submit(&self, id: &CandidateId, layer: Layer) -> Result<Task> {
        let handle = self.entry(id).await?;
        let mut entry = handle.lock().await;

        if entry.active_task(layer).is_some() {
            return Err(OrchestrationError::DuplicateActive {
                candidate: id.to_string(),
                layer: layer.to_string(),
            });
        }

        let state = entry.candidate.state;
        if state == LifecycleState::Discovered {
            entry.candidate.generation += 1;
            self.transition(&mut entry, layer.working_state()).await?;
            return self.dispatch(&mut entry, layer).await;
        }

        if state.is_settling() {
            return Err(OrchestrationError::InvalidTransition {
                candidate: id.to_string(),
                from: state.to_string(),
                to: layer.working_state().to_string(),
            });
        }

        let reason = ReEvaluationReason {
            cause: ReEvaluationCause::Manual,
            detail: format!("resubmitted at {}", layer),
            target_layer: Some(layer),
        };
        self.reopen(&mut entry, reason).await
    }

    /// Reopen a candidate under a new generation. While capital is settling
    /// the request is held and applied once the order settles.
    pub async fn re_evaluate(&self, id: &CandidateId, reason: ReEvaluationReason) -> Result<()> {
        let handle = self.entry(id).await?;
        let mut entry = handle.lock().await;

        if entry.candidate.state.is_settling() {
            info!(
                candidate = %id,
                state = %entry.candidate.state,
                "Re-evaluation deferred until the order settles"
            );
            entry.candidate.record(CandidateEventKind::ReEvaluationRequested {
                reason: reason.clone(),
                deferred: true,
            });
            entry.candidate.deferred_reevaluation = Some(reason);
            return Ok(());
        }

        self.reopen(&mut entry, reason).await.map(|_| ())
    }

    pub async fn candidate_view(&self, id: &CandidateId) -> Result<CandidateView> {
        let handle = self.entry(id).await?;
        let entry = handle.lock().await;
        Ok(entry.view())
    }

    pub async fn candidate_state(&self, id: &CandidateId) -> Result<LifecycleState> {
        let handle = self.entry(id).await?;
        let state = handle.lock().await.candidate.state;
        Ok(state)
    }

    pub async fn candidates(&self) -> Vec<CandidateView> {
        let handles: Vec<_> = self.candidates.read().await.values().cloned().collect();
        let mut views = Vec::with_capacity(handles.len());
        for handle in handles {
            views.push(handle.lock().await.view());
        }
        views.sort_by(|a, b| a.candidate.id.cmp(&b.candidate.id));
        views
    }

    /// Seed the registry from recovered candidates. Tasks are not restored;
    /// `resume_in_flight` reissues the work.
    pub async fn restore(&self, restored: Vec<Candidate>) {
        let mut candidates = self.candidates.write().await;
        for candidate in restored {
            candidates.insert(
                candidate.id.clone(),
                Arc::new(Mutex::new(CandidateEntry {
                    candidate,
                    tasks: Vec::new(),
                })),
            );
        }
        info!(count = candidates.len(), "Candidates restored");
    }

    /// Pick up every candidate that was mid-flight when the process stopped.
    /// Analysis restarts under a new generation; approved work is submitted
    /// to the dispatcher (idempotently) and settled orders are folded in.
    pub async fn resume_in_flight(&self) -> Result<usize> {
        let handles: Vec<_> = self.candidates.read().await.values().cloned().collect();
        let mut resumed = 0;

        for handle in handles {
            let mut entry = handle.lock().await;
            let state = entry.candidate.state;

            let target = match state {
                LifecycleState::Screening | LifecycleState::ReEvaluationTriggered => Some(Layer::Screening),
                LifecycleState::FlaggedForDeepEval
                | LifecycleState::UnderEvaluation
                | LifecycleState::RecommendationReady
                | LifecycleState::RiskCheck => Some(Layer::DeepEvaluation),
                _ => None,
            };

            if let Some(layer) = target {
                let reason = ReEvaluationReason {
                    cause: ReEvaluationCause::Recovery,
                    detail: format!("interrupted in {}", state),
                    target_layer: Some(layer),
                };
                self.reopen_after_crash(&mut entry, reason).await?;
                resumed += 1;
                continue;
            }

            match state {
                LifecycleState::PendingApproval => {
                    let resolved = match entry.candidate.approval_id {
                        Some(id) => self.gate.get(id).await,
                        None => None,
                    };
                    if let Some(request) = resolved.filter(|r| r.status != ApprovalStatus::Pending) {
                        self.apply_resolution(&mut entry, &request).await?;
                        resumed += 1;
                    }
                }
                LifecycleState::Approved => {
                    if let Some(request) = self.approval_of(&entry).await {
                        self.execute(&mut entry, &request).await?;
                        resumed += 1;
                    }
                }
                LifecycleState::Executing => {
                    let order = match &entry.candidate.order_key {
                        Some(key) => self.dispatcher.order(key).await,
                        None => None,
                    };
                    if let Some(order) = order.filter(|o| o.status.is_final()) {
                        self.settle(&mut entry, &order).await?;
                        resumed += 1;
                    }
                }
                _ => {}
            }
        }

        info!(resumed, "Resumed in-flight candidates");
        Ok(resumed)
    }

    // =============================
    // Event loop
    // =============================

    pub async fn run(self: Arc<Self>, mut events: EventReceiver) {
        info!("Orchestrator event loop started");

        while let Some(event) = events.recv().await {
            if matches!(event, EngineEvent::Shutdown) {
                break;
            }

            let kind = event.kind();
            if let Err(e) = self.handle_event(event).await {
                if e.is_fatal() {
                    error!(event = kind, error = %e, "Fatal error while applying event");
                } else {
                    warn!(event = kind, error = %e, "Event could not be applied");
                }
            }
        }

        info!("Orchestrator event loop stopped");
    }

    pub async fn handle_event(&self, event: EngineEvent) -> Result<()> {
        match event {
            EngineEvent::Worker(report) => self.on_worker_report(report).await,
            EngineEvent::RetryDue {
                candidate,
                generation,
                layer,
            } => self.on_retry_due(&candidate, generation, layer).await,
            EngineEvent::ApprovalResolved(request) => self.on_approval_resolved(request).await,
            EngineEvent::OrderSettled(order) => self.on_order_settled(order).await,
            EngineEvent::Shutdown => Ok(()),
        }
    }

    async fn on_worker_report(&self, report: WorkerReport) -> Result<()> {
        let handle = self.entry(&report.candidate).await?;
        let mut entry = handle.lock().await;

        let Some(index) = entry.tasks.iter().position(|t| t.task_id == report.task_id) else {
            warn!(task_id = %report.task_id, candidate = %report.candidate, "Report for unknown task");
            return Ok(());
        };

        let current = entry.candidate.generation;
        if report.generation < current || entry.tasks[index].status == TaskStatus::Stale {
            if !matches!(report.outcome, WorkOutcome::Started) {
                info!(
                    candidate = %report.candidate,
                    task_id = %report.task_id,
                    result_generation = report.generation,
                    current_generation = current,
                    "Discarded stale result"
                );
                entry.candidate.record(CandidateEventKind::StaleResultDiscarded {
                    task_id: report.task_id,
                    result_generation: report.generation,
                });
            }
            return Ok(());
        }

        if !entry.tasks[index].status.is_active() {
            debug!(task_id = %report.task_id, "Report for settled task ignored");
            return Ok(());
        }

        let layer = report.layer;
        match report.outcome {
            WorkOutcome::Started => {
                let timeout = self
                    .pools
                    .get(&layer)
                    .and_then(|p| chrono::Duration::from_std(p.task_timeout()).ok());
                let task = &mut entry.tasks[index];
                task.status = TaskStatus::Running;
                task.started_at = Some(report.at);
                if let Some(timeout) = timeout {
                    task.deadline = report.at + timeout;
                }
                Ok(())
            }
            WorkOutcome::Completed(recommendation) => {
                resolve_task(&mut entry, index, TaskStatus::Done, None, report.at);
                self.on_recommendation(&mut entry, layer, recommendation).await
            }
            WorkOutcome::Failed(message) => {
                resolve_task(&mut entry, index, TaskStatus::Failed, Some(message.clone()), report.at);
                self.on_task_failure(&mut entry, layer, message).await
            }
            WorkOutcome::TimedOut => {
                let message = OrchestrationError::ModuleTimeout(report.task_id).to_string();
                resolve_task(&mut entry, index, TaskStatus::Timeout, Some(message.clone()), report.at);
                self.on_task_failure(&mut entry, layer, message).await
            }
        }
    }

    async fn on_retry_due(&self, id: &CandidateId, generation: Generation, layer: Layer) -> Result<()> {
        let handle = self.entry(id).await?;
        let mut entry = handle.lock().await;

        if generation != entry.candidate.generation
            || entry.candidate.state != layer.working_state()
            || entry.active_task(layer).is_some()
        {
            debug!(candidate = %id, generation, "Retry no longer applies");
            return Ok(());
        }

        self.dispatch(&mut entry, layer).await.map(|_| ())
    }

    async fn on_approval_resolved(&self, request: ApprovalRequest) -> Result<()> {
        let handle = self.entry(&request.candidate).await?;
        let mut entry = handle.lock().await;

        if request.generation != entry.candidate.generation
            || entry.candidate.approval_id != Some(request.request_id)
            || entry.candidate.state != LifecycleState::PendingApproval
        {
            debug!(
                request_id = %request.request_id,
                candidate = %request.candidate,
                "Resolution for a superseded approval ignored"
            );
            return Ok(());
        }

        self.apply_resolution(&mut entry, &request).await
    }

    async fn apply_resolution(&self, entry: &mut CandidateEntry, request: &ApprovalRequest) -> Result<()> {
        if request.status == ApprovalStatus::Pending {
            return Ok(());
        }

        entry.candidate.record(CandidateEventKind::ApprovalResolved {
            request_id: request.request_id,
            status: request.status,
        });

        match request.status {
            ApprovalStatus::Approved => {
                self.transition(entry, LifecycleState::Approved).await?;
                self.execute(entry, request).await
            }
            _ => {
                info!(
                    candidate = %request.candidate,
                    status = ?request.status,
                    decided_by = ?request.decided_by,
                    "Recommendation not approved"
                );
                self.transition(entry, LifecycleState::Rejected).await
            }
        }
    }

    async fn on_order_settled(&self, order: ExecutionOrder) -> Result<()> {
        let handle = self.entry(&order.candidate).await?;
        let mut entry = handle.lock().await;

        if entry.candidate.order_key.as_ref() != Some(&order.key)
            || entry.candidate.state != LifecycleState::Executing
        {
            debug!(key = %order.key, "Settlement for a superseded order ignored");
            return Ok(());
        }

        self.settle(&mut entry, &order).await
    }

    // =============================
    // Lifecycle steps
    // =============================

    async fn on_recommendation(
        &self,
        entry: &mut CandidateEntry,
        layer: Layer,
        recommendation: Recommendation,
    ) -> Result<()> {
        entry.candidate.attempts = 0;
        if let Some(bucket) = &recommendation.risk_bucket {
            entry.candidate.profile.risk_bucket = bucket.clone();
        }
        if recommendation.volatility.is_some() {
            entry.candidate.profile.volatility = recommendation.volatility;
        }

        info!(
            candidate = %entry.candidate.id,
            generation = entry.candidate.generation,
            layer = %layer,
            action = ?recommendation.action,
            confidence = recommendation.confidence,
            disposition = ?recommendation.disposition,
            "Layer result received"
        );

        if recommendation.disposition == Disposition::Discard {
            entry.candidate.recommendation = Some(recommendation);
            return self.transition(entry, LifecycleState::Discarded).await;
        }

        // Screening never concludes on its own; anything it keeps goes deeper.
        if let Some(next) = layer.next() {
            self.transition(entry, LifecycleState::FlaggedForDeepEval).await?;
            self.transition(entry, next.working_state()).await?;
            self.dispatch(entry, next).await?;
            return Ok(());
        }

        entry.candidate.recommendation = Some(recommendation);
        self.transition(entry, LifecycleState::RecommendationReady).await?;
        self.decide(entry).await
    }

    /// Size the recommendation, run risk and raise an approval.
    async fn decide(&self, entry: &mut CandidateEntry) -> Result<()> {
        let recommendation = entry.candidate.recommendation.clone().ok_or_else(|| {
            OrchestrationError::InvalidRecommendation(format!(
                "{} reached a decision without a recommendation",
                entry.candidate.id
            ))
        })?;

        let snapshot = self.portfolio.snapshot().await?;
        let delta = match self.sizer.size(&entry.candidate, &recommendation, &snapshot) {
            Ok(Sizing::Trade(delta)) => delta,
            Ok(Sizing::NoTrade) => {
                let resting = if snapshot.quantity_of(&entry.candidate.id) > QUANTITY_EPSILON {
                    LifecycleState::Held
                } else {
                    LifecycleState::Closed
                };
                debug!(candidate = %entry.candidate.id, action = ?recommendation.action, "No trade required");
                return self.transition(entry, resting).await;
            }
            Err(e) => return self.degrade(entry, e.to_string()).await,
        };

        self.transition(entry, LifecycleState::RiskCheck).await?;

        let assessment = self.risk.assess(&delta, &snapshot);
        entry.candidate.record(CandidateEventKind::RiskAssessed {
            verdict: assessment.verdict,
            reasons: assessment.reasons.clone(),
        });
        entry.candidate.assessment = Some(assessment.clone());

        if assessment.verdict == Verdict::Block {
            let breach = OrchestrationError::RiskLimitBreach {
                candidate: entry.candidate.id.to_string(),
                reasons: format!("{:?}", assessment.reasons),
            };
            warn!(candidate = %entry.candidate.id, error = %breach, "Recommendation blocked");
            entry.candidate.record(CandidateEventKind::Failure {
                error: breach.to_string(),
            });
            return self.transition(entry, LifecycleState::Blocked).await;
        }

        if let Err(e) = self.portfolio.propose_mutation(&delta).await {
            return self.degrade(entry, e.to_string()).await;
        }

        let request = self
            .gate
            .raise(ApprovalDraft {
                candidate: entry.candidate.id.clone(),
                generation: entry.candidate.generation,
                recommendation,
                delta,
                assessment,
            })
            .await?;

        entry.candidate.approval_id = Some(request.request_id);
        entry.candidate.record(CandidateEventKind::ApprovalRaised {
            request_id: request.request_id,
        });
        self.transition(entry, LifecycleState::PendingApproval).await
    }

    /// Hand an approved request to the dispatcher. The delta is re-checked
    /// if the portfolio moved since it was assessed.
    async fn execute(&self, entry: &mut CandidateEntry, request: &ApprovalRequest) -> Result<()> {
        let snapshot = self.portfolio.snapshot().await?;
        if snapshot.version != request.base_version {
            let assessment = self.risk.assess(&request.delta, &snapshot);
            entry.candidate.record(CandidateEventKind::RiskAssessed {
                verdict: assessment.verdict,
                reasons: assessment.reasons.clone(),
            });
            entry.candidate.assessment = Some(assessment.clone());

            if assessment.verdict == Verdict::Block {
                let breach = OrchestrationError::RiskLimitBreach {
                    candidate: entry.candidate.id.to_string(),
                    reasons: format!("{:?}", assessment.reasons),
                };
                warn!(
                    candidate = %entry.candidate.id,
                    base_version = request.base_version,
                    current_version = snapshot.version,
                    error = %breach,
                    "Approved delta blocked against the current portfolio"
                );
                entry.candidate.record(CandidateEventKind::Failure {
                    error: breach.to_string(),
                });
                return self.transition(entry, LifecycleState::Blocked).await;
            }
        }

        match self.dispatcher.submit(request.request_id).await {
            Ok(order) => {
                entry.candidate.order_key = Some(order.key.clone());
                entry.candidate.record(CandidateEventKind::OrderSubmitted {
                    key: order.key.clone(),
                });
                self.transition(entry, LifecycleState::Executing).await
            }
            Err(e) => self.degrade(entry, e.to_string()).await,
        }
    }

    async fn settle(&self, entry: &mut CandidateEntry, order: &ExecutionOrder) -> Result<()> {
        entry.candidate.record(CandidateEventKind::OrderSettled {
            key: order.key.clone(),
            status: order.status,
            filled_quantity: order.filled_quantity,
        });

        match order.status {
            OrderStatus::Filled => {
                let snapshot = self.portfolio.snapshot().await?;
                let resting = if snapshot.quantity_of(&entry.candidate.id) > QUANTITY_EPSILON {
                    LifecycleState::Held
                } else {
                    LifecycleState::Closed
                };
                info!(
                    candidate = %entry.candidate.id,
                    filled = order.filled_quantity,
                    price = order.average_fill_price,
                    "Order settled"
                );
                self.transition(entry, resting).await?;
            }
            OrderStatus::Failed => {
                let reason = order
                    .failure
                    .clone()
                    .unwrap_or_else(|| "order failed".to_string());
                self.degrade(entry, reason).await?;
            }
            OrderStatus::Submitted | OrderStatus::PartiallyFilled => return Ok(()),
        }

        if let Some(reason) = entry.candidate.deferred_reevaluation.take() {
            info!(candidate = %entry.candidate.id, "Applying deferred re-evaluation");
            self.reopen(entry, reason).await?;
        }
        Ok(())
    }

    async fn on_task_failure(&self, entry: &mut CandidateEntry, layer: Layer, message: String) -> Result<()> {
        entry.candidate.record(CandidateEventKind::Failure {
            error: message.clone(),
        });

        if entry.candidate.attempts >= self.retry.max_retries {
            error!(
                candidate = %entry.candidate.id,
                layer = %layer,
                attempts = entry.candidate.attempts,
                error = %message,
                "Retries exhausted"
            );
            return self.transition(entry, LifecycleState::Degraded).await;
        }

        entry.candidate.attempts += 1;
        let attempt = entry.candidate.attempts;
        let delay = self.retry.backoff(attempt);
        entry.candidate.record(CandidateEventKind::RetryScheduled {
            layer,
            attempt,
            delay_ms: delay.as_millis() as u64,
        });

        warn!(
            candidate = %entry.candidate.id,
            layer = %layer,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "Task failed; retrying"
        );

        let sender = self.events.clone();
        let candidate = entry.candidate.id.clone();
        let generation = entry.candidate.generation;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            events::deliver(
                &sender,
                EngineEvent::RetryDue {
                    candidate,
                    generation,
                    layer,
                },
            );
        });
        Ok(())
    }

    async fn degrade(&self, entry: &mut CandidateEntry, reason: String) -> Result<()> {
        error!(candidate = %entry.candidate.id, state = %entry.candidate.state, error = %reason, "Candidate degraded");
        entry.candidate.record(CandidateEventKind::Failure { error: reason });
        self.transition(entry, LifecycleState::Degraded).await
    }

    /// Start a new generation: withdraw any pending approval, mark in-flight
    /// tasks stale and dispatch at the target layer.
    async fn reopen(&self, entry: &mut CandidateEntry, reason: ReEvaluationReason) -> Result<Task> {
        let target = reason.target_layer.unwrap_or(Layer::Screening);
        entry.candidate.record(CandidateEventKind::ReEvaluationRequested {
            reason: reason.clone(),
            deferred: false,
        });

        if entry.candidate.state == LifecycleState::PendingApproval {
            if let Some(request_id) = entry.candidate.approval_id {
                match self.gate.decide(request_id, Decision::Reject, REEVALUATION_ACTOR).await {
                    Ok(withdrawn) => entry.candidate.record(CandidateEventKind::ApprovalResolved {
                        request_id,
                        status: withdrawn.status,
                    }),
                    Err(e) => debug!(request_id = %request_id, error = %e, "Approval already settled"),
                }
            }
        }

        let previous = entry.candidate.generation;
        entry.candidate.generation += 1;
        entry.candidate.attempts = 0;
        entry.candidate.recommendation = None;
        entry.candidate.assessment = None;
        entry.candidate.approval_id = None;
        entry.candidate.order_key = None;

        let now = Utc::now();
        let mut invalidated = Vec::new();
        for task in entry.tasks.iter_mut().filter(|t| t.status.is_active()) {
            task.status = TaskStatus::Stale;
            task.finished_at = Some(now);
            invalidated.push((task.task_id, task.layer));
        }
        for (task_id, layer) in invalidated {
            if let Some(pool) = self.pools.get(&layer) {
                pool.invalidate(task_id).await;
            }
        }

        info!(
            candidate = %entry.candidate.id,
            from_generation = previous,
            generation = entry.candidate.generation,
            target_layer = %target,
            reason = %reason.detail,
            "Re-evaluating candidate"
        );

        self.transition(entry, LifecycleState::ReEvaluationTriggered).await?;
        self.transition(entry, target.working_state()).await?;
        self.dispatch(entry, target).await
    }

    /// Like `reopen`, but also accepts a candidate recovered while already
    /// in `ReEvaluationTriggered`.
    async fn reopen_after_crash(&self, entry: &mut CandidateEntry, reason: ReEvaluationReason) -> Result<Task> {
        if entry.candidate.state == LifecycleState::ReEvaluationTriggered {
            let target = reason.target_layer.unwrap_or(Layer::Screening);
            entry.candidate.generation += 1;
            entry.candidate.record(CandidateEventKind::ReEvaluationRequested { reason, deferred: false });
            self.transition(entry, target.working_state()).await?;
            return self.dispatch(entry, target).await;
        }
        self.reopen(entry, reason).await
    }

    // =============================
    // Helpers
    // =============================

    async fn entry(&self, id: &CandidateId) -> Result<Arc<Mutex<CandidateEntry>>> {
        self.candidates
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestrationError::CandidateNotFound(id.to_string()))
    }

    async fn approval_of(&self, entry: &CandidateEntry) -> Option<ApprovalRequest> {
        let request_id = entry.candidate.approval_id?;
        self.gate
            .get(request_id)
            .await
            .filter(|r| r.status == ApprovalStatus::Approved)
    }

    async fn transition(&self, entry: &mut CandidateEntry, to: LifecycleState) -> Result<()> {
        let from = entry.candidate.state;
        if !from.can_transition_to(to) {
            return Err(OrchestrationError::InvalidTransition {
                candidate: entry.candidate.id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        self.audit
            .append(AuditEvent::CandidateTransition {
                candidate: entry.candidate.id.clone(),
                generation: entry.candidate.generation,
                from,
                to,
            })
            .await?;

        entry.candidate.state = to;
        entry.candidate.record(CandidateEventKind::Transition { from, to });

        debug!(
            candidate = %entry.candidate.id,
            generation = entry.candidate.generation,
            from = %from,
            to = %to,
            "Transition"
        );
        Ok(())
    }

    async fn dispatch(&self, entry: &mut CandidateEntry, layer: Layer) -> Result<Task> {
        let pool = self.pools.get(&layer).ok_or_else(|| {
            OrchestrationError::ConfigError(format!("no worker pool for layer {}", layer))
        })?;

        let now = Utc::now();
        let timeout = chrono::Duration::from_std(pool.task_timeout())
            .map_err(|e| OrchestrationError::ConfigError(format!("task timeout: {}", e)))?;

        let task = Task {
            task_id: Uuid::new_v4(),
            candidate: entry.candidate.id.clone(),
            generation: entry.candidate.generation,
            layer,
            capability: pool.capability().to_string(),
            status: TaskStatus::Pending,
            attempt: entry.candidate.attempts,
            deadline: now + timeout,
            submitted_at: now,
            started_at: None,
            finished_at: None,
            error: None,
        };

        entry.candidate.record(CandidateEventKind::TaskSubmitted {
            task_id: task.task_id,
            layer,
            attempt: task.attempt,
        });
        entry.tasks.push(task.clone());

        pool.dispatch(&task, entry.candidate.profile.clone(), entry.candidate.evidence.clone())
            .await;
        Ok(task)
    }
}

fn resolve_task(
    entry: &mut CandidateEntry,
    index: usize,
    status: TaskStatus,
    error: Option<String>,
    at: DateTime<Utc>,
) {
    let task = &mut entry.tasks[index];
    task.status = status;
    task.finished_at = Some(at);
    task.error = error.clone();
    let (task_id, layer) = (task.task_id, task.layer);

    entry.candidate.record(CandidateEventKind::TaskResolved {
        task_id,
        layer,
        status,
        error,
    });
}

#[async_trait::async_trait]
impl ReEvaluator for Orchestrator {
    async fn stage_of(&self, candidate: &CandidateId) -> Option<LifecycleState> {
        self.candidate_state(candidate).await.ok()
    }

    async fn attach_evidence(&self, candidate: &CandidateId, handle: EvidenceHandle) -> Result<()> {
        let entry = self.entry(candidate).await?;
        let mut entry = entry.lock().await;
        if !entry.candidate.evidence.contains(&handle) {
            entry.candidate.evidence.push(handle);
            entry.candidate.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn re_evaluate(&self, candidate: &CandidateId, reason: ReEvaluationReason) -> Result<()> {
        Orchestrator::re_evaluate(self, candidate, reason).await
    }

    /// Candidates in the same sector as the one that changed.
    async fn related_candidates(&self, change: &PortfolioChange) -> Vec<CandidateId> {
        let sector = match self.entry(&change.candidate).await {
            Ok(handle) => handle.lock().await.candidate.profile.sector.clone(),
            Err(_) => return Vec::new(),
        };

        let handles: Vec<_> = self.candidates.read().await.values().cloned().collect();
        let mut related = Vec::new();
        for handle in handles {
            let entry = handle.lock().await;
            if entry.candidate.profile.sector == sector {
                related.push(entry.candidate.id.clone());
            }
        }
        related
    }
}
