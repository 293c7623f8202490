//! Engine wiring
//!
//! Builds every component from an `EngineConfig`, recovers from the state
//! store when it holds anything, and runs the background loops: the
//! orchestrator's event loop, the approval expiry sweep, fill reconciliation
//! and trigger re-arming.

use crate::analysis::{AnalysisModule, CapabilityContract, CapabilityRegistry};
use crate::audit::{AuditEntry, AuditLog};
use crate::broker::{BrokerClient, PaperBroker};
use crate::config::EngineConfig;
use crate::events::{self, EngineEvent, EventSender};
use crate::execution::ExecutionDispatcher;
use crate::gate::{ApprovalSurface, HumanGate, LoggingSurface};
use crate::models::{
    ApprovalRequest, CandidateId, Decision, EvidenceEvent, ExecutionOrder, InstrumentProfile,
    Layer, ReEvaluationReason, Task,
};
use crate::orchestrator::{
    CandidateView, ConfidenceWeightedSizer, Orchestrator, OrchestratorDeps, PositionSizer,
};
use crate::portfolio::{PortfolioState, PortfolioStateManager};
use crate::recovery::{self, RecoveredState};
use crate::risk::create_default_risk_monitor;
use crate::state::{Checkpoint, StateStore};
use crate::trigger::{ReEvaluationTrigger, ReEvaluator, TriggerOutcome};
use crate::worker::WorkerPool;
use crate::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

pub struct EngineBuilder {
    config: EngineConfig,
    modules: Vec<Arc<dyn AnalysisModule>>,
    broker: Option<Arc<dyn BrokerClient>>,
    store: Option<Arc<dyn StateStore>>,
    surface: Option<Arc<dyn ApprovalSurface>>,
    sizer: Option<Box<dyn PositionSizer>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            modules: Vec::new(),
            broker: None,
            store: None,
            surface: None,
            sizer: None,
        }
    }

    /// Register an analysis capability. Each layer resolves the capability
    /// id named in its settings.
    pub fn with_module(mut self, module: Arc<dyn AnalysisModule>) -> Self {
        self.modules.push(module);
        self
    }

    /// Defaults to an in-process paper broker.
    pub fn with_broker(mut self, broker: Arc<dyn BrokerClient>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Durable audit and checkpoints. Without a store the engine keeps
    /// everything in memory and cannot recover.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_surface(mut self, surface: Arc<dyn ApprovalSurface>) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn with_sizer(mut self, sizer: Box<dyn PositionSizer>) -> Self {
        self.sizer = Some(sizer);
        self
    }

    pub async fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let mut registry = CapabilityRegistry::new();
        for module in self.modules {
            registry.register(module);
        }

        let recovered = match &self.store {
            Some(store) => recovery::recover(store).await?,
            None => None,
        };

        let (audit, portfolio, recovered) = match recovered {
            Some(state) => {
                let RecoveredState {
                    anchor,
                    entries,
                    portfolio,
                    approvals,
                    orders,
                    fill_cursor,
                    candidates,
                } = state;

                let audit = Arc::new(AuditLog::resume(self.store.clone(), anchor, entries));
                let manager = PortfolioStateManager::restore(
                    portfolio,
                    audit.clone(),
                    config.portfolio.weight_tolerance,
                    config.portfolio.max_commit_attempts,
                );
                manager.verify_integrity().await?;
                (audit, Arc::new(manager), Some((approvals, orders, fill_cursor, candidates)))
            }
            None => {
                let audit = Arc::new(match &self.store {
                    Some(store) => AuditLog::with_store(store.clone()),
                    None => AuditLog::new(),
                });
                let manager = PortfolioStateManager::initialize(
                    config.portfolio.initial_cash,
                    audit.clone(),
                    config.portfolio.weight_tolerance,
                    config.portfolio.max_commit_attempts,
                )
                .await?;
                (audit, Arc::new(manager), None)
            }
        };

        let (sender, receiver) = events::channel();

        let mut pools = HashMap::new();
        for layer in Layer::ALL {
            let settings = config.layer(layer)?.clone();
            let module = registry.resolve(&settings.capability, layer.into())?;
            pools.insert(
                layer,
                Arc::new(WorkerPool::new(
                    layer,
                    settings,
                    config.retry.clone(),
                    module,
                    sender.clone(),
                )),
            );
        }

        let surface = self.surface.unwrap_or_else(|| Arc::new(LoggingSurface));
        let gate = Arc::new(HumanGate::new(
            config.gate.clone(),
            audit.clone(),
            sender.clone(),
            surface,
        ));

        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(PaperBroker::with_defaults()));
        let dispatcher = Arc::new(ExecutionDispatcher::new(
            broker,
            gate.clone(),
            portfolio.clone(),
            audit.clone(),
            sender.clone(),
        ));

        let sizer = self
            .sizer
            .unwrap_or_else(|| Box::new(ConfidenceWeightedSizer::new(config.sizing.clone())));

        let orchestrator = Arc::new(Orchestrator::new(OrchestratorDeps {
            pools,
            retry: config.retry.clone(),
            risk: create_default_risk_monitor(config.risk.clone()),
            sizer,
            portfolio: portfolio.clone(),
            gate: gate.clone(),
            dispatcher: dispatcher.clone(),
            audit: audit.clone(),
            events: sender.clone(),
        }));

        let target: Arc<dyn ReEvaluator> = orchestrator.clone();
        let trigger = Arc::new(ReEvaluationTrigger::new(config.trigger.clone(), target));

        let resuming = recovered.is_some();
        if let Some((approvals, orders, fill_cursor, candidates)) = recovered {
            gate.restore(approvals).await;
            dispatcher.restore(orders, fill_cursor).await;
            orchestrator.restore(candidates).await;
        }

        let background = vec![
            tokio::spawn(orchestrator.clone().run(receiver)),
            tokio::spawn(gate.clone().run_expiry()),
            tokio::spawn(
                dispatcher
                    .clone()
                    .run_reconciliation(config.execution.reconcile_interval),
            ),
            tokio::spawn(trigger.clone().run_rearm(portfolio.subscribe())),
        ];

        if resuming {
            orchestrator.resume_in_flight().await?;
        }

        info!(
            capabilities = registry.contracts().len(),
            recovered = resuming,
            "Engine started"
        );

        Ok(Engine {
            config,
            registry,
            store: self.store,
            audit,
            portfolio,
            gate,
            dispatcher,
            orchestrator,
            trigger,
            events: sender,
            background,
            stopped: AtomicBool::new(false),
        })
    }
}

/// Running engine. Dropping it stops the background loops.
pub struct Engine {
    config: EngineConfig,
    registry: CapabilityRegistry,
    store: Option<Arc<dyn StateStore>>,
    audit: Arc<AuditLog>,
    portfolio: Arc<PortfolioStateManager>,
    gate: Arc<HumanGate>,
    dispatcher: Arc<ExecutionDispatcher>,
    orchestrator: Arc<Orchestrator>,
    trigger: Arc<ReEvaluationTrigger>,
    events: EventSender,
    background: Vec<JoinHandle<()>>,
    stopped: AtomicBool,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Vec<CapabilityContract> {
        self.registry.contracts()
    }

    /// Register (if new) and enqueue at `origin_layer`.
    pub async fn submit_candidate(
        &self,
        id: CandidateId,
        profile: InstrumentProfile,
        origin_layer: Layer,
    ) -> Result<Task> {
        self.orchestrator
            .discover(id.clone(), profile, origin_layer)
            .await?;
        self.orchestrator.submit(&id, origin_layer).await
    }

    pub async fn candidate_state(&self, id: &CandidateId) -> Result<CandidateView> {
        self.orchestrator.candidate_view(id).await
    }

    pub async fn candidates(&self) -> Vec<CandidateView> {
        self.orchestrator.candidates().await
    }

    pub async fn portfolio_snapshot(&self) -> Result<Arc<PortfolioState>> {
        self.portfolio.snapshot().await
    }

    pub async fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.gate.pending().await
    }

    pub async fn decide_approval(
        &self,
        request_id: Uuid,
        decision: Decision,
        actor: &str,
    ) -> Result<ApprovalRequest> {
        self.gate.decide(request_id, decision, actor).await
    }

    pub async fn audit_trail(&self, range: Range<u64>) -> Vec<AuditEntry> {
        self.audit.trail(range).await
    }

    pub async fn verify_audit(&self) -> Result<()> {
        self.audit.verify_chain().await
    }

    pub async fn publish_evidence(&self, event: EvidenceEvent) -> Result<TriggerOutcome> {
        self.trigger.on_evidence(event).await
    }

    pub async fn re_evaluate(&self, id: &CandidateId, reason: ReEvaluationReason) -> Result<()> {
        self.orchestrator.re_evaluate(id, reason).await
    }

    pub async fn orders(&self) -> Vec<ExecutionOrder> {
        self.dispatcher.orders().await
    }

    /// Run one reconciliation cycle now instead of waiting for the timer.
    pub async fn reconcile_now(&self) -> Result<usize> {
        self.dispatcher.reconcile().await
    }

    /// Capture the current state and, with a store, persist it.
    pub async fn checkpoint(&self) -> Result<Checkpoint> {
        let checkpoint = Checkpoint {
            anchor: self.audit.head().await,
            taken_at: Utc::now(),
            portfolio: self.portfolio.history().await,
            approvals: self.gate.all().await,
            orders: self.dispatcher.orders().await,
            fill_cursor: self.dispatcher.fill_cursor().await,
            candidates: self
                .orchestrator
                .candidates()
                .await
                .into_iter()
                .map(|view| view.candidate)
                .collect(),
        };

        if let Some(store) = &self.store {
            store.save_checkpoint(&checkpoint).await?;
            info!(seq = checkpoint.anchor.seq, "Checkpoint saved");
        }
        Ok(checkpoint)
    }

    /// Stop the event loop and background tasks. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        events::deliver(&self.events, EngineEvent::Shutdown);
        for handle in &self.background {
            handle.abort();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
