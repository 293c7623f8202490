//! Worker pool per escalation layer
//!
//! Each pool owns a fixed number of execution slots. A dispatched task waits
//! for a slot, then runs its analysis module under a deadline measured from
//! the moment it started. Transient fetch failures are retried inside the
//! pool; every other outcome is reported back to the orchestrator as an
//! event. Results of invalidated tasks are dropped.
//!
//! A task is live while its handle sits in the pool's running map. The job
//! removes itself as it sends its final report; invalidation removes and
//! aborts it. Nothing is kept once a task is gone.

use crate::analysis::{AnalysisError, AnalysisModule, AnalysisRequest, CapabilityContract};
use crate::config::{LayerSettings, RetryPolicy};
use crate::events::{self, EngineEvent, EventSender};
use crate::models::{CandidateId, EvidenceHandle, Generation, InstrumentProfile, Layer, Recommendation, Task};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum WorkOutcome {
    Started,
    Completed(Recommendation),
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub task_id: Uuid,
    pub candidate: CandidateId,
    pub generation: Generation,
    pub layer: Layer,
    pub outcome: WorkOutcome,
    pub at: DateTime<Utc>,
}

pub struct WorkerPool {
    layer: Layer,
    settings: LayerSettings,
    retry: RetryPolicy,
    module: Arc<dyn AnalysisModule>,
    slots: Arc<Semaphore>,
    events: EventSender,
    running: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
}

impl WorkerPool {
    pub fn new(
        layer: Layer,
        settings: LayerSettings,
        retry: RetryPolicy,
        module: Arc<dyn AnalysisModule>,
        events: EventSender,
    ) -> Self {
        info!(
            layer = %layer,
            capability = %settings.capability,
            concurrency = settings.concurrency,
            "Worker pool ready"
        );

        Self {
            layer,
            slots: Arc::new(Semaphore::new(settings.concurrency)),
            settings,
            retry,
            module,
            events,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    pub fn capability(&self) -> &str {
        &self.settings.capability
    }

    pub fn task_timeout(&self) -> std::time::Duration {
        self.settings.task_timeout
    }

    /// Tasks currently holding a slot.
    pub fn busy_slots(&self) -> usize {
        self.settings.concurrency - self.slots.available_permits()
    }

    /// Queue a task; returns immediately.
    pub async fn dispatch(&self, task: &Task, profile: InstrumentProfile, evidence: Vec<EvidenceHandle>) {
        let request = AnalysisRequest {
            task_id: task.task_id,
            candidate: task.candidate.clone(),
            profile,
            generation: task.generation,
            kind: self.layer.into(),
            layer: self.layer,
            evidence,
            deadline: task.deadline,
        };

        let job = Job {
            request,
            module: self.module.clone(),
            contract: self.module.contract(),
            settings: self.settings.clone(),
            retry: self.retry.clone(),
            slots: self.slots.clone(),
            events: self.events.clone(),
            running: self.running.clone(),
        };

        debug!(task_id = %task.task_id, candidate = %task.candidate, layer = %self.layer, "Dispatching task");

        // Registration happens under the lock so the job's own removal cannot
        // run before the insert.
        let mut running = self.running.lock().await;
        let handle = tokio::spawn(job.run());
        running.insert(task.task_id, handle);
    }

    /// Drop any result of the task and free its slot.
    pub async fn invalidate(&self, task_id: Uuid) {
        if let Some(handle) = self.running.lock().await.remove(&task_id) {
            handle.abort();
            debug!(task_id = %task_id, layer = %self.layer, "Invalidated running task");
        }
    }

    /// Tasks queued or running.
    pub async fn in_flight(&self) -> usize {
        self.running.lock().await.len()
    }
}

struct Job {
    request: AnalysisRequest,
    module: Arc<dyn AnalysisModule>,
    contract: CapabilityContract,
    settings: LayerSettings,
    retry: RetryPolicy,
    slots: Arc<Semaphore>,
    events: EventSender,
    running: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
}

impl Job {
    async fn run(self) {
        let task_id = self.request.task_id;

        let permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(task_id = %task_id, "Worker pool closed before task started");
                return;
            }
        };

        let mut request = self.request.clone();
        request.deadline = Utc::now()
            + chrono::Duration::from_std(self.settings.task_timeout).unwrap_or_else(|_| chrono::Duration::zero());
        self.report(WorkOutcome::Started, false).await;

        let outcome = match tokio::time::timeout(self.settings.task_timeout, self.attempt(&request)).await {
            Ok(Ok(recommendation)) => WorkOutcome::Completed(recommendation),
            Ok(Err(e)) => WorkOutcome::Failed(e.to_string()),
            Err(_) => {
                warn!(task_id = %task_id, candidate = %request.candidate, "Task exceeded its deadline");
                WorkOutcome::TimedOut
            }
        };

        drop(permit);
        self.report(outcome, true).await;
    }

    async fn attempt(&self, request: &AnalysisRequest) -> Result<Recommendation, AnalysisError> {
        let mut retries = 0;
        loop {
            match self.module.evaluate(request).await {
                Ok(recommendation) => return validate(&self.contract, request, recommendation),
                Err(e) if e.is_transient() && retries < self.settings.transient_retries => {
                    retries += 1;
                    let delay = self.retry.backoff(retries);
                    warn!(
                        task_id = %request.task_id,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient fetch failure, retrying in pool"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send unless the task was invalidated. `last` releases the task's
    /// entry in the running map under the same lock as the check.
    async fn report(&self, outcome: WorkOutcome, last: bool) {
        let mut running = self.running.lock().await;
        let live = if last {
            running.remove(&self.request.task_id).is_some()
        } else {
            running.contains_key(&self.request.task_id)
        };
        drop(running);
        if !live {
            debug!(task_id = %self.request.task_id, "Dropping result of invalidated task");
            return;
        }

        let report = WorkerReport {
            task_id: self.request.task_id,
            candidate: self.request.candidate.clone(),
            generation: self.request.generation,
            layer: self.request.layer,
            outcome,
            at: Utc::now(),
        };

        events::deliver(&self.events, EngineEvent::Worker(report));
    }
}

/// Reject output that breaks the module's declared contract.
fn validate(
    contract: &CapabilityContract,
    request: &AnalysisRequest,
    recommendation: Recommendation,
) -> Result<Recommendation, AnalysisError> {
    if recommendation.candidate != request.candidate {
        return Err(AnalysisError::InvalidOutput(format!(
            "recommendation for {} on a task for {}",
            recommendation.candidate, request.candidate
        )));
    }
    if recommendation.generation != request.generation {
        return Err(AnalysisError::InvalidOutput(format!(
            "generation {} on a task for generation {}",
            recommendation.generation, request.generation
        )));
    }
    if !recommendation.confidence.is_finite() || !(0.0..=1.0).contains(&recommendation.confidence) {
        return Err(AnalysisError::InvalidOutput(format!(
            "confidence {} outside [0, 1]",
            recommendation.confidence
        )));
    }
    if !contract.permits(recommendation.disposition) {
        return Err(AnalysisError::InvalidOutput(format!(
            "{} may not return {:?}",
            contract.id, recommendation.disposition
        )));
    }
    if let Some(price) = recommendation.reference_price {
        if !(price.is_finite() && price > 0.0) {
            return Err(AnalysisError::InvalidOutput(format!("reference price {}", price)));
        }
    }
    Ok(recommendation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{ScriptedModule, ScriptedStep};
    use crate::config::test_config;
    use crate::events::{self, EventReceiver};
    use crate::models::{Action, Disposition, TaskStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn task(symbol: &str, generation: Generation) -> Task {
        let now = Utc::now();
        Task {
            task_id: Uuid::new_v4(),
            candidate: CandidateId::new(symbol, "XNAS"),
            generation,
            layer: Layer::Screening,
            capability: "screen.test".to_string(),
            status: TaskStatus::Pending,
            attempt: 0,
            deadline: now,
            submitted_at: now,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    fn pool(module: Arc<dyn AnalysisModule>, concurrency: usize) -> (WorkerPool, EventReceiver) {
        let config = test_config();
        let mut settings = config.layers[&Layer::Screening].clone();
        settings.concurrency = concurrency;
        let (tx, rx) = events::channel();
        (WorkerPool::new(Layer::Screening, settings, config.retry, module, tx), rx)
    }

    async fn next_final(rx: &mut EventReceiver) -> WorkerReport {
        loop {
            match rx.recv().await {
                Some(EngineEvent::Worker(report)) if !matches!(report.outcome, WorkOutcome::Started) => {
                    return report
                }
                Some(_) => continue,
                None => panic!("channel closed"),
            }
        }
    }

    /// Tracks peak concurrency.
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl AnalysisModule for Gauge {
        fn contract(&self) -> CapabilityContract {
            CapabilityContract::screening("screen.test")
        }

        async fn evaluate(&self, request: &AnalysisRequest) -> Result<Recommendation, AnalysisError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(request.recommend(
                Action::Buy,
                0.9,
                Disposition::Escalate,
                EvidenceHandle("gauge".to_string()),
            ))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_its_slot_count() {
        let gauge = Arc::new(Gauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let (pool, mut rx) = pool(gauge.clone(), 2);

        for i in 0..5 {
            pool.dispatch(&task(&format!("T{}", i), 1), InstrumentProfile::default(), vec![])
                .await;
        }
        for _ in 0..5 {
            let report = next_final(&mut rx).await;
            assert!(matches!(report.outcome, WorkOutcome::Completed(_)));
        }
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_module_times_out() {
        let module = Arc::new(
            ScriptedModule::new(CapabilityContract::screening("screen.test")).with_default(
                ScriptedStep::recommend(Action::Buy, 0.5, Disposition::Escalate)
                    .after(Duration::from_secs(5)),
            ),
        );
        let (pool, mut rx) = pool(module, 1);

        pool.dispatch(&task("SLOW", 1), InstrumentProfile::default(), vec![]).await;
        let report = next_final(&mut rx).await;
        assert!(matches!(report.outcome, WorkOutcome::TimedOut));
        assert_eq!(pool.busy_slots(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_in_pool() {
        let module = Arc::new(ScriptedModule::new(CapabilityContract::screening("screen.test")));
        let t = task("FLAKY", 1);
        module
            .push(&t.candidate, ScriptedStep::fail(AnalysisError::TransientFetch("503".into())))
            .await;
        module
            .push(&t.candidate, ScriptedStep::recommend(Action::Buy, 0.6, Disposition::Escalate))
            .await;
        let (pool, mut rx) = pool(module.clone(), 1);

        pool.dispatch(&t, InstrumentProfile::default(), vec![]).await;
        let report = next_final(&mut rx).await;
        assert!(matches!(report.outcome, WorkOutcome::Completed(_)));
        assert_eq!(module.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_contract_output_fails_the_task() {
        let module = Arc::new(
            ScriptedModule::new(CapabilityContract::screening("screen.test"))
                .with_default(ScriptedStep::recommend(Action::Buy, 1.5, Disposition::Escalate)),
        );
        let (pool, mut rx) = pool(module, 1);

        pool.dispatch(&task("BAD", 1), InstrumentProfile::default(), vec![]).await;
        let report = next_final(&mut rx).await;
        assert!(matches!(report.outcome, WorkOutcome::Failed(ref msg) if msg.contains("confidence")));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidated_task_reports_nothing() {
        let module = Arc::new(
            ScriptedModule::new(CapabilityContract::screening("screen.test")).with_default(
                ScriptedStep::recommend(Action::Buy, 0.5, Disposition::Escalate)
                    .after(Duration::from_millis(100)),
            ),
        );
        let (pool, mut rx) = pool(module, 1);
        let t = task("STALE", 1);

        pool.dispatch(&t, InstrumentProfile::default(), vec![]).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.invalidate(t.task_id).await;

        let outcome = tokio::time::timeout(Duration::from_secs(1), next_final(&mut rx)).await;
        assert!(outcome.is_err(), "no final report expected");
        assert_eq!(pool.busy_slots(), 0);
        assert_eq!(pool.in_flight().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_and_invalidated_tasks_leave_no_trace() {
        let module = Arc::new(
            ScriptedModule::new(CapabilityContract::screening("screen.test")).with_default(
                ScriptedStep::recommend(Action::Buy, 0.5, Disposition::Escalate)
                    .after(Duration::from_millis(20)),
            ),
        );
        let (pool, mut rx) = pool(module, 4);

        for round in 0..50 {
            let reopened = task(&format!("R{}", round), 1);
            let kept = task(&format!("K{}", round), 2);
            pool.dispatch(&reopened, InstrumentProfile::default(), vec![]).await;
            pool.dispatch(&kept, InstrumentProfile::default(), vec![]).await;
            pool.invalidate(reopened.task_id).await;

            let report = next_final(&mut rx).await;
            assert_eq!(report.task_id, kept.task_id);
        }

        assert_eq!(pool.in_flight().await, 0);
        // Late invalidation of a finished task is a no-op.
        pool.invalidate(Uuid::new_v4()).await;
        assert_eq!(pool.in_flight().await, 0);
    }
}
