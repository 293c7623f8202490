//! Re-evaluation trigger
//!
//! Turns external evidence updates into re-evaluation requests. An update
//! fires only when its magnitude exceeds the threshold configured for the
//! candidate's current stage. Firing is debounced per candidate: the first
//! update in a cool-down window fires, later ones coalesce into it. A
//! committed portfolio change re-arms related candidates early.

use crate::config::{StageClass, TriggerPolicy};
use crate::models::{
    CandidateId, EvidenceEvent, EvidenceHandle, EvidenceKind, Layer, LifecycleState,
    ReEvaluationCause, ReEvaluationReason,
};
use crate::portfolio::PortfolioChange;
use crate::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The part of the orchestrator the trigger drives.
#[async_trait::async_trait]
pub trait ReEvaluator: Send + Sync {
    async fn stage_of(&self, candidate: &CandidateId) -> Option<LifecycleState>;

    async fn attach_evidence(&self, candidate: &CandidateId, handle: EvidenceHandle) -> Result<()>;

    async fn re_evaluate(&self, candidate: &CandidateId, reason: ReEvaluationReason) -> Result<()>;

    /// Candidates whose triggers a portfolio change should re-arm.
    async fn related_candidates(&self, change: &PortfolioChange) -> Vec<CandidateId>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    UnknownCandidate,
    BelowThreshold {
        stage: StageClass,
        threshold: Option<f64>,
    },
    Coalesced,
    Triggered {
        target_layer: Option<Layer>,
    },
}

pub struct ReEvaluationTrigger {
    policy: TriggerPolicy,
    target: Arc<dyn ReEvaluator>,
    last_fired: Mutex<HashMap<CandidateId, Instant>>,
}

impl ReEvaluationTrigger {
    pub fn new(policy: TriggerPolicy, target: Arc<dyn ReEvaluator>) -> Self {
        Self {
            policy,
            target,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    pub async fn on_evidence(&self, event: EvidenceEvent) -> Result<TriggerOutcome> {
        let Some(state) = self.target.stage_of(&event.candidate).await else {
            debug!(candidate = %event.candidate, "Evidence for unknown candidate ignored");
            return Ok(TriggerOutcome::UnknownCandidate);
        };

        // Evidence accumulates regardless of whether it fires.
        if let Some(handle) = event.handle.clone() {
            self.target.attach_evidence(&event.candidate, handle).await?;
        }

        let stage = StageClass::of(state);
        let threshold = self.policy.thresholds.get(&stage).copied();
        let fires = threshold.map_or(false, |t| event.magnitude.abs() > t);
        if !fires {
            debug!(
                candidate = %event.candidate,
                magnitude = event.magnitude,
                stage = ?stage,
                threshold = ?threshold,
                "Evidence below threshold"
            );
            return Ok(TriggerOutcome::BelowThreshold { stage, threshold });
        }

        {
            let now = Instant::now();
            let mut last_fired = self.last_fired.lock().await;
            if let Some(at) = last_fired.get(&event.candidate) {
                if now.duration_since(*at) < self.policy.cooldown {
                    debug!(candidate = %event.candidate, kind = ?event.kind, "Trigger coalesced");
                    return Ok(TriggerOutcome::Coalesced);
                }
            }
            last_fired.insert(event.candidate.clone(), now);
        }

        let target_layer = narrowest_layer(event.kind, state);
        let reason = ReEvaluationReason {
            cause: ReEvaluationCause::Evidence(event.kind),
            detail: format!("{:?} update of magnitude {:.3}", event.kind, event.magnitude),
            target_layer,
        };

        info!(
            candidate = %event.candidate,
            kind = ?event.kind,
            magnitude = event.magnitude,
            target_layer = ?target_layer,
            "Re-evaluation triggered"
        );

        if let Err(e) = self.target.re_evaluate(&event.candidate, reason).await {
            // Let the next update try again.
            self.last_fired.lock().await.remove(&event.candidate);
            return Err(e);
        }

        Ok(TriggerOutcome::Triggered { target_layer })
    }

    /// Clear the cool-down of candidates related to a committed change.
    pub async fn rearm(&self, change: &PortfolioChange) {
        let related = self.target.related_candidates(change).await;
        if related.is_empty() {
            return;
        }

        let mut last_fired = self.last_fired.lock().await;
        let mut rearmed = 0;
        for candidate in related {
            if last_fired.remove(&candidate).is_some() {
                rearmed += 1;
            }
        }
        debug!(version = change.version, rearmed, "Re-armed triggers after portfolio change");
    }

    pub async fn run_rearm(self: Arc<Self>, mut changes: broadcast::Receiver<PortfolioChange>) {
        loop {
            match changes.recv().await {
                Ok(change) => self.rearm(&change).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Trigger lagged behind portfolio changes; re-arming all");
                    self.last_fired.lock().await.clear();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Fundamentals force a full re-screen. Sentiment and flow only reopen deep
/// evaluation once the candidate has been through screening.
fn narrowest_layer(kind: EvidenceKind, state: LifecycleState) -> Option<Layer> {
    match kind {
        EvidenceKind::Fundamentals => None,
        EvidenceKind::Sentiment | EvidenceKind::InstitutionalFlow => match state {
            LifecycleState::Discovered | LifecycleState::Screening | LifecycleState::Discarded => None,
            _ => Some(Layer::DeepEvaluation),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use chrono::Utc;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        states: std::sync::Mutex<HashMap<CandidateId, LifecycleState>>,
        calls: std::sync::Mutex<Vec<(CandidateId, ReEvaluationReason)>>,
        evidence: std::sync::Mutex<Vec<EvidenceHandle>>,
    }

    impl Recorder {
        fn with(self, id: &CandidateId, state: LifecycleState) -> Self {
            self.states.lock().unwrap().insert(id.clone(), state);
            self
        }

        fn calls(&self) -> Vec<(CandidateId, ReEvaluationReason)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ReEvaluator for Recorder {
        async fn stage_of(&self, candidate: &CandidateId) -> Option<LifecycleState> {
            self.states.lock().unwrap().get(candidate).copied()
        }

        async fn attach_evidence(&self, _candidate: &CandidateId, handle: EvidenceHandle) -> Result<()> {
            self.evidence.lock().unwrap().push(handle);
            Ok(())
        }

        async fn re_evaluate(&self, candidate: &CandidateId, reason: ReEvaluationReason) -> Result<()> {
            self.calls.lock().unwrap().push((candidate.clone(), reason));
            Ok(())
        }

        async fn related_candidates(&self, _change: &PortfolioChange) -> Vec<CandidateId> {
            self.states.lock().unwrap().keys().cloned().collect()
        }
    }

    fn event(id: &CandidateId, kind: EvidenceKind, magnitude: f64) -> EvidenceEvent {
        EvidenceEvent {
            candidate: id.clone(),
            kind,
            magnitude,
            handle: Some(EvidenceHandle(format!("ev-{}", magnitude))),
            observed_at: Utc::now(),
        }
    }

    fn trigger(recorder: Arc<Recorder>) -> ReEvaluationTrigger {
        ReEvaluationTrigger::new(test_config().trigger, recorder)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_above_threshold_and_coalesces_within_cooldown() {
        let id = CandidateId::new("ZZZ", "XNAS");
        let recorder = Arc::new(Recorder::default().with(&id, LifecycleState::UnderEvaluation));
        let trigger = trigger(recorder.clone());

        let low = trigger.on_evidence(event(&id, EvidenceKind::Fundamentals, 0.2)).await.unwrap();
        assert!(matches!(low, TriggerOutcome::BelowThreshold { .. }));

        let first = trigger.on_evidence(event(&id, EvidenceKind::Fundamentals, 0.9)).await.unwrap();
        assert_eq!(first, TriggerOutcome::Triggered { target_layer: None });

        for _ in 0..3 {
            let again = trigger.on_evidence(event(&id, EvidenceKind::Fundamentals, 0.95)).await.unwrap();
            assert_eq!(again, TriggerOutcome::Coalesced);
        }
        assert_eq!(recorder.calls().len(), 1);
        assert_eq!(recorder.evidence.lock().unwrap().len(), 5);

        tokio::time::advance(Duration::from_secs(31)).await;
        let later = trigger.on_evidence(event(&id, EvidenceKind::Fundamentals, 0.9)).await.unwrap();
        assert!(matches!(later, TriggerOutcome::Triggered { .. }));
        assert_eq!(recorder.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn thresholds_depend_on_stage() {
        let held = CandidateId::new("HELD", "XNAS");
        let closed = CandidateId::new("DONE", "XNAS");
        let recorder = Arc::new(
            Recorder::default()
                .with(&held, LifecycleState::Held)
                .with(&closed, LifecycleState::Closed),
        );
        let trigger = trigger(recorder.clone());

        let below = trigger.on_evidence(event(&held, EvidenceKind::Sentiment, 0.6)).await.unwrap();
        assert_eq!(
            below,
            TriggerOutcome::BelowThreshold {
                stage: StageClass::Holding,
                threshold: Some(0.7)
            }
        );

        let never = trigger.on_evidence(event(&closed, EvidenceKind::Fundamentals, 10.0)).await.unwrap();
        assert!(matches!(never, TriggerOutcome::BelowThreshold { threshold: None, .. }));

        let fired = trigger.on_evidence(event(&held, EvidenceKind::Sentiment, -0.8)).await.unwrap();
        assert_eq!(
            fired,
            TriggerOutcome::Triggered {
                target_layer: Some(Layer::DeepEvaluation)
            }
        );

        let unknown = CandidateId::new("NOPE", "XNAS");
        let outcome = trigger.on_evidence(event(&unknown, EvidenceKind::Sentiment, 1.0)).await.unwrap();
        assert_eq!(outcome, TriggerOutcome::UnknownCandidate);
    }

    #[tokio::test(start_paused = true)]
    async fn portfolio_change_rearms_related_candidates() {
        let id = CandidateId::new("REL", "XNAS");
        let recorder = Arc::new(Recorder::default().with(&id, LifecycleState::Screening));
        let trigger = trigger(recorder.clone());

        trigger.on_evidence(event(&id, EvidenceKind::Fundamentals, 0.9)).await.unwrap();
        assert_eq!(
            trigger.on_evidence(event(&id, EvidenceKind::Fundamentals, 0.9)).await.unwrap(),
            TriggerOutcome::Coalesced
        );

        trigger
            .rearm(&PortfolioChange {
                version: 1,
                candidate: CandidateId::new("OTHER", "XNAS"),
                approval_id: None,
            })
            .await;

        let outcome = trigger.on_evidence(event(&id, EvidenceKind::Fundamentals, 0.9)).await.unwrap();
        assert!(matches!(outcome, TriggerOutcome::Triggered { .. }));
        assert_eq!(recorder.calls().len(), 2);
    }
}
