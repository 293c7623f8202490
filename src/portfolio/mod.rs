//! Portfolio State Manager
//!
//! The only writer of portfolio state. Readers get immutable snapshots;
//! writers go through an optimistic-concurrency commit that is serialized
//! behind a single write lock and recorded in the audit log.

pub mod snapshot;

pub use snapshot::{Holding, MutationError, PortfolioState};

use crate::audit::{compute_snapshot_hash, AuditEvent, AuditLog};
use crate::error::OrchestrationError;
use crate::models::{CandidateId, PortfolioDelta};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of a dry-run mutation.
#[derive(Debug, Clone)]
pub struct ProposedMutation {
    pub base_version: u64,
    pub candidate_version: u64,
    pub projected: PortfolioState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommittedVersion {
    pub state: Arc<PortfolioState>,
    pub hash: String,
    pub approval_id: Option<Uuid>,
    pub committed_at: DateTime<Utc>,
}

/// Published after every successful commit.
#[derive(Debug, Clone)]
pub struct PortfolioChange {
    pub version: u64,
    pub candidate: CandidateId,
    pub approval_id: Option<Uuid>,
}

struct Ledger {
    versions: Vec<CommittedVersion>,
    halted: Option<String>,
}

impl Ledger {
    fn current(&self) -> Result<&CommittedVersion> {
        self.versions.last().ok_or_else(|| {
            OrchestrationError::StateCorruption("portfolio has no published version".to_string())
        })
    }
}

pub struct PortfolioStateManager {
    ledger: RwLock<Ledger>,
    audit: Arc<AuditLog>,
    tolerance: f64,
    max_commit_attempts: u32,
    changes: broadcast::Sender<PortfolioChange>,
}

impl PortfolioStateManager {
    /// Publish version 0 and record it in the audit log.
    pub async fn initialize(
        initial_cash: f64,
        audit: Arc<AuditLog>,
        tolerance: f64,
        max_commit_attempts: u32,
    ) -> Result<Self> {
        let genesis = PortfolioState::genesis(initial_cash);
        genesis.check_invariants(tolerance)?;
        let hash = compute_snapshot_hash(&genesis);

        audit
            .append(AuditEvent::PortfolioInitialized {
                snapshot: genesis.clone(),
                snapshot_hash: hash.clone(),
            })
            .await?;

        info!(cash = initial_cash, "Portfolio initialized");

        Ok(Self::restore(
            vec![CommittedVersion {
                state: Arc::new(genesis),
                hash,
                approval_id: None,
                committed_at: Utc::now(),
            }],
            audit,
            tolerance,
            max_commit_attempts,
        ))
    }

    /// Rebuild from versions recovered by replay.
    pub fn restore(
        versions: Vec<CommittedVersion>,
        audit: Arc<AuditLog>,
        tolerance: f64,
        max_commit_attempts: u32,
    ) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            ledger: RwLock::new(Ledger {
                versions,
                halted: None,
            }),
            audit,
            tolerance,
            max_commit_attempts: max_commit_attempts.max(1),
            changes,
        }
    }

    /// Current published snapshot.
    pub async fn snapshot(&self) -> Result<Arc<PortfolioState>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.current()?.state.clone())
    }

    pub async fn current_version(&self) -> Result<u64> {
        Ok(self.snapshot().await?.version)
    }

    pub async fn version(&self, version: u64) -> Option<CommittedVersion> {
        let ledger = self.ledger.read().await;
        ledger
            .versions
            .iter()
            .find(|v| v.state.version == version)
            .cloned()
    }

    pub async fn history(&self) -> Vec<CommittedVersion> {
        self.ledger.read().await.versions.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PortfolioChange> {
        self.changes.subscribe()
    }

    /// Project `delta` onto the current snapshot. No side effect.
    pub async fn propose_mutation(&self, delta: &PortfolioDelta) -> Result<ProposedMutation> {
        let ledger = self.ledger.read().await;
        let current = &ledger.current()?.state;

        let projected = current.apply(delta)?;
        projected.check_invariants(self.tolerance)?;

        Ok(ProposedMutation {
            base_version: current.version,
            candidate_version: projected.version,
            projected,
        })
    }

    /// Apply `delta` on top of `version`; fails with `VersionConflict` if
    /// another commit got there first.
    pub async fn commit(
        &self,
        version: u64,
        delta: &PortfolioDelta,
        approval_id: Option<Uuid>,
    ) -> Result<Arc<PortfolioState>> {
        let mut ledger = self.ledger.write().await;

        if let Some(reason) = &ledger.halted {
            return Err(OrchestrationError::StateCorruption(format!(
                "mutation halted: {}",
                reason
            )));
        }

        let current = ledger.current()?.clone();
        if current.state.version != version {
            debug!(
                expected = version,
                actual = current.state.version,
                "Commit rejected: stale version"
            );
            return Err(OrchestrationError::VersionConflict {
                expected: version,
                actual: current.state.version,
            });
        }

        if compute_snapshot_hash(&current.state) != current.hash {
            let reason = format!("snapshot v{} fails its hash check", current.state.version);
            error!(version = current.state.version, "Portfolio snapshot corrupted; halting mutation");
            ledger.halted = Some(reason.clone());
            return Err(OrchestrationError::StateCorruption(reason));
        }

        let next = current.state.apply(delta)?;
        next.check_invariants(self.tolerance)?;
        let hash = compute_snapshot_hash(&next);

        self.audit
            .append(AuditEvent::PortfolioCommitted {
                version: next.version,
                approval_id,
                delta: delta.clone(),
                snapshot_hash: hash.clone(),
            })
            .await?;

        let state = Arc::new(next);
        ledger.versions.push(CommittedVersion {
            state: state.clone(),
            hash,
            approval_id,
            committed_at: Utc::now(),
        });

        info!(
            version = state.version,
            candidate = %delta.candidate,
            quantity = delta.quantity,
            price = delta.price,
            cash = state.cash,
            "Portfolio commit"
        );

        // No subscribers is fine.
        let _ = self.changes.send(PortfolioChange {
            version: state.version,
            candidate: delta.candidate.clone(),
            approval_id,
        });

        Ok(state)
    }

    /// Commit with rejection-and-retry. `derive` is re-run against the
    /// latest snapshot on every attempt so the caller can re-validate.
    pub async fn commit_with_retry<F>(
        &self,
        approval_id: Option<Uuid>,
        mut derive: F,
    ) -> Result<Arc<PortfolioState>>
    where
        F: FnMut(&PortfolioState) -> Result<PortfolioDelta> + Send,
    {
        for attempt in 1..=self.max_commit_attempts {
            let snapshot = self.snapshot().await?;
            let delta = derive(&snapshot)?;

            match self.commit(snapshot.version, &delta, approval_id).await {
                Err(OrchestrationError::VersionConflict { expected, actual }) => {
                    warn!(attempt, expected, actual, "Version conflict; retrying commit");
                }
                other => return other,
            }
        }

        Err(OrchestrationError::MutationAbandoned {
            attempts: self.max_commit_attempts,
        })
    }

    /// Re-hash every retained version. Any mismatch halts mutation.
    pub async fn verify_integrity(&self) -> Result<()> {
        let mut ledger = self.ledger.write().await;

        let broken = ledger
            .versions
            .iter()
            .find(|v| compute_snapshot_hash(&v.state) != v.hash)
            .map(|v| v.state.version);

        if let Some(version) = broken {
            let reason = format!("snapshot v{} fails its hash check", version);
            error!(version, "Portfolio integrity check failed; halting mutation");
            ledger.halted = Some(reason.clone());
            return Err(OrchestrationError::StateCorruption(reason));
        }

        Ok(())
    }

    pub async fn is_halted(&self) -> bool {
        self.ledger.read().await.halted.is_some()
    }

    /// Manual recovery step: lift the halt once the operator has repaired
    /// state. Re-verifies first.
    pub async fn resume_after_recovery(&self) -> Result<()> {
        {
            let mut ledger = self.ledger.write().await;
            ledger.halted = None;
        }
        self.verify_integrity().await?;
        self.audit.verify_chain().await?;
        info!("Portfolio mutation resumed after recovery");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn corrupt_current_for_test(&self) {
        let mut ledger = self.ledger.write().await;
        if let Some(last) = ledger.versions.last_mut() {
            last.hash = "tampered".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CandidateId;

    fn buy(symbol: &str, quantity: f64, price: f64) -> PortfolioDelta {
        PortfolioDelta {
            candidate: CandidateId::new(symbol, "XNYS"),
            quantity,
            price,
            sector: "energy".to_string(),
            risk_bucket: "low".to_string(),
            volatility: None,
        }
    }

    async fn manager(attempts: u32) -> PortfolioStateManager {
        PortfolioStateManager::initialize(100_000.0, Arc::new(AuditLog::new()), 1e-9, attempts)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_propose_has_no_side_effect() {
        let manager = manager(3).await;
        let proposal = manager.propose_mutation(&buy("A", 10.0, 50.0)).await.unwrap();

        assert_eq!(proposal.base_version, 0);
        assert_eq!(proposal.candidate_version, 1);
        assert_eq!(manager.current_version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_second_commit_on_same_version_conflicts_then_succeeds() {
        let manager = manager(3).await;
        let base = manager.current_version().await.unwrap();

        manager.commit(base, &buy("A", 10.0, 50.0), None).await.unwrap();
        let conflict = manager.commit(base, &buy("B", 5.0, 20.0), None).await;
        assert!(matches!(
            conflict,
            Err(OrchestrationError::VersionConflict { expected: 0, actual: 1 })
        ));

        let latest = manager.current_version().await.unwrap();
        let state = manager.commit(latest, &buy("B", 5.0, 20.0), None).await.unwrap();
        assert_eq!(state.version, 2);
        assert_eq!(state.holdings.len(), 2);
        assert_eq!(manager.history().await.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_retrying_commits_both_land() {
        let manager = Arc::new(manager(5).await);

        let a = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .commit_with_retry(None, |_| Ok(buy("A", 10.0, 50.0)))
                    .await
            })
        };
        let b = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .commit_with_retry(None, |_| Ok(buy("B", 10.0, 50.0)))
                    .await
            })
        };

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());

        let snapshot = manager.snapshot().await.unwrap();
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.cash, 99_000.0);
        assert!(snapshot.check_invariants(1e-9).is_ok());
    }

    #[tokio::test]
    async fn test_invariant_breach_is_not_committed() {
        let manager = manager(3).await;
        let result = manager.commit(0, &buy("A", 10_000.0, 50.0), None).await;
        assert!(matches!(result, Err(OrchestrationError::InvariantViolation(_))));
        assert_eq!(manager.current_version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_is_audited_with_snapshot_hash() {
        let audit = Arc::new(AuditLog::new());
        let manager = PortfolioStateManager::initialize(1_000.0, audit.clone(), 1e-9, 3)
            .await
            .unwrap();
        let approval = Uuid::new_v4();
        manager.commit(0, &buy("A", 1.0, 10.0), Some(approval)).await.unwrap();

        let entries = audit.entries_since(0).await;
        assert_eq!(entries.len(), 2);
        match &entries[1].event {
            AuditEvent::PortfolioCommitted {
                version,
                approval_id,
                snapshot_hash,
                ..
            } => {
                assert_eq!(*version, 1);
                assert_eq!(*approval_id, Some(approval));
                assert_eq!(snapshot_hash, &manager.history().await[1].hash);
            }
            other => panic!("unexpected audit event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_corruption_halts_mutation_until_recovery() {
        let manager = manager(3).await;
        manager.corrupt_current_for_test().await;

        let result = manager.commit(0, &buy("A", 1.0, 10.0), None).await;
        assert!(matches!(result, Err(OrchestrationError::StateCorruption(_))));
        assert!(manager.is_halted().await);

        // Still corrupted, so resuming fails and mutation stays halted.
        assert!(manager.resume_after_recovery().await.is_err());
        assert!(manager.is_halted().await);
    }
}
