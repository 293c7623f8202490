//! State persistence layer
//!
//! Durable home for the audit chain and periodic checkpoints. Every table of
//! the logical layout (candidates, tasks, portfolio versions, approvals,
//! orders) is a projection of the audit log, so recovery only needs the last
//! checkpoint plus the entries after it.

pub mod postgres;

pub use postgres::PostgresStateStore;

use crate::audit::{AuditAnchor, AuditEntry};
use crate::models::{ApprovalRequest, Candidate, ExecutionOrder};
use crate::portfolio::CommittedVersion;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Consistent image of the engine at one audit sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub anchor: AuditAnchor,
    pub taken_at: DateTime<Utc>,
    pub portfolio: Vec<CommittedVersion>,
    pub approvals: Vec<ApprovalRequest>,
    pub orders: Vec<ExecutionOrder>,
    pub fill_cursor: u64,
    pub candidates: Vec<Candidate>,
}

/// Trait for state persistence
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn append_audit(&self, entry: &AuditEntry) -> Result<()>;
    /// Entries with `seq > after`, ascending.
    async fn load_audit_since(&self, after: u64) -> Result<Vec<AuditEntry>>;
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>>;
}

/// In-memory state store for development and tests
pub struct InMemoryStateStore {
    audit: Arc<RwLock<Vec<AuditEntry>>>,
    checkpoint: Arc<RwLock<Option<Checkpoint>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            audit: Arc::new(RwLock::new(Vec::new())),
            checkpoint: Arc::new(RwLock::new(None)),
        }
    }

    #[cfg(test)]
    pub(crate) async fn tamper_for_test<F: FnOnce(&mut Vec<AuditEntry>)>(&self, f: F) {
        let mut audit = self.audit.write().await;
        f(&mut audit);
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StateStore for InMemoryStateStore {
    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let mut audit = self.audit.write().await;
        audit.push(entry.clone());
        Ok(())
    }

    async fn load_audit_since(&self, after: u64) -> Result<Vec<AuditEntry>> {
        let audit = self.audit.read().await;
        Ok(audit.iter().filter(|e| e.seq > after).cloned().collect())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut slot = self.checkpoint.write().await;
        *slot = Some(checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoint.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEvent, AuditLog};
    use crate::models::{CandidateId, InstrumentProfile, Layer};
    use tokio_test::{assert_err, assert_ok};

    fn discovered(symbol: &str) -> AuditEvent {
        AuditEvent::CandidateDiscovered {
            candidate: CandidateId::new(symbol, "XNAS"),
            profile: InstrumentProfile {
                sector: "technology".to_string(),
                risk_bucket: "medium".to_string(),
                volatility: None,
            },
            origin_layer: Layer::Screening,
        }
    }

    #[tokio::test]
    async fn audit_entries_load_after_a_sequence() {
        let store = Arc::new(InMemoryStateStore::new());
        let log = AuditLog::with_store(store.clone());
        for symbol in ["A", "B", "C"] {
            assert_ok!(log.append(discovered(symbol)).await);
        }

        let all = assert_ok!(store.load_audit_since(0).await);
        assert_eq!(all.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);

        let tail = assert_ok!(store.load_audit_since(2).await);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, 3);
    }

    #[tokio::test]
    async fn latest_checkpoint_wins() {
        let store = InMemoryStateStore::new();
        assert!(assert_ok!(store.load_checkpoint().await).is_none());

        for seq in [4, 9] {
            let checkpoint = Checkpoint {
                anchor: AuditAnchor {
                    seq,
                    hash: format!("h{}", seq),
                },
                taken_at: Utc::now(),
                portfolio: Vec::new(),
                approvals: Vec::new(),
                orders: Vec::new(),
                fill_cursor: seq,
                candidates: Vec::new(),
            };
            assert_ok!(store.save_checkpoint(&checkpoint).await);
        }

        let loaded = assert_ok!(store.load_checkpoint().await).unwrap();
        assert_eq!(loaded.anchor.seq, 9);
        assert_eq!(loaded.fill_cursor, 9);
    }

    #[tokio::test]
    async fn resumed_chain_rejects_a_broken_link() {
        let store = Arc::new(InMemoryStateStore::new());
        let log = AuditLog::with_store(store.clone());
        assert_ok!(log.append(discovered("A")).await);
        assert_ok!(log.append(discovered("B")).await);

        store
            .tamper_for_test(|entries| entries[1].prev_hash = "0".repeat(64))
            .await;
        let entries = assert_ok!(store.load_audit_since(0).await);
        assert_err!(crate::audit::verify_entries(&AuditAnchor::default(), &entries));
    }
}
