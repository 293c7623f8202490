//! Audit logging and replay system
//!
//! Append-only, hash-chained record of every portfolio commit, approval,
//! order update and candidate transition. Entries are never mutated; a broken
//! chain is reported as state corruption.

use crate::error::OrchestrationError;
use crate::models::{
    ApprovalRequest, CandidateId, ExecutionOrder, Generation, InstrumentProfile, Layer,
    LifecycleState, PortfolioDelta,
};
use crate::portfolio::PortfolioState;
use crate::state::StateStore;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;

/// `prev_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    PortfolioInitialized {
        snapshot: PortfolioState,
        snapshot_hash: String,
    },
    PortfolioCommitted {
        version: u64,
        approval_id: Option<Uuid>,
        delta: PortfolioDelta,
        snapshot_hash: String,
    },
    ApprovalRaised {
        request: ApprovalRequest,
    },
    ApprovalResolved {
        request: ApprovalRequest,
    },
    OrderUpdated {
        order: ExecutionOrder,
        fill_cursor: u64,
    },
    CandidateDiscovered {
        candidate: CandidateId,
        profile: InstrumentProfile,
        origin_layer: Layer,
    },
    CandidateTransition {
        candidate: CandidateId,
        generation: Generation,
        from: LifecycleState,
        to: LifecycleState,
    },
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::PortfolioInitialized { .. } => "portfolio_initialized",
            AuditEvent::PortfolioCommitted { .. } => "portfolio_committed",
            AuditEvent::ApprovalRaised { .. } => "approval_raised",
            AuditEvent::ApprovalResolved { .. } => "approval_resolved",
            AuditEvent::OrderUpdated { .. } => "order_updated",
            AuditEvent::CandidateDiscovered { .. } => "candidate_discovered",
            AuditEvent::CandidateTransition { .. } => "candidate_transition",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: AuditEvent,
    pub prev_hash: String,
    pub entry_hash: String,
}

/// Last entry covered by a checkpoint; the chain continues from here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditAnchor {
    pub seq: u64,
    pub hash: String,
}

impl Default for AuditAnchor {
    fn default() -> Self {
        Self {
            seq: 0,
            hash: GENESIS_HASH.to_string(),
        }
    }
}

struct Chain {
    anchor: AuditAnchor,
    entries: Vec<AuditEntry>,
}

impl Chain {
    fn head(&self) -> (u64, &str) {
        match self.entries.last() {
            Some(last) => (last.seq, last.entry_hash.as_str()),
            None => (self.anchor.seq, self.anchor.hash.as_str()),
        }
    }
}

/// Audit trail storage
pub struct AuditLog {
    chain: RwLock<Chain>,
    store: Option<Arc<dyn StateStore>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            chain: RwLock::new(Chain {
                anchor: AuditAnchor::default(),
                entries: Vec::new(),
            }),
            store: None,
        }
    }

    /// Entries are written through to `store` before they become visible.
    pub fn with_store(store: Arc<dyn StateStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new()
        }
    }

    /// Continue a chain recovered from durable storage.
    pub fn resume(
        store: Option<Arc<dyn StateStore>>,
        anchor: AuditAnchor,
        entries: Vec<AuditEntry>,
    ) -> Self {
        Self {
            chain: RwLock::new(Chain { anchor, entries }),
            store,
        }
    }

    /// Append an event to the chain
    pub async fn append(&self, event: AuditEvent) -> Result<AuditEntry> {
        let mut chain = self.chain.write().await;
        let (head_seq, head_hash) = chain.head();

        let seq = head_seq + 1;
        let recorded_at = Utc::now();
        let prev_hash = head_hash.to_string();
        let entry_hash = compute_entry_hash(&prev_hash, seq, &recorded_at, &event)?;

        let entry = AuditEntry {
            seq,
            recorded_at,
            event,
            prev_hash,
            entry_hash,
        };

        if let Some(store) = &self.store {
            store.append_audit(&entry).await.map_err(|e| {
                OrchestrationError::AuditError(format!(
                    "failed to persist audit entry {}: {}",
                    seq, e
                ))
            })?;
        }

        debug!(seq, kind = entry.event.kind(), "Audit entry appended");
        chain.entries.push(entry.clone());
        Ok(entry)
    }

    /// Entries whose sequence falls in `range`, oldest first.
    pub async fn trail(&self, range: Range<u64>) -> Vec<AuditEntry> {
        let chain = self.chain.read().await;
        chain
            .entries
            .iter()
            .filter(|entry| range.contains(&entry.seq))
            .cloned()
            .collect()
    }

    pub async fn entries_since(&self, seq: u64) -> Vec<AuditEntry> {
        self.trail(seq + 1..u64::MAX).await
    }

    pub async fn head(&self) -> AuditAnchor {
        let chain = self.chain.read().await;
        let (seq, hash) = chain.head();
        AuditAnchor {
            seq,
            hash: hash.to_string(),
        }
    }

    /// Walk the chain from its anchor and recompute every hash.
    pub async fn verify_chain(&self) -> Result<()> {
        let chain = self.chain.read().await;
        verify_entries(&chain.anchor, &chain.entries)
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Check that `entries` extend `anchor` without gaps or altered content.
pub fn verify_entries(anchor: &AuditAnchor, entries: &[AuditEntry]) -> Result<()> {
    let mut expected_seq = anchor.seq + 1;
    let mut expected_prev = anchor.hash.as_str();

    for entry in entries {
        if entry.seq != expected_seq || entry.prev_hash != expected_prev {
            error!(seq = entry.seq, expected_seq, "Audit chain discontinuity");
            return Err(OrchestrationError::StateCorruption(format!(
                "audit chain broken at seq {} (expected seq {})",
                entry.seq, expected_seq
            )));
        }

        let recomputed =
            compute_entry_hash(&entry.prev_hash, entry.seq, &entry.recorded_at, &entry.event)?;
        if recomputed != entry.entry_hash {
            error!(seq = entry.seq, "Audit entry hash mismatch");
            return Err(OrchestrationError::StateCorruption(format!(
                "audit entry {} fails its hash check",
                entry.seq
            )));
        }

        expected_seq += 1;
        expected_prev = entry.entry_hash.as_str();
    }

    Ok(())
}

/// Hash linking an entry to its predecessor.
pub fn compute_entry_hash(
    prev_hash: &str,
    seq: u64,
    recorded_at: &DateTime<Utc>,
    event: &AuditEvent,
) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(seq.to_be_bytes());
    hasher.update(recorded_at.to_rfc3339().as_bytes());

    serde_json::to_writer(&mut HashWriter(&mut hasher), event)?;

    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 hash of a portfolio snapshot for integrity verification
/// Uses zero-copy streaming serialization into hasher
pub fn compute_snapshot_hash(state: &PortfolioState) -> String {
    let mut hasher = Sha256::new();

    // Stream JSON directly into hasher (no intermediate String)
    if serde_json::to_writer(&mut HashWriter(&mut hasher), state).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
