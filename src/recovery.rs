//! Crash recovery
//!
//! Rebuilds component state from the last checkpoint plus the audit entries
//! written after it. The chain is verified before anything is replayed and
//! every replayed portfolio version must reproduce its recorded hash.

use crate::audit::{compute_snapshot_hash, verify_entries, AuditAnchor, AuditEntry, AuditEvent};
use crate::error::OrchestrationError;
use crate::models::{
    ApprovalRequest, Candidate, CandidateEventKind, CandidateId, ExecutionOrder, IdempotencyKey,
    OrderStatus,
};
use crate::portfolio::snapshot::QUANTITY_EPSILON;
use crate::portfolio::{CommittedVersion, PortfolioState};
use crate::state::StateStore;
use crate::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Everything needed to restart the engine where it stopped.
#[derive(Debug, Clone)]
pub struct RecoveredState {
    /// Anchor of the checkpoint the replay started from.
    pub anchor: AuditAnchor,
    /// Entries after the anchor; the resumed audit log continues them.
    pub entries: Vec<AuditEntry>,
    pub portfolio: Vec<CommittedVersion>,
    pub approvals: Vec<ApprovalRequest>,
    pub orders: Vec<ExecutionOrder>,
    pub fill_cursor: u64,
    pub candidates: Vec<Candidate>,
}

/// Load and replay. `None` when the store holds nothing yet.
pub async fn recover(store: &Arc<dyn StateStore>) -> Result<Option<RecoveredState>> {
    let checkpoint = store.load_checkpoint().await?;
    let anchor = checkpoint
        .as_ref()
        .map(|c| c.anchor.clone())
        .unwrap_or_default();

    let entries = store.load_audit_since(anchor.seq).await?;
    if checkpoint.is_none() && entries.is_empty() {
        return Ok(None);
    }
    verify_entries(&anchor, &entries)?;

    let mut replay = match checkpoint {
        Some(checkpoint) => Replay {
            portfolio: checkpoint.portfolio,
            approvals: checkpoint
                .approvals
                .into_iter()
                .map(|r| (r.request_id, r))
                .collect(),
            orders: checkpoint
                .orders
                .into_iter()
                .map(|o| (o.key.clone(), o))
                .collect(),
            fill_cursor: checkpoint.fill_cursor,
            candidates: checkpoint
                .candidates
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect(),
        },
        None => Replay::default(),
    };

    for entry in &entries {
        replay.apply(entry)?;
    }
    replay.reconcile_orders();

    if replay.portfolio.is_empty() {
        return Err(OrchestrationError::StateCorruption(
            "recovered log never initialized the portfolio".to_string(),
        ));
    }

    info!(
        anchor_seq = anchor.seq,
        replayed = entries.len(),
        portfolio_version = replay.portfolio.len() - 1,
        approvals = replay.approvals.len(),
        orders = replay.orders.len(),
        candidates = replay.candidates.len(),
        "State recovered"
    );

    Ok(Some(RecoveredState {
        anchor,
        entries,
        portfolio: replay.portfolio,
        approvals: replay.approvals.into_values().collect(),
        orders: replay.orders.into_values().collect(),
        fill_cursor: replay.fill_cursor,
        candidates: replay.candidates.into_values().collect(),
    }))
}

#[derive(Default)]
struct Replay {
    portfolio: Vec<CommittedVersion>,
    approvals: HashMap<Uuid, ApprovalRequest>,
    orders: BTreeMap<IdempotencyKey, ExecutionOrder>,
    fill_cursor: u64,
    candidates: BTreeMap<CandidateId, Candidate>,
}

impl Replay {
    fn apply(&mut self, entry: &AuditEntry) -> Result<()> {
        match &entry.event {
            AuditEvent::PortfolioInitialized {
                snapshot,
                snapshot_hash,
            } => {
                if self.portfolio.is_empty() {
                    check_hash(snapshot, snapshot_hash, 0)?;
                    self.portfolio.push(CommittedVersion {
                        state: Arc::new(snapshot.clone()),
                        hash: snapshot_hash.clone(),
                        approval_id: None,
                        committed_at: entry.recorded_at,
                    });
                }
            }
            AuditEvent::PortfolioCommitted {
                version,
                approval_id,
                delta,
                snapshot_hash,
            } => {
                let current = self.portfolio.last().ok_or_else(|| {
                    OrchestrationError::StateCorruption(format!(
                        "commit v{} precedes portfolio initialization",
                        version
                    ))
                })?;

                // Already captured by the checkpoint.
                if *version <= current.state.version {
                    return Ok(());
                }
                if *version != current.state.version + 1 {
                    return Err(OrchestrationError::StateCorruption(format!(
                        "portfolio log skips from v{} to v{}",
                        current.state.version, version
                    )));
                }

                let next = current.state.apply(delta).map_err(|e| {
                    OrchestrationError::StateCorruption(format!("replaying v{}: {}", version, e))
                })?;
                check_hash(&next, snapshot_hash, *version)?;

                self.portfolio.push(CommittedVersion {
                    state: Arc::new(next),
                    hash: snapshot_hash.clone(),
                    approval_id: *approval_id,
                    committed_at: entry.recorded_at,
                });
            }
            AuditEvent::ApprovalRaised { request } | AuditEvent::ApprovalResolved { request } => {
                if let Some(candidate) = self.candidates.get_mut(&request.candidate) {
                    if candidate.generation == request.generation {
                        candidate.approval_id = Some(request.request_id);
                        candidate.recommendation = Some(request.recommendation.clone());
                        candidate.assessment = Some(request.assessment.clone());
                    }
                }
                self.approvals.insert(request.request_id, request.clone());
            }
            AuditEvent::OrderUpdated { order, fill_cursor } => {
                if let Some(candidate) = self.candidates.get_mut(&order.candidate) {
                    if candidate.generation == order.generation {
                        candidate.order_key = Some(order.key.clone());
                    }
                }
                self.fill_cursor = self.fill_cursor.max(*fill_cursor);
                self.orders.insert(order.key.clone(), order.clone());
            }
            AuditEvent::CandidateDiscovered {
                candidate,
                profile,
                origin_layer,
            } => {
                self.candidates.entry(candidate.clone()).or_insert_with(|| {
                    Candidate::discovered(candidate.clone(), profile.clone(), *origin_layer)
                });
            }
            AuditEvent::CandidateTransition {
                candidate,
                generation,
                from,
                to,
            } => {
                if let Some(c) = self.candidates.get_mut(candidate) {
                    if *generation > c.generation {
                        c.approval_id = None;
                        c.order_key = None;
                        c.recommendation = None;
                        c.assessment = None;
                    }
                    c.generation = *generation;
                    c.state = *to;
                    c.record(CandidateEventKind::Transition {
                        from: *from,
                        to: *to,
                    });
                }
            }
        }
        Ok(())
    }

    /// A fill commit and the order update that follows it are separate
    /// entries. If the process stopped between the two, the order lags the
    /// portfolio; the portfolio wins.
    fn reconcile_orders(&mut self) {
        let mut committed: HashMap<Uuid, f64> = HashMap::new();
        for pair in self.portfolio.windows(2) {
            let (before, after) = (&pair[0], &pair[1]);
            let Some(approval_id) = after.approval_id else {
                continue;
            };
            let Some(order) = self
                .orders
                .get(&IdempotencyKey::for_approval(approval_id))
            else {
                continue;
            };
            let moved = after.state.quantity_of(&order.candidate) - before.state.quantity_of(&order.candidate);
            *committed.entry(approval_id).or_insert(0.0) += moved;
        }

        for order in self.orders.values_mut() {
            let Some(filled) = committed.get(&order.approval_id).copied() else {
                continue;
            };
            if (filled - order.filled_quantity).abs() <= QUANTITY_EPSILON {
                continue;
            }

            warn!(
                key = %order.key,
                recorded = order.filled_quantity,
                committed = filled,
                "Order record lags committed fills; correcting"
            );
            order.filled_quantity = filled;
            if order.status != OrderStatus::Failed {
                order.status = if order.remaining().abs() <= QUANTITY_EPSILON {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };
            }
        }
    }
}

fn check_hash(state: &PortfolioState, expected: &str, version: u64) -> Result<()> {
    if compute_snapshot_hash(state) != expected {
        return Err(OrchestrationError::StateCorruption(format!(
            "replayed snapshot v{} does not match its recorded hash",
            version
        )));
    }
    Ok(())
}
