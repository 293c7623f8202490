//! Broker interface consumed by the execution dispatcher, plus an
//! in-process paper broker.
//!
//! Brokers acknowledge submissions idempotently by key and report fills as a
//! sequence-numbered stream that may be redelivered.

use crate::error::OrchestrationError;
use crate::models::{ExecutionOrder, Fill, IdempotencyKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::info;

/// Errors surfaced by broker operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("order rejected by broker: {reason}")]
    Rejected { reason: String },
}

impl From<BrokerError> for OrchestrationError {
    fn from(e: BrokerError) -> Self {
        OrchestrationError::BrokerError(e.to_string())
    }
}

/// Result alias for broker operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerAck {
    pub key: IdempotencyKey,
    pub accepted_at: DateTime<Utc>,
    /// The key was already known; nothing new was placed.
    pub duplicate: bool,
}

#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    async fn submit(&self, order: &ExecutionOrder) -> BrokerResult<BrokerAck>;

    /// Fills with `sequence > cursor`, ascending. May repeat fills already
    /// delivered.
    async fn fills_since(&self, cursor: u64) -> BrokerResult<Vec<Fill>>;
}

/// Configuration for the paper broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperBrokerConfig {
    /// Each order fills in this many equal slices, one per poll.
    pub fill_slices: u32,
    /// Symbols the broker refuses.
    pub rejected_symbols: Vec<String>,
    /// Ignore the cursor and resend every fill on each poll.
    pub redeliver_fills: bool,
}

impl Default for PaperBrokerConfig {
    fn default() -> Self {
        Self {
            fill_slices: 1,
            rejected_symbols: Vec::new(),
            redeliver_fills: false,
        }
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    key: IdempotencyKey,
    quantity: f64,
    filled: f64,
    slice: f64,
    price: f64,
}

#[derive(Debug, Default)]
struct PaperBook {
    // Keyed by key so fill generation order is deterministic.
    orders: BTreeMap<IdempotencyKey, PaperOrder>,
    fills: Vec<Fill>,
    next_sequence: u64,
}

/// A fully in-process broker that simulates order execution at the order's
/// reference price.
pub struct PaperBroker {
    config: PaperBrokerConfig,
    rejected: HashSet<String>,
    book: Mutex<PaperBook>,
    halted: AtomicBool,
}

impl PaperBroker {
    pub fn new(config: PaperBrokerConfig) -> Self {
        let rejected = config
            .rejected_symbols
            .iter()
            .map(|s| s.to_uppercase())
            .collect();
        Self {
            config,
            rejected,
            book: Mutex::new(PaperBook::default()),
            halted: AtomicBool::new(false),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(PaperBrokerConfig::default())
    }

    /// Stop producing fills until `resume_fills`.
    pub fn hold_fills(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn resume_fills(&self) {
        self.halted.store(false, Ordering::SeqCst);
    }

    pub async fn order_count(&self) -> usize {
        self.book.lock().await.orders.len()
    }
}

#[async_trait::async_trait]
impl BrokerClient for PaperBroker {
    async fn submit(&self, order: &ExecutionOrder) -> BrokerResult<BrokerAck> {
        let mut book = self.book.lock().await;

        if book.orders.contains_key(&order.key) {
            return Ok(BrokerAck {
                key: order.key.clone(),
                accepted_at: Utc::now(),
                duplicate: true,
            });
        }

        if self.rejected.contains(&order.candidate.symbol) {
            return Err(BrokerError::Rejected {
                reason: format!("{} is not tradable", order.candidate.symbol),
            });
        }

        let slices = self.config.fill_slices.max(1) as f64;
        book.orders.insert(
            order.key.clone(),
            PaperOrder {
                key: order.key.clone(),
                quantity: order.delta.quantity,
                filled: 0.0,
                slice: order.delta.quantity / slices,
                price: order.delta.price,
            },
        );

        info!(key = %order.key, quantity = order.delta.quantity, "Paper order accepted");

        Ok(BrokerAck {
            key: order.key.clone(),
            accepted_at: Utc::now(),
            duplicate: false,
        })
    }

    async fn fills_since(&self, cursor: u64) -> BrokerResult<Vec<Fill>> {
        let mut guard = self.book.lock().await;
        let book = &mut *guard;

        if !self.halted.load(Ordering::SeqCst) {
            for order in book.orders.values_mut() {
                let remaining = order.quantity - order.filled;
                if remaining.abs() <= 1e-9 {
                    continue;
                }
                let quantity = if remaining.abs() < order.slice.abs() {
                    remaining
                } else {
                    order.slice
                };
                order.filled += quantity;
                book.next_sequence += 1;
                book.fills.push(Fill {
                    fill_id: format!("{}-{}", order.key, book.next_sequence),
                    sequence: book.next_sequence,
                    key: order.key.clone(),
                    quantity,
                    price: order.price,
                    filled_at: Utc::now(),
                });
            }
        }

        let fills = book
            .fills
            .iter()
            .filter(|f| self.config.redeliver_fills || f.sequence > cursor)
            .cloned()
            .collect();
        Ok(fills)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CandidateId, OrderStatus, PortfolioDelta};
    use uuid::Uuid;

    fn order(symbol: &str, quantity: f64) -> ExecutionOrder {
        let approval_id = Uuid::new_v4();
        let now = Utc::now();
        ExecutionOrder {
            key: IdempotencyKey::for_approval(approval_id),
            approval_id,
            candidate: CandidateId::new(symbol, "XNAS"),
            generation: 1,
            delta: PortfolioDelta {
                candidate: CandidateId::new(symbol, "XNAS"),
                quantity,
                price: 50.0,
                sector: "tech".to_string(),
                risk_bucket: "low".to_string(),
                volatility: None,
            },
            status: OrderStatus::Submitted,
            filled_quantity: 0.0,
            average_fill_price: 0.0,
            applied_fills: vec![],
            failure: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn resubmission_is_acknowledged_as_duplicate() {
        let broker = PaperBroker::with_defaults();
        let o = order("AAPL", 10.0);

        assert!(!broker.submit(&o).await.unwrap().duplicate);
        assert!(broker.submit(&o).await.unwrap().duplicate);
        assert_eq!(broker.order_count().await, 1);
        assert_eq!(broker.fills_since(0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fills_arrive_in_slices() {
        let broker = PaperBroker::new(PaperBrokerConfig {
            fill_slices: 2,
            ..Default::default()
        });
        broker.submit(&order("AAPL", -30.0)).await.unwrap();

        let first = broker.fills_since(0).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].quantity, -15.0);

        let second = broker.fills_since(first[0].sequence).await.unwrap();
        assert_eq!(second.len(), 1);
        assert!(second[0].sequence > first[0].sequence);

        assert!(broker.fills_since(second[0].sequence).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn held_fills_and_rejections() {
        let broker = PaperBroker::new(PaperBrokerConfig {
            rejected_symbols: vec!["halt".to_string()],
            ..Default::default()
        });
        assert!(matches!(
            broker.submit(&order("HALT", 1.0)).await,
            Err(BrokerError::Rejected { .. })
        ));

        broker.hold_fills();
        broker.submit(&order("AAPL", 5.0)).await.unwrap();
        assert!(broker.fills_since(0).await.unwrap().is_empty());
        broker.resume_fills();
        assert_eq!(broker.fills_since(0).await.unwrap().len(), 1);
    }
}
