//! Execution dispatcher
//!
//! Turns approved requests into broker orders and folds broker fills back
//! into portfolio state. Orders are keyed by the approving request, so a
//! repeated submission returns the existing order. Only the filled portion
//! of an order is ever committed, and each fill is applied at most once.

use crate::audit::{AuditEvent, AuditLog};
use crate::broker::{BrokerClient, BrokerError};
use crate::error::OrchestrationError;
use crate::events::{self, EngineEvent, EventSender};
use crate::gate::HumanGate;
use crate::models::{ApprovalStatus, ExecutionOrder, Fill, IdempotencyKey, OrderStatus};
use crate::portfolio::snapshot::QUANTITY_EPSILON;
use crate::portfolio::PortfolioStateManager;
use crate::Result;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Default)]
struct OrderBook {
    orders: HashMap<IdempotencyKey, ExecutionOrder>,
    /// Recorded locally but not yet acknowledged by the broker.
    unacked: HashSet<IdempotencyKey>,
    fill_cursor: u64,
}

pub struct ExecutionDispatcher {
    broker: Arc<dyn BrokerClient>,
    gate: Arc<HumanGate>,
    portfolio: Arc<PortfolioStateManager>,
    audit: Arc<AuditLog>,
    events: EventSender,
    book: Mutex<OrderBook>,
}

impl ExecutionDispatcher {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        gate: Arc<HumanGate>,
        portfolio: Arc<PortfolioStateManager>,
        audit: Arc<AuditLog>,
        events: EventSender,
    ) -> Self {
        Self {
            broker,
            gate,
            portfolio,
            audit,
            events,
            book: Mutex::new(OrderBook::default()),
        }
    }

    /// Submit the order authorized by `approval_id`. Idempotent.
    pub async fn submit(&self, approval_id: Uuid) -> Result<ExecutionOrder> {
        let key = IdempotencyKey::for_approval(approval_id);
        let mut book = self.book.lock().await;

        if let Some(existing) = book.orders.get(&key) {
            debug!(key = %key, status = ?existing.status, "Order already submitted");
            return Ok(existing.clone());
        }

        let request = self
            .gate
            .get(approval_id)
            .await
            .ok_or(OrchestrationError::ApprovalNotFound(approval_id))?;
        if request.status != ApprovalStatus::Approved {
            return Err(OrchestrationError::NotApproved(approval_id));
        }

        let now = Utc::now();
        let mut order = ExecutionOrder {
            key: key.clone(),
            approval_id,
            candidate: request.candidate.clone(),
            generation: request.generation,
            delta: request.delta.clone(),
            status: OrderStatus::Submitted,
            filled_quantity: 0.0,
            average_fill_price: 0.0,
            applied_fills: Vec::new(),
            failure: None,
            submitted_at: now,
            updated_at: now,
        };

        match self.broker.submit(&order).await {
            Ok(ack) => {
                info!(key = %key, candidate = %order.candidate, duplicate = ack.duplicate, "Order submitted");
            }
            Err(BrokerError::Unavailable(reason)) => {
                warn!(key = %key, reason = %reason, "Broker unavailable; order will be resubmitted");
                book.unacked.insert(key.clone());
            }
            Err(BrokerError::Rejected { reason }) => {
                warn!(key = %key, reason = %reason, "Broker rejected order");
                order.status = OrderStatus::Failed;
                order.failure = Some(reason);
            }
        }

        self.audit
            .append(AuditEvent::OrderUpdated {
                order: order.clone(),
                fill_cursor: book.fill_cursor,
            })
            .await?;
        book.orders.insert(key, order.clone());

        if order.status.is_final() {
            self.emit_settled(&order);
        }
        Ok(order)
    }

    /// Pull new fills from the broker and commit them. Returns the number
    /// of fills applied.
    pub async fn reconcile(&self) -> Result<usize> {
        let mut book = self.book.lock().await;

        self.resubmit_unacked(&mut book).await?;

        let fills = self.broker.fills_since(book.fill_cursor).await?;
        let mut applied = 0;

        for fill in fills {
            match self.apply_fill(&mut book, &fill).await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e @ OrchestrationError::MutationAbandoned { .. }) => {
                    // Cursor not advanced; the fill is picked up next cycle.
                    warn!(fill_id = %fill.fill_id, error = %e, "Fill deferred");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if applied > 0 {
            debug!(applied, cursor = book.fill_cursor, "Reconciled fills");
        }
        Ok(applied)
    }

    async fn resubmit_unacked(&self, book: &mut OrderBook) -> Result<()> {
        let pending: Vec<IdempotencyKey> = book.unacked.iter().cloned().collect();

        for key in pending {
            let Some(order) = book.orders.get(&key).cloned() else {
                book.unacked.remove(&key);
                continue;
            };

            match self.broker.submit(&order).await {
                Ok(_) => {
                    info!(key = %key, "Order acknowledged on resubmission");
                    book.unacked.remove(&key);
                }
                Err(BrokerError::Unavailable(reason)) => {
                    debug!(key = %key, reason = %reason, "Broker still unavailable");
                }
                Err(BrokerError::Rejected { reason }) => {
                    book.unacked.remove(&key);
                    let mut failed = order;
                    failed.status = OrderStatus::Failed;
                    failed.failure = Some(reason);
                    failed.updated_at = Utc::now();
                    self.record(book, failed).await?;
                }
            }
        }
        Ok(())
    }

    /// `Ok(true)` if the fill changed the order.
    async fn apply_fill(&self, book: &mut OrderBook, fill: &Fill) -> Result<bool> {
        let Some(order) = book.orders.get(&fill.key).cloned() else {
            warn!(key = %fill.key, fill_id = %fill.fill_id, "Fill for unknown order ignored");
            book.fill_cursor = book.fill_cursor.max(fill.sequence);
            return Ok(false);
        };

        if order.status.is_final() || order.applied_fills.contains(&fill.fill_id) {
            book.fill_cursor = book.fill_cursor.max(fill.sequence);
            return Ok(false);
        }

        let remaining = order.remaining();
        let quantity = if fill.quantity.abs() > remaining.abs() {
            remaining
        } else {
            fill.quantity
        };
        if quantity.abs() <= QUANTITY_EPSILON || quantity.signum() != order.delta.quantity.signum() {
            warn!(fill_id = %fill.fill_id, quantity = fill.quantity, "Fill does not reduce the open quantity");
            book.fill_cursor = book.fill_cursor.max(fill.sequence);
            return Ok(false);
        }

        let fill_delta = order.delta.with_fill(quantity, fill.price);
        let mut updated = order.clone();

        match self
            .portfolio
            .commit_with_retry(Some(order.approval_id), |_| Ok(fill_delta.clone()))
            .await
        {
            Ok(state) => {
                let previous = updated.filled_quantity.abs();
                updated.filled_quantity += quantity;
                updated.average_fill_price = (updated.average_fill_price * previous
                    + fill.price * quantity.abs())
                    / updated.filled_quantity.abs();
                updated.applied_fills.push(fill.fill_id.clone());
                updated.status = if updated.remaining().abs() <= QUANTITY_EPSILON {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };
                info!(
                    key = %updated.key,
                    filled = updated.filled_quantity,
                    ordered = updated.delta.quantity,
                    version = state.version,
                    "Fill committed"
                );
            }
            Err(e) if e.is_fatal() => {
                error!(key = %order.key, error = %e, "Fill could not be committed; state corrupt");
                return Err(e);
            }
            Err(e @ OrchestrationError::MutationAbandoned { .. }) => return Err(e),
            Err(e) => {
                warn!(key = %order.key, error = %e, "Fill rejected by portfolio; failing order");
                updated.status = OrderStatus::Failed;
                updated.failure = Some(e.to_string());
            }
        }

        updated.updated_at = Utc::now();
        book.fill_cursor = book.fill_cursor.max(fill.sequence);
        self.record(book, updated).await?;
        Ok(true)
    }

    async fn record(&self, book: &mut OrderBook, order: ExecutionOrder) -> Result<()> {
        self.audit
            .append(AuditEvent::OrderUpdated {
                order: order.clone(),
                fill_cursor: book.fill_cursor,
            })
            .await?;

        let settled = order.status.is_final();
        book.orders.insert(order.key.clone(), order.clone());
        if settled {
            self.emit_settled(&order);
        }
        Ok(())
    }

    fn emit_settled(&self, order: &ExecutionOrder) {
        events::deliver(&self.events, EngineEvent::OrderSettled(order.clone()));
    }

    pub async fn order(&self, key: &IdempotencyKey) -> Option<ExecutionOrder> {
        self.book.lock().await.orders.get(key).cloned()
    }

    pub async fn orders(&self) -> Vec<ExecutionOrder> {
        let mut orders: Vec<_> = self.book.lock().await.orders.values().cloned().collect();
        orders.sort_by_key(|o| o.submitted_at);
        orders
    }

    pub async fn fill_cursor(&self) -> u64 {
        self.book.lock().await.fill_cursor
    }

    /// Reload orders after recovery. Open orders are resubmitted on the
    /// next reconcile; the broker deduplicates by key.
    pub async fn restore(&self, orders: Vec<ExecutionOrder>, fill_cursor: u64) {
        let mut book = self.book.lock().await;
        book.fill_cursor = fill_cursor;
        for order in orders {
            if !order.status.is_final() {
                book.unacked.insert(order.key.clone());
            }
            book.orders.insert(order.key.clone(), order);
        }
    }

    pub async fn run_reconciliation(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.reconcile().await {
                if e.is_fatal() {
                    error!(error = %e, "Reconciliation halted by state corruption");
                } else {
                    warn!(error = %e, "Reconciliation cycle failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{PaperBroker, PaperBrokerConfig};
    use crate::config::test_config;
    use crate::events::{self, EventReceiver};
    use crate::gate::{test_draft, LoggingSurface};
    use crate::models::{CandidateId, Decision};

    struct Harness {
        dispatcher: ExecutionDispatcher,
        gate: Arc<HumanGate>,
        portfolio: Arc<PortfolioStateManager>,
        broker: Arc<PaperBroker>,
        rx: EventReceiver,
    }

    async fn harness(broker: PaperBrokerConfig) -> Harness {
        let config = test_config();
        let audit = Arc::new(AuditLog::new());
        let (tx, rx) = events::channel();
        let portfolio = Arc::new(
            PortfolioStateManager::initialize(100_000.0, audit.clone(), 1e-9, 3)
                .await
                .unwrap(),
        );
        let gate = Arc::new(HumanGate::new(config.gate, audit.clone(), tx.clone(), Arc::new(LoggingSurface)));
        let broker = Arc::new(PaperBroker::new(broker));
        let dispatcher = ExecutionDispatcher::new(broker.clone(), gate.clone(), portfolio.clone(), audit, tx);
        Harness {
            dispatcher,
            gate,
            portfolio,
            broker,
            rx,
        }
    }

    async fn approved(h: &Harness, symbol: &str, quantity: f64) -> Uuid {
        let request = h.gate.raise(test_draft(symbol, quantity, 100.0)).await.unwrap();
        h.gate
            .decide(request.request_id, Decision::Approve, "ops")
            .await
            .unwrap();
        request.request_id
    }

    #[tokio::test]
    async fn orders_require_an_approved_request() {
        let h = harness(PaperBrokerConfig::default()).await;
        let request = h.gate.raise(test_draft("AAPL", 10.0, 100.0)).await.unwrap();

        assert!(matches!(
            h.dispatcher.submit(request.request_id).await,
            Err(OrchestrationError::NotApproved(_))
        ));
        assert!(matches!(
            h.dispatcher.submit(Uuid::new_v4()).await,
            Err(OrchestrationError::ApprovalNotFound(_))
        ));
        assert!(h.dispatcher.orders().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_submission_yields_one_order_and_one_fill() {
        let mut h = harness(PaperBrokerConfig::default()).await;
        let approval = approved(&h, "AAPL", 80.0).await;

        let first = h.dispatcher.submit(approval).await.unwrap();
        let second = h.dispatcher.submit(approval).await.unwrap();
        assert_eq!(first.key, second.key);
        assert_eq!(h.broker.order_count().await, 1);

        h.dispatcher.reconcile().await.unwrap();
        h.dispatcher.submit(approval).await.unwrap();
        h.dispatcher.reconcile().await.unwrap();

        let snapshot = h.portfolio.snapshot().await.unwrap();
        let id = CandidateId::new("AAPL", "XNAS");
        assert_eq!(snapshot.quantity_of(&id), 80.0);
        assert_eq!(snapshot.cash, 92_000.0);

        loop {
            match h.rx.recv().await {
                Some(EngineEvent::OrderSettled(order)) => {
                    assert_eq!(order.status, OrderStatus::Filled);
                    break;
                }
                Some(_) => continue,
                None => panic!("channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn partial_fills_commit_only_the_filled_portion() {
        let h = harness(PaperBrokerConfig {
            fill_slices: 4,
            ..Default::default()
        })
        .await;
        let approval = approved(&h, "MSFT", 40.0).await;
        let order = h.dispatcher.submit(approval).await.unwrap();

        h.dispatcher.reconcile().await.unwrap();
        let partial = h.dispatcher.order(&order.key).await.unwrap();
        assert_eq!(partial.status, OrderStatus::PartiallyFilled);
        assert_eq!(partial.filled_quantity, 10.0);
        let id = CandidateId::new("MSFT", "XNAS");
        assert_eq!(h.portfolio.snapshot().await.unwrap().quantity_of(&id), 10.0);

        for _ in 0..3 {
            h.dispatcher.reconcile().await.unwrap();
        }
        let filled = h.dispatcher.order(&order.key).await.unwrap();
        assert_eq!(filled.status, OrderStatus::Filled);
        assert_eq!(filled.applied_fills.len(), 4);
        assert_eq!(h.portfolio.snapshot().await.unwrap().quantity_of(&id), 40.0);
    }

    #[tokio::test]
    async fn redelivered_fills_are_applied_once() {
        let h = harness(PaperBrokerConfig {
            fill_slices: 2,
            redeliver_fills: true,
            ..Default::default()
        })
        .await;
        let approval = approved(&h, "NVDA", 20.0).await;
        h.dispatcher.submit(approval).await.unwrap();

        for _ in 0..5 {
            h.dispatcher.reconcile().await.unwrap();
        }

        let id = CandidateId::new("NVDA", "XNAS");
        let snapshot = h.portfolio.snapshot().await.unwrap();
        assert_eq!(snapshot.quantity_of(&id), 20.0);
        assert_eq!(snapshot.version, 2);
    }

    #[tokio::test]
    async fn broker_rejection_fails_the_order() {
        let h = harness(PaperBrokerConfig {
            rejected_symbols: vec!["HALT".to_string()],
            ..Default::default()
        })
        .await;
        let approval = approved(&h, "HALT", 5.0).await;

        let order = h.dispatcher.submit(approval).await.unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert!(order.failure.is_some());
        assert_eq!(h.portfolio.current_version().await.unwrap(), 0);
    }
}
