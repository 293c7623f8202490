//! Events that resume a parked candidate.
//!
//! Worker pools, the human gate and the execution dispatcher never call the
//! orchestrator directly; they post an event and the orchestrator's loop
//! applies it under the candidate's lock.

use crate::models::{ApprovalRequest, CandidateId, ExecutionOrder, Generation, Layer};
use crate::worker::WorkerReport;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Worker(WorkerReport),
    RetryDue {
        candidate: CandidateId,
        generation: Generation,
        layer: Layer,
    },
    ApprovalResolved(ApprovalRequest),
    OrderSettled(ExecutionOrder),
    Shutdown,
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::Worker(_) => "worker",
            EngineEvent::RetryDue { .. } => "retry_due",
            EngineEvent::ApprovalResolved(_) => "approval_resolved",
            EngineEvent::OrderSettled(_) => "order_settled",
            EngineEvent::Shutdown => "shutdown",
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Post `event`; a closed channel means the engine has stopped and the event
/// is lost, which is logged.
pub fn deliver(events: &EventSender, event: EngineEvent) -> bool {
    let kind = event.kind();
    match events.send(event) {
        Ok(()) => true,
        Err(_) => {
            warn!(event = kind, "Engine event loop stopped; event dropped");
            false
        }
    }
}
