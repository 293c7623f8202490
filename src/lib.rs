//! Decision Orchestrator
//!
//! Moves trading candidates through a layered analysis pipeline and into
//! the portfolio:
//! - Screening and deep evaluation run on bounded per-layer worker pools
//! - Every capital-affecting recommendation is sized, risk-checked and held
//!   for a human decision before anything is sent to the broker
//! - Portfolio mutations use optimistic concurrency over versioned snapshots
//! - Every state change lands in a hash-chained audit log that recovery
//!   replays after a crash
//! - Evidence updates re-open candidates; stale results are discarded
//!
//! LIFECYCLE:
//! DISCOVERED → SCREENING → DEEP EVAL → RISK CHECK → APPROVAL → EXECUTING → HELD

pub mod analysis;
pub mod api;
pub mod audit;
pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod gate;
pub mod models;
pub mod orchestrator;
pub mod portfolio;
pub mod recovery;
pub mod risk;
pub mod state;
pub mod trigger;
pub mod worker;

pub use error::{OrchestrationError, Result};

// Re-export common types
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use models::*;
