//! Immutable portfolio snapshots and the arithmetic that derives one from
//! another.

use crate::error::OrchestrationError;
use crate::models::{CandidateId, PortfolioDelta};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Quantities below this are treated as zero.
pub const QUANTITY_EPSILON: f64 = 1e-9;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MutationError {
    #[error("insufficient cash: need {required:.2}, have {available:.2}")]
    InsufficientCash { required: f64, available: f64 },

    #[error("insufficient holdings in {candidate}: selling {requested}, holding {held}")]
    InsufficientHoldings {
        candidate: String,
        requested: f64,
        held: f64,
    },

    #[error("invalid price {0}")]
    InvalidPrice(f64),

    #[error("zero or non-finite quantity {0}")]
    InvalidQuantity(f64),

    #[error("weights sum to {total}, expected 1")]
    WeightsDoNotSum { total: f64 },

    #[error("negative weight {weight} for {name}")]
    NegativeWeight { name: String, weight: f64 },
}

impl From<MutationError> for OrchestrationError {
    fn from(e: MutationError) -> Self {
        OrchestrationError::InvariantViolation(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub quantity: f64,
    pub average_cost: f64,
    /// Last price the position was valued at (latest fill).
    pub mark_price: f64,
    pub weight: f64,
    pub sector: String,
    pub risk_bucket: String,
    #[serde(default)]
    pub volatility: Option<f64>,
}

impl Holding {
    pub fn market_value(&self) -> f64 {
        self.quantity * self.mark_price
    }
}

/// Versioned, immutable view of the portfolio.
///
/// Every weight is its own value over NAV, so
/// `sum(holding weights) + cash_weight` is 1 up to rounding; see
/// [`PortfolioState::check_invariants`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub version: u64,
    pub holdings: BTreeMap<CandidateId, Holding>,
    pub cash: f64,
    pub nav: f64,
    pub cash_weight: f64,
    pub sector_weights: BTreeMap<String, f64>,
    pub risk_bucket_weights: BTreeMap<String, f64>,
}

impl PortfolioState {
    /// Version 0: all cash.
    pub fn genesis(cash: f64) -> Self {
        let mut state = Self {
            version: 0,
            holdings: BTreeMap::new(),
            cash,
            nav: cash,
            cash_weight: 1.0,
            sector_weights: BTreeMap::new(),
            risk_bucket_weights: BTreeMap::new(),
        };
        state.reweigh();
        state
    }

    pub fn holding(&self, candidate: &CandidateId) -> Option<&Holding> {
        self.holdings.get(candidate)
    }

    pub fn quantity_of(&self, candidate: &CandidateId) -> f64 {
        self.holding(candidate).map(|h| h.quantity).unwrap_or(0.0)
    }

    pub fn weight_of(&self, candidate: &CandidateId) -> f64 {
        self.holding(candidate).map(|h| h.weight).unwrap_or(0.0)
    }

    pub fn sector_weight(&self, sector: &str) -> f64 {
        self.sector_weights.get(sector).copied().unwrap_or(0.0)
    }

    pub fn risk_bucket_weight(&self, bucket: &str) -> f64 {
        self.risk_bucket_weights.get(bucket).copied().unwrap_or(0.0)
    }

    /// Weighted sum of holding volatilities. Treats holdings as perfectly
    /// correlated, so it bounds the true portfolio volatility from above.
    pub fn weighted_volatility(&self) -> f64 {
        self.holdings
            .values()
            .map(|h| h.weight * h.volatility.unwrap_or(0.0))
            .sum()
    }

    /// Derive the next version. Pure: `self` is untouched.
    pub fn apply(&self, delta: &PortfolioDelta) -> Result<PortfolioState, MutationError> {
        if !delta.price.is_finite() || delta.price <= 0.0 {
            return Err(MutationError::InvalidPrice(delta.price));
        }
        if !delta.quantity.is_finite() || delta.quantity.abs() <= QUANTITY_EPSILON {
            return Err(MutationError::InvalidQuantity(delta.quantity));
        }

        let mut next = self.clone();
        next.version = self.version + 1;

        let notional = delta.quantity * delta.price;

        if delta.quantity > 0.0 {
            if notional > next.cash + QUANTITY_EPSILON {
                return Err(MutationError::InsufficientCash {
                    required: notional,
                    available: next.cash,
                });
            }
            next.cash -= notional;

            let holding = next
                .holdings
                .entry(delta.candidate.clone())
                .or_insert_with(|| Holding {
                    quantity: 0.0,
                    average_cost: 0.0,
                    mark_price: delta.price,
                    weight: 0.0,
                    sector: delta.sector.clone(),
                    risk_bucket: delta.risk_bucket.clone(),
                    volatility: delta.volatility,
                });

            let total_quantity = holding.quantity + delta.quantity;
            holding.average_cost = (holding.quantity * holding.average_cost
                + delta.quantity * delta.price)
                / total_quantity;
            holding.quantity = total_quantity;
            holding.mark_price = delta.price;
            if delta.volatility.is_some() {
                holding.volatility = delta.volatility;
            }
        } else {
            let sell = -delta.quantity;
            let held = self.quantity_of(&delta.candidate);
            if sell > held + QUANTITY_EPSILON {
                return Err(MutationError::InsufficientHoldings {
                    candidate: delta.candidate.to_string(),
                    requested: sell,
                    held,
                });
            }

            next.cash += sell * delta.price;

            let remaining = held - sell;
            if remaining <= QUANTITY_EPSILON {
                next.holdings.remove(&delta.candidate);
            } else if let Some(holding) = next.holdings.get_mut(&delta.candidate) {
                holding.quantity = remaining;
                holding.mark_price = delta.price;
            }
        }

        next.reweigh();
        Ok(next)
    }

    /// `sum(weights) + cash_weight` within `tolerance` of 1; nothing negative.
    pub fn check_invariants(&self, tolerance: f64) -> Result<(), MutationError> {
        if self.cash < -QUANTITY_EPSILON {
            return Err(MutationError::NegativeWeight {
                name: "cash".to_string(),
                weight: self.cash_weight,
            });
        }
        if self.cash_weight < -tolerance {
            return Err(MutationError::NegativeWeight {
                name: "cash".to_string(),
                weight: self.cash_weight,
            });
        }

        for (id, holding) in &self.holdings {
            if holding.weight < -tolerance || holding.quantity < -QUANTITY_EPSILON {
                return Err(MutationError::NegativeWeight {
                    name: id.to_string(),
                    weight: holding.weight,
                });
            }
        }

        let total: f64 = self.cash_weight + self.holdings.values().map(|h| h.weight).sum::<f64>();
        if (total - 1.0).abs() > tolerance.max(f64::EPSILON * 16.0) {
            return Err(MutationError::WeightsDoNotSum { total });
        }

        Ok(())
    }

    fn reweigh(&mut self) {
        let invested: f64 = self.holdings.values().map(Holding::market_value).sum();
        self.nav = self.cash + invested;

        self.sector_weights.clear();
        self.risk_bucket_weights.clear();

        if self.nav <= f64::EPSILON {
            self.cash_weight = 1.0;
            for holding in self.holdings.values_mut() {
                holding.weight = 0.0;
            }
            return;
        }

        for holding in self.holdings.values_mut() {
            holding.weight = holding.market_value() / self.nav;
            *self
                .sector_weights
                .entry(holding.sector.clone())
                .or_insert(0.0) += holding.weight;
            *self
                .risk_bucket_weights
                .entry(holding.risk_bucket.clone())
                .or_insert(0.0) += holding.weight;
        }

        self.cash_weight = self.cash / self.nav;
    }
}
