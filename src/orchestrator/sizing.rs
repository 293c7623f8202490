//! Position sizing: turns a recommendation into a concrete portfolio delta.

use crate::config::SizingPolicy;
use crate::error::OrchestrationError;
use crate::models::{Action, Candidate, PortfolioDelta, Recommendation};
use crate::portfolio::snapshot::QUANTITY_EPSILON;
use crate::portfolio::PortfolioState;
use crate::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum Sizing {
    Trade(PortfolioDelta),
    /// Nothing to do at this price and portfolio state.
    NoTrade,
}

pub trait PositionSizer: Send + Sync {
    fn size(&self, candidate: &Candidate, recommendation: &Recommendation, snapshot: &PortfolioState) -> Result<Sizing>;
}

/// Buys toward `base_position_weight * confidence` of NAV, sells out fully,
/// trims by `decrease_fraction`. Whole units only.
pub struct ConfidenceWeightedSizer {
    policy: SizingPolicy,
}

impl ConfidenceWeightedSizer {
    pub fn new(policy: SizingPolicy) -> Self {
        Self { policy }
    }
}

impl PositionSizer for ConfidenceWeightedSizer {
    fn size(&self, candidate: &Candidate, recommendation: &Recommendation, snapshot: &PortfolioState) -> Result<Sizing> {
        if !recommendation.action.is_capital_affecting() {
            return Ok(Sizing::NoTrade);
        }

        let held = snapshot.quantity_of(&candidate.id);
        let price = recommendation
            .reference_price
            .or_else(|| snapshot.holding(&candidate.id).map(|h| h.mark_price))
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| {
                OrchestrationError::InvalidRecommendation(format!(
                    "{:?} for {} carries no usable reference price",
                    recommendation.action, candidate.id
                ))
            })?;

        let quantity = match recommendation.action {
            Action::Buy | Action::Increase => {
                let target_value = snapshot.nav * self.policy.base_position_weight * recommendation.confidence;
                let wanted = ((target_value - held * price) / price).floor();
                let affordable = (snapshot.cash / price).floor();
                wanted.min(affordable).max(0.0)
            }
            Action::Sell => -held,
            Action::Decrease => -((held * self.policy.decrease_fraction).floor().max(1.0).min(held)),
            Action::Hold => 0.0,
        };

        if quantity.abs() <= QUANTITY_EPSILON {
            return Ok(Sizing::NoTrade);
        }

        Ok(Sizing::Trade(PortfolioDelta {
            candidate: candidate.id.clone(),
            quantity,
            price,
            sector: candidate.profile.sector.clone(),
            risk_bucket: candidate.profile.risk_bucket.clone(),
            volatility: recommendation.volatility.or(candidate.profile.volatility),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CandidateId, Disposition, EvidenceHandle, InstrumentProfile, Layer};

    fn candidate() -> Candidate {
        Candidate::discovered(
            CandidateId::new("X", "XNAS"),
            InstrumentProfile {
                sector: "tech".to_string(),
                risk_bucket: "medium".to_string(),
                volatility: Some(0.3),
            },
            Layer::Screening,
        )
    }

    fn rec(action: Action, confidence: f64, price: Option<f64>) -> Recommendation {
        Recommendation {
            candidate: CandidateId::new("X", "XNAS"),
            generation: 1,
            action,
            confidence,
            rationale: EvidenceHandle("r".to_string()),
            source_layer: Layer::DeepEvaluation,
            disposition: Disposition::Terminal,
            reference_price: price,
            volatility: None,
            risk_bucket: None,
        }
    }

    fn sizer() -> ConfidenceWeightedSizer {
        ConfidenceWeightedSizer::new(SizingPolicy {
            base_position_weight: 0.10,
            decrease_fraction: 0.5,
        })
    }

    #[test]
    fn buy_targets_confidence_weighted_share_of_nav() {
        let snapshot = PortfolioState::genesis(100_000.0);
        let sizing = sizer().size(&candidate(), &rec(Action::Buy, 0.8, Some(100.0)), &snapshot).unwrap();
        match sizing {
            Sizing::Trade(delta) => {
                assert_eq!(delta.quantity, 80.0);
                assert_eq!(delta.sector, "tech");
                assert_eq!(delta.volatility, Some(0.3));
            }
            other => panic!("expected trade, got {:?}", other),
        }
    }

    #[test]
    fn sells_and_trims_existing_holdings() {
        let c = candidate();
        let snapshot = PortfolioState::genesis(100_000.0)
            .apply(&PortfolioDelta {
                candidate: c.id.clone(),
                quantity: 30.0,
                price: 100.0,
                sector: "tech".to_string(),
                risk_bucket: "medium".to_string(),
                volatility: None,
            })
            .unwrap();

        let sell = sizer().size(&c, &rec(Action::Sell, 0.9, None), &snapshot).unwrap();
        assert!(matches!(sell, Sizing::Trade(ref d) if d.quantity == -30.0 && d.price == 100.0));

        let trim = sizer().size(&c, &rec(Action::Decrease, 0.9, Some(110.0)), &snapshot).unwrap();
        assert!(matches!(trim, Sizing::Trade(ref d) if d.quantity == -15.0));

        let topped_up = sizer().size(&c, &rec(Action::Increase, 0.2, Some(100.0)), &snapshot).unwrap();
        assert_eq!(topped_up, Sizing::NoTrade);
    }

    #[test]
    fn selling_nothing_or_missing_price() {
        let snapshot = PortfolioState::genesis(100_000.0);
        assert_eq!(
            sizer().size(&candidate(), &rec(Action::Sell, 0.9, Some(10.0)), &snapshot).unwrap(),
            Sizing::NoTrade
        );
        assert!(sizer().size(&candidate(), &rec(Action::Buy, 0.9, None), &snapshot).is_err());
    }
}
