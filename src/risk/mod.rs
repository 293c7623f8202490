//! Risk monitor
//!
//! Rules-based assessment of a proposed portfolio change against the
//! configured limits. Pure: reads a snapshot, never mutates it.
//!
//! A rule only blocks when the change pushes its metric further past the
//! limit. Reducing an already-breaching exposure is allowed with a warning.

use crate::config::RiskPolicy;
use crate::models::{PortfolioDelta, ReasonCode, RiskAssessment, Verdict};
use crate::portfolio::{MutationError, PortfolioState};
use chrono::Utc;
use tracing::info;

const METRIC_EPSILON: f64 = 1e-12;

/// Inputs shared by every rule.
pub struct RuleContext<'a> {
    pub delta: &'a PortfolioDelta,
    pub current: &'a PortfolioState,
    /// The snapshot after `delta`, or why it cannot be derived.
    pub projection: &'a Result<PortfolioState, MutationError>,
    pub policy: &'a RiskPolicy,
}

impl RuleContext<'_> {
    pub fn projected(&self) -> Option<&PortfolioState> {
        self.projection.as_ref().ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleFinding {
    pub verdict: Verdict,
    pub reason: ReasonCode,
    pub details: String,
}

/// Trait for risk rules
pub trait RiskRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when the rule has nothing to say.
    fn check(&self, ctx: &RuleContext<'_>) -> Option<RuleFinding>;
}

/// Shared threshold logic for "weight must stay under a limit" rules.
fn limit_finding(
    metric: &str,
    before: f64,
    after: f64,
    limit: f64,
    warn_fraction: f64,
    near: ReasonCode,
    exceeded: ReasonCode,
) -> Option<RuleFinding> {
    let increased = after > before + METRIC_EPSILON;

    if after > limit + METRIC_EPSILON {
        let verdict = if increased { Verdict::Block } else { Verdict::Warn };
        return Some(RuleFinding {
            verdict,
            reason: exceeded,
            details: format!("{} {:.4} -> {:.4} exceeds limit {:.4}", metric, before, after, limit),
        });
    }

    if increased && after >= limit * warn_fraction {
        return Some(RuleFinding {
            verdict: Verdict::Warn,
            reason: near,
            details: format!("{} {:.4} within {:.0}% of limit {:.4}", metric, after, warn_fraction * 100.0, limit),
        });
    }

    None
}

pub struct PositionWeightRule;

impl RiskRule for PositionWeightRule {
    fn name(&self) -> &'static str {
        "position_weight"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Option<RuleFinding> {
        let id = &ctx.delta.candidate;
        let projected = ctx.projected()?;
        limit_finding(
            &format!("position {}", id),
            ctx.current.weight_of(id),
            projected.weight_of(id),
            ctx.policy.max_position_weight,
            ctx.policy.warn_fraction,
            ReasonCode::PositionWeightNearLimit,
            ReasonCode::PositionWeightExceeded,
        )
    }
}

pub struct SectorWeightRule;

impl RiskRule for SectorWeightRule {
    fn name(&self) -> &'static str {
        "sector_weight"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Option<RuleFinding> {
        let sector = &ctx.delta.sector;
        let projected = ctx.projected()?;
        limit_finding(
            &format!("sector {}", sector),
            ctx.current.sector_weight(sector),
            projected.sector_weight(sector),
            ctx.policy.max_sector_weight,
            ctx.policy.warn_fraction,
            ReasonCode::SectorWeightNearLimit,
            ReasonCode::SectorWeightExceeded,
        )
    }
}

pub struct RiskBucketRule;

impl RiskRule for RiskBucketRule {
    fn name(&self) -> &'static str {
        "risk_bucket_weight"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Option<RuleFinding> {
        let bucket = &ctx.delta.risk_bucket;
        let projected = ctx.projected()?;
        limit_finding(
            &format!("risk bucket {}", bucket),
            ctx.current.risk_bucket_weight(bucket),
            projected.risk_bucket_weight(bucket),
            ctx.policy.max_risk_bucket_weight,
            ctx.policy.warn_fraction,
            ReasonCode::RiskBucketWeightNearLimit,
            ReasonCode::RiskBucketWeightExceeded,
        )
    }
}

pub struct VolatilityBudgetRule;

impl RiskRule for VolatilityBudgetRule {
    fn name(&self) -> &'static str {
        "volatility_budget"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Option<RuleFinding> {
        let projected = ctx.projected()?;
        limit_finding(
            "weighted volatility",
            ctx.current.weighted_volatility(),
            projected.weighted_volatility(),
            ctx.policy.volatility_budget,
            ctx.policy.warn_fraction,
            ReasonCode::VolatilityBudgetNearLimit,
            ReasonCode::VolatilityBudgetExceeded,
        )
    }
}

/// Blocks changes the portfolio cannot absorb: buying past available cash,
/// selling more than is held, or a delta with an unusable price or quantity.
pub struct FundingRule;

impl RiskRule for FundingRule {
    fn name(&self) -> &'static str {
        "funding"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Option<RuleFinding> {
        let error = ctx.projection.as_ref().err()?;
        let reason = match error {
            MutationError::InsufficientCash { .. } => ReasonCode::InsufficientCash,
            MutationError::InsufficientHoldings { .. } => ReasonCode::InsufficientHoldings,
            MutationError::InvalidPrice(_) => ReasonCode::InvalidPrice,
            MutationError::InvalidQuantity(_) => ReasonCode::InvalidQuantity,
            MutationError::WeightsDoNotSum { .. } | MutationError::NegativeWeight { .. } => {
                ReasonCode::InvalidProjection
            }
        };
        Some(RuleFinding {
            verdict: Verdict::Block,
            reason,
            details: error.to_string(),
        })
    }
}

/// Risk monitor that enforces rules
pub struct RiskMonitor {
    policy: RiskPolicy,
    rules: Vec<Box<dyn RiskRule>>,
}

impl RiskMonitor {
    pub fn new(policy: RiskPolicy) -> Self {
        Self {
            policy,
            rules: Vec::new(),
        }
    }

    pub fn add_rule(&mut self, rule: Box<dyn RiskRule>) {
        self.rules.push(rule);
    }

    pub fn policy(&self) -> &RiskPolicy {
        &self.policy
    }

    /// Assess `delta` against `snapshot`. The assessment carries the
    /// snapshot version it was computed on.
    pub fn assess(&self, delta: &PortfolioDelta, snapshot: &PortfolioState) -> RiskAssessment {
        let mut verdict = Verdict::Pass;
        let mut reasons = Vec::new();

        let projection = snapshot.apply(delta);
        let ctx = RuleContext {
            delta,
            current: snapshot,
            projection: &projection,
            policy: &self.policy,
        };

        for rule in &self.rules {
            if let Some(finding) = rule.check(&ctx) {
                info!(
                    rule = rule.name(),
                    verdict = ?finding.verdict,
                    details = %finding.details,
                    "Risk rule finding"
                );
                verdict = verdict.max(finding.verdict);
                reasons.push(finding.reason);
            }
        }

        let exposure_delta = match &projection {
            Ok(projected) => projected.weight_of(&delta.candidate) - snapshot.weight_of(&delta.candidate),
            Err(e) => {
                // A change that cannot be applied never passes.
                verdict = Verdict::Block;
                info!(candidate = %delta.candidate, error = %e, "Change cannot be applied");
                if snapshot.nav > 0.0 && (delta.quantity * delta.price).is_finite() {
                    delta.quantity * delta.price / snapshot.nav
                } else {
                    0.0
                }
            }
        };

        info!(
            candidate = %delta.candidate,
            verdict = ?verdict,
            reasons = reasons.len(),
            base_version = snapshot.version,
            "Risk assessment completed"
        );

        RiskAssessment {
            candidate: delta.candidate.clone(),
            exposure_delta,
            verdict,
            reasons,
            base_version: snapshot.version,
            assessed_at: Utc::now(),
        }
    }
}

/// Monitor with the funding, position, sector, risk-bucket and volatility
/// rules.
pub fn create_default_risk_monitor(policy: RiskPolicy) -> RiskMonitor {
    let mut monitor = RiskMonitor::new(policy);
    monitor.add_rule(Box::new(FundingRule));
    monitor.add_rule(Box::new(PositionWeightRule));
    monitor.add_rule(Box::new(SectorWeightRule));
    monitor.add_rule(Box::new(RiskBucketRule));
    monitor.add_rule(Box::new(VolatilityBudgetRule));
    monitor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::models::CandidateId;

    fn monitor() -> RiskMonitor {
        create_default_risk_monitor(test_config().risk)
    }

    fn buy(symbol: &str, quantity: f64, sector: &str, volatility: Option<f64>) -> PortfolioDelta {
        PortfolioDelta {
            candidate: CandidateId::new(symbol, "XNAS"),
            quantity,
            price: 100.0,
            sector: sector.to_string(),
            risk_bucket: format!("{}-bucket", symbol),
            volatility,
        }
    }

    #[test]
    fn small_buy_passes() {
        let state = PortfolioState::genesis(100_000.0);
        let assessment = monitor().assess(&buy("AAA", 80.0, "tech", None), &state);
        assert_eq!(assessment.verdict, Verdict::Pass);
        assert!((assessment.exposure_delta - 0.08).abs() < 1e-12);
        assert_eq!(assessment.base_version, state.version);
    }

    #[test]
    fn position_near_limit_warns_and_over_limit_blocks() {
        let state = PortfolioState::genesis(100_000.0);

        let near = monitor().assess(&buy("AAA", 240.0, "s1", None), &state);
        assert_eq!(near.verdict, Verdict::Warn);
        assert!(near.reasons.contains(&ReasonCode::PositionWeightNearLimit));

        let over = monitor().assess(&buy("AAA", 300.0, "s1", None), &state);
        assert_eq!(over.verdict, Verdict::Block);
        assert!(over.reasons.contains(&ReasonCode::PositionWeightExceeded));
    }

    #[test]
    fn sector_concentration_blocks() {
        let state = PortfolioState::genesis(100_000.0)
            .apply(&buy("AAA", 200.0, "tech", None))
            .unwrap()
            .apply(&buy("BBB", 200.0, "tech", None))
            .unwrap();

        let assessment = monitor().assess(&buy("CCC", 100.0, "tech", None), &state);
        assert_eq!(assessment.verdict, Verdict::Block);
        assert!(assessment.reasons.contains(&ReasonCode::SectorWeightExceeded));
    }

    #[test]
    fn reducing_a_breaching_position_is_not_blocked() {
        let state = PortfolioState::genesis(100_000.0)
            .apply(&buy("AAA", 300.0, "s1", None))
            .unwrap();

        let assessment = monitor().assess(&buy("AAA", -20.0, "s1", None), &state);
        assert_eq!(assessment.verdict, Verdict::Warn);
        assert!(assessment.exposure_delta < 0.0);
    }

    #[test]
    fn volatility_budget_blocks() {
        let state = PortfolioState::genesis(100_000.0);

        let calm = monitor().assess(&buy("AAA", 100.0, "s1", Some(0.5)), &state);
        assert_eq!(calm.verdict, Verdict::Pass);

        let wild = monitor().assess(&buy("AAA", 240.0, "s1", Some(0.9)), &state);
        assert_eq!(wild.verdict, Verdict::Block);
        assert!(wild.reasons.contains(&ReasonCode::VolatilityBudgetExceeded));
    }

    #[test]
    fn unfunded_changes_block() {
        let state = PortfolioState::genesis(1_000.0);
        let cash = monitor().assess(&buy("AAA", 50.0, "s1", None), &state);
        assert_eq!(cash.verdict, Verdict::Block);
        assert_eq!(cash.reasons, vec![ReasonCode::InsufficientCash]);

        let holdings = monitor().assess(&buy("AAA", -1.0, "s1", None), &state);
        assert_eq!(holdings.reasons, vec![ReasonCode::InsufficientHoldings]);
    }

    #[test]
    fn unusable_price_or_quantity_blocks_with_its_own_reason() {
        let state = PortfolioState::genesis(100_000.0);

        let mut nan_price = buy("AAA", 10.0, "s1", None);
        nan_price.price = f64::NAN;
        let assessment = monitor().assess(&nan_price, &state);
        assert_eq!(assessment.verdict, Verdict::Block);
        assert_eq!(assessment.reasons, vec![ReasonCode::InvalidPrice]);
        assert_eq!(assessment.exposure_delta, 0.0);

        let mut zero_price = buy("AAA", 10.0, "s1", None);
        zero_price.price = 0.0;
        assert_eq!(
            monitor().assess(&zero_price, &state).reasons,
            vec![ReasonCode::InvalidPrice]
        );

        let zero_quantity = buy("AAA", 0.0, "s1", None);
        assert_eq!(
            monitor().assess(&zero_quantity, &state).reasons,
            vec![ReasonCode::InvalidQuantity]
        );
    }

    #[test]
    fn unappliable_change_blocks_without_the_funding_rule() {
        let mut bare = RiskMonitor::new(test_config().risk);
        bare.add_rule(Box::new(PositionWeightRule));
        let assessment = bare.assess(&buy("AAA", 5_000.0, "s1", None), &PortfolioState::genesis(1_000.0));
        assert_eq!(assessment.verdict, Verdict::Block);
        assert!(assessment.reasons.is_empty());
    }
}
