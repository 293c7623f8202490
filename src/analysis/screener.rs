//! Criteria-based screening capability
//!
//! Fetches fundamentals for a candidate and checks them against configured
//! ranges. A candidate that satisfies every configured criterion is
//! escalated; anything else is discarded. Optionally assigns a risk bucket
//! from market-cap tiers.

use super::provider::{
    DataProvider, Dataset, DatasetKind, DEBT_TO_EQUITY, DIVIDEND_YIELD, MARKET_CAP, PE_RATIO,
    PRICE, VOLATILITY,
};
use super::{AnalysisError, AnalysisModule, AnalysisRequest, CapabilityContract};
use crate::models::{Action, Disposition, EvidenceHandle, Recommendation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Inclusive bounds; an absent bound is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl ValueRange {
    pub fn between(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn at_least(min: f64) -> Self {
        Self {
            min: Some(min),
            max: None,
        }
    }

    pub fn at_most(max: f64) -> Self {
        Self {
            min: None,
            max: Some(max),
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScreeningCriteria {
    #[serde(default)]
    pub market_cap: Option<ValueRange>,
    #[serde(default)]
    pub pe_ratio: Option<ValueRange>,
    #[serde(default)]
    pub dividend_yield: Option<ValueRange>,
    #[serde(default)]
    pub price: Option<ValueRange>,
}

impl ScreeningCriteria {
    fn checks(&self) -> Vec<(&'static str, ValueRange)> {
        [
            (MARKET_CAP, self.market_cap),
            (PE_RATIO, self.pe_ratio),
            (DIVIDEND_YIELD, self.dividend_yield),
            (PRICE, self.price),
        ]
        .into_iter()
        .filter_map(|(field, range)| range.map(|r| (field, r)))
        .collect()
    }
}

/// Market-cap tiering into `low` / `medium` / `high` risk buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskBucketRules {
    pub large_cap_floor: f64,
    pub mid_cap_floor: f64,
    pub low_max_debt_to_equity: f64,
    pub low_min_dividend_yield: f64,
    pub medium_max_debt_to_equity: f64,
    pub high_min_pe_ratio: f64,
}

impl RiskBucketRules {
    /// Large caps above 500bn with low leverage and a dividend are low risk,
    /// 50bn-500bn with moderate leverage medium, small caps or P/E above 30 high.
    pub fn market_cap_tiers() -> Self {
        Self {
            large_cap_floor: 500e9,
            mid_cap_floor: 50e9,
            low_max_debt_to_equity: 0.3,
            low_min_dividend_yield: 1.0,
            medium_max_debt_to_equity: 1.0,
            high_min_pe_ratio: 30.0,
        }
    }

    pub fn classify(&self, data: &Dataset) -> Option<&'static str> {
        let market_cap = data.get(MARKET_CAP).unwrap_or(0.0);
        let debt_to_equity = data.get(DEBT_TO_EQUITY).unwrap_or(f64::INFINITY);
        let dividend_yield = data.get(DIVIDEND_YIELD).unwrap_or(0.0);
        let pe_ratio = data.get(PE_RATIO).unwrap_or(0.0);

        if market_cap > self.large_cap_floor
            && debt_to_equity < self.low_max_debt_to_equity
            && dividend_yield > self.low_min_dividend_yield
        {
            Some("low")
        } else if market_cap > self.mid_cap_floor
            && market_cap < self.large_cap_floor
            && debt_to_equity < self.medium_max_debt_to_equity
        {
            Some("medium")
        } else if market_cap < self.mid_cap_floor || pe_ratio > self.high_min_pe_ratio {
            Some("high")
        } else {
            None
        }
    }
}

pub struct CriteriaScreener {
    contract: CapabilityContract,
    provider: Arc<dyn DataProvider>,
    criteria: ScreeningCriteria,
    buckets: Option<RiskBucketRules>,
}

impl CriteriaScreener {
    pub fn new(id: impl Into<String>, provider: Arc<dyn DataProvider>, criteria: ScreeningCriteria) -> Self {
        Self {
            contract: CapabilityContract::screening(id),
            provider,
            criteria,
            buckets: None,
        }
    }

    pub fn with_risk_buckets(mut self, rules: RiskBucketRules) -> Self {
        self.buckets = Some(rules);
        self
    }

    async fn gather(&self, symbol: &str) -> Result<Dataset, AnalysisError> {
        let mut data = self.provider.fetch(symbol, DatasetKind::Fundamentals).await?;

        if data.get(PRICE).is_none() {
            match self.provider.fetch(symbol, DatasetKind::Quote).await {
                Ok(quote) => {
                    for (field, value) in quote.fields {
                        data.fields.entry(field).or_insert(value);
                    }
                }
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => debug!(symbol, error = %e, "No quote available"),
            }
        }

        Ok(data)
    }
}

#[async_trait::async_trait]
impl AnalysisModule for CriteriaScreener {
    fn contract(&self) -> CapabilityContract {
        self.contract.clone()
    }

    async fn evaluate(&self, request: &AnalysisRequest) -> Result<Recommendation, AnalysisError> {
        let data = self.gather(&request.candidate.symbol).await?;

        let checks = self.criteria.checks();
        let failed: Vec<&str> = checks
            .iter()
            .filter(|(field, range)| !data.get(field).map_or(false, |v| range.contains(v)))
            .map(|(field, _)| *field)
            .collect();

        let confidence = if checks.is_empty() {
            1.0
        } else {
            (checks.len() - failed.len()) as f64 / checks.len() as f64
        };

        let (action, disposition) = if failed.is_empty() {
            (Action::Buy, Disposition::Escalate)
        } else {
            (Action::Hold, Disposition::Discard)
        };

        debug!(
            candidate = %request.candidate,
            passed = checks.len() - failed.len(),
            failed = ?failed,
            "Screened candidate"
        );

        let rationale = EvidenceHandle(format!(
            "screen:{}:{}:{}",
            request.candidate,
            request.generation,
            data.sources.join("+")
        ));

        let mut recommendation = request.recommend(action, confidence, disposition, rationale);
        recommendation.reference_price = data.get(PRICE);
        recommendation.volatility = data.get(VOLATILITY);
        recommendation.risk_bucket = self
            .buckets
            .as_ref()
            .and_then(|rules| rules.classify(&data))
            .map(str::to_string);

        Ok(recommendation)
    }
}

#[cfg(test)]
mod tests {
    use super::super::provider::StaticDataProvider;
    use super::super::RequestKind;
    use super::*;
    use crate::models::{CandidateId, InstrumentProfile, Layer};
    use chrono::Utc;
    use uuid::Uuid;

    fn request(symbol: &str) -> AnalysisRequest {
        AnalysisRequest {
            task_id: Uuid::new_v4(),
            candidate: CandidateId::new(symbol, "XNAS"),
            profile: InstrumentProfile::default(),
            generation: 3,
            kind: RequestKind::Screen,
            layer: Layer::Screening,
            evidence: Vec::new(),
            deadline: Utc::now(),
        }
    }

    fn provider() -> Arc<dyn DataProvider> {
        Arc::new(
            StaticDataProvider::new("fixture")
                .with(
                    "MSFT",
                    DatasetKind::Fundamentals,
                    [
                        (MARKET_CAP, 3.0e12),
                        (PE_RATIO, 25.0),
                        (DIVIDEND_YIELD, 1.2),
                        (DEBT_TO_EQUITY, 0.2),
                    ],
                )
                .with("MSFT", DatasetKind::Quote, [(PRICE, 410.0)])
                .with(
                    "TINY",
                    DatasetKind::Fundamentals,
                    [(MARKET_CAP, 2.0e9), (PE_RATIO, 45.0), (PRICE, 12.0)],
                ),
        )
    }

    fn criteria() -> ScreeningCriteria {
        ScreeningCriteria {
            market_cap: Some(ValueRange::at_least(10e9)),
            pe_ratio: Some(ValueRange::between(5.0, 35.0)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn escalates_when_every_criterion_passes() {
        let screener = CriteriaScreener::new("screen.criteria", provider(), criteria())
            .with_risk_buckets(RiskBucketRules::market_cap_tiers());

        let rec = screener.evaluate(&request("MSFT")).await.unwrap();
        assert_eq!(rec.disposition, Disposition::Escalate);
        assert_eq!(rec.action, Action::Buy);
        assert_eq!(rec.confidence, 1.0);
        assert_eq!(rec.generation, 3);
        assert_eq!(rec.reference_price, Some(410.0));
        assert_eq!(rec.risk_bucket.as_deref(), Some("low"));
    }

    #[tokio::test]
    async fn discards_on_any_failed_criterion() {
        let screener = CriteriaScreener::new("screen.criteria", provider(), criteria())
            .with_risk_buckets(RiskBucketRules::market_cap_tiers());

        let rec = screener.evaluate(&request("TINY")).await.unwrap();
        assert_eq!(rec.disposition, Disposition::Discard);
        assert_eq!(rec.confidence, 0.0);
        assert_eq!(rec.risk_bucket.as_deref(), Some("high"));
    }

    #[tokio::test]
    async fn unknown_symbol_fails_without_retry() {
        let screener = CriteriaScreener::new("screen.criteria", provider(), criteria());
        let err = screener.evaluate(&request("NOPE")).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
