//! Engine configuration
//!
//! Every numeric threshold that shapes a decision (risk limits, trigger
//! magnitudes, approval default policy) is injected here. Risk limits and
//! trigger thresholds have no built-in values; `from_env` fails without them.

use crate::error::OrchestrationError;
use crate::models::{Layer, LifecycleState};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub layers: BTreeMap<Layer, LayerSettings>,
    pub retry: RetryPolicy,
    pub risk: RiskPolicy,
    pub gate: GatePolicy,
    pub trigger: TriggerPolicy,
    pub sizing: SizingPolicy,
    pub portfolio: PortfolioSettings,
    pub execution: ExecutionSettings,
}

/// Worker pool settings for one layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSettings {
    pub capability: String,
    pub concurrency: usize,
    #[serde(with = "duration_ms")]
    pub task_timeout: Duration,
    /// In-pool retries of transient fetch errors.
    pub transient_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub base_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Exponential backoff for the given (1-based) retry attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPolicy {
    pub max_position_weight: f64,
    pub max_sector_weight: f64,
    pub max_risk_bucket_weight: f64,
    /// Ceiling on the weighted sum of holding volatilities.
    pub volatility_budget: f64,
    /// Fraction of a limit above which the verdict is Warn.
    pub warn_fraction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultDecision {
    AutoReject,
    /// Auto-approve requests whose materiality is below the threshold;
    /// reject the rest.
    AutoApproveBelow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatePolicy {
    #[serde(with = "duration_ms")]
    pub decision_window: Duration,
    pub default_decision: DefaultDecision,
    #[serde(default)]
    pub materiality_threshold: Option<f64>,
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
}

/// Coarse grouping of lifecycle states for trigger thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageClass {
    Analysis,
    Decision,
    Holding,
    Inactive,
}

impl StageClass {
    pub fn of(state: LifecycleState) -> StageClass {
        use LifecycleState::*;
        match state {
            Discovered | Screening | FlaggedForDeepEval | UnderEvaluation
            | ReEvaluationTriggered => StageClass::Analysis,
            RecommendationReady | RiskCheck | PendingApproval => StageClass::Decision,
            Approved | Executing | Held => StageClass::Holding,
            Discarded | Blocked | Rejected | Degraded | Closed => StageClass::Inactive,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerPolicy {
    #[serde(with = "duration_ms")]
    pub cooldown: Duration,
    /// Minimum magnitude per stage; stages without an entry never trigger.
    pub thresholds: BTreeMap<StageClass, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingPolicy {
    /// Target weight for a full-confidence Buy.
    pub base_position_weight: f64,
    /// Share of a holding sold on Decrease.
    pub decrease_fraction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSettings {
    pub initial_cash: f64,
    pub weight_tolerance: f64,
    pub max_commit_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    #[serde(with = "duration_ms")]
    pub reconcile_interval: Duration,
}

impl EngineConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `ENGINE_CONFIG_FILE` (JSON) if set, otherwise from `ENGINE_*`
    /// variables. Call `dotenv::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = env::var("ENGINE_CONFIG_FILE") {
            let raw = std::fs::read_to_string(&path)?;
            return Self::from_json(&raw);
        }

        let mut layers = BTreeMap::new();
        layers.insert(
            Layer::Screening,
            LayerSettings {
                capability: env_or("ENGINE_SCREENING_CAPABILITY", "screen.criteria".to_string())?,
                concurrency: env_or("ENGINE_SCREENING_CONCURRENCY", 8)?,
                task_timeout: Duration::from_millis(env_or("ENGINE_SCREENING_TIMEOUT_MS", 30_000)?),
                transient_retries: env_or("ENGINE_TRANSIENT_RETRIES", 2)?,
            },
        );
        layers.insert(
            Layer::DeepEvaluation,
            LayerSettings {
                capability: env_or("ENGINE_EVALUATION_CAPABILITY", "evaluate.deep".to_string())?,
                concurrency: env_or("ENGINE_EVALUATION_CONCURRENCY", 2)?,
                task_timeout: Duration::from_millis(env_or("ENGINE_EVALUATION_TIMEOUT_MS", 300_000)?),
                transient_retries: env_or("ENGINE_TRANSIENT_RETRIES", 2)?,
            },
        );

        let default_decision = match env::var("ENGINE_GATE_DEFAULT")
            .map_err(|_| missing("ENGINE_GATE_DEFAULT"))?
            .to_lowercase()
            .as_str()
        {
            "auto_reject" | "reject" => DefaultDecision::AutoReject,
            "auto_approve_below" | "approve_below" => DefaultDecision::AutoApproveBelow,
            other => {
                return Err(OrchestrationError::ConfigError(format!(
                    "ENGINE_GATE_DEFAULT: unknown policy '{}'",
                    other
                )))
            }
        };

        let mut thresholds = BTreeMap::new();
        for (stage, var) in [
            (StageClass::Analysis, "ENGINE_TRIGGER_ANALYSIS"),
            (StageClass::Decision, "ENGINE_TRIGGER_DECISION"),
            (StageClass::Holding, "ENGINE_TRIGGER_HOLDING"),
            (StageClass::Inactive, "ENGINE_TRIGGER_INACTIVE"),
        ] {
            if let Some(value) = env_opt::<f64>(var)? {
                thresholds.insert(stage, value);
            }
        }
        if thresholds.is_empty() {
            return Err(missing("ENGINE_TRIGGER_<STAGE>"));
        }

        let config = EngineConfig {
            layers,
            retry: RetryPolicy {
                max_retries: env_or("ENGINE_MAX_RETRIES", 3)?,
                base_backoff: Duration::from_millis(env_or("ENGINE_BACKOFF_BASE_MS", 500)?),
                max_backoff: Duration::from_millis(env_or("ENGINE_BACKOFF_MAX_MS", 30_000)?),
            },
            risk: RiskPolicy {
                max_position_weight: env_required("ENGINE_RISK_MAX_POSITION_WEIGHT")?,
                max_sector_weight: env_required("ENGINE_RISK_MAX_SECTOR_WEIGHT")?,
                max_risk_bucket_weight: env_required("ENGINE_RISK_MAX_BUCKET_WEIGHT")?,
                volatility_budget: env_required("ENGINE_RISK_VOLATILITY_BUDGET")?,
                warn_fraction: env_or("ENGINE_RISK_WARN_FRACTION", 0.9)?,
            },
            gate: GatePolicy {
                decision_window: Duration::from_secs(env_or("ENGINE_GATE_WINDOW_SECS", 3_600)?),
                default_decision,
                materiality_threshold: env_opt("ENGINE_GATE_MATERIALITY")?,
                sweep_interval: Duration::from_millis(env_or("ENGINE_GATE_SWEEP_MS", 1_000)?),
            },
            trigger: TriggerPolicy {
                cooldown: Duration::from_secs(env_or("ENGINE_TRIGGER_COOLDOWN_SECS", 300)?),
                thresholds,
            },
            sizing: SizingPolicy {
                base_position_weight: env_required("ENGINE_SIZING_BASE_WEIGHT")?,
                decrease_fraction: env_or("ENGINE_SIZING_DECREASE_FRACTION", 0.5)?,
            },
            portfolio: PortfolioSettings {
                initial_cash: env_required("ENGINE_INITIAL_CASH")?,
                weight_tolerance: env_or("ENGINE_WEIGHT_TOLERANCE", 1e-9)?,
                max_commit_attempts: env_or("ENGINE_MAX_COMMIT_ATTEMPTS", 5)?,
            },
            execution: ExecutionSettings {
                reconcile_interval: Duration::from_millis(env_or("ENGINE_RECONCILE_MS", 1_000)?),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn layer(&self, layer: Layer) -> Result<&LayerSettings> {
        self.layers.get(&layer).ok_or_else(|| {
            OrchestrationError::ConfigError(format!("no settings for layer {}", layer))
        })
    }

    pub fn validate(&self) -> Result<()> {
        for layer in Layer::ALL {
            let settings = self.layer(layer)?;
            if settings.concurrency == 0 {
                return Err(OrchestrationError::ConfigError(format!(
                    "layer {} needs at least one execution slot",
                    layer
                )));
            }
        }

        let fractions = [
            ("max_position_weight", self.risk.max_position_weight),
            ("max_sector_weight", self.risk.max_sector_weight),
            ("max_risk_bucket_weight", self.risk.max_risk_bucket_weight),
            ("warn_fraction", self.risk.warn_fraction),
            ("base_position_weight", self.sizing.base_position_weight),
            ("decrease_fraction", self.sizing.decrease_fraction),
        ];
        for (name, value) in fractions {
            if !(0.0..=1.0).contains(&value) {
                return Err(OrchestrationError::ConfigError(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        if self.gate.default_decision == DefaultDecision::AutoApproveBelow
            && self.gate.materiality_threshold.is_none()
        {
            return Err(OrchestrationError::ConfigError(
                "auto_approve_below requires a materiality threshold".to_string(),
            ));
        }

        if self.portfolio.initial_cash < 0.0 {
            return Err(OrchestrationError::ConfigError(
                "initial cash cannot be negative".to_string(),
            ));
        }

        Ok(())
    }
}

fn missing(var: &str) -> OrchestrationError {
    OrchestrationError::ConfigError(format!("{} is not set", var))
}

fn env_opt<T: FromStr>(var: &str) -> Result<Option<T>> {
    match env::var(var) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            OrchestrationError::ConfigError(format!("{}: cannot parse '{}'", var, raw))
        }),
        Err(_) => Ok(None),
    }
}

fn env_or<T: FromStr>(var: &str, default: T) -> Result<T> {
    Ok(env_opt(var)?.unwrap_or(default))
}

fn env_required<T: FromStr>(var: &str) -> Result<T> {
    env_opt(var)?.ok_or_else(|| missing(var))
}

/// Durations travel as integer milliseconds in JSON config.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> EngineConfig {
    let mut layers = BTreeMap::new();
    layers.insert(
        Layer::Screening,
        LayerSettings {
            capability: "screen.test".to_string(),
            concurrency: 4,
            task_timeout: Duration::from_millis(200),
            transient_retries: 1,
        },
    );
    layers.insert(
        Layer::DeepEvaluation,
        LayerSettings {
            capability: "evaluate.test".to_string(),
            concurrency: 2,
            task_timeout: Duration::from_millis(200),
            transient_retries: 1,
        },
    );

    let mut thresholds = BTreeMap::new();
    thresholds.insert(StageClass::Analysis, 0.5);
    thresholds.insert(StageClass::Decision, 0.5);
    thresholds.insert(StageClass::Holding, 0.7);

    EngineConfig {
        layers,
        retry: RetryPolicy {
            max_retries: 2,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        },
        risk: RiskPolicy {
            max_position_weight: 0.25,
            max_sector_weight: 0.40,
            max_risk_bucket_weight: 0.60,
            volatility_budget: 0.20,
            warn_fraction: 0.9,
        },
        gate: GatePolicy {
            decision_window: Duration::from_secs(60),
            default_decision: DefaultDecision::AutoReject,
            materiality_threshold: None,
            sweep_interval: Duration::from_millis(10),
        },
        trigger: TriggerPolicy {
            cooldown: Duration::from_secs(30),
            thresholds,
        },
        sizing: SizingPolicy {
            base_position_weight: 0.10,
            decrease_fraction: 0.5,
        },
        portfolio: PortfolioSettings {
            initial_cash: 100_000.0,
            weight_tolerance: 1e-9,
            max_commit_attempts: 3,
        },
        execution: ExecutionSettings {
            reconcile_interval: Duration::from_millis(10),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_retries: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(350));
        assert_eq!(retry.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn validation_rejects_auto_approve_without_threshold() {
        let mut config = test_config();
        assert!(config.validate().is_ok());

        config.gate.default_decision = DefaultDecision::AutoApproveBelow;
        assert!(config.validate().is_err());

        config.gate.materiality_threshold = Some(1_000.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = test_config();
        let raw = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.retry.base_backoff, Duration::from_millis(5));
        assert_eq!(parsed.layers.len(), 2);
    }

    #[test]
    fn example_config_file_is_valid() {
        let config = EngineConfig::from_json(include_str!("../config/engine.example.json")).unwrap();
        assert_eq!(config.layer(Layer::DeepEvaluation).unwrap().capability, "evaluate.deep");
        assert_eq!(config.gate.default_decision, DefaultDecision::AutoApproveBelow);
        assert_eq!(config.trigger.thresholds.get(&StageClass::Inactive), None);
        assert_eq!(config.trigger.cooldown, Duration::from_secs(300));
    }
}
