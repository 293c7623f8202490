//! Market data providers
//!
//! Analysis modules pull numeric fields from one or more providers. When
//! several providers are configured their answers are merged field by field,
//! the first provider that reports a field wins.

use super::AnalysisError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

pub const MARKET_CAP: &str = "market_cap";
pub const PE_RATIO: &str = "pe_ratio";
pub const DIVIDEND_YIELD: &str = "dividend_yield";
pub const DEBT_TO_EQUITY: &str = "debt_to_equity";
pub const PRICE: &str = "price";
pub const VOLATILITY: &str = "volatility";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Fundamentals,
    Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub symbol: String,
    pub kind: DatasetKind,
    pub fields: BTreeMap<String, f64>,
    /// Providers that contributed at least one field.
    pub sources: Vec<String>,
    pub retrieved_at: DateTime<Utc>,
}

impl Dataset {
    pub fn get(&self, field: &str) -> Option<f64> {
        self.fields.get(field).copied()
    }
}

#[async_trait::async_trait]
pub trait DataProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, symbol: &str, kind: DatasetKind) -> Result<Dataset, AnalysisError>;
}

/// Fixed datasets, keyed by symbol and kind.
pub struct StaticDataProvider {
    name: String,
    data: HashMap<(String, DatasetKind), BTreeMap<String, f64>>,
}

impl StaticDataProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: HashMap::new(),
        }
    }

    pub fn with<I, K>(mut self, symbol: &str, kind: DatasetKind, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let entry = self.data.entry((symbol.to_uppercase(), kind)).or_default();
        for (field, value) in fields {
            entry.insert(field.into(), value);
        }
        self
    }
}

#[async_trait::async_trait]
impl DataProvider for StaticDataProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, symbol: &str, kind: DatasetKind) -> Result<Dataset, AnalysisError> {
        let fields = self
            .data
            .get(&(symbol.to_uppercase(), kind))
            .cloned()
            .ok_or_else(|| AnalysisError::Failed(format!("{}: no {:?} data for {}", self.name, kind, symbol)))?;

        Ok(Dataset {
            symbol: symbol.to_uppercase(),
            kind,
            fields,
            sources: vec![self.name.clone()],
            retrieved_at: Utc::now(),
        })
    }
}

/// Queries every provider and merges the results.
pub struct MergedDataProvider {
    providers: Vec<Arc<dyn DataProvider>>,
}

impl MergedDataProvider {
    pub fn new(providers: Vec<Arc<dyn DataProvider>>) -> Self {
        Self { providers }
    }
}

#[async_trait::async_trait]
impl DataProvider for MergedDataProvider {
    fn name(&self) -> &str {
        "merged"
    }

    async fn fetch(&self, symbol: &str, kind: DatasetKind) -> Result<Dataset, AnalysisError> {
        let mut merged: Option<Dataset> = None;
        let mut transient = None;
        let mut last_error = None;

        for provider in &self.providers {
            match provider.fetch(symbol, kind).await {
                Ok(dataset) => match merged.as_mut() {
                    None => merged = Some(dataset),
                    Some(existing) => {
                        let mut contributed = false;
                        for (field, value) in dataset.fields {
                            if !existing.fields.contains_key(&field) {
                                existing.fields.insert(field, value);
                                contributed = true;
                            }
                        }
                        if contributed {
                            existing.sources.extend(dataset.sources);
                        }
                    }
                },
                Err(e) => {
                    warn!(provider = provider.name(), symbol, error = %e, "Data provider failed");
                    if e.is_transient() {
                        transient = Some(e);
                    } else {
                        last_error = Some(e);
                    }
                }
            }
        }

        // Partial data beats none; a transient failure is only surfaced when
        // nothing answered, so the pool can retry.
        merged.ok_or_else(|| {
            transient
                .or(last_error)
                .unwrap_or_else(|| AnalysisError::Failed("no data providers configured".to_string()))
        })
    }
}
