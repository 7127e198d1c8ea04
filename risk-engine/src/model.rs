//! Model score provider
//!
//! Feature extraction belongs to the engine; only scoring is delegated. The
//! provider is either a rule-based linear model or a learned model behind an
//! async trait, so a trained model can be swapped in without touching the
//! aggregator.

use crate::config::{MarketConfig, ModelConfig};
use crate::error::SignalError;
use crate::profile::{amount_deviation, BehaviorProfile};
use crate::types::TransactionEvent;
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Night hours, local time
const NIGHT_HOURS: std::ops::Range<u32> = 0..6;
const MAX_INSTALLMENTS: f64 = 12.0;

/// Named numeric features in deterministic order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(BTreeMap<String, f64>);

impl FeatureVector {
    /// Empty vector
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a feature
    pub fn insert(&mut self, name: &str, value: f64) {
        self.0.insert(name.to_string(), value);
    }

    /// Get a feature
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// Iterate in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Number of features
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no feature is set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

/// Build the model's feature vector for a transaction
pub fn extract_features(
    event: &TransactionEvent,
    profile: Option<&BehaviorProfile>,
    new_device: bool,
    model: &ModelConfig,
    market: &MarketConfig,
) -> FeatureVector {
    let offset = market.default_utc_offset_minutes;
    let hour = event.local_hour(offset);
    let amount_normalized = event
        .amount
        .checked_div(model.amount_reference)
        .and_then(|ratio| ratio.to_f64())
        .unwrap_or(1.0)
        .clamp(0.0, 1.0);
    let history = profile.filter(|p| !p.is_new());

    let mut features = FeatureVector::new();
    features.insert("amount_normalized", amount_normalized);
    features.insert("hour_normalized", f64::from(hour) / 23.0);
    features.insert("is_weekend", flag(event.is_weekend(offset)));
    features.insert("is_night", flag(NIGHT_HOURS.contains(&hour)));
    features.insert("method_risk", event.payment_method.base_risk());
    features.insert(
        "installments_normalized",
        ((f64::from(event.installments.unwrap_or(1).max(1)) - 1.0) / (MAX_INSTALLMENTS - 1.0)).min(1.0),
    );
    features.insert("is_new_customer", flag(history.is_none()));
    features.insert("is_new_device", flag(new_device));
    features.insert(
        "amount_deviation",
        match history {
            Some(p) => amount_deviation(event.amount, p.average_amount) / 100.0,
            // No history to deviate from; judge against the reference amount
            None => amount_normalized,
        },
    );
    features.insert(
        "is_foreign_currency",
        flag(!event.currency.eq_ignore_ascii_case(&market.currency)),
    );
    features
}

/// Model output
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelScore {
    /// Risk (0-100)
    pub risk_score: f64,
    /// Confidence (0-100)
    pub confidence: f64,
}

/// Weighted linear combination of features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    /// Intercept on the 0-1 scale
    pub bias: f64,
    /// Weight per feature name
    pub weights: BTreeMap<String, f64>,
}

impl Default for LinearModel {
    fn default() -> Self {
        let weights = [
            ("amount_normalized", 0.30),
            ("is_night", 0.20),
            ("method_risk", 0.10),
            ("is_new_customer", 0.15),
            ("is_new_device", 0.15),
            ("amount_deviation", 0.15),
            ("is_foreign_currency", 0.10),
            ("installments_normalized", 0.05),
            ("is_weekend", 0.05),
        ]
        .into_iter()
        .map(|(name, w)| (name.to_string(), w))
        .collect();

        Self { bias: 0.0, weights }
    }
}

impl LinearModel {
    /// Score = clamp(100 · (bias + Σ wᵢ·fᵢ)); confidence = share of weight whose feature is present
    pub fn score(&self, features: &FeatureVector) -> ModelScore {
        let mut sum = self.bias;
        let mut present = 0.0;
        let mut total = 0.0;
        for (name, weight) in &self.weights {
            total += weight.abs();
            if let Some(value) = features.get(name).filter(|v| v.is_finite()) {
                sum += weight * value;
                present += weight.abs();
            }
        }
        let confidence = if total > 0.0 { 100.0 * present / total } else { 0.0 };
        ModelScore {
            risk_score: (100.0 * sum).clamp(0.0, 100.0),
            confidence,
        }
    }
}

/// A trained model, evaluated out of process or by a native runtime
#[async_trait]
pub trait LearnedModel: Send + Sync {
    /// Model name for logs
    fn name(&self) -> &str;

    /// Score one feature vector
    async fn score(&self, features: &FeatureVector) -> Result<ModelScore, SignalError>;
}

/// Source of the model factor
#[derive(Clone)]
pub enum ModelScoreProvider {
    /// Built-in linear model
    RuleBased(LinearModel),
    /// Pluggable learned model
    Learned(Arc<dyn LearnedModel>),
}

impl Default for ModelScoreProvider {
    fn default() -> Self {
        ModelScoreProvider::RuleBased(LinearModel::default())
    }
}

impl fmt::Debug for ModelScoreProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelScoreProvider::RuleBased(model) => f.debug_tuple("RuleBased").field(model).finish(),
            ModelScoreProvider::Learned(model) => f.debug_tuple("Learned").field(&model.name()).finish(),
        }
    }
}

impl ModelScoreProvider {
    /// Score features, bounding a learned model by `timeout`
    pub async fn score(
        &self,
        features: &FeatureVector,
        timeout: Duration,
    ) -> Result<ModelScore, SignalError> {
        match self {
            ModelScoreProvider::RuleBased(model) => Ok(model.score(features)),
            ModelScoreProvider::Learned(model) => {
                let score = tokio::time::timeout(timeout, model.score(features))
                    .await
                    .map_err(|_| SignalError::Timeout(timeout.as_millis() as u64))??;
                if !score.risk_score.is_finite() || !(0.0..=100.0).contains(&score.risk_score) {
                    return Err(SignalError::Model(format!(
                        "{} returned out-of-range score {}",
                        model.name(),
                        score.risk_score
                    )));
                }
                Ok(ModelScore {
                    risk_score: score.risk_score,
                    confidence: score.confidence.clamp(0.0, 100.0),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PaymentMethod;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    struct FixedModel(Result<ModelScore, SignalError>, Duration);

    #[async_trait]
    impl LearnedModel for FixedModel {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn score(&self, _features: &FeatureVector) -> Result<ModelScore, SignalError> {
            tokio::time::sleep(self.1).await;
            self.0.clone()
        }
    }

    fn night_event() -> TransactionEvent {
        // 02:00 in São Paulo on a Thursday
        TransactionEvent::new(
            "judy",
            Decimal::from(95_000),
            "BRL",
            PaymentMethod::CreditCard,
            Utc.with_ymd_and_hms(2026, 6, 4, 5, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_features_for_new_customer() {
        let f = extract_features(&night_event(), None, true, &ModelConfig::default(), &MarketConfig::default());
        assert_eq!(f.len(), 10);
        assert_eq!(f.get("amount_normalized"), Some(1.0));
        assert_eq!(f.get("is_night"), Some(1.0));
        assert_eq!(f.get("is_weekend"), Some(0.0));
        assert_eq!(f.get("is_new_customer"), Some(1.0));
        assert_eq!(f.get("amount_deviation"), Some(1.0));
        assert_eq!(f.get("installments_normalized"), Some(0.0));
    }

    #[test]
    fn test_linear_model_saturates_for_risky_profile() {
        let f = extract_features(&night_event(), None, true, &ModelConfig::default(), &MarketConfig::default());
        let s = LinearModel::default().score(&f);
        assert_eq!(s.risk_score, 100.0);
        assert_eq!(s.confidence, 100.0);
    }

    #[test]
    fn test_missing_features_lower_confidence() {
        let mut f = FeatureVector::new();
        f.insert("amount_normalized", 0.5);
        let s = LinearModel::default().score(&f);
        assert!((s.risk_score - 15.0).abs() < 1e-9);
        assert!((s.confidence - 100.0 * 0.30 / 1.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_learned_model_failures() {
        let f = FeatureVector::new();
        let ok = ModelScoreProvider::Learned(Arc::new(FixedModel(
            Ok(ModelScore {
                risk_score: 42.0,
                confidence: 120.0,
            }),
            Duration::ZERO,
        )));
        let s = ok.score(&f, Duration::from_millis(50)).await.unwrap();
        assert_eq!(s.risk_score, 42.0);
        assert_eq!(s.confidence, 100.0);

        let slow = ModelScoreProvider::Learned(Arc::new(FixedModel(
            Ok(ModelScore {
                risk_score: 42.0,
                confidence: 90.0,
            }),
            Duration::from_millis(200),
        )));
        assert_eq!(
            slow.score(&f, Duration::from_millis(20)).await,
            Err(SignalError::Timeout(20))
        );

        let broken = ModelScoreProvider::Learned(Arc::new(FixedModel(
            Ok(ModelScore {
                risk_score: f64::NAN,
                confidence: 90.0,
            }),
            Duration::ZERO,
        )));
        assert!(matches!(
            broken.score(&f, Duration::from_millis(50)).await,
            Err(SignalError::Model(_))
        ));
    }
}
