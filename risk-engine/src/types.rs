//! Core types for the risk engine

use crate::config::{EngineConfig, TierThresholds};
use crate::{Error, Result};
use chrono::{DateTime, Datelike, Duration, FixedOffset, Offset, Timelike, Utc, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

/// Declared payment method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Credit card (may be split in installments)
    CreditCard,
    /// Debit card
    DebitCard,
    /// Real-time account-to-account transfer
    InstantTransfer,
    /// Scheduled bank transfer
    BankTransfer,
    /// Cash voucher paid at a bank or retailer
    CashVoucher,
    /// Digital wallet
    DigitalWallet,
}

impl PaymentMethod {
    /// Stable lowercase name, used as config and metric key
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::CreditCard => "credit_card",
            PaymentMethod::DebitCard => "debit_card",
            PaymentMethod::InstantTransfer => "instant_transfer",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::CashVoucher => "cash_voucher",
            PaymentMethod::DigitalWallet => "digital_wallet",
        }
    }

    /// Baseline method risk on 0..=1, used as a model feature
    pub fn base_risk(&self) -> f64 {
        match self {
            PaymentMethod::BankTransfer => 0.1,
            PaymentMethod::DebitCard => 0.2,
            PaymentMethod::InstantTransfer => 0.3,
            PaymentMethod::CashVoucher => 0.4,
            PaymentMethod::DigitalWallet => 0.5,
            PaymentMethod::CreditCard => 0.6,
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse geolocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    /// ISO 3166-1 alpha-2 country code
    pub country: String,
    /// Region / state
    pub region: Option<String>,
    /// City
    pub city: Option<String>,
    /// Latitude in degrees
    pub latitude: Option<f64>,
    /// Longitude in degrees
    pub longitude: Option<f64>,
}

impl GeoLocation {
    /// Create a country-level location
    pub fn country(country: &str) -> Self {
        Self {
            country: country.to_uppercase(),
            region: None,
            city: None,
            latitude: None,
            longitude: None,
        }
    }

    /// Set region and city
    pub fn with_place(mut self, region: &str, city: &str) -> Self {
        self.region = Some(region.to_string());
        self.city = Some(city.to_string());
        self
    }

    /// Set coordinates
    pub fn with_coordinates(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    /// Coordinates if both are known
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.latitude.zip(self.longitude)
    }
}

/// Raw device attributes reported by the client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePayload {
    /// User-agent header
    pub user_agent: String,
    /// Screen resolution, e.g. "1920x1080"
    pub screen_resolution: Option<String>,
    /// IANA time zone reported by the browser
    pub timezone: Option<String>,
    /// Browser language
    pub language: Option<String>,
    /// Platform string
    pub platform: Option<String>,
    /// Canvas rendering hash
    pub canvas_hash: Option<String>,
    /// WebGL renderer hash
    pub webgl_hash: Option<String>,
    /// Installed plugins
    pub plugins: Vec<String>,
    /// navigator.webdriver flag
    pub webdriver: bool,
}

/// Payment transaction submitted for evaluation
///
/// Produced by the caller and consumed read-only by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEvent {
    /// Transaction ID (also the idempotency key)
    pub transaction_id: Uuid,
    /// Customer identifier (email or stable id)
    pub customer_id: String,
    /// Amount in major currency units
    pub amount: Decimal,
    /// ISO 4217 currency code
    pub currency: String,
    /// Declared payment method
    pub payment_method: PaymentMethod,
    /// Origin IP
    pub ip_address: Option<IpAddr>,
    /// Location declared by the client
    pub declared_location: Option<GeoLocation>,
    /// Device fingerprint payload
    pub device: Option<DevicePayload>,
    /// Event time
    pub timestamp: DateTime<Utc>,
    /// Client UTC offset in minutes, if known
    pub utc_offset_minutes: Option<i32>,
    /// Client locale, e.g. "pt-BR"
    pub locale: Option<String>,
    /// Installment count (credit card)
    pub installments: Option<u32>,
    /// Free-form metadata
    pub metadata: HashMap<String, String>,
}

impl TransactionEvent {
    /// Create event with the required fields
    pub fn new(
        customer_id: impl Into<String>,
        amount: Decimal,
        currency: &str,
        payment_method: PaymentMethod,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id: Uuid::new_v4(),
            customer_id: customer_id.into(),
            amount,
            currency: currency.to_uppercase(),
            payment_method,
            ip_address: None,
            declared_location: None,
            device: None,
            timestamp,
            utc_offset_minutes: None,
            locale: None,
            installments: None,
            metadata: HashMap::new(),
        }
    }

    /// Set origin IP
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip_address = Some(ip);
        self
    }

    /// Set device payload
    pub fn with_device(mut self, device: DevicePayload) -> Self {
        self.device = Some(device);
        self
    }

    /// Set declared location
    pub fn with_declared_location(mut self, location: GeoLocation) -> Self {
        self.declared_location = Some(location);
        self
    }

    /// Set client locale and UTC offset
    pub fn with_locale(mut self, locale: &str, utc_offset_minutes: i32) -> Self {
        self.locale = Some(locale.to_string());
        self.utc_offset_minutes = Some(utc_offset_minutes);
        self
    }

    /// Set installment count
    pub fn with_installments(mut self, installments: u32) -> Self {
        self.installments = Some(installments);
        self
    }

    /// Reject events that cannot be scored
    pub fn validate(&self, now: DateTime<Utc>, config: &EngineConfig) -> Result<()> {
        let limits = &config.input;
        if self.customer_id.trim().is_empty() {
            return Err(Error::InvalidInput("customer_id is required".to_string()));
        }
        if self.amount <= Decimal::ZERO {
            return Err(Error::InvalidInput(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }
        if self.amount > limits.max_amount {
            return Err(Error::InvalidInput(format!(
                "amount {} exceeds the maximum of {}",
                self.amount, limits.max_amount
            )));
        }
        if self.amount.normalize().scale() > limits.max_amount_scale {
            return Err(Error::InvalidInput(format!(
                "amount {} has more than {} decimal places",
                self.amount, limits.max_amount_scale
            )));
        }
        if self.currency.trim().is_empty() {
            return Err(Error::InvalidInput("currency is required".to_string()));
        }
        if self.timestamp > now + Duration::seconds(config.max_clock_skew_secs) {
            return Err(Error::InvalidInput(format!(
                "timestamp {} is ahead of engine clock {}",
                self.timestamp, now
            )));
        }
        if self.installments == Some(0) {
            return Err(Error::InvalidInput("installments must be at least 1".to_string()));
        }
        if let Some(offset) = self.utc_offset_minutes {
            if offset.abs() > limits.max_utc_offset_minutes {
                return Err(Error::InvalidInput(format!(
                    "utc offset of {} minutes is out of range",
                    offset
                )));
            }
        }
        Ok(())
    }

    /// Event time in the client's local offset, falling back to `default_offset_minutes`
    pub fn local_time(&self, default_offset_minutes: i32) -> DateTime<FixedOffset> {
        let minutes = self.utc_offset_minutes.unwrap_or(default_offset_minutes);
        let offset = minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix());
        self.timestamp.with_timezone(&offset)
    }

    /// Local hour of day (0-23)
    pub fn local_hour(&self, default_offset_minutes: i32) -> u32 {
        self.local_time(default_offset_minutes).hour()
    }

    /// Whether the local day is Saturday or Sunday
    pub fn is_weekend(&self, default_offset_minutes: i32) -> bool {
        matches!(
            self.local_time(default_offset_minutes).weekday(),
            Weekday::Sat | Weekday::Sun
        )
    }
}

/// Risk score (0-100)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RiskScore(u8);

impl RiskScore {
    /// Create new risk score, clamped to 100
    pub fn new(score: u8) -> Self {
        Self(score.min(100))
    }

    /// Round a weighted sum and clamp it into 0..=100
    pub fn from_weighted(value: f64) -> Self {
        if !value.is_finite() {
            return Self(100);
        }
        Self(value.round().clamp(0.0, 100.0) as u8)
    }

    /// Get raw score
    pub fn score(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for RiskScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Risk tier
///
/// Thresholds are exclusive upper bounds: a score equal to a threshold
/// belongs to the higher tier (40 is `Medium`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskTier {
    /// Below the first threshold
    VeryLow,
    /// Low risk
    Low,
    /// Medium risk
    Medium,
    /// High risk
    High,
    /// At or above the last threshold
    VeryHigh,
}

impl RiskTier {
    /// Map a score through the configured thresholds
    pub fn from_score(score: RiskScore, thresholds: &TierThresholds) -> Self {
        let s = score.score();
        if s < thresholds.very_low_below {
            RiskTier::VeryLow
        } else if s < thresholds.low_below {
            RiskTier::Low
        } else if s < thresholds.medium_below {
            RiskTier::Medium
        } else if s < thresholds.high_below {
            RiskTier::High
        } else {
            RiskTier::VeryHigh
        }
    }

    /// Stable name, used as metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::VeryLow => "very_low",
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
            RiskTier::VeryHigh => "very_high",
        }
    }
}

impl From<RiskScore> for RiskTier {
    fn from(score: RiskScore) -> Self {
        RiskTier::from_score(score, &TierThresholds::default())
    }
}

/// Scoring dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKind {
    /// Device trust
    DeviceTrust,
    /// Deviation from the behavioral profile
    BehavioralPattern,
    /// Transaction velocity
    Velocity,
    /// Geographic consistency
    GeographicConsistency,
    /// Domain heuristics
    DomainPatterns,
    /// Pluggable model score
    ModelScore,
}

impl FactorKind {
    /// All factors in decision order
    pub const ALL: [FactorKind; 6] = [
        FactorKind::DeviceTrust,
        FactorKind::BehavioralPattern,
        FactorKind::Velocity,
        FactorKind::GeographicConsistency,
        FactorKind::DomainPatterns,
        FactorKind::ModelScore,
    ];

    /// Stable factor name
    pub fn as_str(&self) -> &'static str {
        match self {
            FactorKind::DeviceTrust => "device_trust",
            FactorKind::BehavioralPattern => "behavioral_pattern",
            FactorKind::Velocity => "velocity",
            FactorKind::GeographicConsistency => "geographic_consistency",
            FactorKind::DomainPatterns => "domain_patterns",
            FactorKind::ModelScore => "model_score",
        }
    }
}

/// Named contribution to a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    /// Factor
    pub kind: FactorKind,
    /// Weight in [0, 1]
    pub weight: f64,
    /// Contribution in [0, 100]
    pub score: f64,
    /// Human-readable description
    pub description: String,
}

impl RiskFactor {
    /// Create a factor, clamping the score into 0..=100
    pub fn new(kind: FactorKind, weight: f64, score: f64, description: impl Into<String>) -> Self {
        Self {
            kind,
            weight,
            score: if score.is_finite() { score.clamp(0.0, 100.0) } else { 100.0 },
            description: description.into(),
        }
    }

    /// weight × score
    pub fn weighted(&self) -> f64 {
        self.weight * self.score
    }
}

/// Source of a degraded signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    /// IP geolocation lookup
    Geolocation,
    /// IP reputation / anonymizer lookup
    IpReputation,
    /// Model provider
    Model,
}

impl SignalSource {
    /// Stable name, used as metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalSource::Geolocation => "geolocation",
            SignalSource::IpReputation => "ip_reputation",
            SignalSource::Model => "model",
        }
    }
}

/// Signal replaced by its documented default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedSignal {
    /// Which signal
    pub source: SignalSource,
    /// Why it degraded
    pub reason: String,
}

/// Advisory action attached to a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    /// High / very high tier
    ManualReview,
    /// Medium tier
    AdditionalAuthentication,
    /// Device factor above 50
    VerifyDevice,
    /// Velocity factor above 50
    ReviewVelocity,
    /// Geographic factor above 50
    VerifyLocation,
    /// Domain heuristics above 50
    ReviewPaymentPattern,
    /// Behavioral factor above 50
    ReviewBehavior,
    /// Model factor above 50
    ReviewModelScore,
    /// At least one signal degraded
    ReducedConfidence,
}

impl RecommendedAction {
    /// Factor-specific action for a factor contribution above 50
    pub fn for_factor(kind: FactorKind) -> Self {
        match kind {
            FactorKind::DeviceTrust => RecommendedAction::VerifyDevice,
            FactorKind::BehavioralPattern => RecommendedAction::ReviewBehavior,
            FactorKind::Velocity => RecommendedAction::ReviewVelocity,
            FactorKind::GeographicConsistency => RecommendedAction::VerifyLocation,
            FactorKind::DomainPatterns => RecommendedAction::ReviewPaymentPattern,
            FactorKind::ModelScore => RecommendedAction::ReviewModelScore,
        }
    }

    /// Human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            RecommendedAction::ManualReview => "block and require manual review",
            RecommendedAction::AdditionalAuthentication => "request additional authentication",
            RecommendedAction::VerifyDevice => "verify device ownership",
            RecommendedAction::ReviewVelocity => "review recent transaction velocity",
            RecommendedAction::VerifyLocation => "verify customer location",
            RecommendedAction::ReviewPaymentPattern => "review payment method and amount pattern",
            RecommendedAction::ReviewBehavior => "review deviation from customer behavior",
            RecommendedAction::ReviewModelScore => "review model risk estimate",
            RecommendedAction::ReducedConfidence => {
                "reduced confidence: one or more signals unavailable"
            }
        }
    }
}

impl fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Result of an evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskDecision {
    /// Evaluated transaction
    pub transaction_id: Uuid,
    /// Customer
    pub customer_id: String,
    /// Weighted score
    pub risk_score: RiskScore,
    /// Tier derived from the score
    pub risk_tier: RiskTier,
    /// Factors in fixed order
    pub factors: Vec<RiskFactor>,
    /// Ordered, deduplicated recommendations
    pub recommendations: Vec<RecommendedAction>,
    /// Signals that fell back to defaults
    pub degraded_signals: Vec<DegradedSignal>,
    /// Confidence in the decision (0-100)
    pub confidence: u8,
    /// Wall time spent evaluating
    pub evaluation_latency_ms: u64,
    /// Engine clock at evaluation
    pub evaluated_at: DateTime<Utc>,
}

impl RiskDecision {
    /// Σ weight × contribution before rounding
    pub fn weighted_sum(&self) -> f64 {
        self.factors.iter().map(RiskFactor::weighted).sum()
    }

    /// Factor by kind
    pub fn factor(&self, kind: FactorKind) -> Option<&RiskFactor> {
        self.factors.iter().find(|f| f.kind == kind)
    }

    /// Whether an action was recommended
    pub fn recommends(&self, action: RecommendedAction) -> bool {
        self.recommendations.contains(&action)
    }

    /// Recommendation texts in order
    pub fn recommendation_texts(&self) -> Vec<String> {
        self.recommendations.iter().map(ToString::to_string).collect()
    }

    /// Whether any signal degraded
    pub fn is_degraded(&self) -> bool {
        !self.degraded_signals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event() -> TransactionEvent {
        TransactionEvent::new(
            "alice@example.com",
            Decimal::from(150),
            "brl",
            PaymentMethod::CreditCard,
            Utc.with_ymd_and_hms(2026, 3, 7, 5, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_tier_boundaries_are_exclusive_upper_bounds() {
        let t = TierThresholds::default();
        assert_eq!(RiskTier::from_score(RiskScore::new(19), &t), RiskTier::VeryLow);
        assert_eq!(RiskTier::from_score(RiskScore::new(20), &t), RiskTier::Low);
        assert_eq!(RiskTier::from_score(RiskScore::new(40), &t), RiskTier::Medium);
        assert_eq!(RiskTier::from_score(RiskScore::new(59), &t), RiskTier::Medium);
        assert_eq!(RiskTier::from_score(RiskScore::new(60), &t), RiskTier::High);
        assert_eq!(RiskTier::from_score(RiskScore::new(80), &t), RiskTier::VeryHigh);
        assert_eq!(RiskTier::from(RiskScore::new(100)), RiskTier::VeryHigh);
    }

    #[test]
    fn test_score_clamping() {
        assert_eq!(RiskScore::new(250).score(), 100);
        assert_eq!(RiskScore::from_weighted(-3.0).score(), 0);
        assert_eq!(RiskScore::from_weighted(42.5).score(), 43);
        assert_eq!(RiskScore::from_weighted(f64::NAN).score(), 100);
    }

    #[test]
    fn test_validation() {
        let now = Utc.with_ymd_and_hms(2026, 3, 7, 5, 0, 0).unwrap();
        let config = EngineConfig::default();
        assert!(event().validate(now, &config).is_ok());

        let mut e = event();
        e.customer_id = "  ".to_string();
        assert!(e.validate(now, &config).unwrap_err().is_input_error());

        let mut e = event();
        e.amount = Decimal::ZERO;
        assert!(e.validate(now, &config).is_err());

        let mut e = event();
        e.timestamp = now + Duration::hours(1);
        assert!(e.validate(now, &config).is_err());
    }

    #[test]
    fn test_amount_limits() {
        let now = Utc.with_ymd_and_hms(2026, 3, 7, 5, 0, 0).unwrap();
        let config = EngineConfig::default();

        let mut e = event();
        e.amount = Decimal::MAX;
        assert!(e.validate(now, &config).unwrap_err().is_input_error());

        let mut e = event();
        e.amount = Decimal::new(1, 22);
        assert!(e.validate(now, &config).unwrap_err().is_input_error());

        // Trailing zeros do not count as decimal places
        let mut e = event();
        e.amount = Decimal::new(1_250_000_000, 8);
        assert!(e.validate(now, &config).is_ok());

        let mut e = event();
        e.amount = config.input.max_amount;
        assert!(e.validate(now, &config).is_ok());
    }

    #[test]
    fn test_utc_offset_limits() {
        let now = Utc.with_ymd_and_hms(2026, 3, 7, 5, 0, 0).unwrap();
        let config = EngineConfig::default();

        assert!(event().with_locale("pt-BR", 840).validate(now, &config).is_ok());
        assert!(event().with_locale("pt-BR", -841).validate(now, &config).is_err());
        let e = event().with_locale("pt-BR", i32::MAX);
        assert!(e.validate(now, &config).unwrap_err().is_input_error());

        // Local time never panics, even for unvalidated offsets
        assert_eq!(e.local_hour(0), 5);
    }

    #[test]
    fn test_local_hour_uses_offset() {
        let e = event();
        assert_eq!(e.currency, "BRL");
        assert_eq!(e.local_hour(0), 5);
        assert_eq!(e.local_hour(-180), 2);
        let e = e.with_locale("pt-BR", 60);
        assert_eq!(e.local_hour(-180), 6);
        // 2026-03-07 is a Saturday
        assert!(e.is_weekend(0));
    }
}
