//! Configuration for the risk engine
//!
//! All thresholds and weights are defaults, not calibrated constants. Every
//! section is `#[serde(default)]`, so a TOML file only needs the keys it
//! overrides. Decimal amounts are written as strings (`"50000"`).

use crate::types::{FactorKind, PaymentMethod, RiskTier};
use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How far an event timestamp may run ahead of the engine clock
    pub max_clock_skew_secs: i64,

    /// Bounds on caller-supplied event fields
    pub input: InputLimits,

    /// Factor weights
    pub weights: ScoringWeights,

    /// Tier thresholds
    pub tiers: TierThresholds,

    /// Velocity limits
    pub velocity: VelocityConfig,

    /// Device trust
    pub device: DeviceConfig,

    /// Geographic consistency
    pub geo: GeoConfig,

    /// Domain heuristics
    pub pattern: PatternConfig,

    /// Expected market
    pub market: MarketConfig,

    /// Behavior profiles
    pub profile: ProfileConfig,

    /// Model provider
    pub model: ModelConfig,

    /// Evaluation time budgets
    pub timeouts: TimeoutConfig,

    /// Logging
    pub logging: LoggingConfig,

    /// Durable storage
    pub storage: StorageConfig,

    /// Background maintenance
    pub maintenance: MaintenanceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_clock_skew_secs: 300,
            input: InputLimits::default(),
            weights: ScoringWeights::default(),
            tiers: TierThresholds::default(),
            velocity: VelocityConfig::default(),
            device: DeviceConfig::default(),
            geo: GeoConfig::default(),
            pattern: PatternConfig::default(),
            market: MarketConfig::default(),
            profile: ProfileConfig::default(),
            model: ModelConfig::default(),
            timeouts: TimeoutConfig::default(),
            logging: LoggingConfig::default(),
            storage: StorageConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

/// Weight per factor; must sum to 1.0
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// Device trust
    pub device_trust: f64,
    /// Behavioral pattern
    pub behavioral_pattern: f64,
    /// Velocity
    pub velocity: f64,
    /// Geographic consistency
    pub geographic_consistency: f64,
    /// Domain heuristics
    pub domain_patterns: f64,
    /// Model score
    pub model_score: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            device_trust: 0.15,
            behavioral_pattern: 0.25,
            velocity: 0.20,
            geographic_consistency: 0.15,
            domain_patterns: 0.15,
            model_score: 0.10,
        }
    }
}

impl ScoringWeights {
    /// Weight for a factor
    pub fn weight(&self, kind: FactorKind) -> f64 {
        match kind {
            FactorKind::DeviceTrust => self.device_trust,
            FactorKind::BehavioralPattern => self.behavioral_pattern,
            FactorKind::Velocity => self.velocity,
            FactorKind::GeographicConsistency => self.geographic_consistency,
            FactorKind::DomainPatterns => self.domain_patterns,
            FactorKind::ModelScore => self.model_score,
        }
    }

    /// Sum of all weights
    pub fn total(&self) -> f64 {
        FactorKind::ALL.iter().map(|k| self.weight(*k)).sum()
    }
}

/// Exclusive upper bounds per tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierThresholds {
    /// Scores below this are VERY_LOW
    pub very_low_below: u8,
    /// Scores below this are LOW
    pub low_below: u8,
    /// Scores below this are MEDIUM
    pub medium_below: u8,
    /// Scores below this are HIGH; the rest VERY_HIGH
    pub high_below: u8,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            very_low_below: 20,
            low_below: 40,
            medium_below: 60,
            high_below: 80,
        }
    }
}

/// Velocity limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VelocityConfig {
    /// Transactions allowed in the 1-minute window
    pub max_per_minute: u32,

    /// Transactions allowed in the 1-hour window
    pub max_per_hour: u32,

    /// Cumulative amount allowed in the 1-hour window
    pub max_amount_per_hour: Decimal,

    /// Gap below which consecutive transactions count as rapid-fire
    pub rapid_gap_secs: i64,

    /// Rapid-fire fires once more than this many transactions are chained
    pub rapid_min_transactions: u32,

    /// Daily count above this multiple of the historical average escalates
    pub daily_count_multiplier: f64,

    /// Daily amount above this multiple of the historical average escalates
    pub daily_amount_multiplier: f64,

    /// Daily count assumed for customers without history
    pub prior_daily_count: f64,

    /// Daily amount assumed for customers without history
    pub prior_daily_amount: Decimal,
}

impl Default for VelocityConfig {
    fn default() -> Self {
        Self {
            max_per_minute: 5,
            max_per_hour: 10,
            max_amount_per_hour: Decimal::from(50_000),
            rapid_gap_secs: 30,
            rapid_min_transactions: 5,
            daily_count_multiplier: 3.0,
            daily_amount_multiplier: 5.0,
            prior_daily_count: 2.0,
            prior_daily_amount: Decimal::from(5_000),
        }
    }
}

/// Device trust
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Risk for a never-seen fingerprint
    pub new_device_risk: f64,

    /// Risk when the event carries no device payload
    pub missing_payload_risk: f64,

    /// Window for the distinct-IP ratio
    pub ip_window_days: i64,

    /// IP history kept per fingerprint
    pub max_ip_history: usize,

    /// Devices younger than this lose trust
    pub young_device_hours: i64,

    /// Indicator tags kept per fingerprint
    pub max_indicators: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            new_device_risk: 45.0,
            missing_payload_risk: 50.0,
            ip_window_days: 7,
            max_ip_history: 20,
            young_device_hours: 24,
            max_indicators: 16,
        }
    }
}

/// Geographic consistency
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// Contribution when the IP cannot be geolocated
    pub unavailable_default: f64,

    /// Partial contribution when the reputation lookup fails
    pub reputation_unavailable_penalty: f64,

    /// Service only operates in the domestic market
    pub domestic_only: bool,

    /// Fastest plausible travel between two sightings
    pub max_travel_speed_kmh: f64,

    /// Lookup cache lifetime
    pub cache_ttl_secs: i64,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            unavailable_default: 15.0,
            reputation_unavailable_penalty: 10.0,
            domestic_only: true,
            max_travel_speed_kmh: 900.0,
            cache_ttl_secs: 3600,
        }
    }
}

/// Domain heuristics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Amounts at or above this are "large"
    pub large_amount_threshold: Decimal,

    /// Amounts at or below this are checked for card-testing patterns
    pub card_testing_ceiling: Decimal,

    /// Smallest plausible value of a single installment
    pub min_installment_value: Decimal,

    /// Credit-card amounts above this are normally split
    pub multi_installment_norm_amount: Decimal,

    /// Typical ceiling per payment method, keyed by method name
    pub method_ceilings: BTreeMap<String, Decimal>,
}

impl Default for PatternConfig {
    fn default() -> Self {
        let method_ceilings = [
            (PaymentMethod::CashVoucher, 3_000),
            (PaymentMethod::DebitCard, 20_000),
            (PaymentMethod::DigitalWallet, 25_000),
            (PaymentMethod::CreditCard, 50_000),
            (PaymentMethod::InstantTransfer, 100_000),
            (PaymentMethod::BankTransfer, 500_000),
        ]
        .into_iter()
        .map(|(method, ceiling)| (method.as_str().to_string(), Decimal::from(ceiling)))
        .collect();

        Self {
            large_amount_threshold: Decimal::from(10_000),
            card_testing_ceiling: Decimal::from(10),
            min_installment_value: Decimal::from(50),
            multi_installment_norm_amount: Decimal::from(20_000),
            method_ceilings,
        }
    }
}

impl PatternConfig {
    /// Ceiling for a method, if configured
    pub fn ceiling(&self, method: PaymentMethod) -> Option<Decimal> {
        self.method_ceilings.get(method.as_str()).copied()
    }
}

/// Market the service expects its customers in
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Domestic country code
    pub domestic_country: String,

    /// Settlement currency
    pub currency: String,

    /// Expected client locales
    pub expected_locales: Vec<String>,

    /// Expected IANA time zones
    pub expected_timezones: Vec<String>,

    /// UTC offset assumed when the event carries none
    pub default_utc_offset_minutes: i32,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            domestic_country: "BR".to_string(),
            currency: "BRL".to_string(),
            expected_locales: vec!["pt-BR".to_string()],
            expected_timezones: [
                "America/Sao_Paulo",
                "America/Bahia",
                "America/Fortaleza",
                "America/Recife",
                "America/Belem",
                "America/Manaus",
                "America/Cuiaba",
                "America/Porto_Velho",
                "America/Rio_Branco",
                "America/Noronha",
            ]
            .iter()
            .map(|tz| tz.to_string())
            .collect(),
            default_utc_offset_minutes: -180,
        }
    }
}

impl MarketConfig {
    /// Case-insensitive locale check
    pub fn is_expected_locale(&self, locale: &str) -> bool {
        self.expected_locales
            .iter()
            .any(|l| l.eq_ignore_ascii_case(locale))
    }

    /// Exact time zone check
    pub fn is_expected_timezone(&self, timezone: &str) -> bool {
        self.expected_timezones.iter().any(|tz| tz == timezone)
    }

    /// Whether a country is the domestic market
    pub fn is_domestic(&self, country: &str) -> bool {
        self.domestic_country.eq_ignore_ascii_case(country)
    }
}

/// Behavior profiles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Behavioral contribution for a customer without a profile
    pub new_customer_baseline: f64,

    /// Smoothing factor of the running amount average
    pub ema_alpha: f64,

    /// Transactions per day assumed before any cadence is observed
    pub frequency_prior_per_day: f64,

    /// Preferred methods kept per profile
    pub max_preferred_methods: usize,

    /// Locations kept per profile
    pub max_known_locations: usize,

    /// Applied transaction ids remembered for idempotency
    pub recent_transaction_ids: usize,

    /// History needed before hour / method novelty counts
    pub min_history: u64,

    /// CAS attempts before an update fails
    pub max_cas_retries: u32,

    /// Skip folding transactions at or above this tier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_update_at_tier: Option<RiskTier>,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            new_customer_baseline: 35.0,
            ema_alpha: 0.2,
            frequency_prior_per_day: 1.0,
            max_preferred_methods: 5,
            max_known_locations: 10,
            recent_transaction_ids: 32,
            min_history: 3,
            max_cas_retries: 5,
            skip_update_at_tier: None,
        }
    }
}

/// Model provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Contribution when the model cannot score
    pub unavailable_default: f64,

    /// Amount that normalizes to 1.0
    pub amount_reference: Decimal,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            unavailable_default: 50.0,
            amount_reference: Decimal::from(10_000),
        }
    }
}

/// Evaluation time budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Budget per sub-evaluator
    pub per_evaluator_ms: u64,

    /// Budget for a whole evaluation (logged when exceeded)
    pub latency_budget_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            per_evaluator_ms: 150,
            latency_budget_ms: 500,
        }
    }
}

/// Logging
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (RUST_LOG wins)
    pub level: String,

    /// Emit JSON lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Durable storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory for the durable store
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/risk-engine"),
        }
    }
}

/// Background maintenance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Interval between maintenance passes
    pub interval_secs: u64,
}

/// Accepted ranges for event fields
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputLimits {
    /// Largest accepted amount
    pub max_amount: Decimal,
    /// Most decimal places an amount may carry after normalization
    pub max_amount_scale: u32,
    /// Largest accepted client UTC offset, either direction
    pub max_utc_offset_minutes: i32,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_amount: Decimal::from(1_000_000_000_000i64),
            max_amount_scale: 4,
            max_utc_offset_minutes: 14 * 60,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl EngineConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `RISK_ENGINE_CONFIG` (if set) and apply `RISK_ENGINE_*` overrides
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("RISK_ENGINE_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => EngineConfig::default(),
        };

        if let Ok(country) = std::env::var("RISK_ENGINE_DOMESTIC_COUNTRY") {
            config.market.domestic_country = country.to_uppercase();
        }

        if let Ok(dir) = std::env::var("RISK_ENGINE_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(dir);
        }

        if let Ok(level) = std::env::var("RISK_ENGINE_LOG_LEVEL") {
            config.logging.level = level;
        }

        if let Ok(json) = std::env::var("RISK_ENGINE_LOG_JSON") {
            config.logging.json = parse_env("RISK_ENGINE_LOG_JSON", &json)?;
        }

        if let Ok(ms) = std::env::var("RISK_ENGINE_EVALUATOR_TIMEOUT_MS") {
            config.timeouts.per_evaluator_ms = parse_env("RISK_ENGINE_EVALUATOR_TIMEOUT_MS", &ms)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        for kind in FactorKind::ALL {
            let w = self.weights.weight(kind);
            if !(0.0..=1.0).contains(&w) {
                return Err(Error::Config(format!(
                    "weight for {} must be in [0, 1], got {}",
                    kind.as_str(),
                    w
                )));
            }
        }

        let total = self.weights.total();
        if (total - 1.0).abs() > 1e-6 {
            return Err(Error::Config(format!("weights must sum to 1.0, got {}", total)));
        }

        let t = &self.tiers;
        if !(t.very_low_below < t.low_below
            && t.low_below < t.medium_below
            && t.medium_below < t.high_below
            && t.high_below <= 100)
        {
            return Err(Error::Config(
                "tier thresholds must be strictly increasing and at most 100".to_string(),
            ));
        }

        if self.timeouts.per_evaluator_ms == 0 {
            return Err(Error::Config("per_evaluator_ms must be positive".to_string()));
        }

        if !(0.0..=1.0).contains(&self.profile.ema_alpha) || self.profile.ema_alpha == 0.0 {
            return Err(Error::Config("profile.ema_alpha must be in (0, 1]".to_string()));
        }

        if self.profile.frequency_prior_per_day <= 0.0 {
            return Err(Error::Config(
                "profile.frequency_prior_per_day must be positive".to_string(),
            ));
        }

        if self.input.max_amount <= Decimal::ZERO {
            return Err(Error::Config("input.max_amount must be positive".to_string()));
        }

        if !(0..=14 * 60).contains(&self.input.max_utc_offset_minutes) {
            return Err(Error::Config(
                "input.max_utc_offset_minutes must be in [0, 840]".to_string(),
            ));
        }

        if self.model.amount_reference <= Decimal::ZERO {
            return Err(Error::Config("model.amount_reference must be positive".to_string()));
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{} has invalid value '{}'", name, value)))
}
