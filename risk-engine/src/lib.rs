//! Fraud risk engine
//!
//! Real-time multi-factor risk scoring for payment transactions, with a
//! rolling behavioral profile per customer.
//!
//! ```no_run
//! use fraud_risk_engine::{EngineConfig, RiskAggregator, StaticGeoResolver, StaticIpIntelligence};
//! use std::sync::Arc;
//!
//! # async fn run(event: fraud_risk_engine::TransactionEvent) -> fraud_risk_engine::Result<()> {
//! let engine = RiskAggregator::builder(
//!     EngineConfig::from_env()?,
//!     Arc::new(StaticGeoResolver::new()),
//!     Arc::new(StaticIpIntelligence::new()),
//! )
//! .build()?;
//!
//! let decision = engine.evaluate(&event).await?;
//! println!("{} {}", decision.risk_score, decision.risk_tier.as_str());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregator;
pub mod audit;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod geo;
pub mod maintenance;
pub mod metrics;
pub mod model;
pub mod pattern;
pub mod profile;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod velocity;

pub use aggregator::{RiskAggregator, RiskAggregatorBuilder};
pub use audit::{DecisionLog, JsonlDecisionLog, MemoryDecisionLog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use device::{DeviceFingerprint, DeviceRegistry, DeviceTrustEvaluator};
pub use error::{Error, Result, SignalError};
pub use geo::{
    GeoConsistencyEvaluator, GeoResolver, IpIntelligence, IpReputation, StaticGeoResolver,
    StaticIpIntelligence,
};
pub use maintenance::MaintenanceHandle;
pub use metrics::EngineMetrics;
pub use model::{FeatureVector, LearnedModel, LinearModel, ModelScore, ModelScoreProvider};
pub use pattern::PatternRiskEvaluator;
pub use profile::{BehaviorProfile, BehaviorProfileStore};
pub use store::{MemoryStore, RecordStore};
pub use telemetry::init_tracing;
pub use types::*;
pub use velocity::VelocityGuard;
