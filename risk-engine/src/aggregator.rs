//! Risk aggregation
//!
//! `RiskAggregator` is the engine's entry point. One evaluation runs in two
//! phases:
//!
//! 1. **Score** - validate, read the profile and fingerprint, run the
//!    evaluators (collaborator-bound ones concurrently), weight and tier.
//!    Only the velocity windows change here, atomically with the check.
//! 2. **Update** - fold the transaction into the profile and record the
//!    device sighting. `assess` skips this phase.
//!
//! Store failures abort the evaluation. Everything else degrades.

use crate::audit::{DecisionLog, MemoryDecisionLog};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::device::{DeviceAssessment, DeviceFingerprint, DeviceRegistry, DeviceTrustEvaluator};
use crate::geo::{GeoAssessment, GeoCache, GeoConsistencyEvaluator, GeoResolver, IpIntelligence};
use crate::maintenance::{MaintenanceHandle, MaintenanceTargets};
use crate::metrics::EngineMetrics;
use crate::model::{extract_features, ModelScore, ModelScoreProvider};
use crate::pattern::PatternRiskEvaluator;
use crate::profile::{BehaviorProfile, BehaviorProfileStore};
use crate::store::{MemoryStore, RecordStore};
use crate::types::{
    DegradedSignal, FactorKind, RecommendedAction, RiskDecision, RiskFactor, RiskScore, RiskTier,
    SignalSource, TransactionEvent,
};
use crate::velocity::VelocityGuard;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Factors scoring above this get their own recommendation
const FACTOR_ALERT_THRESHOLD: f64 = 50.0;

/// Builder for [`RiskAggregator`]
///
/// Stores default to in-memory, the clock to the system clock and the
/// model to the built-in linear model.
pub struct RiskAggregatorBuilder {
    config: EngineConfig,
    resolver: Arc<dyn GeoResolver>,
    intelligence: Arc<dyn IpIntelligence>,
    clock: Arc<dyn Clock>,
    profile_store: Option<Arc<dyn RecordStore<BehaviorProfile>>>,
    fingerprint_store: Option<Arc<dyn RecordStore<DeviceFingerprint>>>,
    model: ModelScoreProvider,
    decision_log: Option<Arc<dyn DecisionLog>>,
}

impl RiskAggregatorBuilder {
    /// Start from a config and the two geo collaborators
    pub fn new(
        config: EngineConfig,
        resolver: Arc<dyn GeoResolver>,
        intelligence: Arc<dyn IpIntelligence>,
    ) -> Self {
        Self {
            config,
            resolver,
            intelligence,
            clock: Arc::new(SystemClock),
            profile_store: None,
            fingerprint_store: None,
            model: ModelScoreProvider::default(),
            decision_log: None,
        }
    }

    /// Time source
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Profile store
    pub fn profile_store(mut self, store: Arc<dyn RecordStore<BehaviorProfile>>) -> Self {
        self.profile_store = Some(store);
        self
    }

    /// Fingerprint store
    pub fn fingerprint_store(mut self, store: Arc<dyn RecordStore<DeviceFingerprint>>) -> Self {
        self.fingerprint_store = Some(store);
        self
    }

    /// Model provider
    pub fn model(mut self, model: ModelScoreProvider) -> Self {
        self.model = model;
        self
    }

    /// Sink for returned decisions
    pub fn decision_log(mut self, log: Arc<dyn DecisionLog>) -> Self {
        self.decision_log = Some(log);
        self
    }

    /// Validate the config and wire the engine
    pub fn build(self) -> Result<RiskAggregator> {
        self.config.validate()?;
        let config = self.config;

        let metrics = EngineMetrics::new()
            .map_err(|e| Error::Internal(format!("metrics registration failed: {}", e)))?;

        let profile_store: Arc<dyn RecordStore<BehaviorProfile>> = match self.profile_store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };
        let fingerprint_store: Arc<dyn RecordStore<DeviceFingerprint>> =
            match self.fingerprint_store {
                Some(store) => store,
                None => Arc::new(MemoryStore::new()),
            };
        let decisions: Arc<dyn DecisionLog> = match self.decision_log {
            Some(log) => log,
            None => Arc::new(MemoryDecisionLog::new()),
        };

        let evaluator_timeout = Duration::from_millis(config.timeouts.per_evaluator_ms);

        let profiles = Arc::new(BehaviorProfileStore::new(profile_store, &config));
        let registry = Arc::new(DeviceRegistry::new(
            fingerprint_store,
            config.device.clone(),
            config.market.clone(),
            config.profile.max_cas_retries,
        ));
        let device = DeviceTrustEvaluator::new(
            registry.clone(),
            config.device.clone(),
            config.market.clone(),
        );
        let geo = GeoConsistencyEvaluator::new(
            self.resolver,
            self.intelligence,
            self.clock.clone(),
            config.geo.clone(),
            config.market.clone(),
            evaluator_timeout,
        );

        info!(
            "Risk engine ready (market {}, model {:?}, evaluator timeout {:?})",
            config.market.domestic_country, self.model, evaluator_timeout
        );

        Ok(RiskAggregator {
            velocity: Arc::new(VelocityGuard::new(config.velocity.clone())),
            pattern: PatternRiskEvaluator::new(config.pattern.clone(), config.market.clone()),
            profiles,
            registry,
            device,
            geo,
            model: self.model,
            decisions,
            clock: self.clock,
            metrics,
            evaluator_timeout,
            config,
        })
    }
}

/// Everything the scoring phase produced
struct Scored {
    decision: RiskDecision,
    geo: GeoAssessment,
}

/// Multi-factor risk engine
pub struct RiskAggregator {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    profiles: Arc<BehaviorProfileStore>,
    registry: Arc<DeviceRegistry>,
    velocity: Arc<VelocityGuard>,
    device: DeviceTrustEvaluator,
    geo: GeoConsistencyEvaluator,
    pattern: PatternRiskEvaluator,
    model: ModelScoreProvider,
    decisions: Arc<dyn DecisionLog>,
    metrics: EngineMetrics,
    evaluator_timeout: Duration,
}

impl RiskAggregator {
    /// Start building an engine
    pub fn builder(
        config: EngineConfig,
        resolver: Arc<dyn GeoResolver>,
        intelligence: Arc<dyn IpIntelligence>,
    ) -> RiskAggregatorBuilder {
        RiskAggregatorBuilder::new(config, resolver, intelligence)
    }

    /// Score a transaction and fold it into the customer's state
    ///
    /// Returns `InvalidInput` for malformed events and `Store` when the
    /// profile or fingerprint store fails. Collaborator failures never
    /// surface here; they show up as degraded signals on the decision.
    pub async fn evaluate(&self, event: &TransactionEvent) -> Result<RiskDecision> {
        let started = Instant::now();
        let scored = self.score(event).await?;

        let fold = self.should_fold(scored.decision.risk_tier);
        if !fold {
            debug!(
                "Not folding {} into profile {} (tier {})",
                event.transaction_id,
                event.customer_id,
                scored.decision.risk_tier.as_str()
            );
        }

        let profile_update = async {
            if fold {
                self.profiles
                    .update(event, scored.decision.risk_score, scored.geo.location.as_ref())
                    .await
                    .map(|_| ())
            } else {
                Ok(())
            }
        };
        let sighting = async {
            match &event.device {
                Some(payload) => self
                    .registry
                    .record_sighting(
                        payload,
                        event.ip_address,
                        event.transaction_id,
                        event.timestamp,
                    )
                    .await
                    .map(|_| ()),
                None => Ok(()),
            }
        };
        tokio::try_join!(profile_update, sighting).map_err(|e| self.store_failure(event, e))?;

        Ok(self.finish(scored.decision, started).await)
    }

    /// Score a transaction without updating the profile or device registry
    ///
    /// Velocity registration is idempotent per transaction id, so repeating
    /// `assess` for the same event against unchanged state gives the same
    /// decision.
    pub async fn assess(&self, event: &TransactionEvent) -> Result<RiskDecision> {
        let started = Instant::now();
        let scored = self.score(event).await?;
        Ok(self.finish(scored.decision, started).await)
    }

    /// Read-only profile lookup for reporting
    pub async fn get_profile(&self, customer_id: &str) -> Result<Option<BehaviorProfile>> {
        self.profiles.get(customer_id).await
    }

    /// Spawn the background maintenance loop
    ///
    /// Must be called inside a tokio runtime.
    pub fn start_maintenance(&self) -> MaintenanceHandle {
        MaintenanceHandle::spawn(
            self.maintenance_targets(),
            Duration::from_secs(self.config.maintenance.interval_secs.max(1)),
        )
    }

    /// State the maintenance loop prunes
    pub fn maintenance_targets(&self) -> MaintenanceTargets {
        MaintenanceTargets {
            velocity: self.velocity.clone(),
            geo_cache: self.geo.cache().clone(),
            profiles: self.profiles.clone(),
            devices: self.registry.clone(),
            clock: self.clock.clone(),
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Metrics collector
    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Velocity windows
    pub fn velocity(&self) -> &Arc<VelocityGuard> {
        &self.velocity
    }

    /// Device registry
    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Geo lookup cache
    pub fn geo_cache(&self) -> &Arc<GeoCache> {
        self.geo.cache()
    }

    fn should_fold(&self, tier: RiskTier) -> bool {
        match self.config.profile.skip_update_at_tier {
            Some(skip_from) => tier < skip_from,
            None => true,
        }
    }

    fn store_failure(&self, event: &TransactionEvent, e: Error) -> Error {
        if e.is_store_error() {
            self.metrics.store_errors_total.inc();
            error!(
                "Store failure evaluating {} for {}: {}",
                event.transaction_id, event.customer_id, e
            );
        }
        e
    }

    async fn score(&self, event: &TransactionEvent) -> Result<Scored> {
        let evaluated_at = self.clock.now();

        if let Err(e) = event.validate(evaluated_at, &self.config) {
            self.metrics.input_rejections_total.inc();
            warn!("Rejected transaction {}: {}", event.transaction_id, e);
            return Err(e);
        }

        let (profile, device) = tokio::try_join!(
            self.profiles.get(&event.customer_id),
            self.device
                .evaluate(event.device.as_ref(), event.ip_address, event.timestamp),
        )
        .map_err(|e| self.store_failure(event, e))?;

        let behavior = self.profiles.assess(profile.as_ref(), event);

        let baseline = self.profiles.daily_baseline(profile.as_ref());
        let velocity = self.velocity.check_and_register(
            &event.customer_id,
            event.transaction_id,
            event.amount,
            event.timestamp,
            &baseline,
        );

        let pattern = self.pattern.evaluate(event);

        let features = extract_features(
            event,
            profile.as_ref(),
            device.new_device,
            &self.config.model,
            &self.config.market,
        );
        let (geo, model) = tokio::join!(
            self.geo.evaluate(event, profile.as_ref()),
            self.model.score(&features, self.evaluator_timeout),
        );

        let mut degraded = geo.degraded.clone();
        let model = match model {
            Ok(score) => score,
            Err(e) => {
                warn!(
                    "Model score for {} degraded: {}",
                    event.transaction_id, e
                );
                degraded.push(DegradedSignal {
                    source: SignalSource::Model,
                    reason: e.to_string(),
                });
                ModelScore {
                    risk_score: self.config.model.unavailable_default,
                    confidence: 0.0,
                }
            }
        };

        let factors: Vec<RiskFactor> = FactorKind::ALL
            .iter()
            .map(|&kind| {
                let (contribution, description) = match kind {
                    FactorKind::DeviceTrust => (device.contribution, device.describe()),
                    FactorKind::BehavioralPattern => (behavior.contribution, behavior.describe()),
                    FactorKind::Velocity => (velocity.contribution, velocity.describe()),
                    FactorKind::GeographicConsistency => (geo.contribution, geo.describe()),
                    FactorKind::DomainPatterns => (pattern.contribution, pattern.describe()),
                    FactorKind::ModelScore => (
                        model.risk_score,
                        format!(
                            "model risk {:.0} (confidence {:.0})",
                            model.risk_score, model.confidence
                        ),
                    ),
                };
                RiskFactor::new(kind, self.config.weights.weight(kind), contribution, description)
            })
            .collect();

        let risk_score = RiskScore::from_weighted(factors.iter().map(RiskFactor::weighted).sum());
        let risk_tier = RiskTier::from_score(risk_score, &self.config.tiers);
        let recommendations = recommend(risk_tier, &factors, !degraded.is_empty());
        let confidence = decision_confidence(&self.config, &device, &degraded, &model);

        Ok(Scored {
            decision: RiskDecision {
                transaction_id: event.transaction_id,
                customer_id: event.customer_id.clone(),
                risk_score,
                risk_tier,
                factors,
                recommendations,
                degraded_signals: degraded,
                confidence,
                evaluation_latency_ms: 0,
                evaluated_at,
            },
            geo,
        })
    }

    async fn finish(&self, mut decision: RiskDecision, started: Instant) -> RiskDecision {
        let elapsed = started.elapsed();
        decision.evaluation_latency_ms = elapsed.as_millis() as u64;

        if decision.evaluation_latency_ms > self.config.timeouts.latency_budget_ms {
            warn!(
                "Evaluation of {} took {}ms (budget {}ms)",
                decision.transaction_id,
                decision.evaluation_latency_ms,
                self.config.timeouts.latency_budget_ms
            );
        }

        self.metrics
            .record_decision(decision.risk_tier, elapsed.as_secs_f64());
        for signal in &decision.degraded_signals {
            self.metrics.record_degraded(signal.source);
        }

        info!(
            "Risk decision for {} (customer {}): score {} tier {} confidence {} in {}ms",
            decision.transaction_id,
            decision.customer_id,
            decision.risk_score,
            decision.risk_tier.as_str(),
            decision.confidence,
            decision.evaluation_latency_ms
        );

        if let Err(e) = self.decisions.append(&decision).await {
            error!(
                "Failed to append decision {} to the decision log: {}",
                decision.transaction_id, e
            );
        }

        decision
    }
}

/// Ordered, deduplicated recommendations
fn recommend(tier: RiskTier, factors: &[RiskFactor], degraded: bool) -> Vec<RecommendedAction> {
    let mut actions = Vec::new();
    let mut push = |action: RecommendedAction| {
        if !actions.contains(&action) {
            actions.push(action);
        }
    };

    match tier {
        RiskTier::High | RiskTier::VeryHigh => push(RecommendedAction::ManualReview),
        RiskTier::Medium => push(RecommendedAction::AdditionalAuthentication),
        RiskTier::Low | RiskTier::VeryLow => {}
    }

    for factor in factors {
        if factor.score > FACTOR_ALERT_THRESHOLD {
            push(RecommendedAction::for_factor(factor.kind));
        }
    }

    if degraded {
        push(RecommendedAction::ReducedConfidence);
    }

    actions
}

/// Weight-averaged certainty of the factors, on 0-100
///
/// A factor backed by a failed collaborator counts as 0, one with a
/// partially failed collaborator or a missing device payload as 0.5, and the
/// model factor as its own reported confidence.
fn decision_confidence(
    config: &EngineConfig,
    device: &DeviceAssessment,
    degraded: &[DegradedSignal],
    model: &ModelScore,
) -> u8 {
    let has = |source: SignalSource| degraded.iter().any(|d| d.source == source);

    let certainty = FactorKind::ALL
        .iter()
        .map(|&kind| {
            let c = match kind {
                FactorKind::DeviceTrust if device.fingerprint_hash.is_none() => 0.5,
                FactorKind::GeographicConsistency if has(SignalSource::Geolocation) => 0.0,
                FactorKind::GeographicConsistency if has(SignalSource::IpReputation) => 0.5,
                FactorKind::ModelScore => (model.confidence / 100.0).clamp(0.0, 1.0),
                _ => 1.0,
            };
            config.weights.weight(kind) * c
        })
        .sum::<f64>();

    (100.0 * certainty).round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::SignalError;
    use crate::geo::{StaticGeoResolver, StaticIpIntelligence};
    use crate::store::{CasOutcome, Versioned};
    use crate::types::{DevicePayload, GeoLocation, PaymentMethod};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::net::IpAddr;

    const HOME_IP: &str = "200.160.2.3";

    struct Fixture {
        engine: RiskAggregator,
        clock: Arc<ManualClock>,
        log: Arc<MemoryDecisionLog>,
    }

    fn start() -> DateTime<Utc> {
        // Wednesday, 14:00 in São Paulo
        Utc.with_ymd_and_hms(2026, 6, 3, 17, 0, 0).unwrap()
    }

    fn fixture(config: EngineConfig) -> Fixture {
        let resolver = StaticGeoResolver::new();
        resolver.insert(
            HOME_IP.parse().unwrap(),
            GeoLocation::country("BR")
                .with_place("SP", "Sao Paulo")
                .with_coordinates(-23.55, -46.63),
        );
        let intelligence = StaticIpIntelligence::new();
        let clock = Arc::new(ManualClock::new(start()));
        let log = Arc::new(MemoryDecisionLog::new());

        let engine = RiskAggregator::builder(config, Arc::new(resolver), Arc::new(intelligence))
            .clock(clock.clone())
            .decision_log(log.clone())
            .build()
            .unwrap();

        Fixture { engine, clock, log }
    }

    fn device() -> DevicePayload {
        DevicePayload {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0".to_string(),
            screen_resolution: Some("1920x1080".to_string()),
            timezone: Some("America/Sao_Paulo".to_string()),
            language: Some("pt-BR".to_string()),
            platform: Some("Linux x86_64".to_string()),
            canvas_hash: Some("c4nv4s".to_string()),
            webgl_hash: Some("w3bgl".to_string()),
            plugins: Vec::new(),
            webdriver: false,
        }
    }

    fn purchase(at: DateTime<Utc>) -> TransactionEvent {
        TransactionEvent::new(
            "carol@example.com",
            Decimal::from(15_000),
            "BRL",
            PaymentMethod::DebitCard,
            at,
        )
        .with_ip(HOME_IP.parse::<IpAddr>().unwrap())
        .with_device(device())
        .with_locale("pt-BR", -180)
    }

    struct BrokenStore;

    #[async_trait]
    impl<T: Clone + Send + Sync + 'static> RecordStore<T> for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<Versioned<T>>> {
            Err(Error::Store("connection refused".to_string()))
        }

        async fn put(&self, _key: &str, _value: T) -> Result<u64> {
            Err(Error::Store("connection refused".to_string()))
        }

        async fn compare_and_swap(
            &self,
            _key: &str,
            _expected: Option<u64>,
            _value: T,
        ) -> Result<CasOutcome<T>> {
            Err(Error::Store("connection refused".to_string()))
        }

        async fn remove(&self, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn len(&self) -> Result<usize> {
            Ok(0)
        }
    }

    struct DownResolver;

    #[async_trait]
    impl GeoResolver for DownResolver {
        async fn resolve(&self, _ip: IpAddr) -> std::result::Result<GeoLocation, SignalError> {
            Err(SignalError::Unavailable("resolver offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_decision_shape() {
        let f = fixture(EngineConfig::default());
        let decision = f.engine.evaluate(&purchase(start())).await.unwrap();

        let kinds: Vec<FactorKind> = decision.factors.iter().map(|x| x.kind).collect();
        assert_eq!(kinds, FactorKind::ALL.to_vec());
        assert!((decision.weighted_sum() - f64::from(decision.risk_score.score())).abs() <= 0.5);
        assert_eq!(
            decision.risk_tier,
            RiskTier::from_score(decision.risk_score, &f.engine.config().tiers)
        );
        assert_eq!(decision.evaluated_at, start());
        assert_eq!(
            decision.factor(FactorKind::BehavioralPattern).unwrap().score,
            35.0
        );
        assert_eq!(f.log.len(), 1);
        assert_eq!(
            f.engine
                .metrics()
                .evaluations_total
                .with_label_values(&[decision.risk_tier.as_str()])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_evaluate_updates_state_and_assess_does_not() {
        let f = fixture(EngineConfig::default());
        let first = purchase(start());

        f.engine.assess(&first).await.unwrap();
        assert!(f.engine.get_profile("carol@example.com").await.unwrap().is_none());

        f.engine.evaluate(&first).await.unwrap();
        let profile = f.engine.get_profile("carol@example.com").await.unwrap().unwrap();
        assert_eq!(profile.transaction_count, 1);
        let hash = crate::device::fingerprint_hash(&device());
        let fp = f.engine.devices().get(&hash).await.unwrap().unwrap();
        assert_eq!(fp.sighting_count, 1);

        // Re-evaluating the same transaction folds nothing new
        f.engine.evaluate(&first).await.unwrap();
        let profile = f.engine.get_profile("carol@example.com").await.unwrap().unwrap();
        assert_eq!(profile.transaction_count, 1);
    }

    #[tokio::test]
    async fn test_assess_is_repeatable() {
        let f = fixture(EngineConfig::default());
        f.engine.evaluate(&purchase(start())).await.unwrap();
        f.clock.advance(chrono::Duration::hours(2));

        let next = purchase(start() + chrono::Duration::hours(2));
        let a = f.engine.assess(&next).await.unwrap();
        let b = f.engine.assess(&next).await.unwrap();
        assert_eq!(a.risk_score, b.risk_score);
        assert_eq!(a.factors, b.factors);
    }

    #[tokio::test]
    async fn test_invalid_input_rejected_before_scoring() {
        let f = fixture(EngineConfig::default());
        let mut event = purchase(start());
        event.amount = Decimal::ZERO;

        let err = f.engine.evaluate(&event).await.unwrap_err();
        assert!(err.is_input_error());
        assert_eq!(f.engine.metrics().input_rejections_total.get(), 1);
        assert_eq!(f.engine.velocity().tracked_customers(), 0);
        assert!(f.log.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_amounts_rejected() {
        let f = fixture(EngineConfig::default());

        let mut tiny = purchase(start());
        tiny.amount = Decimal::new(1, 22);
        assert!(f.engine.evaluate(&tiny).await.unwrap_err().is_input_error());

        let mut huge = purchase(start());
        huge.amount = Decimal::MAX;
        assert!(f.engine.evaluate(&huge).await.unwrap_err().is_input_error());

        let mut offset = purchase(start());
        offset.utc_offset_minutes = Some(i32::MAX);
        assert!(f.engine.evaluate(&offset).await.unwrap_err().is_input_error());

        assert_eq!(f.engine.metrics().input_rejections_total.get(), 3);
        assert!(f.log.is_empty());

        // A valid amount after the rejections still scores normally
        f.engine.evaluate(&purchase(start())).await.unwrap();
        assert_eq!(f.log.len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_fatal() {
        let engine = RiskAggregator::builder(
            EngineConfig::default(),
            Arc::new(StaticGeoResolver::new()),
            Arc::new(StaticIpIntelligence::new()),
        )
        .clock(Arc::new(ManualClock::new(start())))
        .profile_store(Arc::new(BrokenStore))
        .build()
        .unwrap();

        let err = engine.evaluate(&purchase(start())).await.unwrap_err();
        assert!(err.is_store_error());
        assert_eq!(engine.metrics().store_errors_total.get(), 1);
    }

    #[tokio::test]
    async fn test_geo_outage_degrades() {
        let engine = RiskAggregator::builder(
            EngineConfig::default(),
            Arc::new(DownResolver),
            Arc::new(StaticIpIntelligence::new()),
        )
        .clock(Arc::new(ManualClock::new(start())))
        .build()
        .unwrap();

        let decision = engine.evaluate(&purchase(start())).await.unwrap();
        assert_eq!(
            decision.factor(FactorKind::GeographicConsistency).unwrap().score,
            15.0
        );
        assert!(decision.is_degraded());
        assert!(decision.recommends(RecommendedAction::ReducedConfidence));
        // Geo carries 0.15 of the weight
        assert!(decision.confidence <= 85);
        assert_eq!(
            engine
                .metrics()
                .degraded_signals_total
                .with_label_values(&["geolocation"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_skip_update_at_tier() {
        let mut config = EngineConfig::default();
        config.profile.skip_update_at_tier = Some(RiskTier::VeryLow);
        let f = fixture(config);

        f.engine.evaluate(&purchase(start())).await.unwrap();
        assert!(f.engine.get_profile("carol@example.com").await.unwrap().is_none());
        // The device sighting is still recorded
        assert!(f
            .engine
            .devices()
            .get(&crate::device::fingerprint_hash(&device()))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_invalid_weights_rejected_at_build() {
        let mut config = EngineConfig::default();
        config.weights.velocity = 0.9;
        let built = RiskAggregator::builder(
            config,
            Arc::new(StaticGeoResolver::new()),
            Arc::new(StaticIpIntelligence::new()),
        )
        .build();
        assert!(matches!(built, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_maintenance_prunes_idle_state() {
        let f = fixture(EngineConfig::default());
        f.engine.evaluate(&purchase(start())).await.unwrap();
        assert_eq!(f.engine.velocity().tracked_customers(), 1);
        assert_eq!(f.engine.geo_cache().len(), 2);

        f.clock.advance(chrono::Duration::days(2));
        let report = f.engine.maintenance_targets().run_once();
        assert_eq!(report.idle_customers, 1);
        assert_eq!(report.expired_cache_entries, 2);
        assert_eq!(f.engine.velocity().tracked_customers(), 0);

        let handle = f.engine.start_maintenance();
        assert!(!handle.is_finished());
        handle.shutdown().await.unwrap();
    }

    #[test]
    fn test_recommendations_are_ordered_and_deduplicated() {
        let factors = vec![
            RiskFactor::new(FactorKind::DeviceTrust, 0.15, 70.0, ""),
            RiskFactor::new(FactorKind::Velocity, 0.20, 50.0, ""),
            RiskFactor::new(FactorKind::GeographicConsistency, 0.15, 90.0, ""),
        ];
        assert_eq!(
            recommend(RiskTier::High, &factors, true),
            vec![
                RecommendedAction::ManualReview,
                RecommendedAction::VerifyDevice,
                RecommendedAction::VerifyLocation,
                RecommendedAction::ReducedConfidence,
            ]
        );
        assert_eq!(
            recommend(RiskTier::Medium, &[], false),
            vec![RecommendedAction::AdditionalAuthentication]
        );
        assert!(recommend(RiskTier::Low, &[], false).is_empty());
    }

    #[test]
    fn test_confidence() {
        let config = EngineConfig::default();
        let known = DeviceAssessment {
            contribution: 0.0,
            fingerprint_hash: Some("abc".to_string()),
            new_device: false,
            trust_score: Some(100.0),
            ip_penalty: 0.0,
            indicators: Vec::new(),
        };
        let sure = ModelScore {
            risk_score: 10.0,
            confidence: 100.0,
        };
        assert_eq!(decision_confidence(&config, &known, &[], &sure), 100);

        let geo_down = [DegradedSignal {
            source: SignalSource::Geolocation,
            reason: "timed out after 150ms".to_string(),
        }];
        let unsure = ModelScore {
            risk_score: 50.0,
            confidence: 0.0,
        };
        assert_eq!(decision_confidence(&config, &known, &geo_down, &unsure), 75);
    }
}
