//! Behavior profiles
//!
//! A profile is a compact running summary of one customer's transactions.
//! It is folded forward one transaction at a time and never rebuilt from
//! history. Folding is idempotent per transaction id and serialized per
//! customer; the commit itself is a compare-and-swap so two engine instances
//! sharing a durable store cannot lose each other's updates.

use crate::config::{EngineConfig, ProfileConfig, TierThresholds, VelocityConfig};
use crate::store::{CasOutcome, KeyedLocks, RecordStore};
use crate::types::{GeoLocation, PaymentMethod, RiskScore, RiskTier, TransactionEvent};
use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

const SECONDS_PER_DAY: f64 = 86_400.0;

// Share of an hour bucket (or method) at which it stops looking unusual
const FAMILIAR_SHARE: f64 = 0.10;

/// Usage count of a payment method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodUsage {
    /// Method
    pub method: PaymentMethod,
    /// Transactions paid with it
    pub count: u64,
}

/// Location the customer has transacted from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownLocation {
    /// Location (latest coordinates win)
    pub location: GeoLocation,
    /// Transactions seen there
    pub count: u64,
    /// Most recent sighting
    pub last_seen: DateTime<Utc>,
}

/// Running summary of a customer's behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorProfile {
    /// Customer
    pub customer_id: String,
    /// Transactions folded in
    pub transaction_count: u64,
    /// Smallest amount seen
    pub min_amount: Decimal,
    /// Largest amount seen
    pub max_amount: Decimal,
    /// Exponential moving average of amounts, kept within [min, max]
    pub average_amount: Decimal,
    /// Sum of all amounts
    pub total_amount: Decimal,
    /// Most used methods, by count descending
    pub preferred_methods: Vec<MethodUsage>,
    /// Transactions per local hour of day
    pub hour_histogram: [u64; 24],
    /// Moving average of seconds between transactions
    pub mean_interarrival_secs: Option<f64>,
    /// Estimated transactions per day
    pub transactions_per_day: f64,
    /// First transaction time
    pub first_transaction_at: Option<DateTime<Utc>>,
    /// Latest transaction time
    pub last_transaction_at: Option<DateTime<Utc>>,
    /// Distinct UTC days with at least one transaction
    pub active_days: u64,
    /// Latest UTC day counted in `active_days`
    pub current_day: Option<NaiveDate>,
    /// Bounded set of locations, by count descending
    pub known_locations: Vec<KnownLocation>,
    /// Most recent resolved location
    pub last_location: Option<GeoLocation>,
    /// When `last_location` was observed
    pub last_location_at: Option<DateTime<Utc>>,
    /// Amount deviation (0-100) of the latest transaction against the prior average
    pub last_deviation_score: f64,
    /// Score of the latest folded transaction
    pub last_risk_score: u8,
    /// Transactions folded in while rated HIGH or above
    pub high_risk_transactions: u64,
    /// Recently applied transaction ids
    pub recent_transaction_ids: VecDeque<Uuid>,
}

impl BehaviorProfile {
    /// Profile with no transactions folded in
    pub fn empty(customer_id: impl Into<String>, config: &ProfileConfig) -> Self {
        Self {
            customer_id: customer_id.into(),
            transaction_count: 0,
            min_amount: Decimal::ZERO,
            max_amount: Decimal::ZERO,
            average_amount: Decimal::ZERO,
            total_amount: Decimal::ZERO,
            preferred_methods: Vec::new(),
            hour_histogram: [0; 24],
            mean_interarrival_secs: None,
            transactions_per_day: config.frequency_prior_per_day,
            first_transaction_at: None,
            last_transaction_at: None,
            active_days: 0,
            current_day: None,
            known_locations: Vec::new(),
            last_location: None,
            last_location_at: None,
            last_deviation_score: 0.0,
            last_risk_score: 0,
            high_risk_transactions: 0,
            recent_transaction_ids: VecDeque::new(),
        }
    }

    /// Whether no transaction has been folded in yet
    pub fn is_new(&self) -> bool {
        self.transaction_count == 0
    }

    /// Whether this transaction id was already folded in
    pub fn has_applied(&self, transaction_id: &Uuid) -> bool {
        self.recent_transaction_ids.contains(transaction_id)
    }

    /// `min ≤ average ≤ max` and the hour histogram sums to the transaction count
    pub fn invariants_hold(&self) -> bool {
        let bounds = self.min_amount <= self.average_amount && self.average_amount <= self.max_amount;
        let histogram: u64 = self.hour_histogram.iter().sum();
        bounds && histogram == self.transaction_count
    }

    /// Share of transactions paid with `method`
    pub fn method_share(&self, method: PaymentMethod) -> Option<f64> {
        if self.transaction_count == 0 {
            return None;
        }
        self.preferred_methods
            .iter()
            .find(|m| m.method == method)
            .map(|m| m.count as f64 / self.transaction_count as f64)
    }

    /// Fold one transaction into the profile
    pub fn fold(&mut self, obs: &Observation<'_>, config: &ProfileConfig) {
        let event = obs.event;
        if self.has_applied(&event.transaction_id) {
            return;
        }

        let amount = event.amount;
        self.last_deviation_score = if self.is_new() {
            0.0
        } else {
            amount_deviation(amount, self.average_amount)
        };

        if self.is_new() {
            self.min_amount = amount;
            self.max_amount = amount;
            self.average_amount = amount;
            self.first_transaction_at = Some(event.timestamp);
            self.transactions_per_day = config.frequency_prior_per_day;
        } else {
            self.min_amount = self.min_amount.min(amount);
            self.max_amount = self.max_amount.max(amount);
            let alpha = Decimal::from_f64_retain(config.ema_alpha).unwrap_or(Decimal::ONE);
            let ema = amount
                .checked_sub(self.average_amount)
                .and_then(|diff| alpha.checked_mul(diff))
                .and_then(|step| self.average_amount.checked_add(step))
                .unwrap_or(amount);
            self.average_amount = ema.round_dp(6);
            self.fold_cadence(event.timestamp, config);
        }
        // Rounding may push the average a hair outside the bounds
        self.average_amount = self.average_amount.clamp(self.min_amount, self.max_amount);
        self.total_amount = self.total_amount.saturating_add(amount);

        self.fold_method(event.payment_method, config.max_preferred_methods);
        self.hour_histogram[(obs.local_hour % 24) as usize] += 1;
        self.transaction_count += 1;
        self.fold_day(event.timestamp);

        if let Some(location) = obs.location {
            self.fold_location(location, event.timestamp, config.max_known_locations);
        }

        self.last_risk_score = obs.risk_score.score();
        if obs.risk_tier >= RiskTier::High {
            self.high_risk_transactions += 1;
        }

        if self.last_transaction_at.map_or(true, |last| event.timestamp > last) {
            self.last_transaction_at = Some(event.timestamp);
        }

        self.recent_transaction_ids.push_back(event.transaction_id);
        while self.recent_transaction_ids.len() > config.recent_transaction_ids.max(1) {
            self.recent_transaction_ids.pop_front();
        }
    }

    fn fold_cadence(&mut self, timestamp: DateTime<Utc>, config: &ProfileConfig) {
        let Some(last) = self.last_transaction_at else {
            return;
        };
        // Out-of-order events count as simultaneous
        let gap = (timestamp - last).num_seconds().max(0) as f64;
        let mean = match self.mean_interarrival_secs {
            Some(mean) => mean + config.ema_alpha * (gap - mean),
            None => gap,
        };
        self.mean_interarrival_secs = Some(mean);
        self.transactions_per_day = SECONDS_PER_DAY / mean.max(1.0);
    }

    fn fold_method(&mut self, method: PaymentMethod, capacity: usize) {
        if let Some(usage) = self.preferred_methods.iter_mut().find(|m| m.method == method) {
            usage.count += 1;
        } else if self.preferred_methods.len() < capacity.max(1) {
            self.preferred_methods.push(MethodUsage { method, count: 1 });
        } else if let Some(least) = self.preferred_methods.last_mut() {
            // Evict the least used
            *least = MethodUsage { method, count: 1 };
        }
        self.preferred_methods.sort_by(|a, b| b.count.cmp(&a.count));
    }

    fn fold_day(&mut self, timestamp: DateTime<Utc>) {
        let day = timestamp.date_naive();
        match self.current_day {
            Some(current) if day <= current => {}
            _ => {
                self.current_day = Some(day);
                self.active_days += 1;
            }
        }
    }

    fn fold_location(&mut self, location: &GeoLocation, seen_at: DateTime<Utc>, capacity: usize) {
        let existing = self.known_locations.iter_mut().find(|k| {
            k.location.country == location.country
                && k.location.region == location.region
                && k.location.city == location.city
        });

        match existing {
            Some(known) => {
                known.count += 1;
                known.last_seen = known.last_seen.max(seen_at);
                if location.coordinates().is_some() {
                    known.location.latitude = location.latitude;
                    known.location.longitude = location.longitude;
                }
            }
            None => {
                if self.known_locations.len() >= capacity.max(1) {
                    // Evict the least used, oldest first on ties
                    if let Some(idx) = self
                        .known_locations
                        .iter()
                        .enumerate()
                        .min_by(|(_, a), (_, b)| {
                            a.count.cmp(&b.count).then(a.last_seen.cmp(&b.last_seen))
                        })
                        .map(|(idx, _)| idx)
                    {
                        self.known_locations.remove(idx);
                    }
                }
                self.known_locations.push(KnownLocation {
                    location: location.clone(),
                    count: 1,
                    last_seen: seen_at,
                });
            }
        }
        self.known_locations.sort_by(|a, b| b.count.cmp(&a.count));

        if self.last_location_at.map_or(true, |at| seen_at >= at) {
            self.last_location = Some(location.clone());
            self.last_location_at = Some(seen_at);
        }
    }
}

/// One transaction as seen by the profile fold
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    /// The transaction
    pub event: &'a TransactionEvent,
    /// Local hour of day
    pub local_hour: u32,
    /// Score the transaction received
    pub risk_score: RiskScore,
    /// Tier the transaction received
    pub risk_tier: RiskTier,
    /// Resolved location, if any
    pub location: Option<&'a GeoLocation>,
}

/// Deviation of `amount` from `average`, as a 0-100 risk contribution
///
/// `|amount - average| / average` expressed as a percentage and capped at 100.
/// A zero average makes any nonzero amount maximally deviant, and so does
/// a ratio too large to represent.
pub fn amount_deviation(amount: Decimal, average: Decimal) -> f64 {
    if average.is_zero() {
        return if amount.is_zero() { 0.0 } else { 100.0 };
    }
    let ratio = amount
        .checked_sub(average)
        .and_then(|diff| diff.abs().checked_div(average.abs()))
        .and_then(|ratio| ratio.to_f64());
    match ratio {
        Some(ratio) => (ratio * 100.0).min(100.0),
        None => 100.0,
    }
}

/// Historical daily activity used by velocity checks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyBaseline {
    /// Average transactions per active day
    pub avg_daily_count: f64,
    /// Average amount per active day
    pub avg_daily_amount: Decimal,
}

impl DailyBaseline {
    /// Baseline for a customer without history
    pub fn prior(config: &VelocityConfig) -> Self {
        Self {
            avg_daily_count: config.prior_daily_count,
            avg_daily_amount: config.prior_daily_amount,
        }
    }
}

/// Behavioral contribution and its parts
#[derive(Debug, Clone, PartialEq)]
pub struct BehaviorAssessment {
    /// Weighted contribution (0-100)
    pub contribution: f64,
    /// Amount deviation part
    pub amount_deviation: f64,
    /// Unusual hour part
    pub hour_rarity: f64,
    /// Unusual method part
    pub method_novelty: f64,
    /// Faster-than-usual cadence part
    pub cadence_burst: f64,
    /// Whether the customer had no profile
    pub new_customer: bool,
}

impl BehaviorAssessment {
    /// Human-readable summary
    pub fn describe(&self) -> String {
        if self.new_customer {
            return "no behavioral history for customer".to_string();
        }
        format!(
            "amount deviation {:.0}, hour rarity {:.0}, method novelty {:.0}, cadence burst {:.0}",
            self.amount_deviation, self.hour_rarity, self.method_novelty, self.cadence_burst
        )
    }
}

/// Profile store with per-customer serialized, idempotent updates
pub struct BehaviorProfileStore {
    store: Arc<dyn RecordStore<BehaviorProfile>>,
    locks: KeyedLocks,
    config: ProfileConfig,
    velocity: VelocityConfig,
    tiers: TierThresholds,
    default_utc_offset_minutes: i32,
}

impl BehaviorProfileStore {
    /// Create a profile store over a record store
    pub fn new(store: Arc<dyn RecordStore<BehaviorProfile>>, config: &EngineConfig) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            config: config.profile.clone(),
            velocity: config.velocity.clone(),
            tiers: config.tiers.clone(),
            default_utc_offset_minutes: config.market.default_utc_offset_minutes,
        }
    }

    /// Read a profile without creating it
    pub async fn get(&self, customer_id: &str) -> Result<Option<BehaviorProfile>> {
        Ok(self.store.get(customer_id).await?.map(|r| r.value))
    }

    /// Read a profile, persisting an empty one if absent
    pub async fn get_or_create(&self, customer_id: &str) -> Result<BehaviorProfile> {
        let _guard = self.locks.lock(customer_id).await;

        if let Some(existing) = self.store.get(customer_id).await? {
            return Ok(existing.value);
        }

        let profile = BehaviorProfile::empty(customer_id, &self.config);
        match self
            .store
            .compare_and_swap(customer_id, None, profile.clone())
            .await?
        {
            CasOutcome::Applied { .. } => {
                debug!("Created profile for {}", customer_id);
                Ok(profile)
            }
            // Another instance created it first
            CasOutcome::Conflict { current: Some(current) } => Ok(current.value),
            CasOutcome::Conflict { current: None } => Err(Error::Store(format!(
                "profile for {} vanished during creation",
                customer_id
            ))),
        }
    }

    /// Fold a scored transaction into the customer's profile
    ///
    /// Re-applying the same transaction id returns the stored profile unchanged.
    pub async fn update(
        &self,
        event: &TransactionEvent,
        risk_score: RiskScore,
        location: Option<&GeoLocation>,
    ) -> Result<BehaviorProfile> {
        let customer_id = event.customer_id.as_str();
        let _guard = self.locks.lock(customer_id).await;

        let obs = Observation {
            event,
            local_hour: event.local_hour(self.default_utc_offset_minutes),
            risk_score,
            risk_tier: RiskTier::from_score(risk_score, &self.tiers),
            location,
        };

        for attempt in 0..=self.config.max_cas_retries {
            let current = self.store.get(customer_id).await?;
            let expected = current.as_ref().map(|r| r.version);
            let mut profile = match current {
                Some(record) => record.value,
                None => BehaviorProfile::empty(customer_id, &self.config),
            };

            if profile.has_applied(&event.transaction_id) {
                debug!(
                    "Transaction {} already folded into profile {}",
                    event.transaction_id, customer_id
                );
                return Ok(profile);
            }

            profile.fold(&obs, &self.config);
            debug_assert!(profile.invariants_hold());

            match self
                .store
                .compare_and_swap(customer_id, expected, profile.clone())
                .await?
            {
                CasOutcome::Applied { version } => {
                    debug!(
                        "Profile {} updated to version {} ({} transactions)",
                        customer_id, version, profile.transaction_count
                    );
                    return Ok(profile);
                }
                CasOutcome::Conflict { .. } => {
                    warn!(
                        "Profile {} changed concurrently, retrying (attempt {})",
                        customer_id,
                        attempt + 1
                    );
                }
            }
        }

        Err(Error::Store(format!(
            "profile update for {} lost {} compare-and-swap races",
            customer_id,
            self.config.max_cas_retries + 1
        )))
    }

    /// Score how far a transaction deviates from the customer's profile
    ///
    /// Pure: reads the given profile only.
    pub fn assess(
        &self,
        profile: Option<&BehaviorProfile>,
        event: &TransactionEvent,
    ) -> BehaviorAssessment {
        let profile = match profile {
            Some(p) if !p.is_new() => p,
            _ => {
                return BehaviorAssessment {
                    contribution: self.config.new_customer_baseline,
                    amount_deviation: 0.0,
                    hour_rarity: 0.0,
                    method_novelty: 0.0,
                    cadence_burst: 0.0,
                    new_customer: true,
                }
            }
        };

        let amount = amount_deviation(event.amount, profile.average_amount);
        let seasoned = profile.transaction_count >= self.config.min_history;

        let hour_rarity = if seasoned {
            let hour = event.local_hour(self.default_utc_offset_minutes) as usize % 24;
            let near = profile.hour_histogram[hour] as f64
                + 0.5 * profile.hour_histogram[(hour + 23) % 24] as f64
                + 0.5 * profile.hour_histogram[(hour + 1) % 24] as f64;
            let share = near / profile.transaction_count as f64;
            100.0 * (1.0 - (share / FAMILIAR_SHARE).min(1.0))
        } else {
            0.0
        };

        let method_novelty = if seasoned {
            match profile.method_share(event.payment_method) {
                None => 100.0,
                Some(share) => 100.0 * (1.0 - (share / FAMILIAR_SHARE).min(1.0)),
            }
        } else {
            0.0
        };

        let cadence_burst = match (seasoned, profile.last_transaction_at) {
            (true, Some(last)) => {
                let expected_gap = SECONDS_PER_DAY / profile.transactions_per_day.max(1e-6);
                let gap = (event.timestamp - last).num_seconds().max(0) as f64;
                if gap < expected_gap {
                    100.0 * (1.0 - gap / expected_gap)
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        let contribution =
            0.45 * amount + 0.20 * hour_rarity + 0.20 * method_novelty + 0.15 * cadence_burst;

        BehaviorAssessment {
            contribution: contribution.clamp(0.0, 100.0),
            amount_deviation: amount,
            hour_rarity,
            method_novelty,
            cadence_burst,
            new_customer: false,
        }
    }

    /// Historical daily averages, falling back to configured priors
    pub fn daily_baseline(&self, profile: Option<&BehaviorProfile>) -> DailyBaseline {
        match profile {
            Some(p) if p.active_days > 0 => DailyBaseline {
                avg_daily_count: p.transaction_count as f64 / p.active_days as f64,
                avg_daily_amount: p
                    .total_amount
                    .checked_div(Decimal::from(p.active_days))
                    .unwrap_or(p.total_amount),
            },
            _ => DailyBaseline::prior(&self.velocity),
        }
    }

    /// Drop idle per-customer locks
    pub fn prune_idle_locks(&self) -> usize {
        self.locks.prune_idle()
    }
}
