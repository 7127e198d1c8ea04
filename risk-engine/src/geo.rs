//! Geographic consistency
//!
//! Resolves the origin IP through external collaborators and compares the
//! result with where the customer usually transacts. Collaborator calls run
//! as spawned tasks awaited under a timeout; a call that misses its budget
//! keeps running and fills the cache for later evaluations.

use crate::clock::Clock;
use crate::config::{GeoConfig, MarketConfig};
use crate::error::SignalError;
use crate::profile::BehaviorProfile;
use crate::types::{DegradedSignal, GeoLocation, SignalSource, TransactionEvent};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

const EARTH_RADIUS_KM: f64 = 6371.0;
// Distance treated as "same place" when no time has elapsed
const SIMULTANEOUS_DISTANCE_KM: f64 = 50.0;

const INCONSISTENCY_RISK: f64 = 40.0;
const FOREIGN_IP_RISK: f64 = 30.0;
const VPN_RISK: f64 = 30.0;
const TOR_RISK: f64 = 50.0;
const ABUSE_RISK: f64 = 40.0;
const IMPOSSIBLE_TRAVEL_RISK: f64 = 35.0;
const DECLARED_MISMATCH_RISK: f64 = 15.0;

/// Resolves an IP to a coarse location
#[async_trait]
pub trait GeoResolver: Send + Sync {
    /// Look up `ip`
    async fn resolve(&self, ip: IpAddr) -> Result<GeoLocation, SignalError>;
}

/// Reputation of an IP, each score on 0-100
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IpReputation {
    /// Anonymizing network (VPN, proxy)
    pub vpn_score: f64,
    /// High-anonymity network (Tor)
    pub tor_score: f64,
    /// Known abuse
    pub abuse_score: f64,
}

impl IpReputation {
    /// Combined contribution (0-120 before capping)
    fn risk(&self) -> f64 {
        let part = |score: f64, max: f64| (score.clamp(0.0, 100.0) / 100.0) * max;
        part(self.vpn_score, VPN_RISK) + part(self.tor_score, TOR_RISK) + part(self.abuse_score, ABUSE_RISK)
    }
}

/// Detects anonymizing networks and abusive IPs
#[async_trait]
pub trait IpIntelligence: Send + Sync {
    /// Assess `ip`
    async fn assess(&self, ip: IpAddr) -> Result<IpReputation, SignalError>;
}

/// Table-backed resolver, for tests and offline deployments
#[derive(Debug, Default)]
pub struct StaticGeoResolver {
    table: DashMap<IpAddr, GeoLocation>,
    latency: Option<std::time::Duration>,
}

impl StaticGeoResolver {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every lookup by `latency`
    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Map `ip` to `location`
    pub fn insert(&self, ip: IpAddr, location: GeoLocation) {
        self.table.insert(ip, location);
    }
}

#[async_trait]
impl GeoResolver for StaticGeoResolver {
    async fn resolve(&self, ip: IpAddr) -> Result<GeoLocation, SignalError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.table
            .get(&ip)
            .map(|l| l.value().clone())
            .ok_or_else(|| SignalError::Unavailable(format!("no location for {}", ip)))
    }
}

/// Table-backed reputation source; unknown IPs are clean
#[derive(Debug, Default)]
pub struct StaticIpIntelligence {
    table: DashMap<IpAddr, IpReputation>,
    latency: Option<std::time::Duration>,
}

impl StaticIpIntelligence {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every lookup by `latency`
    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Set reputation for `ip`
    pub fn insert(&self, ip: IpAddr, reputation: IpReputation) {
        self.table.insert(ip, reputation);
    }
}

#[async_trait]
impl IpIntelligence for StaticIpIntelligence {
    async fn assess(&self, ip: IpAddr) -> Result<IpReputation, SignalError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        Ok(self.table.get(&ip).map(|r| *r.value()).unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
struct Cached<V> {
    value: V,
    stored_at: DateTime<Utc>,
}

/// TTL cache of collaborator answers
#[derive(Debug)]
pub struct GeoCache {
    locations: DashMap<IpAddr, Cached<GeoLocation>>,
    reputations: DashMap<IpAddr, Cached<IpReputation>>,
    ttl: Duration,
}

impl GeoCache {
    /// Create cache with entry lifetime `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            locations: DashMap::new(),
            reputations: DashMap::new(),
            ttl,
        }
    }

    fn fresh<V: Clone>(&self, map: &DashMap<IpAddr, Cached<V>>, ip: &IpAddr, now: DateTime<Utc>) -> Option<V> {
        map.get(ip)
            .filter(|c| now - c.stored_at < self.ttl)
            .map(|c| c.value.clone())
    }

    /// Cached location if not expired
    pub fn location(&self, ip: &IpAddr, now: DateTime<Utc>) -> Option<GeoLocation> {
        self.fresh(&self.locations, ip, now)
    }

    /// Cached reputation if not expired
    pub fn reputation(&self, ip: &IpAddr, now: DateTime<Utc>) -> Option<IpReputation> {
        self.fresh(&self.reputations, ip, now)
    }

    fn put_location(&self, ip: IpAddr, value: GeoLocation, now: DateTime<Utc>) {
        self.locations.insert(ip, Cached { value, stored_at: now });
    }

    fn put_reputation(&self, ip: IpAddr, value: IpReputation, now: DateTime<Utc>) {
        self.reputations.insert(ip, Cached { value, stored_at: now });
    }

    /// Drop expired entries
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.len();
        let ttl = self.ttl;
        self.locations.retain(|_, c| now - c.stored_at < ttl);
        self.reputations.retain(|_, c| now - c.stored_at < ttl);
        before - self.len()
    }

    /// Entries across both tables
    pub fn len(&self) -> usize {
        self.locations.len() + self.reputations.len()
    }

    /// Whether both tables are empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Great-circle distance in kilometres
pub fn haversine_km(from: (f64, f64), to: (f64, f64)) -> f64 {
    let (lat1, lon1) = (from.0.to_radians(), from.1.to_radians());
    let (lat2, lon2) = (to.0.to_radians(), to.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

/// Whether moving `distance_km` in `elapsed` exceeds `max_speed_kmh`
pub fn is_impossible_travel(distance_km: f64, elapsed: Duration, max_speed_kmh: f64) -> bool {
    let hours = elapsed.num_milliseconds() as f64 / 3_600_000.0;
    if hours <= 0.0 {
        return distance_km > SIMULTANEOUS_DISTANCE_KM;
    }
    distance_km / hours > max_speed_kmh
}

/// Count-weighted match of `current` against the known location set
///
/// City match counts 1.0, region 0.7, country 0.4. No history yields 0.
pub fn consistency_ratio(profile: Option<&BehaviorProfile>, current: &GeoLocation) -> f64 {
    let Some(profile) = profile else {
        return 0.0;
    };
    let total: u64 = profile.known_locations.iter().map(|k| k.count).sum();
    if total == 0 {
        return 0.0;
    }
    let matched: f64 = profile
        .known_locations
        .iter()
        .map(|k| {
            let known = &k.location;
            let score = if known.country != current.country {
                0.0
            } else if known.region.is_some() && known.region == current.region {
                if known.city.is_some() && known.city == current.city {
                    1.0
                } else {
                    0.7
                }
            } else {
                0.4
            };
            score * k.count as f64
        })
        .sum();
    matched / total as f64
}

/// Geographic contribution and its parts
#[derive(Debug, Clone, PartialEq)]
pub struct GeoAssessment {
    /// Contribution (0-100)
    pub contribution: f64,
    /// Resolved location, if any
    pub location: Option<GeoLocation>,
    /// Rules that fired
    pub reasons: Vec<String>,
    /// Collaborators that failed
    pub degraded: Vec<DegradedSignal>,
}

impl GeoAssessment {
    /// Human-readable summary
    pub fn describe(&self) -> String {
        if self.reasons.is_empty() {
            "location consistent with history".to_string()
        } else {
            self.reasons.join("; ")
        }
    }
}

/// Scores the origin location against the customer's history
pub struct GeoConsistencyEvaluator {
    resolver: Arc<dyn GeoResolver>,
    intelligence: Arc<dyn IpIntelligence>,
    cache: Arc<GeoCache>,
    clock: Arc<dyn Clock>,
    config: GeoConfig,
    market: MarketConfig,
    timeout: std::time::Duration,
}

impl GeoConsistencyEvaluator {
    /// Create evaluator; `timeout` bounds each collaborator call
    pub fn new(
        resolver: Arc<dyn GeoResolver>,
        intelligence: Arc<dyn IpIntelligence>,
        clock: Arc<dyn Clock>,
        config: GeoConfig,
        market: MarketConfig,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            resolver,
            intelligence,
            cache: Arc::new(GeoCache::new(Duration::seconds(config.cache_ttl_secs))),
            clock,
            config,
            market,
            timeout,
        }
    }

    /// Lookup cache
    pub fn cache(&self) -> &Arc<GeoCache> {
        &self.cache
    }

    async fn lookup_location(&self, ip: IpAddr) -> Result<GeoLocation, SignalError> {
        if let Some(hit) = self.cache.location(&ip, self.clock.now()) {
            return Ok(hit);
        }

        let resolver = self.resolver.clone();
        let cache = self.cache.clone();
        let clock = self.clock.clone();
        let task = tokio::spawn(async move {
            let result = resolver.resolve(ip).await;
            if let Ok(location) = &result {
                cache.put_location(ip, location.clone(), clock.now());
            }
            result
        });

        // Dropping the handle on timeout detaches the task
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SignalError::Unavailable(format!("resolver task failed: {}", e))),
            Err(_) => Err(SignalError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    async fn lookup_reputation(&self, ip: IpAddr) -> Result<IpReputation, SignalError> {
        if let Some(hit) = self.cache.reputation(&ip, self.clock.now()) {
            return Ok(hit);
        }

        let intelligence = self.intelligence.clone();
        let cache = self.cache.clone();
        let clock = self.clock.clone();
        let task = tokio::spawn(async move {
            let result = intelligence.assess(ip).await;
            if let Ok(reputation) = &result {
                cache.put_reputation(ip, *reputation, clock.now());
            }
            result
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SignalError::Unavailable(format!("reputation task failed: {}", e))),
            Err(_) => Err(SignalError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    /// Score the event's origin against `profile`
    ///
    /// Never fails: collaborator failures degrade to configured defaults.
    pub async fn evaluate(
        &self,
        event: &TransactionEvent,
        profile: Option<&BehaviorProfile>,
    ) -> GeoAssessment {
        let Some(ip) = event.ip_address else {
            return GeoAssessment {
                contribution: self.config.unavailable_default,
                location: None,
                reasons: vec!["no origin IP".to_string()],
                degraded: Vec::new(),
            };
        };

        let (location, reputation) = tokio::join!(self.lookup_location(ip), self.lookup_reputation(ip));
        let mut degraded = Vec::new();

        let location = match location {
            Ok(location) => location,
            Err(e) => {
                warn!("Geolocation for {} degraded: {}", ip, e);
                degraded.push(DegradedSignal {
                    source: SignalSource::Geolocation,
                    reason: e.to_string(),
                });
                if let Err(e) = reputation {
                    degraded.push(DegradedSignal {
                        source: SignalSource::IpReputation,
                        reason: e.to_string(),
                    });
                }
                return GeoAssessment {
                    contribution: self.config.unavailable_default,
                    location: None,
                    reasons: vec!["origin location unavailable".to_string()],
                    degraded,
                };
            }
        };

        let mut contribution = 0.0;
        let mut reasons = Vec::new();

        let ratio = consistency_ratio(profile, &location);
        let inconsistency = (1.0 - ratio) * INCONSISTENCY_RISK;
        if inconsistency > 0.0 {
            contribution += inconsistency;
            reasons.push(format!("location consistency {:.2}", ratio));
        }

        if self.config.domestic_only && !self.market.is_domestic(&location.country) {
            contribution += FOREIGN_IP_RISK;
            reasons.push(format!("non-domestic IP ({})", location.country));
        }

        match reputation {
            Ok(rep) => {
                let risk = rep.risk();
                if risk > 0.0 {
                    contribution += risk;
                    reasons.push(format!(
                        "IP reputation vpn {:.0} tor {:.0} abuse {:.0}",
                        rep.vpn_score, rep.tor_score, rep.abuse_score
                    ));
                }
            }
            Err(e) => {
                warn!("IP reputation for {} degraded: {}", ip, e);
                contribution += self.config.reputation_unavailable_penalty;
                reasons.push("IP reputation unavailable".to_string());
                degraded.push(DegradedSignal {
                    source: SignalSource::IpReputation,
                    reason: e.to_string(),
                });
            }
        }

        if let Some(profile) = profile {
            if let (Some(last), Some(last_at), Some(here)) = (
                profile.last_location.as_ref().and_then(GeoLocation::coordinates),
                profile.last_location_at,
                location.coordinates(),
            ) {
                let distance = haversine_km(last, here);
                let elapsed = event.timestamp - last_at;
                if is_impossible_travel(distance, elapsed, self.config.max_travel_speed_kmh) {
                    contribution += IMPOSSIBLE_TRAVEL_RISK;
                    reasons.push(format!(
                        "impossible travel: {:.0} km in {} min",
                        distance,
                        elapsed.num_minutes()
                    ));
                }
            }
        }

        if let Some(declared) = &event.declared_location {
            if !declared.country.eq_ignore_ascii_case(&location.country) {
                contribution += DECLARED_MISMATCH_RISK;
                reasons.push(format!(
                    "declared country {} differs from IP country {}",
                    declared.country, location.country
                ));
            }
        }

        let contribution = f64::min(contribution, 100.0);
        debug!("Geo for {}: {} ({})", ip, contribution, reasons.join("; "));

        GeoAssessment {
            contribution,
            location: Some(location),
            reasons,
            degraded,
        }
    }
}
