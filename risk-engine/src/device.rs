//! Device fingerprinting and trust
//!
//! A fingerprint is a blake3 hash over the stable device signals (user agent,
//! screen, time zone, canvas and WebGL hashes, plugins). Attributes outside
//! the hash (language, platform, webdriver flag) may drift between sightings
//! of the same fingerprint and lower its trust.

use crate::config::{DeviceConfig, MarketConfig};
use crate::store::{CasOutcome, KeyedLocks, RecordStore};
use crate::types::DevicePayload;
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

const ATTRIBUTE_MISMATCH_PENALTY: f64 = 8.0;
const CHANGE_RATIO_PENALTY: f64 = 30.0;
const YOUNG_DEVICE_PENALTY: f64 = 10.0;
const IP_RATIO_PENALTY: f64 = 20.0;
const UNSEEN_IP_PENALTY: f64 = 10.0;
const INDICATOR_PENALTY: f64 = 5.0;
// Distinct IPs in the window that mark a device as hopping
const IP_HOPPING_DISTINCT: usize = 4;
// Transaction ids remembered per fingerprint for idempotent sightings
const RECENT_TRANSACTIONS: usize = 32;

const HEADLESS_MARKERS: [&str; 4] = ["headlesschrome", "phantomjs", "slimerjs", "headless"];

/// Risk indicator attached to a fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskIndicator {
    /// User agent of a headless browser
    HeadlessBrowser,
    /// navigator.webdriver was set
    AutomationFlag,
    /// Attributes outside the hash changed between sightings
    AttributeDrift,
    /// Many distinct IPs within the window
    IpHopping,
    /// Browser time zone outside the expected market
    TimezoneMismatch,
}

impl RiskIndicator {
    /// Stable tag name
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskIndicator::HeadlessBrowser => "headless_browser",
            RiskIndicator::AutomationFlag => "automation_flag",
            RiskIndicator::AttributeDrift => "attribute_drift",
            RiskIndicator::IpHopping => "ip_hopping",
            RiskIndicator::TimezoneMismatch => "timezone_mismatch",
        }
    }
}

impl fmt::Display for RiskIndicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IP seen with a fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpSighting {
    /// Address
    pub ip: IpAddr,
    /// Sightings from this address
    pub count: u64,
    /// Most recent sighting
    pub last_seen: DateTime<Utc>,
}

/// Stored device record, keyed by fingerprint hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    /// blake3 hex digest
    pub hash: String,
    /// Attributes from the latest sighting
    pub attributes: DevicePayload,
    /// First sighting
    pub first_seen: DateTime<Utc>,
    /// Latest sighting
    pub last_seen: DateTime<Utc>,
    /// Sightings recorded
    pub sighting_count: u64,
    /// Sightings whose attributes differed from the previous snapshot
    pub attribute_changes: u64,
    /// Bounded IP history, most recent first
    pub ip_history: Vec<IpSighting>,
    /// Accumulated risk indicators
    pub risk_indicators: BTreeSet<RiskIndicator>,
    /// Recently recorded transactions, oldest first
    pub recent_transaction_ids: VecDeque<Uuid>,
}

impl DeviceFingerprint {
    fn first_sighting(
        hash: String,
        payload: &DevicePayload,
        ip: Option<IpAddr>,
        seen_at: DateTime<Utc>,
        transaction_id: Uuid,
        indicators: BTreeSet<RiskIndicator>,
    ) -> Self {
        Self {
            hash,
            attributes: payload.clone(),
            first_seen: seen_at,
            last_seen: seen_at,
            sighting_count: 1,
            attribute_changes: 0,
            ip_history: ip
                .map(|ip| {
                    vec![IpSighting {
                        ip,
                        count: 1,
                        last_seen: seen_at,
                    }]
                })
                .unwrap_or_default(),
            risk_indicators: indicators,
            recent_transaction_ids: VecDeque::from([transaction_id]),
        }
    }

    /// Distinct IPs and their sightings within `window` of `now`
    fn ips_in_window(&self, now: DateTime<Utc>, window: Duration) -> (usize, u64) {
        let since = now - window;
        self.ip_history
            .iter()
            .filter(|s| s.last_seen >= since)
            .fold((0, 0), |(distinct, sightings), s| (distinct + 1, sightings + s.count))
    }

    fn has_recorded(&self, transaction_id: &Uuid) -> bool {
        self.recent_transaction_ids.contains(transaction_id)
    }

    fn remember(&mut self, transaction_id: Uuid) {
        self.recent_transaction_ids.push_back(transaction_id);
        while self.recent_transaction_ids.len() > RECENT_TRANSACTIONS {
            self.recent_transaction_ids.pop_front();
        }
    }

    fn has_seen_ip(&self, ip: &IpAddr) -> bool {
        self.ip_history.iter().any(|s| &s.ip == ip)
    }
}

/// Stable hash over the fingerprinting signals
///
/// Order-independent in the plugin list; absent values hash differently from
/// empty strings.
pub fn fingerprint_hash(payload: &DevicePayload) -> String {
    fn field(hasher: &mut blake3::Hasher, name: &str, value: Option<&str>) {
        hasher.update(name.as_bytes());
        match value {
            Some(v) => {
                hasher.update(b"=");
                hasher.update(v.as_bytes());
            }
            None => {
                hasher.update(b"!");
            }
        }
        hasher.update(b"\n");
    }

    let mut plugins: Vec<&str> = payload.plugins.iter().map(String::as_str).collect();
    plugins.sort_unstable();
    plugins.dedup();
    let plugins = plugins.join("\u{1f}");

    let mut hasher = blake3::Hasher::new();
    field(&mut hasher, "user_agent", Some(payload.user_agent.as_str()));
    field(&mut hasher, "screen", payload.screen_resolution.as_deref());
    field(&mut hasher, "timezone", payload.timezone.as_deref());
    field(&mut hasher, "canvas", payload.canvas_hash.as_deref());
    field(&mut hasher, "webgl", payload.webgl_hash.as_deref());
    field(&mut hasher, "plugins", Some(plugins.as_str()));
    hasher.finalize().to_hex().to_string()
}

/// Attributes outside the hash that differ between two payloads
fn drifted_attributes(stored: &DevicePayload, current: &DevicePayload) -> usize {
    [
        stored.language != current.language,
        stored.platform != current.platform,
        stored.webdriver != current.webdriver,
    ]
    .iter()
    .filter(|differs| **differs)
    .count()
}

/// Indicators visible in a single payload
fn payload_indicators(payload: &DevicePayload, market: &MarketConfig) -> BTreeSet<RiskIndicator> {
    let mut indicators = BTreeSet::new();
    let ua = payload.user_agent.to_lowercase();
    if HEADLESS_MARKERS.iter().any(|m| ua.contains(m)) {
        indicators.insert(RiskIndicator::HeadlessBrowser);
    }
    if payload.webdriver {
        indicators.insert(RiskIndicator::AutomationFlag);
    }
    if let Some(tz) = payload.timezone.as_deref() {
        if !market.is_expected_timezone(tz) {
            indicators.insert(RiskIndicator::TimezoneMismatch);
        }
    }
    indicators
}

/// Device contribution and its parts
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAssessment {
    /// Contribution (0-100)
    pub contribution: f64,
    /// Hash of the payload, if one was sent
    pub fingerprint_hash: Option<String>,
    /// Fingerprint never seen before
    pub new_device: bool,
    /// Trust score (0-100) for a known device
    pub trust_score: Option<f64>,
    /// IP inconsistency penalty
    pub ip_penalty: f64,
    /// Indicators counted
    pub indicators: Vec<RiskIndicator>,
}

impl DeviceAssessment {
    /// Human-readable summary
    pub fn describe(&self) -> String {
        match (&self.fingerprint_hash, self.trust_score) {
            (None, _) => "no device fingerprint supplied".to_string(),
            (Some(_), None) => "first sighting of this device".to_string(),
            (Some(_), Some(trust)) => {
                let mut text = format!("known device, trust {:.0}", trust);
                if self.ip_penalty > 0.0 {
                    text.push_str(&format!(", IP inconsistency +{:.0}", self.ip_penalty));
                }
                if !self.indicators.is_empty() {
                    let tags: Vec<&str> = self.indicators.iter().map(|i| i.as_str()).collect();
                    text.push_str(&format!(", indicators: {}", tags.join(", ")));
                }
                text
            }
        }
    }
}

/// Fingerprint records with per-hash serialized sightings
pub struct DeviceRegistry {
    store: Arc<dyn RecordStore<DeviceFingerprint>>,
    locks: KeyedLocks,
    config: DeviceConfig,
    market: MarketConfig,
    max_cas_retries: u32,
}

impl DeviceRegistry {
    /// Create a registry over a record store
    pub fn new(
        store: Arc<dyn RecordStore<DeviceFingerprint>>,
        config: DeviceConfig,
        market: MarketConfig,
        max_cas_retries: u32,
    ) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            config,
            market,
            max_cas_retries,
        }
    }

    /// Point read by hash
    pub async fn get(&self, hash: &str) -> Result<Option<DeviceFingerprint>> {
        Ok(self.store.get(hash).await?.map(|r| r.value))
    }

    /// Record a sighting of the payload's fingerprint
    ///
    /// Creates the fingerprint on first sighting. Recording a transaction
    /// that is still among the recent ids is a no-op.
    pub async fn record_sighting(
        &self,
        payload: &DevicePayload,
        ip: Option<IpAddr>,
        transaction_id: Uuid,
        seen_at: DateTime<Utc>,
    ) -> Result<DeviceFingerprint> {
        let hash = fingerprint_hash(payload);
        let _guard = self.locks.lock(&hash).await;
        let observed = payload_indicators(payload, &self.market);

        for attempt in 0..=self.max_cas_retries {
            let current = self.store.get(&hash).await?;
            let expected = current.as_ref().map(|r| r.version);

            let next = match current {
                None => DeviceFingerprint::first_sighting(
                    hash.clone(),
                    payload,
                    ip,
                    seen_at,
                    transaction_id,
                    observed.clone(),
                ),
                Some(record) => {
                    let mut fp = record.value;
                    if fp.has_recorded(&transaction_id) {
                        return Ok(fp);
                    }
                    self.apply_sighting(&mut fp, payload, ip, seen_at, &observed);
                    fp.remember(transaction_id);
                    fp
                }
            };

            match self
                .store
                .compare_and_swap(&hash, expected, next.clone())
                .await?
            {
                CasOutcome::Applied { version } => {
                    debug!(
                        "Device {} sighting recorded (version {}, {} sightings)",
                        &hash[..12],
                        version,
                        next.sighting_count
                    );
                    return Ok(next);
                }
                CasOutcome::Conflict { .. } => {
                    warn!(
                        "Device {} changed concurrently, retrying (attempt {})",
                        &hash[..12],
                        attempt + 1
                    );
                }
            }
        }

        Err(Error::Store(format!(
            "device sighting for {} lost {} compare-and-swap races",
            hash,
            self.max_cas_retries + 1
        )))
    }

    fn apply_sighting(
        &self,
        fp: &mut DeviceFingerprint,
        payload: &DevicePayload,
        ip: Option<IpAddr>,
        seen_at: DateTime<Utc>,
        observed: &BTreeSet<RiskIndicator>,
    ) {
        fp.sighting_count += 1;
        fp.last_seen = fp.last_seen.max(seen_at);

        let mut indicators = observed.clone();
        if drifted_attributes(&fp.attributes, payload) > 0 {
            fp.attribute_changes += 1;
            indicators.insert(RiskIndicator::AttributeDrift);
        }
        fp.attributes = payload.clone();

        if let Some(ip) = ip {
            match fp.ip_history.iter().position(|s| s.ip == ip) {
                Some(idx) => {
                    let mut sighting = fp.ip_history.remove(idx);
                    sighting.count += 1;
                    sighting.last_seen = sighting.last_seen.max(seen_at);
                    fp.ip_history.insert(0, sighting);
                }
                None => fp.ip_history.insert(
                    0,
                    IpSighting {
                        ip,
                        count: 1,
                        last_seen: seen_at,
                    },
                ),
            }
            fp.ip_history.truncate(self.config.max_ip_history.max(1));
        }

        let (distinct, _) = fp.ips_in_window(seen_at, Duration::days(self.config.ip_window_days));
        if distinct >= IP_HOPPING_DISTINCT {
            indicators.insert(RiskIndicator::IpHopping);
        }

        for indicator in indicators {
            if fp.risk_indicators.len() >= self.config.max_indicators {
                break;
            }
            fp.risk_indicators.insert(indicator);
        }
    }

    /// Drop idle per-hash locks
    pub fn prune_idle_locks(&self) -> usize {
        self.locks.prune_idle()
    }
}

/// Scores how far a device can be trusted
pub struct DeviceTrustEvaluator {
    registry: Arc<DeviceRegistry>,
    config: DeviceConfig,
    market: MarketConfig,
}

impl DeviceTrustEvaluator {
    /// Create an evaluator reading from `registry`
    pub fn new(registry: Arc<DeviceRegistry>, config: DeviceConfig, market: MarketConfig) -> Self {
        Self {
            registry,
            config,
            market,
        }
    }

    /// Registry the evaluator reads from
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Score a device payload seen from `ip` at `now`
    ///
    /// Read-only; sightings are recorded separately through the registry.
    pub async fn evaluate(
        &self,
        payload: Option<&DevicePayload>,
        ip: Option<IpAddr>,
        now: DateTime<Utc>,
    ) -> Result<DeviceAssessment> {
        let Some(payload) = payload else {
            return Ok(DeviceAssessment {
                contribution: self.config.missing_payload_risk,
                fingerprint_hash: None,
                new_device: false,
                trust_score: None,
                ip_penalty: 0.0,
                indicators: Vec::new(),
            });
        };

        let hash = fingerprint_hash(payload);
        let stored = self.registry.get(&hash).await?;
        Ok(self.score(hash, payload, ip, stored.as_ref(), now))
    }

    /// Score against an already loaded fingerprint
    pub fn score(
        &self,
        hash: String,
        payload: &DevicePayload,
        ip: Option<IpAddr>,
        stored: Option<&DeviceFingerprint>,
        now: DateTime<Utc>,
    ) -> DeviceAssessment {
        let Some(fp) = stored else {
            return DeviceAssessment {
                contribution: self.config.new_device_risk,
                fingerprint_hash: Some(hash),
                new_device: true,
                trust_score: None,
                ip_penalty: 0.0,
                indicators: payload_indicators(payload, &self.market).into_iter().collect(),
            };
        };

        let drift = drifted_attributes(&fp.attributes, payload) as f64;
        let change_ratio = fp.attribute_changes as f64 / fp.sighting_count.max(1) as f64;
        let mut trust = 100.0 - ATTRIBUTE_MISMATCH_PENALTY * drift - CHANGE_RATIO_PENALTY * change_ratio;
        if now - fp.first_seen < Duration::hours(self.config.young_device_hours) {
            trust -= YOUNG_DEVICE_PENALTY;
        }
        let trust = trust.clamp(0.0, 100.0);

        let (mut distinct, mut sightings) =
            fp.ips_in_window(now, Duration::days(self.config.ip_window_days));
        let unseen_ip = match ip {
            Some(ip) if !fp.ip_history.is_empty() && !fp.has_seen_ip(&ip) => {
                distinct += 1;
                sightings += 1;
                true
            }
            _ => false,
        };
        let mut ip_penalty = if distinct > 1 {
            (IP_RATIO_PENALTY * distinct as f64 / sightings.max(1) as f64).round()
        } else {
            0.0
        };
        if unseen_ip {
            ip_penalty += UNSEEN_IP_PENALTY;
        }

        let mut indicators = fp.risk_indicators.clone();
        indicators.extend(payload_indicators(payload, &self.market));
        if drift > 0.0 {
            indicators.insert(RiskIndicator::AttributeDrift);
        }

        let contribution = ((100.0 - trust).max(0.0)
            + ip_penalty
            + INDICATOR_PENALTY * indicators.len() as f64)
            .min(100.0);

        DeviceAssessment {
            contribution,
            fingerprint_hash: Some(hash),
            new_device: false,
            trust_score: Some(trust),
            ip_penalty,
            indicators: indicators.into_iter().collect(),
        }
    }
}
