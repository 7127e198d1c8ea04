//! Velocity checks for transaction monitoring
//!
//! Each customer has three sliding windows (1 minute, 1 hour, 24 hours). The
//! check and the registration of the current transaction happen under the
//! same `DashMap` entry lock, so two concurrent transactions from one customer
//! can never both observe a window without the other.

use crate::config::VelocityConfig;
use crate::profile::DailyBaseline;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const MINUTE_RISK: f64 = 20.0;
const HOURLY_COUNT_RISK: f64 = 60.0;
const HOURLY_AMOUNT_RISK: f64 = 50.0;
const RAPID_FIRE_RISK: f64 = 40.0;
const DAILY_COUNT_RISK: f64 = 30.0;
const DAILY_AMOUNT_RISK: f64 = 35.0;

/// Transaction record for velocity tracking
#[derive(Debug, Clone)]
struct WindowEntry {
    transaction_id: Uuid,
    amount: Decimal,
    timestamp: DateTime<Utc>,
}

/// Time window with incrementally maintained count and amount
#[derive(Debug, Clone)]
struct SlidingWindow {
    span: Duration,
    // Sorted by timestamp
    entries: VecDeque<WindowEntry>,
    amount: Decimal,
}

impl SlidingWindow {
    fn new(span: Duration) -> Self {
        Self {
            span,
            entries: VecDeque::new(),
            amount: Decimal::ZERO,
        }
    }

    /// Drop entries at or before `reference - span`
    fn prune(&mut self, reference: DateTime<Utc>) {
        let cutoff = reference - self.span;
        let mut pruned = false;
        while let Some(front) = self.entries.front() {
            if front.timestamp > cutoff {
                break;
            }
            self.entries.pop_front();
            pruned = true;
        }
        if pruned {
            self.amount = self.sum();
        }
    }

    /// Window total, saturating at `Decimal::MAX`
    fn sum(&self) -> Decimal {
        self.entries
            .iter()
            .fold(Decimal::ZERO, |acc, e| acc.saturating_add(e.amount))
    }

    fn insert(&mut self, entry: WindowEntry) {
        // Events mostly arrive in order; scan from the back
        let pos = self
            .entries
            .iter()
            .rposition(|e| e.timestamp <= entry.timestamp)
            .map_or(0, |i| i + 1);
        self.amount = self.amount.saturating_add(entry.amount);
        self.entries.insert(pos, entry);
    }

    fn contains(&self, transaction_id: &Uuid) -> bool {
        self.entries.iter().any(|e| &e.transaction_id == transaction_id)
    }

    fn count(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Consecutive pairs closer together than `gap`
    fn rapid_gaps(&self, gap: Duration) -> u32 {
        self.entries
            .iter()
            .zip(self.entries.iter().skip(1))
            .filter(|(a, b)| b.timestamp - a.timestamp < gap)
            .count() as u32
    }

    fn stats(&self) -> WindowStats {
        WindowStats {
            count: self.count(),
            amount: self.amount,
        }
    }
}

/// Per-customer windows
#[derive(Debug, Clone)]
struct CustomerVelocity {
    minute: SlidingWindow,
    hour: SlidingWindow,
    day: SlidingWindow,
}

impl CustomerVelocity {
    fn new() -> Self {
        Self {
            minute: SlidingWindow::new(Duration::minutes(1)),
            hour: SlidingWindow::new(Duration::hours(1)),
            day: SlidingWindow::new(Duration::hours(24)),
        }
    }

    fn prune(&mut self, reference: DateTime<Utc>) {
        self.minute.prune(reference);
        self.hour.prune(reference);
        self.day.prune(reference);
    }

    fn register(&mut self, transaction_id: Uuid, amount: Decimal, timestamp: DateTime<Utc>) {
        let entry = WindowEntry {
            transaction_id,
            amount,
            timestamp,
        };
        self.minute.insert(entry.clone());
        self.hour.insert(entry.clone());
        self.day.insert(entry);
    }

    fn snapshot(&self) -> VelocitySnapshot {
        VelocitySnapshot {
            minute: self.minute.stats(),
            hour: self.hour.stats(),
            day: self.day.stats(),
        }
    }

    fn is_empty(&self) -> bool {
        self.day.entries.is_empty()
    }
}

/// Count and amount in one window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowStats {
    /// Transactions in the window
    pub count: u32,
    /// Cumulative amount in the window
    pub amount: Decimal,
}

/// All three windows for a customer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VelocitySnapshot {
    /// Last 60 seconds
    pub minute: WindowStats,
    /// Last hour
    pub hour: WindowStats,
    /// Last 24 hours
    pub day: WindowStats,
}

/// Outcome of a velocity check
#[derive(Debug, Clone, PartialEq)]
pub struct VelocityAssessment {
    /// Contribution (0-100)
    pub contribution: f64,
    /// Windows including the current transaction
    pub snapshot: VelocitySnapshot,
    /// Rules that fired
    pub reasons: Vec<String>,
    /// Transaction was already registered
    pub duplicate: bool,
}

impl VelocityAssessment {
    /// Human-readable summary
    pub fn describe(&self) -> String {
        if self.reasons.is_empty() {
            format!(
                "{} transactions in the last hour, {} today",
                self.snapshot.hour.count, self.snapshot.day.count
            )
        } else {
            self.reasons.join("; ")
        }
    }
}

/// Velocity guard monitors transaction rates per customer
pub struct VelocityGuard {
    config: VelocityConfig,
    // Map: customer_id -> CustomerVelocity
    customers: Arc<DashMap<String, CustomerVelocity>>,
}

impl VelocityGuard {
    /// Create new velocity guard
    pub fn new(config: VelocityConfig) -> Self {
        Self {
            config,
            customers: Arc::new(DashMap::new()),
        }
    }

    /// Score the transaction against the customer's windows and register it
    ///
    /// Check and registration are atomic per customer. A transaction id that
    /// is still in the 24-hour window is not registered again.
    pub fn check_and_register(
        &self,
        customer_id: &str,
        transaction_id: Uuid,
        amount: Decimal,
        timestamp: DateTime<Utc>,
        baseline: &DailyBaseline,
    ) -> VelocityAssessment {
        let mut entry = self
            .customers
            .entry(customer_id.to_string())
            .or_insert_with(CustomerVelocity::new);
        let windows = entry.value_mut();

        windows.prune(timestamp);

        let duplicate = windows.day.contains(&transaction_id);
        if !duplicate {
            windows.register(transaction_id, amount, timestamp);
        }

        let snapshot = windows.snapshot();
        let rapid_gaps = windows
            .hour
            .rapid_gaps(Duration::seconds(self.config.rapid_gap_secs));
        let mut reasons = Vec::new();
        let mut contribution = 0.0;

        if snapshot.minute.count > self.config.max_per_minute {
            contribution += MINUTE_RISK;
            reasons.push(format!(
                "{} transactions in the last minute exceed {}",
                snapshot.minute.count, self.config.max_per_minute
            ));
        }

        if snapshot.hour.count > self.config.max_per_hour {
            contribution += HOURLY_COUNT_RISK;
            reasons.push(format!(
                "{} transactions in the last hour exceed {}",
                snapshot.hour.count, self.config.max_per_hour
            ));
        }

        if snapshot.hour.amount > self.config.max_amount_per_hour {
            contribution += HOURLY_AMOUNT_RISK;
            reasons.push(format!(
                "hourly amount {} exceeds {}",
                snapshot.hour.amount, self.config.max_amount_per_hour
            ));
        }

        if rapid_gaps >= self.config.rapid_min_transactions {
            contribution += RAPID_FIRE_RISK;
            reasons.push(format!(
                "{} gaps under {}s in the last hour",
                rapid_gaps, self.config.rapid_gap_secs
            ));
        }

        let count_ceiling = baseline.avg_daily_count * self.config.daily_count_multiplier;
        if f64::from(snapshot.day.count) > count_ceiling {
            contribution += DAILY_COUNT_RISK;
            reasons.push(format!(
                "{} transactions today exceed {:.1}x the daily average of {:.1}",
                snapshot.day.count, self.config.daily_count_multiplier, baseline.avg_daily_count
            ));
        }

        let multiplier =
            Decimal::from_f64_retain(self.config.daily_amount_multiplier).unwrap_or(Decimal::ONE);
        let amount_ceiling = baseline
            .avg_daily_amount
            .checked_mul(multiplier)
            .unwrap_or(Decimal::MAX);
        if snapshot.day.amount > amount_ceiling {
            contribution += DAILY_AMOUNT_RISK;
            reasons.push(format!(
                "amount today {} exceeds {:.1}x the daily average of {}",
                snapshot.day.amount,
                self.config.daily_amount_multiplier,
                baseline.avg_daily_amount.round_dp(2)
            ));
        }

        let contribution = f64::min(contribution, 100.0);
        if contribution > 0.0 {
            debug!(
                "Velocity for {}: {} ({})",
                customer_id,
                contribution,
                reasons.join("; ")
            );
        }

        VelocityAssessment {
            contribution,
            snapshot,
            reasons,
            duplicate,
        }
    }

    /// Current windows for a customer, pruned at `now`
    pub fn snapshot(&self, customer_id: &str, now: DateTime<Utc>) -> Option<VelocitySnapshot> {
        self.customers.get_mut(customer_id).map(|mut entry| {
            let windows = entry.value_mut();
            windows.prune(now);
            windows.snapshot()
        })
    }

    /// Clear velocity data for a customer (e.g. after manual review)
    pub fn reset(&self, customer_id: &str) {
        self.customers.remove(customer_id);
    }

    /// Prune every customer at `now` and drop customers with empty windows
    pub fn prune_idle(&self, now: DateTime<Utc>) -> usize {
        let before = self.customers.len();
        self.customers.retain(|_, windows| {
            windows.prune(now);
            !windows.is_empty()
        });
        before - self.customers.len()
    }

    /// Get total number of tracked customers
    pub fn tracked_customers(&self) -> usize {
        self.customers.len()
    }
}
