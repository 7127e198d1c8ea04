//! Background maintenance
//!
//! Window expiry is lazy on the hot path; this loop only reclaims memory for
//! customers, IPs and lock entries that went quiet.

use crate::clock::Clock;
use crate::device::DeviceRegistry;
use crate::geo::GeoCache;
use crate::profile::BehaviorProfileStore;
use crate::velocity::VelocityGuard;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Shared state the maintenance pass prunes
#[derive(Clone)]
pub struct MaintenanceTargets {
    /// Velocity windows
    pub velocity: Arc<VelocityGuard>,
    /// Collaborator cache
    pub geo_cache: Arc<GeoCache>,
    /// Profile store (per-customer locks)
    pub profiles: Arc<BehaviorProfileStore>,
    /// Device registry (per-fingerprint locks)
    pub devices: Arc<DeviceRegistry>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

/// What one pass reclaimed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Customers whose velocity windows emptied
    pub idle_customers: usize,
    /// Expired geo cache entries
    pub expired_cache_entries: usize,
    /// Idle key locks
    pub idle_locks: usize,
}

impl MaintenanceTargets {
    /// Run one pass now
    pub fn run_once(&self) -> MaintenanceReport {
        let now = self.clock.now();
        MaintenanceReport {
            idle_customers: self.velocity.prune_idle(now),
            expired_cache_entries: self.geo_cache.prune_expired(now),
            idle_locks: self.profiles.prune_idle_locks() + self.devices.prune_idle_locks(),
        }
    }
}

/// Running maintenance task
pub struct MaintenanceHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Spawn the loop, one pass every `every`
    pub fn spawn(targets: MaintenanceTargets, every: Duration) -> Self {
        let (shutdown, mut stop) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => {
                        let report = targets.run_once();
                        debug!("Maintenance pass: {:?}", report);
                    }
                }
            }
            info!("Maintenance loop stopped");
        });

        info!("Maintenance loop started (every {:?})", every);
        Self { shutdown, task }
    }

    /// Stop the loop and wait for it to exit
    pub async fn shutdown(self) -> Result<()> {
        // The receiver is gone only if the task already ended
        let _ = self.shutdown.send(());
        self.task
            .await
            .map_err(|e| Error::Internal(format!("maintenance task failed: {}", e)))
    }

    /// Whether the loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
