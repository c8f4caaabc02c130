//! Reconcile sweep
//!
//! Periodic safety net behind the lazy expiry path: reconciles users whose active
//! record has lapsed and re-confirms paid orders that never produced a record.
//! Everything goes through the billing services; nothing here writes VIP state itself.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};
use vipdesk_billing::{SweepReport, SyncService};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepRun {
    pub expired: SweepReport,
    pub orders: SweepReport,
}

/// Runs sweeps one at a time; an overlapping tick is skipped
#[derive(Clone)]
pub struct ReconcileSweeper {
    sync: SyncService,
    batch: i64,
    running: Arc<Mutex<()>>,
}

impl ReconcileSweeper {
    pub fn new(sync: SyncService, batch: i64) -> Self {
        Self {
            sync,
            batch,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Run one sweep. Returns `None` when the previous run is still in progress.
    pub async fn run_once(&self) -> Option<SweepRun> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("Previous reconcile sweep still running, skipping this tick");
            return None;
        };

        let mut run = SweepRun::default();

        match self.sync.sweep_expired(self.batch).await {
            Ok(report) => run.expired = report,
            Err(e) => error!(error = %e, "Expired subscription sweep failed"),
        }

        match self.sync.repair_unfulfilled_orders(self.batch).await {
            Ok(report) => run.orders = report,
            Err(e) => error!(error = %e, "Unfulfilled order sweep failed"),
        }

        if run.expired.scanned as i64 >= self.batch || run.orders.scanned as i64 >= self.batch {
            info!(batch = self.batch, "Sweep batch was full, remaining work continues next tick");
        }

        Some(run)
    }
}
