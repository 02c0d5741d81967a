// Settlement Scheduler - optional in-process trigger for the reconciler
//
// The external cron call stays the primary cadence; this loop is for
// deployments without one. Overlap with the external trigger is handled
// by the reconciler's scan guard and raffle leases.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use crate::settlement::SettlementReconciler;

/// Settlement scheduler - calls `scan` on a fixed interval
pub struct SettlementScheduler {
    period: Duration,
    reconciler: Arc<SettlementReconciler>,
}

impl SettlementScheduler {
    pub fn new(period: Duration, reconciler: Arc<SettlementReconciler>) -> Self {
        Self { period, reconciler }
    }

    /// `None` when the interval is zero (disabled)
    pub fn from_secs(secs: u64, reconciler: Arc<SettlementReconciler>) -> Option<Self> {
        (secs > 0).then(|| Self::new(Duration::from_secs(secs), reconciler))
    }

    /// Start the scheduler (runs in background)
    pub fn start(&self) -> JoinHandle<()> {
        let period = self.period;
        let reconciler = self.reconciler.clone();

        info!("⏰ Settlement scheduler running every {:?}", period);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                match reconciler.scan().await {
                    Ok(report) if report.examined > 0 => {
                        info!(
                            "✓ Scheduled settlement: {} closed, {} refunded, {} failed",
                            report.closed, report.refunded, report.failed
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("❌ Scheduled settlement scan failed: {:?}", e),
                }
            }
        })
    }
}
