use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::chain::ChainGateway;
use crate::error::{AppError, AppResult, RaffleError, SettlementError};
use crate::raffle::models::{Raffle, RaffleStatus};
use crate::raffle::RaffleStore;
use crate::settlement::winners::aggregate_winners;

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// How long one settler may hold a raffle before others can take over
    pub lease_ttl: Duration,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::minutes(10),
        }
    }
}

/// Result of one raffle's settlement attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Closed { tx_hash: String, winners: usize },
    Refunded { tx_hash: String },
    /// Another settler holds the raffle, or it was already settled
    Skipped,
}

/// Summary of one scan
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub scan_id: Uuid,
    /// Another scan was running in this process; nothing was examined
    pub already_running: bool,
    pub examined: usize,
    pub closed: usize,
    pub refunded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub anomalies: usize,
}

/// Settlement reconciler - drives expired raffles to closed or refunded
pub struct SettlementReconciler {
    store: Arc<dyn RaffleStore>,
    gateway: Arc<dyn ChainGateway>,
    config: SettlementConfig,
    scan_guard: Mutex<()>,
}

impl SettlementReconciler {
    pub fn new(
        store: Arc<dyn RaffleStore>,
        gateway: Arc<dyn ChainGateway>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
            scan_guard: Mutex::new(()),
        }
    }

    /// Settle every raffle whose end date has passed.
    ///
    /// Per-raffle failures are logged and counted; only the expired-raffle
    /// query itself returns an error.
    pub async fn scan(&self) -> AppResult<ScanReport> {
        let scan_id = Uuid::new_v4();
        let span = info_span!("settlement_scan", %scan_id);
        self.run_scan(scan_id).instrument(span).await
    }

    async fn run_scan(&self, scan_id: Uuid) -> AppResult<ScanReport> {
        let mut report = ScanReport {
            scan_id,
            ..Default::default()
        };

        let Ok(_guard) = self.scan_guard.try_lock() else {
            warn!("⏭️ Settlement scan already in progress, skipping");
            report.already_running = true;
            return Ok(report);
        };

        let raffles = self.store.expired_unsettled(Utc::now()).await?;
        if raffles.is_empty() {
            debug!("✓ No expired raffles to settle");
            return Ok(report);
        }

        info!("🔄 Settling {} expired raffles", raffles.len());

        for raffle in &raffles {
            report.examined += 1;

            match self.settle_one(raffle).await {
                Ok(SettlementOutcome::Closed { .. }) => report.closed += 1,
                Ok(SettlementOutcome::Refunded { .. }) => report.refunded += 1,
                Ok(SettlementOutcome::Skipped) => report.skipped += 1,
                Err(e) if e.is_anomaly() => {
                    report.anomalies += 1;
                    error!("🚨 SETTLEMENT ANOMALY: {}", e);
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("❌ {}", e);
                }
            }
        }

        info!(
            "✓ Settlement scan done: examined={} closed={} refunded={} skipped={} failed={} anomalies={}",
            report.examined,
            report.closed,
            report.refunded,
            report.skipped,
            report.failed,
            report.anomalies
        );

        Ok(report)
    }

    /// Settle one expired raffle under the store lease
    pub async fn settle_one(&self, raffle: &Raffle) -> Result<SettlementOutcome, SettlementError> {
        let acquired = self
            .store
            .try_acquire_lease(raffle.id, Utc::now(), self.config.lease_ttl)
            .await
            .map_err(|e| store_error(raffle, e))?;

        if !acquired {
            debug!("⏭️ Raffle {} is leased or already settled", raffle.id);
            return Ok(SettlementOutcome::Skipped);
        }

        let result = self.settle_leased(raffle).await;

        if let Err(e) = self.store.release_lease(raffle.id).await {
            // The lease expires on its own
            warn!("⚠️ Failed to release lease on raffle {}: {}", raffle.id, e);
        }

        result
    }

    /// Settle a single raffle on demand
    pub async fn settle_raffle(&self, raffle_id: i64) -> AppResult<SettlementOutcome> {
        let raffle = self
            .store
            .get_raffle(raffle_id)
            .await?
            .ok_or(RaffleError::NotFound(raffle_id))?;

        if raffle.status.is_terminal() {
            return Err(AppError::InvalidInput(format!(
                "Raffle {} is already {}",
                raffle_id, raffle.status
            )));
        }
        if !raffle.is_expired(Utc::now()) {
            return Err(AppError::InvalidInput(format!(
                "Raffle {} has not ended yet",
                raffle_id
            )));
        }

        Ok(self.settle_one(&raffle).await?)
    }

    async fn settle_leased(&self, raffle: &Raffle) -> Result<SettlementOutcome, SettlementError> {
        let chosen = self
            .store
            .chosen_data(raffle.id)
            .await
            .map_err(|e| store_error(raffle, e))?;
        let entries = chosen.taken_numbers().len();

        debug!("🎟️ Raffle {} has {} entries", raffle.id, entries);

        // A draw needs at least two entries
        if entries <= 1 {
            let tx_hash = self.refund_raffle(raffle).await?;
            Ok(SettlementOutcome::Refunded { tx_hash })
        } else {
            self.close_raffle(raffle).await
        }
    }

    /// Close on chain, then persist winners and mark the raffle closed.
    ///
    /// A raffle the chain already reports winners for was closed by an
    /// earlier attempt; it is never closed twice, only persisted again.
    pub async fn close_raffle(&self, raffle: &Raffle) -> Result<SettlementOutcome, SettlementError> {
        let existing = self
            .gateway
            .winners_with_numbers(raffle.blockchain_id)
            .await
            .map_err(|e| chain_error(raffle, e))?;

        let (tx_hash, rows) = if existing.is_empty() {
            info!(
                "🎯 Closing raffle {} (blockchain id {})",
                raffle.id, raffle.blockchain_id
            );

            let tx_hash = self
                .gateway
                .close_raffle(raffle.blockchain_id)
                .await
                .map_err(|e| chain_error(raffle, e))?;

            // From here on the chain is settled
            self.remember_tx(raffle, &tx_hash).await;

            let rows = self
                .gateway
                .winners_with_numbers(raffle.blockchain_id)
                .await
                .map_err(|e| anomaly(raffle, &tx_hash, format!("winners query failed: {}", e)))?;
            (tx_hash, rows)
        } else {
            let tx_hash = self.recorded_close_tx(raffle).await?;
            warn!(
                "🔁 Raffle {} already closed on chain (tx: {}), resuming",
                raffle.id, tx_hash
            );
            (tx_hash, existing)
        };

        let winners = aggregate_winners(&rows).map_err(|e| anomaly(raffle, &tx_hash, e))?;

        if winners.is_empty() {
            return Err(SettlementError::NoWinners {
                raffle_id: raffle.id,
                blockchain_id: raffle.blockchain_id,
                tx_hash,
            });
        }

        info!("🏆 Raffle {} has {} unique winners", raffle.id, winners.len());
        for winner in &winners {
            info!(
                "   - {}: numbers {:?} = {} wei",
                winner.address, winner.numbers, winner.amount_won
            );
        }

        self.store
            .save_winners(raffle.id, &winners, &tx_hash)
            .await
            .map_err(|e| anomaly(raffle, &tx_hash, e))?;

        // Tickets first: once the raffle is closed it is never scanned again
        let addresses: Vec<String> = winners.iter().map(|w| w.address.clone()).collect();
        let marked = self
            .store
            .mark_tickets_won(raffle.id, &addresses)
            .await
            .map_err(|e| anomaly(raffle, &tx_hash, e))?;

        self.store
            .update_status(raffle.id, RaffleStatus::Closed, Some(&tx_hash))
            .await
            .map_err(|e| anomaly(raffle, &tx_hash, e))?;

        info!(
            "✅ Raffle {} closed (tx: {}), {} tickets marked won",
            raffle.id, tx_hash, marked
        );

        Ok(SettlementOutcome::Closed {
            tx_hash,
            winners: winners.len(),
        })
    }

    /// Refund on chain, then mark the raffle refunded
    pub async fn refund_raffle(&self, raffle: &Raffle) -> Result<String, SettlementError> {
        let tx_hash = match &raffle.settlement_tx {
            // Refunded by an earlier attempt whose status write failed
            Some(tx_hash) => {
                warn!(
                    "🔁 Raffle {} already refunded on chain (tx: {}), resuming",
                    raffle.id, tx_hash
                );
                tx_hash.clone()
            }
            None => {
                info!(
                    "↩️ Refunding raffle {} (blockchain id {})",
                    raffle.id, raffle.blockchain_id
                );
                let tx_hash = self
                    .gateway
                    .refund_raffle(raffle.blockchain_id)
                    .await
                    .map_err(|e| chain_error(raffle, e))?;
                self.remember_tx(raffle, &tx_hash).await;
                tx_hash
            }
        };

        self.store
            .update_status(raffle.id, RaffleStatus::Refunded, Some(&tx_hash))
            .await
            .map_err(|e| anomaly(raffle, &tx_hash, e))?;

        info!("✅ Raffle {} refunded (tx: {})", raffle.id, tx_hash);
        Ok(tx_hash)
    }

    async fn remember_tx(&self, raffle: &Raffle, tx_hash: &str) {
        if let Err(e) = self.store.record_settlement_tx(raffle.id, tx_hash).await {
            // Later steps still carry the hash; only a resume needs it
            error!(
                "🚨 Raffle {} settled in tx {} but the hash was not stored: {}",
                raffle.id, tx_hash, e
            );
        }
    }

    /// Close transaction of a raffle settled by an earlier attempt
    async fn recorded_close_tx(&self, raffle: &Raffle) -> Result<String, SettlementError> {
        if let Some(tx_hash) = &raffle.settlement_tx {
            return Ok(tx_hash.clone());
        }

        let stored = self
            .store
            .raffle_winners(raffle.id)
            .await
            .map_err(|e| anomaly(raffle, UNKNOWN_TX, e))?;

        stored
            .into_iter()
            .next()
            .map(|winner| winner.tx_hash)
            .ok_or_else(|| {
                anomaly(
                    raffle,
                    UNKNOWN_TX,
                    "closed on chain but no close transaction is recorded",
                )
            })
    }
}

const UNKNOWN_TX: &str = "unknown";

fn chain_error(raffle: &Raffle, err: AppError) -> SettlementError {
    SettlementError::ChainCallFailed {
        raffle_id: raffle.id,
        blockchain_id: raffle.blockchain_id,
        message: err.to_string(),
    }
}

fn store_error(raffle: &Raffle, err: AppError) -> SettlementError {
    SettlementError::Store {
        raffle_id: raffle.id,
        message: err.to_string(),
    }
}

fn anomaly(raffle: &Raffle, tx_hash: &str, err: impl ToString) -> SettlementError {
    SettlementError::Anomaly {
        raffle_id: raffle.id,
        blockchain_id: raffle.blockchain_id,
        tx_hash: tx_hash.to_string(),
        message: err.to_string(),
    }
}
