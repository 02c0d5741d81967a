use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::types::BigDecimal;
use sqlx::{prelude::FromRow, PgPool};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{info, warn};

use super::models::*;
use crate::error::{AppError, AppResult, RaffleError};

/// Persistence seam for raffles, entries, associations and winners.
///
/// Single-record writes are atomic; `save_winners` and `record_purchase`
/// are atomic as a whole.
#[async_trait]
pub trait RaffleStore: Send + Sync {
    async fn create_raffle(&self, new: NewRaffle) -> AppResult<Raffle>;

    async fn get_raffle(&self, raffle_id: i64) -> AppResult<Option<Raffle>>;

    async fn list_raffles(&self) -> AppResult<Vec<Raffle>>;

    /// Raffles whose end date has passed and that are not closed or refunded
    async fn expired_unsettled(&self, now: DateTime<Utc>) -> AppResult<Vec<Raffle>>;

    async fn chosen_data(&self, raffle_id: i64) -> AppResult<ChosenData>;

    async fn record_purchase(
        &self,
        purchase: TicketPurchase,
        now: DateTime<Utc>,
    ) -> AppResult<PurchaseReceipt>;

    /// Take the settlement lease on a raffle. Returns false if another
    /// settler holds a live lease or the raffle is already settled.
    async fn try_acquire_lease(
        &self,
        raffle_id: i64,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> AppResult<bool>;

    async fn release_lease(&self, raffle_id: i64) -> AppResult<()>;

    /// Upsert every winner keyed by (raffle, address); all or nothing.
    async fn save_winners(
        &self,
        raffle_id: i64,
        winners: &[AggregatedWinner],
        tx_hash: &str,
    ) -> AppResult<usize>;

    /// Remember the settling transaction ahead of the terminal status,
    /// so an interrupted settlement can resume without a second chain call.
    async fn record_settlement_tx(&self, raffle_id: i64, tx_hash: &str) -> AppResult<()>;

    async fn update_status(
        &self,
        raffle_id: i64,
        status: RaffleStatus,
        settlement_tx: Option<&str>,
    ) -> AppResult<()>;

    async fn mark_tickets_won(&self, raffle_id: i64, addresses: &[String]) -> AppResult<u64>;

    async fn raffle_winners(&self, raffle_id: i64) -> AppResult<Vec<WinnerRecord>>;

    async fn past_winners(&self) -> AppResult<Vec<PastWinner>>;

    async fn user_tickets(&self, address: &str, now: DateTime<Utc>) -> AppResult<Vec<UserTicket>>;
}

const RAFFLE_COLUMNS: &str = r#"
    id, title, description, blockchain_id, start_no, end_no, ticket_price,
    expected_winners, winning_price, start_date, end_date, status, settlement_tx,
    created_at, updated_at
"#;

#[derive(FromRow)]
struct RaffleRow {
    id: i64,
    title: String,
    description: String,
    blockchain_id: i64,
    start_no: i32,
    end_no: i32,
    ticket_price: BigDecimal,
    expected_winners: i32,
    winning_price: BigDecimal,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    status: RaffleStatus,
    settlement_tx: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RaffleRow> for Raffle {
    type Error = AppError;

    fn try_from(row: RaffleRow) -> Result<Self, Self::Error> {
        Ok(Raffle {
            id: row.id,
            title: row.title,
            description: row.description,
            blockchain_id: row.blockchain_id,
            start_no: row.start_no,
            end_no: row.end_no,
            ticket_price: to_decimal(&row.ticket_price)?,
            expected_winners: row.expected_winners,
            winning_price: to_decimal(&row.winning_price)?,
            start_date: row.start_date,
            end_date: row.end_date,
            status: row.status,
            settlement_tx: row.settlement_tx,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct TicketRow {
    raffle_id: i64,
    status: TicketStatus,
    title: String,
    description: String,
    ticket_price: BigDecimal,
    raffle_status: RaffleStatus,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
}

fn to_decimal(value: &BigDecimal) -> AppResult<Decimal> {
    Ok(Decimal::from_str(&value.to_string())?.normalize())
}

fn to_big_decimal(value: Decimal) -> AppResult<BigDecimal> {
    BigDecimal::from_str(&value.to_string())
        .map_err(|e| AppError::InvalidInput(format!("Invalid decimal conversion: {}", e)))
}

/// Postgres-backed raffle store - the source of truth in production
pub struct PgRaffleStore {
    pool: PgPool,
}

impl PgRaffleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_raffles(&self, sql: &str) -> AppResult<Vec<Raffle>> {
        sqlx::query_as::<_, RaffleRow>(sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Raffle::try_from)
            .collect()
    }
}

#[async_trait]
impl RaffleStore for PgRaffleStore {
    async fn create_raffle(&self, new: NewRaffle) -> AppResult<Raffle> {
        let plan = new.plan()?;

        let sql = format!(
            r#"
            INSERT INTO raffles (
                title, description, blockchain_id, start_no, end_no, ticket_price,
                expected_winners, winning_price, start_date, end_date, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'not_started')
            ON CONFLICT (blockchain_id) DO NOTHING
            RETURNING {}
            "#,
            RAFFLE_COLUMNS
        );

        let row = sqlx::query_as::<_, RaffleRow>(&sql)
            .bind(&new.title)
            .bind(&new.description)
            .bind(new.blockchain_id)
            .bind(new.start_no)
            .bind(new.end_no)
            .bind(to_big_decimal(new.ticket_price)?)
            .bind(plan.expected_winners)
            .bind(to_big_decimal(plan.winning_price)?)
            .bind(new.start_date)
            .bind(new.end_date)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RaffleError::DuplicateBlockchainId(new.blockchain_id))?;

        info!("🎟️ Raffle {} registered (chain id {})", row.id, row.blockchain_id);
        Raffle::try_from(row)
    }

    async fn get_raffle(&self, raffle_id: i64) -> AppResult<Option<Raffle>> {
        let sql = format!("SELECT {} FROM raffles WHERE id = $1", RAFFLE_COLUMNS);
        sqlx::query_as::<_, RaffleRow>(&sql)
            .bind(raffle_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Raffle::try_from)
            .transpose()
    }

    async fn list_raffles(&self) -> AppResult<Vec<Raffle>> {
        let sql = format!("SELECT {} FROM raffles ORDER BY end_date DESC", RAFFLE_COLUMNS);
        self.fetch_raffles(&sql).await
    }

    async fn expired_unsettled(&self, now: DateTime<Utc>) -> AppResult<Vec<Raffle>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM raffles
            WHERE end_date <= $1 AND status IN ('not_started', 'active')
            ORDER BY end_date ASC
            "#,
            RAFFLE_COLUMNS
        );

        sqlx::query_as::<_, RaffleRow>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Raffle::try_from)
            .collect()
    }

    async fn chosen_data(&self, raffle_id: i64) -> AppResult<ChosenData> {
        let rows: Vec<(String, i32)> = sqlx::query_as(
            r#"
            SELECT buyer, number
            FROM raffle_entries
            WHERE raffle_id = $1
            "#,
        )
        .bind(raffle_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ChosenData::from_rows(rows))
    }

    async fn record_purchase(
        &self,
        purchase: TicketPurchase,
        now: DateTime<Utc>,
    ) -> AppResult<PurchaseReceipt> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes purchases on the same raffle
        let sql = format!("SELECT {} FROM raffles WHERE id = $1 FOR UPDATE", RAFFLE_COLUMNS);
        let raffle = sqlx::query_as::<_, RaffleRow>(&sql)
            .bind(purchase.raffle_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(Raffle::try_from)
            .transpose()?
            .ok_or(RaffleError::NotFound(purchase.raffle_id))?;

        raffle.ensure_open(now)?;
        let numbers: Vec<i32> = raffle.validate_numbers(&purchase.numbers)?.into_iter().collect();

        let taken: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT number FROM raffle_entries
            WHERE raffle_id = $1 AND number = ANY($2)
            ORDER BY number
            LIMIT 1
            "#,
        )
        .bind(raffle.id)
        .bind(&numbers)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((number,)) = taken {
            return Err(RaffleError::NumberTaken {
                raffle_id: raffle.id,
                number,
            }
            .into());
        }

        sqlx::query("INSERT INTO users (address) VALUES ($1) ON CONFLICT (address) DO NOTHING")
            .bind(&purchase.buyer)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO raffle_entries (raffle_id, number, buyer, purchase_tx)
            SELECT $1, n, $3, $4 FROM UNNEST($2::INTEGER[]) AS n
            "#,
        )
        .bind(raffle.id)
        .bind(&numbers)
        .bind(&purchase.buyer)
        .bind(&purchase.tx_hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO user_raffles (user_address, raffle_id, status)
            VALUES ($1, $2, 'active')
            ON CONFLICT (user_address, raffle_id) DO NOTHING
            "#,
        )
        .bind(&purchase.buyer)
        .bind(raffle.id)
        .execute(&mut *tx)
        .await?;

        let mut raffle_status = raffle.status;
        if raffle_status == RaffleStatus::NotStarted {
            sqlx::query(
                "UPDATE raffles SET status = 'active', updated_at = NOW() WHERE id = $1 AND status = 'not_started'",
            )
            .bind(raffle.id)
            .execute(&mut *tx)
            .await?;
            raffle_status = RaffleStatus::Active;
        }

        let buyer_numbers: Vec<(i32,)> = sqlx::query_as(
            "SELECT number FROM raffle_entries WHERE raffle_id = $1 AND buyer = $2 ORDER BY number",
        )
        .bind(raffle.id)
        .bind(&purchase.buyer)
        .fetch_all(&mut *tx)
        .await?;

        let (taken_count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM raffle_entries WHERE raffle_id = $1")
                .bind(raffle.id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;

        info!(
            "🎫 {} bought {} number(s) in raffle {}",
            purchase.buyer,
            numbers.len(),
            raffle.id
        );

        Ok(PurchaseReceipt {
            raffle_id: raffle.id,
            buyer: purchase.buyer,
            numbers: buyer_numbers.into_iter().map(|(n,)| n).collect(),
            taken_count: taken_count as usize,
            raffle_status,
        })
    }

    async fn try_acquire_lease(
        &self,
        raffle_id: i64,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE raffles
            SET lease_until = $2, updated_at = NOW()
            WHERE id = $1
              AND status IN ('not_started', 'active')
              AND (lease_until IS NULL OR lease_until < $3)
            "#,
        )
        .bind(raffle_id)
        .bind(now + ttl)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, raffle_id: i64) -> AppResult<()> {
        sqlx::query("UPDATE raffles SET lease_until = NULL WHERE id = $1")
            .bind(raffle_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_winners(
        &self,
        raffle_id: i64,
        winners: &[AggregatedWinner],
        tx_hash: &str,
    ) -> AppResult<usize> {
        let mut tx = self.pool.begin().await?;

        for winner in winners {
            sqlx::query(
                r#"
                INSERT INTO winners (raffle_id, user_address, winning_numbers, amount_won, tx_hash)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (raffle_id, user_address) DO UPDATE
                SET winning_numbers = EXCLUDED.winning_numbers,
                    amount_won = EXCLUDED.amount_won,
                    tx_hash = EXCLUDED.tx_hash,
                    updated_at = NOW()
                "#,
            )
            .bind(raffle_id)
            .bind(&winner.address)
            .bind(&winner.numbers)
            .bind(winner.amount_won.to_string())
            .bind(tx_hash)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(winners.len())
    }

    async fn record_settlement_tx(&self, raffle_id: i64, tx_hash: &str) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE raffles SET settlement_tx = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(raffle_id)
        .bind(tx_hash)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RaffleError::NotFound(raffle_id).into());
        }
        Ok(())
    }

    async fn update_status(
        &self,
        raffle_id: i64,
        status: RaffleStatus,
        settlement_tx: Option<&str>,
    ) -> AppResult<()> {
        let current: (RaffleStatus,) = sqlx::query_as("SELECT status FROM raffles WHERE id = $1")
            .bind(raffle_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RaffleError::NotFound(raffle_id))?;

        current.0.ensure_transition(status)?;

        // Conditional on the status we validated against
        let result = sqlx::query(
            r#"
            UPDATE raffles
            SET status = $2,
                settlement_tx = COALESCE($3, settlement_tx),
                updated_at = NOW()
            WHERE id = $1 AND status = $4
            "#,
        )
        .bind(raffle_id)
        .bind(status)
        .bind(settlement_tx)
        .bind(current.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!("Raffle {} status changed concurrently", raffle_id);
            return Err(RaffleError::InvalidTransition {
                from: current.0,
                to: status,
            }
            .into());
        }

        Ok(())
    }

    async fn mark_tickets_won(&self, raffle_id: i64, addresses: &[String]) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE user_raffles
            SET status = 'won'
            WHERE raffle_id = $1 AND user_address = ANY($2)
            "#,
        )
        .bind(raffle_id)
        .bind(addresses.to_vec())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn raffle_winners(&self, raffle_id: i64) -> AppResult<Vec<WinnerRecord>> {
        let winners = sqlx::query_as::<_, WinnerRecord>(
            r#"
            SELECT raffle_id, user_address, winning_numbers, amount_won, tx_hash, created_at, updated_at
            FROM winners
            WHERE raffle_id = $1
            ORDER BY user_address
            "#,
        )
        .bind(raffle_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(winners)
    }

    async fn past_winners(&self) -> AppResult<Vec<PastWinner>> {
        let winners = sqlx::query_as::<_, PastWinner>(
            r#"
            SELECT w.raffle_id, r.title AS raffle_title, w.user_address, w.winning_numbers,
                   w.amount_won, w.tx_hash, r.end_date
            FROM winners w
            JOIN raffles r ON r.id = w.raffle_id
            ORDER BY r.end_date DESC, w.user_address
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(winners)
    }

    async fn user_tickets(&self, address: &str, now: DateTime<Utc>) -> AppResult<Vec<UserTicket>> {
        let rows = sqlx::query_as::<_, TicketRow>(
            r#"
            SELECT ur.raffle_id, ur.status, r.title, r.description, r.ticket_price,
                   r.status AS raffle_status, r.start_date, r.end_date
            FROM user_raffles ur
            JOIN raffles r ON r.id = ur.raffle_id
            WHERE ur.user_address = $1
            ORDER BY ur.joined_at
            "#,
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await?;

        let entries: Vec<(i64, i32)> = sqlx::query_as(
            "SELECT raffle_id, number FROM raffle_entries WHERE buyer = $1 ORDER BY number",
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await?;

        let mut numbers_by_raffle: HashMap<i64, Vec<i32>> = HashMap::new();
        for (raffle_id, number) in entries {
            numbers_by_raffle.entry(raffle_id).or_default().push(number);
        }

        let wins: Vec<(i64, String)> = sqlx::query_as(
            "SELECT raffle_id, amount_won FROM winners WHERE user_address = $1",
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await?;
        let wins: HashMap<i64, String> = wins.into_iter().collect();

        rows.into_iter()
            .map(|row| -> AppResult<UserTicket> {
                let numbers = numbers_by_raffle.remove(&row.raffle_id).unwrap_or_default();
                let ticket_price = to_decimal(&row.ticket_price)?;
                Ok(UserTicket {
                    raffle_id: row.raffle_id,
                    title: row.title,
                    description: row.description,
                    amount: ticket_price * Decimal::from(numbers.len()),
                    numbers,
                    ticket_price,
                    status: TicketStatus::resolve(row.status, row.end_date, now),
                    raffle_status: row.raffle_status,
                    start_date: row.start_date,
                    end_date: row.end_date,
                    win_amount: wins.get(&row.raffle_id).cloned(),
                })
            })
            .collect()
    }
}
