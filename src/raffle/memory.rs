use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tracing::info;

use super::models::*;
use super::repository::RaffleStore;
use crate::error::{AppError, AppResult, RaffleError};

#[derive(Default)]
struct Tables {
    next_raffle_id: i64,
    raffles: BTreeMap<i64, Raffle>,
    leases: HashMap<i64, DateTime<Utc>>,
    entries: HashMap<i64, ChosenData>,
    /// (user address, raffle id) -> stored ticket status, in join order
    user_raffles: Vec<((String, i64), TicketStatus)>,
    winners: BTreeMap<(i64, String), WinnerRecord>,
}

/// In-memory raffle store for local development and tests.
///
/// Every operation runs under one lock, so multi-row writes are atomic.
pub struct InMemoryRaffleStore {
    tables: Mutex<Tables>,
}

impl InMemoryRaffleStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                next_raffle_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Insert a raffle as-is, bypassing creation rules (fixtures)
    #[cfg(test)]
    pub fn insert_raffle(&self, raffle: Raffle) {
        let mut tables = self.tables.lock();
        tables.next_raffle_id = tables.next_raffle_id.max(raffle.id + 1);
        tables.raffles.insert(raffle.id, raffle);
    }
}

impl Default for InMemoryRaffleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RaffleStore for InMemoryRaffleStore {
    async fn create_raffle(&self, new: NewRaffle) -> AppResult<Raffle> {
        let plan = new.plan()?;
        let mut tables = self.tables.lock();

        if tables
            .raffles
            .values()
            .any(|r| r.blockchain_id == new.blockchain_id)
        {
            return Err(RaffleError::DuplicateBlockchainId(new.blockchain_id).into());
        }

        let now = Utc::now();
        let id = tables.next_raffle_id;
        tables.next_raffle_id += 1;

        let raffle = Raffle {
            id,
            title: new.title,
            description: new.description,
            blockchain_id: new.blockchain_id,
            start_no: new.start_no,
            end_no: new.end_no,
            ticket_price: new.ticket_price,
            expected_winners: plan.expected_winners,
            winning_price: plan.winning_price,
            start_date: new.start_date,
            end_date: new.end_date,
            status: RaffleStatus::NotStarted,
            settlement_tx: None,
            created_at: now,
            updated_at: now,
        };

        tables.raffles.insert(id, raffle.clone());
        info!("🎟️ Raffle {} registered (chain id {})", id, raffle.blockchain_id);
        Ok(raffle)
    }

    async fn get_raffle(&self, raffle_id: i64) -> AppResult<Option<Raffle>> {
        Ok(self.tables.lock().raffles.get(&raffle_id).cloned())
    }

    async fn list_raffles(&self) -> AppResult<Vec<Raffle>> {
        let tables = self.tables.lock();
        let mut raffles: Vec<Raffle> = tables.raffles.values().cloned().collect();
        raffles.sort_by(|a, b| b.end_date.cmp(&a.end_date));
        Ok(raffles)
    }

    async fn expired_unsettled(&self, now: DateTime<Utc>) -> AppResult<Vec<Raffle>> {
        let tables = self.tables.lock();
        let mut raffles: Vec<Raffle> = tables
            .raffles
            .values()
            .filter(|r| r.is_expired(now) && !r.status.is_terminal())
            .cloned()
            .collect();
        raffles.sort_by(|a, b| a.end_date.cmp(&b.end_date));
        Ok(raffles)
    }

    async fn chosen_data(&self, raffle_id: i64) -> AppResult<ChosenData> {
        Ok(self
            .tables
            .lock()
            .entries
            .get(&raffle_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_purchase(
        &self,
        purchase: TicketPurchase,
        now: DateTime<Utc>,
    ) -> AppResult<PurchaseReceipt> {
        let mut tables = self.tables.lock();

        let raffle = tables
            .raffles
            .get(&purchase.raffle_id)
            .cloned()
            .ok_or(RaffleError::NotFound(purchase.raffle_id))?;

        raffle.ensure_open(now)?;
        let numbers = raffle.validate_numbers(&purchase.numbers)?;

        let chosen = tables.entries.entry(raffle.id).or_default();
        if let Some(&number) = numbers.iter().find(|n| chosen.is_taken(**n)) {
            return Err(RaffleError::NumberTaken {
                raffle_id: raffle.id,
                number,
            }
            .into());
        }
        chosen.merge(&purchase.buyer, numbers.iter().copied());
        let buyer_numbers = chosen.buyer_numbers(&purchase.buyer);
        let taken_count = chosen.taken_numbers().len();

        let key = (purchase.buyer.clone(), raffle.id);
        if !tables.user_raffles.iter().any(|(k, _)| *k == key) {
            tables.user_raffles.push((key, TicketStatus::Active));
        }

        let mut raffle_status = raffle.status;
        if raffle_status == RaffleStatus::NotStarted {
            if let Some(stored) = tables.raffles.get_mut(&raffle.id) {
                stored.status = RaffleStatus::Active;
                stored.updated_at = now;
            }
            raffle_status = RaffleStatus::Active;
        }

        Ok(PurchaseReceipt {
            raffle_id: raffle.id,
            buyer: purchase.buyer,
            numbers: buyer_numbers,
            taken_count,
            raffle_status,
        })
    }

    async fn try_acquire_lease(
        &self,
        raffle_id: i64,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> AppResult<bool> {
        let mut tables = self.tables.lock();

        let settled = match tables.raffles.get(&raffle_id) {
            Some(raffle) => raffle.status.is_terminal(),
            None => return Ok(false),
        };
        if settled {
            return Ok(false);
        }

        if let Some(until) = tables.leases.get(&raffle_id) {
            if *until >= now {
                return Ok(false);
            }
        }

        tables.leases.insert(raffle_id, now + ttl);
        Ok(true)
    }

    async fn release_lease(&self, raffle_id: i64) -> AppResult<()> {
        self.tables.lock().leases.remove(&raffle_id);
        Ok(())
    }

    async fn save_winners(
        &self,
        raffle_id: i64,
        winners: &[AggregatedWinner],
        tx_hash: &str,
    ) -> AppResult<usize> {
        let mut tables = self.tables.lock();
        if !tables.raffles.contains_key(&raffle_id) {
            return Err(RaffleError::NotFound(raffle_id).into());
        }

        let now = Utc::now();
        for winner in winners {
            let key = (raffle_id, winner.address.clone());
            let created_at = tables
                .winners
                .get(&key)
                .map(|existing| existing.created_at)
                .unwrap_or(now);

            tables.winners.insert(
                key,
                WinnerRecord {
                    raffle_id,
                    user_address: winner.address.clone(),
                    winning_numbers: winner.numbers.clone(),
                    amount_won: winner.amount_won.to_string(),
                    tx_hash: tx_hash.to_string(),
                    created_at,
                    updated_at: now,
                },
            );
        }

        Ok(winners.len())
    }

    async fn record_settlement_tx(&self, raffle_id: i64, tx_hash: &str) -> AppResult<()> {
        let mut tables = self.tables.lock();
        let raffle = tables
            .raffles
            .get_mut(&raffle_id)
            .ok_or(RaffleError::NotFound(raffle_id))?;

        raffle.settlement_tx = Some(tx_hash.to_string());
        raffle.updated_at = Utc::now();
        Ok(())
    }

    async fn update_status(
        &self,
        raffle_id: i64,
        status: RaffleStatus,
        settlement_tx: Option<&str>,
    ) -> AppResult<()> {
        let mut tables = self.tables.lock();
        let raffle = tables
            .raffles
            .get_mut(&raffle_id)
            .ok_or(RaffleError::NotFound(raffle_id))?;

        raffle.status.ensure_transition(status)?;
        raffle.status = status;
        if let Some(tx) = settlement_tx {
            raffle.settlement_tx = Some(tx.to_string());
        }
        raffle.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_tickets_won(&self, raffle_id: i64, addresses: &[String]) -> AppResult<u64> {
        let mut tables = self.tables.lock();
        let mut updated = 0;

        for ((address, id), status) in tables.user_raffles.iter_mut() {
            if *id == raffle_id && addresses.contains(address) {
                *status = TicketStatus::Won;
                updated += 1;
            }
        }

        Ok(updated)
    }

    async fn raffle_winners(&self, raffle_id: i64) -> AppResult<Vec<WinnerRecord>> {
        Ok(self
            .tables
            .lock()
            .winners
            .range((raffle_id, String::new())..)
            .take_while(|((id, _), _)| *id == raffle_id)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn past_winners(&self) -> AppResult<Vec<PastWinner>> {
        let tables = self.tables.lock();
        let mut winners: Vec<PastWinner> = tables
            .winners
            .values()
            .filter_map(|w| {
                let raffle = tables.raffles.get(&w.raffle_id)?;
                Some(PastWinner {
                    raffle_id: w.raffle_id,
                    raffle_title: raffle.title.clone(),
                    user_address: w.user_address.clone(),
                    winning_numbers: w.winning_numbers.clone(),
                    amount_won: w.amount_won.clone(),
                    tx_hash: w.tx_hash.clone(),
                    end_date: raffle.end_date,
                })
            })
            .collect();

        winners.sort_by(|a, b| {
            b.end_date
                .cmp(&a.end_date)
                .then_with(|| a.user_address.cmp(&b.user_address))
        });
        Ok(winners)
    }

    async fn user_tickets(&self, address: &str, now: DateTime<Utc>) -> AppResult<Vec<UserTicket>> {
        let tables = self.tables.lock();

        tables
            .user_raffles
            .iter()
            .filter(|((user, _), _)| user == address)
            .map(|((_, raffle_id), stored)| -> AppResult<UserTicket> {
                let raffle = tables.raffles.get(raffle_id).ok_or_else(|| {
                    AppError::Internal(format!("Dangling ticket for raffle {}", raffle_id))
                })?;
                let numbers = tables
                    .entries
                    .get(raffle_id)
                    .map(|chosen| chosen.buyer_numbers(address))
                    .unwrap_or_default();
                let win_amount = tables
                    .winners
                    .get(&(*raffle_id, address.to_string()))
                    .map(|w| w.amount_won.clone());

                Ok(UserTicket {
                    raffle_id: *raffle_id,
                    title: raffle.title.clone(),
                    description: raffle.description.clone(),
                    amount: raffle.ticket_price * Decimal::from(numbers.len()),
                    numbers,
                    ticket_price: raffle.ticket_price,
                    status: TicketStatus::resolve(*stored, raffle.end_date, now),
                    raffle_status: raffle.status,
                    start_date: raffle.start_date,
                    end_date: raffle.end_date,
                    win_amount,
                })
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const ALICE: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const BOB: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    async fn open_raffle(store: &InMemoryRaffleStore) -> Raffle {
        let now = Utc::now();
        store
            .create_raffle(NewRaffle {
                title: "Gold Rush".to_string(),
                description: "Pick your numbers".to_string(),
                blockchain_id: 1,
                start_no: 1,
                end_no: 50,
                ticket_price: dec!(0.5),
                start_date: now - Duration::hours(1),
                end_date: now + Duration::hours(1),
            })
            .await
            .unwrap()
    }

    fn purchase(raffle_id: i64, buyer: &str, numbers: &[i32]) -> TicketPurchase {
        TicketPurchase {
            raffle_id,
            buyer: buyer.to_string(),
            numbers: numbers.to_vec(),
            tx_hash: None,
        }
    }

    #[tokio::test]
    async fn test_purchase_merges_and_activates() {
        let store = InMemoryRaffleStore::new();
        let raffle = open_raffle(&store).await;
        assert_eq!(raffle.status, RaffleStatus::NotStarted);
        assert_eq!(raffle.expected_winners, 5);

        let now = Utc::now();
        store.record_purchase(purchase(raffle.id, ALICE, &[3, 1]), now).await.unwrap();
        let receipt = store
            .record_purchase(purchase(raffle.id, ALICE, &[7]), now)
            .await
            .unwrap();

        assert_eq!(receipt.numbers, vec![1, 3, 7]);
        assert_eq!(receipt.taken_count, 3);
        assert_eq!(receipt.raffle_status, RaffleStatus::Active);

        let tickets = store.user_tickets(ALICE, now).await.unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].amount, dec!(1.5));
        assert_eq!(tickets[0].status, TicketStatus::Active);
    }

    #[tokio::test]
    async fn test_purchase_rejects_taken_numbers() {
        let store = InMemoryRaffleStore::new();
        let raffle = open_raffle(&store).await;
        let now = Utc::now();

        store.record_purchase(purchase(raffle.id, ALICE, &[5]), now).await.unwrap();
        let err = store
            .record_purchase(purchase(raffle.id, BOB, &[4, 5]), now)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AppError::Raffle(RaffleError::NumberTaken { number: 5, .. })
        ));
        // Nothing from the rejected purchase was stored
        let chosen = store.chosen_data(raffle.id).await.unwrap();
        assert!(!chosen.is_taken(4));
        assert!(store.user_tickets(BOB, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_blockchain_id() {
        let store = InMemoryRaffleStore::new();
        open_raffle(&store).await;

        let now = Utc::now();
        let err = store
            .create_raffle(NewRaffle {
                title: "Again".to_string(),
                description: String::new(),
                blockchain_id: 1,
                start_no: 1,
                end_no: 10,
                ticket_price: dec!(1),
                start_date: now,
                end_date: now + Duration::hours(1),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Raffle(RaffleError::DuplicateBlockchainId(1))));
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_expiry() {
        let store = InMemoryRaffleStore::new();
        let raffle = open_raffle(&store).await;
        let now = Utc::now();
        let ttl = Duration::minutes(10);

        assert!(store.try_acquire_lease(raffle.id, now, ttl).await.unwrap());
        assert!(!store.try_acquire_lease(raffle.id, now, ttl).await.unwrap());

        // An abandoned lease can be taken over once it expires
        let later = now + Duration::minutes(11);
        assert!(store.try_acquire_lease(raffle.id, later, ttl).await.unwrap());

        store.release_lease(raffle.id).await.unwrap();
        assert!(store.try_acquire_lease(raffle.id, later, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_status_never_moves_backwards() {
        let store = InMemoryRaffleStore::new();
        let raffle = open_raffle(&store).await;

        store
            .update_status(raffle.id, RaffleStatus::Refunded, Some("0xabc"))
            .await
            .unwrap();
        let err = store
            .update_status(raffle.id, RaffleStatus::Closed, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Raffle(RaffleError::InvalidTransition { .. })
        ));

        let stored = store.get_raffle(raffle.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RaffleStatus::Refunded);
        assert_eq!(stored.settlement_tx.as_deref(), Some("0xabc"));
        assert!(!store
            .try_acquire_lease(raffle.id, Utc::now(), Duration::minutes(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_settlement_tx_is_kept_without_status_change() {
        let store = InMemoryRaffleStore::new();
        let raffle = open_raffle(&store).await;

        store.record_settlement_tx(raffle.id, "0xc105e").await.unwrap();
        let stored = store.get_raffle(raffle.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RaffleStatus::NotStarted);
        assert_eq!(stored.settlement_tx.as_deref(), Some("0xc105e"));

        // The terminal write keeps it when given no hash
        store
            .update_status(raffle.id, RaffleStatus::Closed, None)
            .await
            .unwrap();
        let stored = store.get_raffle(raffle.id).await.unwrap().unwrap();
        assert_eq!(stored.settlement_tx.as_deref(), Some("0xc105e"));

        assert!(matches!(
            store.record_settlement_tx(99, "0x1").await,
            Err(AppError::Raffle(RaffleError::NotFound(99)))
        ));
    }
}
