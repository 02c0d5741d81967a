use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{AppError, AppResult, RaffleError};

/// Share of the pool paid out to winners (1% platform fee)
const PRIZE_POOL_SHARE: Decimal = dec!(0.99);

/// One winner per this many numbers in the range
const ENTRIES_PER_WINNER: i64 = 10;

/// Decimals of the stablecoin amounts reported by the contract
const TOKEN_DECIMALS: u32 = 18;

/// Raffle lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "raffle_status", rename_all = "snake_case")]
#[serde(rename_all = "kebab-case")]
pub enum RaffleStatus {
    NotStarted,
    Active,
    Closed,
    Refunded,
}

impl fmt::Display for RaffleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl RaffleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaffleStatus::NotStarted => "not-started",
            RaffleStatus::Active => "active",
            RaffleStatus::Closed => "closed",
            RaffleStatus::Refunded => "refunded",
        }
    }

    /// Closed and refunded raffles are settled for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, RaffleStatus::Closed | RaffleStatus::Refunded)
    }

    pub fn can_transition_to(&self, next: RaffleStatus) -> bool {
        match (self, next) {
            (RaffleStatus::NotStarted, RaffleStatus::Active) => true,
            (RaffleStatus::NotStarted | RaffleStatus::Active, RaffleStatus::Closed) => true,
            (RaffleStatus::NotStarted | RaffleStatus::Active, RaffleStatus::Refunded) => true,
            _ => false,
        }
    }

    pub fn ensure_transition(&self, next: RaffleStatus) -> Result<(), RaffleError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(RaffleError::InvalidTransition { from: *self, to: next })
        }
    }
}

/// Per-user ticket status for one raffle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "ticket_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Active,
    Won,
    Lost,
}

impl TicketStatus {
    /// A stored `won` always wins; everything else is derived from the end date.
    pub fn resolve(stored: TicketStatus, end_date: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        match stored {
            TicketStatus::Won => TicketStatus::Won,
            _ if end_date <= now => TicketStatus::Lost,
            _ => TicketStatus::Active,
        }
    }
}

impl std::str::FromStr for TicketStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(TicketStatus::Active),
            "won" => Ok(TicketStatus::Won),
            "lost" => Ok(TicketStatus::Lost),
            other => Err(AppError::InvalidInput(format!("Unknown ticket status: {}", other))),
        }
    }
}

/// Raffle entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Raffle {
    pub id: i64,
    pub title: String,
    pub description: String,
    /// Identifier of the raffle inside the contract
    pub blockchain_id: i64,
    pub start_no: i32,
    pub end_no: i32,
    #[serde(with = "rust_decimal::serde::float")]
    pub ticket_price: Decimal,
    pub expected_winners: i32,
    #[serde(with = "rust_decimal::serde::float")]
    pub winning_price: Decimal,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub status: RaffleStatus,
    pub settlement_tx: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Raffle {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.end_date <= now
    }

    /// Check the raffle accepts entries at `now`
    pub fn ensure_open(&self, now: DateTime<Utc>) -> Result<(), RaffleError> {
        let reason = if self.status.is_terminal() {
            Some(format!("raffle is {}", self.status))
        } else if now < self.start_date {
            Some("raffle has not started".to_string())
        } else if self.is_expired(now) {
            Some("raffle has ended".to_string())
        } else {
            None
        };

        match reason {
            Some(reason) => Err(RaffleError::NotOpen {
                raffle_id: self.id,
                reason,
            }),
            None => Ok(()),
        }
    }

    /// De-duplicate the requested numbers and check each one lies in the range
    pub fn validate_numbers(&self, numbers: &[i32]) -> Result<BTreeSet<i32>, RaffleError> {
        if numbers.is_empty() {
            return Err(RaffleError::NoNumbers);
        }

        let mut selected = BTreeSet::new();
        for &number in numbers {
            if number < self.start_no || number > self.end_no {
                return Err(RaffleError::NumberOutOfRange {
                    number,
                    start: self.start_no,
                    end: self.end_no,
                });
            }
            selected.insert(number);
        }

        Ok(selected)
    }
}

/// Input for registering a raffle the admin already created on-chain
#[derive(Debug, Clone)]
pub struct NewRaffle {
    pub title: String,
    pub description: String,
    pub blockchain_id: i64,
    pub start_no: i32,
    pub end_no: i32,
    pub ticket_price: Decimal,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

/// Derived payout plan for a raffle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RafflePlan {
    pub expected_winners: i32,
    pub winning_price: Decimal,
}

impl NewRaffle {
    pub fn total_entries(&self) -> i64 {
        i64::from(self.end_no) - i64::from(self.start_no) + 1
    }

    /// One winner per ten numbers; the pool (minus fee) is split evenly.
    pub fn plan(&self) -> AppResult<RafflePlan> {
        let entries = self.total_entries();
        if entries <= 0 {
            return Err(AppError::InvalidInput(
                "end number must not be below start number".to_string(),
            ));
        }

        let winners = (entries + ENTRIES_PER_WINNER - 1) / ENTRIES_PER_WINNER;
        let pool = Decimal::from(entries) * self.ticket_price * PRIZE_POOL_SHARE;
        let winning_price = (pool / Decimal::from(winners)).round_dp(TOKEN_DECIMALS);

        Ok(RafflePlan {
            expected_winners: i32::try_from(winners)
                .map_err(|_| AppError::InvalidInput("number range too large".to_string()))?,
            winning_price,
        })
    }
}

/// Which numbers each buyer holds in a raffle, keyed by lower-case address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChosenData {
    by_buyer: BTreeMap<String, BTreeSet<i32>>,
}

/// Serialized view of one buyer's numbers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChosenEntry {
    pub buyer: String,
    pub numbers: Vec<i32>,
}

impl ChosenData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(buyer, number)` rows
    pub fn from_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (String, i32)>,
    {
        let mut data = Self::new();
        for (buyer, number) in rows {
            data.merge(&buyer, [number]);
        }
        data
    }

    /// Union `numbers` into the buyer's set
    pub fn merge<I>(&mut self, buyer: &str, numbers: I)
    where
        I: IntoIterator<Item = i32>,
    {
        self.by_buyer
            .entry(buyer.to_lowercase())
            .or_default()
            .extend(numbers);
    }

    /// Union of every buyer's numbers
    pub fn taken_numbers(&self) -> BTreeSet<i32> {
        self.by_buyer.values().flatten().copied().collect()
    }

    pub fn is_taken(&self, number: i32) -> bool {
        self.by_buyer.values().any(|numbers| numbers.contains(&number))
    }

    pub fn buyer_numbers(&self, buyer: &str) -> Vec<i32> {
        self.by_buyer
            .get(&buyer.to_lowercase())
            .map(|numbers| numbers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn entries(&self) -> Vec<ChosenEntry> {
        self.by_buyer
            .iter()
            .map(|(buyer, numbers)| ChosenEntry {
                buyer: buyer.clone(),
                numbers: numbers.iter().copied().collect(),
            })
            .collect()
    }
}

/// A winner after grouping contract entries by address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedWinner {
    pub address: String,
    pub numbers: Vec<i32>,
    /// Amount in the token's smallest unit
    pub amount_won: U256,
}

/// Persisted winner record, unique per (raffle, address)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct WinnerRecord {
    pub raffle_id: i64,
    pub user_address: String,
    pub winning_numbers: Vec<i32>,
    pub amount_won: String,
    pub tx_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Winner joined with its raffle for the public winners list
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PastWinner {
    pub raffle_id: i64,
    pub raffle_title: String,
    pub user_address: String,
    pub winning_numbers: Vec<i32>,
    pub amount_won: String,
    pub tx_hash: String,
    pub end_date: DateTime<Utc>,
}

/// A purchase that already went through `joinRaffle` on-chain
#[derive(Debug, Clone)]
pub struct TicketPurchase {
    pub raffle_id: i64,
    pub buyer: String,
    pub numbers: Vec<i32>,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseReceipt {
    pub raffle_id: i64,
    pub buyer: String,
    /// Every number the buyer now holds in this raffle
    pub numbers: Vec<i32>,
    pub taken_count: usize,
    pub raffle_status: RaffleStatus,
}

/// One raffle from a user's point of view
#[derive(Debug, Clone, Serialize)]
pub struct UserTicket {
    pub raffle_id: i64,
    pub title: String,
    pub description: String,
    pub numbers: Vec<i32>,
    #[serde(with = "rust_decimal::serde::float")]
    pub ticket_price: Decimal,
    /// ticket price times numbers held
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub status: TicketStatus,
    pub raffle_status: RaffleStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub win_amount: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfileStats {
    pub total_tickets: usize,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_wagered: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_winnings: Decimal,
    pub tickets_won: usize,
    pub tickets_lost: usize,
}

impl ProfileStats {
    pub fn from_tickets(tickets: &[UserTicket]) -> AppResult<Self> {
        let mut stats = ProfileStats {
            total_tickets: tickets.len(),
            ..Default::default()
        };

        for ticket in tickets {
            stats.total_wagered += ticket.amount;
            match ticket.status {
                TicketStatus::Won => {
                    stats.tickets_won += 1;
                    if let Some(amount) = &ticket.win_amount {
                        stats.total_winnings += wei_to_token(amount)?;
                    }
                }
                TicketStatus::Lost => stats.tickets_lost += 1,
                TicketStatus::Active => {}
            }
        }

        Ok(stats)
    }
}

/// Lower-case a `0x`-prefixed 20-byte hex address, rejecting anything else
pub fn normalize_address(address: &str) -> AppResult<String> {
    let trimmed = address.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| AppError::InvalidAddress(format!("missing 0x prefix: {}", trimmed)))?;

    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AppError::InvalidAddress(format!(
            "expected 20 hex bytes: {}",
            trimmed
        )));
    }

    Ok(format!("0x{}", hex_part.to_lowercase()))
}

/// Convert a decimal wei string into token units
pub fn wei_to_token(amount: &str) -> AppResult<Decimal> {
    let wei: u128 = amount
        .parse()
        .map_err(|_| AppError::InvalidInput(format!("Invalid wei amount: {}", amount)))?;
    let wei = i128::try_from(wei)
        .map_err(|_| AppError::InvalidInput(format!("Wei amount too large: {}", amount)))?;

    Ok(Decimal::try_from_i128_with_scale(wei, TOKEN_DECIMALS)?.normalize())
}
