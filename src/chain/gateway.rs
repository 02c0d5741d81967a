use alloy::primitives::U256;
use async_trait::async_trait;

use crate::error::AppResult;

/// One row of `getWinnersWithNumbers`. An address can appear several times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinnerInfo {
    pub winner_address: String,
    pub winning_numbers: Vec<i32>,
    /// Amount in the token's smallest unit
    pub amount_won: U256,
}

/// Chain gateway - the RaffleUp contract as seen by the backend
///
/// State-changing calls are signed by the operator account and only
/// return once the transaction is included, yielding its hash.
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Number of raffles created on the contract
    async fn raffle_count(&self) -> AppResult<u64>;

    /// Flat winners list for a raffle; empty until it is closed
    async fn winners_with_numbers(&self, blockchain_id: i64) -> AppResult<Vec<WinnerInfo>>;

    /// Draw and pay out a raffle
    async fn close_raffle(&self, blockchain_id: i64) -> AppResult<String>;

    /// Return every participant's funds
    async fn refund_raffle(&self, blockchain_id: i64) -> AppResult<String>;
}
