// Winner aggregation - the contract reports one row per winning number group,
// the store keeps one record per (raffle, address)

use std::collections::{BTreeMap, BTreeSet};

use alloy::primitives::U256;

use crate::chain::WinnerInfo;
use crate::error::{AppResult, ChainError};
use crate::raffle::models::AggregatedWinner;

/// Group contract rows by lower-case address: union of numbers, sum of amounts.
pub fn aggregate_winners(rows: &[WinnerInfo]) -> AppResult<Vec<AggregatedWinner>> {
    let mut grouped: BTreeMap<String, (BTreeSet<i32>, U256)> = BTreeMap::new();

    for row in rows {
        let (numbers, amount) = grouped
            .entry(row.winner_address.to_lowercase())
            .or_insert_with(|| (BTreeSet::new(), U256::ZERO));

        numbers.extend(row.winning_numbers.iter().copied());
        *amount = amount.checked_add(row.amount_won).ok_or_else(|| {
            ChainError::Decode(format!(
                "winnings of {} overflow uint256",
                row.winner_address
            ))
        })?;
    }

    Ok(grouped
        .into_iter()
        .map(|(address, (numbers, amount_won))| AggregatedWinner {
            address,
            numbers: numbers.into_iter().collect(),
            amount_won,
        })
        .collect())
}
