use std::str::FromStr;
use std::time::Duration;

use alloy::network::{EthereumWallet, ReceiptResponse, TransactionBuilder};
use alloy::primitives::{Address, U256};
use alloy::providers::{
    DynProvider, PendingTransactionError, Provider, ProviderBuilder, WatchTxError,
};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::chain::contract::IRaffleUp;
use crate::chain::gateway::{ChainGateway, WinnerInfo};
use crate::error::{AppResult, ChainError};

/// EVM connection settings
#[derive(Debug, Clone)]
pub struct EvmConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub contract_address: String,
    pub private_key: String,
    pub receipt_timeout: Duration,
    pub gas_headroom_percent: u64,
}

/// RaffleUp contract over an alloy provider, signing as the operator
pub struct EvmGateway {
    provider: DynProvider,
    contract: IRaffleUp::IRaffleUpInstance<DynProvider>,
    operator: Address,
    chain_id: u64,
    receipt_timeout: Duration,
    gas_headroom_percent: u64,
    // One operator transaction in flight at a time
    write_lock: Mutex<()>,
}

impl EvmGateway {
    pub async fn connect(config: EvmConfig) -> AppResult<Self> {
        let signer = PrivateKeySigner::from_str(config.private_key.trim())
            .map_err(|e| ChainError::InvalidKey(e.to_string()))?;
        let operator = signer.address();
        let contract_address = Address::from_str(config.contract_address.trim())
            .map_err(|e| ChainError::InvalidAddress(format!("{}: {}", config.contract_address, e)))?;

        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect(&config.rpc_url)
            .await
            .map_err(|e| ChainError::Rpc {
                method: "connect".to_string(),
                message: e.to_string(),
            })?
            .erased();

        info!(
            "🔗 EVM gateway: chain {} contract {}",
            config.chain_id, contract_address
        );

        Ok(Self {
            contract: IRaffleUp::new(contract_address, provider.clone()),
            provider,
            operator,
            chain_id: config.chain_id,
            receipt_timeout: config.receipt_timeout,
            gas_headroom_percent: config.gas_headroom_percent,
            write_lock: Mutex::new(()),
        })
    }

    pub fn operator_address(&self) -> String {
        self.operator.to_string().to_lowercase()
    }

    /// Compare the node's chain id with the configured one
    pub async fn verify_chain_id(&self) -> AppResult<()> {
        let remote = self
            .provider
            .get_chain_id()
            .await
            .map_err(|e| rpc_error("eth_chainId", e))?;

        if remote != self.chain_id {
            return Err(ChainError::Rpc {
                method: "eth_chainId".to_string(),
                message: format!("node is on chain {}, expected {}", remote, self.chain_id),
            }
            .into());
        }
        Ok(())
    }

    async fn send_contract_call(&self, label: &str, tx: TransactionRequest) -> AppResult<String> {
        let _guard = self.write_lock.lock().await;
        let tx = tx.with_from(self.operator);

        // Simulation: a revert surfaces here before anything is broadcast
        let estimate = self
            .provider
            .estimate_gas(tx.clone())
            .await
            .map_err(|e| ChainError::SimulationFailed(format!("{}: {}", label, e)))?;
        let gas = estimate + estimate * self.gas_headroom_percent / 100;
        debug!("✍️ {} estimated gas {} (limit {})", label, estimate, gas);

        let pending = self
            .provider
            .send_transaction(tx.with_gas_limit(gas))
            .await
            .map_err(|e| rpc_error("eth_sendRawTransaction", e))?;
        let tx_hash = pending.tx_hash().to_string();
        info!("📤 {} submitted: {}", label, tx_hash);

        let receipt = match pending
            .with_timeout(Some(self.receipt_timeout))
            .get_receipt()
            .await
        {
            Ok(receipt) => receipt,
            Err(PendingTransactionError::TxWatcher(WatchTxError::Timeout)) => {
                return Err(ChainError::ReceiptTimeout { tx_hash }.into());
            }
            Err(e) => {
                warn!("⚠️ Receipt for {} unavailable: {}", tx_hash, e);
                return Err(rpc_error("eth_getTransactionReceipt", e).into());
            }
        };

        if !receipt.status() {
            error!("❌ Transaction {} reverted", tx_hash);
            return Err(ChainError::Reverted { tx_hash }.into());
        }

        let confirmed = receipt.transaction_hash().to_string();
        info!(
            "✅ Transaction {} confirmed in block {}",
            confirmed,
            receipt
                .block_number()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "?".to_string())
        );
        Ok(confirmed)
    }
}

fn rpc_error(method: &str, error: impl std::fmt::Display) -> ChainError {
    ChainError::Rpc {
        method: method.to_string(),
        message: error.to_string(),
    }
}

fn raffle_arg(blockchain_id: i64) -> AppResult<U256> {
    u64::try_from(blockchain_id).map(U256::from).map_err(|_| {
        ChainError::Decode(format!("negative blockchain id {}", blockchain_id)).into()
    })
}

fn winner_row(row: IRaffleUp::WinnerInfo) -> AppResult<WinnerInfo> {
    let winning_numbers = row
        .winningNumbers
        .iter()
        .map(|n| {
            i32::try_from(*n)
                .map_err(|_| ChainError::Decode(format!("winning number {} out of range", n)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(WinnerInfo {
        winner_address: row.winnerAddress.to_string().to_lowercase(),
        winning_numbers,
        amount_won: row.amountWon,
    })
}

#[async_trait]
impl ChainGateway for EvmGateway {
    async fn raffle_count(&self) -> AppResult<u64> {
        let count = self
            .contract
            .raffleCount()
            .call()
            .await
            .map_err(|e| rpc_error("eth_call", e))?;
        u64::try_from(count)
            .map_err(|_| ChainError::Decode(format!("raffle count {} too large", count)).into())
    }

    async fn winners_with_numbers(&self, blockchain_id: i64) -> AppResult<Vec<WinnerInfo>> {
        let rows = self
            .contract
            .getWinnersWithNumbers(raffle_arg(blockchain_id)?)
            .call()
            .await
            .map_err(|e| rpc_error("eth_call", e))?;
        debug!("🏆 Raffle {} has {} winner rows on chain", blockchain_id, rows.len());
        rows.into_iter().map(winner_row).collect()
    }

    async fn close_raffle(&self, blockchain_id: i64) -> AppResult<String> {
        let tx = self
            .contract
            .closeRaffle(raffle_arg(blockchain_id)?)
            .into_transaction_request();
        self.send_contract_call(&format!("closeRaffle({})", blockchain_id), tx)
            .await
    }

    async fn refund_raffle(&self, blockchain_id: i64) -> AppResult<String> {
        let tx = self
            .contract
            .refundRaffle(raffle_arg(blockchain_id)?)
            .into_transaction_request();
        self.send_contract_call(&format!("refundRaffle({})", blockchain_id), tx)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EvmConfig {
        EvmConfig {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            chain_id: 11142220,
            contract_address: "0x1111111111111111111111111111111111111111".to_string(),
            private_key: "4646464646464646464646464646464646464646464646464646464646464646"
                .to_string(),
            receipt_timeout: Duration::from_secs(1),
            gas_headroom_percent: 20,
        }
    }

    #[tokio::test]
    async fn test_gateway_construction() {
        let gateway = EvmGateway::connect(config()).await.unwrap();
        assert_eq!(
            gateway.operator_address(),
            "0x9d8a62f656a8d1615c1294fd71e9cfb3e4855a4f"
        );
        assert_eq!(
            *gateway.contract.address(),
            Address::repeat_byte(0x11)
        );
    }

    #[tokio::test]
    async fn test_accepts_prefixed_key() {
        let mut cfg = config();
        cfg.private_key = format!("0x{}", cfg.private_key);
        let gateway = EvmGateway::connect(cfg).await.unwrap();
        assert_eq!(
            gateway.operator_address(),
            "0x9d8a62f656a8d1615c1294fd71e9cfb3e4855a4f"
        );
    }

    #[tokio::test]
    async fn test_rejects_bad_contract_address() {
        let mut cfg = config();
        cfg.contract_address = "0xdeadbeef".to_string();
        assert!(EvmGateway::connect(cfg).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_bad_key() {
        let mut cfg = config();
        cfg.private_key = "not-a-key".to_string();
        assert!(EvmGateway::connect(cfg).await.is_err());
    }

    #[test]
    fn test_rejects_negative_raffle_id() {
        assert!(raffle_arg(-1).is_err());
        assert_eq!(raffle_arg(7).unwrap(), U256::from(7u64));
    }

    #[test]
    fn test_winner_row_conversion() {
        let amount = U256::from(u128::MAX) * U256::from(4u64);
        let row = IRaffleUp::WinnerInfo {
            winnerAddress: Address::repeat_byte(0xab),
            winningNumbers: vec![U256::from(3u64), U256::from(12u64)],
            amountWon: amount,
        };

        let info = winner_row(row).unwrap();
        assert_eq!(info.winner_address, format!("0x{}", "ab".repeat(20)));
        assert_eq!(info.winning_numbers, vec![3, 12]);
        // Wider than u128
        assert_eq!(info.amount_won, amount);
    }

    #[test]
    fn test_winner_row_rejects_huge_number() {
        let row = IRaffleUp::WinnerInfo {
            winnerAddress: Address::ZERO,
            winningNumbers: vec![U256::from(u64::MAX)],
            amountWon: U256::ZERO,
        };
        assert!(winner_row(row).is_err());
    }
}
