use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

use crate::raffle::models::RaffleStatus;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Raffle error: {0}")]
    Raffle(#[from] RaffleError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Unauthorized")]
    Unauthorized,
}

/// Errors talking to the EVM chain
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("RPC call {method} failed: {message}")]
    Rpc { method: String, message: String },

    #[error("Transaction simulation failed: {0}")]
    SimulationFailed(String),

    #[error("Transaction {tx_hash} reverted")]
    Reverted { tx_hash: String },

    #[error("Timed out waiting for receipt of {tx_hash}")]
    ReceiptTimeout { tx_hash: String },

    #[error("ABI decode error: {0}")]
    Decode(String),

    #[error("Invalid operator key: {0}")]
    InvalidKey(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Raffle domain errors
#[derive(Error, Debug)]
pub enum RaffleError {
    #[error("Raffle {0} not found")]
    NotFound(i64),

    #[error("Number {number} already taken in raffle {raffle_id}")]
    NumberTaken { raffle_id: i64, number: i32 },

    #[error("Number {number} outside range [{start}, {end}]")]
    NumberOutOfRange { number: i32, start: i32, end: i32 },

    #[error("Raffle {raffle_id} is not open for entries ({reason})")]
    NotOpen { raffle_id: i64, reason: String },

    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition { from: RaffleStatus, to: RaffleStatus },

    #[error("No numbers selected")]
    NoNumbers,

    #[error("Blockchain id {0} is already registered")]
    DuplicateBlockchainId(i64),
}

/// Why a single raffle did not settle
#[derive(Error, Debug)]
pub enum SettlementError {
    /// Nothing changed on chain; the next scan retries
    #[error("Chain call failed for raffle {raffle_id} (blockchain id {blockchain_id}): {message}")]
    ChainCallFailed {
        raffle_id: i64,
        blockchain_id: i64,
        message: String,
    },

    #[error("Raffle {raffle_id} (blockchain id {blockchain_id}) closed in tx {tx_hash} but the contract reported no winners")]
    NoWinners {
        raffle_id: i64,
        blockchain_id: i64,
        tx_hash: String,
    },

    /// Settled on chain but the store does not reflect it
    #[error("Raffle {raffle_id} (blockchain id {blockchain_id}) settled in tx {tx_hash} but the store was not updated: {message}")]
    Anomaly {
        raffle_id: i64,
        blockchain_id: i64,
        tx_hash: String,
        message: String,
    },

    #[error("Store error for raffle {raffle_id}: {message}")]
    Store { raffle_id: i64, message: String },
}

impl SettlementError {
    /// Chain and store disagree and a retry may settle twice
    pub fn is_anomaly(&self) -> bool {
        matches!(
            self,
            SettlementError::NoWinners { .. } | SettlementError::Anomaly { .. }
        )
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::Raffle(RaffleError::NotFound(id)) => (
                StatusCode::NOT_FOUND,
                "RAFFLE_NOT_FOUND",
                format!("Raffle {} not found", id),
                None,
            ),
            AppError::Raffle(RaffleError::NumberTaken { raffle_id, number }) => (
                StatusCode::CONFLICT,
                "NUMBER_TAKEN",
                format!("Number {} is already taken", number),
                Some(serde_json::json!({"raffle_id": raffle_id, "number": number})),
            ),
            AppError::Raffle(RaffleError::NumberOutOfRange { number, start, end }) => (
                StatusCode::BAD_REQUEST,
                "NUMBER_OUT_OF_RANGE",
                format!("Number {} is outside [{}, {}]", number, start, end),
                Some(serde_json::json!({"number": number, "start": start, "end": end})),
            ),
            AppError::Raffle(RaffleError::NotOpen { raffle_id, reason }) => (
                StatusCode::CONFLICT,
                "RAFFLE_NOT_OPEN",
                format!("Raffle {} is not open: {}", raffle_id, reason),
                None,
            ),
            AppError::Raffle(RaffleError::InvalidTransition { from, to }) => (
                StatusCode::CONFLICT,
                "INVALID_STATUS_TRANSITION",
                format!("Cannot move raffle from {} to {}", from, to),
                None,
            ),
            AppError::Raffle(RaffleError::NoNumbers) => (
                StatusCode::BAD_REQUEST,
                "NO_NUMBERS",
                "At least one number must be selected".to_string(),
                None,
            ),
            AppError::Raffle(RaffleError::DuplicateBlockchainId(id)) => (
                StatusCode::CONFLICT,
                "DUPLICATE_BLOCKCHAIN_ID",
                format!("Blockchain id {} is already registered", id),
                None,
            ),
            AppError::Settlement(err @ SettlementError::ChainCallFailed { .. }) => (
                StatusCode::BAD_GATEWAY,
                "SETTLEMENT_CHAIN_CALL_FAILED",
                err.to_string(),
                None,
            ),
            AppError::Settlement(err) if err.is_anomaly() => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SETTLEMENT_ANOMALY",
                err.to_string(),
                None,
            ),
            AppError::Chain(err) => (
                StatusCode::BAD_GATEWAY,
                "CHAIN_ERROR",
                err.to_string(),
                None,
            ),
            AppError::InvalidInput(message) => {
                (StatusCode::BAD_REQUEST, "INVALID_INPUT", message, None)
            }
            AppError::InvalidAddress(message) => {
                (StatusCode::BAD_REQUEST, "INVALID_ADDRESS", message, None)
            }
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Unauthorized".to_string(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::InvalidInput(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
