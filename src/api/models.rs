use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::raffle::models::{ChosenEntry, Raffle};
use crate::settlement::SettlementOutcome;

// ========== REQUEST MODELS ==========

/// Register a raffle the admin already created on-chain
#[derive(Debug, Deserialize, Validate)]
#[validate(schema(function = "validate_raffle_window"))]
pub struct CreateRaffleRequest {
    #[validate(length(min = 1, max = 200, message = "title must be 1-200 characters"))]
    pub title: String,

    #[serde(default)]
    #[validate(length(max = 5000))]
    pub description: String,

    /// Defaults to the contract's current raffle count
    #[validate(range(min = 0))]
    pub blockchain_id: Option<i64>,

    #[validate(range(min = 0, message = "numbers must not be negative"))]
    pub start_no: i32,

    #[validate(range(min = 0, message = "numbers must not be negative"))]
    pub end_no: i32,

    #[validate(custom = "validate_positive_price")]
    pub ticket_price: Decimal,

    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

fn validate_positive_price(price: &Decimal) -> Result<(), ValidationError> {
    if price.is_sign_positive() && !price.is_zero() {
        Ok(())
    } else {
        let mut error = ValidationError::new("ticket_price");
        error.message = Some("ticket price must be greater than zero".into());
        Err(error)
    }
}

fn validate_raffle_window(request: &CreateRaffleRequest) -> Result<(), ValidationError> {
    if request.start_no > request.end_no {
        let mut error = ValidationError::new("number_range");
        error.message = Some("start_no must not exceed end_no".into());
        return Err(error);
    }
    if request.start_date >= request.end_date {
        let mut error = ValidationError::new("dates");
        error.message = Some("start_date must be before end_date".into());
        return Err(error);
    }
    Ok(())
}

/// Record numbers bought through `joinRaffle`
#[derive(Debug, Deserialize, Validate)]
pub struct PurchaseRequest {
    #[validate(custom = "validate_evm_address")]
    pub address: String,

    #[validate(length(min = 1, max = 1000, message = "select between 1 and 1000 numbers"))]
    pub numbers: Vec<i32>,

    pub tx_hash: Option<String>,
}

fn validate_evm_address(address: &str) -> Result<(), ValidationError> {
    let valid = address
        .strip_prefix("0x")
        .map(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false);

    if valid {
        Ok(())
    } else {
        let mut error = ValidationError::new("address");
        error.message = Some("expected a 0x-prefixed 20-byte hex address".into());
        Err(error)
    }
}

#[derive(Debug, Deserialize)]
pub struct TicketQuery {
    /// active, won or lost
    pub status: Option<String>,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct RaffleResponse {
    #[serde(flatten)]
    pub raffle: Raffle,
    pub taken_numbers: Vec<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chosen_data: Option<Vec<ChosenEntry>>,
}

#[derive(Debug, Serialize)]
pub struct RaffleCountResponse {
    pub raffle_count: u64,
}

#[derive(Debug, Serialize)]
pub struct SettleResponse {
    pub raffle_id: i64,
    #[serde(flatten)]
    pub outcome: SettlementOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn create_request() -> CreateRaffleRequest {
        let now = Utc::now();
        CreateRaffleRequest {
            title: "Weekend Jackpot".to_string(),
            description: String::new(),
            blockchain_id: None,
            start_no: 1,
            end_no: 100,
            ticket_price: dec!(0.5),
            start_date: now,
            end_date: now + Duration::days(7),
        }
    }

    #[test]
    fn test_create_request_validation() {
        assert!(create_request().validate().is_ok());

        let mut request = create_request();
        request.ticket_price = Decimal::ZERO;
        assert!(request.validate().is_err());

        let mut request = create_request();
        request.start_no = 200;
        assert!(request.validate().is_err());

        let mut request = create_request();
        request.end_date = request.start_date;
        assert!(request.validate().is_err());

        let mut request = create_request();
        request.title = String::new();
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_purchase_request_validation() {
        let request = PurchaseRequest {
            address: "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
            numbers: vec![1, 2],
            tx_hash: None,
        };
        assert!(request.validate().is_ok());

        let request = PurchaseRequest {
            address: "0x1234".to_string(),
            numbers: vec![1],
            tx_hash: None,
        };
        assert!(request.validate().is_err());

        let request = PurchaseRequest {
            address: "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
            numbers: vec![],
            tx_hash: None,
        };
        assert!(request.validate().is_err());
    }
}
