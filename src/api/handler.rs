use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use crate::api::models::*;
use crate::chain::ChainGateway;
use crate::error::{AppError, AppResult, RaffleError};
use crate::middleware::AuthConfig;
use crate::raffle::models::{
    normalize_address, NewRaffle, PastWinner, ProfileStats, PurchaseReceipt, Raffle,
    TicketPurchase, TicketStatus, UserTicket, WinnerRecord,
};
use crate::raffle::RaffleStore;
use crate::settlement::SettlementReconciler;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RaffleStore>,
    pub gateway: Arc<dyn ChainGateway>,
    pub reconciler: Arc<SettlementReconciler>,
    pub auth: Arc<AuthConfig>,
    /// "postgres" or "memory"
    pub store_kind: &'static str,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        store: state.store_kind.to_string(),
        timestamp: Utc::now(),
    })
}

async fn load_raffle(state: &AppState, raffle_id: i64) -> AppResult<Raffle> {
    state
        .store
        .get_raffle(raffle_id)
        .await?
        .ok_or_else(|| RaffleError::NotFound(raffle_id).into())
}

/// GET /raffles
pub async fn list_raffles(State(state): State<AppState>) -> AppResult<Json<Vec<RaffleResponse>>> {
    let raffles = state.store.list_raffles().await?;

    let mut response = Vec::with_capacity(raffles.len());
    for raffle in raffles {
        let chosen = state.store.chosen_data(raffle.id).await?;
        response.push(RaffleResponse {
            raffle,
            taken_numbers: chosen.taken_numbers().into_iter().collect(),
            chosen_data: None,
        });
    }

    Ok(Json(response))
}

/// GET /raffles/:id
pub async fn get_raffle(
    State(state): State<AppState>,
    Path(raffle_id): Path<i64>,
) -> AppResult<Json<RaffleResponse>> {
    let raffle = load_raffle(&state, raffle_id).await?;
    let chosen = state.store.chosen_data(raffle_id).await?;

    Ok(Json(RaffleResponse {
        raffle,
        taken_numbers: chosen.taken_numbers().into_iter().collect(),
        chosen_data: Some(chosen.entries()),
    }))
}

/// POST /raffles/:id/tickets
pub async fn purchase_tickets(
    State(state): State<AppState>,
    Path(raffle_id): Path<i64>,
    Json(request): Json<PurchaseRequest>,
) -> AppResult<(StatusCode, Json<PurchaseReceipt>)> {
    let buyer = normalize_address(&request.address)?;
    info!(
        "🎟️ Recording purchase in raffle {} by {}: {:?}",
        raffle_id, buyer, request.numbers
    );

    let receipt = state
        .store
        .record_purchase(
            TicketPurchase {
                raffle_id,
                buyer,
                numbers: request.numbers,
                tx_hash: request.tx_hash,
            },
            Utc::now(),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(receipt)))
}

/// GET /users/:address/tickets?status=
pub async fn user_tickets(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(query): Query<TicketQuery>,
) -> AppResult<Json<Vec<UserTicket>>> {
    let address = normalize_address(&address)?;
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty() && *s != "all")
        .map(str::parse::<TicketStatus>)
        .transpose()?;

    let mut tickets = state.store.user_tickets(&address, Utc::now()).await?;
    if let Some(status) = status {
        tickets.retain(|ticket| ticket.status == status);
    }

    Ok(Json(tickets))
}

/// GET /users/:address/stats
pub async fn user_stats(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> AppResult<Json<ProfileStats>> {
    let address = normalize_address(&address)?;
    let tickets = state.store.user_tickets(&address, Utc::now()).await?;
    Ok(Json(ProfileStats::from_tickets(&tickets)?))
}

/// GET /winners
pub async fn past_winners(State(state): State<AppState>) -> AppResult<Json<Vec<PastWinner>>> {
    Ok(Json(state.store.past_winners().await?))
}

/// GET /raffles/:id/winners
pub async fn raffle_winners(
    State(state): State<AppState>,
    Path(raffle_id): Path<i64>,
) -> AppResult<Json<Vec<WinnerRecord>>> {
    load_raffle(&state, raffle_id).await?;
    Ok(Json(state.store.raffle_winners(raffle_id).await?))
}

/// GET /chain/raffle-count
pub async fn raffle_count(State(state): State<AppState>) -> AppResult<Json<RaffleCountResponse>> {
    let raffle_count = state.gateway.raffle_count().await?;
    Ok(Json(RaffleCountResponse { raffle_count }))
}

/// POST /admin/raffles
pub async fn create_raffle(
    State(state): State<AppState>,
    Json(request): Json<CreateRaffleRequest>,
) -> AppResult<(StatusCode, Json<Raffle>)> {
    let blockchain_id = match request.blockchain_id {
        Some(id) => id,
        // The newest on-chain raffle; contract ids start at 1
        None => i64::try_from(state.gateway.raffle_count().await?)
            .map_err(|_| AppError::InvalidInput("raffle count out of range".to_string()))?,
    };

    let raffle = state
        .store
        .create_raffle(NewRaffle {
            title: request.title.trim().to_string(),
            description: request.description,
            blockchain_id,
            start_no: request.start_no,
            end_no: request.end_no,
            ticket_price: request.ticket_price,
            start_date: request.start_date,
            end_date: request.end_date,
        })
        .await?;

    info!(
        "✅ Raffle {} registered (blockchain id {}, {} winners of {})",
        raffle.id, raffle.blockchain_id, raffle.expected_winners, raffle.winning_price
    );

    Ok((StatusCode::CREATED, Json(raffle)))
}

/// POST /admin/raffles/:id/settle
pub async fn settle_raffle(
    State(state): State<AppState>,
    Path(raffle_id): Path<i64>,
) -> AppResult<Json<SettleResponse>> {
    info!("🔧 Manual settlement requested for raffle {}", raffle_id);
    let outcome = state.reconciler.settle_raffle(raffle_id).await?;
    Ok(Json(SettleResponse { raffle_id, outcome }))
}
