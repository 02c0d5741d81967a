use anyhow::Context;
use axum::{
    http::StatusCode,
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::{
        cron::run_cron,
        handler::{
            create_raffle, get_raffle, health_check, list_raffles, past_winners,
            purchase_tickets, raffle_count, raffle_winners, settle_raffle, user_stats,
            user_tickets,
        },
        models::{CreateRaffleRequest, PurchaseRequest},
        AppState,
    },
    config::Config,
    middleware::{
        create_cors_layer, rate_limit_middleware, require_api_key, require_settlement_key,
        validate_json, RateLimitLayer,
    },
};

/// HTTP-level settings
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub cors_origins: Vec<String>,
    pub rate_limit_per_minute: u32,
    /// Applies to the JSON API; the cron trigger waits for chain receipts
    pub request_timeout: Duration,
}

impl HttpSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cors_origins: config.cors_origins(),
            rate_limit_per_minute: config.rate_limit_per_minute,
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub fn create_app(state: AppState, http: &HttpSettings) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let rate_limiter = Arc::new(RateLimitLayer::per_minute(http.rate_limit_per_minute));

    let public = Router::new()
        .route("/raffles", get(list_raffles))
        .route("/raffles/:id", get(get_raffle))
        .route(
            "/raffles/:id/tickets",
            post(purchase_tickets)
                .route_layer(middleware::from_fn(validate_json::<PurchaseRequest>)),
        )
        .route("/raffles/:id/winners", get(raffle_winners))
        .route("/users/:address/tickets", get(user_tickets))
        .route("/users/:address/stats", get(user_stats))
        .route("/winners", get(past_winners))
        .route("/chain/raffle-count", get(raffle_count))
        .route_layer(middleware::from_fn_with_state(
            rate_limiter,
            rate_limit_middleware,
        ))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            http.request_timeout,
        ));

    let admin = Router::new()
        .route(
            "/raffles",
            post(create_raffle)
                .route_layer(middleware::from_fn(validate_json::<CreateRaffleRequest>)),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        // Signs operator transactions, so never open without a key
        .route(
            "/raffles/:id/settle",
            post(settle_raffle).route_layer(middleware::from_fn_with_state(
                state.clone(),
                require_settlement_key,
            )),
        );

    let app = Router::new()
        .route("/health", get(health_check))
        // Settlement trigger for the external scheduler
        .route("/api/cron", get(run_cron).post(run_cron))
        .nest("/api/v1", public.nest("/admin", admin))
        .layer(CompressionLayer::new())
        .layer(create_cors_layer(&http.cors_origins))
        // Add request tracing
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("binding {}", bind_address))?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::gateway::testing::MockGateway;
    use crate::chain::WinnerInfo;
    use crate::middleware::AuthConfig;
    use crate::raffle::memory::testing::FaultyStore;
    use crate::raffle::models::{Raffle, RaffleStatus, TicketPurchase};
    use crate::raffle::{InMemoryRaffleStore, RaffleStore};
    use crate::settlement::{SettlementConfig, SettlementReconciler};
    use alloy::primitives::U256;
    use axum::body::Body;
    use axum::http::Request;
    use axum::response::Response;
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const ALICE: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const BOB: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    struct TestApp {
        router: Router,
        store: Arc<InMemoryRaffleStore>,
        gateway: Arc<MockGateway>,
    }

    fn test_auth() -> AuthConfig {
        AuthConfig {
            cron_secret: Some("cron-secret".to_string()),
            api_key: Some("admin-key".to_string()),
        }
    }

    fn router(store: Arc<dyn RaffleStore>, gateway: Arc<MockGateway>, auth: AuthConfig) -> Router {
        let reconciler = Arc::new(SettlementReconciler::new(
            store.clone(),
            gateway.clone(),
            SettlementConfig::default(),
        ));

        let state = AppState {
            store,
            gateway,
            reconciler,
            auth: Arc::new(auth),
            store_kind: "memory",
        };
        let http = HttpSettings {
            cors_origins: vec![],
            rate_limit_per_minute: 1000,
            request_timeout: Duration::from_secs(5),
        };

        create_app(state, &http)
    }

    fn test_app_with_auth(gateway: MockGateway, auth: AuthConfig) -> TestApp {
        let store = Arc::new(InMemoryRaffleStore::new());
        let gateway = Arc::new(gateway);

        TestApp {
            router: router(store.clone(), gateway.clone(), auth),
            store,
            gateway,
        }
    }

    fn test_app(gateway: MockGateway) -> TestApp {
        test_app_with_auth(gateway, test_auth())
    }

    async fn send(app: &TestApp, request: Request<Body>) -> Response {
        app.router.clone().oneshot(request).await.unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-api-key", "admin-key")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn create_body(blockchain_id: Option<i64>) -> Value {
        let now = Utc::now();
        json!({
            "title": "Weekend Jackpot",
            "description": "Ten winners",
            "blockchain_id": blockchain_id,
            "start_no": 1,
            "end_no": 100,
            "ticket_price": 0.5,
            "start_date": (now - ChronoDuration::hours(1)).to_rfc3339(),
            "end_date": (now + ChronoDuration::hours(1)).to_rfc3339(),
        })
    }

    /// Expired raffle with entries from two buyers
    async fn seed_expired_raffle(store: &InMemoryRaffleStore) -> Raffle {
        let now = Utc::now();
        let raffle = Raffle {
            id: 1,
            title: "Ended".to_string(),
            description: String::new(),
            blockchain_id: 7,
            start_no: 1,
            end_no: 10,
            ticket_price: dec!(1),
            expected_winners: 1,
            winning_price: dec!(9.9),
            start_date: now - ChronoDuration::days(2),
            end_date: now - ChronoDuration::days(1),
            status: RaffleStatus::Active,
            settlement_tx: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_raffle(raffle.clone());

        for (buyer, numbers) in [(ALICE, vec![1, 2]), (BOB, vec![3, 4])] {
            store
                .record_purchase(
                    TicketPurchase {
                        raffle_id: raffle.id,
                        buyer: buyer.to_string(),
                        numbers,
                        tx_hash: None,
                    },
                    raffle.end_date - ChronoDuration::hours(1),
                )
                .await
                .unwrap();
        }
        raffle
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app(MockGateway::new());
        let response = send(&app, get_request("/health")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["store"], "memory");
    }

    #[tokio::test]
    async fn test_cron_rejects_missing_secret() {
        let app = test_app(MockGateway::new());
        let response = send(&app, get_request("/api/cron")).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Unauthorized");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_cron_accepts_bearer_and_custom_header() {
        let app = test_app(MockGateway::new());

        let bearer = Request::builder()
            .uri("/api/cron")
            .header("authorization", "Bearer cron-secret")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, bearer).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Cron executed successfully");

        let custom = Request::builder()
            .method("POST")
            .uri("/api/cron")
            .header("x-cron-key", "cron-secret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, custom).await.status(), StatusCode::OK);

        let wrong = Request::builder()
            .uri("/api/cron")
            .header("x-cron-key", "nope")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, wrong).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_cron_rejects_other_methods() {
        let app = test_app(MockGateway::new());
        let request = Request::builder()
            .method("PUT")
            .uri("/api/cron")
            .header("x-cron-key", "cron-secret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, request).await.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_cron_settles_expired_raffle() {
        let app = test_app(MockGateway::with_winners(vec![WinnerInfo {
            winner_address: "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string(),
            winning_numbers: vec![1],
            amount_won: U256::from(1_000_000_000_000_000_000u64),
        }]));
        let raffle = seed_expired_raffle(&app.store).await;

        let request = Request::builder()
            .method("POST")
            .uri("/api/cron")
            .header("authorization", "Bearer cron-secret")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["report"]["closed"], 1);

        let response = send(&app, get_request("/api/v1/raffles/1/winners")).await;
        let winners = body_json(response).await;
        assert_eq!(winners[0]["user_address"], ALICE);
        assert_eq!(winners[0]["winning_numbers"], json!([1]));
        assert_eq!(winners[0]["amount_won"], "1000000000000000000");

        let response = send(&app, get_request(&format!("/api/v1/users/{}/tickets?status=won", ALICE))).await;
        let tickets = body_json(response).await;
        assert_eq!(tickets.as_array().unwrap().len(), 1);
        assert_eq!(tickets[0]["raffle_id"], raffle.id);

        let response = send(&app, get_request(&format!("/api/v1/users/{}/stats", BOB))).await;
        let stats = body_json(response).await;
        assert_eq!(stats["tickets_lost"], 1);
        assert_eq!(stats["tickets_won"], 0);
    }

    #[tokio::test]
    async fn test_admin_requires_api_key() {
        let app = test_app(MockGateway::new());
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/admin/raffles")
            .header("content-type", "application/json")
            .body(Body::from(create_body(Some(1)).to_string()))
            .unwrap();

        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error_code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_create_and_purchase_flow() {
        let app = test_app(MockGateway {
            raffle_count: 4,
            ..MockGateway::new()
        });

        let response = send(&app, json_request("POST", "/api/v1/admin/raffles", create_body(None))).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let raffle = body_json(response).await;
        assert_eq!(raffle["blockchain_id"], 4);
        assert_eq!(raffle["expected_winners"], 10);
        assert_eq!(raffle["status"], "not-started");
        let id = raffle["id"].as_i64().unwrap();

        let purchase = json!({ "address": "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA", "numbers": [5, 3, 5] });
        let response = send(
            &app,
            json_request("POST", &format!("/api/v1/raffles/{}/tickets", id), purchase),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let receipt = body_json(response).await;
        assert_eq!(receipt["buyer"], ALICE);
        assert_eq!(receipt["numbers"], json!([3, 5]));
        assert_eq!(receipt["raffle_status"], "active");

        let taken = json!({ "address": BOB, "numbers": [5] });
        let response = send(
            &app,
            json_request("POST", &format!("/api/v1/raffles/{}/tickets", id), taken),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["error_code"], "NUMBER_TAKEN");

        let response = send(&app, get_request(&format!("/api/v1/raffles/{}", id))).await;
        let detail = body_json(response).await;
        assert_eq!(detail["taken_numbers"], json!([3, 5]));
        assert_eq!(detail["chosen_data"][0]["buyer"], ALICE);

        assert_eq!(app.gateway.calls(), vec!["raffleCount".to_string()]);
    }

    #[tokio::test]
    async fn test_purchase_validation() {
        let app = test_app(MockGateway::new());
        let bad = json!({ "address": "not-an-address", "numbers": [1] });
        let response = send(&app, json_request("POST", "/api/v1/raffles/1/tickets", bad)).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error_code"], "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_unknown_raffle() {
        let app = test_app(MockGateway::new());
        let response = send(&app, get_request("/api/v1/raffles/42")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error_code"], "RAFFLE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_manual_settle() {
        let app = test_app(MockGateway::new());
        let raffle = seed_expired_raffle(&app.store).await;

        // No winners reported after closing: anomaly, raffle stays active
        let response = send(
            &app,
            json_request("POST", &format!("/api/v1/admin/raffles/{}/settle", raffle.id), json!({})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error_code"], "SETTLEMENT_ANOMALY");

        let stored = app.store.get_raffle(raffle.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RaffleStatus::Active);
    }

    #[tokio::test]
    async fn test_cron_reports_failed_scan() {
        let store = Arc::new(FaultyStore::new(InMemoryRaffleStore::new()).fail("expired_unsettled", 1));
        let app = router(store, Arc::new(MockGateway::new()), test_auth());

        let request = Request::builder()
            .uri("/api/cron")
            .header("authorization", "Bearer cron-secret")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("expired_unsettled: connection lost"));
    }

    #[tokio::test]
    async fn test_settle_requires_configured_key() {
        let app = test_app_with_auth(
            MockGateway::new(),
            AuthConfig {
                cron_secret: Some("cron-secret".to_string()),
                api_key: None,
            },
        );
        let raffle = seed_expired_raffle(&app.store).await;

        // Creation stays open in development
        let response = send(&app, json_request("POST", "/api/v1/admin/raffles", create_body(Some(3)))).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = send(
            &app,
            json_request("POST", &format!("/api/v1/admin/raffles/{}/settle", raffle.id), json!({})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(app.gateway.calls().is_empty());
        assert_eq!(
            app.store.get_raffle(raffle.id).await.unwrap().unwrap().status,
            RaffleStatus::Active
        );
    }

    #[tokio::test]
    async fn test_settle_rejects_wrong_key() {
        let app = test_app(MockGateway::new());
        let raffle = seed_expired_raffle(&app.store).await;

        let request = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/admin/raffles/{}/settle", raffle.id))
            .header("x-api-key", "guess")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, request).await.status(), StatusCode::UNAUTHORIZED);
        assert!(app.gateway.calls().is_empty());
    }
}
