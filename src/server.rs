// GreenLedger - REST API with Axum
// Auth relay, scraper relay, simulated market, green-score ledger, trades.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::{bearer_token, Claims, IdentityVerifier};
use crate::ledger::{self, Company, LedgerError, NewCompany};
use crate::market::{MarketCategory, MarketPrice, SharedSimulator};
use crate::scraper::{PriceScraper, ScrapeError};
use crate::trading::{self, Trade, TradeBook, TradeError, TradeKind};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub scraper: PriceScraper,
    pub market: SharedSimulator,
    pub trades: Arc<Mutex<TradeBook>>,
}

impl AppState {
    pub fn new(
        conn: Connection,
        verifier: Arc<dyn IdentityVerifier>,
        scraper: PriceScraper,
        market: SharedSimulator,
    ) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
            verifier,
            scraper,
            market,
            trades: Arc::new(Mutex::new(TradeBook::new())),
        }
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    Forbidden,
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "Forbidden".to_string()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InvalidAddress(_) => ApiError::BadRequest(e.to_string()),
            LedgerError::AlreadyRegistered(_) => ApiError::Conflict(e.to_string()),
            LedgerError::Overflow(_) => ApiError::Unprocessable(e.to_string()),
            LedgerError::Database(ref inner) => {
                error!("ledger database error: {}", inner);
                ApiError::Internal("database error".to_string())
            }
        }
    }
}

impl From<TradeError> for ApiError {
    fn from(e: TradeError) -> Self {
        match e {
            TradeError::InvalidAmount(_) | TradeError::InvalidPrice(_) => {
                ApiError::BadRequest(e.to_string())
            }
            TradeError::InsufficientBalance { .. } | TradeError::AlreadySettled { .. } => {
                ApiError::Unprocessable(e.to_string())
            }
            TradeError::Settlement(inner) => inner.into(),
        }
    }
}

fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>, ApiError> {
    m.lock().map_err(|_| {
        error!("{} lock poisoned", what);
        ApiError::Internal(format!("{} unavailable", what))
    })
}

// ============================================================================
// Auth relay handlers
// ============================================================================

#[derive(Deserialize)]
pub struct VerifyTokenRequest {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Serialize)]
struct VerifyTokenResponse {
    message: &'static str,
    uid: String,
    email: Option<String>,
}

/// POST /verify-token - Verify an ID token with the identity provider
async fn verify_token(
    State(state): State<AppState>,
    body: Result<Json<VerifyTokenRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    // A missing or unreadable body carries no token
    let token = body
        .map_err(|rejection| debug!("verify-token body rejected: {}", rejection))
        .ok()
        .and_then(|Json(body)| body.token)
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Token is required".to_string()))?;

    match state.verifier.verify(&token).await {
        Ok(Claims { uid, email }) => {
            info!(%uid, "token verified");
            Ok(Json(VerifyTokenResponse {
                message: "Token verified successfully",
                uid,
                email,
            }))
        }
        Err(e) => {
            warn!("token verification error: {}", e);
            Err(ApiError::Unauthorized)
        }
    }
}

/// GET /protected - Echo claims for a bearer token
async fn protected(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or(ApiError::Unauthorized)?;

    let claims = state.verifier.verify(token).await.map_err(|e| {
        warn!("protected route rejected token: {}", e);
        ApiError::Forbidden
    })?;

    Ok(Json(json!({ "message": "Access granted", "user": claims })))
}

// ============================================================================
// Scraper + market handlers
// ============================================================================

/// GET /api/carbon-prices - Relay the live carbon price table
async fn carbon_prices(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    match state.scraper.fetch_price_table().await {
        Ok(table) => Ok(Json(json!({ "prices": table }))),
        Err(ScrapeError::NoTable) => Err(ApiError::Internal(
            "Unable to extract carbon prices.".to_string(),
        )),
        Err(e) => {
            error!("error fetching carbon prices: {}", e);
            Err(ApiError::Internal("Failed to fetch carbon prices.".to_string()))
        }
    }
}

#[derive(Deserialize)]
pub struct MarketQuery {
    category: Option<String>,
}

/// GET /api/market - Current simulated prices
async fn market_prices(
    State(state): State<AppState>,
    Query(query): Query<MarketQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let category = query
        .category
        .as_deref()
        .map(|c| c.parse::<MarketCategory>())
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let sim = lock(&state.market, "market simulator")?;
    let prices: Vec<MarketPrice> = match category {
        Some(c) => sim.snapshot_by_category(c),
        None => sim.snapshot(),
    };

    Ok(Json(ApiResponse::ok(prices)))
}

// ============================================================================
// Ledger handlers
// ============================================================================

/// POST /api/companies - registerCompany
async fn register_company(
    State(state): State<AppState>,
    Json(body): Json<NewCompany>,
) -> Result<impl IntoResponse, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }

    let conn = lock(&state.db, "database")?;
    let company = ledger::register_company(&conn, body)?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(company))))
}

/// GET /api/companies - All companies
async fn list_companies(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let conn = lock(&state.db, "database")?;
    Ok(Json(ApiResponse::ok(ledger::list_companies(&conn)?)))
}

/// GET /api/companies/:address - companies(address) view
async fn get_company(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = lock(&state.db, "database")?;
    let normalized = ledger::normalize_address(&address)?;
    let company = ledger::get_company(&conn, &normalized)?
        .unwrap_or_else(|| Company::unregistered(&normalized));
    Ok(Json(ApiResponse::ok(company)))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GreenScoreResponse {
    address: String,
    green_score: u64,
}

/// GET /api/companies/:address/green-score - getGreenScore(address)
async fn get_green_score(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = lock(&state.db, "database")?;
    let normalized = ledger::normalize_address(&address)?;
    let green_score = ledger::get_green_score(&conn, &normalized)?;
    Ok(Json(ApiResponse::ok(GreenScoreResponse {
        address: normalized,
        green_score,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGreenScoreRequest {
    #[serde(default)]
    credits_sold: u64,
    #[serde(default)]
    credits_bought: u64,
    #[serde(default)]
    emissions_reduced: u64,
}

/// POST /api/companies/:address/green-score - updateGreenScore
async fn update_green_score(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Json(body): Json<UpdateGreenScoreRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = lock(&state.db, "database")?;
    let normalized = ledger::normalize_address(&address)?;
    let green_score = ledger::update_green_score(
        &conn,
        &normalized,
        body.credits_sold,
        body.credits_bought,
        body.emissions_reduced,
    )?;
    Ok(Json(ApiResponse::ok(GreenScoreResponse {
        address: normalized,
        green_score,
    })))
}

/// GET /api/companies/:address/events - GreenScoreUpdated history
async fn company_events(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = lock(&state.db, "database")?;
    Ok(Json(ApiResponse::ok(ledger::events_for_company(&conn, &address)?)))
}

// ============================================================================
// Trade handlers
// ============================================================================

#[derive(Deserialize)]
pub struct TradeRequest {
    #[serde(rename = "type")]
    kind: TradeKind,
    amount: f64,
    price: f64,
    #[serde(default)]
    company: Option<String>,
}

/// POST /api/trades - Submit a buy/sell order
async fn submit_trade(
    State(state): State<AppState>,
    Json(body): Json<TradeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut trade = Trade::new(body.kind, body.amount, body.price)?;
    if let Some(company) = body.company {
        trade = trade.for_company(company);
    }

    // Lock order: database, then trade book
    let conn = lock(&state.db, "database")?;
    let mut book = lock(&state.trades, "trade book")?;
    let trade = trading::settle_trade(&conn, &mut book, trade)?;

    Ok((StatusCode::CREATED, Json(ApiResponse::ok(trade))))
}

/// GET /api/trades - Trade history
async fn list_trades(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let book = lock(&state.trades, "trade book")?;
    Ok(Json(ApiResponse::ok(book.trades().to_vec())))
}

/// GET /api/balance - Credit balance
async fn balance(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let book = lock(&state.trades, "trade book")?;
    Ok(Json(ApiResponse::ok(json!({ "balance": book.balance() }))))
}

// ============================================================================
// Misc
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET / - Serve index.html
async fn serve_index() -> impl IntoResponse {
    Html(include_str!("../web/index.html"))
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/carbon-prices", get(carbon_prices))
        .route("/market", get(market_prices))
        .route("/companies", get(list_companies).post(register_company))
        .route("/companies/:address", get(get_company))
        .route(
            "/companies/:address/green-score",
            get(get_green_score).post(update_green_score),
        )
        .route("/companies/:address/events", get(company_events))
        .route("/trades", get(list_trades).post(submit_trade))
        .route("/balance", get(balance));

    Router::new()
        .route("/", get(serve_index))
        .route("/verify-token", post(verify_token))
        .route("/protected", get(protected))
        .nest("/api", api_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
