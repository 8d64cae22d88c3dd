// GreenLedger - Web Server
// Auth relay + carbon price relay + simulated market + green score ledger

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use greenledger::server::{router, AppState};
use greenledger::{
    setup_database, AuthError, Claims, HttpIdentityVerifier, IdentityVerifier, MarketSimulator,
    MarketTicker, PriceScraper, Settings,
};

/// Used when no identity API key is configured: every token is rejected.
struct DisabledVerifier;

#[async_trait::async_trait]
impl IdentityVerifier for DisabledVerifier {
    async fn verify(&self, _token: &str) -> Result<Claims, AuthError> {
        Err(AuthError::Rejected("identity provider not configured".to_string()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env()?;
    settings.logging.init();

    info!("🌐 GreenLedger - Web Server");

    // Open database
    let conn = Connection::open(&settings.database_path).with_context(|| {
        format!(
            "Failed to open database at {}",
            settings.database_path.display()
        )
    })?;
    setup_database(&conn)?;
    info!(path = %settings.database_path.display(), "✓ Database opened");

    let verifier: Arc<dyn IdentityVerifier> = match settings.identity_api_key.as_deref() {
        Some(key) => Arc::new(HttpIdentityVerifier::new(
            settings.identity_endpoint.clone(),
            key,
        )),
        None => {
            warn!("IDENTITY_API_KEY not set; /verify-token and /protected will reject all tokens");
            Arc::new(DisabledVerifier)
        }
    };

    let market = Arc::new(Mutex::new(MarketSimulator::new()));
    let ticker = MarketTicker::spawn(market.clone(), settings.tick_interval);

    // Create shared state
    let state = AppState::new(
        conn,
        verifier,
        PriceScraper::new(settings.carbon_prices_url.clone()),
        market,
    );

    let app = router(state);

    // Start server
    let addr = settings.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("🚀 Server running on http://{}", addr);
    info!("   API: http://{}/api/market", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    ticker.shutdown().await;
    info!("✅ Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", e);
    }
}
