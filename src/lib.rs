// GreenLedger - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod auth;     // Token verification relay
pub mod config;   // Settings + logging
pub mod ledger;   // Green score ledger (contract stand-in)
pub mod market;   // Simulated carbon credit prices
pub mod scraper;  // Live carbon price relay
pub mod trading;  // Buy/sell trade book

#[cfg(feature = "server")]
pub mod server;

// Re-export commonly used types
pub use auth::{bearer_token, AuthError, Claims, HttpIdentityVerifier, IdentityVerifier};
pub use config::{ConfigError, LoggingConfig, Settings};
pub use ledger::{
    Company, GreenScoreEvent, LedgerError, NewCompany,
    setup_database, register_company, get_company, get_green_score,
    update_green_score, list_companies, events_for_company, normalize_address,
};
pub use market::{
    MarketCategory, MarketDefinition, MarketPrice, MarketSimulator, MarketTicker,
    SharedSimulator, Trend,
};
pub use scraper::{extract_price_table, PriceScraper, ScrapeError};
pub use trading::{settle_trade, Trade, TradeBook, TradeError, TradeKind, TradeStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
