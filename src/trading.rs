// 💱 Trade Book - buy/sell records and the credit balance
//
// A trade is created Pending and moves exactly once, to Completed or Failed.
// Completed only after every settlement step succeeded; the balance never
// goes negative.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::ledger::{self, LedgerError};

/// USD per unit of local currency on the trading form.
pub const LOCAL_TO_USD: f64 = 0.5;

#[derive(Error, Debug)]
pub enum TradeError {
    #[error("amount must be a positive number, got {0}")]
    InvalidAmount(f64),

    #[error("price must be a non-negative number, got {0}")]
    InvalidPrice(f64),

    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: f64, available: f64 },

    #[error("trade {id} is already {status:?}")]
    AlreadySettled { id: String, status: TradeStatus },

    #[error("settlement failed: {0}")]
    Settlement(#[from] LedgerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeKind {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TradeKind,
    pub amount: f64,
    pub price: f64,
    pub total: f64,
    pub status: TradeStatus,
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Trade {
    pub fn new(kind: TradeKind, amount: f64, price: f64) -> Result<Self, TradeError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(TradeError::InvalidAmount(amount));
        }
        if !price.is_finite() || price < 0.0 {
            return Err(TradeError::InvalidPrice(price));
        }

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            amount,
            price,
            total: amount * price,
            status: TradeStatus::Pending,
            date: Utc::now(),
            company: None,
            failure_reason: None,
        })
    }

    pub fn for_company(mut self, address: impl Into<String>) -> Self {
        self.company = Some(address.into());
        self
    }

    /// Whole credits mirrored into the green-score ledger.
    pub fn ledger_credits(&self) -> u64 {
        self.amount.round().max(0.0) as u64
    }
}

// ============================================================================
// TRADE BOOK
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct TradeBook {
    balance: f64,
    trades: Vec<Trade>,
}

impl TradeBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(balance: f64) -> Self {
        Self {
            balance: balance.max(0.0),
            trades: Vec::new(),
        }
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    /// Can this trade be applied to the current balance?
    pub fn check(&self, trade: &Trade) -> Result<(), TradeError> {
        if trade.status != TradeStatus::Pending {
            return Err(TradeError::AlreadySettled {
                id: trade.id.clone(),
                status: trade.status,
            });
        }

        if trade.kind == TradeKind::Sell && trade.amount > self.balance {
            return Err(TradeError::InsufficientBalance {
                requested: trade.amount,
                available: self.balance,
            });
        }

        Ok(())
    }

    fn complete(&mut self, mut trade: Trade) -> Trade {
        match trade.kind {
            TradeKind::Buy => self.balance += trade.amount,
            TradeKind::Sell => self.balance -= trade.amount,
        }
        trade.status = TradeStatus::Completed;
        info!(id = %trade.id, kind = ?trade.kind, amount = trade.amount, balance = self.balance, "trade completed");
        self.trades.push(trade.clone());
        trade
    }

    fn fail(&mut self, mut trade: Trade, reason: &TradeError) {
        trade.status = TradeStatus::Failed;
        trade.failure_reason = Some(reason.to_string());
        warn!(id = %trade.id, kind = ?trade.kind, %reason, "trade failed");
        self.trades.push(trade);
    }

    /// Apply a Pending trade. Rejected trades are recorded as Failed.
    pub fn submit(&mut self, trade: Trade) -> Result<Trade, TradeError> {
        if let Err(e) = self.check(&trade) {
            if !matches!(e, TradeError::AlreadySettled { .. }) {
                self.fail(trade, &e);
            }
            return Err(e);
        }
        Ok(self.complete(trade))
    }
}

/// Apply a trade and mirror it into the company's green score.
///
/// buy  → updateGreenScore(company, 0, credits, credits)
/// sell → updateGreenScore(company, credits, 0, credits)
///
/// The company comes from `trade.company`. Trades that round to zero whole
/// credits leave the ledger untouched.
pub fn settle_trade(conn: &Connection, book: &mut TradeBook, trade: Trade) -> Result<Trade, TradeError> {
    if let Err(e) = book.check(&trade) {
        if !matches!(e, TradeError::AlreadySettled { .. }) {
            book.fail(trade, &e);
        }
        return Err(e);
    }

    let credits = trade.ledger_credits();
    if let Some(company) = trade.company.as_deref().filter(|_| credits > 0) {
        let (sold, bought) = match trade.kind {
            TradeKind::Buy => (0, credits),
            TradeKind::Sell => (credits, 0),
        };

        if let Err(e) = ledger::update_green_score(conn, company, sold, bought, credits) {
            let err = TradeError::Settlement(e);
            book.fail(trade, &err);
            return Err(err);
        }
    }

    Ok(book.complete(trade))
}

// ============================================================================
// REGIONAL CONVERSION
// ============================================================================

/// Local currency per credit for the regions offered on the trading form.
pub fn conversion_rate(region: &str) -> Option<(f64, &'static str)> {
    match region {
        "European Union" => Some((78.60, "€")),
        "UK" => Some((45.68, "$")),
        "Australia" => Some((33.24, "AUD")),
        "New Zealand" => Some((62.23, "NZD")),
        "South Korea" => Some((6.90, "$")),
        "China" => Some((93.17, "¥")),
        _ => None,
    }
}

pub fn local_value(credits: f64, region: &str) -> Option<f64> {
    conversion_rate(region).map(|(rate, _)| credits * rate)
}

pub fn usd_value(credits: f64, region: &str) -> Option<f64> {
    local_value(credits, region).map(|local| local * LOCAL_TO_USD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{
        events_for_company, get_green_score, register_company, setup_database, NewCompany,
    };

    const ACME: &str = "0x43db9f1c54b380e00cd7f621cf172518fc184a47";

    #[test]
    fn test_new_trade_is_pending_with_total() {
        let trade = Trade::new(TradeKind::Buy, 4.0, 2.5).unwrap();
        assert_eq!(trade.status, TradeStatus::Pending);
        assert_eq!(trade.total, 10.0);
        assert!(!trade.id.is_empty());
    }

    #[test]
    fn test_invalid_amounts_and_prices() {
        assert!(matches!(Trade::new(TradeKind::Buy, 0.0, 1.0), Err(TradeError::InvalidAmount(_))));
        assert!(matches!(Trade::new(TradeKind::Buy, -3.0, 1.0), Err(TradeError::InvalidAmount(_))));
        assert!(matches!(Trade::new(TradeKind::Sell, f64::NAN, 1.0), Err(TradeError::InvalidAmount(_))));
        assert!(matches!(Trade::new(TradeKind::Sell, 1.0, -1.0), Err(TradeError::InvalidPrice(_))));
    }

    #[test]
    fn test_buy_then_sell() {
        let mut book = TradeBook::new();
        book.submit(Trade::new(TradeKind::Buy, 10.0, 1.0).unwrap()).unwrap();
        let sold = book.submit(Trade::new(TradeKind::Sell, 4.0, 1.0).unwrap()).unwrap();

        assert_eq!(sold.status, TradeStatus::Completed);
        assert_eq!(book.balance(), 6.0);
        assert_eq!(book.trades().len(), 2);
    }

    #[test]
    fn test_oversell_fails_and_keeps_balance() {
        let mut book = TradeBook::with_balance(3.0);
        let err = book
            .submit(Trade::new(TradeKind::Sell, 5.0, 1.0).unwrap())
            .unwrap_err();

        assert!(matches!(err, TradeError::InsufficientBalance { .. }));
        assert_eq!(book.balance(), 3.0);
        assert_eq!(book.trades()[0].status, TradeStatus::Failed);
        assert!(book.trades()[0].failure_reason.is_some());
    }

    #[test]
    fn test_settled_trade_cannot_resubmit() {
        let mut book = TradeBook::new();
        let done = book.submit(Trade::new(TradeKind::Buy, 1.0, 1.0).unwrap()).unwrap();

        assert!(matches!(book.submit(done), Err(TradeError::AlreadySettled { .. })));
        assert_eq!(book.balance(), 1.0);
        assert_eq!(book.trades().len(), 1);
    }

    #[test]
    fn test_settle_updates_green_score() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        register_company(
            &conn,
            NewCompany {
                address: ACME.to_string(),
                name: "Acme".to_string(),
                ..Default::default()
            },
        )
        .unwrap();

        let mut book = TradeBook::new();
        let buy = Trade::new(TradeKind::Buy, 10.0, 2.0).unwrap().for_company(ACME);
        settle_trade(&conn, &mut book, buy).unwrap();
        assert_eq!(get_green_score(&conn, ACME).unwrap(), 130);

        let sell = Trade::new(TradeKind::Sell, 10.0, 2.0).unwrap().for_company(ACME);
        settle_trade(&conn, &mut book, sell).unwrap();
        assert_eq!(get_green_score(&conn, ACME).unwrap(), 140);
        assert_eq!(book.balance(), 0.0);
    }

    #[test]
    fn test_fractional_trade_skips_ledger() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let mut book = TradeBook::new();
        let trade = Trade::new(TradeKind::Buy, 0.4, 2.0).unwrap().for_company(ACME);
        let done = settle_trade(&conn, &mut book, trade).unwrap();

        assert_eq!(done.status, TradeStatus::Completed);
        assert_eq!(book.balance(), 0.4);
        assert_eq!(get_green_score(&conn, ACME).unwrap(), 0);
        assert!(events_for_company(&conn, ACME).unwrap().is_empty());
    }

    #[test]
    fn test_settlement_failure_marks_failed() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let mut book = TradeBook::new();
        let trade = Trade::new(TradeKind::Buy, 2.0, 1.0).unwrap().for_company("not-an-address");
        let err = settle_trade(&conn, &mut book, trade).unwrap_err();

        assert!(matches!(err, TradeError::Settlement(LedgerError::InvalidAddress(_))));
        assert_eq!(book.balance(), 0.0);
        assert_eq!(book.trades()[0].status, TradeStatus::Failed);
    }

    #[test]
    fn test_conversion() {
        assert_eq!(conversion_rate("China"), Some((93.17, "¥")));
        assert_eq!(conversion_rate(""), None);
        assert_eq!(local_value(2.0, "UK"), Some(91.36));
        assert_eq!(usd_value(2.0, "UK"), Some(45.68));
        assert_eq!(usd_value(1.0, "Mars"), None);
    }

    #[test]
    fn test_trade_json_shape() {
        let trade = Trade::new(TradeKind::Sell, 1.0, 3.0).unwrap();
        let json = serde_json::to_value(&trade).unwrap();

        assert_eq!(json["type"], "sell");
        assert_eq!(json["status"], "Pending");
        assert!(json.get("company").is_none());
    }
}
