// 🌱 Green Score Ledger - company registry + score updates
//
// Stand-in for the GreenScore contract:
// - `companies(address)` view      → get_company
// - `getGreenScore(address)` view  → get_green_score
// - `updateGreenScore(...)`        → update_green_score (emits GreenScoreUpdated)
// - `registerCompany(...)`         → register_company
//
// Storage: SQLite (WAL) with an append-only events table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

/// Score a freshly registered company starts with.
pub const INITIAL_GREEN_SCORE: u64 = 100;

/// Event name written for every score update.
pub const GREEN_SCORE_UPDATED: &str = "GreenScoreUpdated";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("invalid company address: {0}")]
    InvalidAddress(String),

    #[error("company already registered: {0}")]
    AlreadyRegistered(String),

    #[error("value out of range for {0}")]
    Overflow(&'static str),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

// ============================================================================
// ADDRESSES
// ============================================================================

/// Validate `0x` + 40 hex digits and return the lower-cased form.
pub fn normalize_address(address: &str) -> Result<String> {
    let trimmed = address.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| LedgerError::InvalidAddress(address.to_string()))?;

    if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(LedgerError::InvalidAddress(address.to_string()));
    }

    Ok(format!("0x{}", hex.to_lowercase()))
}

// ============================================================================
// ENTITIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Company {
    pub address: String,
    pub name: String,
    pub size: String,
    pub industry: String,
    pub location: String,
    pub green_score: u64,
    pub total_credits_sold: u64,
    pub total_credits_bought: u64,
    pub emissions_reduced: u64,
    pub registered_at: DateTime<Utc>,
}

impl Company {
    /// What an unset mapping slot reads as.
    pub fn unregistered(address: &str) -> Self {
        Self {
            address: address.to_string(),
            name: String::new(),
            size: String::new(),
            industry: String::new(),
            location: String::new(),
            green_score: 0,
            total_credits_sold: 0,
            total_credits_bought: 0,
            emissions_reduced: 0,
            registered_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// Registration input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewCompany {
    pub address: String,
    pub name: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub industry: String,
    #[serde(default)]
    pub location: String,
}

/// One `GreenScoreUpdated` emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GreenScoreEvent {
    pub event_id: String,
    /// sha256 receipt over (company, deltas, new score, timestamp)
    pub tx_hash: String,
    pub event_type: String,
    pub company: String,
    pub new_score: u64,
    pub credits_sold: u64,
    pub credits_bought: u64,
    pub emissions_reduced: u64,
    pub timestamp: DateTime<Utc>,
}

/// Score from accumulated totals: 100 + bought + 2 × reduced − sold, floored at 0.
pub fn compute_green_score(sold: u64, bought: u64, reduced: u64) -> u64 {
    INITIAL_GREEN_SCORE
        .saturating_add(bought)
        .saturating_add(reduced.saturating_mul(2))
        .saturating_sub(sold)
}

fn to_sql(value: u64, field: &'static str) -> Result<i64> {
    i64::try_from(value).map_err(|_| LedgerError::Overflow(field))
}

fn from_sql(value: i64) -> u64 {
    value.max(0) as u64
}

fn parse_time(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery; in-memory databases report "memory" and ignore it
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS companies (
            address TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            size TEXT NOT NULL,
            industry TEXT NOT NULL,
            location TEXT NOT NULL,
            green_score INTEGER NOT NULL,
            total_credits_sold INTEGER NOT NULL DEFAULT 0,
            total_credits_bought INTEGER NOT NULL DEFAULT 0,
            emissions_reduced INTEGER NOT NULL DEFAULT 0,
            registered_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS green_score_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            tx_hash TEXT NOT NULL,
            event_type TEXT NOT NULL,
            company TEXT NOT NULL,
            new_score INTEGER NOT NULL,
            credits_sold INTEGER NOT NULL,
            credits_bought INTEGER NOT NULL,
            emissions_reduced INTEGER NOT NULL,
            timestamp TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_company ON green_score_events(company)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// OPERATIONS
// ============================================================================

const COMPANY_COLUMNS: &str = "address, name, size, industry, location, green_score,
     total_credits_sold, total_credits_bought, emissions_reduced, registered_at";

fn company_from_row(row: &Row<'_>) -> rusqlite::Result<Company> {
    let registered_at: String = row.get(9)?;
    Ok(Company {
        address: row.get(0)?,
        name: row.get(1)?,
        size: row.get(2)?,
        industry: row.get(3)?,
        location: row.get(4)?,
        green_score: from_sql(row.get(5)?),
        total_credits_sold: from_sql(row.get(6)?),
        total_credits_bought: from_sql(row.get(7)?),
        emissions_reduced: from_sql(row.get(8)?),
        registered_at: parse_time(&registered_at),
    })
}

fn insert_company(conn: &Connection, company: &Company) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO companies ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            COMPANY_COLUMNS
        ),
        params![
            company.address,
            company.name,
            company.size,
            company.industry,
            company.location,
            to_sql(company.green_score, "green_score")?,
            to_sql(company.total_credits_sold, "total_credits_sold")?,
            to_sql(company.total_credits_bought, "total_credits_bought")?,
            to_sql(company.emissions_reduced, "emissions_reduced")?,
            company.registered_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Register a company at `address` with the initial green score.
pub fn register_company(conn: &Connection, new: NewCompany) -> Result<Company> {
    let address = normalize_address(&new.address)?;

    let company = Company {
        address: address.clone(),
        name: new.name.trim().to_string(),
        size: new.size,
        industry: new.industry,
        location: new.location,
        green_score: INITIAL_GREEN_SCORE,
        total_credits_sold: 0,
        total_credits_bought: 0,
        emissions_reduced: 0,
        registered_at: Utc::now(),
    };

    match insert_company(conn, &company) {
        Ok(()) => {
            info!(%address, name = %company.name, "company registered");
            Ok(company)
        }
        Err(LedgerError::Database(rusqlite::Error::SqliteFailure(err, _)))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(LedgerError::AlreadyRegistered(address))
        }
        Err(e) => Err(e),
    }
}

/// `companies(address)` view. `None` for an address never written.
pub fn get_company(conn: &Connection, address: &str) -> Result<Option<Company>> {
    let address = normalize_address(address)?;

    let company = conn
        .query_row(
            &format!("SELECT {} FROM companies WHERE address = ?1", COMPANY_COLUMNS),
            params![address],
            company_from_row,
        )
        .optional()?;

    Ok(company)
}

/// `getGreenScore(address)` view. Unknown addresses read as 0.
pub fn get_green_score(conn: &Connection, address: &str) -> Result<u64> {
    Ok(get_company(conn, address)?
        .map(|c| c.green_score)
        .unwrap_or(0))
}

pub fn list_companies(conn: &Connection) -> Result<Vec<Company>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM companies ORDER BY registered_at, address",
        COMPANY_COLUMNS
    ))?;

    let companies = stmt
        .query_map([], company_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(companies)
}

fn receipt_hash(company: &str, sold: u64, bought: u64, reduced: u64, score: u64, at: &DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}|{}|{}|{}|{}|{}",
        company,
        sold,
        bought,
        reduced,
        score,
        at.to_rfc3339()
    ));
    format!("0x{:x}", hasher.finalize())
}

/// `updateGreenScore(company, sold, bought, reduced)`.
///
/// Adds the deltas to the company's running totals, recomputes the score and
/// records a `GreenScoreUpdated` event. Anyone may call it for any address;
/// an unknown address is created with an empty profile.
pub fn update_green_score(
    conn: &Connection,
    address: &str,
    credits_sold: u64,
    credits_bought: u64,
    emissions_reduced: u64,
) -> Result<u64> {
    let address = normalize_address(address)?;
    let tx = conn.unchecked_transaction()?;

    let mut company = match get_company(&tx, &address)? {
        Some(company) => company,
        None => {
            let mut fresh = Company::unregistered(&address);
            fresh.registered_at = Utc::now();
            fresh.green_score = INITIAL_GREEN_SCORE;
            insert_company(&tx, &fresh)?;
            debug!(%address, "score update created unregistered company");
            fresh
        }
    };

    company.total_credits_sold = company
        .total_credits_sold
        .checked_add(credits_sold)
        .ok_or(LedgerError::Overflow("total_credits_sold"))?;
    company.total_credits_bought = company
        .total_credits_bought
        .checked_add(credits_bought)
        .ok_or(LedgerError::Overflow("total_credits_bought"))?;
    company.emissions_reduced = company
        .emissions_reduced
        .checked_add(emissions_reduced)
        .ok_or(LedgerError::Overflow("emissions_reduced"))?;
    company.green_score = compute_green_score(
        company.total_credits_sold,
        company.total_credits_bought,
        company.emissions_reduced,
    );

    tx.execute(
        "UPDATE companies
         SET green_score = ?1, total_credits_sold = ?2, total_credits_bought = ?3, emissions_reduced = ?4
         WHERE address = ?5",
        params![
            to_sql(company.green_score, "green_score")?,
            to_sql(company.total_credits_sold, "total_credits_sold")?,
            to_sql(company.total_credits_bought, "total_credits_bought")?,
            to_sql(company.emissions_reduced, "emissions_reduced")?,
            address,
        ],
    )?;

    let now = Utc::now();
    let event = GreenScoreEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        tx_hash: receipt_hash(
            &address,
            credits_sold,
            credits_bought,
            emissions_reduced,
            company.green_score,
            &now,
        ),
        event_type: GREEN_SCORE_UPDATED.to_string(),
        company: address.clone(),
        new_score: company.green_score,
        credits_sold,
        credits_bought,
        emissions_reduced,
        timestamp: now,
    };
    insert_event(&tx, &event)?;

    tx.commit()?;

    info!(
        %address,
        new_score = company.green_score,
        tx_hash = %event.tx_hash,
        "GreenScoreUpdated"
    );

    Ok(company.green_score)
}

fn insert_event(conn: &Connection, event: &GreenScoreEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO green_score_events (
            event_id, tx_hash, event_type, company, new_score,
            credits_sold, credits_bought, emissions_reduced, timestamp
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            event.event_id,
            event.tx_hash,
            event.event_type,
            event.company,
            to_sql(event.new_score, "new_score")?,
            to_sql(event.credits_sold, "credits_sold")?,
            to_sql(event.credits_bought, "credits_bought")?,
            to_sql(event.emissions_reduced, "emissions_reduced")?,
            event.timestamp.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// All `GreenScoreUpdated` events for a company, oldest first.
pub fn events_for_company(conn: &Connection, address: &str) -> Result<Vec<GreenScoreEvent>> {
    let address = normalize_address(address)?;

    let mut stmt = conn.prepare(
        "SELECT event_id, tx_hash, event_type, company, new_score,
                credits_sold, credits_bought, emissions_reduced, timestamp
         FROM green_score_events
         WHERE company = ?1
         ORDER BY id ASC",
    )?;

    let events = stmt
        .query_map(params![address], |row| {
            let timestamp: String = row.get(8)?;
            Ok(GreenScoreEvent {
                event_id: row.get(0)?,
                tx_hash: row.get(1)?,
                event_type: row.get(2)?,
                company: row.get(3)?,
                new_score: from_sql(row.get(4)?),
                credits_sold: from_sql(row.get(5)?),
                credits_bought: from_sql(row.get(6)?),
                emissions_reduced: from_sql(row.get(7)?),
                timestamp: parse_time(&timestamp),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACME: &str = "0x43dB9f1C54b380e00Cd7F621Cf172518FC184a47";
    const OTHER: &str = "0xa31978e578b51b5ae96a802d194a198ff883a035";

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn acme() -> NewCompany {
        NewCompany {
            address: ACME.to_string(),
            name: "Acme Renewables".to_string(),
            size: "Medium".to_string(),
            industry: "Energy".to_string(),
            location: "Oslo".to_string(),
        }
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(
            normalize_address(ACME).unwrap(),
            "0x43db9f1c54b380e00cd7f621cf172518fc184a47"
        );
        assert!(normalize_address("43db9f1c54b380e00cd7f621cf172518fc184a47").is_err());
        assert!(normalize_address("0x1234").is_err());
        assert!(normalize_address("0xZZdb9f1c54b380e00cd7f621cf172518fc184a47").is_err());
    }

    #[test]
    fn test_register_company() {
        let conn = setup();
        let company = register_company(&conn, acme()).unwrap();

        assert_eq!(company.address, "0x43db9f1c54b380e00cd7f621cf172518fc184a47");
        assert_eq!(company.green_score, INITIAL_GREEN_SCORE);

        let stored = get_company(&conn, ACME).unwrap().unwrap();
        assert_eq!(stored.name, "Acme Renewables");
        assert_eq!(stored.industry, "Energy");
        assert_eq!(stored.total_credits_bought, 0);
    }

    #[test]
    fn test_register_twice_rejected() {
        let conn = setup();
        register_company(&conn, acme()).unwrap();

        let mut again = acme();
        again.address = ACME.to_lowercase();
        assert!(matches!(
            register_company(&conn, again),
            Err(LedgerError::AlreadyRegistered(_))
        ));
        assert_eq!(list_companies(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_company_reads_as_zero() {
        let conn = setup();
        assert_eq!(get_company(&conn, OTHER).unwrap(), None);
        assert_eq!(get_green_score(&conn, OTHER).unwrap(), 0);
    }

    #[test]
    fn test_update_accumulates_and_rescores() {
        let conn = setup();
        register_company(&conn, acme()).unwrap();

        // buy 10, reduce 10 → 100 + 10 + 20
        assert_eq!(update_green_score(&conn, ACME, 0, 10, 10).unwrap(), 130);
        // sell 10, reduce 10 → 100 + 10 + 40 - 10
        assert_eq!(update_green_score(&conn, ACME, 10, 0, 10).unwrap(), 140);

        let company = get_company(&conn, ACME).unwrap().unwrap();
        assert_eq!(company.total_credits_sold, 10);
        assert_eq!(company.total_credits_bought, 10);
        assert_eq!(company.emissions_reduced, 20);
    }

    #[test]
    fn test_score_view_matches_mapping_after_updates() {
        let conn = setup();
        register_company(&conn, acme()).unwrap();

        let updates = [(0, 5, 1), (50, 0, 0), (500, 0, 0), (0, 1_000, 3), (7, 7, 7)];
        for (sold, bought, reduced) in updates {
            let returned = update_green_score(&conn, ACME, sold, bought, reduced).unwrap();
            let mapping = get_company(&conn, ACME).unwrap().unwrap().green_score;
            assert_eq!(get_green_score(&conn, ACME).unwrap(), mapping);
            assert_eq!(returned, mapping);
        }
    }

    #[test]
    fn test_score_floors_at_zero() {
        assert_eq!(compute_green_score(1_000, 0, 0), 0);
        assert_eq!(compute_green_score(0, 0, 0), INITIAL_GREEN_SCORE);
        assert_eq!(compute_green_score(0, u64::MAX, u64::MAX), u64::MAX);
    }

    #[test]
    fn test_update_unregistered_creates_entry() {
        let conn = setup();
        let score = update_green_score(&conn, OTHER, 0, 3, 0).unwrap();

        assert_eq!(score, 103);
        let company = get_company(&conn, OTHER).unwrap().unwrap();
        assert_eq!(company.name, "");
        assert_eq!(company.green_score, 103);

        // A later registration of the same address is a duplicate
        let mut late = acme();
        late.address = OTHER.to_string();
        assert!(matches!(
            register_company(&conn, late),
            Err(LedgerError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_update_emits_event() {
        let conn = setup();
        register_company(&conn, acme()).unwrap();
        update_green_score(&conn, ACME, 0, 10, 10).unwrap();
        update_green_score(&conn, ACME, 4, 0, 0).unwrap();

        let events = events_for_company(&conn, ACME).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, GREEN_SCORE_UPDATED);
        assert_eq!(events[0].new_score, 130);
        assert_eq!(events[1].credits_sold, 4);
        assert_eq!(events[1].new_score, 126);
        assert!(events[0].tx_hash.starts_with("0x"));
        assert_eq!(events[0].tx_hash.len(), 66);
        assert_ne!(events[0].tx_hash, events[1].tx_hash);

        assert!(events_for_company(&conn, OTHER).unwrap().is_empty());
    }

    #[test]
    fn test_overflowing_total_rolls_back() {
        let conn = setup();
        register_company(&conn, acme()).unwrap();
        update_green_score(&conn, ACME, 0, i64::MAX as u64 - 200, 0).unwrap();

        // totals still fit, but the resulting score no longer does
        assert!(matches!(
            update_green_score(&conn, ACME, 0, 200, 0),
            Err(LedgerError::Overflow(_))
        ));
        assert_eq!(events_for_company(&conn, ACME).unwrap().len(), 1);
    }

    #[test]
    fn test_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");

        {
            let conn = Connection::open(&path).unwrap();
            setup_database(&conn).unwrap();
            register_company(&conn, acme()).unwrap();
            update_green_score(&conn, ACME, 0, 1, 0).unwrap();
        }

        let conn = Connection::open(&path).unwrap();
        setup_database(&conn).unwrap();
        assert_eq!(get_green_score(&conn, ACME).unwrap(), 101);
    }
}
