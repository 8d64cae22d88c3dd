// Only compile UI module when TUI feature is enabled
#[cfg(feature = "tui")]
mod ui;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use std::fs::File;
use std::path::PathBuf;
use tracing::info;

use greenledger::{
    events_for_company, get_company, list_companies, register_company, setup_database,
    update_green_score, HttpIdentityVerifier, IdentityVerifier, MarketCategory, MarketSimulator,
    NewCompany, PriceScraper, Settings,
};

#[derive(Parser)]
#[command(name = "greenledger", version, about = "Carbon credit market simulator and green score ledger")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the price simulator and print each tick
    Simulate {
        #[arg(long, default_value_t = 10)]
        ticks: u64,
        #[arg(long)]
        seed: Option<u64>,
        /// compliance or voluntary
        #[arg(long)]
        category: Option<MarketCategory>,
        /// Also write every tick to this CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Live terminal ticker
    Ticker {
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Register a company (registerCompany)
    Register {
        #[arg(long)]
        address: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        size: String,
        #[arg(long, default_value = "")]
        industry: String,
        #[arg(long, default_value = "")]
        location: String,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Show a company and its green score
    Score {
        #[arg(long)]
        address: String,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Apply a green score update (updateGreenScore)
    Update {
        #[arg(long)]
        address: String,
        #[arg(long, default_value_t = 0)]
        sold: u64,
        #[arg(long, default_value_t = 0)]
        bought: u64,
        #[arg(long, default_value_t = 0)]
        reduced: u64,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// List GreenScoreUpdated events for a company
    Events {
        #[arg(long)]
        address: String,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// List registered companies
    Companies {
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Fetch and print the live carbon price table
    Scrape,
    /// Verify an ID token with the identity provider
    Verify {
        #[arg(long, env = "ID_TOKEN")]
        token: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    settings.logging.init();

    match cli.command {
        Command::Simulate {
            ticks,
            seed,
            category,
            csv,
        } => run_simulate(ticks, seed, category, csv),
        Command::Ticker { seed, interval_ms } => run_ticker(&settings, seed, interval_ms),
        Command::Register {
            address,
            name,
            size,
            industry,
            location,
            db,
        } => {
            let conn = open_ledger(&settings, db)?;
            let company = register_company(
                &conn,
                NewCompany {
                    address,
                    name,
                    size,
                    industry,
                    location,
                },
            )?;
            println!("✓ Registered {} ({}) with green score {}", company.name, company.address, company.green_score);
            Ok(())
        }
        Command::Score { address, db } => {
            let conn = open_ledger(&settings, db)?;
            match get_company(&conn, &address)? {
                Some(c) => {
                    println!("{} {}", c.address, if c.name.is_empty() { "(unnamed)" } else { c.name.as_str() });
                    println!("  green score:       {}", c.green_score);
                    println!("  credits sold:      {}", c.total_credits_sold);
                    println!("  credits bought:    {}", c.total_credits_bought);
                    println!("  emissions reduced: {}", c.emissions_reduced);
                }
                None => println!("{} is not registered (green score 0)", address),
            }
            Ok(())
        }
        Command::Update {
            address,
            sold,
            bought,
            reduced,
            db,
        } => {
            let conn = open_ledger(&settings, db)?;
            let score = update_green_score(&conn, &address, sold, bought, reduced)?;
            println!("✓ GreenScoreUpdated {} → {}", address, score);
            Ok(())
        }
        Command::Events { address, db } => {
            let conn = open_ledger(&settings, db)?;
            for e in events_for_company(&conn, &address)? {
                println!(
                    "{}  {}  sold={} bought={} reduced={} → {}  {}",
                    e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    e.event_type,
                    e.credits_sold,
                    e.credits_bought,
                    e.emissions_reduced,
                    e.new_score,
                    e.tx_hash
                );
            }
            Ok(())
        }
        Command::Companies { db } => {
            let conn = open_ledger(&settings, db)?;
            for c in list_companies(&conn)? {
                println!("{}  {:<30} {:>8}", c.address, c.name, c.green_score);
            }
            Ok(())
        }
        Command::Scrape => {
            let scraper = PriceScraper::new(settings.carbon_prices_url.clone());
            let runtime = tokio::runtime::Runtime::new()?;
            let table = runtime.block_on(scraper.fetch_price_table())?;
            println!("{}", table);
            Ok(())
        }
        Command::Verify { token } => {
            let key = settings.require_identity_api_key()?;
            let verifier = HttpIdentityVerifier::new(settings.identity_endpoint.clone(), key);
            let runtime = tokio::runtime::Runtime::new()?;
            let claims = runtime.block_on(verifier.verify(&token))?;
            println!("✓ uid:   {}", claims.uid);
            println!("  email: {}", claims.email.as_deref().unwrap_or("-"));
            Ok(())
        }
    }
}

fn open_ledger(settings: &Settings, db: Option<PathBuf>) -> Result<Connection> {
    let path = db.unwrap_or_else(|| settings.database_path.clone());
    let conn = Connection::open(&path)
        .with_context(|| format!("Failed to open database at {}", path.display()))?;
    setup_database(&conn)?;
    info!(path = %path.display(), "ledger opened");
    Ok(conn)
}

fn run_simulate(
    ticks: u64,
    seed: Option<u64>,
    category: Option<MarketCategory>,
    csv_path: Option<PathBuf>,
) -> Result<()> {
    let mut sim = match seed {
        Some(seed) => MarketSimulator::seeded(seed),
        None => MarketSimulator::new(),
    };

    let mut writer = match csv_path {
        Some(ref path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            Some(csv::Writer::from_writer(file))
        }
        None => None,
    };

    for _ in 0..ticks {
        let prices = sim.tick();
        let tick = sim.ticks();

        if let Some(w) = writer.as_mut() {
            greenledger::market::write_tick_csv(w, tick, &prices)?;
        }

        println!("── tick {} ──", tick);
        for p in prices
            .iter()
            .filter(|p| category.map_or(true, |c| p.category == c))
        {
            println!(
                "  {:<26} {:<10} {:>4} {:>9.2}  {:>+6.2}%",
                p.market,
                p.category.as_str(),
                p.currency,
                p.price,
                p.change
            );
        }
    }

    if let Some(path) = csv_path {
        println!("✓ Wrote {} ticks to {}", ticks, path.display());
    }

    Ok(())
}

#[cfg(feature = "tui")]
fn run_ticker(settings: &Settings, seed: Option<u64>, interval_ms: Option<u64>) -> Result<()> {
    let sim = match seed {
        Some(seed) => MarketSimulator::seeded(seed),
        None => MarketSimulator::new(),
    };
    let tick_rate = interval_ms
        .map(std::time::Duration::from_millis)
        .unwrap_or(settings.tick_interval);

    let mut app = ui::App::new(sim, tick_rate);
    ui::run_ui(&mut app)?;

    println!("\n✅ Ticker closed");
    Ok(())
}

#[cfg(not(feature = "tui"))]
fn run_ticker(_settings: &Settings, _seed: Option<u64>, _interval_ms: Option<u64>) -> Result<()> {
    eprintln!("❌ Ticker not available!");
    eprintln!("   Rebuild with: cargo build --features tui");
    eprintln!("   Or use web UI: cargo run --bin greenledger-server --features server");
    std::process::exit(1);
}
