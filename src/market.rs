// 📈 Market Simulator - synthetic carbon credit price feed
//
// Random walk per market:
// - direction drawn with a bullish bias, bent by momentum from the last move
// - magnitude = base volatility scaled by up to +50% noise
// - price floored at MIN_PRICE, so it can never reach zero

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Probability of an up move with no previous trend.
pub const BULLISH_PROBABILITY: f64 = 0.6;

/// Applied to the up probability after an up move; (1 - MOMENTUM) after a down move.
pub const MOMENTUM: f64 = 0.7;

/// Price floor applied after every step.
pub const MIN_PRICE: f64 = 0.01;

/// Fallback volatility for markets without one.
pub const DEFAULT_VOLATILITY: f64 = 0.015;

/// Fallback starting price for markets with no known base.
pub const DEFAULT_BASE_PRICE: f64 = 50.00;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketCategory {
    Compliance,
    Voluntary,
}

impl MarketCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketCategory::Compliance => "compliance",
            MarketCategory::Voluntary => "voluntary",
        }
    }
}

impl std::str::FromStr for MarketCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "compliance" => Ok(MarketCategory::Compliance),
            "voluntary" => Ok(MarketCategory::Voluntary),
            other => Err(format!("unknown market category: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Up,
    Down,
}

/// One emitted price point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketPrice {
    pub market: String,
    pub price: f64,
    pub currency: String,
    /// Percent change against the previous tick
    pub change: f64,
    #[serde(rename = "type")]
    pub category: MarketCategory,
    #[serde(rename = "baseVolatility")]
    pub base_volatility: f64,
}

/// Static description of a simulated market.
#[derive(Debug, Clone)]
pub struct MarketDefinition {
    pub market: String,
    pub currency: String,
    pub category: MarketCategory,
    pub base_volatility: f64,
    pub base_price: f64,
}

impl MarketDefinition {
    pub fn new(
        market: &str,
        currency: &str,
        category: MarketCategory,
        base_volatility: f64,
        base_price: f64,
    ) -> Self {
        Self {
            market: market.to_string(),
            currency: currency.to_string(),
            category,
            base_volatility,
            base_price,
        }
    }

    /// Market without an explicit price: starts from its known base price,
    /// or `DEFAULT_BASE_PRICE` for markets outside the default set.
    pub fn unpriced(
        market: &str,
        currency: &str,
        category: MarketCategory,
        base_volatility: f64,
    ) -> Self {
        Self::new(
            market,
            currency,
            category,
            base_volatility,
            base_price_for(market),
        )
    }

    fn quote(&self, price: f64, change: f64) -> MarketPrice {
        MarketPrice {
            market: self.market.clone(),
            price,
            currency: self.currency.clone(),
            change,
            category: self.category,
            base_volatility: self.base_volatility,
        }
    }
}

/// The nine markets shown on the trading page.
pub fn default_markets() -> Vec<MarketDefinition> {
    use MarketCategory::*;

    vec![
        MarketDefinition::new("European Union", "€", Compliance, 0.015, 79.90),
        MarketDefinition::new("UK", "$", Compliance, 0.02, 46.78),
        MarketDefinition::new("Australia", "AUD", Compliance, 0.018, 34.10),
        MarketDefinition::new("New Zealand", "NZD", Compliance, 0.016, 63.25),
        MarketDefinition::new("South Korea", "$", Compliance, 0.025, 6.68),
        MarketDefinition::new("China", "¥", Compliance, 0.022, 91.14),
        MarketDefinition::new("Aviation Industry Offset", "$", Voluntary, 0.03, 0.39),
        MarketDefinition::new("Nature Based Offset", "$", Voluntary, 0.028, 0.50),
        MarketDefinition::new("Tech Based Offset", "$", Voluntary, 0.026, 0.35),
    ]
}

/// Known starting price for a market name.
pub fn base_price_for(market: &str) -> f64 {
    default_markets()
        .into_iter()
        .find(|m| m.market == market)
        .map(|m| m.base_price)
        .unwrap_or(DEFAULT_BASE_PRICE)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ============================================================================
// SIMULATOR
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct MarketState {
    price: f64,
    trend: Option<Trend>,
}

pub struct MarketSimulator {
    markets: Vec<MarketDefinition>,
    state: HashMap<String, MarketState>,
    last: Vec<MarketPrice>,
    ticks: u64,
    rng: Box<dyn RngCore + Send>,
}

impl std::fmt::Debug for MarketSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketSimulator")
            .field("markets", &self.markets.len())
            .field("ticks", &self.ticks)
            .finish()
    }
}

impl Default for MarketSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketSimulator {
    /// Simulator over the default markets, seeded from entropy.
    pub fn new() -> Self {
        Self::with_rng(default_markets(), StdRng::from_entropy())
    }

    /// Deterministic simulator for reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(default_markets(), StdRng::seed_from_u64(seed))
    }

    pub fn with_rng<R>(markets: Vec<MarketDefinition>, rng: R) -> Self
    where
        R: RngCore + Send + 'static,
    {
        let mut sim = Self {
            markets,
            state: HashMap::new(),
            last: Vec::new(),
            ticks: 0,
            rng: Box::new(rng),
        };
        sim.initialize();
        sim
    }

    /// Reset every market to its base price with no trend.
    pub fn initialize(&mut self) -> Vec<MarketPrice> {
        self.state.clear();
        self.ticks = 0;

        self.last = self
            .markets
            .iter()
            .map(|m| {
                self.state.insert(
                    m.market.clone(),
                    MarketState {
                        price: m.base_price,
                        trend: None,
                    },
                );
                m.quote(m.base_price, 0.0)
            })
            .collect();

        self.last.clone()
    }

    /// Advance every market one step.
    pub fn tick(&mut self) -> Vec<MarketPrice> {
        let mut quotes = Vec::with_capacity(self.markets.len());

        for market in &self.markets {
            let prev = self.state.get(&market.market).copied().unwrap_or(MarketState {
                price: market.base_price,
                trend: None,
            });

            let mut up_probability = BULLISH_PROBABILITY;
            match prev.trend {
                Some(Trend::Up) => up_probability *= MOMENTUM,
                Some(Trend::Down) => up_probability *= 1.0 - MOMENTUM,
                None => {}
            }

            let movement = if self.rng.gen::<f64>() < up_probability {
                1.0
            } else {
                -1.0
            };

            let base = if market.base_volatility > 0.0 {
                market.base_volatility
            } else {
                DEFAULT_VOLATILITY
            };
            let volatility = base * (1.0 + self.rng.gen::<f64>() * 0.5);
            let new_price = (prev.price + prev.price * volatility * movement).max(MIN_PRICE);
            let percent_change = (new_price - prev.price) / prev.price * 100.0;

            self.state.insert(
                market.market.clone(),
                MarketState {
                    price: new_price,
                    trend: Some(if movement > 0.0 { Trend::Up } else { Trend::Down }),
                },
            );

            quotes.push(market.quote(round2(new_price), round2(percent_change)));
        }

        self.ticks += 1;
        self.last = quotes.clone();
        quotes
    }

    /// Last emitted prices without advancing.
    pub fn snapshot(&self) -> Vec<MarketPrice> {
        self.last.clone()
    }

    pub fn snapshot_by_category(&self, category: MarketCategory) -> Vec<MarketPrice> {
        self.last
            .iter()
            .filter(|p| p.category == category)
            .cloned()
            .collect()
    }

    /// Last emitted (rounded) price of a market.
    pub fn price_of(&self, market: &str) -> Option<f64> {
        self.last.iter().find(|p| p.market == market).map(|p| p.price)
    }

    pub fn trend_of(&self, market: &str) -> Option<Trend> {
        self.state.get(market).and_then(|s| s.trend)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

// ============================================================================
// TICKER (fixed-interval background task)
// ============================================================================

pub type SharedSimulator = Arc<Mutex<MarketSimulator>>;

pub struct MarketTicker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MarketTicker {
    /// Spawn a task ticking `simulator` every `period`.
    pub fn spawn(simulator: SharedSimulator, period: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick of a tokio interval fires immediately; skip it so the
            // initial snapshot stays at base prices for one period.
            interval.tick().await;
            info!(period_ms = period.as_millis() as u64, "market ticker started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match simulator.lock() {
                            Ok(mut sim) => {
                                sim.tick();
                                debug!(tick = sim.ticks(), "market prices advanced");
                            }
                            Err(_) => {
                                warn!("market simulator lock poisoned, stopping ticker");
                                break;
                            }
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("market ticker stopped");
        });

        Self { shutdown, handle }
    }

    /// Signal the task to stop and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

// ============================================================================
// CSV EXPORT
// ============================================================================

#[derive(Debug, Serialize)]
struct TickRecord<'a> {
    tick: u64,
    market: &'a str,
    category: &'a str,
    currency: &'a str,
    price: f64,
    change: f64,
}

/// Append one tick's prices as CSV rows (header written by the csv writer on first row).
pub fn write_tick_csv<W: Write>(
    writer: &mut csv::Writer<W>,
    tick: u64,
    prices: &[MarketPrice],
) -> Result<()> {
    for p in prices {
        writer.serialize(TickRecord {
            tick,
            market: &p.market,
            category: p.category.as_str(),
            currency: &p.currency,
            price: p.price,
            change: p.change,
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_uses_base_prices() {
        let mut sim = MarketSimulator::seeded(1);
        let prices = sim.initialize();

        assert_eq!(prices.len(), 9);
        assert_eq!(sim.price_of("European Union"), Some(79.90));
        assert_eq!(sim.price_of("Tech Based Offset"), Some(0.35));
        assert!(prices.iter().all(|p| p.change == 0.0));
        assert_eq!(sim.ticks(), 0);
    }

    #[test]
    fn test_prices_stay_positive_over_many_ticks() {
        // Penny markets with high volatility are the ones that hit the floor
        let markets = vec![
            MarketDefinition::new("Penny", "$", MarketCategory::Voluntary, 0.9, 0.02),
            MarketDefinition::new("Floor", "$", MarketCategory::Voluntary, 0.99, MIN_PRICE),
        ];
        let mut sim = MarketSimulator::with_rng(markets, StdRng::seed_from_u64(7));

        for _ in 0..5_000 {
            for p in sim.tick() {
                assert!(p.price > 0.0, "{} went to {}", p.market, p.price);
            }
        }

        let mut sim = MarketSimulator::seeded(42);
        for _ in 0..2_000 {
            assert!(sim.tick().iter().all(|p| p.price > 0.0));
        }
    }

    #[test]
    fn test_step_is_bounded_by_volatility() {
        let mut sim = MarketSimulator::seeded(3);

        for _ in 0..200 {
            for p in sim.tick() {
                // |change| <= 1.5 * volatility, plus rounding slack
                let max = p.base_volatility * 1.5 * 100.0 + 0.01;
                assert!(p.change.abs() <= max, "{}: {} > {}", p.market, p.change, max);
            }
        }
    }

    #[test]
    fn test_same_seed_same_walk() {
        let mut a = MarketSimulator::seeded(99);
        let mut b = MarketSimulator::seeded(99);

        for _ in 0..50 {
            assert_eq!(a.tick(), b.tick());
        }
    }

    #[test]
    fn test_tick_records_trend() {
        let mut sim = MarketSimulator::seeded(5);
        assert_eq!(sim.trend_of("UK"), None);

        let prices = sim.tick();
        let uk = prices.iter().find(|p| p.market == "UK").unwrap();
        let expected = if uk.change >= 0.0 { Trend::Up } else { Trend::Down };
        assert_eq!(sim.trend_of("UK"), Some(expected));
        assert_eq!(sim.snapshot(), prices);
    }

    #[test]
    fn test_initialize_restarts_walk() {
        let mut sim = MarketSimulator::seeded(11);
        for _ in 0..10 {
            sim.tick();
        }
        sim.initialize();

        assert_eq!(sim.ticks(), 0);
        assert_eq!(sim.price_of("China"), Some(91.14));
        assert_eq!(sim.trend_of("China"), None);
    }

    #[test]
    fn test_snapshot_by_category() {
        let sim = MarketSimulator::seeded(0);

        assert_eq!(sim.snapshot_by_category(MarketCategory::Compliance).len(), 6);
        assert_eq!(sim.snapshot_by_category(MarketCategory::Voluntary).len(), 3);
    }

    #[test]
    fn test_base_price_fallback() {
        assert_eq!(base_price_for("UK"), 46.78);
        assert_eq!(base_price_for("Atlantis"), DEFAULT_BASE_PRICE);
    }

    #[test]
    fn test_unpriced_markets_start_from_base_price() {
        let sim = MarketSimulator::with_rng(
            vec![
                MarketDefinition::unpriced("UK", "$", MarketCategory::Compliance, 0.02),
                MarketDefinition::unpriced("Atlantis", "$", MarketCategory::Voluntary, 0.02),
            ],
            StdRng::seed_from_u64(3),
        );

        assert_eq!(sim.price_of("UK"), Some(46.78));
        assert_eq!(sim.price_of("Atlantis"), Some(50.00));
    }

    #[test]
    fn test_category_parsing_and_json_shape() {
        assert_eq!("Voluntary".parse::<MarketCategory>(), Ok(MarketCategory::Voluntary));
        assert!("spot".parse::<MarketCategory>().is_err());

        let sim = MarketSimulator::seeded(0);
        let json = serde_json::to_value(&sim.snapshot()[0]).unwrap();
        assert_eq!(json["type"], "compliance");
        assert_eq!(json["market"], "European Union");
        assert_eq!(json["baseVolatility"], 0.015);
    }

    #[test]
    fn test_write_tick_csv() {
        let mut sim = MarketSimulator::seeded(8);
        let mut writer = csv::Writer::from_writer(Vec::new());

        write_tick_csv(&mut writer, 1, &sim.tick()).unwrap();
        write_tick_csv(&mut writer, 2, &sim.tick()).unwrap();

        let data = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = data.lines().collect();
        assert_eq!(lines[0], "tick,market,category,currency,price,change");
        assert_eq!(lines.len(), 1 + 18);
        assert!(lines[1].starts_with("1,European Union,compliance,"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_advances_and_stops() {
        let shared: SharedSimulator = Arc::new(Mutex::new(MarketSimulator::seeded(1)));
        let ticker = MarketTicker::spawn(shared.clone(), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(350)).await;
        ticker.shutdown().await;

        let ticks = shared.lock().unwrap().ticks();
        assert!(ticks >= 2, "expected at least two ticks, got {}", ticks);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(shared.lock().unwrap().ticks(), ticks);
    }
}
