// ===============================
// src/positions.rs (per-strategy positions & PnL)
// ===============================
//
// Bookkeeping owned by exactly one strategy loop. Only confirmed fills reach
// these methods; the fill price is the one the venue reported.
//
use ahash::AHashMap as HashMap;
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub quantity: u64,
    /// Quantity-weighted average fill price.
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn cost(&self) -> f64 { self.entry_price * self.quantity as f64 }
}

#[derive(Debug, Clone)]
pub struct StrategyState {
    pub starting_capital: f64,
    pub cash: f64,
    /// Sum of open positions at cost.
    pub open_value: f64,
    pub positions: HashMap<String, Position>,
    /// symbol -> time of the last exit
    pub cooldown: HashMap<String, DateTime<Utc>>,
    /// symbol -> time of the last entry, drives holding-period exits
    pub last_trade: HashMap<String, DateTime<Utc>>,
    pub realized_pnl: f64,
}

impl StrategyState {
    pub fn new(starting_capital: f64) -> Self {
        Self {
            starting_capital,
            cash: starting_capital,
            open_value: 0.0,
            positions: HashMap::new(),
            cooldown: HashMap::new(),
            last_trade: HashMap::new(),
            realized_pnl: 0.0,
        }
    }

    pub fn holds(&self, symbol: &str) -> bool {
        self.positions.get(symbol).is_some_and(|p| p.quantity > 0)
    }

    pub fn apply_buy(&mut self, symbol: &str, qty: u64, fill_px: f64, at: DateTime<Utc>) {
        if qty == 0 {
            return;
        }
        let notional = fill_px * qty as f64;
        self.cash -= notional;
        self.open_value += notional;
        self.positions
            .entry(symbol.to_string())
            .and_modify(|p| {
                let total = p.quantity + qty;
                p.entry_price = (p.cost() + notional) / total as f64;
                p.quantity = total;
            })
            .or_insert(Position { quantity: qty, entry_price: fill_px, opened_at: at });
        self.last_trade.insert(symbol.to_string(), at);
    }

    /// Sells up to the held quantity. Returns the realized PnL of this fill.
    pub fn apply_sell(&mut self, symbol: &str, qty: u64, fill_px: f64, at: DateTime<Utc>) -> f64 {
        let Some(pos) = self.positions.get_mut(symbol) else {
            return 0.0;
        };
        let qty = qty.min(pos.quantity);
        let released = pos.entry_price * qty as f64;
        let pnl = (fill_px - pos.entry_price) * qty as f64;
        pos.quantity -= qty;
        if pos.quantity == 0 {
            self.positions.remove(symbol);
            self.last_trade.remove(symbol);
            self.cooldown.insert(symbol.to_string(), at);
        }
        self.cash += fill_px * qty as f64;
        self.open_value = (self.open_value - released).max(0.0);
        if self.positions.is_empty() {
            self.open_value = 0.0;
        }
        self.realized_pnl += pnl;
        pnl
    }

    pub fn in_cooldown(&self, symbol: &str, now: DateTime<Utc>, period: Duration) -> bool {
        self.cooldown.get(symbol).is_some_and(|exit| now - *exit < period)
    }

    pub fn holding_expired(&self, symbol: &str, now: DateTime<Utc>, period: Duration) -> bool {
        self.last_trade.get(symbol).is_some_and(|entry| now - *entry >= period)
    }

    pub fn total_value(&self) -> f64 { self.cash + self.open_value }

    /// Total value relative to starting capital, in percent.
    pub fn performance(&self) -> f64 {
        if self.starting_capital <= 0.0 {
            return 0.0;
        }
        (self.total_value() / self.starting_capital - 1.0) * 100.0
    }
}
