//! Per-venue L2 order book.
//!
//! Maintains book state from snapshots and incremental updates and serves
//! top-N extraction and tick aggregation. Each side is a `BTreeMap` keyed
//! by exact decimal price, so best-side maintenance is O(log n) in levels
//! touched rather than a rescan of the whole book.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::models::{DepthUpdate, DepthView, LevelView, PriceLevel, Snapshot, Venue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Bid,
    Ask,
}

#[derive(Debug, Clone)]
pub struct OrderBook {
    venue: Venue,
    symbol: String,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    best_bid: Option<Decimal>,
    best_ask: Option<Decimal>,
    last_update_id: u64,
    malformed_levels: u64,
}

impl OrderBook {
    pub fn new(venue: Venue, symbol: impl Into<String>) -> Self {
        Self {
            venue,
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            best_bid: None,
            best_ask: None,
            last_update_id: 0,
            malformed_levels: 0,
        }
    }

    pub fn venue(&self) -> Venue {
        self.venue
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    /// Count of levels dropped for carrying a negative quantity.
    pub fn malformed_levels(&self) -> u64 {
        self.malformed_levels
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.best_bid
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.best_ask
    }

    pub fn bid_depth(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_depth(&self) -> usize {
        self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Replaces any existing state with the snapshot's levels.
    pub fn load_snapshot(&mut self, snapshot: &Snapshot) {
        self.replace_sides(&snapshot.bids, &snapshot.asks);
        self.last_update_id = snapshot.last_update_id;
    }

    /// Applies a canonical update. Snapshot-flagged updates replace the
    /// book; deltas patch it level by level, with zero quantity removing a
    /// price. Never fails for a well-formed update.
    pub fn apply(&mut self, update: &DepthUpdate) {
        if update.is_snapshot {
            self.replace_sides(&update.bids, &update.asks);
        } else {
            for level in &update.bids {
                self.apply_level(Side::Bid, level);
            }
            for level in &update.asks {
                self.apply_level(Side::Ask, level);
            }
            self.recompute_best();
        }
        if update.has_sequencing() {
            self.last_update_id = update.final_update_id;
        }
    }

    fn replace_sides(&mut self, bids: &[PriceLevel], asks: &[PriceLevel]) {
        self.bids.clear();
        self.asks.clear();
        for level in bids {
            if level.quantity < Decimal::ZERO {
                self.malformed_levels += 1;
            } else if level.quantity > Decimal::ZERO {
                self.bids.insert(level.price, level.quantity);
            }
        }
        for level in asks {
            if level.quantity < Decimal::ZERO {
                self.malformed_levels += 1;
            } else if level.quantity > Decimal::ZERO {
                self.asks.insert(level.price, level.quantity);
            }
        }
        self.recompute_best();
    }

    fn apply_level(&mut self, side: Side, level: &PriceLevel) {
        if level.quantity < Decimal::ZERO {
            self.malformed_levels += 1;
            return;
        }
        let (own, opposite) = match side {
            Side::Bid => (&mut self.bids, &mut self.asks),
            Side::Ask => (&mut self.asks, &mut self.bids),
        };
        if level.quantity == Decimal::ZERO {
            own.remove(&level.price);
            return;
        }
        own.insert(level.price, level.quantity);
        // An inserted level wins any cross: stale opposite-side levels at or
        // through its price are removed so best_bid < best_ask holds after
        // every apply.
        match side {
            Side::Bid => {
                while let Some((&ask, _)) = opposite.first_key_value() {
                    if ask > level.price {
                        break;
                    }
                    opposite.remove(&ask);
                }
            }
            Side::Ask => {
                while let Some((&bid, _)) = opposite.last_key_value() {
                    if bid < level.price {
                        break;
                    }
                    opposite.remove(&bid);
                }
            }
        }
    }

    fn recompute_best(&mut self) {
        self.best_bid = self.bids.last_key_value().map(|(p, _)| *p);
        self.best_ask = self.asks.first_key_value().map(|(p, _)| *p);
    }

    /// Top `n` levels per side, best first, with running cumulative
    /// quantities. `n` is clamped to available depth.
    pub fn top_n(&self, n: usize) -> DepthView {
        let mut bids = Vec::with_capacity(n.min(self.bids.len()));
        let mut cum = Decimal::ZERO;
        for (price, qty) in self.bids.iter().rev().take(n) {
            cum += *qty;
            bids.push(LevelView {
                price: *price,
                quantity: *qty,
                cumulative: cum,
            });
        }

        let mut asks = Vec::with_capacity(n.min(self.asks.len()));
        let mut cum = Decimal::ZERO;
        for (price, qty) in self.asks.iter().take(n) {
            cum += *qty;
            asks.push(LevelView {
                price: *price,
                quantity: *qty,
                cumulative: cum,
            });
        }

        DepthView { bids, asks }
    }

    /// Like `top_n`, but prices are bucketed to multiples of `tick`: bids
    /// floor to the lower boundary, asks ceil to the upper, and quantities
    /// within a bucket sum. A non-positive tick falls back to raw levels.
    pub fn aggregate_by_tick(&self, tick: Decimal, n: usize) -> DepthView {
        if tick <= Decimal::ZERO {
            return self.top_n(n);
        }

        let mut bids = Vec::with_capacity(n);
        let mut cum = Decimal::ZERO;
        let mut current: Option<(Decimal, Decimal)> = None;
        for (price, qty) in self.bids.iter().rev() {
            let bucket = (price / tick).floor() * tick;
            match current {
                Some((open, acc)) if open == bucket => {
                    current = Some((open, acc + *qty));
                }
                Some((open, acc)) => {
                    cum += acc;
                    bids.push(LevelView {
                        price: open,
                        quantity: acc,
                        cumulative: cum,
                    });
                    if bids.len() == n {
                        current = None;
                        break;
                    }
                    current = Some((bucket, *qty));
                }
                None => current = Some((bucket, *qty)),
            }
        }
        if let Some((open, acc)) = current {
            cum += acc;
            bids.push(LevelView {
                price: open,
                quantity: acc,
                cumulative: cum,
            });
        }

        let mut asks = Vec::with_capacity(n);
        let mut cum = Decimal::ZERO;
        let mut current: Option<(Decimal, Decimal)> = None;
        for (price, qty) in self.asks.iter() {
            let bucket = (price / tick).ceil() * tick;
            match current {
                Some((open, acc)) if open == bucket => {
                    current = Some((open, acc + *qty));
                }
                Some((open, acc)) => {
                    cum += acc;
                    asks.push(LevelView {
                        price: open,
                        quantity: acc,
                        cumulative: cum,
                    });
                    if asks.len() == n {
                        current = None;
                        break;
                    }
                    current = Some((bucket, *qty));
                }
                None => current = Some((bucket, *qty)),
            }
        }
        if let Some((open, acc)) = current {
            cum += acc;
            asks.push(LevelView {
                price: open,
                quantity: acc,
                cumulative: cum,
            });
        }

        DepthView { bids, asks }
    }

    /// Sum of bid quantities at prices in `[lo, hi]`, inclusive. An
    /// inverted range is empty (a wide spread can push a band boundary
    /// past the touch).
    pub fn bid_qty_in_range(&self, lo: Decimal, hi: Decimal) -> Decimal {
        if lo > hi {
            return Decimal::ZERO;
        }
        self.bids.range(lo..=hi).map(|(_, q)| *q).sum()
    }

    /// Sum of ask quantities at prices in `[lo, hi]`, inclusive.
    pub fn ask_qty_in_range(&self, lo: Decimal, hi: Decimal) -> Decimal {
        if lo > hi {
            return Decimal::ZERO;
        }
        self.asks.range(lo..=hi).map(|(_, q)| *q).sum()
    }

    pub fn total_bid_qty(&self) -> Decimal {
        self.bids.values().copied().sum()
    }

    pub fn total_ask_qty(&self) -> Decimal {
        self.asks.values().copied().sum()
    }

    /// Statistics record for this book; `None` until both sides have
    /// at least one level.
    pub fn stats(&self) -> Option<crate::models::StatsRecord> {
        crate::stats::compute(self)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use crate::models::{DepthUpdate, PriceLevel, Snapshot, Venue};

    pub fn levels(raw: &[(&str, &str)]) -> Vec<PriceLevel> {
        raw.iter()
            .map(|(p, q)| PriceLevel::new(p.parse().unwrap(), q.parse().unwrap()))
            .collect()
    }

    pub fn snapshot(id: u64, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> Snapshot {
        Snapshot {
            venue: Venue::Binance,
            symbol: "BTCUSDT".to_string(),
            last_update_id: id,
            bids: levels(bids),
            asks: levels(asks),
            observed_at: Utc::now(),
        }
    }

    pub fn delta(
        first: u64,
        fin: u64,
        prev: u64,
        bids: &[(&str, &str)],
        asks: &[(&str, &str)],
    ) -> DepthUpdate {
        DepthUpdate {
            venue: Venue::Binance,
            symbol: "BTCUSDT".to_string(),
            event_time: Utc::now(),
            first_update_id: first,
            final_update_id: fin,
            prev_update_id: prev,
            bids: levels(bids),
            asks: levels(asks),
            is_snapshot: false,
        }
    }

    pub fn snapshot_update(id: u64, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> DepthUpdate {
        DepthUpdate {
            venue: Venue::Hyperliquid,
            symbol: "BTC".to_string(),
            event_time: Utc::now(),
            first_update_id: id,
            final_update_id: id,
            prev_update_id: 0,
            bids: levels(bids),
            asks: levels(asks),
            is_snapshot: true,
        }
    }

    pub fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }
}
