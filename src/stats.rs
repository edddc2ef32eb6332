//! Statistics kernel: pure functions over an order book.
//!
//! Computes best bid/ask, mid, spread, banded liquidity at 0.5%, 2% and
//! 10% of mid, and side totals. When a venue publishes a shallow book the
//! wider bands saturate at the available depth; that is a property of the
//! source, not corrected here.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::book::OrderBook;
use crate::models::StatsRecord;

const BAND_05_PCT: Decimal = dec!(0.005);
const BAND_2_PCT: Decimal = dec!(0.02);
const BAND_10_PCT: Decimal = dec!(0.10);

/// Liquidity on both sides within `band` of the mid price.
fn band_liquidity(book: &OrderBook, mid: Decimal, band: Decimal) -> (Decimal, Decimal) {
    let best_bid = book.best_bid().unwrap_or(mid);
    let best_ask = book.best_ask().unwrap_or(mid);
    let bid_floor = mid * (Decimal::ONE - band);
    let ask_ceil = mid * (Decimal::ONE + band);
    let bid_qty = book.bid_qty_in_range(bid_floor, best_bid);
    let ask_qty = book.ask_qty_in_range(best_ask, ask_ceil);
    (bid_qty, ask_qty)
}

/// Computes the full statistics record. Returns `None` until both sides
/// of the book carry at least one level.
pub fn compute(book: &OrderBook) -> Option<StatsRecord> {
    let best_bid = book.best_bid()?;
    let best_ask = book.best_ask()?;
    let mid = (best_bid + best_ask) / dec!(2);
    let spread = best_ask - best_bid;

    let (bid_05, ask_05) = band_liquidity(book, mid, BAND_05_PCT);
    let (bid_2, ask_2) = band_liquidity(book, mid, BAND_2_PCT);
    let (bid_10, ask_10) = band_liquidity(book, mid, BAND_10_PCT);

    let total_bids = book.total_bid_qty();
    let total_asks = book.total_ask_qty();

    Some(StatsRecord {
        best_bid,
        best_ask,
        mid_price: mid,
        spread,
        bid_liquidity_05_pct: bid_05,
        ask_liquidity_05_pct: ask_05,
        delta_liquidity_05_pct: bid_05 - ask_05,
        bid_liquidity_2_pct: bid_2,
        ask_liquidity_2_pct: ask_2,
        delta_liquidity_2_pct: bid_2 - ask_2,
        bid_liquidity_10_pct: bid_10,
        ask_liquidity_10_pct: ask_10,
        delta_liquidity_10_pct: bid_10 - ask_10,
        total_bids_qty: total_bids,
        total_asks_qty: total_asks,
        total_delta: total_bids - total_asks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::test_support::snapshot;
    use crate::models::Venue;

    fn book_from(bids: &[(&str, &str)], asks: &[(&str, &str)]) -> OrderBook {
        let mut book = OrderBook::new(Venue::Binance, "BTCUSDT");
        book.load_snapshot(&snapshot(1, bids, asks));
        book
    }

    #[test]
    fn mid_and_spread_from_loaded_snapshot() {
        let book = book_from(&[("100", "2"), ("99", "1")], &[("101", "3"), ("102", "1")]);
        let stats = compute(&book).unwrap();
        assert_eq!(stats.best_bid, dec!(100));
        assert_eq!(stats.best_ask, dec!(101));
        assert_eq!(stats.mid_price, dec!(100.5));
        assert_eq!(stats.spread, dec!(1));
    }

    #[test]
    fn one_sided_book_has_no_stats() {
        let book = book_from(&[("100", "2")], &[]);
        assert!(compute(&book).is_none());
    }

    #[test]
    fn bands_pick_up_levels_within_percent_of_mid() {
        // Mid = 100, so the 0.5% band spans [99.5, best_bid] on bids and
        // [best_ask, 100.5] on asks.
        let book = book_from(
            &[("99.9", "1"), ("99.4", "10")],
            &[("100.1", "2"), ("100.7", "20")],
        );
        let stats = compute(&book).unwrap();
        assert_eq!(stats.mid_price, dec!(100));
        // 0.5% band reaches 99.5 / 100.5: only the touch levels qualify.
        assert_eq!(stats.bid_liquidity_05_pct, dec!(1));
        assert_eq!(stats.ask_liquidity_05_pct, dec!(2));
        assert_eq!(stats.delta_liquidity_05_pct, dec!(-1));
        // 2% band reaches 98 / 102: everything qualifies.
        assert_eq!(stats.bid_liquidity_2_pct, dec!(11));
        assert_eq!(stats.ask_liquidity_2_pct, dec!(22));
        assert_eq!(stats.total_delta, dec!(11) - dec!(22));
    }

    #[test]
    fn bands_are_monotone_in_width() {
        let book = book_from(
            &[("100", "1"), ("99", "2"), ("95", "4"), ("91", "8")],
            &[("101", "1"), ("102", "2"), ("106", "4"), ("110", "8")],
        );
        let stats = compute(&book).unwrap();
        assert!(stats.bid_liquidity_10_pct >= stats.bid_liquidity_2_pct);
        assert!(stats.bid_liquidity_2_pct >= stats.bid_liquidity_05_pct);
        assert!(stats.ask_liquidity_10_pct >= stats.ask_liquidity_2_pct);
        assert!(stats.ask_liquidity_2_pct >= stats.ask_liquidity_05_pct);
    }

    #[test]
    fn wide_spread_leaves_narrow_bands_empty() {
        // Mid 150; the 0.5% band ends well inside the spread, so neither
        // touch falls inside it.
        let book = book_from(&[("100", "1")], &[("200", "2")]);
        let stats = compute(&book).unwrap();
        assert_eq!(stats.bid_liquidity_05_pct, dec!(0));
        assert_eq!(stats.ask_liquidity_05_pct, dec!(0));
        assert_eq!(stats.bid_liquidity_10_pct, dec!(0));
        // The 10% band reaches 135..165 on neither side's touch either.
        assert_eq!(stats.total_bids_qty, dec!(1));
        assert_eq!(stats.total_asks_qty, dec!(2));
    }

    #[test]
    fn shallow_book_saturates_wider_bands() {
        let book = book_from(&[("100", "1"), ("99.8", "2")], &[("100.2", "3")]);
        let stats = compute(&book).unwrap();
        assert_eq!(stats.bid_liquidity_2_pct, stats.bid_liquidity_10_pct);
        assert_eq!(stats.bid_liquidity_10_pct, stats.total_bids_qty);
        assert_eq!(stats.ask_liquidity_10_pct, stats.total_asks_qty);
    }
}
