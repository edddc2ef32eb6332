//! End-to-end walks over the public book/sync/stats APIs: snapshot load,
//! delete semantics, best-side moves, snapshot replace, and the
//! out-of-band snapshot alignment walk.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use orderbook_aggregator::book::OrderBook;
use orderbook_aggregator::connectors::sync::{
    ContinuityRule, DeltaSequencer, SeqAction, SyncError,
};
use orderbook_aggregator::models::{DepthUpdate, PriceLevel, Snapshot, Venue};
use orderbook_aggregator::stats;

fn levels(raw: &[(&str, &str)]) -> Vec<PriceLevel> {
    raw.iter()
        .map(|(p, q)| PriceLevel::new(p.parse().unwrap(), q.parse().unwrap()))
        .collect()
}

fn snapshot(id: u64, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> Snapshot {
    Snapshot {
        venue: Venue::Binance,
        symbol: "BTCUSDT".to_string(),
        last_update_id: id,
        bids: levels(bids),
        asks: levels(asks),
        observed_at: Utc::now(),
    }
}

fn delta(first: u64, fin: u64, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> DepthUpdate {
    DepthUpdate {
        venue: Venue::Binance,
        symbol: "BTCUSDT".to_string(),
        event_time: Utc::now(),
        first_update_id: first,
        final_update_id: fin,
        prev_update_id: first.saturating_sub(1),
        bids: levels(bids),
        asks: levels(asks),
        is_snapshot: false,
    }
}

#[test]
fn snapshot_load_through_stats() {
    let mut book = OrderBook::new(Venue::Binance, "BTCUSDT");
    book.load_snapshot(&snapshot(
        1,
        &[("100", "2"), ("99", "1")],
        &[("101", "3"), ("102", "1")],
    ));

    let record = stats::compute(&book).unwrap();
    assert_eq!(record.best_bid, dec!(100));
    assert_eq!(record.best_ask, dec!(101));
    assert_eq!(record.mid_price, dec!(100.5));
    assert_eq!(record.spread, dec!(1));

    let view = book.top_n(1);
    assert_eq!(
        (view.bids[0].price, view.bids[0].quantity, view.bids[0].cumulative),
        (dec!(100), dec!(2), dec!(2))
    );
    assert_eq!(
        (view.asks[0].price, view.asks[0].quantity, view.asks[0].cumulative),
        (dec!(101), dec!(3), dec!(3))
    );
}

#[test]
fn delete_then_best_side_move() {
    let mut book = OrderBook::new(Venue::Binance, "BTCUSDT");
    book.load_snapshot(&snapshot(
        1,
        &[("100", "2"), ("99", "1")],
        &[("101", "3"), ("102", "1")],
    ));

    // Zero quantity removes 99; the touch is untouched.
    book.apply(&delta(2, 2, &[("99", "0")], &[]));
    assert_eq!(book.best_bid(), Some(dec!(100)));
    assert_eq!(book.bid_depth(), 1);

    // The ask side steps inward; the book must stay uncrossed.
    book.apply(&delta(3, 3, &[], &[("101", "0"), ("100.5", "4")]));
    assert_eq!(book.best_ask(), Some(dec!(100.5)));
    let record = stats::compute(&book).unwrap();
    assert_eq!(record.spread, dec!(0.5));
    assert!(record.best_bid < record.best_ask);
}

#[test]
fn snapshot_replace_clears_prior_levels() {
    let mut book = OrderBook::new(Venue::Hyperliquid, "BTC");
    book.load_snapshot(&snapshot(
        1,
        &[("100", "2"), ("99", "1")],
        &[("101", "3"), ("102", "1")],
    ));

    book.apply(&DepthUpdate {
        venue: Venue::Hyperliquid,
        symbol: "BTC".to_string(),
        event_time: Utc::now(),
        first_update_id: 9,
        final_update_id: 9,
        prev_update_id: 0,
        bids: levels(&[("50", "1")]),
        asks: levels(&[("60", "1")]),
        is_snapshot: true,
    });

    assert_eq!(book.bid_depth(), 1);
    assert_eq!(book.ask_depth(), 1);
    assert_eq!(book.best_bid(), Some(dec!(50)));
    assert_eq!(book.best_ask(), Some(dec!(60)));
    assert_eq!(book.last_update_id(), 9);
}

#[test]
fn out_of_band_sync_walkthrough() {
    // Snapshot at id 1000 with deltas buffered around it.
    let mut book = OrderBook::new(Venue::Binance, "BTCUSDT");
    let snap = snapshot(1000, &[("100", "2")], &[("101", "3")]);
    book.load_snapshot(&snap);

    let buffered = vec![
        delta(998, 998, &[("98", "1")], &[]),
        delta(999, 999, &[("97", "1")], &[]),
        delta(999, 1000, &[("96", "1")], &[]),
        delta(1000, 1001, &[("99", "5")], &[]),
        delta(1002, 1002, &[], &[("102", "7")]),
    ];

    let mut sequencer = DeltaSequencer::after_snapshot(ContinuityRule::FirstFollowsFinal, 1000);
    let aligned = sequencer.align(buffered).unwrap();
    let finals: Vec<u64> = aligned.iter().map(|d| d.final_update_id).collect();
    assert_eq!(finals, vec![1001, 1002]);

    for update in &aligned {
        book.apply(update);
    }
    // Stale deltas never touched the book: 96/97/98 are absent.
    assert_eq!(book.bid_depth(), 2);
    assert_eq!(book.best_bid(), Some(dec!(100)));
    assert_eq!(book.ask_depth(), 2);
    assert_eq!(book.last_update_id(), 1002);

    // A jump past the chain forces a resync.
    let err = sequencer.check(&delta(1004, 1004, &[], &[])).unwrap_err();
    assert!(matches!(err, SyncError::Gap { last_final: 1002, .. }));

    // The contiguous successor is accepted.
    let mut sequencer = DeltaSequencer::after_snapshot(ContinuityRule::FirstFollowsFinal, 1000);
    sequencer.align(vec![delta(1000, 1001, &[], &[])]).unwrap();
    assert_eq!(
        sequencer.check(&delta(1002, 1003, &[], &[])).unwrap(),
        SeqAction::Apply
    );
}

#[test]
fn top_n_prefix_law_holds_under_aggregation() {
    let mut book = OrderBook::new(Venue::Binance, "BTCUSDT");
    book.load_snapshot(&snapshot(
        1,
        &[("100.9", "1"), ("100.4", "2"), ("99.8", "3"), ("99.1", "4")],
        &[("101.1", "1"), ("101.6", "2"), ("102.2", "4"), ("103.9", "8")],
    ));

    for n in 1..4 {
        let smaller = book.top_n(n);
        let larger = book.top_n(n + 1);
        assert_eq!(smaller.bids[..], larger.bids[..n]);
        assert_eq!(smaller.asks[..], larger.asks[..n]);

        let agg_smaller = book.aggregate_by_tick(dec!(1), n);
        let agg_larger = book.aggregate_by_tick(dec!(1), n + 1);
        let len = agg_smaller.bids.len().min(agg_larger.bids.len());
        assert_eq!(agg_smaller.bids[..len], agg_larger.bids[..len]);
    }

    // Aggregated quantity equals raw quantity over the full depth.
    let raw = book.top_n(100);
    let agg = book.aggregate_by_tick(dec!(1), 100);
    let raw_total: Decimal = raw.bids.iter().map(|l| l.quantity).sum();
    let agg_total: Decimal = agg.bids.iter().map(|l| l.quantity).sum();
    assert_eq!(raw_total, agg_total);
}
