//! Unit tests for signal and refresh models

use crate::fixtures::{at, signal, signal_with_score};
use signal_relay::models::{ChangeHint, Cursor, Signal};

#[test]
fn test_cursor_orders_by_timestamp_then_id() {
    let mut cursors = vec![
        Cursor::new(at(10), 1),
        Cursor::new(at(5), 9),
        Cursor::new(at(10), 0),
    ];
    cursors.sort();

    assert_eq!(
        cursors,
        vec![Cursor::new(at(5), 9), Cursor::new(at(10), 0), Cursor::new(at(10), 1)]
    );
}

#[test]
fn test_cursor_is_after_watermark() {
    let cursor = Cursor::new(at(10), 5);

    assert!(cursor.is_after(None));
    assert!(cursor.is_after(Some(Cursor::new(at(10), 4))));
    assert!(!cursor.is_after(Some(cursor)));
    assert!(!cursor.is_after(Some(Cursor::new(at(11), 0))));
}

#[test]
fn test_signal_keeps_enrichment_fields() {
    let json = serde_json::json!({
        "id": 42,
        "pair_symbol": "BTCUSDT",
        "recommended_action": "BUY",
        "score_week": 80.0,
        "score_month": 75.5,
        "timestamp": "2025-01-15T12:00:00Z",
        "created_at": "2025-01-15T12:00:01Z",
        "trading_pair_id": 7,
        "ema_filter": "above"
    });

    let parsed: Signal = serde_json::from_value(json).unwrap();
    assert_eq!(parsed.cursor(), Cursor::new(at(0), 42));
    assert_eq!(parsed.exchange_id, None);
    assert_eq!(parsed.enrichment.get("ema_filter").and_then(|v| v.as_str()), Some("above"));

    let back = serde_json::to_value(&parsed).unwrap();
    assert_eq!(back["ema_filter"], "above");
    assert!(back.get("exchange_id").is_none());
}

#[test]
fn test_change_hint_parsing() {
    let hint = ChangeHint::parse(r#"{"event":"INSERT","id":3,"pair_symbol":"ETHUSDT","timestamp":"2025-01-15 12:00:00"}"#)
        .unwrap()
        .expect("hint present");
    assert_eq!(hint.operation.as_deref(), Some("INSERT"));
    assert_eq!(hint.id, Some(3));
    assert_eq!(hint.timestamp.as_deref(), Some("2025-01-15 12:00:00"));

    assert_eq!(ChangeHint::parse("  ").unwrap(), None);
    assert!(ChangeHint::parse("{broken").is_err());
}

#[test]
fn test_non_finite_scores_are_zeroed_so_refetches_compare_equal() {
    let first = signal_with_score(4, at(0), f64::NAN).with_finite_scores();
    let again = signal_with_score(4, at(0), f64::NAN).with_finite_scores();
    assert_eq!(first, again);
    assert_eq!(first.score_week, 0.0);

    let mut infinite = signal(5, at(0));
    infinite.score_month = f64::INFINITY;
    assert_eq!(infinite.with_finite_scores().score_month, 0.0);

    let plain = signal(6, at(0));
    assert_eq!(plain.clone().with_finite_scores(), plain);
}
