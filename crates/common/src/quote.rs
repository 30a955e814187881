//! Depth tick records and their translation to the wire quote object.
//!
//! The downstream protocol delivers quotes as flat JSON objects with a
//! fixed key order; that order is part of the contract, so the builder
//! inserts into an order-preserving map. Fronts deliver five depth levels;
//! levels 6..10 are always emitted as null.

use chrono::{Local, NaiveDate, NaiveTime, TimeZone, Utc};
use serde_json::{json, Map, Value};

/// Depth levels delivered by the upstream fronts.
pub const DEPTH_LEVELS: usize = 5;

/// One depth tick, as handed over by the driver SPI.
///
/// Missing numeric fields arrive as out-of-range sentinels (zero or huge
/// doubles) and are filtered by [`is_valid_price`].
#[derive(Debug, Clone, Default)]
pub struct DepthMarketData {
    pub instrument_id: String,
    /// `YYYYMMDD`.
    pub trading_day: String,
    /// `HH:MM:SS`.
    pub update_time: String,
    pub update_millisec: i32,
    pub last_price: f64,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub open_price: f64,
    pub close_price: f64,
    pub settlement_price: f64,
    pub upper_limit_price: f64,
    pub lower_limit_price: f64,
    pub pre_settlement_price: f64,
    pub pre_close_price: f64,
    pub pre_open_interest: f64,
    pub open_interest: f64,
    pub volume: i64,
    pub turnover: f64,
    pub bid_prices: [f64; DEPTH_LEVELS],
    pub bid_volumes: [i64; DEPTH_LEVELS],
    pub ask_prices: [f64; DEPTH_LEVELS],
    pub ask_volumes: [i64; DEPTH_LEVELS],
}

/// A price is usable iff `1e-6 < v < 1e300`; zero and DBL_MAX-style
/// sentinels fall outside that interval.
pub fn is_valid_price(v: f64) -> bool {
    v > 1e-6 && v < 1e300
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn price_or_null(v: f64) -> Value {
    if is_valid_price(v) {
        json!(round2(v))
    } else {
        Value::Null
    }
}

fn price_or_dash(v: f64) -> Value {
    if is_valid_price(v) {
        json!(round2(v))
    } else {
        json!("-")
    }
}

/// `YYYY-MM-DD HH:MM:SS.fffff` — the five-digit fraction is
/// `update_millisec * 100`. Short or malformed date strings are passed
/// through untouched rather than sliced out of range.
fn format_datetime(md: &DepthMarketData) -> String {
    let update_time = if md.update_time.is_empty() {
        "00:00:00"
    } else {
        md.update_time.as_str()
    };

    let date_part = match (
        md.trading_day.get(0..4),
        md.trading_day.get(4..6),
        md.trading_day.get(6..8),
    ) {
        (Some(y), Some(m), Some(d)) => format!("{y}-{m}-{d}"),
        _ => md.trading_day.clone(),
    };

    format!("{} {}.{:05}", date_part, update_time, md.update_millisec * 100)
}

fn parse_tick_timestamp(md: &DepthMarketData) -> Option<i64> {
    if md.trading_day.len() < 8 || md.update_time.len() < 8 {
        return None;
    }
    let date = NaiveDate::parse_from_str(&md.trading_day, "%Y%m%d").ok()?;
    let time = NaiveTime::parse_from_str(&md.update_time, "%H:%M:%S").ok()?;
    let local = Local.from_local_datetime(&date.and_time(time)).single()?;
    Some(local.timestamp_millis() + i64::from(md.update_millisec))
}

/// Millisecond timestamp of a tick, falling back to wall clock when the
/// upstream date fields are malformed.
pub fn tick_timestamp_ms(md: &DepthMarketData) -> i64 {
    parse_tick_timestamp(md).unwrap_or_else(|| Utc::now().timestamp_millis())
}

/// Translate a depth tick into the wire quote object, returning the quote
/// and the tick's millisecond timestamp (used as the history score).
///
/// `display_instrument` is the exchange-prefixed symbol clients subscribed
/// with; the raw symbol stays upstream-only.
pub fn build_quote(md: &DepthMarketData, display_instrument: &str) -> (Value, i64) {
    let mut q = Map::new();

    q.insert("instrument_id".into(), json!(display_instrument));
    q.insert("datetime".into(), json!(format_datetime(md)));

    for level in (DEPTH_LEVELS + 1..=10).rev() {
        q.insert(format!("ask_price{level}"), Value::Null);
        q.insert(format!("ask_volume{level}"), Value::Null);
    }
    for level in (1..=DEPTH_LEVELS).rev() {
        let idx = level - 1;
        if is_valid_price(md.ask_prices[idx]) {
            q.insert(format!("ask_price{level}"), json!(round2(md.ask_prices[idx])));
            q.insert(format!("ask_volume{level}"), json!(md.ask_volumes[idx]));
        } else {
            q.insert(format!("ask_price{level}"), Value::Null);
            q.insert(format!("ask_volume{level}"), Value::Null);
        }
    }

    for level in 1..=DEPTH_LEVELS {
        let idx = level - 1;
        if is_valid_price(md.bid_prices[idx]) {
            q.insert(format!("bid_price{level}"), json!(round2(md.bid_prices[idx])));
            q.insert(format!("bid_volume{level}"), json!(md.bid_volumes[idx]));
        } else {
            q.insert(format!("bid_price{level}"), Value::Null);
            q.insert(format!("bid_volume{level}"), Value::Null);
        }
    }
    for level in DEPTH_LEVELS + 1..=10 {
        q.insert(format!("bid_price{level}"), Value::Null);
        q.insert(format!("bid_volume{level}"), Value::Null);
    }

    q.insert("last_price".into(), price_or_null(md.last_price));
    q.insert("highest".into(), price_or_null(md.highest_price));
    q.insert("lowest".into(), price_or_null(md.lowest_price));
    q.insert("open".into(), price_or_null(md.open_price));
    q.insert("close".into(), price_or_dash(md.close_price));
    q.insert("average".into(), Value::Null);
    q.insert("volume".into(), json!(md.volume));
    q.insert("amount".into(), json!(md.turnover));
    q.insert("open_interest".into(), json!(md.open_interest as i64));
    q.insert("settlement".into(), price_or_dash(md.settlement_price));
    q.insert("upper_limit".into(), price_or_null(md.upper_limit_price));
    q.insert("lower_limit".into(), price_or_null(md.lower_limit_price));
    q.insert("pre_open_interest".into(), json!(md.pre_open_interest as i64));
    q.insert("pre_settlement".into(), price_or_null(md.pre_settlement_price));
    q.insert("pre_close".into(), price_or_null(md.pre_close_price));

    let ts = tick_timestamp_ms(md);
    (Value::Object(q), ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tick() -> DepthMarketData {
        DepthMarketData {
            instrument_id: "cu2501".to_string(),
            trading_day: "20250115".to_string(),
            update_time: "09:30:00".to_string(),
            update_millisec: 500,
            last_price: 71229.996,
            highest_price: 71500.0,
            lowest_price: 71000.0,
            open_price: 71100.0,
            close_price: 0.0,
            settlement_price: 0.0,
            upper_limit_price: 78000.0,
            lower_limit_price: 64000.0,
            pre_settlement_price: 71050.0,
            pre_close_price: 71020.0,
            pre_open_interest: 12345.0,
            open_interest: 12400.9,
            volume: 10,
            turnover: 3561499.8,
            bid_prices: [71229.0, 71228.0, 0.0, 0.0, 0.0],
            bid_volumes: [3, 7, 0, 0, 0],
            ask_prices: [71231.0, 71232.0, 0.0, 0.0, 0.0],
            ask_volumes: [2, 5, 0, 0, 0],
        }
    }

    #[test]
    fn price_validity_bounds() {
        assert!(!is_valid_price(0.0));
        assert!(!is_valid_price(1e-7));
        assert!(!is_valid_price(1e300));
        assert!(!is_valid_price(f64::MAX));
        assert!(is_valid_price(0.01));
        assert!(is_valid_price(71230.0));
    }

    #[test]
    fn quote_key_order_is_fixed() {
        let (quote, _) = build_quote(&sample_tick(), "SHFE.cu2501");
        let keys: Vec<&str> = quote.as_object().unwrap().keys().map(|k| k.as_str()).collect();

        assert_eq!(keys[0], "instrument_id");
        assert_eq!(keys[1], "datetime");
        assert_eq!(keys[2], "ask_price10");
        assert_eq!(keys[3], "ask_volume10");
        // Ask side runs high to low, then bids low to high.
        assert_eq!(keys[20], "ask_price1");
        assert_eq!(keys[21], "ask_volume1");
        assert_eq!(keys[22], "bid_price1");
        assert_eq!(keys[40], "bid_price10");
        assert_eq!(keys[42], "last_price");
        assert_eq!(*keys.last().unwrap(), "pre_close");
        assert_eq!(keys.len(), 57);
    }

    #[test]
    fn depth_levels_past_five_are_null() {
        let (quote, _) = build_quote(&sample_tick(), "SHFE.cu2501");
        for level in 6..=10 {
            assert!(quote[&format!("ask_price{level}")].is_null());
            assert!(quote[&format!("ask_volume{level}")].is_null());
            assert!(quote[&format!("bid_price{level}")].is_null());
            assert!(quote[&format!("bid_volume{level}")].is_null());
        }
    }

    #[test]
    fn invalid_levels_emit_null_pairs() {
        let (quote, _) = build_quote(&sample_tick(), "SHFE.cu2501");
        assert!(quote["ask_price3"].is_null());
        assert!(quote["ask_volume3"].is_null());
        assert_eq!(quote["ask_price1"], json!(71231.0));
        assert_eq!(quote["ask_volume1"], json!(2));
        assert_eq!(quote["bid_price2"], json!(71228.0));
        assert_eq!(quote["bid_volume2"], json!(7));
    }

    #[test]
    fn prices_round_to_two_decimals() {
        let (quote, _) = build_quote(&sample_tick(), "SHFE.cu2501");
        assert_eq!(quote["last_price"], json!(71230.0));
    }

    #[test]
    fn missing_close_and_settlement_are_dashes() {
        let (quote, _) = build_quote(&sample_tick(), "SHFE.cu2501");
        assert_eq!(quote["close"], json!("-"));
        assert_eq!(quote["settlement"], json!("-"));
        // Other missing prices are plain nulls.
        assert!(quote["average"].is_null());
    }

    #[test]
    fn interest_fields_are_integers() {
        let (quote, _) = build_quote(&sample_tick(), "SHFE.cu2501");
        assert_eq!(quote["open_interest"], json!(12400));
        assert_eq!(quote["pre_open_interest"], json!(12345));
        assert_eq!(quote["volume"], json!(10));
    }

    #[test]
    fn datetime_uses_five_digit_fraction() {
        let (quote, _) = build_quote(&sample_tick(), "SHFE.cu2501");
        assert_eq!(quote["datetime"], json!("2025-01-15 09:30:00.50000"));

        let mut md = sample_tick();
        md.update_millisec = 0;
        let (quote, _) = build_quote(&md, "SHFE.cu2501");
        assert_eq!(quote["datetime"], json!("2025-01-15 09:30:00.00000"));
    }

    #[test]
    fn short_trading_day_passes_through() {
        let mut md = sample_tick();
        md.trading_day = "2025".to_string();
        let (quote, _) = build_quote(&md, "SHFE.cu2501");
        assert_eq!(quote["datetime"], json!("2025 09:30:00.50000"));
    }

    #[test]
    fn malformed_fields_fall_back_to_wall_clock() {
        let mut md = sample_tick();
        md.trading_day = "bad".to_string();
        let before = Utc::now().timestamp_millis();
        let ts = tick_timestamp_ms(&md);
        let after = Utc::now().timestamp_millis();
        assert!(ts >= before && ts <= after);
    }

    #[test]
    fn display_form_lands_in_instrument_id() {
        let (quote, _) = build_quote(&sample_tick(), "SHFE.cu2501");
        assert_eq!(quote["instrument_id"], json!("SHFE.cu2501"));
    }
}
