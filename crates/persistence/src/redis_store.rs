//! Redis quote mirror.
//!
//! Two keys per instrument: the raw symbol holds the latest quote JSON,
//! `history:<symbol>` is a sorted set scored by tick timestamp. Once a
//! history set reaches [`HISTORY_TRIM_THRESHOLD`] entries, scores older
//! than the retention window are dropped.

use chrono::Utc;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use common::QuoteSink;

use crate::error::Result;

/// Key prefix for per-instrument history sorted sets.
pub const HISTORY_KEY_PREFIX: &str = "history:";

/// History entries are trimmed only once a set grows past this size.
pub const HISTORY_TRIM_THRESHOLD: usize = 100_000;

/// Sliding history retention, milliseconds (48 hours).
pub const HISTORY_RETENTION_MS: i64 = 2 * 24 * 3600 * 1000;

/// Redis key holding the latest quote for a raw symbol.
pub fn latest_key(instrument_id: &str) -> String {
    instrument_id.to_string()
}

/// Redis key holding the history sorted set for a raw symbol.
pub fn history_key(instrument_id: &str) -> String {
    format!("{HISTORY_KEY_PREFIX}{instrument_id}")
}

/// Score cutoff below which history entries are expired.
pub fn expire_before(now_ms: i64) -> i64 {
    now_ms - HISTORY_RETENTION_MS
}

struct QuoteRecord {
    instrument_id: String,
    quote_json: String,
    timestamp_ms: i64,
}

/// Handle the tick path writes through. Cheap to clone; dropping every
/// handle shuts the writer task down.
#[derive(Clone)]
pub struct QuoteStore {
    tx: mpsc::UnboundedSender<QuoteRecord>,
}

impl QuoteStore {
    /// Open the Redis client and spawn the writer task on the current
    /// tokio runtime.
    pub fn spawn(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(client, rx));
        Ok(Self { tx })
    }
}

impl QuoteSink for QuoteStore {
    fn store(&self, instrument_id: &str, quote_json: &str, timestamp_ms: i64) {
        let record = QuoteRecord {
            instrument_id: instrument_id.to_string(),
            quote_json: quote_json.to_string(),
            timestamp_ms,
        };
        // Writer gone means shutdown is in progress; quotes just drop.
        let _ = self.tx.send(record);
    }
}

async fn writer_loop(client: redis::Client, mut rx: mpsc::UnboundedReceiver<QuoteRecord>) {
    let mut connection: Option<redis::aio::MultiplexedConnection> = None;

    while let Some(record) = rx.recv().await {
        if connection.is_none() {
            match client.get_multiplexed_async_connection().await {
                Ok(conn) => {
                    info!("connected to Redis quote store");
                    connection = Some(conn);
                }
                Err(e) => {
                    warn!("Redis unavailable, dropping quote for {}: {e}", record.instrument_id);
                    continue;
                }
            }
        }

        let Some(conn) = connection.as_mut() else {
            continue;
        };
        if let Err(e) = write_record(conn, &record).await {
            warn!(
                "failed to store quote for {}: {e}; reconnecting on next tick",
                record.instrument_id
            );
            connection = None;
        }
    }

    debug!("quote store writer stopped");
}

async fn write_record(
    conn: &mut redis::aio::MultiplexedConnection,
    record: &QuoteRecord,
) -> Result<()> {
    conn.set::<_, _, ()>(latest_key(&record.instrument_id), &record.quote_json)
        .await?;

    if record.timestamp_ms > 0 {
        let key = history_key(&record.instrument_id);
        conn.zadd::<_, _, _, ()>(&key, &record.quote_json, record.timestamp_ms)
            .await?;

        let history_size: usize = conn.zcard(&key).await?;
        if history_size >= HISTORY_TRIM_THRESHOLD {
            let cutoff = expire_before(Utc::now().timestamp_millis());
            conn.zrembyscore::<_, _, _, ()>(&key, 0, cutoff).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(latest_key("cu2501"), "cu2501");
        assert_eq!(history_key("cu2501"), "history:cu2501");
    }

    #[test]
    fn retention_window_is_48_hours() {
        let now = 1_700_000_000_000;
        assert_eq!(expire_before(now), now - 48 * 3600 * 1000);
    }
}
