//! Turns raw lane payloads into ordered, deduplicated rows.
//!
//! Ordering key is the canonical timestamp, newest first. Sources are tried in
//! order: raw capture time, `time`, `finalizedAt`, `createdAt`, a numeric id,
//! and finally `0`, so every row gets a key.

use std::collections::HashSet;

use serde_json::Value;
use shared::protocol::{parse_timestamp_text, LanePayload, PendingItem, Row, Timestamp};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedLane {
    pub rows: Vec<Row>,
    pub pending: Vec<PendingItem>,
    pub buffer: Option<Value>,
}

pub fn canonical_timestamp(row: &Row) -> i64 {
    row.raw_wagon_time
        .as_ref()
        .and_then(|raw| raw.time.as_ref())
        .and_then(Timestamp::millis)
        .or_else(|| row.time.as_ref().and_then(Timestamp::millis))
        .or_else(|| row.finalized_at.as_ref().and_then(Timestamp::millis))
        .or_else(|| row.created_at.as_ref().and_then(Timestamp::millis))
        .or_else(|| row.id.as_number())
        .unwrap_or(0)
}

/// Stable descending sort that keeps the first (newest) row per id. Never touches `rows`.
pub fn sort_rows(rows: &[Row]) -> Vec<Row> {
    let mut keyed: Vec<(i64, &Row)> = rows
        .iter()
        .map(|row| (canonical_timestamp(row), row))
        .collect();
    keyed.sort_by(|a, b| b.0.cmp(&a.0));

    let mut seen = HashSet::with_capacity(keyed.len());
    keyed
        .into_iter()
        .filter(|(_, row)| seen.insert(&row.id))
        .map(|(_, row)| row.clone())
        .collect()
}

pub fn decode_rows(raw: Option<&Value>) -> Vec<Row> {
    let Some(Value::Array(items)) = raw else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<Row>(item.clone()) {
            Ok(row) => Some(row),
            Err(err) => {
                debug!(error = %err, "normalize: skipping undecodable row");
                None
            }
        })
        .collect()
}

pub fn decode_pending(raw: Option<&Value>) -> Vec<PendingItem> {
    let Some(Value::Array(items)) = raw else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<PendingItem>(item.clone()) {
            Ok(mut pending) => {
                pending.time = pending.ts.as_deref().and_then(parse_timestamp_text);
                Some(pending)
            }
            Err(err) => {
                debug!(error = %err, "normalize: skipping undecodable pending item");
                None
            }
        })
        .collect()
}

pub fn normalize(payload: &LanePayload) -> NormalizedLane {
    let rows = decode_rows(payload.rows.as_ref());
    NormalizedLane {
        rows: sort_rows(&rows),
        pending: decode_pending(payload.pending.as_ref()),
        buffer: payload.buffer.clone(),
    }
}

#[cfg(test)]
#[path = "tests/normalize_tests.rs"]
mod tests;
