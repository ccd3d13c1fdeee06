use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::{RowId, Side},
    error::ProtocolError,
};

/// A backend time value: epoch milliseconds or a textual timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(f64),
    Text(String),
}

impl Timestamp {
    /// Epoch milliseconds, or `None` when the value cannot be interpreted.
    pub fn millis(&self) -> Option<i64> {
        match self {
            Timestamp::Millis(value) if value.is_finite() => Some(*value as i64),
            Timestamp::Millis(_) => None,
            Timestamp::Text(text) => parse_timestamp_text(text).map(|t| t.timestamp_millis()),
        }
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        self.millis().and_then(DateTime::from_timestamp_millis)
    }

    fn is_blank(&self) -> bool {
        matches!(self, Timestamp::Text(text) if text.trim().is_empty())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Millis(value) if value.fract() == 0.0 && value.is_finite() => {
                write!(f, "{}", *value as i64)
            }
            Timestamp::Millis(value) => write!(f, "{value}"),
            Timestamp::Text(text) => f.write_str(text),
        }
    }
}

/// Accepts numeric strings, RFC 3339 and `YYYY-MM-DD HH:MM:SS[.fff]` (read as UTC).
pub fn parse_timestamp_text(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(value) = text.parse::<f64>() {
        return value
            .is_finite()
            .then(|| DateTime::from_timestamp_millis(value as i64))
            .flatten();
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawWagonTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<Timestamp>,
}

impl<'de> Deserialize<'de> for RawWagonTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut fields = WireFields::deserialize(deserializer)?;
        Ok(Self {
            time: fields.timestamp(&["time", "capturedAt", "captured_at"]),
        })
    }
}

/// One sequencing event for one lane, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub id: RowId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wagon_no: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub train_no: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_no_1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iso_code_1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_no_2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iso_code_2: Option<String>,
    #[serde(rename = "finalizedAt", skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<Timestamp>,
    #[serde(rename = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
    #[serde(rename = "rawWagonTime", skip_serializing_if = "Option::is_none")]
    pub raw_wagon_time: Option<RawWagonTime>,
}

impl Row {
    pub fn new(id: impl Into<RowId>) -> Self {
        Self {
            id: id.into(),
            wagon_no: None,
            train_no: None,
            side: None,
            container_no_1: None,
            iso_code_1: None,
            container_no_2: None,
            iso_code_2: None,
            finalized_at: None,
            time: None,
            created_at: None,
            raw_wagon_time: None,
        }
    }

    /// A row with a finalization timestamp is settled; otherwise it is tentative.
    pub fn is_final(&self) -> bool {
        self.finalized_at.is_some()
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut fields = WireFields::deserialize(deserializer)?;
        Ok(Self {
            id: fields.id::<D::Error>()?,
            wagon_no: fields.string(&["wagon_no", "wagonNumber"]),
            train_no: fields.string(&["train_no", "trainNumber"]),
            side: fields
                .take(&["side"])
                .as_ref()
                .and_then(Value::as_str)
                .and_then(|text| text.parse().ok()),
            container_no_1: fields.string(&["container_no_1", "containerNumber1"]),
            iso_code_1: fields.string(&["iso_code_1", "isoCode1"]),
            container_no_2: fields.string(&["container_no_2", "containerNumber2"]),
            iso_code_2: fields.string(&["iso_code_2", "isoCode2"]),
            finalized_at: fields.timestamp(&["finalizedAt", "finalized_at"]),
            time: fields.timestamp(&["time"]),
            created_at: fields.timestamp(&["createdAt", "created_at"]),
            raw_wagon_time: fields
                .take(&["rawWagonTime", "raw_wagon_time"])
                .filter(Value::is_object)
                .and_then(|value| serde_json::from_value(value).ok()),
        })
    }
}

/// A detected container not yet attached to a finalized row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingItem {
    pub id: RowId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_no: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
    #[serde(skip)]
    pub time: Option<DateTime<Utc>>,
}

impl<'de> Deserialize<'de> for PendingItem {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut fields = WireFields::deserialize(deserializer)?;
        Ok(Self {
            id: fields.id::<D::Error>()?,
            container_no: fields.string(&["container_no", "containerNumber", "container_number"]),
            // `ts` wins over `time` when both are sent.
            ts: fields.string(&["ts", "timestamp", "time"]),
            time: None,
        })
    }
}

/// Fields of one wire object. Lookups try the primary name before its
/// aliases, so an object carrying both still decodes.
struct WireFields(Map<String, Value>);

impl<'de> Deserialize<'de> for WireFields {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Map::deserialize(deserializer).map(WireFields)
    }
}

impl WireFields {
    fn take(&mut self, keys: &[&str]) -> Option<Value> {
        keys.iter()
            .find_map(|key| self.0.remove(*key).filter(|value| !value.is_null()))
    }

    fn id<E: de::Error>(&mut self) -> Result<RowId, E> {
        let value = self.take(&["id"]).ok_or_else(|| E::missing_field("id"))?;
        RowId::deserialize(value).map_err(E::custom)
    }

    fn string(&mut self, keys: &[&str]) -> Option<String> {
        match self.take(keys)? {
            Value::String(text) if !text.trim().is_empty() => Some(text),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn timestamp(&mut self, keys: &[&str]) -> Option<Timestamp> {
        match self.take(keys)? {
            Value::Number(n) => n.as_f64().map(Timestamp::Millis),
            Value::String(text) => Some(Timestamp::Text(text)).filter(|t| !t.is_blank()),
            _ => None,
        }
    }
}

/// Body of a lane fetch: `{ok, rows, pendingContainers, buffer}`.
#[derive(Debug, Clone, Default)]
pub struct LaneResponse {
    pub ok: Value,
    pub rows: Option<Value>,
    pub pending_containers: Option<Value>,
    pub buffer: Option<Value>,
}

impl<'de> Deserialize<'de> for LaneResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut fields = WireFields::deserialize(deserializer)?;
        Ok(Self {
            ok: fields.take(&["ok"]).unwrap_or_default(),
            rows: fields.take(&["rows"]),
            pending_containers: fields.take(&["pendingContainers", "pending_containers"]),
            buffer: fields.take(&["buffer"]),
        })
    }
}

/// Raw lane data from a usable response, not yet normalized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LanePayload {
    pub rows: Option<Value>,
    pub pending: Option<Value>,
    pub buffer: Option<Value>,
}

impl LaneResponse {
    pub fn from_slice(body: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(body)?;
        if !value.is_object() {
            return Err(ProtocolError::Malformed(
                "lane response is not a JSON object".to_string(),
            ));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn into_payload(self) -> Result<LanePayload, ProtocolError> {
        if !is_truthy(&self.ok) {
            return Err(ProtocolError::NotOk);
        }
        Ok(LanePayload {
            rows: self.rows,
            pending: self.pending_containers,
            buffer: self.buffer.filter(|buffer| !buffer.is_null()),
        })
    }
}

/// A named push-channel event with its optional payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFrame {
    pub event: String,
    pub payload: Option<Value>,
}

impl ChannelFrame {
    pub fn new(event: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Reads `["event", payload?]` or `{"event": .., "data": ..}`.
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Array(mut items) => {
                if items.is_empty() {
                    return None;
                }
                let payload = (items.len() > 1).then(|| items.swap_remove(1));
                let Value::String(event) = items.swap_remove(0) else {
                    return None;
                };
                Some(Self::new(event, payload))
            }
            Value::Object(mut map) => {
                let Some(Value::String(event)) = map.remove("event") else {
                    return None;
                };
                let payload = map.remove("data").or_else(|| map.remove("payload"));
                Some(Self::new(event, payload))
            }
            _ => None,
        }
    }
}

/// JSON truthiness: `null`, `false`, `0`, `NaN` and `""` are falsy.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
