use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

/// Typed facade over an account's opaque credential/extra bag.
///
/// The bag is stored as JSON text; keys differ per platform (access_token,
/// refresh_token, expires_at, api_key, project_id, …). The facade never
/// returns nil-valued state: a missing bag is the empty map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credentials(Map<String, Value>);

impl Credentials {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Parse from stored JSON. Anything that is not a JSON object (including
    /// parse errors) yields the empty-credential state.
    pub fn from_json(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Self(map),
            _ => Self::new(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&Value::Object(self.0.clone())).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// String value for `key`; empty string when missing or non-string.
    pub fn get_string(&self, key: &str) -> String {
        match self.0.get(key) {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        }
    }

    pub fn get_bool(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true" || s == "1",
            _ => false,
        }
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Instant stored under `key`. Accepts Unix-seconds strings ("1735689600"),
    /// RFC3339 strings, and raw JSON numbers.
    pub fn get_time(&self, key: &str) -> Option<DateTime<Utc>> {
        match self.0.get(key)? {
            Value::String(s) => {
                if let Ok(secs) = s.parse::<i64>() {
                    return Utc.timestamp_opt(secs, 0).single();
                }
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }
            Value::Number(n) => {
                let secs = n.as_i64()?;
                Utc.timestamp_opt(secs, 0).single()
            }
            _ => None,
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Store an instant as a Unix-seconds string — the canonical on-disk form
    /// written by the refresh path.
    pub fn set_time(&mut self, key: &str, at: DateTime<Utc>) {
        self.0
            .insert(key.to_string(), Value::String(at.timestamp().to_string()));
    }

    /// Merge `updates` into self: keys absent from `updates` are preserved,
    /// present keys overwrite.
    pub fn merge(&mut self, updates: &Credentials) {
        for (k, v) in &updates.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }
}
