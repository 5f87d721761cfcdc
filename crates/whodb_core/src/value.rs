use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Native database value as seen by a driver before wire encoding.
///
/// Custom enum instead of `serde_json::Value` so drivers can encode each
/// native type losslessly into the canonical string representation that
/// `GetRowsResult` carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// JSON/JSONB kept as text for exact round-trip preservation.
    Json(String),
    /// Decimal kept as text to preserve exact precision.
    Decimal(String),
    /// Timestamp with timezone.
    DateTime(DateTime<Utc>),
    /// Date without time component.
    Date(NaiveDate),
    /// Time without date component.
    Time(NaiveTime),
    Array(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Canonical wire encoding carried in `GetRowsResult.rows`.
    ///
    /// SQL NULL is the empty string (nullability travels in the column
    /// metadata), binary is lowercase hex, temporals are ISO-8601, JSON is
    /// compacted, arrays fall back to a JSON-style list unless the driver
    /// overrides with an engine-native literal.
    pub fn to_wire_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => hex::encode(b),
            Value::Json(s) => compact_json(s),
            Value::Decimal(s) => s.clone(),
            Value::DateTime(dt) => dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Time(t) => t.format("%H:%M:%S%.f").to_string(),
            Value::Array(items) => {
                let encoded: Vec<String> = items.iter().map(|v| v.to_wire_string()).collect();
                format!("[{}]", encoded.join(","))
            }
        }
    }
}

fn compact_json(s: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(s) {
        Ok(v) => serde_json::to_string(&v).unwrap_or_else(|_| s.to_string()),
        Err(_) => s.to_string(),
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_wire_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn null_is_empty_string() {
        assert_eq!(Value::Null.to_wire_string(), "");
    }

    #[test]
    fn bytes_encode_as_hex() {
        assert_eq!(Value::Bytes(vec![0xde, 0xad]).to_wire_string(), "dead");
    }

    #[test]
    fn datetime_is_iso8601() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(Value::DateTime(dt).to_wire_string(), "2024-03-01T12:30:00Z");
    }

    #[test]
    fn json_is_compacted() {
        let v = Value::Json("{ \"a\" : 1 }".into());
        assert_eq!(v.to_wire_string(), "{\"a\":1}");
    }
}
