use std::cmp::Ordering;

use serde_json::Value as JsonValue;

/// A JSON scalar with a total, type-aware ordering, used wherever the embedded
/// engine orders values: the `$match` range operators and the `$min`/`$max`
/// accumulators. Equality goes through [`json_eq`] instead.
///
/// Types order as null < boolean < number < date < string. Strings that look
/// like ISO-8601 dates are compared as millisecond timestamps, so
/// `"2024-01-15"` sorts before `"2024-01-15T10:30:00Z"`.
#[derive(Debug, Clone)]
pub enum OrderedValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    DateTime(i64), // millis since epoch
    String(String),
}

impl Eq for OrderedValue {}

impl PartialEq for OrderedValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for OrderedValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use OrderedValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,

            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Boolean(_), _) => Ordering::Less,
            (_, Boolean(_)) => Ordering::Greater,

            (Integer(a), Integer(b)) => a.cmp(b),
            (Integer(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Integer(b)) => a.total_cmp(&(*b as f64)),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Integer(_) | Float(_), _) => Ordering::Less,
            (_, Integer(_) | Float(_)) => Ordering::Greater,

            (DateTime(a), DateTime(b)) => a.cmp(b),
            (DateTime(_), _) => Ordering::Less,
            (_, DateTime(_)) => Ordering::Greater,

            (String(a), String(b)) => a.cmp(b),
        }
    }
}

impl OrderedValue {
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => OrderedValue::Null,
            JsonValue::Bool(b) => OrderedValue::Boolean(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    OrderedValue::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    OrderedValue::Float(f)
                } else {
                    OrderedValue::Null
                }
            }
            JsonValue::String(s) => Self::parse_string(s),
            other => OrderedValue::String(other.to_string()),
        }
    }

    fn parse_string(s: &str) -> Self {
        // Anything that does not start with YYYY-MM is not a date.
        let b = s.as_bytes();
        if b.len() < 10
            || !b[..4].iter().all(u8::is_ascii_digit)
            || b[4] != b'-'
            || !b[5..7].iter().all(u8::is_ascii_digit)
        {
            return OrderedValue::String(s.to_string());
        }

        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
            return OrderedValue::DateTime(dt.timestamp_millis());
        }
        for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
            if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, format) {
                return OrderedValue::DateTime(dt.and_utc().timestamp_millis());
            }
        }
        if let Some(dt) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
        {
            return OrderedValue::DateTime(dt.and_utc().timestamp_millis());
        }
        OrderedValue::String(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Equality
// ---------------------------------------------------------------------------

/// Document equality: numbers compare by value (`1` equals `1.0`), anything
/// else must match exactly. Strings are never read as dates here; that
/// coercion belongs to ordering only.
pub fn json_eq(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => match (x.as_u64(), y.as_u64()) {
                (Some(x), Some(y)) => x == y,
                _ => x.as_f64() == y.as_f64(),
            },
        },
        (JsonValue::Array(x), JsonValue::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_eq(a, b))
        }
        (JsonValue::Object(x), JsonValue::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(key, a)| y.get(key).is_some_and(|b| json_eq(a, b)))
        }
        _ => a == b,
    }
}

/// String form of `value` that is identical for any two values `json_eq`
/// considers equal. Used to bucket documents by group key.
pub fn canonical_key(value: &JsonValue) -> String {
    canonical(value).to_string()
}

fn canonical(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Number(n) if n.as_i64().is_none() && n.as_u64().is_none() => {
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                    JsonValue::from(f as i64)
                }
                _ => value.clone(),
            }
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(canonical).collect()),
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(key, v)| (key.clone(), canonical(v)))
                .collect(),
        ),
        _ => value.clone(),
    }
}
