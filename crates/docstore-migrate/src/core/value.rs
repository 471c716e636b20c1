//! Document and sort-key value types.
//!
//! Documents are opaque JSON objects. Only the sort field (and the optional
//! tie breaker) of a document is ever interpreted, through [`SortValue`].
//!
//! Values coming from MongoDB arrive as canonical extended JSON, so the
//! `$date`, `$oid`, `$numberInt`, `$numberLong` and `$numberDouble` wrappers
//! are understood when extracting sort keys.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An opaque document: an ordered map of field names to JSON values.
pub type Document = serde_json::Map<String, Value>;

/// A totally ordered sort-field value.
///
/// Values of different kinds order the way MongoDB orders BSON types:
/// `Null < numbers < strings < ObjectId < booleans < dates`. Integers and
/// floats compare numerically with each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawSortValue", into = "RawSortValue")]
pub enum SortValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    /// 24-character hex ObjectId.
    ObjectId(String),
    Bool(bool),
    Date(DateTime<Utc>),
}

impl SortValue {
    /// Position of the value's kind in the cross-kind order.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            SortValue::Null => 0,
            SortValue::Int(_) | SortValue::Float(_) => 1,
            SortValue::Text(_) => 2,
            SortValue::ObjectId(_) => 3,
            SortValue::Bool(_) => 4,
            SortValue::Date(_) => 5,
        }
    }

    /// Interpret a JSON value as a sort key.
    ///
    /// Returns `None` for arrays and objects that are not one of the
    /// recognised extended JSON wrappers.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(SortValue::Null),
            Value::Bool(b) => Some(SortValue::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(SortValue::Int(i)),
                None => n.as_f64().map(SortValue::Float),
            },
            Value::String(s) => Some(SortValue::Text(s.clone())),
            Value::Array(_) => None,
            Value::Object(map) => {
                if map.len() != 1 {
                    return None;
                }
                let (key, inner) = map.iter().next()?;
                match (key.as_str(), inner) {
                    ("$date", Value::String(s)) => parse_date(s).ok().map(SortValue::Date),
                    ("$date", Value::Object(_)) => {
                        let millis = match SortValue::from_json(inner)? {
                            SortValue::Int(ms) => ms,
                            _ => return None,
                        };
                        Utc.timestamp_millis_opt(millis).single().map(SortValue::Date)
                    }
                    ("$date", Value::Number(n)) => n
                        .as_i64()
                        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                        .map(SortValue::Date),
                    ("$oid", Value::String(s)) => Some(SortValue::ObjectId(s.to_lowercase())),
                    ("$numberInt" | "$numberLong", Value::String(s)) => {
                        s.parse::<i64>().ok().map(SortValue::Int)
                    }
                    ("$numberDouble", Value::String(s)) => {
                        s.parse::<f64>().ok().map(SortValue::Float)
                    }
                    _ => None,
                }
            }
        }
    }

    /// JSON representation, using extended JSON wrappers for dates and ObjectIds.
    pub fn to_json(&self) -> Value {
        match self {
            SortValue::Null => Value::Null,
            SortValue::Int(i) => Value::from(*i),
            SortValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            SortValue::Text(s) => Value::String(s.clone()),
            SortValue::ObjectId(oid) => {
                let mut map = serde_json::Map::new();
                map.insert("$oid".to_string(), Value::String(oid.clone()));
                Value::Object(map)
            }
            SortValue::Bool(b) => Value::Bool(*b),
            SortValue::Date(dt) => {
                let mut map = serde_json::Map::new();
                map.insert("$date".to_string(), Value::String(format_date(dt)));
                Value::Object(map)
            }
        }
    }
}

fn parse_date(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid date '{}': {}", s, e))
}

fn format_date(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Ord for SortValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use SortValue::*;
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b).unwrap_or_else(|| a.total_cmp(b)),
            (Int(a), Float(b)) => cmp_int_float(*a, *b),
            (Float(a), Int(b)) => cmp_int_float(*b, *a).reverse(),
            (Text(a), Text(b)) => a.cmp(b),
            (ObjectId(a), ObjectId(b)) => a.cmp(b),
            (Bool(a), Bool(b)) => a.cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (Null, Null) => Ordering::Equal,
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Exact comparison of an integer with a float, without rounding the
/// integer through `f64`. NaN sorts the way `f64::total_cmp` places it.
fn cmp_int_float(a: i64, b: f64) -> Ordering {
    // i64 spans [-2^63, 2^63)
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if b.is_nan() {
        return if b.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    if b >= LIMIT {
        return Ordering::Less;
    }
    if b < -LIMIT {
        return Ordering::Greater;
    }
    let whole = b.trunc();
    match a.cmp(&(whole as i64)) {
        Ordering::Equal if b > whole => Ordering::Less,
        Ordering::Equal if b < whole => Ordering::Greater,
        other => other,
    }
}

impl PartialOrd for SortValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SortValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortValue {}

impl fmt::Display for SortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortValue::Null => f.write_str("null"),
            SortValue::Int(i) => write!(f, "{}", i),
            SortValue::Float(v) => write!(f, "{}", v),
            SortValue::Text(s) => write!(f, "{:?}", s),
            SortValue::ObjectId(oid) => write!(f, "ObjectId({})", oid),
            SortValue::Bool(b) => write!(f, "{}", b),
            SortValue::Date(dt) => f.write_str(&format_date(dt)),
        }
    }
}

impl From<&str> for SortValue {
    fn from(s: &str) -> Self {
        SortValue::Text(s.to_string())
    }
}

impl From<String> for SortValue {
    fn from(s: String) -> Self {
        SortValue::Text(s)
    }
}

impl From<i64> for SortValue {
    fn from(i: i64) -> Self {
        SortValue::Int(i)
    }
}

impl From<DateTime<Utc>> for SortValue {
    fn from(dt: DateTime<Utc>) -> Self {
        SortValue::Date(dt)
    }
}

/// Serialized form shared by YAML configuration and checkpoint storage.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawSortValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date {
        #[serde(rename = "$date")]
        date: String,
    },
    ObjectId {
        #[serde(rename = "$oid")]
        oid: String,
    },
}

impl TryFrom<RawSortValue> for SortValue {
    type Error = String;

    fn try_from(raw: RawSortValue) -> std::result::Result<Self, Self::Error> {
        Ok(match raw {
            RawSortValue::Null => SortValue::Null,
            RawSortValue::Bool(b) => SortValue::Bool(b),
            RawSortValue::Int(i) => SortValue::Int(i),
            RawSortValue::Float(f) => SortValue::Float(f),
            RawSortValue::Text(s) => SortValue::Text(s),
            RawSortValue::Date { date } => SortValue::Date(parse_date(&date)?),
            RawSortValue::ObjectId { oid } => SortValue::ObjectId(oid.to_lowercase()),
        })
    }
}

impl From<SortValue> for RawSortValue {
    fn from(value: SortValue) -> Self {
        match value {
            SortValue::Null => RawSortValue::Null,
            SortValue::Bool(b) => RawSortValue::Bool(b),
            SortValue::Int(i) => RawSortValue::Int(i),
            SortValue::Float(f) => RawSortValue::Float(f),
            SortValue::Text(s) => RawSortValue::Text(s),
            SortValue::Date(dt) => RawSortValue::Date {
                date: format_date(&dt),
            },
            SortValue::ObjectId(oid) => RawSortValue::ObjectId { oid },
        }
    }
}

/// Fields used to order pages and detect progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    /// Primary sort field (dotted paths address nested fields).
    pub field: String,
    /// Optional secondary field making the key unique.
    pub tie_breaker: Option<String>,
}

impl SortSpec {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            tie_breaker: None,
        }
    }

    pub fn with_tie_breaker(mut self, field: impl Into<String>) -> Self {
        self.tie_breaker = Some(field.into());
        self
    }
}

/// Resume point for a collection: pages only contain documents whose key
/// is strictly below this boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Boundary {
    pub value: SortValue,
    /// Tie-breaker value; `None` compares on `value` alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiebreak: Option<SortValue>,
}

impl Boundary {
    pub fn new(value: SortValue) -> Self {
        Self {
            value,
            tiebreak: None,
        }
    }

    pub fn with_tiebreak(value: SortValue, tiebreak: SortValue) -> Self {
        Self {
            value,
            tiebreak: Some(tiebreak),
        }
    }

    /// Extract the sort key of a document.
    pub fn from_document(doc: &Document, sort: &SortSpec) -> std::result::Result<Self, String> {
        let value = extract_sort_value(doc, &sort.field)?;
        let tiebreak = match &sort.tie_breaker {
            Some(field) => Some(extract_sort_value(doc, field)?),
            None => None,
        };
        Ok(Self { value, tiebreak })
    }

    /// Whether a document key lies strictly below this boundary.
    ///
    /// When either side has no tie-breaker value only the primary values
    /// are compared.
    pub fn admits(&self, key: &Boundary) -> bool {
        match (&self.tiebreak, &key.tiebreak) {
            (Some(bound_tb), Some(key_tb)) => {
                (&key.value, key_tb) < (&self.value, bound_tb)
            }
            _ => key.value < self.value,
        }
    }
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tiebreak {
            Some(tb) => write!(f, "({}, {})", self.value, tb),
            None => write!(f, "{}", self.value),
        }
    }
}

/// Look up a (possibly dotted) field path in a document.
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn extract_sort_value(doc: &Document, field: &str) -> std::result::Result<SortValue, String> {
    let raw = lookup(doc, field).ok_or_else(|| format!("document has no field '{}'", field))?;
    SortValue::from_json(raw)
        .ok_or_else(|| format!("field '{}' holds an unsortable value: {}", field, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_cross_kind_ordering() {
        let mut values = vec![
            SortValue::Date(Utc.timestamp_millis_opt(0).unwrap()),
            SortValue::Bool(false),
            SortValue::Text("a".into()),
            SortValue::Float(1.5),
            SortValue::Null,
            SortValue::ObjectId("65a000000000000000000000".into()),
        ];
        values.sort();
        assert_eq!(values[0], SortValue::Null);
        assert_eq!(values[1], SortValue::Float(1.5));
        assert_eq!(values[2], SortValue::Text("a".into()));
        assert!(matches!(values[3], SortValue::ObjectId(_)));
        assert_eq!(values[4], SortValue::Bool(false));
        assert!(matches!(values[5], SortValue::Date(_)));
    }

    #[test]
    fn test_int_float_compare_numerically() {
        assert!(SortValue::Int(2) > SortValue::Float(1.5));
        assert_eq!(SortValue::Int(3), SortValue::Float(3.0));
        assert!(SortValue::Float(-0.5) < SortValue::Int(0));
    }

    #[test]
    fn test_int_float_exact_beyond_f64_precision() {
        let two_53 = 1_i64 << 53;
        assert!(SortValue::Int(two_53 + 1) > SortValue::Float(two_53 as f64));
        assert_eq!(SortValue::Int(two_53), SortValue::Float(two_53 as f64));
        assert_ne!(SortValue::Int(two_53 + 1), SortValue::Int(two_53));
        assert!(SortValue::Int(i64::MAX) < SortValue::Float(f64::INFINITY));
        assert!(SortValue::Int(i64::MIN) > SortValue::Float(f64::NEG_INFINITY));
        assert!(SortValue::Int(i64::MAX) < SortValue::Float(9.3e18));
        assert!(SortValue::Int(-3) < SortValue::Float(-2.5));
        assert!(SortValue::Int(-2) > SortValue::Float(-2.5));
    }

    #[test]
    fn test_signed_zero_and_nan() {
        assert_eq!(SortValue::Float(-0.0), SortValue::Float(0.0));
        assert_eq!(SortValue::Int(0), SortValue::Float(-0.0));
        assert!(SortValue::Float(f64::NAN) > SortValue::Int(i64::MAX));
        assert!(SortValue::Float(f64::NAN) > SortValue::Float(f64::INFINITY));
    }

    #[test]
    fn test_extended_json_dates() {
        let relaxed = SortValue::from_json(&json!({"$date": "2024-03-01T12:00:00Z"})).unwrap();
        let canonical =
            SortValue::from_json(&json!({"$date": {"$numberLong": "1709294400000"}})).unwrap();
        assert_eq!(relaxed, canonical);
    }

    #[test]
    fn test_extended_json_numbers_and_oid() {
        assert_eq!(
            SortValue::from_json(&json!({"$numberLong": "42"})),
            Some(SortValue::Int(42))
        );
        assert_eq!(
            SortValue::from_json(&json!({"$oid": "65A1B2C3D4E5F60718293A4B"})),
            Some(SortValue::ObjectId("65a1b2c3d4e5f60718293a4b".into()))
        );
        assert_eq!(SortValue::from_json(&json!([1, 2])), None);
        assert_eq!(SortValue::from_json(&json!({"a": 1, "b": 2})), None);
    }

    #[test]
    fn test_serde_representation() {
        let value: SortValue = serde_yaml::from_str("John").unwrap();
        assert_eq!(value, SortValue::Text("John".into()));

        let value: SortValue = serde_yaml::from_str("42").unwrap();
        assert!(matches!(value, SortValue::Int(42)));

        let value: SortValue = serde_yaml::from_str("{ \"$date\": \"2024-01-01T00:00:00Z\" }").unwrap();
        assert!(matches!(value, SortValue::Date(_)));

        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json, json!({"$date": "2024-01-01T00:00:00.000Z"}));
    }

    #[test]
    fn test_invalid_date_rejected() {
        let result: std::result::Result<SortValue, _> =
            serde_json::from_value(json!({"$date": "yesterday"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_boundary_from_nested_field() {
        let d = doc(json!({"meta": {"created": 7}, "_id": {"$oid": "65a000000000000000000001"}}));
        let sort = SortSpec::new("meta.created").with_tie_breaker("_id");
        let key = Boundary::from_document(&d, &sort).unwrap();
        assert_eq!(key.value, SortValue::Int(7));
        assert!(matches!(key.tiebreak, Some(SortValue::ObjectId(_))));
    }

    #[test]
    fn test_boundary_missing_field() {
        let d = doc(json!({"name": "Amy"}));
        let err = Boundary::from_document(&d, &SortSpec::new("created")).unwrap_err();
        assert!(err.contains("created"));
    }

    #[test]
    fn test_admits_strict_less_than() {
        let bound = Boundary::new("Dana".into());
        assert!(bound.admits(&Boundary::new("Carl".into())));
        assert!(!bound.admits(&Boundary::new("Dana".into())));
        assert!(!bound.admits(&Boundary::new("Eve".into())));
    }

    #[test]
    fn test_admits_with_tiebreak() {
        let bound = Boundary::with_tiebreak(SortValue::Int(5), SortValue::Int(10));
        assert!(bound.admits(&Boundary::with_tiebreak(SortValue::Int(5), SortValue::Int(9))));
        assert!(!bound.admits(&Boundary::with_tiebreak(SortValue::Int(5), SortValue::Int(10))));
        assert!(bound.admits(&Boundary::with_tiebreak(SortValue::Int(4), SortValue::Int(99))));
        assert!(!bound.admits(&Boundary::with_tiebreak(SortValue::Int(6), SortValue::Int(0))));
    }
}
