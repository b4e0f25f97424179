use std::cmp::Ordering;
use std::ops::{Bound, RangeBounds};

use crate::{Error, Result};

/// A stored row, exactly as the engine persists it.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// The comparable domain for primary keys, index entries and filter
/// comparison. JSON objects have no place in the key order and do not
/// convert.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Text(_) => 3,
            Value::Bytes(_) => 4,
            Value::Array(_) => 5,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Value> {
        match value {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Float(f))
                } else {
                    Err(Error::InvalidKey(n.to_string()))
                }
            }
            serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
            serde_json::Value::Array(items) => Ok(Value::Array(
                items.iter().map(Value::from_json).collect::<Result<_>>()?,
            )),
            serde_json::Value::Object(_) => {
                Err(Error::InvalidKey("objects are not comparable".to_string()))
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::from(b.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Int(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Int(b)) => a.total_cmp(&(*b as f64)),
            (Text(a), Text(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Array(a), Array(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

macro_rules! value_from_int {
    ($($ty:ty),+) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::Int(v as i64)
            }
        })+
    };
}

value_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Float(v as f64),
        }
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

/// A primary key: one component per declared key field, compared
/// component-wise in declaration order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Key(pub Vec<Value>);

impl Key {
    pub fn single(value: impl Into<Value>) -> Self {
        Key(vec![value.into()])
    }

    pub fn components(&self) -> &[Value] {
        &self.0
    }
}

impl From<Value> for Key {
    fn from(v: Value) -> Self {
        Key(vec![v])
    }
}

impl From<Vec<Value>> for Key {
    fn from(v: Vec<Value>) -> Self {
        Key(v)
    }
}

macro_rules! key_from_scalar {
    ($($ty:ty),+) => {
        $(impl From<$ty> for Key {
            fn from(v: $ty) -> Self {
                Key(vec![Value::from(v)])
            }
        })+
    };
}

key_from_scalar!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, bool, &str, String);

impl<A: Into<Value>, B: Into<Value>> From<(A, B)> for Key {
    fn from((a, b): (A, B)) -> Self {
        Key(vec![a.into(), b.into()])
    }
}

impl<A: Into<Value>, B: Into<Value>, C: Into<Value>> From<(A, B, C)> for Key {
    fn from((a, b, c): (A, B, C)) -> Self {
        Key(vec![a.into(), b.into(), c.into()])
    }
}

/// A bounded key interval, usable directly with ordered-map range scans.
#[derive(Clone, Debug)]
pub struct KeyRange {
    pub lower: Bound<Key>,
    pub upper: Bound<Key>,
}

impl KeyRange {
    pub fn all() -> Self {
        KeyRange {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    pub fn only(key: Key) -> Self {
        KeyRange {
            lower: Bound::Included(key.clone()),
            upper: Bound::Included(key),
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        let lower_ok = match &self.lower {
            Bound::Unbounded => true,
            Bound::Included(b) => key >= b,
            Bound::Excluded(b) => key > b,
        };
        let upper_ok = match &self.upper {
            Bound::Unbounded => true,
            Bound::Included(b) => key <= b,
            Bound::Excluded(b) => key < b,
        };
        lower_ok && upper_ok
    }

    /// An interval whose lower bound exceeds its upper matches nothing;
    /// ordered maps reject such ranges outright, so scans check first.
    pub fn is_empty(&self) -> bool {
        let (lower, upper) = match (&self.lower, &self.upper) {
            (Bound::Included(a) | Bound::Excluded(a), Bound::Included(b) | Bound::Excluded(b)) => {
                (a, b)
            }
            _ => return false,
        };
        match lower.cmp(upper) {
            Ordering::Greater => true,
            Ordering::Equal => {
                matches!(&self.lower, Bound::Excluded(_)) || matches!(&self.upper, Bound::Excluded(_))
            }
            Ordering::Less => false,
        }
    }
}

impl RangeBounds<Key> for KeyRange {
    fn start_bound(&self) -> Bound<&Key> {
        self.lower.as_ref()
    }

    fn end_bound(&self) -> Bound<&Key> {
        self.upper.as_ref()
    }
}

/// Pull the declared key components out of a row.
pub(crate) fn extract_key(key_fields: &[String], row: &Row) -> Result<Key> {
    let mut components = Vec::with_capacity(key_fields.len());
    for field in key_fields {
        let value = match row.get(field) {
            Some(v) if !v.is_null() => Value::from_json(v)?,
            _ => {
                return Err(Error::InvalidKey(format!(
                    "key field `{field}` is missing from the row"
                )));
            }
        };
        components.push(value);
    }
    Ok(Key(components))
}

/// Serialized records and update patches must be JSON objects.
pub(crate) fn to_object(value: serde_json::Value) -> Result<Row> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(Error::Validation(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_type_order_is_total() {
        let sorted = vec![
            Value::Null,
            Value::Bool(false),
            Value::Bool(true),
            Value::Int(-3),
            Value::Float(2.5),
            Value::Int(7),
            Value::Text("a".into()),
            Value::Bytes(vec![0]),
            Value::Array(vec![Value::Int(1)]),
        ];
        let mut shuffled = sorted.clone();
        shuffled.reverse();
        shuffled.sort();
        assert_eq!(shuffled, sorted);
    }

    #[test]
    fn ints_and_floats_compare_numerically() {
        assert_eq!(Value::Int(25), Value::Float(25.0));
        assert!(Value::Int(2) < Value::Float(2.5));
        assert!(Value::Float(3.5) > Value::Int(3));
    }

    #[test]
    fn composite_keys_compare_component_wise() {
        let a = Key::from((1, "a"));
        let b = Key::from((1, "b"));
        let c = Key::from((2, "a"));
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn key_range_contains_honours_bounds() {
        let range = KeyRange {
            lower: Bound::Excluded(Key::from(1)),
            upper: Bound::Included(Key::from(5)),
        };
        assert!(!range.contains(&Key::from(1)));
        assert!(range.contains(&Key::from(2)));
        assert!(range.contains(&Key::from(5)));
        assert!(!range.contains(&Key::from(6)));
    }

    #[test]
    fn inverted_range_is_empty() {
        let range = KeyRange {
            lower: Bound::Included(Key::from(9)),
            upper: Bound::Included(Key::from(1)),
        };
        assert!(range.is_empty());
        assert!(!KeyRange::all().is_empty());
    }

    #[test]
    fn extract_key_requires_every_component() {
        let mut row = Row::new();
        row.insert("a".into(), serde_json::json!(1));
        let err = extract_key(&["a".into(), "b".into()], &row).unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
    }
}
