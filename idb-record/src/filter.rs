use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use crate::value::{Key, KeyRange, Value};

/// A bounded comparison over one field. The same bounds serve as a
/// native index range (`key_range`) and as an in-memory predicate
/// (`fits`), so a filter that cannot be pushed into a cursor bound
/// still evaluates identically.
#[derive(Clone, Debug, PartialEq)]
pub struct Between {
    lower: Option<Value>,
    upper: Option<Value>,
    lower_open: bool,
    upper_open: bool,
}

impl Between {
    /// Closed interval: `lower <= v <= upper`.
    pub fn new(lower: impl Into<Value>, upper: impl Into<Value>) -> Self {
        Between {
            lower: Some(lower.into()),
            upper: Some(upper.into()),
            lower_open: false,
            upper_open: false,
        }
    }

    /// An unset bound matches unboundedly on that side. An interval
    /// whose lower bound exceeds its upper matches nothing.
    pub fn with_bounds(
        lower: Option<Value>,
        upper: Option<Value>,
        lower_open: bool,
        upper_open: bool,
    ) -> Self {
        Between {
            lower,
            upper,
            lower_open,
            upper_open,
        }
    }

    pub fn at_least(lower: impl Into<Value>) -> Self {
        Between::with_bounds(Some(lower.into()), None, false, false)
    }

    pub fn above(lower: impl Into<Value>) -> Self {
        Between::with_bounds(Some(lower.into()), None, true, false)
    }

    pub fn at_most(upper: impl Into<Value>) -> Self {
        Between::with_bounds(None, Some(upper.into()), false, false)
    }

    pub fn below(upper: impl Into<Value>) -> Self {
        Between::with_bounds(None, Some(upper.into()), false, true)
    }

    pub fn exclude_lower(mut self) -> Self {
        self.lower_open = true;
        self
    }

    pub fn exclude_upper(mut self) -> Self {
        self.upper_open = true;
        self
    }

    pub fn fits(&self, value: &Value) -> bool {
        if let Some(lower) = &self.lower {
            match value.cmp(lower) {
                Ordering::Less => return false,
                Ordering::Equal if self.lower_open => return false,
                _ => {}
            }
        }
        if let Some(upper) = &self.upper {
            match value.cmp(upper) {
                Ordering::Greater => return false,
                Ordering::Equal if self.upper_open => return false,
                _ => {}
            }
        }
        true
    }

    /// The native range descriptor over a single-field index.
    pub fn key_range(&self) -> KeyRange {
        let lower = match &self.lower {
            None => Bound::Unbounded,
            Some(v) if self.lower_open => Bound::Excluded(Key::from(v.clone())),
            Some(v) => Bound::Included(Key::from(v.clone())),
        };
        let upper = match &self.upper {
            None => Bound::Unbounded,
            Some(v) if self.upper_open => Bound::Excluded(Key::from(v.clone())),
            Some(v) => Bound::Included(Key::from(v.clone())),
        };
        KeyRange { lower, upper }
    }
}

/// One entry in a query's filter map: an exact value, a range, or an
/// arbitrary predicate over the raw field JSON.
#[derive(Clone)]
pub enum Filter {
    Value(Value),
    Range(Between),
    Test(Arc<dyn Fn(&serde_json::Value) -> bool + Send + Sync>),
}

impl Filter {
    pub fn test(f: impl Fn(&serde_json::Value) -> bool + Send + Sync + 'static) -> Self {
        Filter::Test(Arc::new(f))
    }

    pub(crate) fn matches(&self, field: &serde_json::Value) -> bool {
        match self {
            Filter::Value(want) => Value::from_json(field).is_ok_and(|got| got == *want),
            Filter::Range(between) => Value::from_json(field).is_ok_and(|got| between.fits(&got)),
            Filter::Test(f) => f(field),
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Filter::Range(b) => f.debug_tuple("Range").field(b).finish(),
            Filter::Test(_) => f.write_str("Test(..)"),
        }
    }
}

impl From<Between> for Filter {
    fn from(b: Between) -> Self {
        Filter::Range(b)
    }
}

impl From<Value> for Filter {
    fn from(v: Value) -> Self {
        Filter::Value(v)
    }
}

macro_rules! filter_from_scalar {
    ($($ty:ty),+) => {
        $(impl From<$ty> for Filter {
            fn from(v: $ty) -> Self {
                Filter::Value(Value::from(v))
            }
        })+
    };
}

filter_from_scalar!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, bool, &str, String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_bounds_include_endpoints() {
        let between = Between::new(2, 5);
        assert!(!between.fits(&Value::Int(1)));
        assert!(between.fits(&Value::Int(2)));
        assert!(between.fits(&Value::Int(5)));
        assert!(!between.fits(&Value::Int(6)));
    }

    #[test]
    fn open_flags_exclude_endpoints() {
        let between = Between::new(2, 5).exclude_lower();
        assert!(!between.fits(&Value::Int(2)));
        assert!(between.fits(&Value::Int(3)));
        assert!(between.fits(&Value::Int(5)));

        let between = Between::new(2, 5).exclude_upper();
        assert!(between.fits(&Value::Int(2)));
        assert!(!between.fits(&Value::Int(5)));
    }

    #[test]
    fn unset_bounds_are_unbounded() {
        let at_least = Between::at_least(10);
        assert!(at_least.fits(&Value::Int(10)));
        assert!(at_least.fits(&Value::Int(1_000_000)));
        assert!(!at_least.fits(&Value::Int(9)));

        let below = Between::below(0);
        assert!(below.fits(&Value::Int(-1_000_000)));
        assert!(!below.fits(&Value::Int(0)));
    }

    #[test]
    fn key_range_mirrors_fits() {
        let between = Between::new("a", "f").exclude_upper();
        let range = between.key_range();
        for probe in ["a", "b", "e", "f", "g"] {
            assert_eq!(
                range.contains(&Key::from(probe)),
                between.fits(&Value::from(probe)),
                "disagreement at {probe}"
            );
        }
    }

    #[test]
    fn filter_matches_by_kind() {
        let eq = Filter::from(25);
        assert!(eq.matches(&serde_json::json!(25)));
        assert!(eq.matches(&serde_json::json!(25.0)));
        assert!(!eq.matches(&serde_json::json!(26)));

        let range = Filter::from(Between::new(1, 3));
        assert!(range.matches(&serde_json::json!(2)));
        assert!(!range.matches(&serde_json::json!(4)));

        let test = Filter::test(|v| v.as_str().is_some_and(|s| s.starts_with("a")));
        assert!(test.matches(&serde_json::json!("alice")));
        assert!(!test.matches(&serde_json::json!("bob")));
    }
}
