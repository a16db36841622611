//! Backend collation for values and documents.
//!
//! Values of different types order by [`TypeOrder`]; values of the same type
//! order by content. Document comparison walks the effective order terms and
//! breaks remaining ties on the document key, so any two distinct documents
//! compare unequal.

use crate::document::DocumentSnapshot;
use crate::path::ResourcePath;
use crate::query::{Direction, OrderBy};
use docwatch_codec::Value;
use std::cmp::Ordering;

/// Rank of a value's type in the total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypeOrder {
    /// `null`
    Null,
    /// `true` / `false`
    Boolean,
    /// NaN sorts before every other number.
    NaN,
    /// Integers and doubles.
    Number,
    /// Timestamps.
    Timestamp,
    /// Strings.
    String,
    /// Byte strings.
    Blob,
    /// Document references.
    Reference,
    /// Geographic points.
    GeoPoint,
    /// Arrays.
    Array,
    /// Vectors.
    Vector,
    /// Maps.
    Map,
}

impl TypeOrder {
    /// Rank of `value`.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => TypeOrder::Null,
            Value::Bool(_) => TypeOrder::Boolean,
            Value::Double(d) if d.is_nan() => TypeOrder::NaN,
            Value::Integer(_) | Value::Double(_) => TypeOrder::Number,
            Value::Timestamp(_) => TypeOrder::Timestamp,
            Value::String(_) => TypeOrder::String,
            Value::Bytes(_) => TypeOrder::Blob,
            Value::Reference(_) => TypeOrder::Reference,
            Value::GeoPoint { .. } => TypeOrder::GeoPoint,
            Value::Array(_) => TypeOrder::Array,
            Value::Vector(_) => TypeOrder::Vector,
            Value::Map(_) => TypeOrder::Map,
        }
    }
}

/// Compares two values in ascending backend order.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    let by_type = TypeOrder::of(left).cmp(&TypeOrder::of(right));
    if by_type != Ordering::Equal {
        return by_type;
    }

    match (left, right) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
        (Value::Double(a), Value::Double(b)) => compare_doubles(*a, *b),
        (Value::Integer(a), Value::Double(b)) => compare_mixed(*b, *a).reverse(),
        (Value::Double(a), Value::Integer(b)) => compare_mixed(*a, *b),
        (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
        (Value::Reference(a), Value::Reference(b)) => compare_references(a, b),
        (
            Value::GeoPoint {
                latitude: lat_a,
                longitude: lng_a,
            },
            Value::GeoPoint {
                latitude: lat_b,
                longitude: lng_b,
            },
        ) => compare_doubles(*lat_a, *lat_b).then_with(|| compare_doubles(*lng_a, *lng_b)),
        (Value::Array(a), Value::Array(b)) => compare_arrays(a, b),
        (Value::Vector(a), Value::Vector(b)) => a.len().cmp(&b.len()).then_with(|| {
            a.iter()
                .zip(b)
                .map(|(x, y)| compare_doubles(*x, *y))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        }),
        (Value::Map(a), Value::Map(b)) => {
            for ((ka, va), (kb, vb)) in a.iter().zip(b) {
                let ord = ka.cmp(kb).then_with(|| compare_values(va, vb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        // Null/Null and NaN/NaN
        _ => Ordering::Equal,
    }
}

fn compare_arrays(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ord = compare_values(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// NaN equals NaN and sorts first; `-0.0` equals `0.0`.
fn compare_doubles(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Exact comparison of a double with an integer, without rounding the
/// integer through `f64`.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn compare_mixed(double: f64, integer: i64) -> Ordering {
    if double.is_nan() {
        return Ordering::Less;
    }
    // 2^63 is exactly representable.
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    if double < -TWO_POW_63 {
        return Ordering::Less;
    }
    if double >= TWO_POW_63 {
        return Ordering::Greater;
    }
    let truncated = double as i64;
    truncated
        .cmp(&integer)
        .then_with(|| compare_doubles(double, integer as f64))
}

fn compare_references(a: &str, b: &str) -> Ordering {
    let split = |s: &str| -> Vec<String> {
        s.split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect()
    };
    ResourcePath::from_segments(split(a)).cmp(&ResourcePath::from_segments(split(b)))
}

/// Compares two documents under an effective order.
///
/// Each term compares the field values (or the keys, for `__name__`) and is
/// reversed for descending terms. A document missing an ordered field sorts
/// before one that has it; views drop such documents before they get here.
/// Remaining ties fall back to ascending key order.
pub fn compare_documents(a: &DocumentSnapshot, b: &DocumentSnapshot, order_by: &[OrderBy]) -> Ordering {
    for term in order_by {
        let ord = if term.field.is_document_key() {
            a.key().cmp(b.key())
        } else {
            match (a.get(&term.field), b.get(&term.field)) {
                (Some(x), Some(y)) => compare_values(x, y),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        let ord = match term.direction {
            Direction::Ascending => ord,
            Direction::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.key().cmp(b.key())
}

/// A reusable comparator bound to one effective order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentComparator {
    order_by: Vec<OrderBy>,
}

impl DocumentComparator {
    /// Creates a comparator for `order_by`.
    pub fn new(order_by: Vec<OrderBy>) -> Self {
        Self { order_by }
    }

    /// Order terms.
    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    /// Compares two documents.
    pub fn compare(&self, a: &DocumentSnapshot, b: &DocumentSnapshot) -> Ordering {
        compare_documents(a, b, &self.order_by)
    }
}
