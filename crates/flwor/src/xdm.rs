//! Atomic item universe and the streaming sequence protocol.
//!
//! Everything a pipeline produces or consumes is a sequence of
//! [`AtomicValue`] items. Sequences are pulled one item at a time through
//! [`SequenceCursor`]; [`SequenceStream`] wraps a cursor with iterator
//! adapters and a `materialize` escape hatch.

use crate::runtime::{Error, ErrorCode};
use compact_str::CompactString;
use core::fmt;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

/// Atomic values flowing through the pipeline.
///
/// Numeric subtypes are stored distinctly so comparisons and arithmetic can
/// promote precisely (integer → decimal → double) instead of collapsing to
/// floating point up front. Untyped values keep their lexical form and are
/// coerced at the point of use.
#[derive(Debug, Clone, PartialEq)]
pub enum AtomicValue {
    Boolean(bool),
    Integer(i64),
    Decimal(Decimal),
    Double(f64),
    String(CompactString),
    Untyped(CompactString),
}

impl AtomicValue {
    pub fn string(s: impl Into<CompactString>) -> Self {
        AtomicValue::String(s.into())
    }

    pub fn untyped(s: impl Into<CompactString>) -> Self {
        AtomicValue::Untyped(s.into())
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, AtomicValue::Integer(_) | AtomicValue::Decimal(_) | AtomicValue::Double(_))
    }

    /// Numeric view of the value, coercing untyped lexical forms.
    /// `None` for booleans, strings, and unparsable untyped values.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            AtomicValue::Integer(i) => Some(*i as f64),
            AtomicValue::Decimal(d) => d.to_f64(),
            AtomicValue::Double(d) => Some(*d),
            AtomicValue::Untyped(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Lexical string form, without quoting.
    pub fn string_value(&self) -> CompactString {
        match self {
            AtomicValue::Boolean(b) => CompactString::from(if *b { "true" } else { "false" }),
            AtomicValue::Integer(i) => CompactString::from(i.to_string()),
            AtomicValue::Decimal(d) => CompactString::from(d.to_string()),
            AtomicValue::Double(d) => CompactString::from(d.to_string()),
            AtomicValue::String(s) | AtomicValue::Untyped(s) => s.clone(),
        }
    }

    /// Effective boolean value of a single item.
    pub fn ebv(&self) -> bool {
        match self {
            AtomicValue::Boolean(b) => *b,
            AtomicValue::Integer(i) => *i != 0,
            AtomicValue::Decimal(d) => !d.is_zero(),
            AtomicValue::Double(d) => *d != 0.0 && !d.is_nan(),
            AtomicValue::String(s) | AtomicValue::Untyped(s) => !s.is_empty(),
        }
    }
}

impl fmt::Display for AtomicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtomicValue::Boolean(b) => write!(f, "{}()", b),
            AtomicValue::Integer(i) => write!(f, "{}", i),
            AtomicValue::Decimal(d) => write!(f, "{}", d),
            AtomicValue::Double(d) => write!(f, "{:e}", d),
            AtomicValue::String(s) => write!(f, "'{}'", s),
            AtomicValue::Untyped(s) => write!(f, "u'{}'", s),
        }
    }
}

/// A fully materialized sequence.
pub type Sequence = Vec<AtomicValue>;

pub type ItemResult = Result<AtomicValue, Error>;

/// Effective boolean value of a materialized sequence: empty is false, a
/// singleton delegates to the item, anything longer is a type error.
pub fn ebv(seq: &[AtomicValue]) -> Result<bool, Error> {
    match seq {
        [] => Ok(false),
        [single] => Ok(single.ebv()),
        _ => Err(Error::from_code(
            ErrorCode::FORG0006,
            "effective boolean value of a sequence with more than one item",
        )),
    }
}

/// Pull protocol for lazy sequences. `next_item` returns `None` once the
/// stream is exhausted; an `Err` item aborts the evaluation it belongs to.
pub trait SequenceCursor {
    fn next_item(&mut self) -> Option<ItemResult>;

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, None)
    }
}

/// A lazy sequence backed by a boxed cursor.
pub struct SequenceStream {
    cursor: Box<dyn SequenceCursor>,
}

impl SequenceStream {
    pub fn new(cursor: impl SequenceCursor + 'static) -> Self {
        Self { cursor: Box::new(cursor) }
    }

    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    pub fn from_item(item: AtomicValue) -> Self {
        Self::from_vec(vec![item])
    }

    pub fn from_vec(seq: Sequence) -> Self {
        Self::new(VecCursor { items: seq.into_iter() })
    }

    /// Drains the stream into a vector, stopping at the first error.
    pub fn materialize(self) -> Result<Sequence, Error> {
        let (lower, _) = self.cursor.size_hint();
        let mut out = Vec::with_capacity(lower);
        for item in self {
            out.push(item?);
        }
        Ok(out)
    }
}

impl Default for SequenceStream {
    fn default() -> Self {
        Self::empty()
    }
}

impl Iterator for SequenceStream {
    type Item = ItemResult;

    fn next(&mut self) -> Option<ItemResult> {
        self.cursor.next_item()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.cursor.size_hint()
    }
}

struct VecCursor {
    items: std::vec::IntoIter<AtomicValue>,
}

impl SequenceCursor for VecCursor {
    fn next_item(&mut self) -> Option<ItemResult> {
        self.items.next().map(Ok)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.items.len();
        (n, Some(n))
    }
}
