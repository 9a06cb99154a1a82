//! Static sequence types: item kinds plus occurrence indicators.

use crate::xdm::AtomicValue;
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    AnyAtomic,
    Boolean,
    Integer,
    Decimal,
    Double,
    String,
    Untyped,
}

impl ItemType {
    /// The exact item kind of a runtime value.
    pub fn of(value: &AtomicValue) -> ItemType {
        match value {
            AtomicValue::Boolean(_) => ItemType::Boolean,
            AtomicValue::Integer(_) => ItemType::Integer,
            AtomicValue::Decimal(_) => ItemType::Decimal,
            AtomicValue::Double(_) => ItemType::Double,
            AtomicValue::String(_) => ItemType::String,
            AtomicValue::Untyped(_) => ItemType::Untyped,
        }
    }

    pub fn matches(&self, value: &AtomicValue) -> bool {
        match self {
            ItemType::AnyAtomic => true,
            ItemType::Boolean => matches!(value, AtomicValue::Boolean(_)),
            ItemType::Integer => matches!(value, AtomicValue::Integer(_)),
            // Integers are substitutable for decimals.
            ItemType::Decimal => matches!(value, AtomicValue::Integer(_) | AtomicValue::Decimal(_)),
            ItemType::Double => matches!(value, AtomicValue::Double(_)),
            ItemType::String => matches!(value, AtomicValue::String(_)),
            ItemType::Untyped => matches!(value, AtomicValue::Untyped(_)),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ItemType::Integer | ItemType::Decimal | ItemType::Double)
    }

    /// Least common supertype of two item kinds.
    pub fn union(self, other: ItemType) -> ItemType {
        if self == other {
            self
        } else if self.is_numeric() && other.is_numeric() {
            ItemType::Double
        } else {
            ItemType::AnyAtomic
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemType::AnyAtomic => "anyAtomicType",
            ItemType::Boolean => "boolean",
            ItemType::Integer => "integer",
            ItemType::Decimal => "decimal",
            ItemType::Double => "double",
            ItemType::String => "string",
            ItemType::Untyped => "untypedAtomic",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrence {
    One,
    ZeroOrOne,
    ZeroOrMore,
    OneOrMore,
}

impl Occurrence {
    pub fn indicator(&self) -> &'static str {
        match self {
            Occurrence::One => "",
            Occurrence::ZeroOrOne => "?",
            Occurrence::ZeroOrMore => "*",
            Occurrence::OneOrMore => "+",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqType {
    pub item: ItemType,
    pub occ: Occurrence,
}

impl SeqType {
    /// `item()*` — the type that accepts anything.
    pub const ANY: SeqType = SeqType { item: ItemType::AnyAtomic, occ: Occurrence::ZeroOrMore };

    pub const fn one(item: ItemType) -> SeqType {
        SeqType { item, occ: Occurrence::One }
    }

    pub const fn zero_or_one(item: ItemType) -> SeqType {
        SeqType { item, occ: Occurrence::ZeroOrOne }
    }

    pub const fn zero_or_more(item: ItemType) -> SeqType {
        SeqType { item, occ: Occurrence::ZeroOrMore }
    }

    /// Statically known cardinality, if the occurrence pins one down.
    pub fn size(&self) -> Option<u64> {
        match self.occ {
            Occurrence::One => Some(1),
            _ => None,
        }
    }

    pub fn matches(&self, seq: &[AtomicValue]) -> bool {
        let len_ok = match self.occ {
            Occurrence::One => seq.len() == 1,
            Occurrence::ZeroOrOne => seq.len() <= 1,
            Occurrence::ZeroOrMore => true,
            Occurrence::OneOrMore => !seq.is_empty(),
        };
        len_ok && seq.iter().all(|v| self.item.matches(v))
    }
}

impl fmt::Display for SeqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.item, self.occ.indicator())
    }
}
