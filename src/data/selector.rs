//! Part selectors: boolean expressions over part membership, evaluated
//! against a sorted part list (typically a bucket's signature).

use crate::data::meta::{MetaData, PartOrdinal};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    /// Everything.
    All,
    Part(PartOrdinal),
    And(Vec<Selector>),
    Or(Vec<Selector>),
    Not(Box<Selector>),
}

impl Selector {
    pub fn part(p: PartOrdinal) -> Self {
        Selector::Part(p)
    }

    pub fn locally_owned() -> Self {
        Selector::Part(MetaData::LOCALLY_OWNED)
    }

    pub fn globally_shared() -> Self {
        Selector::Part(MetaData::GLOBALLY_SHARED)
    }

    pub fn aura() -> Self {
        Selector::Part(MetaData::AURA)
    }

    pub fn and(self, other: Selector) -> Self {
        match self {
            Selector::And(mut v) => {
                v.push(other);
                Selector::And(v)
            }
            s => Selector::And(vec![s, other]),
        }
    }

    pub fn or(self, other: Selector) -> Self {
        match self {
            Selector::Or(mut v) => {
                v.push(other);
                Selector::Or(v)
            }
            s => Selector::Or(vec![s, other]),
        }
    }

    pub fn complement(self) -> Self {
        Selector::Not(Box::new(self))
    }

    /// Evaluate against a sorted part list.
    pub fn matches(&self, parts: &[PartOrdinal]) -> bool {
        match self {
            Selector::All => true,
            Selector::Part(p) => parts.binary_search(p).is_ok(),
            Selector::And(v) => v.iter().all(|s| s.matches(parts)),
            Selector::Or(v) => v.iter().any(|s| s.matches(parts)),
            Selector::Not(s) => !s.matches(parts),
        }
    }
}
