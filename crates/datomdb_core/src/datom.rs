//! The datom record and the four index orders.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use datomdb_codec::{Keyword, Value};

use crate::types::{Aid, Eid, TxId};

/// One immutable fact: entity, attribute, value, transaction, polarity.
///
/// Equality and hashing are structural over `(e, a, v)` only — the same
/// fact asserted in two transactions is the same datom.
#[derive(Debug, Clone)]
pub struct Datom {
    /// Entity id.
    pub e: Eid,
    /// Attribute id.
    pub a: Aid,
    /// Typed value. Never nil — absence of a value is absence of the datom.
    pub v: Value,
    /// Transaction that produced this datom.
    pub tx: TxId,
    /// `true` for assertion, `false` for retraction.
    pub added: bool,
}

impl Datom {
    /// Creates an assertion datom.
    #[must_use]
    pub fn add(e: Eid, a: Aid, v: Value, tx: TxId) -> Self {
        Self {
            e,
            a,
            v,
            tx,
            added: true,
        }
    }

    /// Creates a retraction datom.
    #[must_use]
    pub fn retract(e: Eid, a: Aid, v: Value, tx: TxId) -> Self {
        Self {
            e,
            a,
            v,
            tx,
            added: false,
        }
    }

    /// Compares in EAVT order; ties break on tx last so datoms of the
    /// same fact across transactions sort chronologically.
    #[must_use]
    pub fn cmp_eavt(&self, other: &Self) -> Ordering {
        self.e
            .cmp(&other.e)
            .then_with(|| self.a.cmp(&other.a))
            .then_with(|| self.v.cmp(&other.v))
            .then_with(|| self.tx.cmp(&other.tx))
    }

    /// Compares in AEVT order.
    #[must_use]
    pub fn cmp_aevt(&self, other: &Self) -> Ordering {
        self.a
            .cmp(&other.a)
            .then_with(|| self.e.cmp(&other.e))
            .then_with(|| self.v.cmp(&other.v))
            .then_with(|| self.tx.cmp(&other.tx))
    }

    /// Compares in AVET order.
    #[must_use]
    pub fn cmp_avet(&self, other: &Self) -> Ordering {
        self.a
            .cmp(&other.a)
            .then_with(|| self.v.cmp(&other.v))
            .then_with(|| self.e.cmp(&other.e))
            .then_with(|| self.tx.cmp(&other.tx))
    }

    /// Compares in VAET order. Only meaningful for ref datoms.
    #[must_use]
    pub fn cmp_vaet(&self, other: &Self) -> Ordering {
        self.v
            .cmp(&other.v)
            .then_with(|| self.a.cmp(&other.a))
            .then_with(|| self.e.cmp(&other.e))
            .then_with(|| self.tx.cmp(&other.tx))
    }
}

impl PartialEq for Datom {
    fn eq(&self, other: &Self) -> bool {
        self.e == other.e && self.a == other.a && self.v == other.v
    }
}

impl Eq for Datom {}

impl Hash for Datom {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.e.hash(state);
        self.a.hash(state);
        self.v.hash(state);
    }
}

impl fmt::Display for Datom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#datom[{} {} {} {} {}]",
            self.e, self.a, self.v, self.tx, self.added
        )
    }
}

/// Which of the four sorted views to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    /// Entity-attribute-value; the primary full-scan order.
    Eavt,
    /// Attribute-entity-value.
    Aevt,
    /// Attribute-value-entity; value lookups and `index_range`.
    Avet,
    /// Value-attribute-entity; reverse-ref navigation, ref datoms only.
    Vaet,
}

/// One bound component of an index key, given in the index's own field
/// order when calling [`crate::Db::datoms`] and friends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    /// An entity id (also the value position of VAET).
    Entity(Eid),
    /// An attribute, by keyword.
    Attr(Keyword),
    /// A typed value.
    Value(Value),
}
