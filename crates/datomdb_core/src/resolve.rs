//! Entity resolution: ids, idents, lookup refs.

use std::fmt;

use datomdb_codec::{Keyword, Value};

use crate::database::Db;
use crate::datom::IndexKind;
use crate::error::{DbError, DbResult};
use crate::store::{av_prefix, prefix_range};
use crate::types::{Eid, TempId};

/// Something that names an entity in a transaction operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRef {
    /// A concrete entity id.
    Id(Eid),
    /// A tempid, resolved by the pipeline.
    Temp(TempId),
    /// An ident keyword, sugar for `Lookup(:db/ident, k)`.
    Ident(Keyword),
    /// A lookup ref: unique attribute and value.
    Lookup(Keyword, Value),
    /// The transaction entity of the current transaction.
    CurrentTx,
}

impl EntityRef {
    /// The tempid inside this reference, if it is one.
    #[must_use]
    pub fn tempid(&self) -> Option<&TempId> {
        match self {
            EntityRef::Temp(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Id(e) => write!(f, "{e}"),
            EntityRef::Temp(t) => write!(f, "tempid {t}"),
            EntityRef::Ident(k) => write!(f, "{k}"),
            EntityRef::Lookup(a, v) => write!(f, "[{a} {v}]"),
            EntityRef::CurrentTx => write!(f, ":db/current-tx"),
        }
    }
}

impl From<i64> for EntityRef {
    /// Positive numbers are entity ids, negative numbers are tempids.
    fn from(n: i64) -> Self {
        if n < 0 {
            EntityRef::Temp(TempId::Int(n))
        } else {
            EntityRef::Id(n as Eid)
        }
    }
}

impl From<u64> for EntityRef {
    fn from(e: u64) -> Self {
        EntityRef::Id(e)
    }
}

impl From<Keyword> for EntityRef {
    fn from(k: Keyword) -> Self {
        EntityRef::Ident(k)
    }
}

impl From<&str> for EntityRef {
    /// Current-tx tokens become [`EntityRef::CurrentTx`], anything else
    /// is a string tempid.
    fn from(s: &str) -> Self {
        if TempId::is_tx_token(s) {
            EntityRef::CurrentTx
        } else {
            EntityRef::Temp(TempId::Str(s.to_string()))
        }
    }
}

/// Resolves an entity reference against the database, returning `None`
/// when a lookup finds nothing. Tempids and the current-tx token belong
/// to the pipeline and are rejected here.
pub(crate) fn entid(db: &Db, eref: &EntityRef) -> DbResult<Option<Eid>> {
    match eref {
        EntityRef::Id(e) => Ok(Some(*e)),
        EntityRef::Ident(k) => {
            lookup_by_av(db, &Keyword::new(":db/ident"), &Value::Keyword(k.clone()))
        }
        EntityRef::Lookup(attr, value) => lookup_by_av(db, attr, value),
        EntityRef::Temp(t) => Err(DbError::entity_id_syntax(format!(
            "tempid {t} outside transaction scope"
        ))),
        EntityRef::CurrentTx => Err(DbError::entity_id_syntax(
            "current-tx token outside transaction scope",
        )),
    }
}

/// Like [`entid`] but failing when nothing matches.
pub(crate) fn entid_strict(db: &Db, eref: &EntityRef) -> DbResult<Eid> {
    entid(db, eref)?.ok_or_else(|| DbError::entity_id_missing(eref.to_string()))
}

/// First entity owning `(attr, value)` in AVET.
///
/// The attribute must be registered and carry a unique constraint.
pub(crate) fn lookup_by_av(db: &Db, attr: &Keyword, value: &Value) -> DbResult<Option<Eid>> {
    let schema = db.store().attr_by_kw(attr).ok_or_else(|| {
        DbError::lookup_ref_syntax(format!("unknown attribute {attr} in lookup ref"))
    })?;
    if !schema.is_unique() {
        return Err(DbError::LookupRefUnique { attr: attr.clone() });
    }
    schema
        .check_value(attr, value)
        .map_err(|_| DbError::lookup_ref_syntax(format!("value {value} does not fit {attr}")))?;

    let range = prefix_range(&av_prefix(schema.aid, value)?);
    let mut iter = db.store().slice(db.snap(), IndexKind::Avet, &range)?;
    match iter.next() {
        Some(datom) => Ok(Some(datom?.e)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_refs_split_on_sign() {
        assert_eq!(EntityRef::from(5i64), EntityRef::Id(5));
        assert_eq!(EntityRef::from(-5i64), EntityRef::Temp(TempId::Int(-5)));
    }

    #[test]
    fn string_refs_recognize_tx_tokens() {
        assert_eq!(EntityRef::from("datomic.tx"), EntityRef::CurrentTx);
        assert_eq!(
            EntityRef::from("alice"),
            EntityRef::Temp(TempId::Str("alice".into()))
        );
    }
}
