//! Database facade: snapshots and the public index-access surface.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use datomdb_codec::{Keyword, Value};
use datomdb_storage::{KeyRange, Snapshot};

use crate::datom::{Component, Datom, IndexKind};
use crate::error::DbResult;
use crate::resolve::{self, EntityRef};
use crate::schema::{AttrSchema, AttrSpec, Rschema};
use crate::store::{av_prefix, DatomIter, Store};
use crate::transact::{self, Op, TxReport};
use crate::tx_fn::TxFn;
use crate::types::{Eid, TxId};

/// Configuration for opening a database.
///
/// Without a directory the database lives in memory and dies with the
/// process; with one, the engine environment is created under it.
#[derive(Debug, Clone, Default)]
pub struct DbConfig {
    dir: Option<PathBuf>,
    schema: BTreeMap<Keyword, AttrSpec>,
}

impl DbConfig {
    /// Creates a configuration with no directory and an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the database directory.
    #[must_use]
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Declares one attribute.
    #[must_use]
    pub fn attr(mut self, attr: impl Into<Keyword>, spec: AttrSpec) -> Self {
        self.schema.insert(attr.into(), spec);
        self
    }
}

/// Constructs a database over a directory (or in memory), declaring the
/// configured schema.
///
/// Opening an existing directory recovers the attribute registry,
/// `max-eid`, and `max-tx` from the stored state.
///
/// # Errors
///
/// Returns an error if the engine cannot be opened, the on-disk format
/// is incompatible, or the declared schema is invalid.
pub fn empty_db(config: DbConfig) -> DbResult<Db> {
    let store = Arc::new(Store::open(config.dir.as_deref(), &config.schema)?);
    Db::over(store)
}

/// Constructs a database over a directory (or in memory) and seeds it
/// with an initial datom set, all recorded under the base transaction.
///
/// # Errors
///
/// Returns an error on engine, schema, or value-conformance failures.
pub fn init_db(
    datoms: impl IntoIterator<Item = (Eid, Keyword, Value)>,
    config: DbConfig,
) -> DbResult<Db> {
    let store = Arc::new(Store::open(config.dir.as_deref(), &config.schema)?);

    let mut seed = Vec::new();
    for (e, attr, v) in datoms {
        let schema = store.intern_attr(&attr, &v)?;
        schema.check_value(&attr, &v)?;
        seed.push(Datom::add(e, schema.aid, v, crate::types::TX0));
    }
    store.load_datoms(seed.iter())?;

    Db::over(store)
}

/// An immutable database snapshot.
///
/// Cheap to clone; clones share the store and the engine snapshot.
/// [`Db::transact`] does not mutate the receiver — it returns a report
/// whose `db_after` is the successor snapshot.
#[derive(Clone)]
pub struct Db {
    store: Arc<Store>,
    snap: Arc<Snapshot>,
    max_eid: Eid,
    max_tx: TxId,
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("max_eid", &self.max_eid)
            .field("max_tx", &self.max_tx)
            .finish_non_exhaustive()
    }
}

impl Db {
    fn over(store: Arc<Store>) -> DbResult<Db> {
        let snap = Arc::new(store.snapshot()?);
        let max_eid = store.init_max_eid(&snap)?;
        let max_tx = store.init_max_tx(&snap)?;
        Ok(Db {
            store,
            snap,
            max_eid,
            max_tx,
        })
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn snap(&self) -> &Snapshot {
        &self.snap
    }

    /// The successor snapshot after a commit.
    pub(crate) fn advance(&self, max_eid: Eid, max_tx: TxId) -> DbResult<Db> {
        Ok(Db {
            store: Arc::clone(&self.store),
            snap: Arc::new(self.store.snapshot()?),
            max_eid: self.max_eid.max(max_eid),
            max_tx,
        })
    }

    /// The largest entity id ever observed.
    #[must_use]
    pub fn max_eid(&self) -> Eid {
        self.max_eid
    }

    /// The id of the last committed transaction.
    #[must_use]
    pub fn max_tx(&self) -> TxId {
        self.max_tx
    }

    /// The current schema map.
    #[must_use]
    pub fn schema(&self) -> BTreeMap<Keyword, AttrSchema> {
        self.store.schema()
    }

    /// The derived reverse schema index.
    #[must_use]
    pub fn rschema(&self) -> Rschema {
        self.store.rschema()
    }

    /// Registers a named transaction function for `[ident & args]` ops.
    pub fn register_tx_fn(&self, name: impl Into<Keyword>, f: TxFn) {
        self.store.tx_fns().register(name.into(), f);
    }

    /// Resolves an entity reference, returning `None` when a lookup
    /// finds nothing.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed references and non-unique lookup
    /// attributes.
    pub fn entid(&self, eref: &EntityRef) -> DbResult<Option<Eid>> {
        resolve::entid(self, eref)
    }

    /// Like [`Db::entid`] but failing when nothing matches.
    ///
    /// # Errors
    ///
    /// Additionally returns `EntityIdMissing` when the reference
    /// resolves to nothing.
    pub fn entid_strict(&self, eref: &EntityRef) -> DbResult<Eid> {
        resolve::entid_strict(self, eref)
    }

    /// Runs a transaction against this snapshot and commits it.
    ///
    /// # Errors
    ///
    /// Returns the first pipeline error; nothing reaches disk on
    /// failure.
    pub fn transact(&self, ops: Vec<Op>) -> DbResult<TxReport> {
        transact::transact(self, ops)
    }

    /// Finds datoms by whichever of `(e, a, v)` are bound, dispatching
    /// to the index that serves the pattern best.
    ///
    /// # Errors
    ///
    /// Returns an error on storage or decoding failures.
    pub fn search(
        &self,
        e: Option<Eid>,
        a: Option<&Keyword>,
        v: Option<&Value>,
    ) -> DbResult<Vec<Datom>> {
        let aid = match a {
            Some(attr) => match self.store.attr_by_kw(attr) {
                Some(schema) => Some(schema.aid),
                // An unregistered attribute matches nothing.
                None => return Ok(Vec::new()),
            },
            None => None,
        };
        self.store.search(&self.snap, e, aid, v)
    }

    /// Ordered slice of `index` over every datom consistent with the
    /// bound `components` (given in the index's field order).
    ///
    /// # Errors
    ///
    /// Returns an error when components do not fit the index order.
    pub fn datoms(&self, index: IndexKind, components: &[Component]) -> DbResult<DatomIter> {
        match self.store.components_prefix(index, components)? {
            None => self.store.slice(&self.snap, index, &empty_range()),
            Some(prefix) if prefix.is_empty() => {
                self.store.slice(&self.snap, index, &KeyRange::All)
            }
            Some(prefix) => self.store.slice(&self.snap, index, &KeyRange::prefixed(&prefix)),
        }
    }

    /// Forward scan starting at the smallest key `>= components`,
    /// continuing to the end of the index.
    ///
    /// # Errors
    ///
    /// Returns an error when components do not fit the index order.
    pub fn seek_datoms(&self, index: IndexKind, components: &[Component]) -> DbResult<DatomIter> {
        match self.store.components_prefix(index, components)? {
            None => self.store.slice(&self.snap, index, &empty_range()),
            Some(prefix) if prefix.is_empty() => {
                self.store.slice(&self.snap, index, &KeyRange::All)
            }
            Some(prefix) => self.store.slice(&self.snap, index, &KeyRange::AtLeast(prefix)),
        }
    }

    /// Reverse scan starting at the largest key `<= components` (with
    /// unbound trailing components at their maximum), continuing to the
    /// start of the index.
    ///
    /// # Errors
    ///
    /// Returns an error when components do not fit the index order.
    pub fn rseek_datoms(&self, index: IndexKind, components: &[Component]) -> DbResult<DatomIter> {
        match self.store.components_prefix(index, components)? {
            None => self.store.rslice(&self.snap, index, &empty_range()),
            Some(prefix) if prefix.is_empty() => {
                self.store.rslice(&self.snap, index, &KeyRange::All)
            }
            Some(prefix) => {
                let range = match KeyRange::prefixed(&prefix) {
                    KeyRange::ClosedOpen(_, end) => KeyRange::LessThan(end),
                    _ => KeyRange::All,
                };
                self.store.rslice(&self.snap, index, &range)
            }
        }
    }

    /// Forward AVET slice of one attribute between two typed values,
    /// both inclusive.
    ///
    /// # Errors
    ///
    /// Returns an error if a bound value cannot be encoded.
    pub fn index_range(&self, attr: &Keyword, start: &Value, end: &Value) -> DbResult<DatomIter> {
        let Some(schema) = self.store.attr_by_kw(attr) else {
            return self.store.slice(&self.snap, IndexKind::Avet, &empty_range());
        };
        let low = av_prefix(schema.aid, start)?;
        let high = av_prefix(schema.aid, end)?;
        let range = match KeyRange::prefixed(&high) {
            KeyRange::ClosedOpen(_, end_key) => KeyRange::ClosedOpen(low, end_key),
            _ => KeyRange::AtLeast(low),
        };
        self.store.slice(&self.snap, IndexKind::Avet, &range)
    }
}

/// A range that matches nothing.
fn empty_range() -> KeyRange {
    KeyRange::LessThan(Vec::new())
}
