//! Storage layer: maps datoms and schema onto the engine's
//! sub-databases and serves index range scans.
//!
//! Key formats (tx id is the table value, 8-byte big-endian; `added` is
//! encoded by presence — a retraction deletes the entry everywhere):
//!
//! - EAVT: `e(8) ∥ a(8) ∥ v(typed)`
//! - AEVT: `a(8) ∥ e(8) ∥ v(typed)`
//! - AVET: `a(8) ∥ v(typed) ∥ e(8)`
//! - VAET: `v(8) ∥ a(8) ∥ e(8)`, ref datoms only

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use datomdb_codec::{Decoder, Encoder, Keyword, Value};
use datomdb_storage::{Engine, KeyRange, ScanIter, Snapshot, SubDb, WriteOp};
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::datom::{Component, Datom, IndexKind};
use crate::error::{DbError, DbResult};
use crate::schema::{builtin_attrs, AttrSchema, AttrSpec, Rschema, ValueType, FIRST_USER_AID};
use crate::tx_fn::TxFnRegistry;
use crate::types::{Aid, Eid, E0, TX0};

const FORMAT_VERSION: u8 = 1;
const META_VERSION_KEY: &[u8] = b"version";
const META_MAX_AID_KEY: &[u8] = b"max-aid";
const META_MAX_TX_KEY: &[u8] = b"max-tx";

/// In-memory mirror of the persistent attribute registry.
#[derive(Debug, Default)]
struct Registry {
    by_kw: HashMap<Keyword, AttrSchema>,
    by_aid: HashMap<Aid, Keyword>,
    max_aid: Aid,
    /// Entries not yet persisted; drained into the next commit batch.
    dirty: Vec<Keyword>,
}

impl Registry {
    fn insert(&mut self, kw: Keyword, schema: AttrSchema) {
        self.by_aid.insert(schema.aid, kw.clone());
        self.by_kw.insert(kw, schema);
        self.max_aid = self.max_aid.max(schema.aid);
    }
}

/// The authoritative storage layer behind a database.
pub(crate) struct Store {
    engine: Engine,
    registry: RwLock<Registry>,
    tx_fns: TxFnRegistry,
}

impl Store {
    /// Opens the store over `dir`, or in memory when `dir` is `None`,
    /// then merges the implicit schema and registers `schema`.
    pub fn open(dir: Option<&Path>, schema: &BTreeMap<Keyword, AttrSpec>) -> DbResult<Store> {
        let engine = match dir {
            Some(dir) => Engine::open(dir)?,
            None => Engine::in_memory()?,
        };
        let store = Store {
            engine,
            registry: RwLock::new(Registry::default()),
            tx_fns: TxFnRegistry::new(),
        };
        store.init(schema)?;
        Ok(store)
    }

    fn init(&self, schema: &BTreeMap<Keyword, AttrSpec>) -> DbResult<()> {
        let snap = self.engine.snapshot()?;

        let fresh = match snap.get(SubDb::Meta, META_VERSION_KEY)? {
            Some(v) if v == [FORMAT_VERSION] => false,
            Some(v) => {
                return Err(DbError::invalid_format(format!(
                    "unsupported on-disk version {v:?}, expected [{FORMAT_VERSION}]"
                )))
            }
            None => true,
        };

        let mut reg = Registry::default();
        reg.max_aid = FIRST_USER_AID - 1;
        for (kw, builtin) in builtin_attrs() {
            reg.insert(kw, builtin);
        }
        for entry in snap.scan(SubDb::Schema, &KeyRange::All, false)? {
            let (key, record) = entry?;
            let kw = Keyword::new(
                std::str::from_utf8(&key)
                    .map_err(|_| DbError::invalid_format("schema key is not UTF-8"))?,
            );
            let persisted = AttrSchema::from_record(&kw, &record)?;
            reg.insert(kw, persisted);
        }
        if let Some(bytes) = snap.get(SubDb::Meta, META_MAX_AID_KEY)? {
            let stored = u64::from_be_bytes(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| DbError::invalid_format("malformed max-aid entry"))?,
            );
            reg.max_aid = reg.max_aid.max(stored);
        }

        for (kw, spec) in schema {
            spec.validate(kw)?;
            match reg.by_kw.get(kw) {
                Some(existing) if existing.spec == *spec => {}
                Some(existing) => {
                    // Re-declaration keeps the assigned aid; only the
                    // option flags change.
                    let updated = AttrSchema {
                        spec: *spec,
                        aid: existing.aid,
                    };
                    reg.insert(kw.clone(), updated);
                    reg.dirty.push(kw.clone());
                }
                None => {
                    let aid = reg.max_aid + 1;
                    reg.insert(kw.clone(), AttrSchema { spec: *spec, aid });
                    reg.dirty.push(kw.clone());
                }
            }
        }

        let mut batch = Vec::new();
        if fresh {
            batch.push(WriteOp::Put {
                sub: SubDb::Meta,
                key: META_VERSION_KEY.to_vec(),
                value: vec![FORMAT_VERSION],
            });
        }
        let dirty: Vec<Keyword> = reg.dirty.drain(..).collect();
        for kw in &dirty {
            let entry = reg.by_kw[kw];
            batch.push(WriteOp::Put {
                sub: SubDb::Schema,
                key: kw.as_str().as_bytes().to_vec(),
                value: entry.to_record(),
            });
        }
        if !dirty.is_empty() || fresh {
            batch.push(WriteOp::Put {
                sub: SubDb::Meta,
                key: META_MAX_AID_KEY.to_vec(),
                value: reg.max_aid.to_be_bytes().to_vec(),
            });
            self.engine.write(&batch)?;
        }
        debug!(attrs = reg.by_kw.len(), max_aid = reg.max_aid, "registry loaded");

        *self.registry.write() = reg;
        Ok(())
    }

    /// A fresh MVCC snapshot of the engine.
    pub fn snapshot(&self) -> DbResult<Snapshot> {
        Ok(self.engine.snapshot()?)
    }

    /// The transaction-function registry of this database.
    pub fn tx_fns(&self) -> &TxFnRegistry {
        &self.tx_fns
    }

    // ---- attribute registry ------------------------------------------------

    /// The current schema map.
    pub fn schema(&self) -> BTreeMap<Keyword, AttrSchema> {
        let reg = self.registry.read();
        reg.by_kw
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// The derived reverse schema index.
    pub fn rschema(&self) -> Rschema {
        let reg = self.registry.read();
        Rschema::build(reg.by_kw.values())
    }

    /// Looks up a registered attribute by keyword.
    pub fn attr_by_kw(&self, kw: &Keyword) -> Option<AttrSchema> {
        self.registry.read().by_kw.get(kw).copied()
    }

    /// Looks up a registered attribute by id.
    pub fn attr_by_aid(&self, aid: Aid) -> Option<(Keyword, AttrSchema)> {
        let reg = self.registry.read();
        let kw = reg.by_aid.get(&aid)?.clone();
        let schema = *reg.by_kw.get(&kw)?;
        Some((kw, schema))
    }

    /// The keyword an attribute id was registered under.
    pub fn ident_of(&self, aid: Aid) -> Option<Keyword> {
        self.registry.read().by_aid.get(&aid).cloned()
    }

    /// Returns the attribute's registration, creating one with an
    /// inferred value type on first sight. The new entry is persisted
    /// with the next committed batch.
    pub fn intern_attr(&self, kw: &Keyword, witness: &Value) -> DbResult<AttrSchema> {
        if let Some(schema) = self.attr_by_kw(kw) {
            return Ok(schema);
        }
        let mut reg = self.registry.write();
        if let Some(schema) = reg.by_kw.get(kw) {
            return Ok(*schema);
        }
        let aid = reg.max_aid + 1;
        let schema = AttrSchema {
            spec: AttrSpec::new(ValueType::of(witness)),
            aid,
        };
        reg.insert(kw.clone(), schema);
        reg.dirty.push(kw.clone());
        trace!(attr = %kw, aid, "interned attribute");
        Ok(schema)
    }

    // ---- datom persistence -------------------------------------------------

    /// Applies a datom batch in one engine write transaction: assertions
    /// are inserted into every applicable index, retractions deleted
    /// from all of them, and any attribute entries interned since the
    /// last commit are persisted alongside.
    pub fn load_datoms<'a>(&self, datoms: impl IntoIterator<Item = &'a Datom>) -> DbResult<()> {
        let mut batch = Vec::new();
        {
            let mut reg = self.registry.write();
            let dirty: Vec<Keyword> = reg.dirty.drain(..).collect();
            for kw in &dirty {
                let entry = reg.by_kw[kw];
                batch.push(WriteOp::Put {
                    sub: SubDb::Schema,
                    key: kw.as_str().as_bytes().to_vec(),
                    value: entry.to_record(),
                });
            }
            if !dirty.is_empty() {
                batch.push(WriteOp::Put {
                    sub: SubDb::Meta,
                    key: META_MAX_AID_KEY.to_vec(),
                    value: reg.max_aid.to_be_bytes().to_vec(),
                });
            }
        }

        let mut count = 0usize;
        let mut max_tx_seen = 0u64;
        for d in datoms {
            count += 1;
            max_tx_seen = max_tx_seen.max(d.tx);
            let tx_bytes = d.tx.to_be_bytes().to_vec();
            let mut targets = vec![
                (SubDb::Eav, eav_key(d.e, d.a, &d.v)?),
                (SubDb::Aev, aev_key(d.a, d.e, &d.v)?),
                (SubDb::Ave, ave_key(d.a, &d.v, d.e)?),
            ];
            if let Value::Ref(to) = d.v {
                targets.push((SubDb::Vae, vae_key(to, d.a, d.e)));
            }
            for (sub, key) in targets {
                if d.added {
                    batch.push(WriteOp::Put {
                        sub,
                        key,
                        value: tx_bytes.clone(),
                    });
                } else {
                    batch.push(WriteOp::Del { sub, key });
                }
            }
        }

        if max_tx_seen > 0 {
            batch.push(WriteOp::Put {
                sub: SubDb::Meta,
                key: META_MAX_TX_KEY.to_vec(),
                value: max_tx_seen.to_be_bytes().to_vec(),
            });
        }

        self.engine.write(&batch)?;
        debug!(datoms = count, ops = batch.len(), "committed datom batch");
        Ok(())
    }

    /// The largest transaction id recorded on disk, or [`TX0`] for a
    /// database that has never committed datoms.
    pub fn init_max_tx(&self, snap: &Snapshot) -> DbResult<u64> {
        match snap.get(SubDb::Meta, META_MAX_TX_KEY)? {
            Some(bytes) => {
                let stored = u64::from_be_bytes(
                    bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| DbError::invalid_format("malformed max-tx entry"))?,
                );
                Ok(stored.max(TX0))
            }
            None => Ok(TX0),
        }
    }

    /// The largest entity id present in EAVT, skipping transaction
    /// entities, or [`E0`] when empty.
    pub fn init_max_eid(&self, snap: &Snapshot) -> DbResult<Eid> {
        let below_tx = KeyRange::LessThan(TX0.to_be_bytes().to_vec());
        match snap.first(SubDb::Eav, &below_tx, true)? {
            Some((key, value)) => Ok(decode_index_entry(IndexKind::Eavt, &key, &value)?.e),
            None => Ok(E0),
        }
    }

    /// The stored datom equal to `(e, a, v)`, if present.
    pub fn fetch(&self, snap: &Snapshot, e: Eid, a: Aid, v: &Value) -> DbResult<Option<Datom>> {
        let key = eav_key(e, a, v)?;
        Ok(snap
            .get(SubDb::Eav, &key)?
            .map(|tx_bytes| decode_tx(&tx_bytes).map(|tx| Datom::add(e, a, v.clone(), tx)))
            .transpose()?)
    }

    /// Lazy ordered slice of one index over a key range.
    pub fn slice(
        &self,
        snap: &Snapshot,
        index: IndexKind,
        range: &KeyRange,
    ) -> DbResult<DatomIter> {
        Ok(DatomIter {
            inner: snap.scan(sub_of(index), range, false)?,
            index,
        })
    }

    /// Reverse-ordered variant of [`Store::slice`].
    pub fn rslice(
        &self,
        snap: &Snapshot,
        index: IndexKind,
        range: &KeyRange,
    ) -> DbResult<DatomIter> {
        Ok(DatomIter {
            inner: snap.scan(sub_of(index), range, true)?,
            index,
        })
    }

    /// Filtered variant of [`Store::slice`].
    pub fn slice_filter<'a, P>(
        &self,
        snap: &Snapshot,
        index: IndexKind,
        range: &KeyRange,
        pred: P,
    ) -> DbResult<impl Iterator<Item = DbResult<Datom>> + 'a>
    where
        P: Fn(&Datom) -> bool + 'a,
    {
        let iter = self.slice(snap, index, range)?;
        Ok(iter.filter(move |item| match item {
            Ok(d) => pred(d),
            Err(_) => true,
        }))
    }

    // ---- search dispatch ---------------------------------------------------

    /// Finds datoms by bound components, choosing the index per the
    /// dispatch table: EAV for entity-first patterns, AVE when only
    /// attribute and value are known, AEV for attribute-only, VAE for
    /// value-only (ref datoms).
    pub fn search(
        &self,
        snap: &Snapshot,
        e: Option<Eid>,
        a: Option<Aid>,
        v: Option<&Value>,
    ) -> DbResult<Vec<Datom>> {
        match (e, a, v) {
            (Some(e), Some(a), Some(v)) => {
                Ok(self.fetch(snap, e, a, v)?.into_iter().collect())
            }
            (Some(e), Some(a), None) => self
                .slice(snap, IndexKind::Eavt, &prefix_range(&ea_prefix(e, a)))?
                .collect(),
            (Some(e), None, Some(v)) => self
                .slice_filter(snap, IndexKind::Eavt, &prefix_range(&e_prefix(e)), |d| {
                    &d.v == v
                })?
                .collect(),
            (Some(e), None, None) => self
                .slice(snap, IndexKind::Eavt, &prefix_range(&e_prefix(e)))?
                .collect(),
            (None, Some(a), Some(v)) => self
                .slice(snap, IndexKind::Avet, &prefix_range(&av_prefix(a, v)?))?
                .collect(),
            (None, Some(a), None) => self
                .slice(snap, IndexKind::Aevt, &prefix_range(&e_prefix(a)))?
                .collect(),
            (None, None, Some(v)) => match v {
                Value::Ref(to) => self
                    .slice(snap, IndexKind::Vaet, &prefix_range(&e_prefix(*to)))?
                    .collect(),
                other => self
                    .slice_filter(snap, IndexKind::Eavt, &KeyRange::All, |d| &d.v == other)?
                    .collect(),
            },
            (None, None, None) => self.slice(snap, IndexKind::Eavt, &KeyRange::All)?.collect(),
        }
    }

    /// Builds the key prefix bound by `components` in `index` field
    /// order. Returns `None` when a named attribute is unregistered, in
    /// which case no datom can match.
    pub fn components_prefix(
        &self,
        index: IndexKind,
        components: &[Component],
    ) -> DbResult<Option<Vec<u8>>> {
        let order = field_order(index);
        if components.len() > order.len() {
            return Err(DbError::IndexComponents {
                message: format!(
                    "{index:?} takes at most {} components, got {}",
                    order.len(),
                    components.len()
                ),
            });
        }
        let mut enc = Encoder::new();
        for (position, (component, field)) in components.iter().zip(order).enumerate() {
            match (field, component) {
                (Field::Entity, Component::Entity(e)) => enc.put_u64(*e),
                (Field::Attr, Component::Attr(kw)) => match self.attr_by_kw(kw) {
                    Some(schema) => enc.put_u64(schema.aid),
                    None => return Ok(None),
                },
                // VAET's leading field is a referenced entity id, stored
                // raw rather than as a tagged value.
                (Field::Value, Component::Entity(e)) if index == IndexKind::Vaet => {
                    enc.put_u64(*e);
                }
                (Field::Value, Component::Value(Value::Ref(e))) if index == IndexKind::Vaet => {
                    enc.put_u64(*e);
                }
                (Field::Value, Component::Value(v)) if index != IndexKind::Vaet => {
                    enc.put_value(v)?;
                }
                (field, component) => {
                    return Err(DbError::IndexComponents {
                        message: format!(
                            "component {position} of {index:?} must be {field:?}, got {component:?}"
                        ),
                    })
                }
            }
        }
        Ok(Some(enc.into_bytes()))
    }
}

/// Which sub-database stores an index.
pub(crate) fn sub_of(index: IndexKind) -> SubDb {
    match index {
        IndexKind::Eavt => SubDb::Eav,
        IndexKind::Aevt => SubDb::Aev,
        IndexKind::Avet => SubDb::Ave,
        IndexKind::Vaet => SubDb::Vae,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Entity,
    Attr,
    Value,
}

fn field_order(index: IndexKind) -> &'static [Field; 3] {
    match index {
        IndexKind::Eavt => &[Field::Entity, Field::Attr, Field::Value],
        IndexKind::Aevt => &[Field::Attr, Field::Entity, Field::Value],
        IndexKind::Avet => &[Field::Attr, Field::Value, Field::Entity],
        IndexKind::Vaet => &[Field::Value, Field::Attr, Field::Entity],
    }
}

// ---- key composition -------------------------------------------------------

pub(crate) fn eav_key(e: Eid, a: Aid, v: &Value) -> DbResult<Vec<u8>> {
    let mut enc = Encoder::with_capacity(24);
    enc.put_u64(e);
    enc.put_u64(a);
    enc.put_value(v)?;
    Ok(enc.into_bytes())
}

pub(crate) fn aev_key(a: Aid, e: Eid, v: &Value) -> DbResult<Vec<u8>> {
    let mut enc = Encoder::with_capacity(24);
    enc.put_u64(a);
    enc.put_u64(e);
    enc.put_value(v)?;
    Ok(enc.into_bytes())
}

pub(crate) fn ave_key(a: Aid, v: &Value, e: Eid) -> DbResult<Vec<u8>> {
    let mut enc = Encoder::with_capacity(24);
    enc.put_u64(a);
    enc.put_value(v)?;
    enc.put_u64(e);
    Ok(enc.into_bytes())
}

pub(crate) fn vae_key(v: Eid, a: Aid, e: Eid) -> Vec<u8> {
    let mut enc = Encoder::with_capacity(24);
    enc.put_u64(v);
    enc.put_u64(a);
    enc.put_u64(e);
    enc.into_bytes()
}

/// Prefix of every EAVT key for one entity (also AEVT/VAET leading id).
pub(crate) fn e_prefix(e: u64) -> Vec<u8> {
    e.to_be_bytes().to_vec()
}

/// Prefix of every EAVT key for one entity-attribute pair.
pub(crate) fn ea_prefix(e: Eid, a: Aid) -> Vec<u8> {
    let mut enc = Encoder::with_capacity(16);
    enc.put_u64(e);
    enc.put_u64(a);
    enc.into_bytes()
}

/// Prefix of every AVET key for one attribute-value pair.
pub(crate) fn av_prefix(a: Aid, v: &Value) -> DbResult<Vec<u8>> {
    let mut enc = Encoder::with_capacity(24);
    enc.put_u64(a);
    enc.put_value(v)?;
    Ok(enc.into_bytes())
}

pub(crate) fn prefix_range(prefix: &[u8]) -> KeyRange {
    KeyRange::prefixed(prefix)
}

// ---- key decomposition -----------------------------------------------------

fn decode_tx(value: &[u8]) -> DbResult<u64> {
    value
        .try_into()
        .map(u64::from_be_bytes)
        .map_err(|_| DbError::invalid_format("malformed tx value in index entry"))
}

/// Rebuilds the datom behind one `(key, value)` index entry.
pub(crate) fn decode_index_entry(index: IndexKind, key: &[u8], value: &[u8]) -> DbResult<Datom> {
    let tx = decode_tx(value)?;
    let mut dec = Decoder::new(key);
    let bad = |message: &str| DbError::invalid_format(message.to_string());
    let datom = match index {
        IndexKind::Eavt => {
            let e = dec.take_u64()?;
            let a = dec.take_u64()?;
            let v = dec.take_value()?;
            Datom::add(e, a, v, tx)
        }
        IndexKind::Aevt => {
            let a = dec.take_u64()?;
            let e = dec.take_u64()?;
            let v = dec.take_value()?;
            Datom::add(e, a, v, tx)
        }
        IndexKind::Avet => {
            let a = dec.take_u64()?;
            let v = dec.take_value()?;
            let e = dec.take_u64()?;
            Datom::add(e, a, v, tx)
        }
        IndexKind::Vaet => {
            let v = dec.take_u64()?;
            let a = dec.take_u64()?;
            let e = dec.take_u64()?;
            Datom::add(e, a, Value::Ref(v), tx)
        }
    };
    if !dec.remaining().is_empty() {
        return Err(bad("trailing bytes in index key"));
    }
    Ok(datom)
}

/// Lazy cursor over one index slice, yielding decoded datoms.
pub struct DatomIter {
    inner: ScanIter,
    index: IndexKind,
}

impl Iterator for DatomIter {
    type Item = DbResult<Datom>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.inner.next()?;
        Some(entry.map_err(DbError::from).and_then(|(key, value)| {
            decode_index_entry(self.index, &key, &value)
        }))
    }
}
