//! The transaction pipeline.
//!
//! Operations are normalized to primitive add/retract datoms by working
//! a queue to a fixed point: map entities explode into vector ops,
//! nested maps re-enter as new map entities, stored functions splice
//! their results back in. Every emitted datom is validated against the
//! schema and the uniqueness invariant before it lands in `tx_data`.
//!
//! Upsert conflicts restart the whole transaction with the conflicting
//! tempid pinned; the driver loop is bounded by the number of tempids,
//! and a tempid that resolves to two different ids across restarts is a
//! hard `TransactUpsert` error.

use std::collections::{HashMap, HashSet, VecDeque};

use datomdb_codec::{Keyword, Value};
use tracing::trace;

use crate::database::Db;
use crate::datom::{Datom, IndexKind};
use crate::error::{DbError, DbResult};
use crate::resolve::{entid, entid_strict, EntityRef};
use crate::schema::{AttrSchema, Unique, FN_AID};
use crate::store::{av_prefix, e_prefix, ea_prefix, prefix_range};
use crate::types::{Aid, Eid, TempId, TxId, CURRENT_TX_TOKEN, TX0};

/// The value position of an operation or entity map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    /// A plain typed value.
    Value(Value),
    /// An entity reference; the attribute must be ref-typed.
    Ref(EntityRef),
    /// A nested entity map; the attribute must be ref-typed.
    Nested(EntityMap),
    /// A collection of values; the attribute must be cardinality-many
    /// (or a reverse ref inside an entity map).
    Many(Vec<AttrValue>),
}

impl From<Value> for AttrValue {
    fn from(v: Value) -> Self {
        AttrValue::Value(v)
    }
}

impl From<EntityRef> for AttrValue {
    fn from(e: EntityRef) -> Self {
        AttrValue::Ref(e)
    }
}

/// A map-form entity: an optional id plus attribute-value pairs.
///
/// Attribute keys may use the reverse-ref shorthand (`:ns/_attr`), in
/// which case the pair is entered with subject and object swapped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EntityMap {
    /// The `:db/id` position, if given.
    pub id: Option<EntityRef>,
    /// Attribute-value pairs.
    pub attrs: Vec<(Keyword, AttrValue)>,
}

impl EntityMap {
    /// Creates an entity map without an id.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the `:db/id` position.
    #[must_use]
    pub fn id(mut self, id: impl Into<EntityRef>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Adds an attribute-value pair.
    #[must_use]
    pub fn set(mut self, attr: impl Into<Keyword>, value: impl Into<AttrValue>) -> Self {
        self.attrs.push((attr.into(), value.into()));
        self
    }
}

/// One transaction operation.
#[derive(Debug, Clone)]
pub enum Op {
    /// `[:db/add e a v]`
    Add(EntityRef, Keyword, AttrValue),
    /// `[:db/retract e a v]`; with `None` value this is an alias of
    /// [`Op::RetractAttribute`].
    Retract(EntityRef, Keyword, Option<Value>),
    /// `[:db.fn/retractAttribute e a]`
    RetractAttribute(EntityRef, Keyword),
    /// `[:db.fn/retractEntity e]`
    RetractEntity(EntityRef),
    /// `[:db.fn/cas e a old new]` (alias `:db/cas`); `None` for `old`
    /// means the attribute must be absent.
    Cas(EntityRef, Keyword, Option<Value>, Value),
    /// `[ident & args]` — a stored transaction function call.
    Call(Keyword, Vec<Value>),
    /// Map-form entity.
    Entity(EntityMap),
    /// A raw datom, routed to add or retract by its polarity.
    Datom(Datom),
}

/// The result of one committed transaction.
#[derive(Debug, Clone)]
pub struct TxReport {
    /// The snapshot the transaction ran against.
    pub db_before: Db,
    /// The successor snapshot.
    pub db_after: Db,
    /// The id of this transaction.
    pub tx: TxId,
    /// Every primitive datom actually applied, in emission order.
    pub tx_data: Vec<Datom>,
    /// Resolution of every tempid, plus the current-tx token
    /// (`TempId::Str("db/current-tx")`) mapped to the transaction id.
    pub tempids: HashMap<TempId, Eid>,
}

/// Pipeline control flow: restart with a pinned tempid, or abort.
enum Halt {
    Restart { tempid: TempId, eid: Eid },
    Fail(DbError),
}

impl From<DbError> for Halt {
    fn from(e: DbError) -> Self {
        Halt::Fail(e)
    }
}

type PipeResult<T> = Result<T, Halt>;

struct Outcome {
    tx_data: Vec<Datom>,
    tempids: HashMap<TempId, Eid>,
    max_eid: Eid,
}

/// Runs `ops` against `db`, committing the resulting datoms.
pub(crate) fn transact(db: &Db, ops: Vec<Op>) -> DbResult<TxReport> {
    let mut pinned: HashMap<TempId, Eid> = HashMap::new();
    // Each restart pins one more tempid, so this bound is never hit by a
    // converging transaction.
    let budget = count_tempids(&ops) + 1;

    for _ in 0..budget {
        let pipeline = Pipeline::new(db, &pinned);
        match pipeline.run(&ops) {
            Ok(outcome) => return commit(db, outcome),
            Err(Halt::Restart { tempid, eid }) => match pinned.get(&tempid) {
                Some(&prev) if prev != eid => {
                    return Err(DbError::TransactUpsert {
                        message: format!("tempid {tempid} resolves differently across restarts"),
                        left: prev,
                        right: eid,
                    })
                }
                _ => {
                    trace!(%tempid, eid, "restarting transaction with pinned tempid");
                    pinned.insert(tempid, eid);
                }
            },
            Err(Halt::Fail(e)) => return Err(e),
        }
    }

    Err(DbError::TransactUpsert {
        message: "upsert restart budget exhausted".into(),
        left: 0,
        right: 0,
    })
}

fn commit(db: &Db, outcome: Outcome) -> DbResult<TxReport> {
    let tx = db.max_tx() + 1;
    let mut tempids = outcome.tempids;
    tempids.insert(TempId::Str(CURRENT_TX_TOKEN.to_string()), tx);

    db.store().load_datoms(outcome.tx_data.iter())?;
    let db_after = db.advance(outcome.max_eid, tx)?;

    Ok(TxReport {
        db_before: db.clone(),
        db_after,
        tx,
        tx_data: outcome.tx_data,
        tempids,
    })
}

fn count_tempids(ops: &[Op]) -> usize {
    fn walk_ref(eref: &EntityRef, out: &mut HashSet<TempId>) {
        if let EntityRef::Temp(t) = eref {
            out.insert(t.clone());
        }
    }
    fn walk_value(av: &AttrValue, out: &mut HashSet<TempId>) {
        match av {
            AttrValue::Ref(er) => walk_ref(er, out),
            AttrValue::Nested(m) => walk_map(m, out),
            AttrValue::Many(items) => items.iter().for_each(|i| walk_value(i, out)),
            AttrValue::Value(_) => {}
        }
    }
    fn walk_map(map: &EntityMap, out: &mut HashSet<TempId>) {
        if let Some(id) = &map.id {
            walk_ref(id, out);
        }
        for (_, av) in &map.attrs {
            walk_value(av, out);
        }
    }

    let mut out = HashSet::new();
    for op in ops {
        match op {
            Op::Add(e, _, av) => {
                walk_ref(e, &mut out);
                walk_value(av, &mut out);
            }
            Op::Retract(e, _, _) | Op::RetractAttribute(e, _) | Op::RetractEntity(e) => {
                walk_ref(e, &mut out);
            }
            Op::Cas(e, _, _, _) => walk_ref(e, &mut out),
            Op::Entity(m) => walk_map(m, &mut out),
            Op::Call(_, _) | Op::Datom(_) => {}
        }
    }
    out.len()
}

struct Pipeline<'a> {
    db: &'a Db,
    tx: TxId,
    next_eid: Eid,
    max_eid: Eid,
    tempids: HashMap<TempId, Eid>,
    tx_data: Vec<Datom>,
    /// Net in-transaction overlay: triples asserted so far.
    added: HashSet<(Eid, Aid, Value)>,
    /// Net in-transaction overlay: triples retracted so far.
    retracted: HashSet<(Eid, Aid, Value)>,
}

impl<'a> Pipeline<'a> {
    fn new(db: &'a Db, pinned: &HashMap<TempId, Eid>) -> Self {
        Self {
            db,
            tx: db.max_tx() + 1,
            next_eid: db.max_eid(),
            max_eid: db.max_eid(),
            tempids: pinned.clone(),
            tx_data: Vec::new(),
            added: HashSet::new(),
            retracted: HashSet::new(),
        }
    }

    fn run(mut self, ops: &[Op]) -> PipeResult<Outcome> {
        let mut queue: VecDeque<Op> = ops.iter().cloned().collect();
        while let Some(op) = queue.pop_front() {
            match op {
                Op::Entity(map) => self.apply_entity(map, &mut queue)?,
                Op::Add(e, attr, value) => self.apply_add(e, attr, value, &mut queue)?,
                Op::Retract(e, attr, Some(v)) => self.apply_retract(&e, &attr, v)?,
                // Value-less retract is an alias of retractAttribute.
                Op::Retract(e, attr, None) | Op::RetractAttribute(e, attr) => {
                    self.apply_retract_attribute(&e, &attr)?;
                }
                Op::RetractEntity(e) => self.apply_retract_entity(&e)?,
                Op::Cas(e, attr, expected, new) => {
                    self.apply_cas(&e, attr, expected, new, &mut queue)?;
                }
                Op::Call(name, args) => {
                    let spliced = self.invoke(&name, &args)?;
                    for op in spliced.into_iter().rev() {
                        queue.push_front(op);
                    }
                }
                Op::Datom(d) => {
                    let attr = self.db.store().ident_of(d.a).ok_or_else(|| {
                        DbError::transact_syntax(format!("unknown attribute id {} in datom", d.a))
                    })?;
                    if d.added {
                        self.apply_add(
                            EntityRef::Id(d.e),
                            attr,
                            AttrValue::Value(d.v),
                            &mut queue,
                        )?;
                    } else {
                        self.apply_retract(&EntityRef::Id(d.e), &attr, d.v)?;
                    }
                }
            }
        }
        Ok(Outcome {
            tx_data: self.tx_data,
            tempids: self.tempids,
            max_eid: self.max_eid,
        })
    }

    // ---- overlay views -----------------------------------------------------

    /// Current values of `(e, a)`: stored minus retracted plus added.
    fn eav_current(&self, e: Eid, aid: Aid) -> DbResult<Vec<Value>> {
        let range = prefix_range(&ea_prefix(e, aid));
        let mut out = Vec::new();
        for d in self.db.store().slice(self.db.snap(), IndexKind::Eavt, &range)? {
            let d = d?;
            if !self.retracted.contains(&(e, aid, d.v.clone())) {
                out.push(d.v);
            }
        }
        for (oe, oa, ov) in &self.added {
            if *oe == e && *oa == aid {
                out.push(ov.clone());
            }
        }
        Ok(out)
    }

    /// Whether the fact `(e, a, v)` currently holds.
    fn has_datom(&self, e: Eid, aid: Aid, v: &Value) -> DbResult<bool> {
        let triple = (e, aid, v.clone());
        if self.added.contains(&triple) {
            return Ok(true);
        }
        if self.retracted.contains(&triple) {
            return Ok(false);
        }
        Ok(self.db.store().fetch(self.db.snap(), e, aid, v)?.is_some())
    }

    /// The entity currently owning `(a, v)`, consulting the overlay
    /// before the AVET index.
    fn resolve_av(&self, aid: Aid, v: &Value) -> DbResult<Option<Eid>> {
        for (oe, oa, ov) in &self.added {
            if *oa == aid && ov == v {
                return Ok(Some(*oe));
            }
        }
        let range = prefix_range(&av_prefix(aid, v)?);
        for d in self.db.store().slice(self.db.snap(), IndexKind::Avet, &range)? {
            let d = d?;
            if !self.retracted.contains(&(d.e, aid, v.clone())) {
                return Ok(Some(d.e));
            }
        }
        Ok(None)
    }

    /// All current facts with subject `e`.
    fn entity_datoms(&self, e: Eid) -> DbResult<Vec<(Aid, Value)>> {
        let range = prefix_range(&e_prefix(e));
        let mut out = Vec::new();
        for d in self.db.store().slice(self.db.snap(), IndexKind::Eavt, &range)? {
            let d = d?;
            if !self.retracted.contains(&(e, d.a, d.v.clone())) {
                out.push((d.a, d.v));
            }
        }
        for (oe, oa, ov) in &self.added {
            if *oe == e {
                out.push((*oa, ov.clone()));
            }
        }
        Ok(out)
    }

    /// All current ref facts pointing at `to`.
    fn incoming_refs(&self, to: Eid) -> DbResult<Vec<(Eid, Aid)>> {
        let range = prefix_range(&e_prefix(to));
        let mut out = Vec::new();
        for d in self.db.store().slice(self.db.snap(), IndexKind::Vaet, &range)? {
            let d = d?;
            if !self.retracted.contains(&(d.e, d.a, Value::Ref(to))) {
                out.push((d.e, d.a));
            }
        }
        for (oe, oa, ov) in &self.added {
            if *ov == Value::Ref(to) {
                out.push((*oe, *oa));
            }
        }
        Ok(out)
    }

    // ---- emission ----------------------------------------------------------

    fn emit_add(&mut self, e: Eid, aid: Aid, v: Value) {
        self.retracted.remove(&(e, aid, v.clone()));
        self.added.insert((e, aid, v.clone()));
        if e < TX0 {
            self.max_eid = self.max_eid.max(e);
        }
        self.tx_data.push(Datom::add(e, aid, v, self.tx));
    }

    fn emit_retract(&mut self, e: Eid, aid: Aid, v: Value) {
        self.added.remove(&(e, aid, v.clone()));
        self.retracted.insert((e, aid, v.clone()));
        self.tx_data.push(Datom::retract(e, aid, v, self.tx));
    }

    fn alloc_eid(&mut self) -> Eid {
        self.next_eid += 1;
        self.max_eid = self.max_eid.max(self.next_eid);
        self.next_eid
    }

    // ---- entity-position resolution ----------------------------------------

    /// Resolves the subject of an add, upserting a tempid through a
    /// unique-identity attribute when possible.
    fn resolve_e_for_add(
        &mut self,
        eref: &EntityRef,
        schema: &AttrSchema,
        v: &Value,
    ) -> PipeResult<Eid> {
        match eref {
            EntityRef::Id(e) => Ok(*e),
            EntityRef::CurrentTx => Ok(self.tx),
            EntityRef::Temp(t) => {
                let upserted = if schema.spec.unique == Some(Unique::Identity) {
                    self.resolve_av(schema.aid, v)?
                } else {
                    None
                };
                match (self.tempids.get(t).copied(), upserted) {
                    (Some(bound), Some(up)) if bound != up => Err(Halt::Restart {
                        tempid: t.clone(),
                        eid: up,
                    }),
                    (Some(bound), _) => Ok(bound),
                    (None, Some(up)) => {
                        self.tempids.insert(t.clone(), up);
                        Ok(up)
                    }
                    (None, None) => {
                        let e = self.alloc_eid();
                        self.tempids.insert(t.clone(), e);
                        Ok(e)
                    }
                }
            }
            other => Ok(entid_strict(self.db, other)?),
        }
    }

    /// Resolves a reference in value position; tempids allocate.
    fn resolve_v_ref(&mut self, eref: &EntityRef) -> PipeResult<Eid> {
        match eref {
            EntityRef::Id(e) => Ok(*e),
            EntityRef::CurrentTx => Ok(self.tx),
            EntityRef::Temp(t) => {
                if let Some(&e) = self.tempids.get(t) {
                    Ok(e)
                } else {
                    let e = self.alloc_eid();
                    self.tempids.insert(t.clone(), e);
                    Ok(e)
                }
            }
            other => Ok(entid_strict(self.db, other)?),
        }
    }

    /// Resolves the subject of a retraction-flavored op. `None` means
    /// the referenced entity does not exist, which makes the whole op a
    /// no-op.
    fn resolve_e_soft(&self, eref: &EntityRef) -> PipeResult<Option<Eid>> {
        match eref {
            EntityRef::Id(e) => Ok(Some(*e)),
            EntityRef::CurrentTx => Ok(Some(self.tx)),
            EntityRef::Temp(t) => match self.tempids.get(t) {
                Some(&e) => Ok(Some(e)),
                None => Err(Halt::Fail(DbError::entity_id_syntax(format!(
                    "tempid {t} is not bound by this transaction"
                )))),
            },
            other => Ok(entid(self.db, other)?),
        }
    }

    // ---- primitive operations ----------------------------------------------

    fn apply_add(
        &mut self,
        eref: EntityRef,
        attr: Keyword,
        value: AttrValue,
        queue: &mut VecDeque<Op>,
    ) -> PipeResult<()> {
        if attr.is_reverse() {
            return Err(Halt::Fail(DbError::transact_syntax(format!(
                "reverse attribute {attr} is not allowed in a primitive datom"
            ))));
        }

        match value {
            AttrValue::Many(items) => {
                let declared = self.db.store().attr_by_kw(&attr);
                match declared {
                    Some(schema) if schema.is_many() => {
                        for item in items {
                            self.apply_add(eref.clone(), attr.clone(), item, queue)?;
                        }
                        Ok(())
                    }
                    _ => Err(Halt::Fail(DbError::transact_syntax(format!(
                        "collection value for cardinality-one attribute {attr}"
                    )))),
                }
            }
            AttrValue::Nested(nested) => {
                let declared = self.db.store().attr_by_kw(&attr);
                if !declared.is_some_and(|s| s.is_ref()) {
                    return Err(Halt::Fail(DbError::transact_syntax(format!(
                        "nested map under non-ref attribute {attr}"
                    ))));
                }
                // The nested entity links back through the reverse ref,
                // so the pair re-enters as one map entity.
                let e = self.resolve_v_ref(&eref)?;
                let linked = EntityMap {
                    id: nested.id,
                    attrs: {
                        let mut attrs = nested.attrs;
                        attrs.push((attr.reverse(), AttrValue::Ref(EntityRef::Id(e))));
                        attrs
                    },
                };
                queue.push_front(Op::Entity(linked));
                Ok(())
            }
            AttrValue::Ref(er) => {
                let to = self.resolve_v_ref(&er)?;
                self.add_concrete(eref, attr, Value::Ref(to))
            }
            AttrValue::Value(v) => self.add_concrete(eref, attr, v),
        }
    }

    fn add_concrete(&mut self, eref: EntityRef, attr: Keyword, v: Value) -> PipeResult<()> {
        let mut v = v;
        // Refs travel as plain numbers in raw datoms and lookups.
        if let Some(schema) = self.db.store().attr_by_kw(&attr) {
            if schema.is_ref() {
                if let Value::Long(n) = v {
                    if n >= 0 {
                        v = Value::Ref(n as Eid);
                    }
                }
            }
        }

        let schema = self.db.store().intern_attr(&attr, &v)?;
        schema.check_value(&attr, &v)?;

        let e = self.resolve_e_for_add(&eref, &schema, &v)?;

        if schema.is_unique() {
            if let Some(owner) = self.resolve_av(schema.aid, &v)? {
                if owner != e {
                    return Err(Halt::Fail(DbError::TransactUnique {
                        attr,
                        value: v,
                        existing: owner,
                    }));
                }
            }
        }

        if schema.is_many() {
            if !self.has_datom(e, schema.aid, &v)? {
                self.emit_add(e, schema.aid, v);
            }
            return Ok(());
        }

        let current = self.eav_current(e, schema.aid)?;
        if current.contains(&v) {
            return Ok(());
        }
        if let Some(old) = current.into_iter().next() {
            self.emit_retract(e, schema.aid, old);
        }
        self.emit_add(e, schema.aid, v);
        Ok(())
    }

    fn apply_retract(&mut self, eref: &EntityRef, attr: &Keyword, v: Value) -> PipeResult<()> {
        let Some(e) = self.resolve_e_soft(eref)? else {
            return Ok(());
        };
        let Some(schema) = self.db.store().attr_by_kw(attr) else {
            return Ok(());
        };
        let v = if schema.is_ref() {
            match v {
                Value::Long(n) if n >= 0 => Value::Ref(n as Eid),
                other => other,
            }
        } else {
            v
        };
        if self.has_datom(e, schema.aid, &v)? {
            self.emit_retract(e, schema.aid, v);
        }
        Ok(())
    }

    fn apply_retract_attribute(&mut self, eref: &EntityRef, attr: &Keyword) -> PipeResult<()> {
        let Some(e) = self.resolve_e_soft(eref)? else {
            return Ok(());
        };
        let Some(schema) = self.db.store().attr_by_kw(attr) else {
            return Ok(());
        };
        let values = self.eav_current(e, schema.aid)?;
        for v in &values {
            self.emit_retract(e, schema.aid, v.clone());
        }
        if schema.spec.component {
            for v in values {
                if let Value::Ref(child) = v {
                    self.retract_entity_eid(child)?;
                }
            }
        }
        Ok(())
    }

    fn apply_retract_entity(&mut self, eref: &EntityRef) -> PipeResult<()> {
        let Some(e) = self.resolve_e_soft(eref)? else {
            return Ok(());
        };
        self.retract_entity_eid(e)
    }

    /// Retracts all facts with subject `e` and all ref facts pointing at
    /// it, cascading through component references. The seen-set guards
    /// against component cycles.
    fn retract_entity_eid(&mut self, root: Eid) -> PipeResult<()> {
        let mut stack = vec![root];
        let mut seen = HashSet::new();
        while let Some(e) = stack.pop() {
            if !seen.insert(e) {
                continue;
            }
            for (aid, v) in self.entity_datoms(e)? {
                let component = self
                    .db
                    .store()
                    .attr_by_aid(aid)
                    .is_some_and(|(_, s)| s.spec.component);
                if component {
                    if let Value::Ref(child) = &v {
                        stack.push(*child);
                    }
                }
                self.emit_retract(e, aid, v);
            }
            for (from, aid) in self.incoming_refs(e)? {
                self.emit_retract(from, aid, Value::Ref(e));
            }
        }
        Ok(())
    }

    fn apply_cas(
        &mut self,
        eref: &EntityRef,
        attr: Keyword,
        expected: Option<Value>,
        new: Value,
        queue: &mut VecDeque<Op>,
    ) -> PipeResult<()> {
        let e = self
            .resolve_e_soft(eref)?
            .ok_or_else(|| DbError::entity_id_missing(eref.to_string()))?;
        let schema = self.db.store().intern_attr(&attr, &new)?;
        let current = self.eav_current(e, schema.aid)?;

        let matched = match &expected {
            Some(old) => current.contains(old),
            None => current.is_empty(),
        };
        if !matched {
            return Err(Halt::Fail(DbError::TransactCas {
                e,
                attr,
                expected,
                found: current.into_iter().next(),
            }));
        }
        queue.push_front(Op::Add(
            EntityRef::Id(e),
            attr,
            AttrValue::Value(new),
        ));
        Ok(())
    }

    // ---- map entities ------------------------------------------------------

    fn apply_entity(&mut self, map: EntityMap, queue: &mut VecDeque<Op>) -> PipeResult<()> {
        // Normalize the id position first: tx sentinel and lookups
        // become concrete ids before the upsert scan.
        let id = match map.id {
            Some(EntityRef::CurrentTx) => Some(EntityRef::Id(self.tx)),
            Some(eref @ (EntityRef::Ident(_) | EntityRef::Lookup(_, _))) => {
                Some(EntityRef::Id(entid_strict(self.db, &eref)?))
            }
            other => other,
        };

        let upserted = self.upsert_scan(&map.attrs)?;

        let eid = match upserted {
            Some(up) => match &id {
                Some(EntityRef::Id(e)) if *e != up => {
                    return Err(Halt::Fail(DbError::TransactUpsert {
                        message: "explicit :db/id disagrees with unique-identity upsert".into(),
                        left: *e,
                        right: up,
                    }))
                }
                Some(EntityRef::Temp(t)) => match self.tempids.get(t).copied() {
                    Some(bound) if bound != up => {
                        return Err(Halt::Restart {
                            tempid: t.clone(),
                            eid: up,
                        })
                    }
                    _ => {
                        self.tempids.insert(t.clone(), up);
                        up
                    }
                },
                _ => up,
            },
            None => match id {
                Some(EntityRef::Id(e)) => e,
                Some(EntityRef::Temp(t)) => {
                    if let Some(&bound) = self.tempids.get(&t) {
                        bound
                    } else {
                        let e = self.alloc_eid();
                        self.tempids.insert(t, e);
                        e
                    }
                }
                None => self.alloc_eid(),
                Some(other) => {
                    return Err(Halt::Fail(DbError::entity_id_syntax(format!(
                        "unexpected :db/id {other}"
                    ))))
                }
            },
        };

        self.explode(eid, map.attrs, queue)
    }

    /// Scans the map's unique-identity attributes against AVET, folding
    /// collection values. Two attributes resolving to different
    /// entities is a hard conflict.
    fn upsert_scan(&mut self, attrs: &[(Keyword, AttrValue)]) -> PipeResult<Option<Eid>> {
        let mut resolved: Option<(Eid, Keyword)> = None;
        for (attr, av) in attrs {
            if attr.is_reverse() {
                continue;
            }
            let Some(schema) = self.db.store().attr_by_kw(attr) else {
                continue;
            };
            if schema.spec.unique != Some(Unique::Identity) {
                continue;
            }
            for v in self.concrete_values(&schema, av)? {
                if let Some(e) = self.resolve_av(schema.aid, &v)? {
                    match &resolved {
                        Some((prev, prev_attr)) if *prev != e => {
                            return Err(Halt::Fail(DbError::TransactUpsert {
                                message: format!(
                                    "attributes {prev_attr} and {attr} upsert to different entities"
                                ),
                                left: *prev,
                                right: e,
                            }))
                        }
                        _ => resolved = Some((e, attr.clone())),
                    }
                }
            }
        }
        Ok(resolved.map(|(e, _)| e))
    }

    /// The already-concrete values inside an attribute's value position;
    /// tempids and nested maps contribute nothing to an upsert scan.
    fn concrete_values(&self, schema: &AttrSchema, av: &AttrValue) -> PipeResult<Vec<Value>> {
        match av {
            AttrValue::Value(Value::Long(n)) if schema.is_ref() && *n >= 0 => {
                Ok(vec![Value::Ref(*n as Eid)])
            }
            AttrValue::Value(v) => Ok(vec![v.clone()]),
            AttrValue::Ref(EntityRef::Id(e)) => Ok(vec![Value::Ref(*e)]),
            AttrValue::Ref(eref @ (EntityRef::Ident(_) | EntityRef::Lookup(_, _))) => {
                Ok(vec![Value::Ref(entid_strict(self.db, eref)?)])
            }
            AttrValue::Ref(_) | AttrValue::Nested(_) => Ok(Vec::new()),
            AttrValue::Many(items) => {
                let mut out = Vec::new();
                for item in items {
                    out.extend(self.concrete_values(schema, item)?);
                }
                Ok(out)
            }
        }
    }

    /// Converts a map entity into vector ops against `eid`.
    fn explode(
        &mut self,
        eid: Eid,
        attrs: Vec<(Keyword, AttrValue)>,
        queue: &mut VecDeque<Op>,
    ) -> PipeResult<()> {
        for (attr, av) in attrs {
            if attr.is_reverse() {
                let straight = attr.direct();
                let declared = self.db.store().attr_by_kw(&straight);
                if !declared.is_some_and(|s| s.is_ref()) {
                    return Err(Halt::Fail(DbError::transact_syntax(format!(
                        "reverse attribute {attr} requires {straight} to be ref-typed"
                    ))));
                }
                let items = match av {
                    AttrValue::Many(items) => items,
                    single => vec![single],
                };
                for item in items {
                    // The value becomes the subject; this entity the object.
                    let subject = match item {
                        AttrValue::Ref(er) => er,
                        AttrValue::Value(Value::Long(n)) if n >= 0 => EntityRef::Id(n as Eid),
                        AttrValue::Value(Value::Ref(e)) => EntityRef::Id(e),
                        AttrValue::Nested(m) => {
                            let linked = EntityMap {
                                id: m.id,
                                attrs: {
                                    let mut nested_attrs = m.attrs;
                                    nested_attrs.push((
                                        straight.clone(),
                                        AttrValue::Ref(EntityRef::Id(eid)),
                                    ));
                                    nested_attrs
                                },
                            };
                            queue.push_back(Op::Entity(linked));
                            continue;
                        }
                        other => {
                            return Err(Halt::Fail(DbError::transact_syntax(format!(
                                "reverse attribute {attr} takes entity references, got {other:?}"
                            ))))
                        }
                    };
                    queue.push_back(Op::Add(
                        subject,
                        straight.clone(),
                        AttrValue::Ref(EntityRef::Id(eid)),
                    ));
                }
            } else {
                queue.push_back(Op::Add(EntityRef::Id(eid), attr, av));
            }
        }
        Ok(())
    }

    // ---- stored transaction functions --------------------------------------

    /// Resolves a non-built-in operation keyword to its function entity,
    /// loads `:db/fn`, and calls the registered implementation.
    fn invoke(&self, name: &Keyword, args: &[Value]) -> PipeResult<Vec<Op>> {
        let e = entid(self.db, &EntityRef::Ident(name.clone()))?.ok_or_else(|| {
            DbError::transact_syntax(format!("unknown transaction function {name}"))
        })?;
        let fn_name = self
            .eav_current(e, FN_AID)?
            .into_iter()
            .next()
            .and_then(|v| v.as_keyword().cloned())
            .ok_or_else(|| {
                DbError::transact_syntax(format!("entity {name} carries no :db/fn"))
            })?;
        let f = self.db.store().tx_fns().get(&fn_name).ok_or_else(|| {
            DbError::transact_syntax(format!("transaction function {fn_name} is not registered"))
        })?;
        Ok(f(self.db, args)?)
    }
}
