//! End-to-end transaction tests: entity resolution, upserts, cascades,
//! CAS, index scans, and the invariants the indexes must keep.

use std::collections::HashSet;
use std::sync::Arc;

use datomdb_core::{
    empty_db, init_db, AttrSpec, AttrValue, Component, Datom, Db, DbConfig, DbError, DbResult,
    EntityMap, EntityRef, IndexKind, Keyword, Op, TempId, Value, ValueType, CURRENT_TX_TOKEN, TX0,
};

fn kw(s: &str) -> Keyword {
    Keyword::new(s)
}

fn person_config() -> DbConfig {
    DbConfig::new()
        .attr(
            ":person/name",
            AttrSpec::new(ValueType::String).unique_identity(),
        )
        .attr(
            ":person/nick",
            AttrSpec::new(ValueType::String).unique_identity(),
        )
        .attr(":person/ssn", AttrSpec::new(ValueType::String).unique_value())
        .attr(":person/age", AttrSpec::new(ValueType::Long))
        .attr(
            ":person/child",
            AttrSpec::new(ValueType::Ref).component(),
        )
        .attr(":person/friend", AttrSpec::new(ValueType::Ref).many())
}

fn aid(db: &Db, attr: &str) -> u64 {
    db.schema()[&kw(attr)].aid
}

fn all_datoms(db: &Db, index: IndexKind) -> Vec<Datom> {
    db.datoms(index, &[])
        .unwrap()
        .collect::<DbResult<_>>()
        .unwrap()
}

#[test]
fn simple_add_lands_in_three_indexes() {
    let db = empty_db(person_config()).unwrap();
    let report = db
        .transact(vec![Op::Entity(
            EntityMap::new()
                .id(-1i64)
                .set(":person/name", Value::Str("A".into())),
        )])
        .unwrap();

    assert_eq!(report.tx, TX0 + 1);
    assert_eq!(report.tempids[&TempId::Int(-1)], 1);
    assert_eq!(report.tempids[&TempId::Str(CURRENT_TX_TOKEN.into())], report.tx);

    let name = aid(&db, ":person/name");
    assert_eq!(
        report.tx_data,
        vec![Datom::add(1, name, Value::Str("A".into()), report.tx)]
    );
    assert!(report.tx_data[0].added);
    assert_eq!(report.tx_data[0].tx, report.tx);

    let after = &report.db_after;
    for index in [IndexKind::Eavt, IndexKind::Avet, IndexKind::Aevt] {
        let datoms = all_datoms(after, index);
        assert_eq!(datoms.len(), 1, "{index:?}");
        assert_eq!(datoms[0].e, 1);
        assert_eq!(datoms[0].v, Value::Str("A".into()));
    }
    assert_eq!(after.max_eid(), 1);
}

#[test]
fn upsert_reuses_existing_entity() {
    let db = init_db(
        vec![(1, kw(":person/name"), Value::Str("A".into()))],
        person_config(),
    )
    .unwrap();

    let report = db
        .transact(vec![Op::Entity(
            EntityMap::new()
                .set(":person/name", Value::Str("A".into()))
                .set(":person/age", Value::Long(20)),
        )])
        .unwrap();

    let age = aid(&db, ":person/age");
    assert_eq!(
        report.tx_data,
        vec![Datom::add(1, age, Value::Long(20), report.tx)]
    );
    assert_eq!(report.db_after.max_eid(), 1, "no new entity allocated");
}

#[test]
fn conflicting_upserts_abort_after_restart() {
    let db = init_db(
        vec![
            (1, kw(":person/name"), Value::Str("A".into())),
            (2, kw(":person/nick"), Value::Str("a".into())),
        ],
        person_config(),
    )
    .unwrap();

    let err = db
        .transact(vec![
            Op::Entity(
                EntityMap::new()
                    .id(-1i64)
                    .set(":person/name", Value::Str("A".into())),
            ),
            Op::Entity(
                EntityMap::new()
                    .id(-1i64)
                    .set(":person/nick", Value::Str("a".into())),
            ),
        ])
        .unwrap_err();
    assert!(matches!(err, DbError::TransactUpsert { .. }), "{err}");
}

#[test]
fn two_upsert_attrs_on_one_map_must_agree() {
    let db = init_db(
        vec![
            (1, kw(":person/name"), Value::Str("A".into())),
            (2, kw(":person/nick"), Value::Str("a".into())),
        ],
        person_config(),
    )
    .unwrap();

    let err = db
        .transact(vec![Op::Entity(
            EntityMap::new()
                .set(":person/name", Value::Str("A".into()))
                .set(":person/nick", Value::Str("a".into())),
        )])
        .unwrap_err();
    assert!(matches!(err, DbError::TransactUpsert { .. }));
}

#[test]
fn component_retraction_cascades() {
    let db = empty_db(person_config()).unwrap();
    let report = db
        .transact(vec![
            Op::Entity(
                EntityMap::new()
                    .id(-1i64)
                    .set(":person/child", AttrValue::Ref(EntityRef::from(-2i64))),
            ),
            Op::Entity(
                EntityMap::new()
                    .id(-2i64)
                    .set(":person/child", AttrValue::Ref(EntityRef::from(-3i64))),
            ),
            Op::Entity(
                EntityMap::new()
                    .id(-3i64)
                    .set(":person/name", Value::Str("leaf".into())),
            ),
        ])
        .unwrap();
    let db = report.db_after;
    assert_eq!(all_datoms(&db, IndexKind::Eavt).len(), 3);

    let report = db
        .transact(vec![Op::RetractEntity(EntityRef::Id(1))])
        .unwrap();
    assert!(
        all_datoms(&report.db_after, IndexKind::Eavt).is_empty(),
        "cascade should reach the leaf two hops down"
    );
    assert!(all_datoms(&report.db_after, IndexKind::Vaet).is_empty());
}

#[test]
fn retract_entity_removes_incoming_refs() {
    let db = empty_db(person_config()).unwrap();
    let db = db
        .transact(vec![
            Op::Entity(
                EntityMap::new()
                    .id(-1i64)
                    .set(":person/name", Value::Str("A".into())),
            ),
            Op::Entity(
                EntityMap::new()
                    .id(-2i64)
                    .set(":person/name", Value::Str("B".into()))
                    .set(":person/friend", AttrValue::Ref(EntityRef::from(-1i64))),
            ),
        ])
        .unwrap()
        .db_after;

    let db = db
        .transact(vec![Op::RetractEntity(EntityRef::Id(1))])
        .unwrap()
        .db_after;

    let friend = aid(&db, ":person/friend");
    let remaining = all_datoms(&db, IndexKind::Eavt);
    assert!(remaining.iter().all(|d| d.a != friend), "{remaining:?}");
    assert!(remaining.iter().all(|d| d.e != 1));
    assert_eq!(remaining.len(), 1, "entity 2 keeps its name");
}

#[test]
fn cas_replaces_then_rejects_stale_expectation() {
    let db = init_db(
        vec![(1, kw(":person/age"), Value::Long(20))],
        person_config(),
    )
    .unwrap();

    let report = db
        .transact(vec![Op::Cas(
            EntityRef::Id(1),
            kw(":person/age"),
            Some(Value::Long(20)),
            Value::Long(21),
        )])
        .unwrap();
    let age = aid(&db, ":person/age");
    assert_eq!(
        report.tx_data,
        vec![
            Datom::retract(1, age, Value::Long(20), report.tx),
            Datom::add(1, age, Value::Long(21), report.tx),
        ]
    );
    assert!(!report.tx_data[0].added);
    assert!(report.tx_data[1].added);

    let err = report
        .db_after
        .transact(vec![Op::Cas(
            EntityRef::Id(1),
            kw(":person/age"),
            Some(Value::Long(20)),
            Value::Long(22),
        )])
        .unwrap_err();
    assert!(matches!(err, DbError::TransactCas { .. }));
}

#[test]
fn index_range_and_reverse_seek() {
    let config = DbConfig::new()
        .attr(":e/id", AttrSpec::new(ValueType::Long))
        .attr(":e/tag", AttrSpec::new(ValueType::String));
    let db = empty_db(config).unwrap();

    let ops: Vec<Op> = (1..=100)
        .map(|i| {
            Op::Entity(
                EntityMap::new()
                    .set(":e/id", Value::Long(i))
                    .set(":e/tag", Value::Str("x".into())),
            )
        })
        .collect();
    let db = db.transact(ops).unwrap().db_after;

    let in_range: Vec<Datom> = db
        .index_range(&kw(":e/id"), &Value::Long(40), &Value::Long(60))
        .unwrap()
        .collect::<DbResult<_>>()
        .unwrap();
    assert_eq!(in_range.len(), 21);
    let values: Vec<i64> = in_range.iter().map(|d| d.v.as_long().unwrap()).collect();
    assert_eq!(values, (40..=60).collect::<Vec<_>>());

    let id = aid(&db, ":e/id");
    let descending: Vec<Datom> = db
        .rseek_datoms(IndexKind::Avet, &[Component::Attr(kw(":e/id"))])
        .unwrap()
        .collect::<DbResult<Vec<_>>>()
        .unwrap()
        .into_iter()
        .filter(|d| d.a == id)
        .collect();
    assert_eq!(descending.len(), 100);
    assert_eq!(descending[0].v, Value::Long(100));
    assert_eq!(descending[99].v, Value::Long(1));
}

#[test]
fn vaet_holds_exactly_the_ref_datoms() {
    let db = empty_db(person_config()).unwrap();
    let db = db
        .transact(vec![
            Op::Entity(
                EntityMap::new()
                    .id(-1i64)
                    .set(":person/name", Value::Str("A".into())),
            ),
            Op::Entity(
                EntityMap::new()
                    .id(-2i64)
                    .set(":person/name", Value::Str("B".into()))
                    .set(
                        ":person/friend",
                        AttrValue::Many(vec![AttrValue::Ref(EntityRef::from(-1i64))]),
                    ),
            ),
        ])
        .unwrap()
        .db_after;

    let vaet = all_datoms(&db, IndexKind::Vaet);
    let eavt = all_datoms(&db, IndexKind::Eavt);
    let refs: Vec<&Datom> = eavt
        .iter()
        .filter(|d| matches!(d.v, Value::Ref(_)))
        .collect();
    assert_eq!(vaet.len(), refs.len());
    assert_eq!(vaet.len(), 1);
    assert_eq!(vaet[0].e, 2);
    assert_eq!(vaet[0].v, Value::Ref(1));
}

#[test]
fn unique_identity_add_on_other_entity_rejected() {
    let db = init_db(
        vec![
            (1, kw(":person/name"), Value::Str("A".into())),
            (2, kw(":person/age"), Value::Long(9)),
        ],
        person_config(),
    )
    .unwrap();

    let err = db
        .transact(vec![Op::Add(
            EntityRef::Id(2),
            kw(":person/name"),
            AttrValue::Value(Value::Str("A".into())),
        )])
        .unwrap_err();
    assert!(matches!(err, DbError::TransactUnique { .. }));
}

#[test]
fn unique_value_attr_never_upserts() {
    let db = init_db(
        vec![(1, kw(":person/ssn"), Value::Str("123".into()))],
        person_config(),
    )
    .unwrap();

    let err = db
        .transact(vec![Op::Entity(
            EntityMap::new().set(":person/ssn", Value::Str("123".into())),
        )])
        .unwrap_err();
    assert!(matches!(err, DbError::TransactUnique { .. }));
}

#[test]
fn adds_and_retracts_are_idempotent() {
    let db = init_db(
        vec![(1, kw(":person/age"), Value::Long(20))],
        person_config(),
    )
    .unwrap();

    let report = db
        .transact(vec![Op::Add(
            EntityRef::Id(1),
            kw(":person/age"),
            AttrValue::Value(Value::Long(20)),
        )])
        .unwrap();
    assert!(report.tx_data.is_empty(), "re-adding an existing datom");
    assert_eq!(report.db_after.max_tx(), db.max_tx() + 1);

    let report = report
        .db_after
        .transact(vec![Op::Retract(
            EntityRef::Id(1),
            kw(":person/age"),
            Some(Value::Long(99)),
        )])
        .unwrap();
    assert!(report.tx_data.is_empty(), "retracting an absent datom");

    let report = report
        .db_after
        .transact(vec![Op::Retract(
            EntityRef::Id(404),
            kw(":person/age"),
            Some(Value::Long(20)),
        )])
        .unwrap();
    assert!(report.tx_data.is_empty(), "retracting on a missing entity");
}

#[test]
fn cardinality_one_replaces_with_retract_then_add() {
    let db = init_db(
        vec![(1, kw(":person/age"), Value::Long(20))],
        person_config(),
    )
    .unwrap();
    let report = db
        .transact(vec![Op::Add(
            EntityRef::Id(1),
            kw(":person/age"),
            AttrValue::Value(Value::Long(21)),
        )])
        .unwrap();
    let age = aid(&db, ":person/age");
    assert_eq!(
        report.tx_data,
        vec![
            Datom::retract(1, age, Value::Long(20), report.tx),
            Datom::add(1, age, Value::Long(21), report.tx),
        ]
    );
    assert!(!report.tx_data[0].added && report.tx_data[1].added);
}

#[test]
fn cardinality_many_deduplicates_within_and_across_transactions() {
    let db = empty_db(person_config()).unwrap();
    let db = db
        .transact(vec![
            Op::Entity(
                EntityMap::new()
                    .id(-1i64)
                    .set(":person/name", Value::Str("A".into())),
            ),
            Op::Entity(
                EntityMap::new()
                    .id(-2i64)
                    .set(":person/name", Value::Str("B".into())),
            ),
        ])
        .unwrap()
        .db_after;

    let add_friend = || {
        Op::Add(
            EntityRef::Id(2),
            kw(":person/friend"),
            AttrValue::Ref(EntityRef::Id(1)),
        )
    };
    let report = db.transact(vec![add_friend(), add_friend()]).unwrap();
    assert_eq!(report.tx_data.len(), 1, "same tx dedup");

    let report = report.db_after.transact(vec![add_friend()]).unwrap();
    assert!(report.tx_data.is_empty(), "across tx dedup");
}

#[test]
fn retract_without_value_clears_the_attribute() {
    let db = empty_db(person_config()).unwrap();
    let db = db
        .transact(vec![
            Op::Entity(
                EntityMap::new()
                    .id(-1i64)
                    .set(":person/name", Value::Str("A".into())),
            ),
            Op::Entity(
                EntityMap::new()
                    .id(-2i64)
                    .set(":person/name", Value::Str("B".into())),
            ),
            Op::Add(
                EntityRef::from(-2i64),
                kw(":person/friend"),
                AttrValue::Many(vec![
                    AttrValue::Ref(EntityRef::from(-1i64)),
                    AttrValue::Ref(EntityRef::from(-2i64)),
                ]),
            ),
        ])
        .unwrap()
        .db_after;

    let report = db
        .transact(vec![Op::Retract(EntityRef::Id(2), kw(":person/friend"), None)])
        .unwrap();
    assert_eq!(report.tx_data.len(), 2);
    assert!(report.tx_data.iter().all(|d| !d.added));

    let friend = aid(&db, ":person/friend");
    assert!(all_datoms(&report.db_after, IndexKind::Eavt)
        .iter()
        .all(|d| d.a != friend));
}

#[test]
fn reverse_ref_swaps_subject_and_object() {
    let db = init_db(
        vec![(1, kw(":person/name"), Value::Str("parent".into()))],
        person_config(),
    )
    .unwrap();

    let report = db
        .transact(vec![Op::Entity(
            EntityMap::new()
                .id(-1i64)
                .set(":person/name", Value::Str("kid".into()))
                .set(":person/_child", AttrValue::Ref(EntityRef::Id(1))),
        )])
        .unwrap();

    let child = aid(&db, ":person/child");
    let kid = report.tempids[&TempId::Int(-1)];
    assert!(report
        .tx_data
        .iter()
        .any(|d| d.e == 1 && d.a == child && d.v == Value::Ref(kid)));
}

#[test]
fn nested_component_map_links_back_to_parent() {
    let db = empty_db(person_config()).unwrap();
    let report = db
        .transact(vec![Op::Entity(
            EntityMap::new()
                .id(-1i64)
                .set(":person/name", Value::Str("parent".into()))
                .set(
                    ":person/child",
                    AttrValue::Nested(
                        EntityMap::new().set(":person/name", Value::Str("kid".into())),
                    ),
                ),
        )])
        .unwrap();

    let child = aid(&db, ":person/child");
    let parent = report.tempids[&TempId::Int(-1)];
    let link = report
        .tx_data
        .iter()
        .find(|d| d.a == child)
        .expect("child link datom");
    assert_eq!(link.e, parent);
    let Value::Ref(kid) = link.v else {
        panic!("child link should be a ref")
    };
    assert!(report
        .tx_data
        .iter()
        .any(|d| d.e == kid && d.v == Value::Str("kid".into())));

    // Retracting the parent cascades into the nested child.
    let after = report
        .db_after
        .transact(vec![Op::RetractEntity(EntityRef::Id(parent))])
        .unwrap()
        .db_after;
    assert!(all_datoms(&after, IndexKind::Eavt).is_empty());
}

#[test]
fn string_tempids_and_tx_sentinel_resolve() {
    let db = empty_db(person_config()).unwrap();
    let report = db
        .transact(vec![
            Op::Entity(
                EntityMap::new()
                    .id("alice")
                    .set(":person/name", Value::Str("Alice".into())),
            ),
            Op::Entity(
                EntityMap::new()
                    .id("datomic.tx")
                    .set(":person/age", Value::Long(0)),
            ),
        ])
        .unwrap();

    let alice = report.tempids[&TempId::Str("alice".into())];
    assert_eq!(alice, 1);
    let age = aid(&db, ":person/age");
    assert!(report
        .tx_data
        .iter()
        .any(|d| d.e == report.tx && d.a == age), "tx entity carries the datom");
}

#[test]
fn lookup_ref_as_entity_id() {
    let db = init_db(
        vec![(1, kw(":person/name"), Value::Str("A".into()))],
        person_config(),
    )
    .unwrap();
    let report = db
        .transact(vec![Op::Entity(
            EntityMap::new()
                .id(EntityRef::Lookup(
                    kw(":person/name"),
                    Value::Str("A".into()),
                ))
                .set(":person/age", Value::Long(44)),
        )])
        .unwrap();
    assert!(report.tx_data.iter().all(|d| d.e == 1));
}

#[test]
fn stored_transaction_function_splices_ops() {
    let db = empty_db(person_config()).unwrap();
    db.register_tx_fn(
        ":impl/grow",
        Arc::new(|db: &Db, args: &[Value]| {
            let e = args[0].as_ref_id().or(args[0].as_long().map(|n| n as u64)).unwrap();
            let by = args[1].as_long().unwrap();
            let current = db
                .datoms(
                    IndexKind::Eavt,
                    &[Component::Entity(e), Component::Attr(kw(":person/age"))],
                )?
                .next()
                .transpose()?
                .and_then(|d| d.v.as_long())
                .unwrap_or(0);
            Ok(vec![Op::Add(
                EntityRef::Id(e),
                kw(":person/age"),
                AttrValue::Value(Value::Long(current + by)),
            )])
        }),
    );

    let db = db
        .transact(vec![
            Op::Entity(
                EntityMap::new()
                    .id(-1i64)
                    .set(":person/name", Value::Str("A".into()))
                    .set(":person/age", Value::Long(40)),
            ),
            Op::Entity(
                EntityMap::new()
                    .id(-2i64)
                    .set(":db/ident", Value::Keyword(kw(":person/grow")))
                    .set(":db/fn", Value::Keyword(kw(":impl/grow"))),
            ),
        ])
        .unwrap()
        .db_after;

    let report = db
        .transact(vec![Op::Call(
            kw(":person/grow"),
            vec![Value::Long(1), Value::Long(2)],
        )])
        .unwrap();
    let age = aid(&db, ":person/age");
    assert!(report
        .tx_data
        .iter()
        .any(|d| d.added && d.a == age && d.v == Value::Long(42)));
}

#[test]
fn search_dispatches_on_bound_components() {
    let db = init_db(
        vec![
            (1, kw(":person/name"), Value::Str("A".into())),
            (1, kw(":person/age"), Value::Long(20)),
            (2, kw(":person/name"), Value::Str("B".into())),
        ],
        person_config(),
    )
    .unwrap();

    let by_entity = db.search(Some(1), None, None).unwrap();
    assert_eq!(by_entity.len(), 2);

    let by_av = db
        .search(None, Some(&kw(":person/name")), Some(&Value::Str("B".into())))
        .unwrap();
    assert_eq!(by_av.len(), 1);
    assert_eq!(by_av[0].e, 2);

    let unknown_attr = db.search(None, Some(&kw(":no/such")), None).unwrap();
    assert!(unknown_attr.is_empty());

    let everything = db.search(None, None, None).unwrap();
    assert_eq!(everything.len(), 3);
}

#[test]
fn unknown_transaction_function_is_syntax_error() {
    let db = empty_db(person_config()).unwrap();
    let err = db
        .transact(vec![Op::Call(kw(":no/such-fn"), vec![])])
        .unwrap_err();
    assert!(matches!(err, DbError::TransactSyntax { .. }));
}

#[test]
fn init_db_round_trips_the_seed_set() {
    let seed = vec![
        (1, kw(":person/name"), Value::Str("A".into())),
        (1, kw(":person/age"), Value::Long(20)),
        (2, kw(":person/name"), Value::Str("B".into())),
    ];
    let db = init_db(seed.clone(), person_config()).unwrap();

    let scanned: HashSet<(u64, u64, Value)> = all_datoms(&db, IndexKind::Eavt)
        .into_iter()
        .map(|d| (d.e, d.a, d.v))
        .collect();
    let expected: HashSet<(u64, u64, Value)> = seed
        .into_iter()
        .map(|(e, a, v)| (e, db.schema()[&a].aid, v))
        .collect();
    assert_eq!(scanned, expected);
}

#[test]
fn max_eid_and_max_tx_track_commits() {
    let db = empty_db(person_config()).unwrap();
    let r1 = db
        .transact(vec![Op::Entity(
            EntityMap::new()
                .id(-1i64)
                .set(":person/name", Value::Str("A".into())),
        )])
        .unwrap();
    assert_eq!(r1.db_after.max_tx(), TX0 + 1);
    assert_eq!(r1.db_after.max_eid(), 1);

    let r2 = r1
        .db_after
        .transact(vec![Op::Add(
            EntityRef::Id(10),
            kw(":person/age"),
            AttrValue::Value(Value::Long(5)),
        )])
        .unwrap();
    assert_eq!(r2.db_after.max_tx(), TX0 + 2);
    assert_eq!(r2.db_after.max_eid(), 10, "explicit ids raise max-eid");
}

#[test]
fn value_type_mismatch_rejected() {
    let db = empty_db(person_config()).unwrap();
    let err = db
        .transact(vec![Op::Add(
            EntityRef::Id(1),
            kw(":person/age"),
            AttrValue::Value(Value::Str("old".into())),
        )])
        .unwrap_err();
    assert!(matches!(err, DbError::TransactSyntax { .. }));
}

#[test]
fn seek_datoms_continues_past_the_prefix() {
    let config = DbConfig::new()
        .attr(":e/id", AttrSpec::new(ValueType::Long))
        .attr(":e/tag", AttrSpec::new(ValueType::String));
    let db = empty_db(config).unwrap();
    let db = db
        .transact(vec![Op::Entity(
            EntityMap::new()
                .set(":e/id", Value::Long(7))
                .set(":e/tag", Value::Str("x".into())),
        )])
        .unwrap()
        .db_after;

    // Seeking from :e/id in AEVT reaches the :e/tag datoms too.
    let from_id: Vec<Datom> = db
        .seek_datoms(IndexKind::Aevt, &[Component::Attr(kw(":e/id"))])
        .unwrap()
        .collect::<DbResult<_>>()
        .unwrap();
    assert_eq!(from_id.len(), 2);

    // A plain `datoms` call stays inside the bound attribute.
    let only_id: Vec<Datom> = db
        .datoms(IndexKind::Aevt, &[Component::Attr(kw(":e/id"))])
        .unwrap()
        .collect::<DbResult<_>>()
        .unwrap();
    assert_eq!(only_id.len(), 1);
}
