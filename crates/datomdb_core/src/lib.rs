//! # datomdb core
//!
//! The transactional engine of datomdb.
//!
//! This crate provides:
//! - The datom/index data model and its four sorted views
//! - Schema declaration, validation, and the persistent attribute registry
//! - Entity resolution: ids, idents, lookup refs, tempids, and upserts
//! - The transaction pipeline that normalizes heterogeneous operations
//!   into primitive add/retract datoms
//! - The storage layer mapping datoms onto the ordered key-value engine
//!
//! The query evaluator and the mutable connection wrapper live above this
//! crate and consume its public surface: [`empty_db`] / [`init_db`],
//! [`Db::transact`], and the four index-access primitives
//! ([`Db::datoms`], [`Db::seek_datoms`], [`Db::rseek_datoms`],
//! [`Db::index_range`]).

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod database;
mod datom;
mod error;
mod resolve;
mod schema;
mod store;
mod transact;
mod tx_fn;
mod types;

pub use database::{empty_db, init_db, Db, DbConfig};
pub use datom::{Component, Datom, IndexKind};
pub use error::{DbError, DbResult};
pub use resolve::EntityRef;
pub use schema::{AttrSchema, AttrSpec, Cardinality, Rschema, Unique, ValueType};
pub use store::DatomIter;
pub use transact::{AttrValue, EntityMap, Op, TxReport};
pub use tx_fn::TxFn;
pub use types::{Aid, Eid, TempId, TxId, CURRENT_TX_TOKEN, E0, EMAX, TX0, TXMAX};

pub use datomdb_codec::{Keyword, Value};
