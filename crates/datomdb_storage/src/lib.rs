//! # datomdb storage
//!
//! Wrapper over the embedded ordered B-tree engine.
//!
//! This crate owns the engine environment: the named sub-databases, atomic
//! write batches, MVCC read snapshots, and forward/backward range scans.
//! It knows nothing about datoms — keys and values are opaque byte
//! strings; the core crate owns all key-format interpretation.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod error;
mod range;
mod tables;

pub use engine::{Engine, ScanIter, Snapshot, WriteOp};
pub use error::{StorageError, StorageResult};
pub use range::KeyRange;
pub use tables::SubDb;

/// Maximum length in bytes of an index key.
pub const MAX_KEY_LEN: usize = 511;
