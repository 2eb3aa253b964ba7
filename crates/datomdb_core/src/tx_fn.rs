//! Stored transaction functions.
//!
//! Serialized code stays out of scope: a `:db/fn` value is a keyword
//! naming an implementation registered here at startup. Invoking a
//! non-built-in operation keyword resolves the function entity, loads
//! its `:db/fn` name, and calls the registered implementation with the
//! database snapshot and arguments; the returned operations are spliced
//! into the transaction.

use std::collections::HashMap;
use std::sync::Arc;

use datomdb_codec::{Keyword, Value};
use parking_lot::RwLock;

use crate::database::Db;
use crate::error::DbResult;
use crate::transact::Op;

/// A registered transaction function.
///
/// Receives the database snapshot the transaction runs against and the
/// call arguments, and returns operations to splice into the stream.
pub type TxFn = Arc<dyn Fn(&Db, &[Value]) -> DbResult<Vec<Op>> + Send + Sync>;

/// Process-wide registry of named transaction functions.
pub(crate) struct TxFnRegistry {
    fns: RwLock<HashMap<Keyword, TxFn>>,
}

impl TxFnRegistry {
    pub fn new() -> Self {
        Self {
            fns: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `f` under `name`, replacing any previous registration.
    pub fn register(&self, name: Keyword, f: TxFn) {
        self.fns.write().insert(name, f);
    }

    /// Looks up a registered function.
    pub fn get(&self, name: &Keyword) -> Option<TxFn> {
        self.fns.read().get(name).cloned()
    }
}
