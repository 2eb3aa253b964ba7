//! Error types for the core engine.

use datomdb_codec::{CodecError, Keyword, Value};
use datomdb_storage::StorageError;
use thiserror::Error;

use crate::types::Eid;

/// Result type for core operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors that can occur in the core engine.
///
/// Every user-facing failure carries its kind and the data needed to act
/// on it; nothing is swallowed. The first error inside a transaction
/// aborts the whole batch with no on-disk effect.
#[derive(Debug, Error)]
pub enum DbError {
    /// Storage wrapper error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Value codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// On-disk format or version mismatch.
    #[error("invalid database format: {message}")]
    InvalidFormat {
        /// Description of the mismatch.
        message: String,
    },

    /// A schema option is invalid, e.g. a component attribute that is
    /// not ref-typed.
    #[error("schema validation failed for {attr}: {message}")]
    SchemaValidation {
        /// The attribute being declared.
        attr: Keyword,
        /// Description of the violation.
        message: String,
    },

    /// An operation is malformed: unrecognized form, bad entity type,
    /// value of the wrong type for the attribute.
    #[error("bad transaction operation: {message}")]
    TransactSyntax {
        /// Description of the problem.
        message: String,
    },

    /// A unique attribute already carries this value on another entity.
    #[error("unique constraint violated on {attr}: value {value} already belongs to entity {existing}")]
    TransactUnique {
        /// The unique attribute.
        attr: Keyword,
        /// The conflicting value.
        value: Value,
        /// The entity that already owns the value.
        existing: Eid,
    },

    /// Upsert resolution produced two different entity ids.
    #[error("conflicting upsert: {message} (resolved to both {left} and {right})")]
    TransactUpsert {
        /// Description of what conflicted.
        message: String,
        /// One resolved entity id.
        left: Eid,
        /// The other resolved entity id.
        right: Eid,
    },

    /// Compare-and-swap precondition failed.
    #[error("compare-and-swap failed on entity {e}, attribute {attr}: expected {expected:?}, found {found:?}")]
    TransactCas {
        /// The entity.
        e: Eid,
        /// The attribute.
        attr: Keyword,
        /// The value the caller expected.
        expected: Option<Value>,
        /// The value actually present.
        found: Option<Value>,
    },

    /// A `:db/id` or entity position held something that is not an
    /// entity reference.
    #[error("bad entity id: {message}")]
    EntityIdSyntax {
        /// Description of the problem.
        message: String,
    },

    /// Strict entity resolution found no match.
    #[error("no entity found for {who}")]
    EntityIdMissing {
        /// The reference that failed to resolve.
        who: String,
    },

    /// A lookup ref is malformed.
    #[error("bad lookup ref: {message}")]
    LookupRefSyntax {
        /// Description of the problem.
        message: String,
    },

    /// A lookup ref names an attribute without a unique constraint.
    #[error("lookup ref attribute {attr} is not unique")]
    LookupRefUnique {
        /// The non-unique attribute.
        attr: Keyword,
    },

    /// Index access was given components inconsistent with the index's
    /// field order.
    #[error("bad index components: {message}")]
    IndexComponents {
        /// Description of the mismatch.
        message: String,
    },
}

impl DbError {
    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates a schema validation error.
    pub fn schema_validation(attr: Keyword, message: impl Into<String>) -> Self {
        Self::SchemaValidation {
            attr,
            message: message.into(),
        }
    }

    /// Creates a transaction syntax error.
    pub fn transact_syntax(message: impl Into<String>) -> Self {
        Self::TransactSyntax {
            message: message.into(),
        }
    }

    /// Creates an entity id syntax error.
    pub fn entity_id_syntax(message: impl Into<String>) -> Self {
        Self::EntityIdSyntax {
            message: message.into(),
        }
    }

    /// Creates an entity id missing error.
    pub fn entity_id_missing(who: impl Into<String>) -> Self {
        Self::EntityIdMissing { who: who.into() }
    }

    /// Creates a lookup ref syntax error.
    pub fn lookup_ref_syntax(message: impl Into<String>) -> Self {
        Self::LookupRefSyntax {
            message: message.into(),
        }
    }
}
