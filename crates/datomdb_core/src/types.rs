//! Id spaces and tempids.

/// An entity id. Positive, below [`TX0`].
pub type Eid = u64;

/// An attribute id. Small, process-stable, assigned at first registration.
pub type Aid = u64;

/// A transaction id. Lives above every entity id.
pub type TxId = u64;

/// Minimum entity id.
pub const E0: Eid = 0;

/// Maximum entity id. Transaction ids start directly above.
pub const EMAX: Eid = 0x0000_7fff_ffff_ffff;

/// First transaction id; `TX0 > EMAX` bounds the two id spaces.
pub const TX0: TxId = EMAX + 1;

/// Maximum transaction id.
pub const TXMAX: TxId = u64::MAX;

/// Canonical token under which the current transaction id is reported in
/// a transaction report's tempid map.
pub const CURRENT_TX_TOKEN: &str = "db/current-tx";

/// A placeholder entity id resolved by the transaction pipeline.
///
/// Negative integers and strings are tempids; every occurrence of the
/// same tempid inside one transaction resolves to the same entity id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TempId {
    /// Numeric tempid; always negative.
    Int(i64),
    /// String tempid.
    Str(String),
}

impl TempId {
    /// Whether a string is one of the current-transaction tokens.
    #[must_use]
    pub fn is_tx_token(s: &str) -> bool {
        matches!(
            s.strip_prefix(':').unwrap_or(s),
            "db/current-tx" | "datomic.tx" | "datalevin.tx"
        )
    }
}

impl std::fmt::Display for TempId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TempId::Int(n) => write!(f, "{n}"),
            TempId::Str(s) => write!(f, "{s:?}"),
        }
    }
}
