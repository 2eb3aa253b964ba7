//! Sub-database definitions.
//!
//! All sub-databases map byte-string keys to byte-string values; key
//! composition lives in the core crate's storage layer.

use redb::TableDefinition;

type ByteTable = TableDefinition<'static, &'static [u8], &'static [u8]>;

/// The named sub-databases of one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubDb {
    /// EAVT index: `e(8) ∥ a(8) ∥ v(typed)` → `tx(8)`.
    Eav,
    /// AEVT index: `a(8) ∥ e(8) ∥ v(typed)` → `tx(8)`.
    Aev,
    /// AVET index: `a(8) ∥ v(typed) ∥ e(8)` → `tx(8)`.
    Ave,
    /// VAET reverse-ref index: `v(8) ∥ a(8) ∥ e(8)` → `tx(8)`.
    Vae,
    /// Attribute registry: keyword string → schema record.
    Schema,
    /// Environment metadata: `max-aid`, `version`.
    Meta,
}

impl SubDb {
    /// Every sub-database, in stable order.
    pub const ALL: [SubDb; 6] = [
        SubDb::Eav,
        SubDb::Aev,
        SubDb::Ave,
        SubDb::Vae,
        SubDb::Schema,
        SubDb::Meta,
    ];

    pub(crate) fn def(self) -> ByteTable {
        match self {
            SubDb::Eav => TableDefinition::new("eav"),
            SubDb::Aev => TableDefinition::new("aev"),
            SubDb::Ave => TableDefinition::new("ave"),
            SubDb::Vae => TableDefinition::new("vae"),
            SubDb::Schema => TableDefinition::new("schema"),
            SubDb::Meta => TableDefinition::new("meta"),
        }
    }

    pub(crate) fn slot(self) -> usize {
        match self {
            SubDb::Eav => 0,
            SubDb::Aev => 1,
            SubDb::Ave => 2,
            SubDb::Vae => 3,
            SubDb::Schema => 4,
            SubDb::Meta => 5,
        }
    }
}
