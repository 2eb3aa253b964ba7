//! Schema: attribute declarations, validation, and the derived reverse
//! index over schema properties.

use std::collections::HashSet;

use datomdb_codec::{Keyword, Value};

use crate::error::{DbError, DbResult};
use crate::types::Aid;

/// Attribute id of the built-in `:db/ident` attribute.
pub const IDENT_AID: Aid = 1;

/// Attribute id of the built-in `:db/fn` attribute.
pub const FN_AID: Aid = 2;

/// First attribute id handed out to user attributes.
pub const FIRST_USER_AID: Aid = 3;

/// The declared type of an attribute's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// `:db.type/keyword`
    Keyword,
    /// `:db.type/symbol`
    Symbol,
    /// `:db.type/string`
    String,
    /// `:db.type/boolean`
    Boolean,
    /// `:db.type/long`
    Long,
    /// `:db.type/double`
    Double,
    /// `:db.type/float`
    Float,
    /// `:db.type/ref`
    Ref,
    /// `:db.type/instant`
    Instant,
    /// `:db.type/uuid`
    Uuid,
    /// `:db.type/bytes`
    Bytes,
}

impl ValueType {
    /// The value type a concrete value conforms to.
    #[must_use]
    pub fn of(value: &Value) -> ValueType {
        match value {
            Value::Keyword(_) => ValueType::Keyword,
            Value::Symbol(_) => ValueType::Symbol,
            Value::Str(_) => ValueType::String,
            Value::Bool(_) => ValueType::Boolean,
            Value::Long(_) => ValueType::Long,
            Value::Double(_) => ValueType::Double,
            Value::Float(_) => ValueType::Float,
            Value::Ref(_) => ValueType::Ref,
            Value::Instant(_) => ValueType::Instant,
            Value::Uuid(_) => ValueType::Uuid,
            Value::Bytes(_) => ValueType::Bytes,
        }
    }

    fn code(self) -> u8 {
        match self {
            ValueType::Keyword => 1,
            ValueType::Symbol => 2,
            ValueType::String => 3,
            ValueType::Boolean => 4,
            ValueType::Long => 5,
            ValueType::Double => 6,
            ValueType::Float => 7,
            ValueType::Ref => 8,
            ValueType::Instant => 9,
            ValueType::Uuid => 10,
            ValueType::Bytes => 11,
        }
    }

    fn from_code(code: u8) -> Option<ValueType> {
        Some(match code {
            1 => ValueType::Keyword,
            2 => ValueType::Symbol,
            3 => ValueType::String,
            4 => ValueType::Boolean,
            5 => ValueType::Long,
            6 => ValueType::Double,
            7 => ValueType::Float,
            8 => ValueType::Ref,
            9 => ValueType::Instant,
            10 => ValueType::Uuid,
            11 => ValueType::Bytes,
            _ => return None,
        })
    }
}

/// How many values of an attribute one entity may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Cardinality {
    /// At most one value per entity.
    #[default]
    One,
    /// Any number of values per entity.
    Many,
}

/// Uniqueness constraint on an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unique {
    /// Unique and upsertable: transacting an entity map carrying this
    /// attribute resolves to the existing owner.
    Identity,
    /// Unique but not upsertable.
    Value,
}

/// A user-declared attribute specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrSpec {
    /// Declared value type.
    pub value_type: ValueType,
    /// Cardinality, default one.
    pub cardinality: Cardinality,
    /// Uniqueness constraint, if any.
    pub unique: Option<Unique>,
    /// Whether retracting the owner cascades to the referenced entity.
    /// Implies `value_type == Ref`.
    pub component: bool,
}

impl AttrSpec {
    /// Creates a spec with the given value type and defaults otherwise.
    #[must_use]
    pub fn new(value_type: ValueType) -> Self {
        Self {
            value_type,
            cardinality: Cardinality::One,
            unique: None,
            component: false,
        }
    }

    /// Makes the attribute cardinality-many.
    #[must_use]
    pub const fn many(mut self) -> Self {
        self.cardinality = Cardinality::Many;
        self
    }

    /// Adds a unique-identity constraint.
    #[must_use]
    pub const fn unique_identity(mut self) -> Self {
        self.unique = Some(Unique::Identity);
        self
    }

    /// Adds a unique-value constraint.
    #[must_use]
    pub const fn unique_value(mut self) -> Self {
        self.unique = Some(Unique::Value);
        self
    }

    /// Marks the attribute as a component reference.
    #[must_use]
    pub const fn component(mut self) -> Self {
        self.component = true;
        self
    }

    /// Checks the option combination.
    ///
    /// # Errors
    ///
    /// Returns `SchemaValidation` if the attribute is a component but not
    /// ref-typed.
    pub fn validate(&self, attr: &Keyword) -> DbResult<()> {
        if self.component && self.value_type != ValueType::Ref {
            return Err(DbError::schema_validation(
                attr.clone(),
                "component attribute must have ref value type",
            ));
        }
        Ok(())
    }
}

/// A registered attribute: its declared spec plus the assigned id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrSchema {
    /// The declared options.
    pub spec: AttrSpec,
    /// Process-stable attribute id.
    pub aid: Aid,
}

impl AttrSchema {
    /// Whether values of this attribute are entity references.
    #[must_use]
    pub fn is_ref(&self) -> bool {
        self.spec.value_type == ValueType::Ref
    }

    /// Whether the attribute is cardinality-many.
    #[must_use]
    pub fn is_many(&self) -> bool {
        self.spec.cardinality == Cardinality::Many
    }

    /// Whether the attribute carries any uniqueness constraint.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.spec.unique.is_some()
    }

    /// Checks that a value conforms to the declared value type.
    ///
    /// # Errors
    ///
    /// Returns `TransactSyntax` on mismatch.
    pub fn check_value(&self, attr: &Keyword, value: &Value) -> DbResult<()> {
        if ValueType::of(value) == self.spec.value_type {
            return Ok(());
        }
        Err(DbError::transact_syntax(format!(
            "value {value} does not conform to {attr}, expected {:?}",
            self.spec.value_type
        )))
    }

    /// Serializes the registry record stored in the schema sub-database.
    #[must_use]
    pub fn to_record(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        buf.push(self.spec.value_type.code());
        buf.push(match self.spec.cardinality {
            Cardinality::One => 0,
            Cardinality::Many => 1,
        });
        buf.push(match self.spec.unique {
            None => 0,
            Some(Unique::Identity) => 1,
            Some(Unique::Value) => 2,
        });
        buf.push(u8::from(self.spec.component));
        buf.extend_from_slice(&self.aid.to_be_bytes());
        buf
    }

    /// Deserializes a registry record.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` on a malformed record.
    pub fn from_record(attr: &Keyword, record: &[u8]) -> DbResult<Self> {
        let bad = || DbError::invalid_format(format!("malformed schema record for {attr}"));
        if record.len() != 12 {
            return Err(bad());
        }
        let value_type = ValueType::from_code(record[0]).ok_or_else(bad)?;
        let cardinality = match record[1] {
            0 => Cardinality::One,
            1 => Cardinality::Many,
            _ => return Err(bad()),
        };
        let unique = match record[2] {
            0 => None,
            1 => Some(Unique::Identity),
            2 => Some(Unique::Value),
            _ => return Err(bad()),
        };
        let component = match record[3] {
            0 => false,
            1 => true,
            _ => return Err(bad()),
        };
        let aid = u64::from_be_bytes(record[4..12].try_into().expect("8-byte slice"));
        Ok(Self {
            spec: AttrSpec {
                value_type,
                cardinality,
                unique,
                component,
            },
            aid,
        })
    }
}

/// The implicit schema merged into every database.
#[must_use]
pub fn builtin_attrs() -> Vec<(Keyword, AttrSchema)> {
    vec![
        (
            Keyword::new(":db/ident"),
            AttrSchema {
                spec: AttrSpec::new(ValueType::Keyword).unique_identity(),
                aid: IDENT_AID,
            },
        ),
        (
            Keyword::new(":db/fn"),
            AttrSchema {
                spec: AttrSpec::new(ValueType::Keyword).unique_value(),
                aid: FN_AID,
            },
        ),
    ]
}

/// Reverse schema index: which attribute ids carry which property.
#[derive(Debug, Clone, Default)]
pub struct Rschema {
    /// `:db.unique/identity` attributes.
    pub unique_identity: HashSet<Aid>,
    /// `:db.unique/value` attributes.
    pub unique_value: HashSet<Aid>,
    /// `:db.cardinality/many` attributes.
    pub many: HashSet<Aid>,
    /// `:db.type/ref` attributes.
    pub ref_type: HashSet<Aid>,
    /// `:db/isComponent` attributes.
    pub component: HashSet<Aid>,
}

impl Rschema {
    /// Builds the reverse index over registered attributes.
    pub fn build<'a>(attrs: impl IntoIterator<Item = &'a AttrSchema>) -> Self {
        let mut r = Rschema::default();
        for attr in attrs {
            match attr.spec.unique {
                Some(Unique::Identity) => {
                    r.unique_identity.insert(attr.aid);
                }
                Some(Unique::Value) => {
                    r.unique_value.insert(attr.aid);
                }
                None => {}
            }
            if attr.is_many() {
                r.many.insert(attr.aid);
            }
            if attr.is_ref() {
                r.ref_type.insert(attr.aid);
            }
            if attr.spec.component {
                r.component.insert(attr.aid);
            }
        }
        r
    }
}
