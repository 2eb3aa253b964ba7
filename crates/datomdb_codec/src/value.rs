//! Typed values and keywords.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Type tags, one byte each, prefixed to every encoded value.
///
/// The tag participates in key order: values of different types sort by
/// tag first. Tag values are part of the on-disk format and must not be
/// renumbered.
pub(crate) mod tag {
    pub const LONG: u8 = 0x01;
    pub const DOUBLE: u8 = 0x02;
    pub const FLOAT: u8 = 0x03;
    pub const REF: u8 = 0x04;
    pub const INSTANT: u8 = 0x05;
    pub const KEYWORD: u8 = 0x06;
    pub const SYMBOL: u8 = 0x07;
    pub const STR: u8 = 0x08;
    pub const UUID: u8 = 0x09;
    pub const BOOL: u8 = 0x0a;
    pub const BYTES: u8 = 0x0b;
}

/// A `:namespace/name` identifier.
///
/// Keywords name attributes and enumerated values. The canonical internal
/// form is the bare `namespace/name` string (no leading colon), which is
/// also the encoded form, so the derived ordering on the inner string
/// agrees with encoded byte order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Keyword(String);

impl Keyword {
    /// Creates a keyword from its full name, with or without the leading
    /// colon: `"person/name"`, `":person/name"`, and `":db/id"` all work.
    pub fn new(full: impl AsRef<str>) -> Self {
        let s = full.as_ref();
        Self(s.strip_prefix(':').unwrap_or(s).to_string())
    }

    /// Creates a keyword from namespace and name parts.
    pub fn namespaced(ns: &str, name: &str) -> Self {
        Self(format!("{ns}/{name}"))
    }

    /// The namespace part, if any.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.0.split_once('/').map(|(ns, _)| ns)
    }

    /// The name part (after the namespace separator).
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.split_once('/').map_or(&self.0, |(_, name)| name)
    }

    /// The canonical `namespace/name` form without the leading colon.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is reverse-ref shorthand: the name part starts with
    /// an underscore, as in `:person/_child`.
    #[must_use]
    pub fn is_reverse(&self) -> bool {
        self.name().starts_with('_')
    }

    /// The straight attribute behind a reverse-ref keyword:
    /// `:person/_child` becomes `:person/child`.
    #[must_use]
    pub fn direct(&self) -> Keyword {
        match self.namespace() {
            Some(ns) => Keyword::namespaced(ns, self.name().trim_start_matches('_')),
            None => Keyword::new(self.name().trim_start_matches('_')),
        }
    }

    /// The reverse-ref form of a straight attribute:
    /// `:person/child` becomes `:person/_child`.
    #[must_use]
    pub fn reverse(&self) -> Keyword {
        match self.namespace() {
            Some(ns) => Keyword::namespaced(ns, &format!("_{}", self.name())),
            None => Keyword::new(format!("_{}", self.name())),
        }
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.0)
    }
}

impl From<&str> for Keyword {
    fn from(s: &str) -> Self {
        Keyword::new(s)
    }
}

impl From<String> for Keyword {
    fn from(s: String) -> Self {
        Keyword::new(s)
    }
}

/// A typed datom value.
///
/// The variant set is closed over the declared schema value types. Floats
/// compare and hash by their IEEE-754 bit-level total order so that
/// `Value` can be `Eq` and agree with the codec's byte order; instants
/// carry millisecond precision, matching their encoded form.
#[derive(Debug, Clone)]
pub enum Value {
    /// A keyword, e.g. `:person/name`.
    Keyword(Keyword),
    /// A bare symbol.
    Symbol(String),
    /// A UTF-8 string.
    Str(String),
    /// A boolean.
    Bool(bool),
    /// A 64-bit signed integer.
    Long(i64),
    /// A 64-bit IEEE-754 float.
    Double(f64),
    /// A 32-bit IEEE-754 float.
    Float(f32),
    /// A reference to another entity.
    Ref(u64),
    /// A point in time, millisecond precision.
    Instant(DateTime<Utc>),
    /// A UUID.
    Uuid(Uuid),
    /// An opaque byte string.
    Bytes(Vec<u8>),
}

impl Value {
    /// The one-byte type tag this value encodes with.
    #[must_use]
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Value::Long(_) => tag::LONG,
            Value::Double(_) => tag::DOUBLE,
            Value::Float(_) => tag::FLOAT,
            Value::Ref(_) => tag::REF,
            Value::Instant(_) => tag::INSTANT,
            Value::Keyword(_) => tag::KEYWORD,
            Value::Symbol(_) => tag::SYMBOL,
            Value::Str(_) => tag::STR,
            Value::Uuid(_) => tag::UUID,
            Value::Bool(_) => tag::BOOL,
            Value::Bytes(_) => tag::BYTES,
        }
    }

    /// A short human-readable name for the value's type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Keyword(_) => "keyword",
            Value::Symbol(_) => "symbol",
            Value::Str(_) => "string",
            Value::Bool(_) => "boolean",
            Value::Long(_) => "long",
            Value::Double(_) => "double",
            Value::Float(_) => "float",
            Value::Ref(_) => "ref",
            Value::Instant(_) => "instant",
            Value::Uuid(_) => "uuid",
            Value::Bytes(_) => "bytes",
        }
    }

    /// Get this value as an entity reference, if it is one.
    #[must_use]
    pub fn as_ref_id(&self) -> Option<u64> {
        match self {
            Value::Ref(e) => Some(*e),
            _ => None,
        }
    }

    /// Get this value as a keyword, if it is one.
    #[must_use]
    pub fn as_keyword(&self) -> Option<&Keyword> {
        match self {
            Value::Keyword(k) => Some(k),
            _ => None,
        }
    }

    /// Get this value as a string slice, if it is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as a long, if it is one.
    #[must_use]
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(n) => Some(*n),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    /// Total order agreeing with the byte order of the encoded form:
    /// type tag first, then per-type content order.
    fn cmp(&self, other: &Self) -> Ordering {
        match self.tag().cmp(&other.tag()) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match (self, other) {
            (Value::Long(a), Value::Long(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Ref(a), Value::Ref(b)) => a.cmp(b),
            (Value::Instant(a), Value::Instant(b)) => {
                a.timestamp_millis().cmp(&b.timestamp_millis())
            }
            (Value::Keyword(a), Value::Keyword(b)) => a.as_str().as_bytes().cmp(b.as_str().as_bytes()),
            (Value::Symbol(a), Value::Symbol(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::Str(a), Value::Str(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::Uuid(a), Value::Uuid(b)) => a.as_bytes().cmp(b.as_bytes()),
            // Encoded as 0x01 for true, 0x02 for false, so true sorts first.
            (Value::Bool(a), Value::Bool(b)) => b.cmp(a),
            // Length-prefixed on disk, so shorter byte strings sort first.
            (Value::Bytes(a), Value::Bytes(b)) => match a.len().cmp(&b.len()) {
                Ordering::Equal => a.cmp(b),
                ord => ord,
            },
            _ => unreachable!("equal tags imply equal variants"),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.tag());
        match self {
            Value::Long(n) => n.hash(state),
            Value::Double(d) => d.to_bits().hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Ref(e) => e.hash(state),
            Value::Instant(t) => t.timestamp_millis().hash(state),
            Value::Keyword(k) => k.hash(state),
            Value::Symbol(s) | Value::Str(s) => s.hash(state),
            Value::Uuid(u) => u.hash(state),
            Value::Bool(b) => b.hash(state),
            Value::Bytes(b) => b.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Keyword(k) => write!(f, "{k}"),
            Value::Symbol(s) => write!(f, "{s}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Long(n) => write!(f, "{n}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Ref(e) => write!(f, "#ref {e}"),
            Value::Instant(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Uuid(u) => write!(f, "{u}"),
            Value::Bytes(b) => write!(f, "#bytes[{}]", b.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Long(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Long(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<f32> for Value {
    fn from(x: f32) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Keyword> for Value {
    fn from(k: Keyword) -> Self {
        Value::Keyword(k)
    }
}

impl From<Uuid> for Value {
    fn from(u: Uuid) -> Self {
        Value::Uuid(u)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Instant(t)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}
