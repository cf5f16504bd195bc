use std::{
    fmt,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use super::{
    oid::ObjectId,
    spec::{BinarySubtype, ElementType},
    Document,
};
use crate::error::{Error, ErrorKind, Result};

/// An ordered sequence of BSON values.
pub type Array = Vec<Bson>;

/// A single BSON value.
#[derive(Clone, Debug, PartialEq)]
pub enum Bson {
    /// 64-bit binary floating point.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Array, encoded as a document keyed by index.
    Array(Array),
    /// Embedded document.
    Document(Document),
    /// Boolean.
    Boolean(bool),
    /// Null.
    Null,
    /// Regular expression.
    RegularExpression(Regex),
    /// JavaScript code.
    JavaScriptCode(String),
    /// JavaScript code with a scope document.
    JavaScriptCodeWithScope(JavaScriptCodeWithScope),
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// Internal replication timestamp.
    Timestamp(Timestamp),
    /// Binary data with a subtype.
    Binary(Binary),
    /// 12-byte object id.
    ObjectId(ObjectId),
    /// UTC milliseconds since the epoch.
    DateTime(DateTime),
    /// Deprecated.
    Symbol(String),
    /// 128-bit decimal floating point.
    Decimal128(Decimal128),
    /// Deprecated.
    Undefined,
    /// Compares above every other value.
    MaxKey,
    /// Compares below every other value.
    MinKey,
    /// Deprecated.
    DbPointer(DbPointer),
    /// A document held by reference. Encodes exactly like [`Bson::Document`]; decoding never
    /// produces it.
    Shared(SharedDocument),
}

macro_rules! as_variant {
    ($name:ident, $variant:ident, $ret:ty, $v:ident => $conv:expr) => {
        #[doc = concat!("The inner value if this is a `", stringify!($variant), "`.")]
        pub fn $name(&self) -> Option<$ret> {
            match self {
                Bson::$variant($v) => Some($conv),
                _ => None,
            }
        }
    };
}

impl Bson {
    /// The element type this value is encoded as.
    pub fn element_type(&self) -> ElementType {
        match self {
            Bson::Double(_) => ElementType::Double,
            Bson::String(_) => ElementType::String,
            Bson::Array(_) => ElementType::Array,
            Bson::Document(_) | Bson::Shared(_) => ElementType::EmbeddedDocument,
            Bson::Boolean(_) => ElementType::Boolean,
            Bson::Null => ElementType::Null,
            Bson::RegularExpression(_) => ElementType::RegularExpression,
            Bson::JavaScriptCode(_) => ElementType::JavaScriptCode,
            Bson::JavaScriptCodeWithScope(_) => ElementType::JavaScriptCodeWithScope,
            Bson::Int32(_) => ElementType::Int32,
            Bson::Int64(_) => ElementType::Int64,
            Bson::Timestamp(_) => ElementType::Timestamp,
            Bson::Binary(_) => ElementType::Binary,
            Bson::ObjectId(_) => ElementType::ObjectId,
            Bson::DateTime(_) => ElementType::DateTime,
            Bson::Symbol(_) => ElementType::Symbol,
            Bson::Decimal128(_) => ElementType::Decimal128,
            Bson::Undefined => ElementType::Undefined,
            Bson::MaxKey => ElementType::MaxKey,
            Bson::MinKey => ElementType::MinKey,
            Bson::DbPointer(_) => ElementType::DbPointer,
        }
    }

    /// Builds the narrowest integer representation of `value`: int32 when it fits, int64
    /// otherwise.
    pub fn integer(value: i64) -> Bson {
        match i32::try_from(value) {
            Ok(small) => Bson::Int32(small),
            Err(_) => Bson::Int64(value),
        }
    }

    /// Validates raw bytes as UTF-8 before accepting them as a string value.
    pub fn string_from_utf8(bytes: Vec<u8>) -> Result<Bson> {
        String::from_utf8(bytes).map(Bson::String).map_err(|e| {
            ErrorKind::BsonEncode {
                message: format!("string is not valid UTF-8: {e}"),
            }
            .into()
        })
    }

    as_variant!(as_f64, Double, f64, v => *v);
    as_variant!(as_str, String, &str, v => v.as_str());
    as_variant!(as_array, Array, &Array, v => v);
    as_variant!(as_document, Document, &Document, v => v);
    as_variant!(as_bool, Boolean, bool, v => *v);
    as_variant!(as_i32, Int32, i32, v => *v);
    as_variant!(as_i64, Int64, i64, v => *v);
    as_variant!(as_object_id, ObjectId, ObjectId, v => *v);
    as_variant!(as_timestamp, Timestamp, Timestamp, v => *v);
    as_variant!(as_datetime, DateTime, &DateTime, v => v);

    /// The embedded document, mutably, if this is one.
    pub fn as_document_mut(&mut self) -> Option<&mut Document> {
        match self {
            Bson::Document(v) => Some(v),
            _ => None,
        }
    }

    /// `Some(())` for null.
    pub fn as_null(&self) -> Option<()> {
        matches!(self, Bson::Null).then_some(())
    }
}

impl Default for Bson {
    fn default() -> Self {
        Bson::Null
    }
}

impl From<f32> for Bson {
    fn from(a: f32) -> Bson {
        Bson::Double(a.into())
    }
}

impl From<f64> for Bson {
    fn from(a: f64) -> Bson {
        Bson::Double(a)
    }
}

impl From<&str> for Bson {
    fn from(s: &str) -> Bson {
        Bson::String(s.to_owned())
    }
}

impl From<String> for Bson {
    fn from(a: String) -> Bson {
        Bson::String(a)
    }
}

impl From<&String> for Bson {
    fn from(a: &String) -> Bson {
        Bson::String(a.clone())
    }
}

impl From<Document> for Bson {
    fn from(a: Document) -> Bson {
        Bson::Document(a)
    }
}

impl From<SharedDocument> for Bson {
    fn from(a: SharedDocument) -> Bson {
        Bson::Shared(a)
    }
}

impl From<bool> for Bson {
    fn from(a: bool) -> Bson {
        Bson::Boolean(a)
    }
}

impl From<Regex> for Bson {
    fn from(regex: Regex) -> Bson {
        Bson::RegularExpression(regex)
    }
}

impl From<JavaScriptCodeWithScope> for Bson {
    fn from(code_with_scope: JavaScriptCodeWithScope) -> Bson {
        Bson::JavaScriptCodeWithScope(code_with_scope)
    }
}

impl From<Binary> for Bson {
    fn from(binary: Binary) -> Bson {
        Bson::Binary(binary)
    }
}

impl From<Timestamp> for Bson {
    fn from(ts: Timestamp) -> Bson {
        Bson::Timestamp(ts)
    }
}

impl From<DateTime> for Bson {
    fn from(dt: DateTime) -> Bson {
        Bson::DateTime(dt)
    }
}

impl From<Decimal128> for Bson {
    fn from(d: Decimal128) -> Bson {
        Bson::Decimal128(d)
    }
}

impl From<ObjectId> for Bson {
    fn from(a: ObjectId) -> Bson {
        Bson::ObjectId(a)
    }
}

impl From<i8> for Bson {
    fn from(a: i8) -> Bson {
        Bson::Int32(a.into())
    }
}

impl From<u8> for Bson {
    fn from(a: u8) -> Bson {
        Bson::Int32(a.into())
    }
}

impl From<i16> for Bson {
    fn from(a: i16) -> Bson {
        Bson::Int32(a.into())
    }
}

impl From<u16> for Bson {
    fn from(a: u16) -> Bson {
        Bson::Int32(a.into())
    }
}

impl From<i32> for Bson {
    fn from(a: i32) -> Bson {
        Bson::Int32(a)
    }
}

impl From<u32> for Bson {
    fn from(a: u32) -> Bson {
        Bson::integer(a.into())
    }
}

impl From<i64> for Bson {
    fn from(a: i64) -> Bson {
        Bson::Int64(a)
    }
}

impl TryFrom<u64> for Bson {
    type Error = Error;

    fn try_from(a: u64) -> Result<Bson> {
        i64::try_from(a).map(Bson::integer).map_err(|_| {
            ErrorKind::BsonEncode {
                message: format!("{a} cannot be represented as a BSON integer"),
            }
            .into()
        })
    }
}

impl TryFrom<usize> for Bson {
    type Error = Error;

    fn try_from(a: usize) -> Result<Bson> {
        Bson::try_from(a as u64)
    }
}

impl<T: Into<Bson>> From<Vec<T>> for Bson {
    fn from(v: Vec<T>) -> Bson {
        Bson::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Bson>> From<Option<T>> for Bson {
    fn from(a: Option<T>) -> Bson {
        match a {
            None => Bson::Null,
            Some(t) => t.into(),
        }
    }
}

impl From<&Bson> for Bson {
    fn from(a: &Bson) -> Bson {
        a.clone()
    }
}

/// A binary value tagged with its subtype.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Binary {
    /// How the bytes are to be interpreted.
    pub subtype: BinarySubtype,

    /// The payload.
    pub bytes: Vec<u8>,
}

impl Binary {
    /// A subtype 0 (generic) binary.
    pub fn generic(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            subtype: BinarySubtype::Generic,
            bytes: bytes.into(),
        }
    }

    /// A subtype 4 (UUID) binary.
    pub fn uuid(uuid: uuid::Uuid) -> Self {
        Self {
            subtype: BinarySubtype::Uuid,
            bytes: uuid.as_bytes().to_vec(),
        }
    }
}

/// The regex flags accepted by the server, in canonical order.
const REGEX_FLAGS: &str = "ilmsux";

/// A regular expression with its option string kept sorted.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Regex {
    pattern: String,
    options: String,
}

impl Regex {
    /// Creates a regex, canonicalizing the options into sorted order. Fails if an option is not
    /// one of `i`, `l`, `m`, `s`, `u`, `x`.
    pub fn new(pattern: impl Into<String>, options: impl AsRef<str>) -> Result<Self> {
        let options = options.as_ref();
        if let Some(bad) = options.chars().find(|c| !REGEX_FLAGS.contains(*c)) {
            return Err(Error::invalid_argument(format!(
                "unsupported regex flag '{bad}' in \"{options}\""
            )));
        }
        Ok(Self {
            pattern: pattern.into(),
            options: canonical_flags(options),
        })
    }

    /// Builds a regex read off the wire, where unknown flags are kept rather than rejected.
    pub(crate) fn from_wire(pattern: String, options: &str) -> Self {
        Self {
            pattern,
            options: canonical_flags(options),
        }
    }

    /// The pattern, without delimiters.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The option flags, sorted.
    pub fn options(&self) -> &str {
        &self.options
    }
}

fn canonical_flags(options: &str) -> String {
    let mut flags: Vec<char> = options.chars().collect();
    flags.sort_unstable();
    flags.dedup();
    flags.into_iter().collect()
}

/// JavaScript code paired with the variables it closes over.
#[derive(Clone, Debug, PartialEq)]
pub struct JavaScriptCodeWithScope {
    /// The source code.
    pub code: String,

    /// Variables the code refers to.
    pub scope: Document,
}

/// The deprecated DBPointer type: a namespace plus an ObjectId.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbPointer {
    /// `db.collection` of the referenced document.
    pub namespace: String,

    /// The referenced document's `_id`.
    pub id: ObjectId,
}

/// An internal MongoDB timestamp: seconds since the epoch plus an ordinal within the second.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub time: u32,

    /// Orders operations within the same second.
    pub increment: u32,
}

impl Timestamp {
    pub(crate) fn to_le_i64(self) -> i64 {
        let upper = (self.time.to_le() as u64) << 32;
        let lower = self.increment.to_le() as u64;
        (upper | lower) as i64
    }

    pub(crate) fn from_le_i64(val: i64) -> Self {
        let ts = val.to_le();
        Timestamp {
            time: ((ts as u64) >> 32) as u32,
            increment: (ts & 0xFFFF_FFFF) as u32,
        }
    }
}

/// Milliseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DateTime(i64);

impl DateTime {
    /// The earliest representable instant.
    pub const MIN: Self = Self(i64::MIN);

    /// The latest representable instant.
    pub const MAX: Self = Self(i64::MAX);

    /// The current time, truncated to milliseconds.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// `millis` after the epoch, or before it when negative.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the epoch.
    pub const fn timestamp_millis(&self) -> i64 {
        self.0
    }

    /// Converts a `SystemTime`, saturating at the representable bounds.
    pub fn from_system_time(st: SystemTime) -> Self {
        match st.duration_since(UNIX_EPOCH) {
            Ok(d) => Self(i64::try_from(d.as_millis()).unwrap_or(i64::MAX)),
            Err(e) => Self(
                i64::try_from(e.duration().as_millis())
                    .map(|m| -m)
                    .unwrap_or(i64::MIN),
            ),
        }
    }

    /// The same instant as a `SystemTime`.
    pub fn to_system_time(self) -> SystemTime {
        if self.0 >= 0 {
            UNIX_EPOCH + Duration::from_millis(self.0 as u64)
        } else {
            UNIX_EPOCH - Duration::from_millis(self.0.unsigned_abs())
        }
    }
}

/// A 128-bit IEEE 754-2008 decimal floating point value in BID encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal128 {
    bytes: [u8; 16],
}

impl Decimal128 {
    const EXPONENT_BIAS: i32 = 6176;

    /// Wraps the 16 little-endian bytes of a BID-encoded decimal.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self { bytes }
    }

    /// The little-endian encoded bytes.
    pub fn bytes(&self) -> [u8; 16] {
        self.bytes
    }
}

impl fmt::Debug for Decimal128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Decimal128({self})")
    }
}

impl fmt::Display for Decimal128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = u128::from_le_bytes(self.bytes);
        let high = (raw >> 64) as u64;
        let negative = high >> 63 == 1;
        let sign = if negative { "-" } else { "" };

        let combination = (high >> 58) & 0x1F;
        if combination == 0x1F {
            return f.write_str("NaN");
        }
        if combination == 0x1E {
            return write!(f, "{sign}Infinity");
        }

        let (biased_exponent, coefficient) = if (high >> 61) & 0b11 == 0b11 {
            // Coefficients in this form always exceed the maximum and are treated as zero.
            (((high >> 47) & 0x3FFF) as i32, 0u128)
        } else {
            let coefficient = raw & ((1u128 << 113) - 1);
            let coefficient = if coefficient > 9_999_999_999_999_999_999_999_999_999_999_999 {
                0
            } else {
                coefficient
            };
            (((high >> 49) & 0x3FFF) as i32, coefficient)
        };
        let exponent = biased_exponent - Self::EXPONENT_BIAS;
        let digits = coefficient.to_string();
        let adjusted = exponent + digits.len() as i32 - 1;

        if exponent > 0 || adjusted < -6 {
            let (first, rest) = digits.split_at(1);
            let point = if rest.is_empty() { "" } else { "." };
            let exp_sign = if adjusted >= 0 { "+" } else { "" };
            write!(f, "{sign}{first}{point}{rest}E{exp_sign}{adjusted}")
        } else if exponent == 0 {
            write!(f, "{sign}{digits}")
        } else {
            let scale = exponent.unsigned_abs() as usize;
            if digits.len() > scale {
                let (int_part, frac) = digits.split_at(digits.len() - scale);
                write!(f, "{sign}{int_part}.{frac}")
            } else {
                write!(f, "{sign}0.{}{digits}", "0".repeat(scale - digits.len()))
            }
        }
    }
}

/// A document shared by reference, so that one value may appear at several places in a tree
/// and be mutated through any of them. Aliasing makes reference cycles possible; encoding
/// rejects them.
#[derive(Clone, Default)]
pub struct SharedDocument(Arc<RwLock<Document>>);

impl SharedDocument {
    /// Shares `document`.
    pub fn new(document: Document) -> Self {
        Self(Arc::new(RwLock::new(document)))
    }

    /// Locks the document for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, Document> {
        self.0.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Locks the document for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, Document> {
        self.0.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Identity of the underlying allocation, used for cycle detection.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for SharedDocument {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for SharedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedDocument({:#x})", self.identity())
    }
}
