use std::{
    fmt,
    iter::{FromIterator, IntoIterator},
};

use indexmap::IndexMap;
use thiserror::Error;

use super::{
    oid::ObjectId,
    spec::BinarySubtype,
    value::{Array, Binary, Bson, DateTime, Timestamp},
};

/// The error returned by the typed accessors on [`Document`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ValueAccessError {
    /// The document has no value under the key.
    #[error("key \"{0}\" is not present")]
    NotPresent(String),

    /// The key holds a value of a different BSON type than the one asked for.
    #[error("value for key \"{0}\" has an unexpected type")]
    UnexpectedType(String),
}

/// The result of a typed getter such as [`Document::get_str`].
pub type ValueAccessResult<T> = std::result::Result<T, ValueAccessError>;

/// An ordered map from string keys to BSON values.
///
/// Insertion order is preserved and is significant: two documents with the same entries in a
/// different order are not equal, and the first key of a command document names the command.
#[derive(Clone, Default)]
pub struct Document {
    inner: IndexMap<String, Bson>,
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.inner.len() == other.inner.len()
            && self.inner.iter().zip(other.inner.iter()).all(|(a, b)| a == b)
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Document(")?;
        f.debug_map().entries(self.inner.iter()).finish()?;
        f.write_str(")")
    }
}

macro_rules! typed_getter {
    ($name:ident, $ret:ty, $variant:ident, $v:ident => $conv:expr) => {
        #[doc = concat!("The value of `key` if it is a BSON `", stringify!($variant), "`.")]
        pub fn $name(&self, key: impl AsRef<str>) -> ValueAccessResult<$ret> {
            let key = key.as_ref();
            match self.get(key) {
                Some(Bson::$variant($v)) => Ok($conv),
                Some(_) => Err(ValueAccessError::UnexpectedType(key.to_string())),
                None => Err(ValueAccessError::NotPresent(key.to_string())),
            }
        }
    };
}

impl Document {
    /// An empty document.
    pub fn new() -> Document {
        Document {
            inner: IndexMap::new(),
        }
    }

    /// Sets `key` to `val`, returning the previous value. An existing key keeps its position.
    pub fn insert<KT: Into<String>, BT: Into<Bson>>(&mut self, key: KT, val: BT) -> Option<Bson> {
        self.inner.insert(key.into(), val.into())
    }

    /// Inserts `key` as the first entry of the document, moving it there if already present.
    pub fn insert_first<KT: Into<String>, BT: Into<Bson>>(&mut self, key: KT, val: BT) {
        self.inner.shift_insert(0, key.into(), val.into());
    }

    /// Removes `key`, keeping the relative order of the remaining entries.
    pub fn remove(&mut self, key: impl AsRef<str>) -> Option<Bson> {
        self.inner.shift_remove(key.as_ref())
    }

    /// The value of `key`, of any type.
    pub fn get(&self, key: impl AsRef<str>) -> Option<&Bson> {
        self.inner.get(key.as_ref())
    }

    /// A mutable reference to the value of `key`.
    pub fn get_mut(&mut self, key: impl AsRef<str>) -> Option<&mut Bson> {
        self.inner.get_mut(key.as_ref())
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: impl AsRef<str>) -> bool {
        self.inner.contains_key(key.as_ref())
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.inner.keys()
    }

    /// Values in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &Bson> {
        self.inner.values()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> indexmap::map::Iter<'_, String, Bson> {
        self.inner.iter()
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the document has no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// The first key, which for a command document is the command name.
    pub fn first_key(&self) -> Option<&str> {
        self.inner.keys().next().map(String::as_str)
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    typed_getter!(get_f64, f64, Double, v => *v);
    typed_getter!(get_str, &str, String, v => v.as_str());
    typed_getter!(get_array, &Array, Array, v => v);
    typed_getter!(get_document, &Document, Document, v => v);
    typed_getter!(get_bool, bool, Boolean, v => *v);
    typed_getter!(get_i32, i32, Int32, v => *v);
    typed_getter!(get_i64, i64, Int64, v => *v);
    typed_getter!(get_timestamp, Timestamp, Timestamp, v => *v);
    typed_getter!(get_object_id, ObjectId, ObjectId, v => *v);
    typed_getter!(get_datetime, &DateTime, DateTime, v => v);

    /// A mutable reference to the embedded document at `key`.
    pub fn get_document_mut(&mut self, key: impl AsRef<str>) -> ValueAccessResult<&mut Document> {
        let key = key.as_ref();
        match self.inner.get_mut(key) {
            Some(Bson::Document(v)) => Ok(v),
            Some(_) => Err(ValueAccessError::UnexpectedType(key.to_string())),
            None => Err(ValueAccessError::NotPresent(key.to_string())),
        }
    }

    /// The bytes of a generic-subtype binary value.
    pub fn get_binary_generic(&self, key: impl AsRef<str>) -> ValueAccessResult<&Vec<u8>> {
        let key = key.as_ref();
        match self.get(key) {
            Some(Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes,
            })) => Ok(bytes),
            Some(_) => Err(ValueAccessError::UnexpectedType(key.to_string())),
            None => Err(ValueAccessError::NotPresent(key.to_string())),
        }
    }
}

impl IntoIterator for Document {
    type Item = (String, Bson);
    type IntoIter = indexmap::map::IntoIter<String, Bson>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl<'a> IntoIterator for &'a Document {
    type Item = (&'a String, &'a Bson);
    type IntoIter = indexmap::map::Iter<'a, String, Bson>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

impl<K: Into<String>, V: Into<Bson>> FromIterator<(K, V)> for Document {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut doc = Document::new();
        doc.extend(iter);
        doc
    }
}

impl<K: Into<String>, V: Into<Bson>> Extend<(K, V)> for Document {
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}
