use std::convert::TryFrom;

use crate::{
    bson::{encode_document, Bson, Document},
    error::{ErrorKind, Result},
};

/// Coerce numeric types into an `i64` if it would be lossless to do so. If this Bson is not numeric
/// or the conversion would be lossy (e.g. 1.5 -> 1), this returns `None`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}

/// Coerce numeric types into an `u64` if it would be lossless to do so. If this Bson is not numeric
/// or the conversion would be lossy (e.g. 1.5 -> 1), this returns `None`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn get_u64(val: &Bson) -> Option<u64> {
    match *val {
        Bson::Int32(i) => u64::try_from(i).ok(),
        Bson::Int64(i) => u64::try_from(i).ok(),
        Bson::Double(f) if f >= 0.0 && (f - (f as u64 as f64)).abs() <= f64::EPSILON => {
            Some(f as u64)
        }
        _ => None,
    }
}

pub(crate) fn to_bson_array(docs: &[Document]) -> Bson {
    Bson::Array(docs.iter().map(|doc| Bson::Document(doc.clone())).collect())
}

pub(crate) fn first_key(document: &Document) -> Option<&str> {
    document.first_key()
}

/// Checks the top-level keys of a document about to be stored: keys must be non-empty, may not
/// start with `$` and may not contain `.`.
pub(crate) fn storage_key_check(document: &Document) -> Result<()> {
    for key in document.keys() {
        let problem = if key.is_empty() {
            "must not be empty"
        } else if key.starts_with('$') {
            "must not start with '$'"
        } else if key.contains('.') {
            "must not contain '.'"
        } else {
            continue;
        };
        return Err(ErrorKind::InvalidArgument {
            message: format!("invalid document key {key:?}: keys of stored documents {problem}"),
        }
        .into());
    }
    Ok(())
}

pub(crate) fn replacement_document_check(replacement: &Document) -> Result<()> {
    match first_key(replacement) {
        Some(key) if key.starts_with('$') => Err(ErrorKind::InvalidArgument {
            message: "replace document must have first key not starting with '$'".to_string(),
        }
        .into()),
        _ => storage_key_check(replacement),
    }
}

pub(crate) fn update_document_check(update: &Document) -> Result<()> {
    if update.is_empty() || !update.keys().all(|key| key.starts_with('$')) {
        return Err(ErrorKind::InvalidArgument {
            message: "update document must only contain update operators starting with '$'"
                .to_string(),
        }
        .into());
    }
    Ok(())
}

/// The encoded size of a document in bytes.
pub(crate) fn doc_size_bytes(document: &Document) -> Result<usize> {
    Ok(encode_document(document)?.len())
}
