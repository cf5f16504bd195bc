//! An in-crate implementation of the BSON format: the value model, an ordered document type,
//! and a codec that enforces the constraints MongoDB places on documents.

mod de;
mod document;
mod extjson;
#[macro_use]
mod macros;
pub mod oid;
mod ser;
pub mod spec;
#[cfg(test)]
mod test;
mod value;

pub use self::{
    de::{decode_document, decode_document_prefix},
    document::{Document, ValueAccessError, ValueAccessResult},
    oid::ObjectId,
    ser::{encode_document, encode_document_into, MAX_NESTING_DEPTH},
    value::{
        Array,
        Binary,
        Bson,
        DateTime,
        DbPointer,
        Decimal128,
        JavaScriptCodeWithScope,
        Regex,
        SharedDocument,
        Timestamp,
    },
};
pub use crate::doc;
