use std::collections::HashSet;

use super::{
    spec::BinarySubtype,
    value::{Binary, Bson},
    Document,
};
use crate::error::{ErrorKind, Result};

/// Maximum depth of nested documents and arrays accepted by the encoder and decoder.
pub const MAX_NESTING_DEPTH: usize = 200;

/// Encodes `doc` into a new buffer.
pub fn encode_document(doc: &Document) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_document_into(doc, &mut buf)?;
    Ok(buf)
}

/// Appends the encoding of `doc` to `buf`. On failure `buf` is left exactly as it was.
pub fn encode_document_into(doc: &Document, buf: &mut Vec<u8>) -> Result<()> {
    let start = buf.len();
    let result = Encoder::default().write_document(buf, doc);
    if result.is_err() {
        buf.truncate(start);
    }
    result
}

fn encode_error(message: impl Into<String>) -> crate::error::Error {
    ErrorKind::BsonEncode {
        message: message.into(),
    }
    .into()
}

/// State for a single encode call.
#[derive(Default)]
struct Encoder {
    /// Identities of the shared documents on the current traversal path.
    active: HashSet<usize>,
    depth: usize,
}

impl Encoder {
    fn write_document(&mut self, buf: &mut Vec<u8>, doc: &Document) -> Result<()> {
        self.enter()?;
        let start = buf.len();
        buf.extend_from_slice(&[0; 4]);
        for (key, value) in doc {
            self.write_element(buf, key, value)?;
        }
        buf.push(0);
        self.finish_length(buf, start)?;
        self.depth -= 1;
        Ok(())
    }

    fn write_array(&mut self, buf: &mut Vec<u8>, values: &[Bson]) -> Result<()> {
        self.enter()?;
        let start = buf.len();
        buf.extend_from_slice(&[0; 4]);
        for (index, value) in values.iter().enumerate() {
            self.write_element(buf, &index.to_string(), value)?;
        }
        buf.push(0);
        self.finish_length(buf, start)?;
        self.depth -= 1;
        Ok(())
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(encode_error(format!(
                "document nesting exceeds the maximum depth of {MAX_NESTING_DEPTH}"
            )));
        }
        Ok(())
    }

    fn finish_length(&self, buf: &mut [u8], start: usize) -> Result<()> {
        let len = i32::try_from(buf.len() - start)
            .map_err(|_| encode_error("document exceeds the maximum encodable size"))?;
        buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
        Ok(())
    }

    fn write_element(&mut self, buf: &mut Vec<u8>, key: &str, value: &Bson) -> Result<()> {
        buf.push(value.element_type() as u8);
        write_cstring(buf, key).map_err(|_| {
            encode_error(format!("key {key:?} contains a null byte"))
        })?;
        self.write_value(buf, value)
    }

    fn write_value(&mut self, buf: &mut Vec<u8>, value: &Bson) -> Result<()> {
        match value {
            Bson::Double(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Bson::String(s) | Bson::JavaScriptCode(s) | Bson::Symbol(s) => write_string(buf, s)?,
            Bson::Array(values) => self.write_array(buf, values)?,
            Bson::Document(doc) => self.write_document(buf, doc)?,
            Bson::Shared(shared) => {
                let identity = shared.identity();
                if !self.active.insert(identity) {
                    return Err(encode_error("circular reference detected"));
                }
                let doc = shared.read();
                let result = self.write_document(buf, &doc);
                self.active.remove(&identity);
                result?
            }
            Bson::Boolean(b) => buf.push(u8::from(*b)),
            Bson::Null | Bson::Undefined | Bson::MaxKey | Bson::MinKey => {}
            Bson::RegularExpression(regex) => {
                write_cstring(buf, regex.pattern())
                    .map_err(|_| encode_error("regex pattern contains a null byte"))?;
                write_cstring(buf, regex.options())
                    .map_err(|_| encode_error("regex options contain a null byte"))?;
            }
            Bson::JavaScriptCodeWithScope(code_with_scope) => {
                let start = buf.len();
                buf.extend_from_slice(&[0; 4]);
                write_string(buf, &code_with_scope.code)?;
                self.write_document(buf, &code_with_scope.scope)?;
                self.finish_length(buf, start)?;
            }
            Bson::Int32(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Bson::Int64(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Bson::Timestamp(ts) => buf.extend_from_slice(&ts.to_le_i64().to_le_bytes()),
            Bson::Binary(binary) => write_binary(buf, binary)?,
            Bson::ObjectId(oid) => buf.extend_from_slice(&oid.bytes()),
            Bson::DateTime(dt) => buf.extend_from_slice(&dt.timestamp_millis().to_le_bytes()),
            Bson::Decimal128(d) => buf.extend_from_slice(&d.bytes()),
            Bson::DbPointer(pointer) => {
                write_string(buf, &pointer.namespace)?;
                buf.extend_from_slice(&pointer.id.bytes());
            }
        }
        Ok(())
    }
}

fn write_cstring(buf: &mut Vec<u8>, s: &str) -> std::result::Result<(), ()> {
    if s.as_bytes().contains(&0) {
        return Err(());
    }
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    Ok(())
}

fn write_string(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = i32::try_from(s.len() + 1).map_err(|_| encode_error("string is too long"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    Ok(())
}

fn write_binary(buf: &mut Vec<u8>, binary: &Binary) -> Result<()> {
    let too_long = || encode_error("binary value is too long");
    if let BinarySubtype::BinaryOld = binary.subtype {
        let inner = i32::try_from(binary.bytes.len()).map_err(|_| too_long())?;
        let outer = inner.checked_add(4).ok_or_else(too_long)?;
        buf.extend_from_slice(&outer.to_le_bytes());
        buf.push(binary.subtype.into());
        buf.extend_from_slice(&inner.to_le_bytes());
    } else {
        let len = i32::try_from(binary.bytes.len()).map_err(|_| too_long())?;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.push(binary.subtype.into());
    }
    buf.extend_from_slice(&binary.bytes);
    Ok(())
}
