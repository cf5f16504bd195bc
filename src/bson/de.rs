use super::{
    oid::ObjectId,
    ser::MAX_NESTING_DEPTH,
    spec::{BinarySubtype, ElementType},
    value::{
        Binary,
        Bson,
        DateTime,
        DbPointer,
        Decimal128,
        JavaScriptCodeWithScope,
        Regex,
        Timestamp,
    },
    Document,
};
use crate::error::{ErrorKind, Result};

/// The smallest possible encoded document: a length prefix and the trailing null.
const MIN_DOCUMENT_SIZE: usize = 5;

/// Decodes exactly one document occupying all of `bytes`.
pub fn decode_document(bytes: &[u8]) -> Result<Document> {
    let (doc, read) = decode_document_prefix(bytes)?;
    if read != bytes.len() {
        return Err(decode_error(format!(
            "{} trailing bytes after document",
            bytes.len() - read
        )));
    }
    Ok(doc)
}

/// Decodes the document at the front of `bytes`, returning it along with the number of bytes
/// it occupied.
pub fn decode_document_prefix(bytes: &[u8]) -> Result<(Document, usize)> {
    let mut decoder = Decoder {
        bytes,
        pos: 0,
        depth: 0,
    };
    let doc = decoder.read_document()?;
    Ok((doc, decoder.pos))
}

fn decode_error(message: impl Into<String>) -> crate::error::Error {
    ErrorKind::BsonDecode {
        message: message.into(),
    }
    .into()
}

struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Decoder<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                decode_error(format!(
                    "unexpected end of input: needed {n} bytes at offset {}",
                    self.pos
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    fn read_length(&mut self, what: &str) -> Result<usize> {
        let len = self.read_i32()?;
        usize::try_from(len).map_err(|_| decode_error(format!("negative {what} length {len}")))
    }

    fn read_cstring(&mut self) -> Result<String> {
        let rest = &self.bytes[self.pos..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| decode_error("unterminated cstring"))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|e| decode_error(format!("cstring is not valid UTF-8: {e}")))?
            .to_string();
        self.pos += nul + 1;
        Ok(s)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_length("string")?;
        if len == 0 {
            return Err(decode_error("string length must include the null terminator"));
        }
        let bytes = self.take(len)?;
        let (body, terminator) = bytes.split_at(len - 1);
        if terminator != [0] {
            return Err(decode_error("string is not null-terminated"));
        }
        std::str::from_utf8(body)
            .map(str::to_string)
            .map_err(|e| decode_error(format!("string is not valid UTF-8: {e}")))
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(decode_error(format!(
                "document nesting exceeds the maximum depth of {MAX_NESTING_DEPTH}"
            )));
        }
        Ok(())
    }

    /// Reads a length-prefixed element list, calling `each` for every element.
    fn read_elements(&mut self, mut each: impl FnMut(String, Bson)) -> Result<()> {
        self.enter()?;
        let start = self.pos;
        let len = self.read_length("document")?;
        if len < MIN_DOCUMENT_SIZE {
            return Err(decode_error(format!("document length {len} is too small")));
        }
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                decode_error(format!(
                    "document length {len} exceeds the {} available bytes",
                    self.bytes.len() - start
                ))
            })?;

        loop {
            if self.pos >= end {
                return Err(decode_error("document is missing its null terminator"));
            }
            let tag = self.read_u8()?;
            if tag == 0 {
                break;
            }
            let key = self.read_cstring()?;
            let value = self.read_value(tag, &key)?;
            if self.pos > end {
                return Err(decode_error(format!(
                    "element {key:?} overruns the enclosing document"
                )));
            }
            each(key, value);
        }

        if self.pos != end {
            return Err(decode_error(format!(
                "document length {len} does not match its contents ({} bytes)",
                self.pos - start
            )));
        }
        self.depth -= 1;
        Ok(())
    }

    fn read_document(&mut self) -> Result<Document> {
        let mut doc = Document::new();
        self.read_elements(|k, v| {
            doc.insert(k, v);
        })?;
        Ok(doc)
    }

    fn read_array_value(&mut self) -> Result<Vec<Bson>> {
        let mut values = Vec::new();
        self.read_elements(|_, v| values.push(v))?;
        Ok(values)
    }

    fn read_value(&mut self, tag: u8, key: &str) -> Result<Bson> {
        let element_type = ElementType::from_tag(tag).ok_or_else(|| {
            decode_error(format!("unknown element type {tag:#04x} for key {key:?}"))
        })?;

        let value = match element_type {
            ElementType::Double => Bson::Double(f64::from_le_bytes(self.read_array()?)),
            ElementType::String => Bson::String(self.read_string()?),
            ElementType::EmbeddedDocument => Bson::Document(self.read_document()?),
            ElementType::Array => Bson::Array(self.read_array_value()?),
            ElementType::Binary => Bson::Binary(self.read_binary()?),
            ElementType::Undefined => Bson::Undefined,
            ElementType::ObjectId => Bson::ObjectId(ObjectId::from_bytes(self.read_array()?)),
            ElementType::Boolean => match self.read_u8()? {
                0 => Bson::Boolean(false),
                1 => Bson::Boolean(true),
                other => {
                    return Err(decode_error(format!(
                        "invalid boolean byte {other:#04x} for key {key:?}"
                    )))
                }
            },
            ElementType::DateTime => Bson::DateTime(DateTime::from_millis(self.read_i64()?)),
            ElementType::Null => Bson::Null,
            ElementType::RegularExpression => {
                let pattern = self.read_cstring()?;
                let options = self.read_cstring()?;
                Bson::RegularExpression(Regex::from_wire(pattern, &options))
            }
            ElementType::DbPointer => {
                let namespace = self.read_string()?;
                let id = ObjectId::from_bytes(self.read_array()?);
                Bson::DbPointer(DbPointer { namespace, id })
            }
            ElementType::JavaScriptCode => Bson::JavaScriptCode(self.read_string()?),
            ElementType::Symbol => Bson::Symbol(self.read_string()?),
            ElementType::JavaScriptCodeWithScope => {
                let start = self.pos;
                let len = self.read_length("code with scope")?;
                let code = self.read_string()?;
                let scope = self.read_document()?;
                if self.pos - start != len {
                    return Err(decode_error(format!(
                        "code with scope length {len} does not match its contents"
                    )));
                }
                Bson::JavaScriptCodeWithScope(JavaScriptCodeWithScope { code, scope })
            }
            ElementType::Int32 => Bson::Int32(self.read_i32()?),
            ElementType::Timestamp => Bson::Timestamp(Timestamp::from_le_i64(self.read_i64()?)),
            ElementType::Int64 => Bson::Int64(self.read_i64()?),
            ElementType::Decimal128 => Bson::Decimal128(Decimal128::from_bytes(self.read_array()?)),
            ElementType::MaxKey => Bson::MaxKey,
            ElementType::MinKey => Bson::MinKey,
        };
        Ok(value)
    }

    fn read_binary(&mut self) -> Result<Binary> {
        let len = self.read_length("binary")?;
        let subtype = BinarySubtype::from(self.read_u8()?);
        let bytes = if let BinarySubtype::BinaryOld = subtype {
            let inner = self.read_length("old binary")?;
            if inner.checked_add(4) != Some(len) {
                return Err(decode_error(format!(
                    "old binary inner length {inner} does not match outer length {len}"
                )));
            }
            self.take(inner)?.to_vec()
        } else {
            self.take(len)?.to_vec()
        };
        Ok(Binary { subtype, bytes })
    }
}
