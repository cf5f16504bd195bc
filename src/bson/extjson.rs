//! Relaxed extended JSON rendering, used for `Display` and for serializing documents inside
//! monitoring events.

use std::fmt::{self, Write};

use serde::{
    ser::{SerializeMap, SerializeSeq},
    Serialize,
    Serializer,
};

use super::{
    value::{Binary, Bson},
    Document,
};

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_char('{')?;
        let mut first = true;
        for (key, value) in self {
            if !first {
                f.write_char(',')?;
            }
            first = false;
            write!(f, " {}: {}", Quoted(key), value)?;
        }
        if !first {
            f.write_char(' ')?;
        }
        f.write_char('}')
    }
}

impl fmt::Display for Bson {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bson::Double(v) if v.is_nan() => f.write_str("{ \"$numberDouble\": \"NaN\" }"),
            Bson::Double(v) if v.is_infinite() => {
                let sign = if *v > 0.0 { "" } else { "-" };
                write!(f, "{{ \"$numberDouble\": \"{sign}Infinity\" }}")
            }
            Bson::Double(v) if v.fract() == 0.0 && v.abs() < 1e16 => write!(f, "{v:.1}"),
            Bson::Double(v) => write!(f, "{v}"),
            Bson::String(s) => write!(f, "{}", Quoted(s)),
            Bson::Array(values) => {
                f.write_char('[')?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_char(']')
            }
            Bson::Document(doc) => write!(f, "{doc}"),
            // Shared documents may alias themselves, so only their identity is rendered.
            Bson::Shared(shared) => write!(f, "{{ \"$shared\": \"{:#x}\" }}", shared.identity()),
            Bson::Boolean(b) => write!(f, "{b}"),
            Bson::Null => f.write_str("null"),
            Bson::RegularExpression(regex) => write!(
                f,
                "{{ \"$regularExpression\": {{ \"pattern\": {}, \"options\": {} }} }}",
                Quoted(regex.pattern()),
                Quoted(regex.options())
            ),
            Bson::JavaScriptCode(code) => write!(f, "{{ \"$code\": {} }}", Quoted(code)),
            Bson::JavaScriptCodeWithScope(cws) => write!(
                f,
                "{{ \"$code\": {}, \"$scope\": {} }}",
                Quoted(&cws.code),
                cws.scope
            ),
            Bson::Int32(v) => write!(f, "{v}"),
            Bson::Int64(v) => write!(f, "{v}"),
            Bson::Timestamp(ts) => write!(
                f,
                "{{ \"$timestamp\": {{ \"t\": {}, \"i\": {} }} }}",
                ts.time, ts.increment
            ),
            Bson::Binary(Binary { subtype, bytes }) => {
                use base64::Engine;
                write!(
                    f,
                    "{{ \"$binary\": {{ \"base64\": \"{}\", \"subType\": \"{}\" }} }}",
                    base64::engine::general_purpose::STANDARD.encode(bytes),
                    subtype
                )
            }
            Bson::ObjectId(oid) => write!(f, "{{ \"$oid\": \"{oid}\" }}"),
            Bson::DateTime(dt) => write!(
                f,
                "{{ \"$date\": {{ \"$numberLong\": \"{}\" }} }}",
                dt.timestamp_millis()
            ),
            Bson::Symbol(s) => write!(f, "{{ \"$symbol\": {} }}", Quoted(s)),
            Bson::Decimal128(d) => write!(f, "{{ \"$numberDecimal\": \"{d}\" }}"),
            Bson::Undefined => f.write_str("{ \"$undefined\": true }"),
            Bson::MaxKey => f.write_str("{ \"$maxKey\": 1 }"),
            Bson::MinKey => f.write_str("{ \"$minKey\": 1 }"),
            Bson::DbPointer(p) => write!(
                f,
                "{{ \"$dbPointer\": {{ \"$ref\": {}, \"$id\": {{ \"$oid\": \"{}\" }} }} }}",
                Quoted(&p.namespace),
                p.id
            ),
        }
    }
}

/// A JSON string literal.
struct Quoted<'a>(&'a str);

impl fmt::Display for Quoted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_char('"')?;
        for c in self.0.chars() {
            match c {
                '"' => f.write_str("\\\"")?,
                '\\' => f.write_str("\\\\")?,
                '\n' => f.write_str("\\n")?,
                '\r' => f.write_str("\\r")?,
                '\t' => f.write_str("\\t")?,
                c if (c as u32) < 0x20 => write!(f, "\\u{:04x}", c as u32)?,
                c => f.write_char(c)?,
            }
        }
        f.write_char('"')
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (k, v) in self {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl Serialize for Bson {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Bson::Double(v) if v.is_finite() => serializer.serialize_f64(*v),
            Bson::String(s) => serializer.serialize_str(s),
            Bson::Array(values) => {
                let mut seq = serializer.serialize_seq(Some(values.len()))?;
                for v in values {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
            Bson::Document(doc) => doc.serialize(serializer),
            Bson::Boolean(b) => serializer.serialize_bool(*b),
            Bson::Null => serializer.serialize_unit(),
            Bson::Int32(v) => serializer.serialize_i32(*v),
            Bson::Int64(v) => serializer.serialize_i64(*v),
            Bson::ObjectId(oid) => ObjectIdJson { oid: oid.to_hex() }.serialize(serializer),
            Bson::DateTime(dt) => DateTimeJson {
                date: NumberLongJson {
                    number_long: dt.timestamp_millis().to_string(),
                },
            }
            .serialize(serializer),
            Bson::Timestamp(ts) => TimestampJson {
                timestamp: TimestampBody {
                    t: ts.time,
                    i: ts.increment,
                },
            }
            .serialize(serializer),
            other => serializer.collect_str(other),
        }
    }
}

#[derive(Serialize)]
struct ObjectIdJson {
    #[serde(rename = "$oid")]
    oid: String,
}

#[derive(Serialize)]
struct DateTimeJson {
    #[serde(rename = "$date")]
    date: NumberLongJson,
}

#[derive(Serialize)]
struct NumberLongJson {
    #[serde(rename = "$numberLong")]
    number_long: String,
}

#[derive(Serialize)]
struct TimestampJson {
    #[serde(rename = "$timestamp")]
    timestamp: TimestampBody,
}

#[derive(Serialize)]
struct TimestampBody {
    t: u32,
    i: u32,
}
