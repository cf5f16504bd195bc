use pretty_assertions::assert_eq;

use crate::{
    bson::{
        decode_document,
        encode_document,
        encode_document_into,
        spec::BinarySubtype,
        Binary,
        Bson,
        DateTime,
        Decimal128,
        Document,
        JavaScriptCodeWithScope,
        ObjectId,
        Regex,
        SharedDocument,
        Timestamp,
        MAX_NESTING_DEPTH,
    },
    doc,
    error::ErrorKind,
};

fn round_trip(doc: &Document) -> Document {
    let bytes = encode_document(doc).unwrap();
    decode_document(&bytes).unwrap()
}

#[test]
fn encodes_known_bytes() {
    let bytes = encode_document(&doc! { "hello": "world" }).unwrap();
    assert_eq!(
        bytes,
        b"\x16\x00\x00\x00\x02hello\x00\x06\x00\x00\x00world\x00\x00".to_vec()
    );

    let bytes = encode_document(&doc! { "n": 1 }).unwrap();
    assert_eq!(bytes, b"\x0c\x00\x00\x00\x10n\x00\x01\x00\x00\x00\x00".to_vec());
}

#[test]
fn full_type_set_round_trips() {
    let doc = doc! {
        "double": 1.5,
        "string": "text",
        "nested": doc! { "a": doc! { "b": vec![1, 2, 3] } },
        "array": vec![Bson::from(1), Bson::from("two"), Bson::Document(doc! { "three": 3 })],
        "generic": Binary::generic(vec![1u8, 2, 3]),
        "function": Binary { subtype: BinarySubtype::Function, bytes: vec![9] },
        "old": Binary { subtype: BinarySubtype::BinaryOld, bytes: vec![7, 7] },
        "uuid_old": Binary { subtype: BinarySubtype::UuidOld, bytes: vec![0; 16] },
        "uuid": Binary::uuid(uuid::Uuid::new_v4()),
        "md5": Binary { subtype: BinarySubtype::Md5, bytes: vec![1; 16] },
        "user": Binary { subtype: BinarySubtype::UserDefined(0x80), bytes: vec![4, 2] },
        "undefined": Bson::Undefined,
        "oid": ObjectId::new(),
        "bool": true,
        "date": DateTime::from_millis(1_500_000_000_000),
        "null": Bson::Null,
        "regex": Regex::new("^abc", "xmi").unwrap(),
        "code": Bson::JavaScriptCode("function() {}".to_string()),
        "scoped": JavaScriptCodeWithScope { code: "x".to_string(), scope: doc! { "x": 1 } },
        "int32": 42,
        "timestamp": Timestamp { time: 12, increment: 3 },
        "int64": Bson::Int64(7),
        "decimal": Decimal128::from_bytes([1; 16]),
        "symbol": Bson::Symbol("sym".to_string()),
        "min": Bson::MinKey,
        "max": Bson::MaxKey,
    };

    assert_eq!(round_trip(&doc), doc);
}

#[test]
fn key_order_is_significant() {
    let a = doc! { "x": 1, "y": 2 };
    let b = doc! { "y": 2, "x": 1 };
    assert_ne!(a, b);
    assert_eq!(round_trip(&b).first_key(), Some("y"));
}

#[test]
fn integer_widths() {
    assert_eq!(Bson::from(5i64), Bson::Int64(5));
    assert_eq!(Bson::from(5u32), Bson::Int32(5));
    assert_eq!(Bson::from(u32::MAX), Bson::Int64(4_294_967_295));
    assert_eq!(Bson::try_from(7u64).unwrap(), Bson::Int32(7));
    let err = Bson::try_from(u64::MAX).unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::BsonEncode { .. }));

    // Explicitly requested widths are kept as-is.
    let doc = doc! { "long": Bson::Int64(1), "float": 1.0 };
    assert_eq!(round_trip(&doc), doc);
}

#[test]
fn null_byte_in_key_fails_without_writing() {
    let mut buf = vec![0xAA, 0xBB];
    let mut doc = doc! { "ok": 1 };
    doc.insert("bad\0key", 2);

    let err = encode_document_into(&doc, &mut buf).unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::BsonEncode { .. }));
    assert_eq!(buf, vec![0xAA, 0xBB]);

    let nested = doc! { "outer": doc! { "in\0ner": 1 } };
    assert!(encode_document(&nested).is_err());
}

#[test]
fn null_byte_in_regex_fails() {
    let regex = Regex::new("a\0b", "i").unwrap();
    assert!(encode_document(&doc! { "r": regex }).is_err());
}

#[test]
fn circular_reference_detected() {
    let shared = SharedDocument::new(doc! { "name": "loop" });
    shared.write().insert("self", shared.clone());

    let err = encode_document(&doc! { "root": shared.clone() }).unwrap_err();
    match *err.kind {
        ErrorKind::BsonEncode { ref message } => assert!(message.contains("circular reference")),
        ref other => panic!("expected encode error, got {other:?}"),
    }

    // Break the cycle so the allocation can be freed.
    shared.write().remove("self");
}

#[test]
fn indirect_cycle_detected() {
    let a = SharedDocument::new(doc! {});
    let b = SharedDocument::new(doc! { "back": a.clone() });
    a.write().insert("list", vec![Bson::from(b.clone())]);

    assert!(encode_document(&doc! { "a": a.clone() }).is_err());
    a.write().remove("list");
}

#[test]
fn shared_documents_may_repeat_without_cycles() {
    let shared = SharedDocument::new(doc! { "v": 1 });
    let doc = doc! { "a": shared.clone(), "b": shared.clone() };
    assert_eq!(
        round_trip(&doc),
        doc! { "a": doc! { "v": 1 }, "b": doc! { "v": 1 } }
    );
}

#[test]
fn deep_nesting_is_bounded() {
    let mut doc = doc! { "leaf": 1 };
    for _ in 0..MAX_NESTING_DEPTH + 5 {
        doc = doc! { "n": doc };
    }
    assert!(encode_document(&doc).is_err());
}

#[test]
fn regex_flags_are_sorted_and_validated() {
    let regex = Regex::new("a.*", "xsmi").unwrap();
    assert_eq!(regex.options(), "imsx");

    let err = Regex::new("a", "iq").unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::InvalidArgument { .. }));
}

#[test]
fn invalid_utf8_rejected() {
    assert!(Bson::string_from_utf8(vec![0xff, 0xfe]).is_err());
    assert_eq!(
        Bson::string_from_utf8(b"ok".to_vec()).unwrap(),
        Bson::String("ok".to_string())
    );

    // A string element whose body is not UTF-8.
    let bytes = b"\x0e\x00\x00\x00\x02s\x00\x02\x00\x00\x00\xff\x00\x00";
    assert!(decode_document(bytes).is_err());
}

#[test]
fn decode_rejects_malformed_input() {
    let good = encode_document(&doc! { "a": 1, "b": "x" }).unwrap();

    // Truncated.
    assert!(decode_document(&good[..good.len() - 3]).is_err());

    // Declared length larger than the buffer.
    let mut long = good.clone();
    long[0] += 10;
    assert!(decode_document(&long).is_err());

    // Declared length smaller than the contents.
    let mut short = good.clone();
    short[0] -= 2;
    assert!(decode_document(&short).is_err());

    // Unknown element type.
    let mut unknown = good.clone();
    unknown[4] = 0x42;
    let err = decode_document(&unknown).unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::BsonDecode { .. }));

    // Boolean byte that is neither 0 nor 1.
    let bytes = b"\x09\x00\x00\x00\x08b\x00\x02\x00";
    assert!(decode_document(bytes).is_err());
}

#[test]
fn decimal128_display() {
    // 1 with exponent 0.
    let mut bytes = [0u8; 16];
    bytes[0] = 1;
    bytes[15] = 0x30;
    bytes[14] = 0x40;
    assert_eq!(Decimal128::from_bytes(bytes).to_string(), "1");

    // 15 with exponent -1.
    let mut bytes = [0u8; 16];
    bytes[0] = 15;
    bytes[15] = 0x30;
    bytes[14] = 0x3e;
    assert_eq!(Decimal128::from_bytes(bytes).to_string(), "1.5");
}

#[test]
fn display_is_extended_json() {
    let doc = doc! { "a": 1, "b": "two", "c": vec![true] };
    assert_eq!(doc.to_string(), "{ \"a\": 1, \"b\": \"two\", \"c\": [true] }");
    assert_eq!(Document::new().to_string(), "{}");
}

#[test]
fn serializes_as_relaxed_json() {
    let oid = ObjectId::new();
    let doc = doc! {
        "n": 5i64,
        "list": vec![Bson::Boolean(true), Bson::Null],
        "_id": oid,
        "ts": Timestamp { time: 7, increment: 1 },
    };
    assert_eq!(
        serde_json::to_value(&doc).unwrap(),
        serde_json::json!({
            "n": 5,
            "list": [true, null],
            "_id": { "$oid": oid.to_hex() },
            "ts": { "$timestamp": { "t": 7, "i": 1 } },
        })
    );
}

#[test]
fn typed_accessors() {
    let doc = doc! { "s": "x", "i": 1, "l": Bson::Int64(2), "d": doc! {} };
    assert_eq!(doc.get_str("s"), Ok("x"));
    assert_eq!(doc.get_i32("i"), Ok(1));
    assert_eq!(doc.get_i64("l"), Ok(2));
    assert!(doc.get_document("d").is_ok());
    assert!(doc.get_str("i").is_err());
    assert!(doc.get_str("missing").is_err());
}

#[test]
fn insert_first_moves_key_to_front() {
    let mut doc = doc! { "a": 1, "b": 2 };
    doc.insert_first("_id", 0);
    assert_eq!(doc.first_key(), Some("_id"));
    doc.insert_first("b", 3);
    assert_eq!(doc.keys().cloned().collect::<Vec<_>>(), vec!["b", "_id", "a"]);
}
