//! Signature-driven recursive codec between [`Value`] and a message body.
//!
//! Encoding walks the signature one complete type at a time, driving the
//! message's container primitives. Decoding mirrors it against the message's
//! own body signature. `ay` arrays short-circuit to contiguous byte buffers
//! and arrays of dict entries travel as one mapping.

use std::collections::BTreeMap;
use std::convert::TryFrom;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::signature::{find_array_element, find_struct_end, is_basic_token, SignatureIter};
use crate::value::{DictKey, Value};

/// Appends one value per complete top-level type of `sig`.
pub(crate) fn encode_body(msg: &mut Message, sig: &str, values: &[Value]) -> Result<()> {
    let mut iter = SignatureIter::new(sig);
    let mut values = values.iter();
    while !iter.is_empty() {
        let value = values.next().ok_or(Error::TypeMismatch {
            expected: "one value per signature token",
            found: "too few values",
        })?;
        encode_one(msg, &mut iter, value)?;
    }
    if values.next().is_some() {
        return Err(Error::TypeMismatch {
            expected: "one value per signature token",
            found: "too many values",
        });
    }
    Ok(())
}

/// Decodes the whole body, one value per complete top-level type.
pub(crate) fn decode_body(msg: &mut Message) -> Result<Vec<Value>> {
    let sig = msg.signature().to_owned();
    let mut iter = SignatureIter::new(&sig);
    let mut values = Vec::new();
    while !iter.is_empty() {
        values.push(decode_one(msg, &mut iter)?);
    }
    Ok(values)
}

fn encode_one(msg: &mut Message, iter: &mut SignatureIter<'_>, value: &Value) -> Result<()> {
    match iter.next() {
        Some(token) if is_basic_token(token) => msg.write_basic(token, value),
        Some('a') => {
            let elem = find_array_element(iter)?;
            encode_array(msg, &elem, value)
        }
        Some('(') => {
            let inner = find_struct_end(iter)?;
            encode_struct(msg, &inner, value)
        }
        Some('v') => encode_variant(msg, value),
        Some('{') => Err(Error::Signature(
            "dict entry is only legal inside an array".to_owned(),
        )),
        Some(token) => Err(Error::Signature(format!("unknown token '{}'", token))),
        None => Err(Error::Signature("signature ended early".to_owned())),
    }
}

fn encode_array(msg: &mut Message, elem: &str, value: &Value) -> Result<()> {
    if elem == "y" {
        return match value {
            Value::Bytes(bytes) => msg.write_byte_array(bytes),
            other => Err(Error::TypeMismatch {
                expected: "byte buffer",
                found: other.kind_name(),
            }),
        };
    }
    if let Some(entry) = elem.strip_prefix('{') {
        let inner = entry
            .strip_suffix('}')
            .ok_or_else(|| Error::Signature("unterminated dict entry".to_owned()))?;
        return encode_dict(msg, inner, value);
    }
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(Error::TypeMismatch {
                expected: "array",
                found: other.kind_name(),
            })
        }
    };
    msg.open_inner('a', elem)?;
    for item in items {
        // a fresh iterator per element
        let mut it = SignatureIter::new(elem);
        encode_one(msg, &mut it, item)?;
    }
    msg.close_container()
}

fn encode_dict(msg: &mut Message, inner: &str, value: &Value) -> Result<()> {
    let entries = match value {
        Value::Dict(entries) => entries,
        other => {
            return Err(Error::TypeMismatch {
                expected: "dict",
                found: other.kind_name(),
            })
        }
    };
    let mut it = SignatureIter::new(inner);
    let key_token = it
        .next()
        .ok_or_else(|| Error::Signature("signature ended before dict key".to_owned()))?;
    let value_sig = it.rest();

    msg.open_inner('a', &format!("{{{}}}", inner))?;
    for (key, item) in entries {
        msg.open_inner('e', inner)?;
        msg.write_basic(key_token, &Value::from(key.clone()))?;
        let mut value_it = SignatureIter::new(value_sig);
        encode_one(msg, &mut value_it, item)?;
        msg.close_container()?;
    }
    msg.close_container()
}

fn encode_struct(msg: &mut Message, inner: &str, value: &Value) -> Result<()> {
    let fields = match value {
        Value::Struct(fields) => fields,
        other => {
            return Err(Error::TypeMismatch {
                expected: "struct",
                found: other.kind_name(),
            })
        }
    };
    msg.open_inner('r', inner)?;
    // one shared iterator across all members, so arity mismatches surface
    let mut it = SignatureIter::new(inner);
    for field in fields {
        if it.is_empty() {
            return Err(Error::TypeMismatch {
                expected: "struct arity matching its signature",
                found: "too many fields",
            });
        }
        encode_one(msg, &mut it, field)?;
    }
    if !it.is_empty() {
        return Err(Error::TypeMismatch {
            expected: "struct arity matching its signature",
            found: "too few fields",
        });
    }
    msg.close_container()
}

fn encode_variant(msg: &mut Message, value: &Value) -> Result<()> {
    let (sig, inner) = match value {
        Value::Variant(sig, inner) => (sig, inner),
        other => {
            return Err(Error::TypeMismatch {
                expected: "variant",
                found: other.kind_name(),
            })
        }
    };
    let mut it = SignatureIter::new(sig);
    find_array_element(&mut it)?;
    if !it.is_empty() {
        return Err(Error::Signature(
            "variant contents must be one complete type".to_owned(),
        ));
    }
    msg.open_inner('v', sig)?;
    let mut it = SignatureIter::new(sig);
    encode_one(msg, &mut it, inner)?;
    msg.close_container()
}

fn decode_one(msg: &mut Message, iter: &mut SignatureIter<'_>) -> Result<Value> {
    match iter.next() {
        Some(token) if is_basic_token(token) => msg.read_basic(token),
        Some('a') => {
            let elem = find_array_element(iter)?;
            decode_array(msg, &elem)
        }
        Some('(') => {
            let inner = find_struct_end(iter)?;
            decode_struct(msg, &inner)
        }
        Some('v') => decode_variant(msg),
        Some('{') => Err(Error::Signature(
            "dict entry is only legal inside an array".to_owned(),
        )),
        Some(token) => Err(Error::Signature(format!("unknown token '{}'", token))),
        None => Err(Error::Signature("signature ended early".to_owned())),
    }
}

fn decode_array(msg: &mut Message, elem: &str) -> Result<Value> {
    if elem == "y" {
        return Ok(Value::Bytes(msg.read_byte_array()?));
    }
    if let Some(entry) = elem.strip_prefix('{') {
        let inner = entry
            .strip_suffix('}')
            .ok_or_else(|| Error::Signature("unterminated dict entry".to_owned()))?;
        return decode_dict(msg, inner);
    }
    msg.enter_inner('a', elem)?;
    let mut items = Vec::new();
    while msg.container_remaining()? {
        let mut it = SignatureIter::new(elem);
        items.push(decode_one(msg, &mut it)?);
    }
    msg.exit_container()?;
    Ok(Value::Array(items))
}

fn decode_dict(msg: &mut Message, inner: &str) -> Result<Value> {
    let mut it = SignatureIter::new(inner);
    let key_token = it
        .next()
        .ok_or_else(|| Error::Signature("signature ended before dict key".to_owned()))?;
    let value_sig = it.rest().to_owned();

    msg.enter_inner('a', &format!("{{{}}}", inner))?;
    let mut entries = BTreeMap::new();
    while msg.container_remaining()? {
        msg.enter_inner('e', inner)?;
        let key = DictKey::try_from(msg.read_basic(key_token)?)?;
        let mut value_it = SignatureIter::new(&value_sig);
        let value = decode_one(msg, &mut value_it)?;
        msg.exit_container()?;
        entries.insert(key, value);
    }
    msg.exit_container()?;
    Ok(Value::Dict(entries))
}

fn decode_struct(msg: &mut Message, inner: &str) -> Result<Value> {
    msg.enter_inner('r', inner)?;
    let mut fields = Vec::new();
    let mut it = SignatureIter::new(inner);
    while !it.is_empty() {
        fields.push(decode_one(msg, &mut it)?);
    }
    msg.exit_container()?;
    Ok(Value::Struct(fields))
}

fn decode_variant(msg: &mut Message) -> Result<Value> {
    let sig = msg.enter_variant()?;
    let mut it = SignatureIter::new(&sig);
    let value = decode_one(msg, &mut it)?;
    if !it.is_empty() {
        return Err(Error::Signature(
            "variant contents must be one complete type".to_owned(),
        ));
    }
    msg.exit_container()?;
    Ok(Value::Variant(sig, Box::new(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn sealed_with(sig: &str, values: &[Value]) -> Message {
        let mut msg = Message::new_signal("/", "org.example", "Test").unwrap();
        msg.append(sig, values).unwrap();
        msg.seal().unwrap();
        msg
    }

    #[test]
    fn basic_round_trips() {
        let cases: Vec<(&str, Value)> = vec![
            ("y", Value::U8(255)),
            ("b", Value::Bool(true)),
            ("n", Value::I16(-32768)),
            ("q", Value::U16(65535)),
            ("i", Value::I32(-1)),
            ("u", Value::U32(4000000000)),
            ("x", Value::I64(i64::MIN)),
            ("t", Value::U64(u64::MAX)),
            ("d", Value::F64(3.25)),
            ("s", Value::Str("hello".into())),
            ("o", Value::ObjectPath("/org/example".into())),
            ("g", Value::Signature("a{sv}".into())),
            ("h", Value::Fd(4)),
        ];
        for (sig, value) in cases {
            let mut msg = sealed_with(sig, std::slice::from_ref(&value));
            assert_eq!(msg.get_contents().unwrap(), Some(value), "sig {:?}", sig);
        }
    }

    #[test]
    fn variant_wire_layout() {
        // signature length, 'i', NUL, pad to 4, value
        let msg = sealed_with(
            "v",
            &[Value::Variant("i".into(), Box::new(Value::I32(37)))],
        );
        let frame = msg.to_wire(1).unwrap();
        let tail = &frame[frame.len() - 8..];
        assert_eq!(tail, &[1, b'i', 0, 0, 37, 0, 0, 0]);
    }

    #[test]
    fn byte_array_is_a_buffer() {
        let mut msg = sealed_with("ay", &[Value::Bytes(vec![1, 2, 3])]);
        assert_eq!(
            msg.get_contents().unwrap(),
            Some(Value::Bytes(vec![1, 2, 3]))
        );
    }

    #[test]
    fn array_round_trip() {
        let value = Value::Array(vec![Value::I32(1), Value::I32(-2), Value::I32(3)]);
        let mut msg = sealed_with("ai", &[value.clone()]);
        assert_eq!(msg.get_contents().unwrap(), Some(value));
    }

    #[test]
    fn nested_array_round_trip() {
        let value = Value::Array(vec![
            Value::Array(vec![Value::U64(1)]),
            Value::Array(vec![Value::U64(2), Value::U64(3)]),
        ]);
        let mut msg = sealed_with("aat", &[value.clone()]);
        assert_eq!(msg.get_contents().unwrap(), Some(value));
    }

    #[test]
    fn struct_round_trip() {
        let value = Value::Struct(vec![
            Value::I32(7),
            Value::Str("seven".into()),
            Value::Struct(vec![Value::U8(1), Value::U8(2)]),
        ]);
        let mut msg = sealed_with("(is(yy))", &[value.clone()]);
        assert_eq!(msg.get_contents().unwrap(), Some(value));
    }

    #[test]
    fn struct_arity_is_enforced() {
        let mut msg = Message::new_signal("/", "org.example", "Test").unwrap();
        let too_few = Value::Struct(vec![Value::I32(1)]);
        assert!(matches!(
            msg.append("(ii)", &[too_few]),
            Err(Error::TypeMismatch { .. })
        ));
        let mut msg = Message::new_signal("/", "org.example", "Test").unwrap();
        let too_many = Value::Struct(vec![Value::I32(1), Value::I32(2), Value::I32(3)]);
        assert!(matches!(
            msg.append("(ii)", &[too_many]),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn dict_round_trip() {
        let mut entries = BTreeMap::new();
        entries.insert(
            DictKey::Str("a".into()),
            Value::Variant("i".into(), Box::new(Value::I32(1))),
        );
        entries.insert(
            DictKey::Str("b".into()),
            Value::Variant("s".into(), Box::new(Value::Str("two".into()))),
        );
        let value = Value::Dict(entries);
        let mut msg = sealed_with("a{sv}", &[value.clone()]);
        assert_eq!(msg.get_contents().unwrap(), Some(value));
    }

    #[test]
    fn dict_with_integer_keys() {
        let mut entries = BTreeMap::new();
        entries.insert(DictKey::U32(1), Value::Str("one".into()));
        entries.insert(DictKey::U32(2), Value::Str("two".into()));
        let value = Value::Dict(entries);
        let mut msg = sealed_with("a{us}", &[value.clone()]);
        assert_eq!(msg.get_contents().unwrap(), Some(value));
    }

    #[test]
    fn array_of_struct_round_trip() {
        let value = Value::Array(vec![
            Value::Struct(vec![Value::U16(1), Value::Str("a".into())]),
            Value::Struct(vec![Value::U16(2), Value::Str("b".into())]),
        ]);
        let mut msg = sealed_with("a(qs)", &[value.clone()]);
        assert_eq!(msg.get_contents().unwrap(), Some(value));
    }

    #[test]
    fn variant_round_trip_keeps_signature() {
        let value = Value::Variant(
            "a{sv}".into(),
            Box::new(Value::Dict(BTreeMap::new())),
        );
        let mut msg = sealed_with("v", &[value.clone()]);
        assert_eq!(msg.get_contents().unwrap(), Some(value));
    }

    #[test]
    fn multi_token_body_decodes_to_tuple() {
        let mut msg = sealed_with("si", &[Value::from("x"), Value::I32(9)]);
        assert_eq!(
            msg.get_contents().unwrap(),
            Some(Value::Struct(vec![Value::Str("x".into()), Value::I32(9)]))
        );
    }

    #[test]
    fn empty_body_decodes_to_none() {
        let mut msg = Message::new_signal("/", "org.example", "Test").unwrap();
        msg.seal().unwrap();
        assert_eq!(msg.get_contents().unwrap(), None);
    }

    #[test]
    fn variant_must_hold_one_complete_type() {
        let mut msg = Message::new_signal("/", "org.example", "Test").unwrap();
        let bad = Value::Variant("ii".into(), Box::new(Value::I32(1)));
        assert!(matches!(
            msg.append("v", &[bad]),
            Err(Error::Signature(_))
        ));
    }

    #[test]
    fn value_count_must_match_signature() {
        let mut msg = Message::new_signal("/", "org.example", "Test").unwrap();
        assert!(matches!(
            msg.append("ii", &[Value::I32(1)]),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(matches!(
            msg.append("i", &[Value::I32(1), Value::I32(2)]),
            Err(Error::TypeMismatch { .. })
        ));
    }
}
