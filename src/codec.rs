//! Boundary codec for values crossing the sandbox.
//!
//! Both directions use a single scheme: MessagePack payloads wrapped in a
//! u32 little-endian length prefix. MessagePack is self-delimiting, keeps
//! integers and floats distinct, and has decoders available inside the
//! sandboxed engine. The scheme is fixed for the life of a compiled
//! handler; changing it requires bumping the engine version tag so
//! fingerprints (and therefore cached bytecode) roll over.

use crate::error::{Result, RuntimeError};
use crate::value::RuntimeValue;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode any serializable value as a MessagePack payload.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    // Struct maps are encoded with field names so the guest-side decoder
    // does not depend on field order.
    rmp_serde::encode::to_vec_named(value).map_err(Into::into)
}

/// Decode a MessagePack payload.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::decode::from_slice(bytes).map_err(Into::into)
}

/// Encode a runtime value.
pub fn encode_value(value: &RuntimeValue) -> Result<Vec<u8>> {
    encode(value)
}

/// Decode a runtime value.
pub fn decode_value(bytes: &[u8]) -> Result<RuntimeValue> {
    decode(bytes)
}

/// Append a length-prefixed frame to `out`.
pub fn write_frame(out: &mut Vec<u8>, payload: &[u8]) {
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Split one length-prefixed frame off the front of `buf`.
///
/// Returns the frame payload and the remaining bytes.
pub fn read_frame(buf: &[u8]) -> Result<(&[u8], &[u8])> {
    if buf.len() < 4 {
        return Err(RuntimeError::Serialization(
            "frame shorter than length prefix".into(),
        ));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&buf[..4]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    let rest = &buf[4..];
    if rest.len() < len {
        return Err(RuntimeError::Serialization(format!(
            "frame truncated: prefix says {} bytes, {} available",
            len,
            rest.len()
        )));
    }
    Ok((&rest[..len], &rest[len..]))
}

/// Encode a value into a single length-prefixed frame.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = encode(value)?;
    let mut out = Vec::with_capacity(payload.len() + 4);
    write_frame(&mut out, &payload);
    Ok(out)
}

/// Decode a value from a single length-prefixed frame, rejecting trailing
/// bytes.
pub fn decode_frame<T: DeserializeOwned>(buf: &[u8]) -> Result<T> {
    let (payload, rest) = read_frame(buf)?;
    if !rest.is_empty() {
        return Err(RuntimeError::Serialization(format!(
            "{} unexpected trailing bytes after frame",
            rest.len()
        )));
    }
    decode(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_value_roundtrip_preserves_int_float() {
        let int = RuntimeValue::Int(42);
        let float = RuntimeValue::Float(42.0);

        let int_back = decode_value(&encode_value(&int).unwrap()).unwrap();
        let float_back = decode_value(&encode_value(&float).unwrap()).unwrap();

        assert_eq!(int_back, RuntimeValue::Int(42));
        assert_eq!(float_back, RuntimeValue::Float(42.0));
        assert_ne!(int_back, float_back);
    }

    #[test]
    fn test_nested_value_roundtrip() {
        let mut map = HashMap::new();
        map.insert("status".to_string(), RuntimeValue::from("ok"));
        map.insert(
            "items".to_string(),
            RuntimeValue::List(vec![RuntimeValue::Int(1), RuntimeValue::Null]),
        );
        let value = RuntimeValue::Map(map);

        let back = decode_value(&encode_value(&value).unwrap()).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = encode_frame(&RuntimeValue::from("payload")).unwrap();
        let back: RuntimeValue = decode_frame(&frame).unwrap();
        assert_eq!(back, RuntimeValue::from("payload"));
    }

    #[test]
    fn test_frame_split() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"first");
        write_frame(&mut buf, b"second");

        let (one, rest) = read_frame(&buf).unwrap();
        assert_eq!(one, b"first");
        let (two, rest) = read_frame(rest).unwrap();
        assert_eq!(two, b"second");
        assert!(rest.is_empty());
    }

    #[test]
    fn test_truncated_frame_rejected() {
        assert!(read_frame(&[1, 0]).is_err());
        assert!(read_frame(&[10, 0, 0, 0, b'x']).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut frame = encode_frame(&RuntimeValue::Null).unwrap();
        frame.push(0xff);
        assert!(decode_frame::<RuntimeValue>(&frame).is_err());
    }
}
