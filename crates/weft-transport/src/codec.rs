//! CBOR serialization helpers for the Weft wire protocol.
//!
//! Wraps [`ciborium`] to provide convenient serialization and
//! deserialization of protocol payloads with crate-level error mapping.
//! A decode failure is always a local error, never a panic.

use serde::{de::DeserializeOwned, Serialize};

use crate::TransportError;

/// Serialize a value to CBOR bytes.
///
/// # Errors
///
/// Returns [`TransportError::Serialization`] if the value cannot be
/// serialized.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| TransportError::Serialization(format!("CBOR serialization failed: {e}")))?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
///
/// # Errors
///
/// Returns [`TransportError::Deserialization`] if the bytes cannot be
/// deserialized into the target type.
pub fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, TransportError> {
    ciborium::from_reader(data)
        .map_err(|e| TransportError::Deserialization(format!("CBOR deserialization failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let value = (42u64, "weft".to_string(), vec![1u8, 2, 3]);
        let bytes = to_vec(&value).expect("serialize");
        let restored: (u64, String, Vec<u8>) = from_slice(&bytes).expect("deserialize");
        assert_eq!(value, restored);
    }

    #[test]
    fn test_invalid_data_returns_error() {
        let bad = [0xFFu8, 0xFF, 0xFF];
        let result: Result<u64, _> = from_slice(&bad);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_data_returns_error() {
        let result: Result<u64, _> = from_slice(&[]);
        assert!(result.is_err());
    }
}
