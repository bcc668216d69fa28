//! Payload encoding for broker storage.

use crate::error::RedqResult;
use crate::task::Payload;

/// Turns payloads into the bytes stored in the broker and back.
///
/// Encoding must be deterministic: insert-if-absent on the ETA set compares
/// the encoded bytes, so equal payloads have to produce equal bytes.
pub trait Serializer: Send + Sync + std::fmt::Debug {
    /// Encode a payload.
    fn encode(&self, payload: &Payload) -> RedqResult<Vec<u8>>;

    /// Decode bytes produced by [`Serializer::encode`].
    fn decode(&self, bytes: &[u8]) -> RedqResult<Payload>;
}

/// JSON serializer backed by `serde_json`.
///
/// Keyword arguments are kept in a sorted map, so the output is stable.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, payload: &Payload) -> RedqResult<Vec<u8>> {
        Ok(serde_json::to_vec(payload)?)
    }

    fn decode(&self, bytes: &[u8]) -> RedqResult<Payload> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RedqError;
    use serde_json::json;

    fn nested_payload() -> Payload {
        Payload {
            name: "sync_account".to_string(),
            queue: "high".to_string(),
            args: vec![
                json!(1),
                json!("two"),
                json!({"deep": {"list": [1, {"x": null}], "flag": true}}),
                json!([[1.5, -2], []]),
            ],
            kwargs: json!({"zeta": {"a": [1, 2]}, "alpha": "first"})
                .as_object()
                .unwrap()
                .clone(),
        }
    }

    #[test]
    fn test_nested_payload_survives_encoding() {
        let serializer = JsonSerializer;
        let payload = nested_payload();

        let bytes = serializer.encode(&payload).unwrap();
        let decoded = serializer.decode(&bytes).unwrap();
        assert_eq!(decoded, payload);

        // Bytes that came out of the encoder re-encode to themselves.
        assert_eq!(serializer.encode(&decoded).unwrap(), bytes);
    }

    #[test]
    fn test_encoding_is_independent_of_kwarg_insertion_order() {
        let serializer = JsonSerializer;
        let mut a = nested_payload();
        a.kwargs.clear();
        a.kwargs.insert("b".to_string(), json!(2));
        a.kwargs.insert("a".to_string(), json!(1));

        let mut b = a.clone();
        b.kwargs.clear();
        b.kwargs.insert("a".to_string(), json!(1));
        b.kwargs.insert("b".to_string(), json!(2));

        assert_eq!(serializer.encode(&a).unwrap(), serializer.encode(&b).unwrap());
    }

    #[test]
    fn test_float_arguments_decode_exactly() {
        let serializer = JsonSerializer;
        let mut floats = vec![
            971.9863718547629,
            124.89148443491327,
            0.1 + 0.2,
            -1.0 / 3.0,
            1e-300,
            6.02214076e23,
            f64::MIN_POSITIVE,
            f64::MAX,
            f64::EPSILON,
        ];
        // Deterministic spread over [0, 1000).
        let mut state = 0x2545_f491_4f6c_dd1du64;
        for _ in 0..5_000 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            floats.push((state >> 11) as f64 / (1u64 << 53) as f64 * 1000.0);
        }

        let mut payload = nested_payload();
        payload.args = floats.iter().map(|f| json!(f)).collect();
        payload.kwargs.insert("ratio".to_string(), json!(floats[0]));

        let decoded = serializer.decode(&serializer.encode(&payload).unwrap()).unwrap();
        for (arg, expected) in decoded.args.iter().zip(&floats) {
            assert_eq!(arg.as_f64().unwrap().to_bits(), expected.to_bits());
        }
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = JsonSerializer.decode(b"{\"name\": 1}").unwrap_err();
        assert!(matches!(err, RedqError::SerializationError(_)));
    }
}
