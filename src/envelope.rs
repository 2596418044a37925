//! Self-describing typed envelopes for analyzer results.
//!
//! An analyzer's output travels as a `(type name, packed bytes, json)`
//! triple. The packed bytes carry their own type URL so a later analyzer can
//! recover the original value without knowing which analyzer produced it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;

/// A payload type analyzers exchange through the scan context.
///
/// `TYPE_NAME` must be globally unique; it doubles as the envelope name and
/// the packed value's type URL.
pub trait TypedPayload: Serialize + DeserializeOwned {
    const TYPE_NAME: &'static str;
}

/// Serialized payload wrapped with the type URL it decodes as.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnyValue {
    pub type_url: String,
    pub value: Vec<u8>,
}

/// Self-describing analyzer output: payload type name, packed bytes and a
/// canonical JSON rendering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanResponse {
    pub name: String,
    pub data: AnyValue,
    pub json: String,
}

/// Wraps `value` into an envelope.
pub fn to_response<T: TypedPayload>(value: &T) -> Result<ScanResponse, EnvelopeError> {
    let packed = bincode::serialize(value).map_err(|source| EnvelopeError::Encode {
        name: T::TYPE_NAME.to_string(),
        source,
    })?;
    let json = serde_json::to_string(value).map_err(|source| EnvelopeError::Json {
        name: T::TYPE_NAME.to_string(),
        source,
    })?;
    Ok(ScanResponse {
        name: T::TYPE_NAME.to_string(),
        data: AnyValue {
            type_url: T::TYPE_NAME.to_string(),
            value: packed,
        },
        json,
    })
}

impl ScanResponse {
    /// Recovers the typed payload, verifying the recorded type URL first.
    pub fn unpack<T: TypedPayload>(&self) -> Result<T, EnvelopeError> {
        if self.data.type_url != T::TYPE_NAME {
            return Err(EnvelopeError::TypeMismatch {
                expected: T::TYPE_NAME.to_string(),
                found: self.data.type_url.clone(),
            });
        }
        bincode::deserialize(&self.data.value).map_err(|source| EnvelopeError::Decode {
            name: T::TYPE_NAME.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        count: u64,
        label: String,
    }

    impl TypedPayload for Sample {
        const TYPE_NAME: &'static str = "treport.test.Sample";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Other {
        count: u64,
    }

    impl TypedPayload for Other {
        const TYPE_NAME: &'static str = "treport.test.Other";
    }

    #[test]
    fn test_round_trip_is_lossless() {
        let sample = Sample {
            count: 7,
            label: "blobs".into(),
        };
        let response = to_response(&sample).unwrap();
        assert_eq!(response.name, "treport.test.Sample");
        assert_eq!(response.data.type_url, "treport.test.Sample");

        let back: Sample = response.unpack().unwrap();
        assert_eq!(back, sample);
    }

    #[test]
    fn test_json_projection_is_stable() {
        let a = to_response(&Sample { count: 1, label: "x".into() }).unwrap();
        let b = to_response(&Sample { count: 1, label: "x".into() }).unwrap();
        assert_eq!(a.json, b.json);
        assert_eq!(a.json, r#"{"count":1,"label":"x"}"#);
    }

    #[test]
    fn test_unpack_rejects_foreign_type() {
        let response = to_response(&Sample { count: 1, label: "x".into() }).unwrap();
        let err = response.unpack::<Other>().unwrap_err();
        assert!(matches!(err, EnvelopeError::TypeMismatch { .. }));
    }
}
