//! Serde adapters for binary payloads carried inside JSON bodies

/// `Vec<u8>` as a standard base64 string
///
/// ```rust,ignore
/// #[serde(with = "crate::types::encoding::base64_bytes")]
/// pub data: Vec<u8>,
/// ```
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Blob {
        #[serde(with = "super::base64_bytes")]
        data: Vec<u8>,
    }

    #[test]
    fn test_encodes_as_string() {
        let json = serde_json::to_value(Blob { data: b"hi".to_vec() }).unwrap();
        assert_eq!(json["data"], "aGk=");
    }

    #[test]
    fn test_rejects_invalid_base64() {
        let err = serde_json::from_str::<Blob>(r#"{"data":"***"}"#).unwrap_err();
        assert!(err.is_data());
    }
}
