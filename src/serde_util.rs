//! Lenient numeric deserializers
//!
//! Provider APIs return 64-bit numbers as JSON strings (e.g. "1536964279000")
//! and may return null for folder entries.

use serde::{de, Deserializer};

struct FlexibleU64Visitor;

impl<'de> de::Visitor<'de> for FlexibleU64Visitor {
    type Value = Option<u64>;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a u64, a string containing a u64, or null")
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
        Ok(Some(value))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
        u64::try_from(value)
            .map(Some)
            .map_err(|_| de::Error::custom("negative value for u64"))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
        value.parse::<u64>().map(Some).map_err(de::Error::custom)
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }
}

/// A number that might be encoded as a string; null becomes 0
pub fn deserialize_flexible_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserializer
        .deserialize_any(FlexibleU64Visitor)?
        .unwrap_or(0))
}

/// A number that might be encoded as a string; null stays `None`
pub fn deserialize_flexible_opt_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(FlexibleU64Visitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Probe {
        #[serde(deserialize_with = "deserialize_flexible_u64")]
        required: u64,
        #[serde(default, deserialize_with = "deserialize_flexible_opt_u64")]
        optional: Option<u64>,
    }

    #[test]
    fn test_string_and_number() {
        let p: Probe = serde_json::from_str(r#"{"required":"42","optional":7}"#).unwrap();
        assert_eq!(p.required, 42);
        assert_eq!(p.optional, Some(7));
    }

    #[test]
    fn test_null_and_missing() {
        let p: Probe = serde_json::from_str(r#"{"required":null}"#).unwrap();
        assert_eq!(p.required, 0);
        assert_eq!(p.optional, None);

        let p: Probe = serde_json::from_str(r#"{"required":1,"optional":null}"#).unwrap();
        assert_eq!(p.optional, None);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(serde_json::from_str::<Probe>(r#"{"required":"abc"}"#).is_err());
        assert!(serde_json::from_str::<Probe>(r#"{"required":-1}"#).is_err());
    }
}
