//! Serde codecs for `Duration` fields that accept either a human-readable
//! string (`"30s"`, `"5m"`) or a raw millisecond integer.

use std::fmt;
use std::time::Duration;

use serde::de::{self, Visitor};
use serde::{Deserializer, Serializer};

/// Deserialize a [`Duration`] from either a humantime string or an integer
/// number of milliseconds.
///
/// Use via `#[serde(with = "archiver_duration")]` on a `Duration` field.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a humantime string (\"30s\") or a millisecond integer")
        }

        fn visit_str<E>(self, v: &str) -> Result<Duration, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v).map_err(de::Error::custom)
        }

        fn visit_u64<E>(self, v: u64) -> Result<Duration, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_millis(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Duration, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(de::Error::custom("duration milliseconds must not be negative"));
            }
            Ok(Duration::from_millis(v as u64))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

/// Serialize a [`Duration`] as a humantime string.
pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

/// Same codecs for `Option<Duration>`, so config fields can be left unset.
pub mod option {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        // `#[serde(default)]` on the field handles "key absent"; here we only
        // need to accept an explicit `null` alongside string/integer forms.
        match Option::<serde_json::Value>::deserialize(deserializer)? {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) => {
                humantime::parse_duration(&s).map(Some).map_err(de::Error::custom)
            }
            Some(serde_json::Value::Number(n)) => {
                let millis = n
                    .as_u64()
                    .ok_or_else(|| de::Error::custom("duration milliseconds must be a non-negative integer"))?;
                Ok(Some(Duration::from_millis(millis)))
            }
            Some(other) => Err(de::Error::custom(format!(
                "expected duration string or integer milliseconds, got {other}"
            ))),
        }
    }

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => super::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Wrapper {
        #[serde(with = "crate")]
        timeout: Duration,
    }

    #[test]
    fn parses_humantime_string() {
        let parsed: Wrapper = serde_json::from_str(r#"{"timeout": "30s"}"#).unwrap();
        assert_eq!(parsed.timeout, Duration::from_secs(30));
    }

    #[test]
    fn parses_millisecond_integer() {
        let parsed: Wrapper = serde_json::from_str(r#"{"timeout": 1500}"#).unwrap();
        assert_eq!(parsed.timeout, Duration::from_millis(1500));
    }

    #[test]
    fn round_trips_through_serialize() {
        let original = Wrapper {
            timeout: Duration::from_secs(300),
        };
        let json = serde_json::to_string(&original).unwrap();
        let parsed: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn rejects_negative_milliseconds() {
        let err = serde_json::from_str::<Wrapper>(r#"{"timeout": -5}"#).unwrap_err();
        assert!(err.to_string().contains("negative"));
    }

    #[test]
    fn toml_five_minutes_string() {
        #[derive(Deserialize)]
        struct Cfg {
            #[serde(with = "crate")]
            timeout: Duration,
        }
        let cfg: Cfg = toml::from_str("timeout = \"5m\"").unwrap();
        assert_eq!(cfg.timeout, Duration::from_secs(300));
    }
}
