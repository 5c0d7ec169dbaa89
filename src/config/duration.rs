//! Serde helpers for durations written as humantime strings (`30s`, `1h`).

use std::time::Duration;

use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&humantime::format_duration(*d))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(D::Error::custom)
}

pub mod option {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => super::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| humantime::parse_duration(raw.trim()).map_err(D::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Holder {
        #[serde(with = "super")]
        every: Duration,
        #[serde(default, with = "super::option")]
        grain: Option<Duration>,
    }

    #[test]
    fn parses_humantime_strings() {
        let h: Holder = serde_yaml::from_str("every: 1h\ngrain: 30m\n").unwrap();
        assert_eq!(h.every, Duration::from_secs(3600));
        assert_eq!(h.grain, Some(Duration::from_secs(1800)));

        let h: Holder = serde_yaml::from_str("every: 15s\n").unwrap();
        assert_eq!(h.grain, None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(serde_yaml::from_str::<Holder>("every: soon\n").is_err());
    }

    #[test]
    fn serializes_back_to_humantime() {
        let h = Holder {
            every: Duration::from_secs(3600),
            grain: None,
        };
        assert_eq!(serde_json::to_string(&h).unwrap(), r#"{"every":"1h","grain":null}"#);
    }
}
