//! Durées lisibles (`500ms`, `5s`, `2m`, `1h`)

use std::time::Duration;

/// Analyse une durée de la forme `<nombre><unité>`.
///
/// Unités acceptées : `ms`, `s`, `m`, `h`. Un nombre sans unité est en secondes.
/// Les valeurs fractionnaires sont permises (`1.5s`).
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {input:?}"))?;

    let seconds = match unit.trim() {
        "ms" => value / 1000.0,
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit {other:?} in {input:?}")),
    };

    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration {input:?}: {e}"))
}

/// Forme canonique d'une durée, relisible par [`parse_duration`]
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 != 0 || ms == 0 {
        format!("{ms}ms")
    } else {
        format!("{}s", ms / 1000)
    }
}

pub(crate) mod serde_str {
    use super::{format_duration, parse_duration};
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Seconds(u64),
        }

        match Raw::deserialize(d)? {
            Raw::Text(s) => parse_duration(&s).map_err(de::Error::custom),
            Raw::Seconds(n) => Ok(Duration::from_secs(n)),
        }
    }
}
