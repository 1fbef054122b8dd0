//! Duration parsing and serde codecs shared across the orchestrator.
//!
//! Every config section that carries a duration (phase timeouts, webhook
//! client timeout, retry base/max delay) accepts either a human-readable
//! string (`"30s"`, `"2m"`, parsed via [`humantime`]) or a raw millisecond
//! count, and always serializes back out as milliseconds so persisted
//! config/state round-trips without re-parsing ambiguity.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Deserialize a `Duration` from either a string (human-readable) or u64 (milliseconds).
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a `Duration` as milliseconds (u64) so it round-trips with [`deserialize_duration`].
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Parse a human-readable duration string, with file/field context on error.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(s).map_err(|e| anyhow::anyhow!("invalid duration '{s}': {e}"))
}
