//! Unix timestamps for authorization windows.
//!
//! A signed payment intent is only valid between its `issuedAt` and `validBefore`
//! instants, and a requirement may carry its own `validUntil`. All three are
//! [`UnixTimestamp`] values.

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::time::{Duration, SystemTime};

/// Seconds since the Unix epoch.
///
/// Serialized as a stringified integer so 64-bit values survive JavaScript
/// clients. Deserialization also accepts a bare JSON number, which is what many
/// servers put into `validUntil`.
///
/// ```
/// use x402_treasurer_types::timestamp::UnixTimestamp;
///
/// let issued = UnixTimestamp::from_secs(1_700_000_000);
/// let expires = issued + 60;
/// assert_eq!(expires.as_secs(), 1_700_000_060);
/// assert_eq!(serde_json::to_string(&expires).unwrap(), "\"1700000060\"");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash)]
pub struct UnixTimestamp(u64);

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            String(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(secs) => Ok(UnixTimestamp(secs)),
            Raw::String(s) => s
                .parse::<u64>()
                .map(UnixTimestamp)
                .map_err(|_| de::Error::custom("timestamp must be a non-negative integer")),
        }
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        UnixTimestamp(self.0.saturating_add(rhs))
    }
}

impl Add<Duration> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        self + rhs.as_secs()
    }
}

impl UnixTimestamp {
    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Returns the current system time.
    ///
    /// # Panics
    ///
    /// Panics if the system clock is set before the Unix epoch.
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("SystemTime before UNIX epoch?!?")
            .as_secs();
        Self(now)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Whole seconds from `self` until `later`, or zero if `later` is not after `self`.
    pub fn seconds_until(&self, later: UnixTimestamp) -> u64 {
        later.0.saturating_sub(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_string_and_number() {
        let a: UnixTimestamp = serde_json::from_str("\"1699999999\"").unwrap();
        let b: UnixTimestamp = serde_json::from_str("1699999999").unwrap();
        assert_eq!(a, b);
        assert!(serde_json::from_str::<UnixTimestamp>("\"-1\"").is_err());
        assert!(serde_json::from_str::<UnixTimestamp>("\"soon\"").is_err());
    }

    #[test]
    fn test_add_duration() {
        let ts = UnixTimestamp::from_secs(100) + Duration::from_millis(60_900);
        assert_eq!(ts.as_secs(), 160);
        assert_eq!(UnixTimestamp::from_secs(100).seconds_until(ts), 60);
        assert_eq!(ts.seconds_until(UnixTimestamp::from_secs(100)), 0);
    }
}
