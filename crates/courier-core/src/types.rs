//! Core types for the Courier synchronization layer
//!
//! Identifiers are newtypes over the opaque strings the server and the local
//! discovery channel hand us, so a conversation id can never be passed where a
//! user id is expected.

use core::fmt;
use core::ops::{Add, Sub};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Identifiers
// ----------------------------------------------------------------------------

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Server-assigned user identifier
    UserId
);

string_id!(
    /// Server-assigned conversation identifier
    ConversationId
);

string_id!(
    /// Server-assigned message identifier, present only once the message is persisted
    MessageId
);

string_id!(
    /// Client-generated token linking an optimistic message to its confirmation
    CorrelationId
);

string_id!(
    /// Opaque peer identifier handed out by the local discovery channel
    DeviceAddress
);

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(other))
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Parse an RFC 3339 date string as sent by the server
    pub fn from_rfc3339(value: &str) -> Option<Self> {
        chrono::DateTime::parse_from_rfc3339(value)
            .ok()
            .and_then(|dt| u64::try_from(dt.timestamp_millis()).ok())
            .map(Self)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Get duration since another timestamp
    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        core::time::Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Source of timestamps for optimistic messages and state transitions
///
/// Tests swap in a controllable clock; production uses [`SystemTimeSource`].
pub trait TimeSource {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall-clock implementation of TimeSource
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

impl<T: TimeSource + ?Sized> TimeSource for &T {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

// ----------------------------------------------------------------------------
// Connectivity Mode
// ----------------------------------------------------------------------------

/// Which channel the client uses to talk to other people
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectivityMode {
    /// Server-backed conversations over the event-stream connection
    #[default]
    Online,
    /// Server connection intentionally disabled; local device-to-device chat only
    OfflineLocal,
}

impl fmt::Display for ConnectivityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityMode::Online => write!(f, "online"),
            ConnectivityMode::OfflineLocal => write!(f, "offline-local"),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_ids_are_distinct_types() {
        let user = UserId::new("u1");
        let conversation = ConversationId::from("c1");
        assert_eq!(user.as_str(), "u1");
        assert_eq!(conversation.to_string(), "c1");
    }

    #[test]
    fn test_timestamp_rfc3339() {
        let ts = Timestamp::from_rfc3339("2024-01-01T00:00:01.500Z").unwrap();
        assert_eq!(ts.as_millis(), 1_704_067_201_500);
        assert!(Timestamp::from_rfc3339("yesterday").is_none());
    }

    #[test]
    fn test_timestamp_arithmetic_saturates() {
        let early = Timestamp::new(10);
        let late = Timestamp::new(25);
        assert_eq!(late - early, 15);
        assert_eq!(early - late, 0);
        assert_eq!((early + 5).as_millis(), 15);
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(ConnectivityMode::OfflineLocal.to_string(), "offline-local");
        assert_eq!(ConnectivityMode::default(), ConnectivityMode::Online);
    }
}
