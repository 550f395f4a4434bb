//! User identity
//!
//! The signaling server addresses users by an opaque identifier that may be a
//! JSON string or a JSON number depending on the backing user store. `UserId`
//! keeps whichever form it was given so that it is echoed back to the server
//! exactly as received.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;

/// Opaque user identifier used to route signaling events
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserId {
    /// Numeric identifier (e.g. a database primary key)
    Numeric(u64),
    /// Textual identifier
    Text(String),
}

impl UserId {
    /// Create a textual user identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Get the string representation
    #[must_use]
    pub fn to_string_repr(&self) -> String {
        self.to_string()
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Error returned when parsing an empty user identifier
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("user id cannot be empty")]
pub struct EmptyUserId;

impl FromStr for UserId {
    type Err = EmptyUserId;

    /// All-digit input becomes [`UserId::Numeric`], anything else is text.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EmptyUserId);
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = s.parse::<u64>() {
                return Ok(Self::Numeric(n));
            }
        }
        Ok(Self::Text(s.to_string()))
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<u64> for UserId {
    fn from(n: u64) -> Self {
        Self::Numeric(n)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_display() {
        assert_eq!(UserId::new("alice").to_string(), "alice");
        assert_eq!(UserId::Numeric(17).to_string_repr(), "17");
    }

    #[test]
    fn test_user_id_keeps_json_form() {
        let numeric: UserId = serde_json::from_str("42").unwrap();
        assert_eq!(numeric, UserId::Numeric(42));
        assert_eq!(serde_json::to_string(&numeric).unwrap(), "42");

        let text: UserId = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(text, UserId::Text("42".to_string()));
        assert_eq!(serde_json::to_string(&text).unwrap(), "\"42\"");
    }

    #[test]
    fn test_user_id_from_str() {
        assert_eq!("42".parse::<UserId>().unwrap(), UserId::Numeric(42));
        assert_eq!(" bob ".parse::<UserId>().unwrap(), UserId::new("bob"));
        assert_eq!("".parse::<UserId>(), Err(EmptyUserId));
        // Too large for u64 falls back to text
        let big = "99999999999999999999999";
        assert_eq!(big.parse::<UserId>().unwrap(), UserId::new(big));
    }
}
