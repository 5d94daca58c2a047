//! Identifier newtypes.
//!
//! Connections, users and groups are all identified by opaque strings. Wrapping
//! them keeps the three from being mixed up at call sites.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum group id length.
pub const MAX_GROUP_ID_LENGTH: usize = 256;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the id as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume the id, returning the inner string.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a single transport-level connection.
    ConnectionId
);

string_id!(
    /// Identifier of an authenticated user.
    UserId
);

string_id!(
    /// Identifier of a group (a conversation).
    GroupId
);

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

impl ConnectionId {
    /// Generate a process-unique connection id.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }
}

impl GroupId {
    /// Validate a group id.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the id is invalid.
    pub fn validate(&self) -> Result<(), &'static str> {
        let id = self.as_str();
        if id.is_empty() {
            return Err("Group id cannot be empty");
        }
        if id.len() > MAX_GROUP_ID_LENGTH {
            return Err("Group id too long");
        }
        if id.starts_with('$') {
            return Err("Group ids starting with '$' are reserved");
        }
        if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
            return Err("Group id contains invalid characters");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_connection_ids_are_unique() {
        let ids: HashSet<_> = (0..1000).map(|_| ConnectionId::generate()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| id.as_str().starts_with("conn_")));
    }

    #[test]
    fn test_group_id_validation() {
        assert!(GroupId::from("conversation:42").validate().is_ok());
        assert!(GroupId::from("").validate().is_err());
        assert!(GroupId::from("$system").validate().is_err());
        assert!(GroupId::from("tab\there").validate().is_err());

        let long = GroupId::new("g".repeat(MAX_GROUP_ID_LENGTH + 1));
        assert!(long.validate().is_err());
    }

    #[test]
    fn test_lookup_by_str() {
        let mut set = HashSet::new();
        set.insert(UserId::from("alice"));
        assert!(set.contains("alice"));
        assert!(!set.contains("bob"));
    }
}
