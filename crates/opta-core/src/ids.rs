use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7().simple()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(SessionId, "sess");
branded_id!(TurnId, "turn");
branded_id!(DaemonId, "daemon");
branded_id!(ToolCallId, "call");
branded_id!(PermissionRequestId, "perm");

// Writers and clients name themselves; the generated form only shows up in tests
// and for anonymous submissions.
branded_id!(WriterId, "writer");
branded_id!(ClientId, "client");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix() {
        assert!(SessionId::new().as_str().starts_with("sess_"));
        assert!(TurnId::new().as_str().starts_with("turn_"));
        assert!(DaemonId::new().as_str().starts_with("daemon_"));
        assert!(PermissionRequestId::new().as_str().starts_with("perm_"));
    }

    #[test]
    fn turn_ids_sort_by_creation() {
        let ids: Vec<TurnId> = (0..100).map(|_| TurnId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }

    #[test]
    fn from_raw_preserves_client_supplied_value() {
        let writer = WriterId::from_raw("tui-main");
        assert_eq!(writer.as_str(), "tui-main");
        assert_eq!(serde_json::to_string(&writer).unwrap(), "\"tui-main\"");
    }

    #[test]
    fn blank_ids_report_empty() {
        assert!(WriterId::from_raw("  ").is_empty());
        assert!(!WriterId::from_raw("a").is_empty());
    }
}
