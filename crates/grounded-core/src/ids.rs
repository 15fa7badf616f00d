use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Newtype string id. Locally minted ids carry a prefix; ids handed out by an
/// upstream service are wrapped verbatim with `from_raw`.
macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
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

branded_id!(ToolCallId, "call");
branded_id!(RunId, "run");
branded_id!(ThreadId, "thread");
branded_id!(AgentId, "asst");
branded_id!(ExchangeId, "exch");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_carry_prefix() {
        assert!(ToolCallId::new().as_str().starts_with("call_"));
        assert!(RunId::new().as_str().starts_with("run_"));
        assert!(ThreadId::new().as_str().starts_with("thread_"));
        assert!(AgentId::new().as_str().starts_with("asst_"));
        assert!(ExchangeId::new().as_str().starts_with("exch_"));
    }

    #[test]
    fn upstream_ids_are_kept_verbatim() {
        let id = ToolCallId::from_raw("call_abc123");
        assert_eq!(id.as_str(), "call_abc123");
        assert_eq!(id.to_string(), "call_abc123");
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = RunId::from_raw("run_42");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""run_42""#);
        let parsed: RunId = serde_json::from_str(r#""run_42""#).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn minted_ids_are_monotonic() {
        let ids: Vec<ExchangeId> = (0..50).map(|_| ExchangeId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
