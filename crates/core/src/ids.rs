use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! text_id {
    ($name:ident) => {
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn from_string(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let short = self.0.get(..8).unwrap_or(&self.0);
                write!(f, "{}({})", stringify!($name), short)
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

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

text_id!(ChangeId);
text_id!(ChangeSetId);
text_id!(CommitId);
text_id!(VersionId);
text_id!(ConflictId);

/// Id of the version every other version inherits from.
pub const GLOBAL_VERSION_ID: &str = "global";

impl VersionId {
    pub fn global() -> Self {
        Self(GLOBAL_VERSION_ID.to_string())
    }

    pub fn is_global(&self) -> bool {
        self.0 == GLOBAL_VERSION_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_are_unique() {
        let a = CommitId::new();
        let b = CommitId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn debug_is_abbreviated() {
        let id = ChangeId::from_string("0123456789abcdef");
        assert_eq!(format!("{id:?}"), "ChangeId(01234567)");
        assert_eq!(id.to_string(), "0123456789abcdef");

        let short = ChangeId::from("e1");
        assert_eq!(format!("{short:?}"), "ChangeId(e1)");
    }

    #[test]
    fn global_version() {
        assert!(VersionId::global().is_global());
        assert!(!VersionId::new().is_global());
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = VersionId::from("main");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"main\"");
    }
}
