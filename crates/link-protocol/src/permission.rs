//! Ordered access levels gating `set` and `invoke`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Access level.  The derived ordering is the access order:
/// `None < Read < Write < Config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Permission {
    #[default]
    None,
    Read,
    Write,
    Config,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::None => "none",
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Config => "config",
        }
    }

    /// `true` when a peer holding `self` may perform an operation that
    /// requires `required`.
    pub fn allows(self, required: Permission) -> bool {
        self >= required
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a permission string is not one of the four levels.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown permission: {0}")]
pub struct UnknownPermission(pub String);

impl FromStr for Permission {
    type Err = UnknownPermission;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Permission::None),
            "read" => Ok(Permission::Read),
            "write" => Ok(Permission::Write),
            "config" => Ok(Permission::Config),
            _ => Err(UnknownPermission(s.to_owned())),
        }
    }
}

impl Serialize for Permission {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Permission {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_totally_ordered() {
        assert!(Permission::None < Permission::Read);
        assert!(Permission::Read < Permission::Write);
        assert!(Permission::Write < Permission::Config);
    }

    #[test]
    fn allows_equal_or_higher() {
        assert!(Permission::Write.allows(Permission::Write));
        assert!(Permission::Config.allows(Permission::Read));
        assert!(!Permission::Read.allows(Permission::Write));
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("WRITE".parse::<Permission>().unwrap(), Permission::Write);
        assert_eq!("Config".parse::<Permission>().unwrap(), Permission::Config);
        assert!("admin".parse::<Permission>().is_err());
    }

    #[test]
    fn serializes_as_lowercase_string() {
        assert_eq!(serde_json::to_string(&Permission::Read).unwrap(), "\"read\"");
        let p: Permission = serde_json::from_str("\"config\"").unwrap();
        assert_eq!(p, Permission::Config);
    }
}
