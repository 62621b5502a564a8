use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::{ReqSessionError, Result};

/// Engine role within a [`Manager`](crate::Manager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EngineRole {
    /// Only suitable for reading, e.g. a read replica.
    #[serde(rename = "r")]
    Read,
    /// Preferred for writing. A write engine may still receive reads issued
    /// from non-idempotent methods; the role is a hint that it should not be
    /// picked when a read engine is sufficient.
    #[serde(rename = "w")]
    Write,
    /// Suitable for all queries; participates in both read and write
    /// balancing unless the role-preference options exclude it.
    #[serde(rename = "rw")]
    ReadWrite,
}

impl EngineRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineRole::Read => "r",
            EngineRole::Write => "w",
            EngineRole::ReadWrite => "rw",
        }
    }

    pub fn can_read(&self) -> bool {
        matches!(self, EngineRole::Read | EngineRole::ReadWrite)
    }

    pub fn can_write(&self) -> bool {
        matches!(self, EngineRole::Write | EngineRole::ReadWrite)
    }
}

impl fmt::Display for EngineRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineRole {
    type Err = ReqSessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" => Ok(EngineRole::Read),
            "w" => Ok(EngineRole::Write),
            "rw" => Ok(EngineRole::ReadWrite),
            other => Err(ReqSessionError::InvalidRole(other.to_string())),
        }
    }
}

/// Anything accepted as a role at registration time: the enum itself or the
/// legacy `r` / `w` / `rw` shorthand.
pub trait IntoRole {
    fn into_role(self) -> Result<EngineRole>;
}

impl IntoRole for EngineRole {
    fn into_role(self) -> Result<EngineRole> {
        Ok(self)
    }
}

impl IntoRole for &str {
    fn into_role(self) -> Result<EngineRole> {
        self.parse()
    }
}

impl IntoRole for String {
    fn into_role(self) -> Result<EngineRole> {
        self.as_str().parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_role_strings() {
        assert_eq!("r".into_role().unwrap(), EngineRole::Read);
        assert_eq!("w".into_role().unwrap(), EngineRole::Write);
        assert_eq!(String::from("rw").into_role().unwrap(), EngineRole::ReadWrite);
        assert_eq!(EngineRole::Write.into_role().unwrap(), EngineRole::Write);
    }

    #[test]
    fn test_unsupported_roles() {
        for role in ["a+", "rb", "RW", "", "read"] {
            let err = role.into_role().unwrap_err();
            assert!(matches!(err, ReqSessionError::InvalidRole(ref r) if r == role));
            assert!(err.is_configuration_error());
        }
    }

    #[test]
    fn test_capabilities() {
        assert!(EngineRole::Read.can_read());
        assert!(!EngineRole::Read.can_write());
        assert!(!EngineRole::Write.can_read());
        assert!(EngineRole::Write.can_write());
        assert!(EngineRole::ReadWrite.can_read());
        assert!(EngineRole::ReadWrite.can_write());
        assert_eq!(EngineRole::ReadWrite.to_string(), "rw");
    }
}
