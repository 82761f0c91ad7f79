//! Error sensitivity policy

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::DbErrorKind;

/// Which database errors a statement tolerates.
///
/// The suppressed sets nest: everything `Strict` suppresses (nothing) is
/// suppressed by `Normal`, and everything `Normal` suppresses is suppressed by
/// `Force`. Connectivity failures are never suppressed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSensitivity {
    /// Surface every error
    Strict,
    /// Tolerate "already exists" and "does not exist"
    #[default]
    Normal,
    /// Tolerate everything except connectivity failures
    Force,
}

impl ErrorSensitivity {
    pub fn all() -> [Self; 3] {
        [Self::Strict, Self::Normal, Self::Force]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Normal => "normal",
            Self::Force => "force",
        }
    }

    /// Whether an error of `kind` is logged and skipped rather than surfaced
    pub fn suppresses(&self, kind: DbErrorKind) -> bool {
        match (self, kind) {
            (_, DbErrorKind::Connectivity) => false,
            (Self::Strict, _) => false,
            (Self::Normal, DbErrorKind::AlreadyExists | DbErrorKind::DoesNotExist) => true,
            (Self::Normal, _) => false,
            (Self::Force, _) => true,
        }
    }

    /// The less tolerant of two policies
    pub fn stricter(self, other: Self) -> Self {
        self.min(other)
    }
}

impl fmt::Display for ErrorSensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ErrorSensitivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "normal" => Ok(Self::Normal),
            "force" => Ok(Self::Force),
            _ => Err(format!(
                "Unknown error sensitivity: {s} (expected strict, normal or force)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KINDS: [DbErrorKind; 4] = [
        DbErrorKind::AlreadyExists,
        DbErrorKind::DoesNotExist,
        DbErrorKind::Connectivity,
        DbErrorKind::Unclassified,
    ];

    #[test]
    fn test_suppressed_sets_nest() {
        for kind in KINDS {
            if ErrorSensitivity::Strict.suppresses(kind) {
                assert!(ErrorSensitivity::Normal.suppresses(kind));
            }
            if ErrorSensitivity::Normal.suppresses(kind) {
                assert!(ErrorSensitivity::Force.suppresses(kind));
            }
        }
    }

    #[test]
    fn test_policy_table() {
        assert!(!ErrorSensitivity::Strict.suppresses(DbErrorKind::AlreadyExists));
        assert!(ErrorSensitivity::Normal.suppresses(DbErrorKind::DoesNotExist));
        assert!(!ErrorSensitivity::Normal.suppresses(DbErrorKind::Unclassified));
        assert!(ErrorSensitivity::Force.suppresses(DbErrorKind::Unclassified));
        for s in ErrorSensitivity::all() {
            assert!(!s.suppresses(DbErrorKind::Connectivity));
        }
    }

    #[test]
    fn test_stricter_and_parse() {
        assert_eq!(
            ErrorSensitivity::Force.stricter(ErrorSensitivity::Normal),
            ErrorSensitivity::Normal
        );
        assert_eq!("FORCE".parse::<ErrorSensitivity>(), Ok(ErrorSensitivity::Force));
        assert!("lenient".parse::<ErrorSensitivity>().is_err());
    }
}
