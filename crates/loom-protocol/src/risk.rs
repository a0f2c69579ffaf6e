use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Coarse risk classification attached to a pending action.
///
/// Only `Low < Medium < High` is ordered; `Unknown` compares equal to itself and
/// is never "at least" any threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityRisk {
    #[default]
    Unknown,
    Low,
    Medium,
    High,
}

impl SecurityRisk {
    fn rank(self) -> Option<u8> {
        match self {
            Self::Unknown => None,
            Self::Low => Some(1),
            Self::Medium => Some(2),
            Self::High => Some(3),
        }
    }

    pub fn is_unknown(self) -> bool {
        self == Self::Unknown
    }

    pub fn is_at_least(self, threshold: SecurityRisk) -> bool {
        match (self.rank(), threshold.rank()) {
            (Some(actual), Some(threshold)) => actual >= threshold,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

impl fmt::Display for SecurityRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityRisk {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UNKNOWN" => Ok(Self::Unknown),
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            other => Err(format!("unknown security risk '{other}'")),
        }
    }
}
