use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A parsed OOI reference designator, e.g. `RS03ASHS-MJ03B-07-TMPSFA301`.
///
/// The sensor part keeps its own dash: `07-TMPSFA301`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReferenceDesignator {
    pub subsite: String,
    pub node: String,
    pub sensor: String,
}

impl ReferenceDesignator {
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('-').collect();
        if parts.len() < 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(Error::InvalidReferenceDesignator(s.to_string()));
        }
        Ok(Self {
            subsite: parts[0].to_string(),
            node: parts[1].to_string(),
            sensor: parts[2..].join("-"),
        })
    }

    /// Two-letter array code, e.g. `RS` for the cabled array.
    pub fn array_code(&self) -> &str {
        self.subsite.get(..2).unwrap_or(&self.subsite)
    }
}

impl FromStr for ReferenceDesignator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ReferenceDesignator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.subsite, self.node, self.sensor)
    }
}
