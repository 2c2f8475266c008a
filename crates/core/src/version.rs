//! Dot-separated product versions compared as ordered tuples.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::ConfigurationError;

/// An explicit product version such as `2020.6.0`.
///
/// Ordering is lexicographic over the numeric parts, with missing trailing parts
/// read as zero (`5.0` == `5.0.0`). Wildcards (`*`, `x`) and empty strings are
/// refused so that registry keys are always exact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    parts: SmallVec<[u32; 4]>,
}

impl Version {
    pub fn parse(raw: &str) -> Result<Self, ConfigurationError> {
        let s = raw.trim();
        let s = s.strip_prefix('v').unwrap_or(s);
        if s.is_empty() {
            return Err(ConfigurationError::InvalidVersion { raw: raw.to_string(), reason: "empty".into() });
        }
        let mut parts = SmallVec::new();
        for seg in s.split('.') {
            if seg == "*" || seg.eq_ignore_ascii_case("x") {
                return Err(ConfigurationError::WildcardVersion { raw: raw.to_string() });
            }
            let n = seg.parse::<u32>().map_err(|_| ConfigurationError::InvalidVersion {
                raw: raw.to_string(),
                reason: format!("segment `{}` is not a number", seg),
            })?;
            parts.push(n);
        }
        Ok(Self { parts })
    }

    pub fn parts(&self) -> &[u32] { &self.parts }

    pub fn major(&self) -> u32 { self.parts.first().copied().unwrap_or(0) }

    fn significant(&self) -> &[u32] {
        let end = self.parts.iter().rposition(|p| *p != 0).map(|i| i + 1).unwrap_or(0);
        &self.parts[..end]
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool { self.significant() == other.significant() }
}

impl Eq for Version {}

impl std::hash::Hash for Version {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) { self.significant().hash(state) }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering { self.significant().cmp(other.significant()) }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for p in self.parts.iter() {
            if !first { f.write_str(".")?; }
            write!(f, "{}", p)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = ConfigurationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

impl TryFrom<String> for Version {
    type Error = ConfigurationError;
    fn try_from(s: String) -> Result<Self, Self::Error> { Self::parse(&s) }
}

impl From<Version> for String {
    fn from(v: Version) -> Self { v.to_string() }
}
