//! Migration version extraction from filenames.
//!
//! Strategies are tried in a fixed order and the first match wins:
//!
//! 1. `NNN_description.sql`: the leading digit run.
//! 2. `V<digits>__description.sql` (Flyway style): the digits after `V`.
//! 3. `<14+ digits>_description.sql` (timestamp): the full digit run.
//! 4. Anything else: the filename minus its extension.
//!
//! Versions compare as strings. Numeric prefixes therefore order correctly
//! only when every file of a module uses the same digit-run width
//! (`001`..`999`, not `1`..`10`); keeping the width consistent is up to
//! whoever names the files. The filename fallback orders lexicographically
//! and is not recommended.

use std::fmt;
use std::sync::LazyLock;

use regex_lite::Regex;
use serde::Serialize;

static NUMERIC_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+)_").unwrap());
static FLYWAY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^V(\d+)__").unwrap());
static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{14,})_").unwrap());

/// Which naming convention produced a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VersionStrategy {
    NumericPrefix,
    Flyway,
    Timestamp,
    Filename,
}

impl fmt::Display for VersionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionStrategy::NumericPrefix => write!(f, "numeric prefix"),
            VersionStrategy::Flyway => write!(f, "flyway"),
            VersionStrategy::Timestamp => write!(f, "timestamp"),
            VersionStrategy::Filename => write!(f, "filename"),
        }
    }
}

/// Comparable version of a migration within its module.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct VersionKey(String);

impl VersionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VersionKey {
    fn from(raw: &str) -> Self {
        VersionKey(raw.to_string())
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extract the version key of a migration filename.
pub fn extract_version(filename: &str) -> VersionKey {
    extract_version_with_strategy(filename).0
}

/// Extract the version key together with the strategy that matched.
pub fn extract_version_with_strategy(filename: &str) -> (VersionKey, VersionStrategy) {
    let attempts: [(&Regex, VersionStrategy); 3] = [
        (&*NUMERIC_PREFIX_RE, VersionStrategy::NumericPrefix),
        (&*FLYWAY_RE, VersionStrategy::Flyway),
        (&*TIMESTAMP_RE, VersionStrategy::Timestamp),
    ];

    for (re, strategy) in attempts {
        if let Some(caps) = re.captures(filename) {
            return (VersionKey(caps[1].to_string()), strategy);
        }
    }

    (VersionKey(strip_extension(filename).to_string()), VersionStrategy::Filename)
}

fn strip_extension(filename: &str) -> &str {
    match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => filename,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_prefix() {
        let (v, s) = extract_version_with_strategy("001_create_users.sql");
        assert_eq!(v.as_str(), "001");
        assert_eq!(s, VersionStrategy::NumericPrefix);
        assert_eq!(extract_version("42_x.sql").as_str(), "42");
    }

    #[test]
    fn test_flyway_style() {
        let (v, s) = extract_version_with_strategy("V7__add_index.sql");
        assert_eq!(v.as_str(), "7");
        assert_eq!(s, VersionStrategy::Flyway);
    }

    #[test]
    fn test_timestamp_is_full_digit_run() {
        let v = extract_version("20240126120000_add_orders.sql");
        assert_eq!(v.as_str(), "20240126120000");
    }

    #[test]
    fn test_fallback_strips_extension() {
        let (v, s) = extract_version_with_strategy("seed_data.sql");
        assert_eq!(v.as_str(), "seed_data");
        assert_eq!(s, VersionStrategy::Filename);
        assert_eq!(extract_version("V1_single_underscore.sql").as_str(), "V1_single_underscore");
        assert_eq!(extract_version("noext").as_str(), "noext");
        assert_eq!(extract_version("archive.tar.sql").as_str(), "archive.tar");
    }

    #[test]
    fn test_digits_without_underscore_fall_back() {
        assert_eq!(extract_version("001.sql").as_str(), "001");
        assert_eq!(
            extract_version_with_strategy("001.sql").1,
            VersionStrategy::Filename
        );
    }

    #[test]
    fn test_ordering_with_consistent_width() {
        let mut versions: Vec<VersionKey> = ["010_c.sql", "002_b.sql", "001_a.sql", "100_d.sql"]
            .iter()
            .map(|f| extract_version(f))
            .collect();
        versions.sort();
        let raw: Vec<&str> = versions.iter().map(VersionKey::as_str).collect();
        assert_eq!(raw, vec!["001", "002", "010", "100"]);
    }

    #[test]
    fn test_inconsistent_width_orders_as_strings() {
        assert!(extract_version("10_b.sql") < extract_version("9_a.sql"));
    }

    #[test]
    fn test_timestamps_order_chronologically() {
        assert!(
            extract_version("20240101000000_a.sql") < extract_version("20240102000000_b.sql")
        );
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(extract_version("003_x.sql"), extract_version("003_x.sql"));
    }
}
