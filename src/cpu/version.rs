//! Parses and evaluates compiler version specs such as `"4.9:"`, `"4.6:4.8.5"`
//! or `"8.0:"` against a concrete version string.

use super::schema::CatalogError;
use std::cmp::Ordering;

/// A parsed, disjunctive version spec (the comma-separated alternatives of a
/// `versions` string). Parsing happens once, at catalog build time; malformed
/// specs are rejected there and never deferred to query time.
#[derive(Debug, Clone)]
pub(crate) struct VersionSpec {
    ranges: Vec<VersionRange>,
}

#[derive(Debug, Clone)]
struct VersionRange {
    lower: Option<Vec<u64>>,
    upper: Option<Vec<u64>>,
}

impl VersionSpec {
    /// Parses a version spec string. `raw` is kept around by the caller for
    /// error messages; this function only validates and stores the parsed
    /// bounds.
    pub(crate) fn parse(raw: &str) -> Result<Self, CatalogError> {
        let malformed = || CatalogError::MalformedVersionSpec {
            spec: raw.to_string(),
        };

        let mut ranges = Vec::new();
        for alternative in raw.split(',') {
            let alternative = alternative.trim();
            if alternative.is_empty() {
                return Err(malformed());
            }

            let range = if let Some((lower, upper)) = alternative.split_once(':') {
                let lower = if lower.is_empty() {
                    None
                } else {
                    Some(parse_components(lower).ok_or_else(malformed)?)
                };
                let upper = if upper.is_empty() {
                    None
                } else {
                    Some(parse_components(upper).ok_or_else(malformed)?)
                };
                VersionRange { lower, upper }
            } else {
                let exact = parse_components(alternative).ok_or_else(malformed)?;
                VersionRange {
                    lower: Some(exact.clone()),
                    upper: Some(exact),
                }
            };
            ranges.push(range);
        }

        Ok(VersionSpec { ranges })
    }

    /// Returns true if `target` falls within any of the disjunctive ranges.
    pub(crate) fn matches(&self, target: &str) -> bool {
        let target = parse_components_lenient(target);
        self.ranges.iter().any(|range| {
            let above_lower = range
                .lower
                .as_ref()
                .map_or(true, |lower| compare(lower, &target) != Ordering::Greater);
            let below_upper = range
                .upper
                .as_ref()
                .map_or(true, |upper| compare(&target, upper) != Ordering::Greater);
            above_lower && below_upper
        })
    }
}

/// Splits a dot-separated numeric version into its components, failing if any
/// component isn't a plain non-negative integer.
fn parse_components(s: &str) -> Option<Vec<u64>> {
    s.split('.').map(|part| part.parse::<u64>().ok()).collect()
}

/// Same as [`parse_components`] but tolerant of malformed input, since the
/// target version comes from the caller at query time rather than from the
/// knowledge base. Non-numeric components are treated as `0`.
fn parse_components_lenient(s: &str) -> Vec<u64> {
    s.split('.')
        .map(|part| part.parse::<u64>().unwrap_or(0))
        .collect()
}

/// Compares two version component sequences, treating missing trailing
/// components as zero (so `5.1` == `5.1.0`).
fn compare(a: &[u64], b: &[u64]) -> Ordering {
    for i in 0..a.len().max(b.len()) {
        let ai = a.get(i).copied().unwrap_or(0);
        let bi = b.get(i).copied().unwrap_or(0);
        match ai.cmp(&bi) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("4.9:", "4.9.0", true)]
    #[case("4.9:", "4.8.9", false)]
    #[case("4.6:4.8.5", "4.8.5", true)]
    #[case("4.6:4.8.5", "4.8.6", false)]
    #[case(":8.99", "8.99", true)]
    #[case(":8.99", "9.0", false)]
    #[case("8.0", "8.0.0", true)]
    #[case("8.0", "8.1", false)]
    #[case("4.6:4.8, 9.0:", "9.1.2", true)]
    #[case("4.6:4.8, 9.0:", "5.0", false)]
    #[case("5.1", "5.1.0", true)]
    fn version_spec_matching(#[case] spec: &str, #[case] target: &str, #[case] expected: bool) {
        let spec = VersionSpec::parse(spec).expect("valid spec");
        assert_eq!(spec.matches(target), expected);
    }

    #[test]
    fn malformed_spec_is_rejected_at_parse_time() {
        assert!(VersionSpec::parse("not-a-version").is_err());
        assert!(VersionSpec::parse("").is_err());
        assert!(VersionSpec::parse("4.9:,").is_err());
    }
}
