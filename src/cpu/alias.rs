//! Canonicalizes the raw feature tokens a host probe reports into the
//! feature names used by the microarchitecture catalog.
//!
//! Two sources of aliasing are applied, in order:
//!
//! - `conversions.darwin_flags`: Darwin-only, expands an `sysctl`-reported
//!   feature name into its Linux-flag equivalent(s) before anything else runs.
//! - `feature_aliases`: the general alias table. Each rule synthesizes a
//!   canonical feature name when the raw set already contains any of
//!   `any_of`, optionally restricted to a set of `families`. Unknown raw
//!   tokens are passed through unchanged.

use super::schema::MicroarchitecturesSchema;
use std::collections::HashSet;

/// Coarse OS classification used to pick which secondary-aliasing rules apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Os {
    Linux,
    Darwin,
    Generic,
}

/// The context an alias rule's predicate may inspect, alongside the raw
/// feature set itself.
pub(crate) struct AliasContext<'a> {
    pub(crate) os: Os,
    pub(crate) vendor: &'a str,
    /// Name of the family the host is believed to belong to (e.g. `"x86_64"`,
    /// `"aarch64"`), used by family-restricted alias rules. `None` when the
    /// family could not be determined yet.
    pub(crate) family: Option<&'a str>,
}

/// Resolves `raw_features` into their canonical catalog names, given `ctx`.
/// Unknown tokens are kept as-is; duplicates are deduplicated by virtue of
/// the result being a `HashSet`.
pub(crate) fn canonicalize(
    raw_features: &HashSet<String>,
    ctx: &AliasContext,
    schema: &MicroarchitecturesSchema,
) -> HashSet<String> {
    let mut features = raw_features.clone();

    if ctx.os == Os::Darwin {
        for (darwin_flag, linux_flags) in &schema.conversions.darwin_flags {
            if features.contains(darwin_flag) {
                features.extend(linux_flags.split_whitespace().map(str::to_string));
            }
        }
    }

    for (alias, rule) in &schema.feature_aliases {
        if let Some(families) = &rule.families {
            match ctx.family {
                Some(family) if families.iter().any(|f| f == family) => {}
                _ => continue,
            }
        }

        let satisfied = match &rule.any_of {
            Some(any_of) => any_of.iter().any(|f| features.contains(f)),
            // No `any_of` constraint and the (possible) family constraint
            // already passed: the alias always applies.
            None => true,
        };

        if satisfied {
            features.insert(alias.clone());
        }
    }

    features
}

pub(crate) fn vendor_matches(vendor: &str, probed_vendor: &str) -> bool {
    vendor == "generic" || vendor == probed_vendor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::schema::parse_microarchitectures_schema;

    fn schema() -> MicroarchitecturesSchema {
        parse_microarchitectures_schema(
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/json/cpu/microarchitectures.json"
            )),
            None,
        )
        .expect("valid schema")
    }

    #[test]
    fn any_of_alias_fires_when_family_matches() {
        let schema = schema();
        let raw: HashSet<String> = ["atomics".to_string()].into_iter().collect();
        let ctx = AliasContext {
            os: Os::Linux,
            vendor: "ARM",
            family: Some("aarch64"),
        };
        let canonical = canonicalize(&raw, &ctx, &schema);
        assert!(canonical.contains("lse"));
    }

    #[test]
    fn any_of_alias_does_not_fire_for_wrong_family() {
        let schema = schema();
        let raw: HashSet<String> = ["atomics".to_string()].into_iter().collect();
        let ctx = AliasContext {
            os: Os::Linux,
            vendor: "GenuineIntel",
            family: Some("x86_64"),
        };
        let canonical = canonicalize(&raw, &ctx, &schema);
        assert!(!canonical.contains("lse"));
    }

    #[test]
    fn unknown_raw_tokens_pass_through_unchanged() {
        let schema = schema();
        let raw: HashSet<String> = ["some_future_flag_nobody_knows_yet".to_string()]
            .into_iter()
            .collect();
        let ctx = AliasContext {
            os: Os::Linux,
            vendor: "GenuineIntel",
            family: Some("x86_64"),
        };
        let canonical = canonicalize(&raw, &ctx, &schema);
        assert!(canonical.contains("some_future_flag_nobody_knows_yet"));
    }

    #[test]
    fn darwin_flag_expands_before_feature_aliases_run() {
        let schema = schema();
        let raw: HashSet<String> = ["avx2.0".to_string()].into_iter().collect();
        let ctx = AliasContext {
            os: Os::Darwin,
            vendor: "GenuineIntel",
            family: Some("x86_64"),
        };
        let canonical = canonicalize(&raw, &ctx, &schema);
        for expected in ["avx2", "fma", "bmi1", "bmi2", "f16c", "movbe", "rdrnd"] {
            assert!(canonical.contains(expected), "missing {expected}");
        }
    }
}
