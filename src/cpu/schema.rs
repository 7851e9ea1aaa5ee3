//! Types and functions to manipulate the contents of the microarchitecture data file.
//!
//! These are encoding the rules of the corresponding schema as Rust data types
//! with the help of `serde` deserialization, plus the loading/overlay logic
//! described at the boundary of the knowledge base (environment variables
//! `ARCHSPEC_CPU_DIR` and `ARCHSPEC_EXTENSION_CPU_DIR`).

use serde::de;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while building the microarchitecture catalog.
///
/// All of these are raised at catalog build time; none of them are deferred
/// to query time.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("cycle detected in microarchitecture catalog at node '{node}'")]
    Cycle { node: String },

    #[error("microarchitecture '{node}' references unknown parent '{parent}'")]
    DanglingParent { node: String, parent: String },

    #[error("malformed compiler version spec '{spec}'")]
    MalformedVersionSpec { spec: String },

    #[error("failed to parse microarchitecture knowledge base: {0}")]
    Schema(#[from] serde_json::Error),

    #[error("failed to read microarchitecture knowledge base: {0}")]
    Io(#[from] std::io::Error),
}

/// Schema for microarchitecture definitions and feature aliases.
#[derive(Debug, Deserialize)]
pub(crate) struct MicroarchitecturesSchema {
    pub(crate) microarchitectures: HashMap<String, MicroarchitectureSpec>,
    pub(crate) feature_aliases: HashMap<String, FeatureAlias>,
    pub(crate) conversions: Conversions,
}

/// Defines the attributes and requirements of a microarchitecture, as read
/// directly from the knowledge base (before the catalog graph is wired up).
#[derive(Debug, Deserialize)]
pub(crate) struct MicroarchitectureSpec {
    /// A list of the immediate microarchitectures that this one is considered
    /// to be derived from.
    #[serde(default, deserialize_with = "zero_one_many_string")]
    pub(crate) from: Vec<String>,

    /// Human-readable vendor name.
    pub(crate) vendor: String,

    /// The CPU features that are required to exist on the system for it to be
    /// compatible with this microarchitecture.
    #[serde(default)]
    pub(crate) features: Vec<String>,

    /// Optional information on how to tell different compilers how to optimize
    /// for this microarchitecture.
    pub(crate) compilers: Option<HashMap<String, CompilerSet>>,

    /// Generation of the microarchitecture, if relevant.
    pub(crate) generation: Option<usize>,
}

/// Compiler optimization for a particular compiler, either one for all flavours
/// of the compiler or several indicating how to do it for particular version ranges.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum CompilerSet {
    /// Multiple entries (compiler support changes across versions).
    Several(Vec<Compiler>),

    /// Single entry (compiler didn't change options across versions).
    Single(Compiler),
}

impl CompilerSet {
    pub(crate) fn into_vec(self) -> Vec<Compiler> {
        match self {
            CompilerSet::Several(cs) => cs,
            CompilerSet::Single(c) => vec![c],
        }
    }
}

/// Indicates how to tell a particular compiler flavour how to optimize
/// for a microarchitecture.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub(crate) struct Compiler {
    /// Indicates the versions of the compiler this applies to.
    pub(crate) versions: String,

    /// Command line argument to pass to the compiler to optimize for this architecture.
    /// May contain `{name}` placeholders.
    pub(crate) flags: String,

    /// Architecture name, for use in the optimization flags, in place of the
    /// microarchitecture's own name.
    pub(crate) name: Option<String>,

    /// Warning surfaced alongside a successful render of this entry.
    pub(crate) warnings: Option<String>,
}

/// Synthesised feature aliases derived from existing features or families.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FeatureAlias {
    /// The reason for why this alias is defined.
    #[allow(dead_code)]
    pub(crate) reason: Option<String>,

    /// The alias is valid if any of the items are a feature of the target.
    pub(crate) any_of: Option<Vec<String>>,

    /// The alias is valid if the family of the target is in this list.
    pub(crate) families: Option<Vec<String>>,
}

/// Conversions that map some platform specific value to canonical values.
#[derive(Debug, Deserialize)]
pub(crate) struct Conversions {
    #[allow(dead_code)]
    pub(crate) description: String,

    /// Maps from ARM vendor hex-values to actual vendor names.
    pub(crate) arm_vendors: HashMap<String, String>,

    /// Maps from macOS feature flags to the equivalent Linux flag name(s).
    pub(crate) darwin_flags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CpuIdSchema {
    pub(crate) vendor: CpuIdProperty,
    pub(crate) highest_extension_support: CpuIdProperty,
    pub(crate) flags: Vec<CpuIdFlags>,
    #[serde(rename = "extension-flags")]
    pub(crate) extension_flags: Vec<CpuIdFlags>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CpuIdProperty {
    #[allow(dead_code)]
    pub(crate) description: String,
    pub(crate) input: CpuIdInput,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CpuIdFlags {
    #[allow(dead_code)]
    pub(crate) description: String,
    pub(crate) input: CpuIdInput,
    pub(crate) bits: Vec<CpuIdBits>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CpuIdBits {
    pub(crate) name: String,
    pub(crate) register: CpuRegister,
    pub(crate) bit: u8,
}

#[derive(Debug, Deserialize, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum CpuRegister {
    Eax,
    Ebx,
    Ecx,
    Edx,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CpuIdInput {
    pub(crate) eax: u32,
    pub(crate) ecx: u32,
}

/// Deserialization helper to map {null, string, [string]} to a sequence of strings.
fn zero_one_many_string<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Vtor;

    impl<'de> de::Visitor<'de> for Vtor {
        type Value = Vec<String>;

        fn expecting(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
            fmt.write_str("a null or a loose element or a sequence")
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![])
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut v = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some(a) = access.next_element()? {
                v.push(a);
            }

            Ok(v)
        }
    }

    deserializer.deserialize_any(Vtor)
}

/// Deserialization helper to map from a single object or a sequence of objects to a sequence.
#[allow(dead_code)]
fn one_many_object<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    struct Vtor<T> {
        marker: PhantomData<fn() -> Vec<T>>,
    }

    impl<T> Vtor<T> {
        fn new() -> Self {
            Vtor {
                marker: PhantomData,
            }
        }
    }

    impl<'de, T> de::Visitor<'de> for Vtor<T>
    where
        T: Deserialize<'de>,
    {
        type Value = Vec<T>;

        fn expecting(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
            fmt.write_str("a loose element or a sequence")
        }

        fn visit_map<A>(self, access: A) -> Result<Self::Value, A::Error>
        where
            A: de::MapAccess<'de>,
        {
            let obj: T = Deserialize::deserialize(de::value::MapAccessDeserializer::new(access))?;
            Ok(vec![obj])
        }

        fn visit_seq<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut v = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some(a) = access.next_element()? {
                v.push(a);
            }

            Ok(v)
        }
    }

    deserializer.deserialize_any(Vtor::new())
}

/// Merges `overlay` into `base` at top-level attribute granularity: for each
/// top-level key present in the overlay, each second-level entry replaces (or
/// inserts into) the base's entry of the same name wholesale. There is no
/// deeper merging than that.
fn merge_overlay(base: &mut Value, overlay: Value) {
    let (Value::Object(base_map), Value::Object(overlay_map)) = (base, overlay) else {
        return;
    };
    for (key, overlay_value) in overlay_map {
        match (base_map.get_mut(&key), overlay_value) {
            (Some(Value::Object(base_entries)), Value::Object(overlay_entries)) => {
                for (name, entry) in overlay_entries {
                    base_entries.insert(name, entry);
                }
            }
            (_, overlay_value) => {
                base_map.insert(key, overlay_value);
            }
        }
    }
}

/// Parses the microarchitecture knowledge base from in-memory JSON documents,
/// applying `overlay_json` on top of `base_json` if given. This is the pure
/// core of the loader, kept free of environment/filesystem access so it can
/// be exercised directly in tests.
pub(crate) fn parse_microarchitectures_schema(
    base_json: &str,
    overlay_json: Option<&str>,
) -> Result<MicroarchitecturesSchema, CatalogError> {
    let mut base: Value = serde_json::from_str(base_json)?;
    if let Some(overlay_json) = overlay_json {
        let overlay: Value = serde_json::from_str(overlay_json)?;
        merge_overlay(&mut base, overlay);
    }
    Ok(serde_json::from_value(base)?)
}

/// Loads the microarchitecture knowledge base, honoring `ARCHSPEC_CPU_DIR`
/// (wholesale replacement) and `ARCHSPEC_EXTENSION_CPU_DIR` (overlay).
pub(crate) fn load_microarchitectures_schema() -> Result<MicroarchitecturesSchema, CatalogError> {
    let base_json = match std::env::var_os("ARCHSPEC_CPU_DIR") {
        Some(dir) => std::fs::read_to_string(Path::new(&dir).join("microarchitectures.json"))?,
        None => include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/json/cpu/microarchitectures.json"
        ))
        .to_string(),
    };

    let overlay_json = match std::env::var_os("ARCHSPEC_EXTENSION_CPU_DIR") {
        Some(dir) => {
            let path = Path::new(&dir).join("microarchitectures.json");
            if path.exists() {
                Some(std::fs::read_to_string(path)?)
            } else {
                None
            }
        }
        None => None,
    };

    parse_microarchitectures_schema(&base_json, overlay_json.as_deref())
}

/// Loads the CPUID leaf/bit definitions, honoring `ARCHSPEC_CPU_DIR` for
/// wholesale replacement. There is no overlay mechanism for this file.
pub(crate) fn load_cpuid_schema() -> Result<CpuIdSchema, CatalogError> {
    let json = match std::env::var_os("ARCHSPEC_CPU_DIR") {
        Some(dir) => std::fs::read_to_string(Path::new(&dir).join("cpuid.json"))?,
        None => include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/json/cpu/cpuid.json")).to_string(),
    };
    Ok(serde_json::from_str(&json)?)
}

/// Returns the cached CPUID schema, loading it on first access.
pub(crate) fn cpuid_schema() -> &'static CpuIdSchema {
    static CPUID_SCHEMA: std::sync::OnceLock<CpuIdSchema> = std::sync::OnceLock::new();
    CPUID_SCHEMA.get_or_init(|| {
        load_cpuid_schema().expect("failed to load CPUID leaf/bit definitions")
    })
}

/// Returns the cached microarchitecture schema, loading it on first access.
/// Used at host-detection time to resolve `arm_vendors`/`darwin_flags`/
/// `feature_aliases`, independently of the (separately cached) built catalog.
pub(crate) fn microarchitectures_schema() -> &'static MicroarchitecturesSchema {
    static SCHEMA: std::sync::OnceLock<MicroarchitecturesSchema> = std::sync::OnceLock::new();
    SCHEMA.get_or_init(|| {
        load_microarchitectures_schema().expect("failed to load microarchitecture knowledge base")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_builtin_microarchitectures_json() {
        let json = include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/json/cpu/microarchitectures.json"
        ));
        let schema = parse_microarchitectures_schema(json, None).expect("valid schema");
        assert!(schema.microarchitectures.contains_key("broadwell"));
        assert!(schema.microarchitectures.contains_key("x86_64"));
    }

    #[test]
    fn overlay_replaces_whole_second_level_entry() {
        let base = r#"{
            "microarchitectures": {
                "x86_64": {"from": [], "vendor": "generic", "features": ["mmx"]},
                "nehalem": {"from": "x86_64", "vendor": "GenuineIntel", "features": ["sse3"]}
            },
            "feature_aliases": {},
            "conversions": {"description": "", "arm_vendors": {}, "darwin_flags": {}}
        }"#;
        let overlay = r#"{
            "microarchitectures": {
                "nehalem": {"from": "x86_64", "vendor": "GenuineIntel", "features": ["sse3", "custom_feature"]}
            }
        }"#;
        let schema = parse_microarchitectures_schema(base, Some(overlay)).expect("valid schema");
        let nehalem = &schema.microarchitectures["nehalem"];
        assert_eq!(nehalem.features, vec!["sse3", "custom_feature"]);
        // The untouched entry is still present, proving the merge is shallow.
        assert!(schema.microarchitectures.contains_key("x86_64"));
    }

    #[test]
    fn malformed_json_is_a_catalog_error() {
        let err = parse_microarchitectures_schema("not json", None).unwrap_err();
        assert!(matches!(err, CatalogError::Schema(_)));
    }

    #[test]
    fn show_cpuid_json() {
        let schema = load_cpuid_schema().expect("valid schema");
        assert!(!schema.flags.is_empty());
    }
}
