use super::schema::{self, CatalogError, CompilerSet, MicroarchitecturesSchema};
use super::version::VersionSpec;
use itertools::Itertools;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// One entry in a node's `compilers[compiler]` table: a version range tied to
/// a flag template.
struct CompilerEntry {
    spec: VersionSpec,
    raw_versions: String,
    flags_template: String,
    alt_name: Option<String>,
    warnings: Option<String>,
}

/// A node in the microarchitecture catalog's DAG.
///
/// Nodes are arena-allocated: every reference a node holds to its parents is
/// a non-owning `Arc` shared with the rest of the catalog, and the catalog
/// itself (see [`Microarchitecture::known_targets`]) owns the only strong
/// references that keep nodes alive. There are no cycles, so nothing here is
/// actually shared ownership in the reference-counting sense; `Arc` is used
/// purely so many children can point at the same parent without the catalog
/// becoming self-referential to build.
pub struct Microarchitecture {
    name: String,
    parents: Vec<Arc<Microarchitecture>>,
    vendor: String,
    features: HashSet<String>,
    compilers: HashMap<String, Vec<CompilerEntry>>,
    generation: usize,

    // Not used in comparison or equality.
    ancestors: OnceLock<Vec<Arc<Microarchitecture>>>,
}

impl PartialEq for Microarchitecture {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Microarchitecture {}

impl std::hash::Hash for Microarchitecture {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// The partial order described by ancestry: `a <= b` iff `a == b` or `a` is
/// one of `b`'s ancestors. Incomparable nodes (different families) return
/// `None`, matching "neither `<` nor `>` nor `==`".
impl PartialOrd for Microarchitecture {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.name == other.name {
            Some(Ordering::Equal)
        } else if other.ancestors().iter().any(|a| a.name == self.name) {
            Some(Ordering::Less)
        } else if self.ancestors().iter().any(|a| a.name == other.name) {
            Some(Ordering::Greater)
        } else {
            None
        }
    }
}

impl Debug for Microarchitecture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Microarchitecture")
            .field("name", &self.name)
            .field(
                "ancestors",
                &self
                    .ancestors()
                    .iter()
                    .map(|arch| arch.name.as_str())
                    .collect_vec(),
            )
            .field("vendor", &self.vendor)
            .field("features", &self.all_features())
            .field("generation", &self.generation)
            .finish()
    }
}

/// A serializable snapshot of a node, the Rust analogue of the Python
/// library's `to_dict`. Note that `features` here is the node's *own*
/// feature list, not the inherited union — matching observable behavior.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct MicroarchitectureSnapshot {
    pub name: String,
    pub vendor: String,
    pub features: Vec<String>,
    pub parents: Vec<String>,
    pub generation: usize,
}

impl Microarchitecture {
    fn new_generation(
        name: String,
        parents: Vec<Arc<Microarchitecture>>,
        vendor: String,
        features: HashSet<String>,
        compilers: HashMap<String, Vec<CompilerEntry>>,
        generation: usize,
    ) -> Self {
        Microarchitecture {
            name,
            parents,
            vendor,
            features,
            compilers,
            generation,
            ancestors: OnceLock::new(),
        }
    }

    /// Constructs a generic, parent-less microarchitecture node. Used as the
    /// fallback "we know nothing more specific than this" result.
    pub(crate) fn generic(name: &str) -> Microarchitecture {
        Microarchitecture::new_generation(
            name.to_string(),
            vec![],
            "generic".to_string(),
            HashSet::new(),
            HashMap::new(),
            0,
        )
    }

    /// Unique, stable identifier for this node.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Free-form vendor string, or the sentinel `"generic"` for family roots.
    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    /// Direct parents, in preference order (first parent is preferred).
    pub fn parents(&self) -> &[Arc<Microarchitecture>] {
        &self.parents
    }

    /// Features owned directly by this node (not inherited from ancestors).
    pub fn features(&self) -> &HashSet<String> {
        &self.features
    }

    /// Tiebreaker used by host selection: higher is newer, within an
    /// otherwise-tied compatibility class.
    pub fn generation(&self) -> usize {
        self.generation
    }

    /// Returns the full catalog, built and validated from the knowledge base
    /// on first access and cached for the lifetime of the process.
    ///
    /// The built-in knowledge base is trusted to be well-formed; a broken
    /// `ARCHSPEC_EXTENSION_CPU_DIR`/`ARCHSPEC_CPU_DIR` override fails loudly
    /// here rather than being silently ignored, since catalog errors are
    /// raised at load time and never deferred.
    pub fn known_targets() -> &'static HashMap<String, Arc<Microarchitecture>> {
        static KNOWN_TARGETS: OnceLock<HashMap<String, Arc<Microarchitecture>>> = OnceLock::new();
        KNOWN_TARGETS.get_or_init(|| {
            build_catalog().expect("failed to build the microarchitecture catalog")
        })
    }

    /// All ancestors of this node, first-parent depth-first, deduplicated on
    /// first occurrence. Does not include `self`.
    pub fn ancestors(&self) -> &[Arc<Microarchitecture>] {
        self.ancestors.get_or_init(|| {
            let mut result = Vec::new();
            for parent in &self.parents {
                push_ancestors_dfs(parent, &mut result);
            }
            result
        })
    }

    /// True if `parent` is a (possibly indirect) ancestor of this node.
    pub fn is_descendant_of(&self, parent: &Microarchitecture) -> bool {
        self.ancestors().iter().any(|a| a.name == parent.name)
    }

    /// True if this node has every feature `other` has, directly or
    /// inherited, and more.
    pub fn is_strict_superset(&self, other: &Microarchitecture) -> bool {
        self.name != other.name && self.is_superset(other)
    }

    fn is_superset(&self, other: &Microarchitecture) -> bool {
        self.all_features().is_superset(&other.all_features())
    }

    /// The family root: the last element of [`Self::ancestors`], or `self`
    /// if this node has no parents. Follows first-parent precedence when a
    /// node has multiple parents.
    pub fn family(&self) -> &Self {
        match self.parents.first() {
            Some(parent) => parent.family(),
            None => self,
        }
    }

    /// True if `feature` is present, either owned directly or inherited from
    /// an ancestor.
    pub fn contains(&self, feature: &str) -> bool {
        self.features.contains(feature) || self.ancestors().iter().any(|a| a.features.contains(feature))
    }

    /// The union of `self.features` with every ancestor's `features`.
    pub fn all_features(&self) -> HashSet<String> {
        let mut features = self.features.clone();
        for ancestor in self.ancestors() {
            features.extend(ancestor.features.iter().cloned());
        }
        features
    }

    /// A serializable snapshot of this node (see [`MicroarchitectureSnapshot`]).
    pub fn to_dict(&self) -> MicroarchitectureSnapshot {
        MicroarchitectureSnapshot {
            name: self.name.clone(),
            vendor: self.vendor.clone(),
            features: self.features.iter().cloned().sorted().collect(),
            parents: self.parents.iter().map(|p| p.name.clone()).collect(),
            generation: self.generation,
        }
    }

    /// Resolves the compiler flags to optimize for this microarchitecture
    /// with `compiler` at `version`.
    ///
    /// Walks `self`, then its ancestors in [`Self::ancestors`] order, for the
    /// first node defining a `compilers[compiler]` table. If no such table
    /// exists anywhere, the compiler is simply unknown to this
    /// microarchitecture and an empty string is returned. If a table exists
    /// but no entry's version spec matches `version`, this fails loudly with
    /// [`UnsupportedMicroarchitecture`], since in that case we *do* know the
    /// compiler can't target this microarchitecture.
    pub fn optimization_flags(
        &self,
        compiler: &str,
        version: &str,
    ) -> Result<String, UnsupportedMicroarchitecture> {
        let found = std::iter::once(self)
            .chain(self.ancestors().iter().map(AsRef::as_ref))
            .find_map(|node| node.compilers.get(compiler));

        let Some(entries) = found else {
            return Ok(String::new());
        };

        for entry in entries {
            if entry.spec.matches(version) {
                if let Some(warning) = &entry.warnings {
                    log::warn!(
                        "{} {}@{}: {}",
                        self.name,
                        compiler,
                        version,
                        warning
                    );
                }
                let name = entry.alt_name.as_deref().unwrap_or(&self.name);
                return Ok(entry.flags_template.replace("{name}", name));
            }
        }

        Err(UnsupportedMicroarchitecture {
            name: self.name.clone(),
            compiler: compiler.to_string(),
            version: version.to_string(),
            supported_ranges: entries.iter().map(|e| e.raw_versions.clone()).join(", "),
        })
    }
}

fn push_ancestors_dfs(node: &Arc<Microarchitecture>, acc: &mut Vec<Arc<Microarchitecture>>) {
    if acc.iter().any(|seen| seen.name == node.name) {
        return;
    }
    acc.push(node.clone());
    for parent in &node.parents {
        push_ancestors_dfs(parent, acc);
    }
}

/// Raised when a (microarchitecture, compiler, version) triple is known to
/// the microarchitecture's compiler table but no entry's version spec
/// matches the requested version.
#[derive(Error, Debug, PartialEq, Eq)]
#[error(
    "{compiler}@{version} does not support microarchitecture '{name}'; supported version ranges: {supported_ranges}"
)]
pub struct UnsupportedMicroarchitecture {
    pub name: String,
    pub compiler: String,
    pub version: String,
    pub supported_ranges: String,
}

/// Builds the catalog from the knowledge base: parses it, resolves `from`
/// references into node references, and rejects cycles/dangling parents.
/// This is where [`CatalogError`] is raised — never later, at query time.
fn build_catalog() -> Result<HashMap<String, Arc<Microarchitecture>>, CatalogError> {
    let schema = schema::load_microarchitectures_schema()?;
    build_catalog_from_schema(&schema)
}

fn build_catalog_from_schema(
    schema: &MicroarchitecturesSchema,
) -> Result<HashMap<String, Arc<Microarchitecture>>, CatalogError> {
    let mut targets: HashMap<String, Arc<Microarchitecture>> = HashMap::new();
    let mut visiting: HashSet<String> = HashSet::new();

    for name in schema.microarchitectures.keys() {
        if !targets.contains_key(name) {
            fill_target(name, schema, &mut targets, &mut visiting)?;
        }
    }

    let host_platform = match std::env::consts::ARCH {
        "powerpc64" => "ppc64",
        "powerpc64le" => "ppc64le",
        arch => arch,
    };
    targets
        .entry(host_platform.to_string())
        .or_insert_with(|| Arc::new(Microarchitecture::generic(host_platform)));

    Ok(targets)
}

fn fill_target(
    name: &str,
    schema: &MicroarchitecturesSchema,
    targets: &mut HashMap<String, Arc<Microarchitecture>>,
    visiting: &mut HashSet<String>,
) -> Result<(), CatalogError> {
    if targets.contains_key(name) {
        return Ok(());
    }
    if !visiting.insert(name.to_string()) {
        return Err(CatalogError::Cycle {
            node: name.to_string(),
        });
    }

    let values = &schema.microarchitectures[name];
    for parent in &values.from {
        if !schema.microarchitectures.contains_key(parent) {
            return Err(CatalogError::DanglingParent {
                node: name.to_string(),
                parent: parent.clone(),
            });
        }
        fill_target(parent, schema, targets, visiting)?;
    }

    let parents = values
        .from
        .iter()
        .map(|parent| targets[parent].clone())
        .collect::<Vec<_>>();

    let features: HashSet<String> = values.features.iter().cloned().collect();
    let compilers = build_compilers(&values.compilers)?;
    let generation = values.generation.unwrap_or(0);

    targets.insert(
        name.to_string(),
        Arc::new(Microarchitecture::new_generation(
            name.to_string(),
            parents,
            values.vendor.clone(),
            features,
            compilers,
            generation,
        )),
    );
    visiting.remove(name);
    Ok(())
}

fn build_compilers(
    compilers: &Option<HashMap<String, CompilerSet>>,
    // returns in declaration order, since first matching entry wins.
) -> Result<HashMap<String, Vec<CompilerEntry>>, CatalogError> {
    let Some(compilers) = compilers else {
        return Ok(HashMap::new());
    };

    compilers
        .iter()
        .map(|(compiler, set)| {
            let entries = set
                .clone()
                .into_vec()
                .into_iter()
                .map(|c| {
                    Ok(CompilerEntry {
                        spec: VersionSpec::parse(&c.versions)?,
                        raw_versions: c.versions,
                        flags_template: c.flags,
                        alt_name: c.name,
                        warnings: c.warnings,
                    })
                })
                .collect::<Result<Vec<_>, CatalogError>>()?;
            Ok((compiler.clone(), entries))
        })
        .collect()
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

    fn targets() -> HashMap<String, Arc<Microarchitecture>> {
        build_catalog_from_schema(&schema()).expect("valid catalog")
    }

    #[test]
    fn contains_checks_own_then_ancestor_features() {
        let targets = targets();
        let broadwell = &targets["broadwell"];
        assert!(broadwell.contains("avx2"));
        assert!(!broadwell.contains("avx512f"));
    }

    #[test]
    fn ancestry_partial_order_within_a_family() {
        let targets = targets();
        let nehalem = &targets["nehalem"];
        let broadwell = &targets["broadwell"];
        assert!(nehalem < broadwell);
        assert!(!(nehalem > broadwell));
        assert!(nehalem != broadwell);
    }

    #[test]
    fn different_families_are_incomparable() {
        let targets = targets();
        let nehalem = &targets["nehalem"];
        let a64fx = &targets["a64fx"];
        assert_eq!(nehalem.partial_cmp(a64fx), None);
        assert!(!(**nehalem > **a64fx));
        assert!(!(**nehalem < **a64fx));
        assert!(nehalem != a64fx);
    }

    #[test]
    fn family_and_ancestors_terminate_at_the_root() {
        let targets = targets();
        let nehalem = &targets["nehalem"];
        let x86_64 = &targets["x86_64"];
        assert_eq!(nehalem.ancestors().last().unwrap().name(), "x86_64");
        assert_eq!(nehalem.family().name(), x86_64.name());
    }

    #[test]
    fn optimization_flags_render_name_token() {
        let targets = targets();
        let broadwell = &targets["broadwell"];
        assert_eq!(
            broadwell.optimization_flags("intel", "19.0.1").unwrap(),
            "-march=broadwell -mtune=broadwell"
        );
    }

    #[test]
    fn optimization_flags_inherited_table_renders_queried_node_name() {
        let targets = targets();
        // skylake has no own "intel" compiler table; it inherits broadwell's.
        // The rendered {name} must still be "skylake", not "broadwell".
        let skylake = &targets["skylake"];
        assert_eq!(
            skylake.optimization_flags("intel", "19.0.1").unwrap(),
            "-march=skylake -mtune=skylake"
        );
    }

    #[test]
    fn optimization_flags_first_matching_entry_wins() {
        let targets = targets();
        let thunderx2 = &targets["thunderx2"];
        assert_eq!(
            thunderx2.optimization_flags("gcc", "5.1.0").unwrap(),
            "-march=armv8-a+crc+crypto"
        );
        assert_eq!(
            thunderx2.optimization_flags("gcc", "9.1.0").unwrap(),
            "-mcpu=thunderx2t99"
        );
    }

    #[test]
    fn optimization_flags_reports_supported_ranges_when_unsupported() {
        let targets = targets();
        let icelake = &targets["icelake"];
        let err = icelake.optimization_flags("gcc", "4.8.3").unwrap_err();
        assert_eq!(err.compiler, "gcc");
        assert_eq!(err.version, "4.8.3");
        assert_eq!(err.name, "icelake");
        assert_eq!(err.supported_ranges, "8.0:");
    }

    #[test]
    fn optimization_flags_unknown_compiler_is_empty_string() {
        let targets = targets();
        let broadwell = &targets["broadwell"];
        assert_eq!(broadwell.optimization_flags("unknown", "5.1").unwrap(), "");
    }

    #[test]
    fn to_dict_round_trips_through_json() {
        let targets = targets();
        let broadwell = &targets["broadwell"];
        let snapshot = broadwell.to_dict();
        let json = serde_json::to_string(&snapshot).unwrap();
        let reloaded: MicroarchitectureSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(reloaded.name, broadwell.name());
        assert_eq!(reloaded.vendor, broadwell.vendor());
        let mut own_features: Vec<_> = broadwell.features().iter().cloned().collect();
        own_features.sort();
        assert_eq!(reloaded.features, own_features);
        assert_eq!(
            reloaded.parents,
            broadwell.parents().iter().map(|p| p.name().to_string()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn dangling_parent_reference_is_rejected() {
        let mut schema = schema();
        schema.microarchitectures.get_mut("broadwell").unwrap().from = vec!["no_such_node".to_string()];
        let err = build_catalog_from_schema(&schema).unwrap_err();
        assert!(matches!(err, CatalogError::DanglingParent { .. }));
    }

    #[test]
    fn cycle_between_nodes_is_rejected() {
        let mut schema = schema();
        // Introduce a 2-cycle: nehalem now (also) derives from broadwell.
        schema.microarchitectures.get_mut("nehalem").unwrap().from = vec!["broadwell".to_string()];
        let err = build_catalog_from_schema(&schema).unwrap_err();
        assert!(matches!(err, CatalogError::Cycle { .. }));
    }

    #[test]
    fn malformed_version_spec_is_rejected_at_build_time() {
        let mut schema = schema();
        let broadwell = schema.microarchitectures.get_mut("broadwell").unwrap();
        broadwell.compilers.get_or_insert_with(HashMap::new).insert(
            "gcc".to_string(),
            CompilerSet::Single(schema::Compiler {
                versions: "not-a-spec".to_string(),
                flags: "-march={name}".to_string(),
                name: None,
                warnings: None,
            }),
        );
        let err = build_catalog_from_schema(&schema).unwrap_err();
        assert!(matches!(err, CatalogError::MalformedVersionSpec { .. }));
    }
}
