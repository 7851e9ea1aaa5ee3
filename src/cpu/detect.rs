//! Detects the host's microarchitecture: probe (C5) -> canonicalize (C4) ->
//! select (C6).

#![allow(dead_code)]

use super::alias::{self, AliasContext, Os};
use super::cpuid::{CpuId, CpuIdProvider, MachineCpuIdProvider};
use super::microarchitecture::Microarchitecture;
use super::schema;
use itertools::Itertools;
use std::{
    collections::{HashMap, HashSet},
    io::{BufRead, BufReader, Cursor},
    sync::Arc,
};

/// Returns the architecture as defined by the compiler.
const fn target_architecture_compiler() -> &'static str {
    // HACK: Cannot compare strings in const context, but we can compare bytes.
    match std::env::consts::ARCH.as_bytes() {
        b"powerpc64" if cfg!(target_endian = "little") => "ppc64le",
        b"powerpc64" => "ppc64",
        _ => std::env::consts::ARCH,
    }
}

/// Returns the architecture of the host machine by querying uname.
#[cfg(not(target_os = "windows"))]
fn target_architecture_uname() -> std::io::Result<String> {
    use std::ffi::CStr;
    use std::mem::MaybeUninit;

    let mut utsname = MaybeUninit::zeroed();
    let r = unsafe { libc::uname(utsname.as_mut_ptr()) };
    if r != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let utsname = unsafe { utsname.assume_init() };
    let machine = unsafe { CStr::from_ptr(utsname.machine.as_ptr()) };

    Ok(machine.to_string_lossy().into_owned())
}

pub(crate) struct ProcCpuInfo {
    cpu_info: HashMap<String, String>,
}

impl ProcCpuInfo {
    pub fn from_str(contents: &str) -> Self {
        Self::from_reader(Cursor::new(contents.as_bytes()))
    }

    pub fn from_reader(reader: impl BufRead) -> Self {
        let mut cpu_info = std::collections::HashMap::new();
        for line in reader.lines() {
            let Ok(line) = line else {
                continue;
            };
            let Some((key, value)) = line.split_once(':') else {
                // If there is no seperator and info was already populated, break because we are on a
                // blank line seperating CPUs.
                if !cpu_info.is_empty() {
                    break;
                }
                continue;
            };
            cpu_info.insert(key.trim().to_string(), value.trim().to_string());
        }
        Self { cpu_info }
    }

    /// Read the contents from /proc/cpuinfo and parse it into a `ProcCpuInfo` struct.
    pub fn from_proc_info() -> std::io::Result<Self> {
        let file = std::fs::File::open("/proc/cpuinfo")?;
        Ok(Self::from_reader(BufReader::new(file)))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.cpu_info.get(key).map(String::as_str)
    }
}

/// A raw probe result, before alias canonicalization and before it's matched
/// against the catalog. `family` is the architecture tag (`"x86_64"`,
/// `"aarch64"`, ...) used to locate the family root; an empty family means
/// "could not be determined", which selection treats as the generic node.
#[derive(Debug, Default)]
struct RawRecord {
    vendor: String,
    features: HashSet<String>,
    family: String,
    model: Option<String>,
    generation: Option<usize>,
}

impl RawRecord {
    fn generic(family: &str) -> Self {
        RawRecord {
            vendor: "generic".to_string(),
            family: family.to_string(),
            ..Default::default()
        }
    }
}

/// Probes CPUID for vendor/feature information. Only meaningful on
/// `x86`/`x86_64`; kept reachable only through tests and the (unreached on
/// this crate's `host()` path) Windows branch.
fn probe_windows<C: CpuIdProvider>(arch: &str, cpuid: &C) -> RawRecord {
    match arch {
        "x86_64" | "x86" => {
            let detected = CpuId::detect(cpuid);
            RawRecord {
                vendor: detected.vendor,
                features: detected.features,
                family: arch.to_string(),
                model: detected.brand,
                generation: None,
            }
        }
        target_arch @ ("ppc64" | "ppc64le" | "aarch64" | "riscv64") => {
            RawRecord::generic(target_arch)
        }
        _ => RawRecord::default(),
    }
}

fn probe_linux(arch: &str, cpu_info: &ProcCpuInfo) -> RawRecord {
    match arch {
        "x86_64" | "x86" => RawRecord {
            vendor: cpu_info.get("vendor_id").unwrap_or("generic").to_string(),
            features: cpu_info
                .get("flags")
                .unwrap_or_default()
                .split_ascii_whitespace()
                .map(str::to_string)
                .collect(),
            family: arch.to_string(),
            ..Default::default()
        },
        "aarch64" => {
            let schema = schema::microarchitectures_schema();
            let vendor = cpu_info
                .get("CPU implementer")
                // Mapping numeric codes to vendor (ARM). This list is a merge from
                // different sources:
                //
                // https://github.com/karelzak/util-linux/blob/master/sys-utils/lscpu-arm.c
                // https://developer.arm.com/docs/ddi0487/latest/arm-architecture-reference-manual-armv8-for-armv8-a-architecture-profile
                // https://github.com/gcc-mirror/gcc/blob/master/gcc/config/aarch64/aarch64-cores.def
                // https://patchwork.kernel.org/patch/10524949/
                .and_then(|implementer| schema.conversions.arm_vendors.get(implementer))
                .cloned()
                .unwrap_or_else(|| "generic".to_string());

            RawRecord {
                vendor,
                features: cpu_info
                    .get("Features")
                    .unwrap_or_default()
                    .split_ascii_whitespace()
                    .map(str::to_string)
                    .collect(),
                family: arch.to_string(),
                ..Default::default()
            }
        }
        "ppc64" | "ppc64le" => {
            let cpu = cpu_info.get("cpu").unwrap_or_default();
            let generation = cpu.strip_prefix("POWER").and_then(|rest| {
                let digits = rest
                    .split_once(|c: char| !c.is_ascii_digit())
                    .map_or(rest, |(digits, _)| digits);
                digits.parse().ok()
            });
            RawRecord {
                family: arch.to_string(),
                generation,
                ..RawRecord::generic(arch)
            }
        }
        "riscv64" | "riscv32" => {
            let model = match cpu_info.get("uarch") {
                Some("sifive,u74-mc") => Some("u74mc".to_string()),
                Some(uarch) => Some(uarch.to_string()),
                None => None,
            };
            RawRecord {
                family: arch.to_string(),
                model,
                ..RawRecord::generic(arch)
            }
        }
        _ => RawRecord::generic(arch),
    }
}

pub(crate) trait SysCtlProvider {
    fn sysctl(&self, name: &str) -> std::io::Result<String>;
}

#[derive(Default)]
pub(crate) struct MachineSysCtlProvider {}

impl SysCtlProvider for MachineSysCtlProvider {
    fn sysctl(&self, name: &str) -> std::io::Result<String> {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "macos")] {
                use sysctl::Sysctl;
                sysctl::Ctl::new(name)
                    .and_then(|ctl| ctl.value())
                    .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
                    .map(|v| v.to_string())
            } else {
                unimplemented!("Sysctl is not implemented for this platform, requesting {name}")
            }
        }
    }
}

/// `hw.optional.*` leaves scanned on Darwin, each contributing a feature
/// token (already in its canonical, Linux-equivalent spelling) when the leaf
/// reads as a truthy boolean.
const HW_OPTIONAL_FEATURES: &[(&str, &str)] = &[
    ("hw.optional.floatingpoint", "fp"),
    ("hw.optional.neon", "asimd"),
    ("hw.optional.neon_hpfp", "asimdhp"),
    ("hw.optional.armv8_crc32", "crc32"),
    ("hw.optional.arm.FEAT_LSE", "lse"),
    ("hw.optional.arm.FEAT_FP16", "fphp"),
    ("hw.optional.arm.FEAT_DotProd", "asimddp"),
    ("hw.optional.arm.FEAT_SHA3", "sha3"),
    ("hw.optional.arm.FEAT_SHA512", "sha512"),
];

fn probe_macos<S: SysCtlProvider>(arch: &str, sysctl: &S) -> RawRecord {
    match arch {
        "x86_64" => {
            let cpu_features = sysctl
                .sysctl("machdep.cpu.features")
                .unwrap_or_default()
                .to_lowercase();
            let cpu_leaf7_features = sysctl
                .sysctl("machdep.cpu.leaf7_features")
                .unwrap_or_default()
                .to_lowercase();
            let vendor = sysctl
                .sysctl("machdep.cpu.vendor")
                .unwrap_or_else(|_| "generic".to_string());

            let features = cpu_features
                .split_whitespace()
                .chain(cpu_leaf7_features.split_whitespace())
                .map(str::to_string)
                .collect::<HashSet<String>>();

            RawRecord {
                vendor,
                features,
                family: arch.to_string(),
                ..Default::default()
            }
        }
        _ => {
            let model = sysctl
                .sysctl("machdep.cpu.brand_string")
                .map(|v| v.to_lowercase())
                .ok();
            let model = match model.as_deref() {
                Some(model) if model.contains("m2") => "m2".to_string(),
                Some(model) if model.contains("m1") => "m1".to_string(),
                Some(model) if model.contains("apple") => "m1".to_string(),
                _ => "aarch64".to_string(),
            };

            let mut features = HashSet::new();
            for (leaf, token) in HW_OPTIONAL_FEATURES {
                if sysctl.sysctl(leaf).map(|v| v.trim() == "1").unwrap_or(false) {
                    features.insert(token.to_string());
                }
            }

            RawRecord {
                vendor: "Apple".to_string(),
                features,
                family: "aarch64".to_string(),
                model: Some(model),
                generation: None,
            }
        }
    }
}

/// Ranks `candidates` by depth, then generation, then name (spec.md §4.6
/// step 5) and returns the winner, or `fallback` if `candidates` is empty
/// (step 6).
fn best_of(
    candidates: Vec<&Arc<Microarchitecture>>,
    fallback: &Arc<Microarchitecture>,
) -> Arc<Microarchitecture> {
    candidates
        .into_iter()
        .sorted_by_key(|target| (target.ancestors().len(), target.generation(), target.name().to_string()))
        .last()
        .cloned()
        .unwrap_or_else(|| fallback.clone())
}

/// Implements the full C6 algorithm: family filter, vendor filter,
/// feature-subset filter, then [`best_of`]. Shared by every architecture
/// except where a quirkier rule is known to do better (see the per-arch
/// wrappers below).
fn select_generic(
    targets: &HashMap<String, Arc<Microarchitecture>>,
    record: &RawRecord,
) -> Option<Arc<Microarchitecture>> {
    let arch_root = targets.get(&record.family)?;

    let candidates = targets
        .values()
        .filter(|target| {
            target.family().name() == arch_root.name()
                && alias::vendor_matches(target.vendor(), &record.vendor)
                && target.all_features().is_subset(&record.features)
        })
        .collect_vec();

    Some(best_of(candidates, arch_root))
}

/// ppc64/ppc64le: there is no reliable feature list in `/proc/cpuinfo`, only
/// a POWER generation number, so candidates are ranked by generation alone.
fn select_ppc64(
    targets: &HashMap<String, Arc<Microarchitecture>>,
    record: &RawRecord,
) -> Option<Arc<Microarchitecture>> {
    let arch_root = targets.get(&record.family)?;
    let generation = record.generation.unwrap_or(0);

    let candidates = targets
        .values()
        .filter(|target| {
            target.family().name() == arch_root.name() && target.generation() <= generation
        })
        .collect_vec();

    Some(best_of(candidates, arch_root))
}

/// riscv64/riscv32: the kernel reports a vendor-specific microarchitecture
/// name directly (`uarch`), so selection is a name match rather than a
/// feature comparison.
fn select_riscv(
    targets: &HashMap<String, Arc<Microarchitecture>>,
    record: &RawRecord,
) -> Option<Arc<Microarchitecture>> {
    let arch_root = targets.get(&record.family)?;
    match &record.model {
        Some(model) => Some(targets.get(model).unwrap_or(arch_root).clone()),
        None => Some(arch_root.clone()),
    }
}

/// macOS/Apple Silicon: `sysctl` cannot report the full feature list the way
/// Linux's `/proc/cpuinfo` can, but the brand string pins down the exact
/// model, so selection is a direct lookup (falling back to the feature-subset
/// algorithm using whatever `hw.optional.*` leaves were read, in case the
/// model couldn't be pinned down).
fn select_macos_aarch64(
    targets: &HashMap<String, Arc<Microarchitecture>>,
    record: &RawRecord,
) -> Option<Arc<Microarchitecture>> {
    let arch_root = targets.get("aarch64")?;
    match record.model.as_deref().and_then(|model| targets.get(model)) {
        Some(exact) => Some(exact.clone()),
        None => select_generic(targets, record).or_else(|| Some(arch_root.clone())),
    }
}

fn select(
    targets: &HashMap<String, Arc<Microarchitecture>>,
    record: &RawRecord,
    is_macos: bool,
) -> Arc<Microarchitecture> {
    let picked = match record.family.as_str() {
        _ if record.family.is_empty() => None,
        "aarch64" if is_macos => select_macos_aarch64(targets, record),
        "ppc64" | "ppc64le" => select_ppc64(targets, record),
        "riscv64" | "riscv32" => select_riscv(targets, record),
        _ => select_generic(targets, record),
    };

    picked.unwrap_or_else(|| {
        targets
            .get("generic")
            .cloned()
            .unwrap_or_else(|| Arc::new(Microarchitecture::generic("generic")))
    })
}

struct TargetDetector<S, C> {
    target_os: Option<String>,
    target_arch: Option<String>,
    cpu_info: Option<ProcCpuInfo>,
    cpuid_provider: C,
    sysctl_provider: S,
}

impl TargetDetector<MachineSysCtlProvider, MachineCpuIdProvider> {
    pub fn new() -> Self {
        Self {
            target_os: None,
            target_arch: None,
            cpu_info: None,
            cpuid_provider: MachineCpuIdProvider::default(),
            sysctl_provider: MachineSysCtlProvider::default(),
        }
    }
}

impl<S: SysCtlProvider, C: CpuIdProvider> TargetDetector<S, C> {
    pub fn with_sysctl_provider<O: SysCtlProvider>(
        self,
        sysctl_provider: O,
    ) -> TargetDetector<O, C> {
        TargetDetector {
            target_os: self.target_os,
            target_arch: self.target_arch,
            cpu_info: self.cpu_info,
            cpuid_provider: self.cpuid_provider,
            sysctl_provider,
        }
    }

    pub fn with_cpuid_provider<O: CpuIdProvider>(self, cpuid_provider: O) -> TargetDetector<S, O> {
        TargetDetector {
            target_os: self.target_os,
            target_arch: self.target_arch,
            cpu_info: self.cpu_info,
            cpuid_provider,
            sysctl_provider: self.sysctl_provider,
        }
    }

    pub fn with_target_os(self, target_os: &str) -> Self {
        Self {
            target_os: Some(target_os.to_string()),
            ..self
        }
    }

    pub fn with_target_arch(self, target_arch: &str) -> Self {
        Self {
            target_arch: Some(target_arch.to_string()),
            ..self
        }
    }

    pub fn with_proc_cpu_info(self, proc_cpu_info: ProcCpuInfo) -> Self {
        Self {
            cpu_info: Some(proc_cpu_info),
            ..self
        }
    }

    /// Probes the host (or the injected test doubles), canonicalizes its raw
    /// feature set, and selects the best-matching catalog node. Never fails:
    /// every degradation path (unreadable `/proc/cpuinfo`, unknown OS,
    /// `sysctl` permission errors) falls through to the generic family root,
    /// per spec.md §4.5's "probes must not fail the program" rule.
    pub fn detect(self) -> Arc<Microarchitecture> {
        let os = self.target_os.as_deref().unwrap_or(std::env::consts::OS);
        let is_macos = os == "macos";

        // On macOS, it might happen that we are on an M1 but running in Rosetta. In that
        // case uname will return "x86_64" so we need to fix that.
        let target_arch: Option<String> = match (os, &self.target_arch) {
            ("linux" | "windows", Some(arch)) => Some(arch.clone()),
            ("linux", None) => target_architecture_uname().ok(),
            ("macos", _) => Some(
                if self
                    .sysctl_provider
                    .sysctl("machdep.cpu.brand_string")
                    .unwrap_or_default()
                    .contains("Apple")
                {
                    "aarch64".to_string()
                } else {
                    "x86_64".to_string()
                },
            ),
            _ => Some(target_architecture_compiler().to_string()),
        };

        let raw_record = match (target_arch.as_deref(), os) {
            (Some(arch), "linux") => {
                match self.cpu_info.or_else(|| ProcCpuInfo::from_proc_info().ok()) {
                    Some(cpu_info) => probe_linux(arch, &cpu_info),
                    None => RawRecord::generic(arch),
                }
            }
            (Some(arch), "macos") => probe_macos(arch, &self.sysctl_provider),
            (Some(arch), "windows") => probe_windows(arch, &self.cpuid_provider),
            (Some(arch), _) => RawRecord::generic(arch),
            (None, _) => RawRecord::default(),
        };

        let schema = schema::microarchitectures_schema();
        let ctx = AliasContext {
            os: match os {
                "linux" => Os::Linux,
                "macos" => Os::Darwin,
                _ => Os::Generic,
            },
            vendor: &raw_record.vendor,
            family: target_arch.as_deref(),
        };
        let canonical_features = alias::canonicalize(&raw_record.features, &ctx, schema);

        let record = RawRecord {
            features: canonical_features,
            ..raw_record
        };

        select(Microarchitecture::known_targets(), &record, is_macos)
    }
}

/// Detects the host micro-architecture and returns it. Always succeeds,
/// falling back to the generic family root when the host can't be pinned
/// down any more precisely (unknown OS, probe failure, ...).
pub fn host() -> Arc<Microarchitecture> {
    TargetDetector::new().detect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::cpuid::CpuIdRegisters;
    use rstest::rstest;

    #[test]
    fn check_host() {
        let host = super::host();
        eprintln!("{:#?}", &host);
    }

    #[rstest]
    #[case("broadwell", "GenuineIntel", &[
        "mmx", "sse", "sse2",
        "sse3", "ssse3", "sse4_1", "sse4_2", "popcnt",
        "aes", "pclmulqdq",
        "avx", "xsave",
        "f16c", "rdrnd", "fsgsbase",
        "avx2", "bmi1", "bmi2", "fma", "lzcnt", "movbe",
        "adx", "rdseed",
    ])]
    fn linux_x86_64_feature_subset_selects_expected_target(
        #[case] expected: &str,
        #[case] vendor: &str,
        #[case] flags: &[&str],
    ) {
        let contents = format!(
            "vendor_id\t: {vendor}\nflags\t\t: {}\n",
            flags.join(" ")
        );
        let cpu_info = ProcCpuInfo::from_str(&contents);
        let detected = TargetDetector::new()
            .with_target_os("linux")
            .with_target_arch("x86_64")
            .with_proc_cpu_info(cpu_info)
            .detect();
        assert_eq!(detected.name(), expected);
    }

    #[test]
    fn linux_unknown_vendor_falls_back_to_family_root() {
        let contents = "vendor_id\t: BogusVendor\nflags\t\t: mmx sse sse2\n";
        let cpu_info = ProcCpuInfo::from_str(contents);
        let detected = TargetDetector::new()
            .with_target_os("linux")
            .with_target_arch("x86_64")
            .with_proc_cpu_info(cpu_info)
            .detect();
        assert_eq!(detected.name(), "x86_64");
    }

    struct MemorySysCtlProvider {
        contents: HashMap<String, String>,
    }

    impl MemorySysCtlProvider {
        fn new(entries: &[(&str, &str)]) -> Self {
            Self {
                contents: entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            }
        }
    }

    impl SysCtlProvider for MemorySysCtlProvider {
        fn sysctl(&self, name: &str) -> std::io::Result<String> {
            self.contents
                .get(name)
                .cloned()
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))
        }
    }

    #[test]
    fn macos_apple_silicon_model_exact_match() {
        let sysctl = MemorySysCtlProvider::new(&[("machdep.cpu.brand_string", "Apple M1")]);
        let detected = TargetDetector::new()
            .with_target_os("macos")
            .with_sysctl_provider(sysctl)
            .detect();
        assert_eq!(detected.name(), "m1");
    }

    struct TraceCpuIdProvider {
        trace: HashMap<(u32, u32), CpuIdRegisters>,
    }

    impl CpuIdProvider for TraceCpuIdProvider {
        fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdRegisters {
            self.trace
                .get(&(leaf, subleaf))
                .copied()
                .unwrap_or_default()
        }
    }

    #[test]
    fn windows_non_x86_falls_back_to_generic_node() {
        let trace = HashMap::new();
        let cpuid = TraceCpuIdProvider { trace };
        let detected = TargetDetector::new()
            .with_target_os("windows")
            .with_target_arch("aarch64")
            .with_cpuid_provider(cpuid)
            .detect();
        assert_eq!(detected.vendor(), "generic");
    }
}
