//! CPUID-based feature detection, used on the `x86_64`/`x86` Windows path.
//!
//! Host detection on Windows is out of scope (see `cpu::detect`), so nothing
//! here is reachable from `cpu::host()`. It is kept as tested, self-contained
//! infrastructure: the `CpuIdProvider` trait lets tests replay a CPUID trace
//! without requiring an actual x86 host.

use super::schema::{self, CpuRegister};
use std::collections::HashSet;

/// The four general-purpose registers `cpuid` writes its result into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CpuIdRegisters {
    pub(crate) eax: u32,
    pub(crate) ebx: u32,
    pub(crate) ecx: u32,
    pub(crate) edx: u32,
}

/// Something that can execute a `cpuid` leaf/subleaf query. Abstracts over
/// the real instruction so tests can substitute a recorded trace.
pub(crate) trait CpuIdProvider {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdRegisters;
}

/// Queries the real `cpuid` instruction. Only meaningful on `x86`/`x86_64`.
#[derive(Default)]
pub(crate) struct MachineCpuIdProvider {}

impl CpuIdProvider for MachineCpuIdProvider {
    #[cfg(target_arch = "x86_64")]
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdRegisters {
        let registers = unsafe { std::arch::x86_64::__cpuid_count(leaf, subleaf) };
        CpuIdRegisters {
            eax: registers.eax,
            ebx: registers.ebx,
            ecx: registers.ecx,
            edx: registers.edx,
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn cpuid(&self, _leaf: u32, _subleaf: u32) -> CpuIdRegisters {
        unimplemented!("cpuid is only available on x86_64")
    }
}

/// The result of probing a CPU through CPUID: vendor, optional brand string,
/// and the set of canonical feature names the leaf/bit schema recognizes.
#[derive(Debug, Clone)]
pub(crate) struct CpuId {
    pub(crate) vendor: String,
    pub(crate) brand: Option<String>,
    pub(crate) features: HashSet<String>,
}

impl CpuId {
    /// Runs the CPUID-based detection described by the `cpuid.json` schema
    /// against `provider`.
    pub(crate) fn detect<P: CpuIdProvider>(provider: &P) -> Self {
        let schema = schema::cpuid_schema();

        let registers = provider.cpuid(schema.vendor.input.eax, schema.vendor.input.ecx);
        let highest_basic_support = registers.eax;
        let vendor = vendor_string(registers.ebx, registers.edx, registers.ecx);

        let registers = provider.cpuid(
            schema.highest_extension_support.input.eax,
            schema.highest_extension_support.input.ecx,
        );
        let highest_extension_support = registers.eax;

        let mut features = HashSet::new();
        let supported_flags = schema
            .flags
            .iter()
            .filter(|flags| flags.input.eax <= highest_basic_support);
        let supported_extensions = schema
            .extension_flags
            .iter()
            .filter(|flags| flags.input.eax <= highest_extension_support);
        for flags in supported_flags.chain(supported_extensions) {
            let registers = provider.cpuid(flags.input.eax, flags.input.ecx);
            for bits in &flags.bits {
                let register = match bits.register {
                    CpuRegister::Eax => registers.eax,
                    CpuRegister::Ebx => registers.ebx,
                    CpuRegister::Ecx => registers.ecx,
                    CpuRegister::Edx => registers.edx,
                };
                if register & (1 << bits.bit) != 0 {
                    features.insert(bits.name.clone());
                }
            }
        }

        let brand = if highest_extension_support >= 0x8000_0004 {
            let mut bytes = Vec::with_capacity(48);
            for leaf in [0x8000_0002u32, 0x8000_0003, 0x8000_0004] {
                let registers = provider.cpuid(leaf, 0);
                for word in [registers.eax, registers.ebx, registers.ecx, registers.edx] {
                    bytes.extend_from_slice(&word.to_le_bytes());
                }
            }
            let nul = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            Some(String::from_utf8_lossy(&bytes[..nul]).trim().to_string())
        } else {
            None
        };

        CpuId {
            vendor,
            brand,
            features,
        }
    }

    /// Returns the CPUID information for the host CPU, detected once and cached.
    #[cfg_attr(not(target_arch = "x86_64"), allow(dead_code))]
    pub(crate) fn host() -> &'static Self {
        static CPUID: std::sync::OnceLock<CpuId> = std::sync::OnceLock::new();
        CPUID.get_or_init(|| CpuId::detect(&MachineCpuIdProvider::default()))
    }
}

fn vendor_string(ebx: u32, edx: u32, ecx: u32) -> String {
    let mut bytes = Vec::with_capacity(12);
    for word in [ebx, edx, ecx] {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
