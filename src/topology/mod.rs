//! Hybrid CPU topology discovery.
//!
//! Intel hybrid parts (Alder/Raptor Lake class) expose their P-core/E-core
//! partition through sysfs. Two sources are tried in order:
//!
//! 1. The per-PMU CPU lists `/sys/devices/cpu_core/cpus` and
//!    `/sys/devices/cpu_atom/cpus` (Linux 5.13+), compact range lists such
//!    as `"0-11"` or `"0-2,5,8-10"`.
//! 2. The per-CPU `topology/core_type` files (Linux 5.18+), containing
//!    `Core`/`intel_core` or `Atom`/`intel_atom`.
//!
//! The result is an immutable [`TopologyMap`] with an O(1) CPU-to-core-type
//! lookup, built once at startup.

use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

/// Logical CPU number as seen by the kernel, 0-based.
pub type CpuId = u32;

/// Core type classification on a hybrid part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreType {
    /// Not present in either CPU list.
    Unknown,
    /// Performance core.
    PCore,
    /// Efficiency core.
    ECore,
}

impl CoreType {
    /// Canonical label for logs and reports.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PCore => "P-core",
            Self::ECore => "E-core",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for CoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from topology discovery and lookup.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyError {
    #[error("sysfs topology entries not found")]
    SysfsNotFound,

    #[error("system does not have a hybrid CPU")]
    NotHybridCpu,

    #[error("failed to parse CPU list format")]
    ParseError,

    #[error("invalid CPU ID")]
    InvalidCpuId,

    #[error("permission denied accessing sysfs")]
    PermissionDenied,
}

/// Immutable map from logical CPU IDs to core types.
///
/// Lookup is a dense table sized to the largest CPU ID, so `core_type` is
/// O(1). IDs inside the table that belong to neither list (offlined holes in
/// the ID space) resolve to [`TopologyError::InvalidCpuId`], same as IDs past
/// the end.
#[derive(Debug, Clone, Default)]
pub struct TopologyMap {
    p_cores: Vec<CpuId>,
    e_cores: Vec<CpuId>,
    cpu_to_type: Vec<CoreType>,
}

impl TopologyMap {
    /// Build a map from known P-core and E-core ID lists.
    pub fn new(p_cores: Vec<CpuId>, e_cores: Vec<CpuId>) -> Self {
        let max_cpu = p_cores.iter().chain(e_cores.iter()).copied().max();

        let mut cpu_to_type = match max_cpu {
            Some(max) => vec![CoreType::Unknown; max as usize + 1],
            None => Vec::new(),
        };

        for &cpu in &p_cores {
            cpu_to_type[cpu as usize] = CoreType::PCore;
        }
        for &cpu in &e_cores {
            cpu_to_type[cpu as usize] = CoreType::ECore;
        }

        Self {
            p_cores,
            e_cores,
            cpu_to_type,
        }
    }

    /// Discover the topology from the live sysfs tree.
    pub fn load() -> Result<Self, TopologyError> {
        Self::load_from(Path::new("/sys"))
    }

    /// Discover the topology below an alternate sysfs root.
    ///
    /// Production callers use [`TopologyMap::load`]; taking the root as a
    /// parameter lets tests run the full discovery protocol against a
    /// synthetic tree.
    pub fn load_from(sysfs_root: &Path) -> Result<Self, TopologyError> {
        let p_path = sysfs_root.join("devices/cpu_core/cpus");
        let e_path = sysfs_root.join("devices/cpu_atom/cpus");

        match read_sysfs_file(&p_path) {
            Ok(p_content) => {
                let p_cores = parse_cpu_list(&p_content)?;

                // cpu_core without cpu_atom is a homogeneous (non-hybrid) part.
                let e_content = match read_sysfs_file(&e_path) {
                    Ok(content) => content,
                    Err(TopologyError::SysfsNotFound) => {
                        return Err(TopologyError::NotHybridCpu)
                    }
                    Err(err) => return Err(err),
                };
                let e_cores = parse_cpu_list(&e_content)?;

                debug!(
                    p_cores = p_cores.len(),
                    e_cores = e_cores.len(),
                    "topology discovered via per-PMU CPU lists",
                );

                Ok(Self::new(p_cores, e_cores))
            }
            Err(TopologyError::SysfsNotFound) => load_from_core_type_files(sysfs_root),
            Err(err) => Err(err),
        }
    }

    /// Core type of a logical CPU, O(1).
    pub fn core_type(&self, cpu: CpuId) -> Result<CoreType, TopologyError> {
        match self.cpu_to_type.get(cpu as usize) {
            Some(CoreType::Unknown) | None => Err(TopologyError::InvalidCpuId),
            Some(&t) => Ok(t),
        }
    }

    /// All P-core IDs, ascending.
    pub fn p_cores(&self) -> &[CpuId] {
        &self.p_cores
    }

    /// All E-core IDs, ascending.
    pub fn e_cores(&self) -> &[CpuId] {
        &self.e_cores
    }

    /// Total number of classified CPUs.
    pub fn total_cpu_count(&self) -> usize {
        self.p_cores.len() + self.e_cores.len()
    }

    /// True when both core classes are populated.
    pub fn is_hybrid(&self) -> bool {
        !self.p_cores.is_empty() && !self.e_cores.is_empty()
    }
}

/// Parse a sysfs CPU list such as `"0-11"` or `"0-2,5,8-10"`.
///
/// Grammar: comma-separated elements, each a decimal number or an inclusive
/// `start-end` range. Whitespace around tokens is permitted. A trailing
/// comma, an inverted range, or an empty input is a
/// [`TopologyError::ParseError`].
pub fn parse_cpu_list(content: &str) -> Result<Vec<CpuId>, TopologyError> {
    if content.trim().is_empty() {
        return Err(TopologyError::ParseError);
    }

    let mut result = Vec::new();

    // A trailing comma produces an empty final element, which parse_element
    // rejects, so no separate check is needed.
    for element in content.split(',') {
        parse_element(element, &mut result)?;
    }

    Ok(result)
}

fn parse_element(element: &str, result: &mut Vec<CpuId>) -> Result<(), TopologyError> {
    let element = element.trim();

    if element.is_empty() {
        return Err(TopologyError::ParseError);
    }

    match element.split_once('-') {
        None => {
            result.push(parse_number(element)?);
            Ok(())
        }
        Some((start, end)) => {
            let start = parse_number(start)?;
            let end = parse_number(end)?;

            if start > end {
                return Err(TopologyError::ParseError);
            }

            result.extend(start..=end);
            Ok(())
        }
    }
}

fn parse_number(s: &str) -> Result<CpuId, TopologyError> {
    s.trim()
        .parse::<CpuId>()
        .map_err(|_| TopologyError::ParseError)
}

/// Parse a `topology/core_type` file.
///
/// Newer kernels report `Core`/`Atom`, older ones `intel_core`/`intel_atom`.
/// Matching is case-sensitive after trimming surrounding whitespace.
pub fn parse_core_type(content: &str) -> Result<CoreType, TopologyError> {
    match content.trim() {
        "Core" | "intel_core" => Ok(CoreType::PCore),
        "Atom" | "intel_atom" => Ok(CoreType::ECore),
        _ => Err(TopologyError::ParseError),
    }
}

/// Fallback discovery via per-CPU `topology/core_type` files.
fn load_from_core_type_files(sysfs_root: &Path) -> Result<TopologyMap, TopologyError> {
    let cpu_base = sysfs_root.join("devices/system/cpu");

    let entries = fs::read_dir(&cpu_base).map_err(map_io_error)?;

    let mut p_cores = Vec::new();
    let mut e_cores = Vec::new();

    for entry in entries.flatten() {
        let Some(cpu_id) = cpu_id_from_dir_name(&entry.path()) else {
            continue;
        };

        // core_type may be missing or unreadable on individual CPUs
        // (offline, pre-5.18 kernel); those entries are skipped.
        let core_type_path = entry.path().join("topology/core_type");
        let Ok(content) = read_sysfs_file(&core_type_path) else {
            continue;
        };

        match parse_core_type(&content) {
            Ok(CoreType::PCore) => p_cores.push(cpu_id),
            Ok(CoreType::ECore) => e_cores.push(cpu_id),
            Ok(CoreType::Unknown) | Err(_) => continue,
        }
    }

    if p_cores.is_empty() && e_cores.is_empty() {
        return Err(TopologyError::SysfsNotFound);
    }
    if p_cores.is_empty() || e_cores.is_empty() {
        return Err(TopologyError::NotHybridCpu);
    }

    p_cores.sort_unstable();
    e_cores.sort_unstable();

    debug!(
        p_cores = p_cores.len(),
        e_cores = e_cores.len(),
        "topology discovered via per-CPU core_type files",
    );

    Ok(TopologyMap::new(p_cores, e_cores))
}

/// Extract `<N>` from a directory named `cpu<N>`; `None` for anything else
/// (e.g. `cpufreq`, `cpuidle`).
fn cpu_id_from_dir_name(path: &Path) -> Option<CpuId> {
    let name = path.file_name()?.to_str()?;
    let digits = name.strip_prefix("cpu")?;
    digits.parse::<CpuId>().ok()
}

fn read_sysfs_file(path: &Path) -> Result<String, TopologyError> {
    fs::read_to_string(path).map_err(map_io_error)
}

fn map_io_error(err: io::Error) -> TopologyError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => TopologyError::PermissionDenied,
        _ => TopologyError::SysfsNotFound,
    }
}
