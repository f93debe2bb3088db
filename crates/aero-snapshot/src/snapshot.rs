//! Top-level `target/` directory: `state/{mem.dmp,regs.json,symbol-store.json,coverage/*.cov}`
//! plus the `inputs/`, `outputs/` and `crashes/` corpus directories (§3.1, §6).

use std::fs;
use std::path::{Path, PathBuf};

use aero_cpu_core::CpuState;

use crate::coverage::{self, CoverageSite};
use crate::dump;
use crate::ram::Ram;
use crate::symbols::SymbolStore;
use crate::SnapshotError;

/// Outcome of replaying a single testcase against a restored snapshot (§4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestcaseResult {
    Ok,
    Timedout,
    Cr3Change,
    Crash { name: String },
}

impl TestcaseResult {
    /// Wire discriminant (§6): `0 = Ok`, `1 = Timedout`, `2 = Cr3Change`, `3 = Crash`.
    pub fn discriminant(&self) -> u8 {
        match self {
            TestcaseResult::Ok => 0,
            TestcaseResult::Timedout => 1,
            TestcaseResult::Cr3Change => 2,
            TestcaseResult::Crash { .. } => 3,
        }
    }
}

fn require_file(dir: &Path, name: &'static str) -> Result<PathBuf, SnapshotError> {
    let path = dir.join(name);
    if !path.is_file() {
        return Err(SnapshotError::MissingFile { path: dir.to_path_buf(), name });
    }
    Ok(path)
}

/// A fully-loaded target directory: initial CPU/RAM state, symbol names, and
/// the coverage breakpoint sites to arm before fuzzing starts.
pub struct Snapshot {
    pub cpu: CpuState,
    pub ram: Ram,
    pub symbols: SymbolStore,
    pub coverage_sites: Vec<CoverageSite>,
    pub inputs_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub crashes_dir: PathBuf,
}

impl Snapshot {
    /// Load `state/mem.dmp` + `state/regs.json` (required), and
    /// `state/symbol-store.json` + `state/coverage/*.cov` (optional: an
    /// absent symbol store yields an empty one and skips coverage loading,
    /// matching the original tool's "works without a debugger" mode).
    pub fn load(target_dir: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let target_dir = target_dir.as_ref();
        let state_dir = target_dir.join("state");
        tracing::info!(target = %target_dir.display(), "loading snapshot");

        let mem_path = require_file(&state_dir, "mem.dmp")?;
        let regs_path = require_file(&state_dir, "regs.json")?;

        let dump = dump::parse_mem_dmp(fs::File::open(&mem_path)?)?;
        let ram = Ram::from_dump(dump);
        tracing::debug!(ram_size = ram.size(), "populated guest physical memory");

        let regs_json = fs::read_to_string(&regs_path)?;
        let cpu = CpuState::from_json_str(&regs_json)?;

        let symbol_store_path = state_dir.join("symbol-store.json");
        let symbols = if symbol_store_path.is_file() {
            SymbolStore::from_json_str(&fs::read_to_string(&symbol_store_path)?)?
        } else {
            tracing::debug!("no symbol-store.json present, continuing without symbols");
            SymbolStore::empty()
        };

        let coverage_dir = state_dir.join("coverage");
        let mut coverage_sites = Vec::new();
        if coverage_dir.is_dir() {
            let mut entries: Vec<_> = fs::read_dir(&coverage_dir)?.filter_map(Result::ok).collect();
            entries.sort_by_key(|e| e.path());
            for entry in entries {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("cov") {
                    continue;
                }
                let data = fs::read_to_string(&path)?;
                coverage_sites.extend(coverage::parse_cov_file(&data, &symbols)?);
            }
        }
        tracing::info!(coverage_sites = coverage_sites.len(), "snapshot coverage sites loaded");

        let inputs_dir = target_dir.join("inputs");
        let outputs_dir = target_dir.join("outputs");
        let crashes_dir = target_dir.join("crashes");
        fs::create_dir_all(&outputs_dir)?;
        fs::create_dir_all(&crashes_dir)?;

        Ok(Self {
            cpu,
            ram,
            symbols,
            coverage_sites,
            inputs_dir,
            outputs_dir,
            crashes_dir,
        })
    }

    /// Every file directly under `inputs/`, in directory order — the initial
    /// seed corpus.
    pub fn seed_corpus(&self) -> Result<Vec<PathBuf>, SnapshotError> {
        if !self.inputs_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<_> = fs::read_dir(&self.inputs_dir)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        Ok(paths)
    }
}
