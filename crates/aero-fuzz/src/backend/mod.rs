//! The polymorphic backend capability (§4.3): a uniform interface over the
//! emulator and the two hardware-virtualization backends.

pub mod emulator;

#[cfg(target_os = "linux")]
pub mod kvm;

#[cfg(target_os = "windows")]
pub mod whv;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use aero_cpu_core::{CpuState, Register};
use aero_mmu::Access as MemoryValidate;
use aero_types::{Gpa, Gva};

use crate::breakpoints::{CoverageId, Handler};
use crate::error::BackendError;
use aero_snapshot::TestcaseResult;

/// Which well-known comparison techniques are active, and at what
/// privilege-level scope (§6 `--laf`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LafMode {
    #[default]
    Disabled,
    User,
    Kernel,
    KernelUser,
}

/// Trace-file kind (§6, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceType {
    Rip,
    UniqueRip,
    Tenet,
}

/// Options passed to `Backend::initialize`, covering the §6 `fuzz`/`run`
/// execution-budget and instrumentation flags a backend needs before its
/// first run.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub limit: u64,
    pub edges: bool,
    pub compcov: bool,
    pub laf: LafMode,
    pub laf_allowed_ranges: Vec<(Gva, Gva)>,
    pub trace_path: Option<PathBuf>,
    pub trace_type: Option<TraceType>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            limit: 0,
            edges: false,
            compcov: false,
            laf: LafMode::Disabled,
            laf_allowed_ranges: Vec::new(),
            trace_path: None,
            trace_type: None,
        }
    }
}

/// A backend runs test-cases in a ~deterministic environment — in an
/// emulator or a hardware-accelerated VM — behind one shared contract
/// (§4.3.3 behavioral equivalence).
pub trait Backend {
    fn initialize(&mut self, opts: &BackendOptions, cpu_state: &CpuState) -> Result<(), BackendError>;

    fn run(&mut self, buffer: &[u8]) -> Result<TestcaseResult, BackendError>;

    fn restore(&mut self, cpu_state: &CpuState) -> Result<(), BackendError>;

    fn stop(&mut self, result: TestcaseResult);

    fn set_limit(&mut self, limit: u64);

    fn get_reg(&self, reg: Register) -> u64;
    fn set_reg(&mut self, reg: Register, value: u64);

    fn rdrand(&mut self) -> u64;

    fn set_breakpoint(&mut self, gva: Gva, handler: Handler) -> Result<(), BackendError>;

    /// Arm a one-shot coverage breakpoint at `gva` (§4.4: installed for
    /// every resolved `*.cov` site during setup). Translates `gva` against
    /// the backend's current CR3 and writes the `0xCC` the same way
    /// `set_breakpoint` does for user breakpoints, but through the
    /// coverage table instead of the user-handler one.
    fn install_coverage_breakpoint(&mut self, gva: Gva) -> Result<(), BackendError>;

    fn virt_translate(&self, gva: Gva, validate: MemoryValidate) -> Result<Gpa, BackendError>;

    /// Identity in this implementation: a `Gpa` already identifies a
    /// location in the backend's host buffer; there is no raw host pointer
    /// crossing the API boundary (§9 "avoid process-wide mutable
    /// singletons" extends naturally to avoiding raw-pointer capabilities).
    fn phys_translate(&self, gpa: Gpa) -> Gpa {
        gpa
    }

    fn virt_read(&self, gva: Gva, buffer: &mut [u8]) -> Result<(), BackendError>;
    fn virt_write(&mut self, gva: Gva, data: &[u8], dirty: bool) -> Result<(), BackendError>;

    fn phys_read(&self, gpa: Gpa, buffer: &mut [u8]);
    fn phys_write(&mut self, gpa: Gpa, data: &[u8], dirty: bool);

    /// Inject a `#PF` for the first non-present page in `[gva, gva+len)`, if
    /// any. Returns `true` if a fault was injected (the caller should stop
    /// stepping and let the guest service it).
    fn page_fault_if_needed(&mut self, gva: Gva, len: u64) -> Result<bool, BackendError>;

    fn last_new_coverage(&self) -> HashSet<CoverageId>;
    fn revoke_last_new_coverage(&mut self);

    fn set_trace_file(&mut self, path: &Path, kind: TraceType) -> Result<(), BackendError>;
}

/// Read a null-terminated, narrow guest string up to `max_length` bytes,
/// built on `Backend::virt_read` the way the source's `VirtReadBasicString`
/// template does for both narrow and wide strings (§4.8 callers use the
/// narrow form almost exclusively; the wide form differs only by reading
/// 2-byte units, left to callers since `Backend` has no generic method).
pub fn virt_read_cstr(backend: &dyn Backend, gva: Gva, max_length: u64) -> Result<Vec<u8>, BackendError> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    let mut cur = gva;
    for _ in 0..max_length {
        backend.virt_read(cur, &mut byte)?;
        if byte[0] == 0 {
            break;
        }
        out.push(byte[0]);
        cur = cur + 1u64;
    }
    Ok(out)
}
