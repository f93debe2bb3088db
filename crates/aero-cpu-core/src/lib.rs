//! The architectural x86-64 CPU state record: a fixed set of registers that
//! is loaded once at snapshot initialization and re-applied, unmodified by
//! prior runs, on every restore.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod json;
mod register;

pub use json::RegsJson;
pub use register::Register;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Cr0: u64 {
        const PE = 1 << 0;
        const MP = 1 << 1;
        const EM = 1 << 2;
        const TS = 1 << 3;
        const ET = 1 << 4;
        const NE = 1 << 5;
        const WP = 1 << 16;
        const AM = 1 << 18;
        const NW = 1 << 29;
        const CD = 1 << 30;
        const PG = 1 << 31;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Cr4: u64 {
        const VME = 1 << 0;
        const PVI = 1 << 1;
        const TSD = 1 << 2;
        const DE = 1 << 3;
        const PSE = 1 << 4;
        const PAE = 1 << 5;
        const PGE = 1 << 7;
        const OSFXSR = 1 << 9;
        const OSXMMEXCPT = 1 << 10;
        const SMEP = 1 << 20;
        const SMAP = 1 << 21;
        const PKE = 1 << 22;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Efer: u64 {
        const SCE = 1 << 0;
        const LME = 1 << 8;
        const LMA = 1 << 10;
        const NXE = 1 << 11;
    }
}

/// A data/code segment descriptor cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub attr: u16,
    pub present: bool,
}

/// GDTR/IDTR: no selector, no attributes, just base and limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GlobalSegment {
    pub base: u64,
    pub limit: u16,
}

/// A single 512-bit (ZMM) vector register, as eight 64-bit lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Zmm(pub [u64; 8]);

/// Default `MxcsrMask` used when a snapshot's `regs.json` omits it or sets it
/// to zero (§3 invariant).
pub const DEFAULT_MXCSR_MASK: u32 = 0xffbf;

/// Two-bit-per-register FPU tag-word value meaning "entirely empty stack".
pub const FPTW_EMPTY_STACK: u16 = 0xffff;

/// x86-64 usermode/kernelmode split used by the CR8 invariant: addresses at
/// or above this value are considered kernel-mode canonical addresses.
pub const KERNEL_RIP_THRESHOLD: u64 = 0x7fff_ffff_0000;

#[derive(Debug, Error)]
pub enum CpuStateError {
    #[error("regs.json is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` has an invalid integer literal `{value}`")]
    InvalidInteger { field: &'static str, value: String },
    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The full architectural x86-64 state record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuState {
    pub seed: u64,

    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,

    pub es: Segment,
    pub cs: Segment,
    pub ss: Segment,
    pub ds: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ldtr: Segment,
    pub tr: Segment,
    pub gdtr: GlobalSegment,
    pub idtr: GlobalSegment,

    pub cr0: Cr0,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: Cr4,
    pub cr8: u64,
    pub xcr0: u32,

    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u32,
    pub dr7: u32,

    pub zmm: [Zmm; 32],

    pub fpcw: u16,
    pub fpsw: u16,
    pub fptw: u16,
    pub fpop: u16,
    pub fpst: [u64; 8],

    pub mxcsr: u32,
    pub mxcsr_mask: u32,

    pub tsc: u64,
    pub efer: Efer,
    pub kernel_gs_base: u64,
    pub apic_base: u64,
    pub pat: u64,
    pub sysenter_cs: u64,
    pub sysenter_eip: u64,
    pub sysenter_esp: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub sfmask: u64,
    pub tsc_aux: u64,
}

impl Default for CpuState {
    fn default() -> Self {
        // Matches the source's `memset(this, 0, sizeof(*this))` default
        // construction: every field starts zeroed/false.
        CpuState {
            seed: 0,
            rax: 0,
            rcx: 0,
            rdx: 0,
            rbx: 0,
            rsp: 0,
            rbp: 0,
            rsi: 0,
            rdi: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            rflags: 0,
            es: Segment::default(),
            cs: Segment::default(),
            ss: Segment::default(),
            ds: Segment::default(),
            fs: Segment::default(),
            gs: Segment::default(),
            ldtr: Segment::default(),
            tr: Segment::default(),
            gdtr: GlobalSegment::default(),
            idtr: GlobalSegment::default(),
            cr0: Cr0::empty(),
            cr2: 0,
            cr3: 0,
            cr4: Cr4::empty(),
            cr8: 0,
            xcr0: 0,
            dr0: 0,
            dr1: 0,
            dr2: 0,
            dr3: 0,
            dr6: 0,
            dr7: 0,
            zmm: [Zmm::default(); 32],
            fpcw: 0,
            fpsw: 0,
            fptw: 0,
            fpop: 0,
            fpst: [0; 8],
            mxcsr: 0,
            mxcsr_mask: 0,
            tsc: 0,
            efer: Efer::empty(),
            kernel_gs_base: 0,
            apic_base: 0,
            pat: 0,
            sysenter_cs: 0,
            sysenter_eip: 0,
            sysenter_esp: 0,
            star: 0,
            lstar: 0,
            cstar: 0,
            sfmask: 0,
            tsc_aux: 0,
        }
    }
}

impl CpuState {
    /// Parse a `regs.json` document into a `CpuState`, applying the load-time
    /// invariants from §3 (empty-stack FPU convention, `MxcsrMask` default,
    /// CR8/DR zeroing).
    pub fn from_json_str(data: &str) -> Result<Self, CpuStateError> {
        let raw: RegsJson = serde_json::from_str(data)?;
        let (mut state, fpu_stack_all_infinity) = raw.into_cpu_state()?;
        state.sanitize(fpu_stack_all_infinity);
        Ok(state)
    }

    /// Apply the §3 load-time invariants in place. Idempotent: calling this
    /// twice in a row with the same `fpu_stack_all_infinity` is a no-op the
    /// second time.
    ///
    /// `fpu_stack_all_infinity` is whether every `fpst` slot encodes the
    /// `"Infinity"`/`"-Infinity"` sentinel — distinct from the slots simply
    /// holding the value zero, which is a legitimate occupied FPU stack
    /// (e.g. a stack slot holding +0.0) and must not be rewritten.
    pub fn sanitize(&mut self, fpu_stack_all_infinity: bool) {
        if self.mxcsr_mask == 0 {
            self.mxcsr_mask = DEFAULT_MXCSR_MASK;
        }

        if self.fptw == 0 && fpu_stack_all_infinity {
            self.fptw = FPTW_EMPTY_STACK;
            self.fpst = [0u64; 8];
        }

        if self.rip < KERNEL_RIP_THRESHOLD {
            self.cr8 = 0;
        }

        self.dr0 = 0;
        self.dr1 = 0;
        self.dr2 = 0;
        self.dr3 = 0;
        self.dr6 = 0;
        self.dr7 = 0;
    }

    pub fn get_reg(&self, reg: Register) -> u64 {
        register::get(self, reg)
    }

    pub fn set_reg(&mut self, reg: Register, value: u64) {
        register::set(self, reg, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_defaults_mxcsr_mask() {
        let mut state = CpuState::default();
        state.mxcsr_mask = 0;
        state.sanitize(false);
        assert_eq!(state.mxcsr_mask, DEFAULT_MXCSR_MASK);
    }

    #[test]
    fn sanitize_forces_empty_fpu_stack_when_flag_set_and_fptw_zero() {
        let mut state = CpuState::default();
        state.fptw = 0;
        state.fpst = [0xdead_beef; 8];
        state.sanitize(true);
        assert_eq!(state.fptw, FPTW_EMPTY_STACK);
        assert_eq!(state.fpst, [0u64; 8]);
    }

    #[test]
    fn sanitize_leaves_zero_valued_fpu_stack_alone_when_flag_is_false() {
        // A regression guard for the invariant in §3: a genuinely occupied
        // stack slot holding +0.0 parses to the integer 0 too, so the
        // all-zero *value* pattern must never stand in for "encodes ±∞".
        let mut state = CpuState::default();
        state.fptw = 0;
        state.fpst = [0; 8];
        state.sanitize(false);
        assert_eq!(state.fptw, 0);
        assert_eq!(state.fpst, [0u64; 8]);
    }

    #[test]
    fn sanitize_does_not_force_empty_stack_when_fptw_already_nonzero() {
        let mut state = CpuState::default();
        state.fptw = 0x1;
        state.fpst = [0; 8];
        state.sanitize(true);
        assert_eq!(state.fptw, 0x1);
    }

    #[test]
    fn sanitize_zeroes_cr8_in_usermode() {
        let mut state = CpuState::default();
        state.rip = 0x0000_7fff_0000_1234;
        state.cr8 = 3;
        state.sanitize(false);
        assert_eq!(state.cr8, 0);
    }

    #[test]
    fn sanitize_preserves_cr8_in_kernelmode() {
        let mut state = CpuState::default();
        state.rip = 0xffff_f800_0000_0000;
        state.cr8 = 3;
        state.sanitize(false);
        assert_eq!(state.cr8, 3);
    }

    #[test]
    fn sanitize_always_zeroes_debug_registers() {
        let mut state = CpuState::default();
        state.dr0 = 0x1000;
        state.dr7 = 0x1;
        state.sanitize(false);
        assert_eq!(state.dr0, 0);
        assert_eq!(state.dr7, 0);
    }

    #[test]
    fn sanitize_is_idempotent() {
        let mut state = CpuState::default();
        state.rip = 0x1000;
        state.cr8 = 7;
        state.sanitize(false);
        let once = state.clone();
        state.sanitize(false);
        assert_eq!(once, state);
    }
}
