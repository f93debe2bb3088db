//! Emulator backend (§4.3.1): drives a full-system x86-64 emulator, owning
//! RAM, breakpoints and coverage state, and treating the actual instruction
//! decoder/executor as a pluggable [`GuestCpu`].
//!
//! This crate does not embed a tiered x86-64 execution engine — that is an
//! external collaborator, analogous to the source's bochscpu dependency. The
//! [`ScriptedCpu`] shipped here is a minimal deterministic double sufficient
//! to exercise `EmulatorBackend`'s own hook, dirty-tracking and coverage
//! logic; production use supplies a higher-fidelity `GuestCpu`.

use std::collections::HashSet;
use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use aero_cpu_core::{CpuState, Register};
use aero_mmu::{Access, MemoryBus as MmuBus};
use aero_snapshot::{Ram, TestcaseResult};
use aero_types::{Gpa, Gva, PAGE_SIZE};

use crate::backend::{Backend, BackendOptions, TraceType};
use crate::breakpoints::{BreakpointContext, Breakpoints, CoverageId, Handler, Hit};
use crate::coverage::edge_id;
use crate::crash::{crash_name, CrashCause};
use crate::error::BackendError;
use crate::rdrand::DeterministicRng;

/// `RFLAGS.TF`, the trap flag used to single-step across a stepped-over
/// breakpoint (§4.5 step 3).
const RFLAGS_TF: u64 = 0x100;

/// What retiring one instruction did, as far as the backend's run loop is
/// concerned.
#[derive(Debug, Clone, Copy)]
pub enum StepEvent {
    /// The instruction at `rip_before` retired normally, updating `Rip` to
    /// `rip_after`. `branch_taken` distinguishes a control-flow transfer
    /// (for edge coverage) from straight-line execution.
    Retired { rip_before: u64, rip_after: u64, branch_taken: bool },
    Hlt,
    /// The guest wrote a new value to CR3.
    Cr3Write(u64),
    /// A hardware exception was raised; `information0` mirrors
    /// `EXCEPTION_RECORD.ExceptionInformation[0]` for `#PF`.
    Exception { vector: u8, information0: Option<u64> },
}

/// A pluggable x86-64 execution engine. `step` executes exactly one
/// instruction's architectural effects against `mem` and the engine's own
/// register file, returning what happened.
pub trait GuestCpu {
    fn get_reg(&self, reg: Register) -> u64;
    fn set_reg(&mut self, reg: Register, value: u64);
    fn load(&mut self, state: &CpuState);
    fn step(&mut self, mem: &mut dyn GuestMemory) -> StepEvent;
}

/// Memory access a `GuestCpu` performs while stepping, kept separate from
/// `Backend::virt_read`/`phys_read` so an execution engine never needs a
/// `Backend` handle (§9 "avoid process-wide mutable singletons").
pub trait GuestMemory {
    fn read(&self, gpa: Gpa, buf: &mut [u8]);
    fn write(&mut self, gpa: Gpa, data: &[u8]);
}

struct RamMemory<'a>(&'a mut Ram);

impl GuestMemory for RamMemory<'_> {
    fn read(&self, gpa: Gpa, buf: &mut [u8]) {
        self.0.read_bytes(gpa, buf);
    }
    fn write(&mut self, gpa: Gpa, data: &[u8]) {
        self.0.write_bytes(gpa, data);
    }
}

/// Read-only page-table-walker view over `Ram`; write methods are never
/// called by `virt_translate` and panic if they ever are, matching the
/// walker's own `FakeBus` test double.
struct PageWalkerView<'a>(&'a Ram);

impl MmuBus for PageWalkerView<'_> {
    fn read_u8(&self, addr: u64) -> u8 {
        self.0.read_u8(Gpa::new(addr))
    }
    fn read_u16(&self, addr: u64) -> u16 {
        let mut buf = [0u8; 2];
        self.0.read_bytes(Gpa::new(addr), &mut buf);
        u16::from_le_bytes(buf)
    }
    fn read_u32(&self, addr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.0.read_bytes(Gpa::new(addr), &mut buf);
        u32::from_le_bytes(buf)
    }
    fn read_u64(&self, addr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.0.read_bytes(Gpa::new(addr), &mut buf);
        u64::from_le_bytes(buf)
    }
    fn write_u8(&self, _addr: u64, _v: u8) {
        unimplemented!("page-table walks never write")
    }
    fn write_u16(&self, _addr: u64, _v: u16) {
        unimplemented!("page-table walks never write")
    }
    fn write_u32(&self, _addr: u64, _v: u32) {
        unimplemented!("page-table walks never write")
    }
    fn write_u64(&self, _addr: u64, _v: u64) {
        unimplemented!("page-table walks never write")
    }
}

struct EmulatorContext<'a> {
    cpu: &'a mut dyn GuestCpuErased,
    stop_requested: Option<TestcaseResult>,
}

/// Object-safe subset of `GuestCpu` used behind the breakpoint context.
trait GuestCpuErased {
    fn get_reg(&self, reg: Register) -> u64;
    fn set_reg(&mut self, reg: Register, value: u64);
}

impl<T: GuestCpu> GuestCpuErased for T {
    fn get_reg(&self, reg: Register) -> u64 {
        GuestCpu::get_reg(self, reg)
    }
    fn set_reg(&mut self, reg: Register, value: u64) {
        GuestCpu::set_reg(self, reg, value)
    }
}

impl BreakpointContext for EmulatorContext<'_> {
    fn get_reg(&self, reg: Register) -> u64 {
        self.cpu.get_reg(reg)
    }
    fn set_reg(&mut self, reg: Register, value: u64) {
        self.cpu.set_reg(reg, value);
    }
    fn stop(&mut self, result: TestcaseResult) {
        self.stop_requested = Some(result);
    }
    fn stop_requested(&self) -> bool {
        self.stop_requested.is_some()
    }
}

/// Registers a Tenet trace records per step, in the order they appear on a
/// line. Segment/ZMM/MSR state is outside what `GuestCpu::get_reg` exposes
/// (§ `Register` covers GPRs and control/debug registers only); a richer
/// engine that also implements a segment/ZMM accessor can extend this list.
const TENET_REGISTERS: &[Register] = &[
    Register::Rax, Register::Rcx, Register::Rdx, Register::Rbx,
    Register::Rsp, Register::Rbp, Register::Rsi, Register::Rdi,
    Register::R8, Register::R9, Register::R10, Register::R11,
    Register::R12, Register::R13, Register::R14, Register::R15,
    Register::Rip, Register::Rflags,
];

fn tenet_name(reg: Register) -> &'static str {
    match reg {
        Register::Rax => "rax", Register::Rcx => "rcx", Register::Rdx => "rdx",
        Register::Rbx => "rbx", Register::Rsp => "rsp", Register::Rbp => "rbp",
        Register::Rsi => "rsi", Register::Rdi => "rdi",
        Register::R8 => "r8", Register::R9 => "r9", Register::R10 => "r10",
        Register::R11 => "r11", Register::R12 => "r12", Register::R13 => "r13",
        Register::R14 => "r14", Register::R15 => "r15",
        Register::Rip => "rip", Register::Rflags => "rflags",
        Register::Cr0 => "cr0", Register::Cr2 => "cr2", Register::Cr3 => "cr3",
        Register::Cr4 => "cr4", Register::Cr8 => "cr8",
        Register::Dr0 => "dr0", Register::Dr1 => "dr1", Register::Dr2 => "dr2",
        Register::Dr3 => "dr3", Register::Dr6 => "dr6", Register::Dr7 => "dr7",
    }
}

enum TraceSink {
    Rip(File),
    UniqueRip { file: File, seen: HashSet<u64> },
    Tenet { file: File, prev: Option<[u64; TENET_REGISTERS.len()]> },
}

pub struct EmulatorBackend<C: GuestCpu> {
    cpu: C,
    ram: Ram,
    breakpoints: Breakpoints,
    opts: BackendOptions,
    rng: DeterministicRng,
    cr3_initial: u64,
    executed: u64,
    pending_result: Option<TestcaseResult>,
    trace: Option<TraceSink>,
}

impl<C: GuestCpu> EmulatorBackend<C> {
    pub fn new(cpu: C, ram: Ram) -> Self {
        Self {
            cpu,
            ram,
            breakpoints: Breakpoints::new(),
            opts: BackendOptions::default(),
            rng: DeterministicRng::new(0),
            cr3_initial: 0,
            executed: 0,
            pending_result: None,
            trace: None,
        }
    }

    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    /// §4.5 steps 1-3: invoke the handler, and if it neither moved `Rip`
    /// nor requested a stop, remove the `0xCC` and arm `RFLAGS.TF` so the
    /// next `cpu.step` retires the original instruction instead of the
    /// breakpoint byte.
    fn dispatch_if_breakpoint(&mut self, rip: u64) {
        let gva = Gva::new(rip);
        if !self.breakpoints.has_breakpoint(gva) {
            return;
        }
        let mut ctx = EmulatorContext { cpu: &mut self.cpu, stop_requested: None };
        let hit = self.breakpoints.on_hit(gva, &mut ctx);
        if let Some(result) = ctx.stop_requested {
            self.pending_result = Some(result);
        }
        if let Hit::User { step_rip: Some(_) } = hit {
            if let Some(gpa) = self.breakpoints.step_over_gpa() {
                self.ram.remove_breakpoint(gpa);
            }
            let flags = self.cpu.get_reg(Register::Rflags);
            self.cpu.set_reg(Register::Rflags, flags | RFLAGS_TF);
        }
    }

    /// §4.5 step 4: the step that just retired was the stepped-over
    /// instruction; re-arm the `0xCC` and clear the trap flag.
    fn finish_step_over_if_needed(&mut self) {
        if !self.breakpoints.is_stepping_over() {
            return;
        }
        if let Some((_, gpa)) = self.breakpoints.finish_step_over() {
            self.ram.add_breakpoint(gpa);
        }
        let flags = self.cpu.get_reg(Register::Rflags);
        self.cpu.set_reg(Register::Rflags, flags & !RFLAGS_TF);
    }

    fn trace_step(&mut self, event: &StepEvent) {
        let StepEvent::Retired { rip_before, .. } = *event else { return };
        match &mut self.trace {
            Some(TraceSink::Rip(file)) => {
                let _ = writeln!(file, "{rip_before:#x}");
            }
            Some(TraceSink::UniqueRip { file, seen }) => {
                if seen.insert(rip_before) {
                    let _ = writeln!(file, "{rip_before:#x}");
                }
            }
            Some(TraceSink::Tenet { file, prev }) => {
                let mut current = [0u64; TENET_REGISTERS.len()];
                for (slot, reg) in current.iter_mut().zip(TENET_REGISTERS) {
                    *slot = self.cpu.get_reg(*reg);
                }

                let mut line = String::new();
                for (i, reg) in TENET_REGISTERS.iter().enumerate() {
                    let changed = prev.map(|p| p[i] != current[i]).unwrap_or(true);
                    if !changed {
                        continue;
                    }
                    if !line.is_empty() {
                        line.push(',');
                    }
                    line.push_str(&format!("{}={:#x}", tenet_name(*reg), current[i]));
                }
                let _ = writeln!(file, "{line}");
                *prev = Some(current);
            }
            None => {}
        }
    }
}

impl<C: GuestCpu> Backend for EmulatorBackend<C> {
    fn initialize(&mut self, opts: &BackendOptions, cpu_state: &CpuState) -> Result<(), BackendError> {
        self.opts = opts.clone();
        self.cpu.load(cpu_state);
        self.cr3_initial = cpu_state.cr3;
        self.rng = DeterministicRng::new(cpu_state.seed);
        if let (Some(path), Some(kind)) = (&opts.trace_path, opts.trace_type) {
            self.set_trace_file(path, kind)?;
        }
        Ok(())
    }

    fn run(&mut self, buffer: &[u8]) -> Result<TestcaseResult, BackendError> {
        let _ = buffer;
        self.pending_result = None;
        self.executed = 0;

        loop {
            if let Some(result) = self.pending_result.take() {
                return Ok(result);
            }
            if self.opts.limit != 0 && self.executed >= self.opts.limit {
                let to_rearm = self.breakpoints.revoke_last_new_coverage();
                for gva in to_rearm {
                    if let Ok(gpa) = self.virt_translate(gva, Access::EXECUTE) {
                        self.ram.add_breakpoint(gpa);
                    }
                }
                return Ok(TestcaseResult::Timedout);
            }

            let rip = self.cpu.get_reg(Register::Rip);
            self.dispatch_if_breakpoint(rip);
            if self.pending_result.is_some() {
                continue;
            }

            let mut mem = RamMemory(&mut self.ram);
            let event = self.cpu.step(&mut mem);
            self.executed += 1;
            self.trace_step(&event);
            self.finish_step_over_if_needed();

            match event {
                StepEvent::Retired { rip_before, rip_after, branch_taken } => {
                    if self.opts.edges && branch_taken {
                        self.breakpoints.record_synthetic(edge_id(rip_before, rip_after));
                    }
                }
                StepEvent::Hlt => {
                    return Ok(TestcaseResult::Crash { name: crash_name(CrashCause::IllegalInstruction, buffer) });
                }
                StepEvent::Cr3Write(new_cr3) => {
                    if new_cr3 != self.cr3_initial {
                        return Ok(TestcaseResult::Cr3Change);
                    }
                }
                StepEvent::Exception { vector, information0 } => {
                    let cause = CrashCause::from_vector(vector, information0);
                    return Ok(TestcaseResult::Crash { name: crash_name(cause, buffer) });
                }
            }
        }
    }

    fn restore(&mut self, cpu_state: &CpuState) -> Result<(), BackendError> {
        self.cpu.load(cpu_state);
        self.rng = DeterministicRng::new(cpu_state.seed);
        self.ram.restore_dirty();
        self.breakpoints.take_last_new_coverage();
        self.trace = None;
        self.pending_result = None;
        Ok(())
    }

    fn stop(&mut self, result: TestcaseResult) {
        self.pending_result = Some(result);
    }

    fn set_limit(&mut self, limit: u64) {
        self.opts.limit = limit;
    }

    fn get_reg(&self, reg: Register) -> u64 {
        self.cpu.get_reg(reg)
    }

    fn set_reg(&mut self, reg: Register, value: u64) {
        self.cpu.set_reg(reg, value);
    }

    fn rdrand(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn set_breakpoint(&mut self, gva: Gva, handler: Handler) -> Result<(), BackendError> {
        let gpa = self.virt_translate(gva, Access::EXECUTE)?;
        self.breakpoints.add_user_breakpoint(gva, gpa, handler)?;
        self.ram.add_breakpoint(gpa);
        Ok(())
    }

    fn install_coverage_breakpoint(&mut self, gva: Gva) -> Result<(), BackendError> {
        let gpa = self.virt_translate(gva, Access::EXECUTE)?;
        self.breakpoints.add_coverage_breakpoint(gva, gpa)?;
        self.ram.add_breakpoint(gpa);
        Ok(())
    }

    fn virt_translate(&self, gva: Gva, validate: Access) -> Result<Gpa, BackendError> {
        let cr3 = self.cpu.get_reg(Register::Cr3);
        let view = PageWalkerView(&self.ram);
        Ok(aero_mmu::virt_translate(&view, gva, cr3, validate)?)
    }

    fn virt_read(&self, gva: Gva, buffer: &mut [u8]) -> Result<(), BackendError> {
        let mut remaining = buffer.len();
        let mut cur = gva;
        let mut offset = 0usize;
        while remaining > 0 {
            let gpa = self.virt_translate(cur, Access::READ)?;
            let page_off = cur.offset() as usize;
            let chunk = remaining.min(PAGE_SIZE as usize - page_off);
            self.ram.read_bytes(gpa, &mut buffer[offset..offset + chunk]);
            offset += chunk;
            remaining -= chunk;
            cur = cur + chunk as u64;
        }
        Ok(())
    }

    fn virt_write(&mut self, gva: Gva, data: &[u8], dirty: bool) -> Result<(), BackendError> {
        let _ = dirty; // Ram::write_bytes always dirties; see aero_snapshot::Ram.
        let mut remaining = data.len();
        let mut cur = gva;
        let mut offset = 0usize;
        while remaining > 0 {
            let gpa = self.virt_translate(cur, Access::WRITE)?;
            let page_off = cur.offset() as usize;
            let chunk = remaining.min(PAGE_SIZE as usize - page_off);
            self.ram.write_bytes(gpa, &data[offset..offset + chunk]);
            offset += chunk;
            remaining -= chunk;
            cur = cur + chunk as u64;
        }
        Ok(())
    }

    fn phys_read(&self, gpa: Gpa, buffer: &mut [u8]) {
        self.ram.read_bytes(gpa, buffer);
    }

    fn phys_write(&mut self, gpa: Gpa, data: &[u8], dirty: bool) {
        let _ = dirty;
        self.ram.write_bytes(gpa, data);
    }

    fn page_fault_if_needed(&mut self, gva: Gva, len: u64) -> Result<bool, BackendError> {
        let mut cur = gva.align();
        let end = (gva + len).align();
        while cur.raw() <= end.raw() {
            if self.virt_translate(cur, Access::READ).is_err() {
                self.cpu.set_reg(Register::Cr2, cur.raw());
                return Ok(true);
            }
            cur = cur + PAGE_SIZE;
        }
        Ok(false)
    }

    fn last_new_coverage(&self) -> HashSet<CoverageId> {
        self.breakpoints.last_new_coverage().clone()
    }

    fn revoke_last_new_coverage(&mut self) {
        let to_rearm = self.breakpoints.revoke_last_new_coverage();
        for gva in to_rearm {
            if let Ok(gpa) = self.virt_translate(gva, Access::EXECUTE) {
                self.ram.add_breakpoint(gpa);
            }
        }
    }

    fn set_trace_file(&mut self, path: &Path, kind: TraceType) -> Result<(), BackendError> {
        let file = File::create(path).map_err(|e| BackendError::Unavailable(e.to_string()))?;
        self.trace = Some(match kind {
            TraceType::Rip => TraceSink::Rip(file),
            TraceType::UniqueRip => TraceSink::UniqueRip { file, seen: HashSet::new() },
            TraceType::Tenet => TraceSink::Tenet { file, prev: None },
        });
        Ok(())
    }
}

/// Minimal deterministic `GuestCpu`: a register file plus a closed set of
/// scripted instructions installed by the backend's own tests (`steps`),
/// keyed by the `rip` they fire at. Not a real decoder: production code
/// supplies an external, higher-fidelity engine (§4.3.1).
pub struct ScriptedCpu {
    regs: [u64; 32],
    script: std::collections::HashMap<u64, ScriptedStep>,
    default_advance: u64,
}

#[derive(Clone)]
pub enum ScriptedStep {
    Advance(u64),
    Jump(u64),
    WriteMem { gpa: Gpa, bytes: Vec<u8>, then_advance: u64 },
    WriteCr3 { value: u64, then_advance: u64 },
    Hlt,
    Exception { vector: u8, information0: Option<u64> },
}

fn reg_index(reg: Register) -> usize {
    use Register::*;
    match reg {
        Rax => 0, Rcx => 1, Rdx => 2, Rbx => 3, Rsp => 4, Rbp => 5, Rsi => 6, Rdi => 7,
        R8 => 8, R9 => 9, R10 => 10, R11 => 11, R12 => 12, R13 => 13, R14 => 14, R15 => 15,
        Rip => 16, Rflags => 17, Cr0 => 18, Cr2 => 19, Cr3 => 20, Cr4 => 21, Cr8 => 22,
        Dr0 => 23, Dr1 => 24, Dr2 => 25, Dr3 => 26, Dr6 => 27, Dr7 => 28,
    }
}

impl ScriptedCpu {
    pub fn new() -> Self {
        Self { regs: [0; 32], script: std::collections::HashMap::new(), default_advance: 1 }
    }

    pub fn at(mut self, rip: u64, step: ScriptedStep) -> Self {
        self.script.insert(rip, step);
        self
    }
}

impl Default for ScriptedCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestCpu for ScriptedCpu {
    fn get_reg(&self, reg: Register) -> u64 {
        self.regs[reg_index(reg)]
    }

    fn set_reg(&mut self, reg: Register, value: u64) {
        self.regs[reg_index(reg)] = value;
    }

    fn load(&mut self, state: &CpuState) {
        self.set_reg(Register::Rax, state.rax);
        self.set_reg(Register::Rcx, state.rcx);
        self.set_reg(Register::Rdx, state.rdx);
        self.set_reg(Register::Rbx, state.rbx);
        self.set_reg(Register::Rsp, state.rsp);
        self.set_reg(Register::Rbp, state.rbp);
        self.set_reg(Register::Rsi, state.rsi);
        self.set_reg(Register::Rdi, state.rdi);
        self.set_reg(Register::R8, state.r8);
        self.set_reg(Register::R9, state.r9);
        self.set_reg(Register::R10, state.r10);
        self.set_reg(Register::R11, state.r11);
        self.set_reg(Register::R12, state.r12);
        self.set_reg(Register::R13, state.r13);
        self.set_reg(Register::R14, state.r14);
        self.set_reg(Register::R15, state.r15);
        self.set_reg(Register::Rip, state.rip);
        self.set_reg(Register::Rflags, state.rflags);
        self.set_reg(Register::Cr0, state.cr0.bits() as u64);
        self.set_reg(Register::Cr2, state.cr2);
        self.set_reg(Register::Cr3, state.cr3);
        self.set_reg(Register::Cr4, state.cr4.bits() as u64);
        self.set_reg(Register::Cr8, state.cr8);
    }

    fn step(&mut self, mem: &mut dyn GuestMemory) -> StepEvent {
        let rip = self.get_reg(Register::Rip);
        let step = self.script.get(&rip).cloned();
        match step {
            Some(ScriptedStep::Advance(n)) => {
                self.set_reg(Register::Rip, rip + n);
                StepEvent::Retired { rip_before: rip, rip_after: rip + n, branch_taken: false }
            }
            Some(ScriptedStep::Jump(target)) => {
                self.set_reg(Register::Rip, target);
                StepEvent::Retired { rip_before: rip, rip_after: target, branch_taken: true }
            }
            Some(ScriptedStep::WriteMem { gpa, bytes, then_advance }) => {
                mem.write(gpa, &bytes);
                let next = rip + then_advance;
                self.set_reg(Register::Rip, next);
                StepEvent::Retired { rip_before: rip, rip_after: next, branch_taken: false }
            }
            Some(ScriptedStep::WriteCr3 { value, then_advance }) => {
                self.set_reg(Register::Cr3, value);
                self.set_reg(Register::Rip, rip + then_advance);
                StepEvent::Cr3Write(value)
            }
            Some(ScriptedStep::Hlt) => StepEvent::Hlt,
            Some(ScriptedStep::Exception { vector, information0 }) => {
                StepEvent::Exception { vector, information0 }
            }
            None => {
                let next = rip + self.default_advance;
                self.set_reg(Register::Rip, next);
                StepEvent::Retired { rip_before: rip, rip_after: next, branch_taken: false }
            }
        }
    }
}
