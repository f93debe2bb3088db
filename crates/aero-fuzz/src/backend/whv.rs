//! Windows Hypervisor Platform backend (§4.3.2), built on the `windows`
//! crate's `Win32::System::Hypervisor` bindings: one partition, one virtual
//! processor, breakpoints via a software `0xCC` plus the exception-exit
//! bitmap (WHV has no `KVM_SET_GUEST_DEBUG` equivalent), and dirty tracking
//! via `WHvQueryGpaRangeDirtyBitmap` rather than a dirty-log ioctl.

use std::collections::HashSet;
use std::ffi::c_void;
use std::path::{Path, PathBuf};

use windows::Win32::System::Hypervisor::*;

use aero_cpu_core::{CpuState, Register};
use aero_mmu::{Access, MemoryBus as MmuBus};
use aero_pc_constants::is_apic_page;
use aero_snapshot::{Ram, TestcaseResult};
use aero_types::{Gpa, Gva, PAGE_SIZE};

use crate::backend::{Backend, BackendOptions, TraceType};
use crate::breakpoints::{BreakpointContext, Breakpoints, CoverageId, Handler, Hit};
use crate::crash::{crash_name, CrashCause};
use crate::error::BackendError;
use crate::rdrand::DeterministicRng;

/// `RFLAGS.TF`, the trap flag used to single-step across a stepped-over
/// breakpoint (§4.5 step 3).
const RFLAGS_TF: u64 = 0x100;

struct RamView<'a>(&'a Ram);

impl MmuBus for RamView<'_> {
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

fn reg_name(reg: Register) -> WHV_REGISTER_NAME {
    use Register::*;
    match reg {
        Rax => WHvX64RegisterRax, Rcx => WHvX64RegisterRcx, Rdx => WHvX64RegisterRdx,
        Rbx => WHvX64RegisterRbx, Rsp => WHvX64RegisterRsp, Rbp => WHvX64RegisterRbp,
        Rsi => WHvX64RegisterRsi, Rdi => WHvX64RegisterRdi,
        R8 => WHvX64RegisterR8, R9 => WHvX64RegisterR9, R10 => WHvX64RegisterR10,
        R11 => WHvX64RegisterR11, R12 => WHvX64RegisterR12, R13 => WHvX64RegisterR13,
        R14 => WHvX64RegisterR14, R15 => WHvX64RegisterR15,
        Rip => WHvX64RegisterRip, Rflags => WHvX64RegisterRflags,
        Cr0 => WHvX64RegisterCr0, Cr2 => WHvX64RegisterCr2, Cr3 => WHvX64RegisterCr3,
        Cr4 => WHvX64RegisterCr4, Cr8 => WHvX64RegisterCr8,
        Dr0 => WHvX64RegisterDr0, Dr1 => WHvX64RegisterDr1, Dr2 => WHvX64RegisterDr2,
        Dr3 => WHvX64RegisterDr3, Dr6 => WHvX64RegisterDr6, Dr7 => WHvX64RegisterDr7,
    }
}

struct WhvContext<'a> {
    partition: &'a WHV_PARTITION_HANDLE,
    vp_index: u32,
    stop_requested: Option<TestcaseResult>,
}

impl BreakpointContext for WhvContext<'_> {
    fn get_reg(&self, reg: Register) -> u64 {
        get_reg_raw(self.partition, self.vp_index, reg)
    }
    fn set_reg(&mut self, reg: Register, value: u64) {
        set_reg_raw(self.partition, self.vp_index, reg, value);
    }
    fn stop(&mut self, result: TestcaseResult) {
        self.stop_requested = Some(result);
    }
    fn stop_requested(&self) -> bool {
        self.stop_requested.is_some()
    }
}

fn get_reg_raw(partition: &WHV_PARTITION_HANDLE, vp_index: u32, reg: Register) -> u64 {
    let name = reg_name(reg);
    let mut value = WHV_REGISTER_VALUE::default();
    unsafe {
        WHvGetVirtualProcessorRegisters(*partition, vp_index, &name, 1, &mut value)
            .expect("WHvGetVirtualProcessorRegisters");
        value.Reg64
    }
}

fn set_reg_raw(partition: &WHV_PARTITION_HANDLE, vp_index: u32, reg: Register, val: u64) {
    let name = reg_name(reg);
    let value = WHV_REGISTER_VALUE { Reg64: val };
    unsafe {
        WHvSetVirtualProcessorRegisters(*partition, vp_index, &name, 1, &value)
            .expect("WHvSetVirtualProcessorRegisters");
    }
}

fn set_regs_batch(partition: &WHV_PARTITION_HANDLE, vp_index: u32, pairs: &[(Register, u64)]) {
    let names: Vec<WHV_REGISTER_NAME> = pairs.iter().map(|(r, _)| reg_name(*r)).collect();
    let values: Vec<WHV_REGISTER_VALUE> = pairs
        .iter()
        .map(|(_, v)| WHV_REGISTER_VALUE { Reg64: *v })
        .collect();
    unsafe {
        WHvSetVirtualProcessorRegisters(
            *partition,
            vp_index,
            names.as_ptr(),
            names.len() as u32,
            values.as_ptr(),
        )
        .expect("WHvSetVirtualProcessorRegisters");
    }
}

fn cpu_state_register_pairs(state: &CpuState) -> Vec<(Register, u64)> {
    use Register::*;
    vec![
        (Rax, state.rax), (Rcx, state.rcx), (Rdx, state.rdx), (Rbx, state.rbx),
        (Rsp, state.rsp), (Rbp, state.rbp), (Rsi, state.rsi), (Rdi, state.rdi),
        (R8, state.r8), (R9, state.r9), (R10, state.r10), (R11, state.r11),
        (R12, state.r12), (R13, state.r13), (R14, state.r14), (R15, state.r15),
        (Rip, state.rip), (Rflags, state.rflags),
        (Cr0, state.cr0.bits()), (Cr2, state.cr2), (Cr3, state.cr3),
        (Cr4, state.cr4.bits()), (Cr8, state.cr8),
        (Dr0, state.dr0), (Dr1, state.dr1), (Dr2, state.dr2), (Dr3, state.dr3),
        (Dr6, state.dr6 as u64), (Dr7, state.dr7 as u64),
    ]
}

/// Every exception vector this backend asks the partition to vm-exit on
/// (§4.3.2, mirroring the source's `ExceptionExitBitmap`): divide error,
/// debug trap/fault, breakpoint trap, invalid opcode, general protection,
/// and page fault cover every `CrashCause` this crate classifies.
fn exception_exit_bitmap() -> u64 {
    let bits = [
        WHvX64ExceptionTypeDivideErrorFault.0,
        WHvX64ExceptionTypeDebugTrapOrFault.0,
        WHvX64ExceptionTypeBreakpointTrap.0,
        WHvX64ExceptionTypeInvalidOpcodeFault.0,
        WHvX64ExceptionTypeGeneralProtectionFault.0,
        WHvX64ExceptionTypePageFault.0,
    ];
    bits.iter().fold(0u64, |acc, &bit| acc | (1u64 << bit))
}

/// A Windows Hypervisor Platform-backed [`Backend`] (§4.3.2). Owns one
/// partition, one virtual processor, and a boxed guest-memory buffer mapped
/// into the partition with `WHvMapGpaRange`.
pub struct WhvBackend {
    partition: WHV_PARTITION_HANDLE,
    vp_index: u32,
    guest_mem: Box<[u8]>,
    ram: Ram,
    breakpoints: Breakpoints,
    opts: BackendOptions,
    rng: DeterministicRng,
    cr3_initial: u64,
    pending_result: Option<TestcaseResult>,
    trace_path: Option<PathBuf>,
}

impl WhvBackend {
    pub fn new(ram: Ram) -> Result<Self, BackendError> {
        let mut partition = WHV_PARTITION_HANDLE::default();
        unsafe {
            WHvCreatePartition(&mut partition).map_err(|e| BackendError::Hypervisor(e.to_string()))?;
        }

        let processor_count = WHV_PARTITION_PROPERTY { ProcessorCount: 1 };
        unsafe {
            WHvSetPartitionProperty(
                partition,
                WHvPartitionPropertyCodeProcessorCount,
                &processor_count as *const _ as *const c_void,
                std::mem::size_of::<WHV_PARTITION_PROPERTY>() as u32,
            )
            .map_err(|e| BackendError::Hypervisor(e.to_string()))?;
        }

        let mut extended = WHV_PARTITION_PROPERTY::default();
        extended.ExtendedVmExits.AsUINT64 = 1;
        unsafe {
            WHvSetPartitionProperty(
                partition,
                WHvPartitionPropertyCodeExtendedVmExits,
                &extended as *const _ as *const c_void,
                std::mem::size_of::<WHV_PARTITION_PROPERTY>() as u32,
            )
            .map_err(|e| BackendError::Hypervisor(e.to_string()))?;
        }

        let bitmap = WHV_PARTITION_PROPERTY { ExceptionExitBitmap: exception_exit_bitmap() };
        unsafe {
            WHvSetPartitionProperty(
                partition,
                WHvPartitionPropertyCodeExceptionExitBitmap,
                &bitmap as *const _ as *const c_void,
                std::mem::size_of::<WHV_PARTITION_PROPERTY>() as u32,
            )
            .map_err(|e| BackendError::Hypervisor(e.to_string()))?;
        }

        unsafe {
            WHvSetupPartition(partition).map_err(|e| BackendError::Hypervisor(e.to_string()))?;
        }

        let vp_index = 0u32;
        unsafe {
            WHvCreateVirtualProcessor(partition, vp_index, 0)
                .map_err(|e| BackendError::Hypervisor(e.to_string()))?;
        }

        let size = ram.size().max(PAGE_SIZE);
        let mut guest_mem = vec![0u8; size as usize].into_boxed_slice();
        copy_ram_into(&ram, &mut guest_mem);

        let flags = WHvMapGpaRangeFlagRead
            | WHvMapGpaRangeFlagWrite
            | WHvMapGpaRangeFlagExecute
            | WHvMapGpaRangeFlagTrackDirtyPages;

        let apic_page = aero_pc_constants::APIC_DEFAULT_PHYS_BASE;
        unsafe {
            if apic_page < size {
                if apic_page > 0 {
                    WHvMapGpaRange(
                        partition,
                        guest_mem.as_ptr() as *const c_void,
                        0,
                        apic_page,
                        flags,
                    )
                    .map_err(|e| BackendError::Hypervisor(e.to_string()))?;
                }
                let after = apic_page + PAGE_SIZE;
                if after < size {
                    WHvMapGpaRange(
                        partition,
                        guest_mem.as_ptr().add(after as usize) as *const c_void,
                        after,
                        size - after,
                        flags,
                    )
                    .map_err(|e| BackendError::Hypervisor(e.to_string()))?;
                }
            } else {
                WHvMapGpaRange(partition, guest_mem.as_ptr() as *const c_void, 0, size, flags)
                    .map_err(|e| BackendError::Hypervisor(e.to_string()))?;
            }
        }

        Ok(Self {
            partition,
            vp_index,
            guest_mem,
            ram,
            breakpoints: Breakpoints::new(),
            opts: BackendOptions::default(),
            rng: DeterministicRng::new(0),
            cr3_initial: 0,
            pending_result: None,
            trace_path: None,
        })
    }

    fn sync_dirty_from_whv(&mut self) -> Result<(), BackendError> {
        let words = (self.guest_mem.len() as u64 / PAGE_SIZE / 64) + 1;
        let mut bitmap = vec![0u64; words as usize];
        unsafe {
            WHvQueryGpaRangeDirtyBitmap(
                self.partition,
                0,
                self.guest_mem.len() as u64,
                bitmap.as_mut_ptr(),
                (bitmap.len() * 8) as u32,
            )
            .map_err(|e| BackendError::Hypervisor(e.to_string()))?;
        }
        for (word_idx, word) in bitmap.iter().enumerate() {
            for bit in 0..64u32 {
                if word & (1u64 << bit) == 0 {
                    continue;
                }
                let gpa = (word_idx as u64 * 64 + bit as u64) * PAGE_SIZE;
                if gpa >= self.guest_mem.len() as u64 || is_apic_page(Gpa::new(gpa)) {
                    continue;
                }
                let start = gpa as usize;
                let end = (start + PAGE_SIZE as usize).min(self.guest_mem.len());
                self.ram.write_bytes(Gpa::new(gpa), &self.guest_mem[start..end]);
            }
        }
        Ok(())
    }

    fn sync_dirty_to_whv(&mut self) {
        let dirty: Vec<Gpa> = self.ram.dirty_pages().collect();
        self.ram.restore_dirty();
        for gpa in dirty {
            let mut page = [0u8; PAGE_SIZE as usize];
            self.ram.read_bytes(gpa, &mut page);
            let start = gpa.raw() as usize;
            let end = (start + PAGE_SIZE as usize).min(self.guest_mem.len());
            self.guest_mem[start..end].copy_from_slice(&page[..end - start]);
        }
    }

    fn sync_to_whv_immediate(&mut self, gpa: Gpa) {
        let aligned = gpa.align();
        let mut page = [0u8; PAGE_SIZE as usize];
        self.ram.read_bytes(aligned, &mut page);
        let start = aligned.raw() as usize;
        let end = (start + PAGE_SIZE as usize).min(self.guest_mem.len());
        self.guest_mem[start..end].copy_from_slice(&page[..end - start]);
    }
}

impl Drop for WhvBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = WHvDeleteVirtualProcessor(self.partition, self.vp_index);
            let _ = WHvDeletePartition(self.partition);
        }
    }
}

fn copy_ram_into(ram: &Ram, dst: &mut [u8]) {
    let mut off = 0u64;
    while off < dst.len() as u64 {
        let chunk = (dst.len() as u64 - off).min(PAGE_SIZE);
        let mut page = [0u8; PAGE_SIZE as usize];
        ram.read_bytes(Gpa::new(off), &mut page[..chunk as usize]);
        dst[off as usize..(off + chunk) as usize].copy_from_slice(&page[..chunk as usize]);
        off += chunk;
    }
}

impl Backend for WhvBackend {
    fn initialize(&mut self, opts: &BackendOptions, cpu_state: &CpuState) -> Result<(), BackendError> {
        self.opts = opts.clone();
        self.cr3_initial = cpu_state.cr3;
        self.rng = DeterministicRng::new(cpu_state.seed);
        set_regs_batch(&self.partition, self.vp_index, &cpu_state_register_pairs(cpu_state));
        if let (Some(path), Some(_kind)) = (&opts.trace_path, opts.trace_type) {
            self.trace_path = Some(path.clone());
        }
        Ok(())
    }

    fn run(&mut self, buffer: &[u8]) -> Result<TestcaseResult, BackendError> {
        self.pending_result = None;
        let deadline = (self.opts.limit != 0)
            .then(|| std::time::Instant::now() + std::time::Duration::from_millis(self.opts.limit));

        let result = loop {
            if let Some(result) = self.pending_result.take() {
                break result;
            }
            if let Some(deadline) = deadline {
                if std::time::Instant::now() >= deadline {
                    break TestcaseResult::Timedout;
                }
            }

            let mut exit_context = WHV_RUN_VP_EXIT_CONTEXT::default();
            unsafe {
                WHvRunVirtualProcessor(
                    self.partition,
                    self.vp_index,
                    &mut exit_context as *mut _ as *mut c_void,
                    std::mem::size_of::<WHV_RUN_VP_EXIT_CONTEXT>() as u32,
                )
                .map_err(|e| BackendError::Hypervisor(e.to_string()))?;
            }

            match exit_context.ExitReason {
                WHvRunVpExitReasonX64Halt => {
                    break TestcaseResult::Crash {
                        name: crash_name(CrashCause::IllegalInstruction, buffer),
                    };
                }
                WHvRunVpExitReasonException => {
                    let vector = unsafe { exit_context.Anonymous.VpException.ExceptionType.0 as u8 };
                    if vector == 1 && self.breakpoints.is_stepping_over() {
                        // §4.5 step 4: this #DB is the single-step trap
                        // completing the step-over; re-arm the `0xCC` and
                        // clear the trap flag rather than re-dispatching.
                        if let Some((_, gpa)) = self.breakpoints.finish_step_over() {
                            self.ram.add_breakpoint(gpa);
                            self.sync_to_whv_immediate(gpa);
                        }
                        let flags = get_reg_raw(&self.partition, self.vp_index, Register::Rflags);
                        set_reg_raw(&self.partition, self.vp_index, Register::Rflags, flags & !RFLAGS_TF);
                        continue;
                    }
                    let is_bp_or_db = vector == 1 || vector == 3;
                    if is_bp_or_db {
                        let rip = get_reg_raw(&self.partition, self.vp_index, Register::Rip);
                        let gva = Gva::new(if vector == 3 { rip.wrapping_sub(1) } else { rip });
                        if self.breakpoints.has_breakpoint(gva) {
                            if vector == 3 {
                                set_reg_raw(&self.partition, self.vp_index, Register::Rip, gva.raw());
                            }
                            let mut ctx = WhvContext {
                                partition: &self.partition,
                                vp_index: self.vp_index,
                                stop_requested: None,
                            };
                            let hit = self.breakpoints.on_hit(gva, &mut ctx);
                            if let Some(stop) = ctx.stop_requested {
                                break stop;
                            }
                            if let Hit::User { step_rip: Some(_) } = hit {
                                // §4.5 steps 1-3: remove the `0xCC` and
                                // single-step via the trap flag so the
                                // original instruction retires exactly once.
                                if let Some(gpa) = self.breakpoints.step_over_gpa() {
                                    self.ram.remove_breakpoint(gpa);
                                    self.sync_to_whv_immediate(gpa);
                                }
                                let flags = get_reg_raw(&self.partition, self.vp_index, Register::Rflags);
                                set_reg_raw(&self.partition, self.vp_index, Register::Rflags, flags | RFLAGS_TF);
                            }
                            let new_cr3 = get_reg_raw(&self.partition, self.vp_index, Register::Cr3);
                            if new_cr3 != self.cr3_initial {
                                break TestcaseResult::Cr3Change;
                            }
                            continue;
                        }
                    }
                    let info0 = unsafe {
                        if exit_context.Anonymous.VpException.ExceptionParameter != 0 {
                            Some(exit_context.Anonymous.VpException.ExceptionParameter)
                        } else {
                            None
                        }
                    };
                    let cause = CrashCause::from_vector(vector, info0);
                    break TestcaseResult::Crash { name: crash_name(cause, buffer) };
                }
                WHvRunVpExitReasonMemoryAccess | WHvRunVpExitReasonX64IoPortAccess
                | WHvRunVpExitReasonX64MsrAccess | WHvRunVpExitReasonX64ApicEoi
                | WHvRunVpExitReasonX64InterruptWindow => {
                    // Platform I/O outside RAM: not modeled, run continues
                    // (mirrors the emulator/KVM backends' treatment of
                    // unmapped MMIO as a no-op VM-exit).
                }
                other => {
                    return Err(BackendError::UnknownExit { reason: format!("{:?}", other.0) });
                }
            }
        };

        self.sync_dirty_from_whv()?;
        Ok(result)
    }

    fn restore(&mut self, cpu_state: &CpuState) -> Result<(), BackendError> {
        set_regs_batch(&self.partition, self.vp_index, &cpu_state_register_pairs(cpu_state));
        self.rng = DeterministicRng::new(cpu_state.seed);
        self.sync_dirty_to_whv();
        self.breakpoints.take_last_new_coverage();
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
        get_reg_raw(&self.partition, self.vp_index, reg)
    }

    fn set_reg(&mut self, reg: Register, value: u64) {
        set_reg_raw(&self.partition, self.vp_index, reg, value);
    }

    fn rdrand(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn set_breakpoint(&mut self, gva: Gva, handler: Handler) -> Result<(), BackendError> {
        let gpa = self.virt_translate(gva, Access::EXECUTE)?;
        self.breakpoints.add_user_breakpoint(gva, gpa, handler)?;
        self.ram.add_breakpoint(gpa);
        self.sync_to_whv_immediate(gpa);
        Ok(())
    }

    fn install_coverage_breakpoint(&mut self, gva: Gva) -> Result<(), BackendError> {
        let gpa = self.virt_translate(gva, Access::EXECUTE)?;
        self.breakpoints.add_coverage_breakpoint(gva, gpa)?;
        self.ram.add_breakpoint(gpa);
        self.sync_to_whv_immediate(gpa);
        Ok(())
    }

    fn virt_translate(&self, gva: Gva, validate: Access) -> Result<Gpa, BackendError> {
        let cr3 = get_reg_raw(&self.partition, self.vp_index, Register::Cr3);
        let view = RamView(&self.ram);
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
        let _ = dirty;
        let mut remaining = data.len();
        let mut cur = gva;
        let mut offset = 0usize;
        while remaining > 0 {
            let gpa = self.virt_translate(cur, Access::WRITE)?;
            let page_off = cur.offset() as usize;
            let chunk = remaining.min(PAGE_SIZE as usize - page_off);
            self.ram.write_bytes(gpa, &data[offset..offset + chunk]);
            self.sync_to_whv_immediate(gpa);
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
        self.sync_to_whv_immediate(gpa);
    }

    fn page_fault_if_needed(&mut self, gva: Gva, len: u64) -> Result<bool, BackendError> {
        let mut cur = gva.align();
        let end = (gva + len).align();
        while cur.raw() <= end.raw() {
            if self.virt_translate(cur, Access::READ).is_err() {
                set_reg_raw(&self.partition, self.vp_index, Register::Cr2, cur.raw());
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
                self.sync_to_whv_immediate(gpa);
            }
        }
    }

    /// As with the KVM backend, hardware execution cannot emit a per-step
    /// trace without single-stepping the whole run; the path is accepted
    /// but never written to.
    fn set_trace_file(&mut self, path: &Path, _kind: TraceType) -> Result<(), BackendError> {
        self.trace_path = Some(path.to_path_buf());
        Ok(())
    }
}
