//! Linux KVM hardware-accelerated backend (§4.3.2), built on `kvm-ioctls` /
//! `kvm-bindings`: one `VmFd`, one `VcpuFd`, a single RAM memory slot with
//! the local-APIC page excluded, breakpoints via `KVM_SET_GUEST_DEBUG`, and
//! dirty tracking via the dirty-log bitmap rather than per-page EPT
//! permission remaps (§4.3.2: "a `kvm_dirty_log`-style bitmap read on
//! restore as an alternative/supplement to the EPT-permission scheme").

use std::path::{Path, PathBuf};

use kvm_bindings::{
    kvm_guest_debug, kvm_regs, kvm_userspace_memory_region, KVM_GUESTDBG_ENABLE,
    KVM_GUESTDBG_USE_HW_BP, KVM_MEM_LOG_DIRTY_PAGES,
};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};

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

const RAM_SLOT: u32 = 0;

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

struct KvmContext<'a> {
    vcpu: &'a VcpuFd,
    stop_requested: Option<TestcaseResult>,
}

impl BreakpointContext for KvmContext<'_> {
    fn get_reg(&self, reg: Register) -> u64 {
        get_reg_via_kvm(self.vcpu, reg)
    }
    fn set_reg(&mut self, reg: Register, value: u64) {
        set_reg_via_kvm(self.vcpu, reg, value);
    }
    fn stop(&mut self, result: TestcaseResult) {
        self.stop_requested = Some(result);
    }
    fn stop_requested(&self) -> bool {
        self.stop_requested.is_some()
    }
}

fn get_reg_via_kvm(vcpu: &VcpuFd, reg: Register) -> u64 {
    use Register::*;
    match reg {
        Rax | Rcx | Rdx | Rbx | Rsp | Rbp | Rsi | Rdi | R8 | R9 | R10 | R11 | R12 | R13 | R14
        | R15 | Rip | Rflags => {
            let regs = vcpu.get_regs().expect("KVM_GET_REGS");
            gpr_field(&regs, reg)
        }
        Cr0 | Cr2 | Cr3 | Cr4 | Cr8 => {
            let sregs = vcpu.get_sregs().expect("KVM_GET_SREGS");
            match reg {
                Cr0 => sregs.cr0,
                Cr2 => sregs.cr2,
                Cr3 => sregs.cr3,
                Cr4 => sregs.cr4,
                Cr8 => sregs.cr8,
                _ => unreachable!(),
            }
        }
        Dr0 | Dr1 | Dr2 | Dr3 | Dr6 | Dr7 => {
            let dbg = vcpu.get_debug_regs().expect("KVM_GET_DEBUGREGS");
            match reg {
                Dr0 => dbg.db[0],
                Dr1 => dbg.db[1],
                Dr2 => dbg.db[2],
                Dr3 => dbg.db[3],
                Dr6 => dbg.dr6,
                Dr7 => dbg.dr7,
                _ => unreachable!(),
            }
        }
    }
}

fn set_reg_via_kvm(vcpu: &VcpuFd, reg: Register, value: u64) {
    use Register::*;
    match reg {
        Rax | Rcx | Rdx | Rbx | Rsp | Rbp | Rsi | Rdi | R8 | R9 | R10 | R11 | R12 | R13 | R14
        | R15 | Rip | Rflags => {
            let mut regs = vcpu.get_regs().expect("KVM_GET_REGS");
            set_gpr_field(&mut regs, reg, value);
            vcpu.set_regs(&regs).expect("KVM_SET_REGS");
        }
        Cr0 | Cr2 | Cr3 | Cr4 | Cr8 => {
            let mut sregs = vcpu.get_sregs().expect("KVM_GET_SREGS");
            match reg {
                Cr0 => sregs.cr0 = value,
                Cr2 => sregs.cr2 = value,
                Cr3 => sregs.cr3 = value,
                Cr4 => sregs.cr4 = value,
                Cr8 => sregs.cr8 = value,
                _ => unreachable!(),
            }
            vcpu.set_sregs(&sregs).expect("KVM_SET_SREGS");
        }
        Dr0 | Dr1 | Dr2 | Dr3 | Dr6 | Dr7 => {
            let mut dbg = vcpu.get_debug_regs().expect("KVM_GET_DEBUGREGS");
            match reg {
                Dr0 => dbg.db[0] = value,
                Dr1 => dbg.db[1] = value,
                Dr2 => dbg.db[2] = value,
                Dr3 => dbg.db[3] = value,
                Dr6 => dbg.dr6 = value,
                Dr7 => dbg.dr7 = value,
                _ => unreachable!(),
            }
            vcpu.set_debug_regs(&dbg).expect("KVM_SET_DEBUGREGS");
        }
    }
}

fn gpr_field(regs: &kvm_regs, reg: Register) -> u64 {
    use Register::*;
    match reg {
        Rax => regs.rax, Rcx => regs.rcx, Rdx => regs.rdx, Rbx => regs.rbx,
        Rsp => regs.rsp, Rbp => regs.rbp, Rsi => regs.rsi, Rdi => regs.rdi,
        R8 => regs.r8, R9 => regs.r9, R10 => regs.r10, R11 => regs.r11,
        R12 => regs.r12, R13 => regs.r13, R14 => regs.r14, R15 => regs.r15,
        Rip => regs.rip, Rflags => regs.rflags,
        _ => unreachable!(),
    }
}

fn set_gpr_field(regs: &mut kvm_regs, reg: Register, value: u64) {
    use Register::*;
    match reg {
        Rax => regs.rax = value, Rcx => regs.rcx = value, Rdx => regs.rdx = value,
        Rbx => regs.rbx = value, Rsp => regs.rsp = value, Rbp => regs.rbp = value,
        Rsi => regs.rsi = value, Rdi => regs.rdi = value, R8 => regs.r8 = value,
        R9 => regs.r9 = value, R10 => regs.r10 = value, R11 => regs.r11 = value,
        R12 => regs.r12 = value, R13 => regs.r13 = value, R14 => regs.r14 = value,
        R15 => regs.r15 = value, Rip => regs.rip = value, Rflags => regs.rflags = value,
        _ => unreachable!(),
    }
}

fn cpu_state_to_kvm_regs(state: &CpuState) -> kvm_regs {
    kvm_regs {
        rax: state.rax, rbx: state.rbx, rcx: state.rcx, rdx: state.rdx,
        rsi: state.rsi, rdi: state.rdi, rsp: state.rsp, rbp: state.rbp,
        r8: state.r8, r9: state.r9, r10: state.r10, r11: state.r11,
        r12: state.r12, r13: state.r13, r14: state.r14, r15: state.r15,
        rip: state.rip, rflags: state.rflags,
    }
}

fn apply_sregs(vcpu: &VcpuFd, state: &CpuState) {
    let mut sregs = vcpu.get_sregs().expect("KVM_GET_SREGS");
    sregs.cr0 = state.cr0.bits();
    sregs.cr2 = state.cr2;
    sregs.cr3 = state.cr3;
    sregs.cr4 = state.cr4.bits();
    sregs.cr8 = state.cr8;
    sregs.efer = state.efer.bits();
    vcpu.set_sregs(&sregs).expect("KVM_SET_SREGS");
}

/// A Linux KVM-backed [`Backend`] (§4.3.2). Owns one VM, one VCPU, and a
/// single boxed RAM buffer eagerly populated from the loaded snapshot; the
/// buffer's address is what `KVM_SET_USER_MEMORY_REGION` maps into the
/// guest, so unlike [`crate::backend::emulator::EmulatorBackend`] it cannot
/// reuse `aero_mem::PhysicalMemory`'s lazy chunking directly (§4.1.1).
pub struct KvmBackend {
    _kvm: Kvm,
    vm: VmFd,
    vcpu: VcpuFd,
    guest_mem: Box<[u8]>,
    /// `(slot, gpa_base, size)` for each region registered in `new`, used to
    /// translate each slot's dirty-log bitmap back into absolute Gpas.
    slots: Vec<(u32, u64, u64)>,
    ram: Ram,
    breakpoints: Breakpoints,
    opts: BackendOptions,
    rng: DeterministicRng,
    cr3_initial: u64,
    pending_result: Option<TestcaseResult>,
    trace_path: Option<PathBuf>,
}

impl KvmBackend {
    pub fn new(ram: Ram) -> Result<Self, BackendError> {
        let kvm = Kvm::new().map_err(|e| BackendError::Hypervisor(e.to_string()))?;
        let vm = kvm.create_vm().map_err(|e| BackendError::Hypervisor(e.to_string()))?;
        let vcpu = vm.create_vcpu(0).map_err(|e| BackendError::Hypervisor(e.to_string()))?;

        let size = ram.size().max(PAGE_SIZE);
        let mut guest_mem = vec![0u8; size as usize].into_boxed_slice();
        copy_ram_into(&ram, &mut guest_mem);

        // Carve the local-APIC MMIO page out of the RAM slot (aero-pc-constants'
        // `is_apic_page`): rather than one region spanning all of `guest_mem`,
        // split around that single page if it falls within range, so nothing
        // maps host RAM underneath it.
        let apic_page = aero_pc_constants::APIC_DEFAULT_PHYS_BASE;
        let mut slots = Vec::new();
        unsafe {
            if apic_page < size {
                if apic_page > 0 {
                    let region = kvm_userspace_memory_region {
                        slot: RAM_SLOT,
                        flags: KVM_MEM_LOG_DIRTY_PAGES,
                        guest_phys_addr: 0,
                        memory_size: apic_page,
                        userspace_addr: guest_mem.as_ptr() as u64,
                    };
                    vm.set_user_memory_region(region)
                        .map_err(|e| BackendError::Hypervisor(e.to_string()))?;
                    slots.push((RAM_SLOT, 0u64, apic_page));
                }
                let after = apic_page + PAGE_SIZE;
                if after < size {
                    let region = kvm_userspace_memory_region {
                        slot: RAM_SLOT + 1,
                        flags: KVM_MEM_LOG_DIRTY_PAGES,
                        guest_phys_addr: after,
                        memory_size: size - after,
                        userspace_addr: guest_mem.as_ptr().add(after as usize) as u64,
                    };
                    vm.set_user_memory_region(region)
                        .map_err(|e| BackendError::Hypervisor(e.to_string()))?;
                    slots.push((RAM_SLOT + 1, after, size - after));
                }
            } else {
                let region = kvm_userspace_memory_region {
                    slot: RAM_SLOT,
                    flags: KVM_MEM_LOG_DIRTY_PAGES,
                    guest_phys_addr: 0,
                    memory_size: size,
                    userspace_addr: guest_mem.as_ptr() as u64,
                };
                vm.set_user_memory_region(region)
                    .map_err(|e| BackendError::Hypervisor(e.to_string()))?;
                slots.push((RAM_SLOT, 0u64, size));
            }
        }

        Ok(Self {
            _kvm: kvm,
            vm,
            vcpu,
            guest_mem,
            slots,
            ram,
            breakpoints: Breakpoints::new(),
            opts: BackendOptions::default(),
            rng: DeterministicRng::new(0),
            cr3_initial: 0,
            pending_result: None,
            trace_path: None,
        })
    }

    fn sync_dirty_from_kvm(&mut self) -> Result<(), BackendError> {
        for &(slot, base, len) in &self.slots.clone() {
            let bitmap = self
                .vm
                .get_dirty_log(slot, len as usize)
                .map_err(|e| BackendError::Hypervisor(e.to_string()))?;
            for (word_idx, word) in bitmap.iter().enumerate() {
                for bit in 0..64u32 {
                    if word & (1u64 << bit) == 0 {
                        continue;
                    }
                    let page_idx = word_idx as u64 * 64 + bit as u64;
                    let gpa = base + page_idx * PAGE_SIZE;
                    if gpa >= base + len || is_apic_page(Gpa::new(gpa)) {
                        continue;
                    }
                    let start = gpa as usize;
                    let end = (start + PAGE_SIZE as usize).min(self.guest_mem.len());
                    self.ram.write_bytes(Gpa::new(gpa), &self.guest_mem[start..end]);
                }
            }
        }
        Ok(())
    }

    fn sync_dirty_to_kvm(&mut self) {
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

impl Backend for KvmBackend {
    fn initialize(&mut self, opts: &BackendOptions, cpu_state: &CpuState) -> Result<(), BackendError> {
        self.opts = opts.clone();
        self.cr3_initial = cpu_state.cr3;
        self.rng = DeterministicRng::new(cpu_state.seed);

        let regs = cpu_state_to_kvm_regs(cpu_state);
        self.vcpu.set_regs(&regs).map_err(|e| BackendError::Hypervisor(e.to_string()))?;
        apply_sregs(&self.vcpu, cpu_state);

        let debug = kvm_guest_debug {
            control: KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_USE_HW_BP,
            ..Default::default()
        };
        self.vcpu
            .set_guest_debug(&debug)
            .map_err(|e| BackendError::Hypervisor(e.to_string()))?;

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
                    self.vcpu.set_kvm_immediate_exit(1);
                }
            }

            match self.vcpu.run() {
                Ok(VcpuExit::Hlt) => {
                    break TestcaseResult::Crash {
                        name: crash_name(CrashCause::IllegalInstruction, buffer),
                    };
                }
                Ok(VcpuExit::Shutdown) => {
                    break TestcaseResult::Crash { name: crash_name(CrashCause::IllegalInstruction, buffer) };
                }
                Ok(VcpuExit::Debug(_)) => {
                    if self.breakpoints.is_stepping_over() {
                        // §4.5 step 4: this #DB is the single-step trap
                        // completing the step-over; re-arm the `0xCC` and
                        // clear the trap flag rather than re-dispatching.
                        if let Some((_, gpa)) = self.breakpoints.finish_step_over() {
                            self.ram.add_breakpoint(gpa);
                            self.sync_dirty_to_kvm_immediate(gpa);
                        }
                        let flags = get_reg_via_kvm(&self.vcpu, Register::Rflags);
                        set_reg_via_kvm(&self.vcpu, Register::Rflags, flags & !RFLAGS_TF);
                    } else {
                        let rip = get_reg_via_kvm(&self.vcpu, Register::Rip);
                        let gva = Gva::new(rip);
                        if self.breakpoints.has_breakpoint(gva) {
                            let mut ctx = KvmContext { vcpu: &self.vcpu, stop_requested: None };
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
                                    self.sync_dirty_to_kvm_immediate(gpa);
                                }
                                let flags = get_reg_via_kvm(&self.vcpu, Register::Rflags);
                                set_reg_via_kvm(&self.vcpu, Register::Rflags, flags | RFLAGS_TF);
                            }
                        }
                        let new_cr3 = get_reg_via_kvm(&self.vcpu, Register::Cr3);
                        if new_cr3 != self.cr3_initial {
                            break TestcaseResult::Cr3Change;
                        }
                    }
                }
                Ok(VcpuExit::IoIn(..)) | Ok(VcpuExit::IoOut(..)) | Ok(VcpuExit::MmioRead(..)) | Ok(VcpuExit::MmioWrite(..)) => {
                    // Platform I/O outside RAM: not modeled; treated as a
                    // no-op VM-exit and the run continues (§7 "unknown
                    // VM-exit reasons" only covers exits this backend has no
                    // handling branch for at all).
                }
                Ok(other) => {
                    return Err(BackendError::UnknownExit { reason: format!("{other:?}") });
                }
                Err(e) => return Err(BackendError::Hypervisor(e.to_string())),
            }
        };

        self.sync_dirty_from_kvm()?;
        Ok(result)
    }

    fn restore(&mut self, cpu_state: &CpuState) -> Result<(), BackendError> {
        let regs = cpu_state_to_kvm_regs(cpu_state);
        self.vcpu.set_regs(&regs).map_err(|e| BackendError::Hypervisor(e.to_string()))?;
        apply_sregs(&self.vcpu, cpu_state);
        self.rng = DeterministicRng::new(cpu_state.seed);
        self.sync_dirty_to_kvm();
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
        get_reg_via_kvm(&self.vcpu, reg)
    }

    fn set_reg(&mut self, reg: Register, value: u64) {
        set_reg_via_kvm(&self.vcpu, reg, value);
    }

    fn rdrand(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn set_breakpoint(&mut self, gva: Gva, handler: Handler) -> Result<(), BackendError> {
        let gpa = self.virt_translate(gva, Access::EXECUTE)?;
        self.breakpoints.add_user_breakpoint(gva, gpa, handler)?;
        self.ram.add_breakpoint(gpa);
        self.sync_dirty_to_kvm_immediate(gpa);
        Ok(())
    }

    fn install_coverage_breakpoint(&mut self, gva: Gva) -> Result<(), BackendError> {
        let gpa = self.virt_translate(gva, Access::EXECUTE)?;
        self.breakpoints.add_coverage_breakpoint(gva, gpa)?;
        self.ram.add_breakpoint(gpa);
        self.sync_dirty_to_kvm_immediate(gpa);
        Ok(())
    }

    fn virt_translate(&self, gva: Gva, validate: Access) -> Result<Gpa, BackendError> {
        let cr3 = get_reg_via_kvm(&self.vcpu, Register::Cr3);
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
            self.sync_dirty_to_kvm_immediate(gpa);
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
        self.sync_dirty_to_kvm_immediate(gpa);
    }

    fn page_fault_if_needed(&mut self, gva: Gva, len: u64) -> Result<bool, BackendError> {
        let mut cur = gva.align();
        let end = (gva + len).align();
        while cur.raw() <= end.raw() {
            if self.virt_translate(cur, Access::READ).is_err() {
                set_reg_via_kvm(&self.vcpu, Register::Cr2, cur.raw());
                return Ok(true);
            }
            cur = cur + PAGE_SIZE;
        }
        Ok(false)
    }

    fn last_new_coverage(&self) -> std::collections::HashSet<CoverageId> {
        self.breakpoints.last_new_coverage().clone()
    }

    fn revoke_last_new_coverage(&mut self) {
        let to_rearm = self.breakpoints.revoke_last_new_coverage();
        for gva in to_rearm {
            if let Ok(gpa) = self.virt_translate(gva, Access::EXECUTE) {
                self.ram.add_breakpoint(gpa);
                self.sync_dirty_to_kvm_immediate(gpa);
            }
        }
    }

    /// Hardware execution retires instructions without trapping per-step, so
    /// this backend cannot emit a §4.3 trace without single-stepping the
    /// whole run (defeating the point of running on KVM); the path is
    /// accepted and stored but never written to. Traces are an
    /// `EmulatorBackend` capability.
    fn set_trace_file(&mut self, path: &Path, _kind: TraceType) -> Result<(), BackendError> {
        self.trace_path = Some(path.to_path_buf());
        Ok(())
    }
}

impl KvmBackend {
    /// Breakpoint placement writes `0xCC` through `Ram` (for bookkeeping and
    /// `virt_read`-style host access) but also needs to land in the actual
    /// KVM-mapped buffer immediately, since that copy — not `Ram`'s — is
    /// what the guest executes.
    fn sync_dirty_to_kvm_immediate(&mut self, gpa: Gpa) {
        let aligned = gpa.align();
        let mut page = [0u8; PAGE_SIZE as usize];
        self.ram.read_bytes(aligned, &mut page);
        let start = aligned.raw() as usize;
        let end = (start + PAGE_SIZE as usize).min(self.guest_mem.len());
        self.guest_mem[start..end].copy_from_slice(&page[..end - start]);
    }
}
