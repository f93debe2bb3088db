//! Register access by enumerated name, used by `Backend::get_reg`/`set_reg`.

use crate::CpuState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum Register {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rflags,
    Cr0,
    Cr2,
    Cr3,
    Cr4,
    Cr8,
    Dr0,
    Dr1,
    Dr2,
    Dr3,
    Dr6,
    Dr7,
}

pub(crate) fn get(state: &CpuState, reg: Register) -> u64 {
    match reg {
        Register::Rax => state.rax,
        Register::Rcx => state.rcx,
        Register::Rdx => state.rdx,
        Register::Rbx => state.rbx,
        Register::Rsp => state.rsp,
        Register::Rbp => state.rbp,
        Register::Rsi => state.rsi,
        Register::Rdi => state.rdi,
        Register::R8 => state.r8,
        Register::R9 => state.r9,
        Register::R10 => state.r10,
        Register::R11 => state.r11,
        Register::R12 => state.r12,
        Register::R13 => state.r13,
        Register::R14 => state.r14,
        Register::R15 => state.r15,
        Register::Rip => state.rip,
        Register::Rflags => state.rflags,
        Register::Cr0 => state.cr0.bits(),
        Register::Cr2 => state.cr2,
        Register::Cr3 => state.cr3,
        Register::Cr4 => state.cr4.bits(),
        Register::Cr8 => state.cr8,
        Register::Dr0 => state.dr0,
        Register::Dr1 => state.dr1,
        Register::Dr2 => state.dr2,
        Register::Dr3 => state.dr3,
        Register::Dr6 => state.dr6 as u64,
        Register::Dr7 => state.dr7 as u64,
    }
}

pub(crate) fn set(state: &mut CpuState, reg: Register, value: u64) {
    match reg {
        Register::Rax => state.rax = value,
        Register::Rcx => state.rcx = value,
        Register::Rdx => state.rdx = value,
        Register::Rbx => state.rbx = value,
        Register::Rsp => state.rsp = value,
        Register::Rbp => state.rbp = value,
        Register::Rsi => state.rsi = value,
        Register::Rdi => state.rdi = value,
        Register::R8 => state.r8 = value,
        Register::R9 => state.r9 = value,
        Register::R10 => state.r10 = value,
        Register::R11 => state.r11 = value,
        Register::R12 => state.r12 = value,
        Register::R13 => state.r13 = value,
        Register::R14 => state.r14 = value,
        Register::R15 => state.r15 = value,
        Register::Rip => state.rip = value,
        Register::Rflags => state.rflags = value,
        Register::Cr0 => state.cr0 = crate::Cr0::from_bits_truncate(value),
        Register::Cr2 => state.cr2 = value,
        Register::Cr3 => state.cr3 = value,
        Register::Cr4 => state.cr4 = crate::Cr4::from_bits_truncate(value),
        Register::Cr8 => state.cr8 = value,
        Register::Dr0 => state.dr0 = value,
        Register::Dr1 => state.dr1 = value,
        Register::Dr2 => state.dr2 = value,
        Register::Dr3 => state.dr3 = value,
        Register::Dr6 => state.dr6 = value as u32,
        Register::Dr7 => state.dr7 = value as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_round_trips() {
        let mut state = CpuState::default();
        state.set_reg(Register::Rax, 0x1234);
        assert_eq!(state.get_reg(Register::Rax), 0x1234);
        state.set_reg(Register::Cr3, 0xdead_0000);
        assert_eq!(state.get_reg(Register::Cr3), 0xdead_0000);
    }
}
