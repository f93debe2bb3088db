use aero_cpu_core::{CpuState, Cr0, Cr4, Register};
use proptest::prelude::*;

const ALL_REGISTERS: &[Register] = &[
    Register::Rax,
    Register::Rcx,
    Register::Rdx,
    Register::Rbx,
    Register::Rsp,
    Register::Rbp,
    Register::Rsi,
    Register::Rdi,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
    Register::Rip,
    Register::Rflags,
    Register::Cr0,
    Register::Cr2,
    Register::Cr3,
    Register::Cr4,
    Register::Cr8,
    Register::Dr0,
    Register::Dr1,
    Register::Dr2,
    Register::Dr3,
    Register::Dr6,
    Register::Dr7,
];

fn register() -> impl Strategy<Value = Register> {
    (0..ALL_REGISTERS.len()).prop_map(|i| ALL_REGISTERS[i])
}

/// What `get_reg` should return right after `set_reg(reg, value)`, accounting
/// for registers narrower than 64 bits or with reserved-bit masking.
fn expected_after_set(reg: Register, value: u64) -> u64 {
    match reg {
        Register::Dr6 | Register::Dr7 => value as u32 as u64,
        Register::Cr0 => Cr0::from_bits_truncate(value).bits(),
        Register::Cr4 => Cr4::from_bits_truncate(value).bits(),
        _ => value,
    }
}

proptest! {
    #[test]
    fn register_set_then_get_matches_expected_truncation(
        reg in register(),
        value in any::<u64>(),
    ) {
        let mut state = CpuState::default();
        state.set_reg(reg, value);
        prop_assert_eq!(state.get_reg(reg), expected_after_set(reg, value));
    }

    #[test]
    fn sanitize_is_idempotent_for_arbitrary_rip_and_cr8(
        rip in any::<u64>(),
        cr8 in any::<u64>(),
        fptw in any::<u16>(),
        all_infinity in any::<bool>(),
    ) {
        let mut state = CpuState::default();
        state.rip = rip;
        state.cr8 = cr8;
        state.fptw = fptw;
        state.sanitize(all_infinity);
        let once = state.clone();
        state.sanitize(all_infinity);
        prop_assert_eq!(once, state);
    }
}
