//! Small, well-known PC platform constants shared by the snapshot loader and
//! the hypervisor backends.

use aero_types::Gpa;

/// Default physical base of the local APIC's MMIO page. Hypervisor backends
/// carve a second memory slot around this page so RAM mappings never shadow it.
pub const APIC_DEFAULT_PHYS_BASE: u64 = 0xfee0_0000;

/// `IA32_APIC_BASE` MSR index.
pub const MSR_IA32_APIC_BASE: u32 = 0x0000_001b;

/// `IA32_EFER` MSR index.
pub const MSR_IA32_EFER: u32 = 0xc000_0080;

/// `IA32_SYSENTER_CS/ESP/EIP` MSR indices.
pub const MSR_IA32_SYSENTER_CS: u32 = 0x0000_0174;
pub const MSR_IA32_SYSENTER_ESP: u32 = 0x0000_0175;
pub const MSR_IA32_SYSENTER_EIP: u32 = 0x0000_0176;

/// `IA32_STAR/LSTAR/CSTAR/FMASK` MSR indices (SYSCALL/SYSRET support).
pub const MSR_IA32_STAR: u32 = 0xc000_0081;
pub const MSR_IA32_LSTAR: u32 = 0xc000_0082;
pub const MSR_IA32_CSTAR: u32 = 0xc000_0083;
pub const MSR_IA32_FMASK: u32 = 0xc000_0084;

/// `IA32_KERNEL_GS_BASE` and `IA32_TSC_AUX`.
pub const MSR_IA32_KERNEL_GS_BASE: u32 = 0xc000_0102;
pub const MSR_IA32_TSC_AUX: u32 = 0xc000_0103;

/// `IA32_PAT`.
pub const MSR_IA32_PAT: u32 = 0x0000_0277;

/// The fixed performance counter used for instruction-count-precise timeouts
/// on the Linux hypervisor backend (§4.3.2).
pub const PMC_FIXED_INST_RETIRED_ANY: u32 = 0x0000_0309;

/// `true` if `gpa`'s containing page is the local-APIC MMIO page.
pub fn is_apic_page(gpa: Gpa) -> bool {
    gpa.align().raw() == APIC_DEFAULT_PHYS_BASE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apic_page_detection_is_page_granular() {
        assert!(is_apic_page(Gpa::new(APIC_DEFAULT_PHYS_BASE)));
        assert!(is_apic_page(Gpa::new(APIC_DEFAULT_PHYS_BASE + 0xfff)));
        assert!(!is_apic_page(Gpa::new(APIC_DEFAULT_PHYS_BASE + 0x1000)));
    }
}
