//! x86-64 4-level page-table walker (PML4 → PDPT → PD → PT), operating over
//! any physical-memory view that implements [`MemoryBus`].

use aero_types::{Gpa, Gva};
use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Access intent for a translation; advisory (hypervisor backends may
    /// enforce it against page-table permission bits, the software path may
    /// ignore it).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXECUTE = 0b100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLevel {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultReason {
    NotPresent,
    ReservedBitSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("page fault translating {gva} at {level:?} ({reason:?})")]
pub struct PageFault {
    pub gva: Gva,
    pub level: PageLevel,
    pub reason: PageFaultReason,
}

const PRESENT: u64 = 1 << 0;
const PAGE_SIZE_BIT: u64 = 1 << 7;
const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Bits 29:13 of a PDPTE with `PS=1` (1 GiB page): below the 1 GiB-aligned
/// base address but above the flag bits, excluding bit 12 (PAT). Per the SDM
/// these must be zero; a set bit means the entry names an unaligned frame.
const RESERVED_1G_PAGE_MASK: u64 = 0x0000_0000_03ff_e000;

/// Bits 20:13 of a PDE with `PS=1` (2 MiB page), same reasoning as
/// [`RESERVED_1G_PAGE_MASK`] for the smaller large-page size.
const RESERVED_2M_PAGE_MASK: u64 = 0x0000_0000_001f_e000;

fn index(gva: Gva, shift: u32) -> u64 {
    (gva.raw() >> shift) & 0x1ff
}

/// Minimal read access to guest physical memory the walker needs: 8-byte
/// aligned reads of page-table entries.
pub trait MemoryBus {
    fn read_u8(&self, addr: u64) -> u8;
    fn read_u16(&self, addr: u64) -> u16;
    fn read_u32(&self, addr: u64) -> u32;
    fn read_u64(&self, addr: u64) -> u64;
    fn write_u8(&self, addr: u64, v: u8);
    fn write_u16(&self, addr: u64, v: u16);
    fn write_u32(&self, addr: u64, v: u32);
    fn write_u64(&self, addr: u64, v: u64);
}

#[cfg(feature = "aero-mem-bus")]
impl MemoryBus for aero_mem::MemoryBus {
    fn read_u8(&self, addr: u64) -> u8 {
        aero_mem::MemoryBus::read_u8(self, addr)
    }
    fn read_u16(&self, addr: u64) -> u16 {
        aero_mem::MemoryBus::read_u16(self, addr)
    }
    fn read_u32(&self, addr: u64) -> u32 {
        aero_mem::MemoryBus::read_u32(self, addr)
    }
    fn read_u64(&self, addr: u64) -> u64 {
        aero_mem::MemoryBus::read_u64(self, addr)
    }
    fn write_u8(&self, addr: u64, v: u8) {
        aero_mem::MemoryBus::write_u8(self, addr, v)
    }
    fn write_u16(&self, addr: u64, v: u16) {
        aero_mem::MemoryBus::write_u16(self, addr, v)
    }
    fn write_u32(&self, addr: u64, v: u32) {
        aero_mem::MemoryBus::write_u32(self, addr, v)
    }
    fn write_u64(&self, addr: u64, v: u64) {
        aero_mem::MemoryBus::write_u64(self, addr, v)
    }
}

/// Optional per-walk statistics (feature `stats`): counts of table reads per
/// level, useful when profiling TLB-less translation hot paths.
#[cfg(feature = "stats")]
#[derive(Debug, Clone, Copy, Default)]
pub struct WalkStats {
    pub pml4_reads: u64,
    pub pdpt_reads: u64,
    pub pd_reads: u64,
    pub pt_reads: u64,
}

/// Translate `gva` using the page tables rooted at `cr3` (a physical address;
/// any non-address bits such as PCID must already be masked out by the
/// caller). `_validate` is advisory per the component contract.
pub fn virt_translate<B: MemoryBus>(
    bus: &B,
    gva: Gva,
    cr3: u64,
    _validate: Access,
) -> Result<Gpa, PageFault> {
    let pml4_base = cr3 & PTE_ADDR_MASK;
    let pml4e = bus.read_u64(pml4_base + index(gva, 39) * 8);
    if pml4e & PRESENT == 0 {
        return Err(PageFault { gva, level: PageLevel::Pml4, reason: PageFaultReason::NotPresent });
    }

    let pdpt_base = pml4e & PTE_ADDR_MASK;
    let pdpte = bus.read_u64(pdpt_base + index(gva, 30) * 8);
    if pdpte & PRESENT == 0 {
        return Err(PageFault { gva, level: PageLevel::Pdpt, reason: PageFaultReason::NotPresent });
    }
    if pdpte & PAGE_SIZE_BIT != 0 {
        // 1 GiB page.
        if pdpte & RESERVED_1G_PAGE_MASK != 0 {
            return Err(PageFault { gva, level: PageLevel::Pdpt, reason: PageFaultReason::ReservedBitSet });
        }
        let base = pdpte & 0x000f_ffff_c000_0000;
        return Ok(Gpa::new(base + (gva.raw() & 0x3fff_ffff)));
    }

    let pd_base = pdpte & PTE_ADDR_MASK;
    let pde = bus.read_u64(pd_base + index(gva, 21) * 8);
    if pde & PRESENT == 0 {
        return Err(PageFault { gva, level: PageLevel::Pd, reason: PageFaultReason::NotPresent });
    }
    if pde & PAGE_SIZE_BIT != 0 {
        // 2 MiB page.
        if pde & RESERVED_2M_PAGE_MASK != 0 {
            return Err(PageFault { gva, level: PageLevel::Pd, reason: PageFaultReason::ReservedBitSet });
        }
        let base = pde & 0x000f_ffff_ffe0_0000;
        return Ok(Gpa::new(base + (gva.raw() & 0x1f_ffff)));
    }

    let pt_base = pde & PTE_ADDR_MASK;
    let pte = bus.read_u64(pt_base + index(gva, 12) * 8);
    if pte & PRESENT == 0 {
        return Err(PageFault { gva, level: PageLevel::Pt, reason: PageFaultReason::NotPresent });
    }

    let base = pte & PTE_ADDR_MASK;
    Ok(Gpa::new(base + gva.offset()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// A tiny in-memory physical bus for exercising the walker without
    /// pulling in `aero-mem`.
    #[derive(Default)]
    struct FakeBus(RefCell<HashMap<u64, u64>>);

    impl FakeBus {
        fn set_u64(&self, addr: u64, v: u64) {
            self.0.borrow_mut().insert(addr, v);
        }
    }

    impl MemoryBus for FakeBus {
        fn read_u8(&self, _addr: u64) -> u8 {
            unimplemented!()
        }
        fn read_u16(&self, _addr: u64) -> u16 {
            unimplemented!()
        }
        fn read_u32(&self, _addr: u64) -> u32 {
            unimplemented!()
        }
        fn read_u64(&self, addr: u64) -> u64 {
            *self.0.borrow().get(&addr).unwrap_or(&0)
        }
        fn write_u8(&self, _addr: u64, _v: u8) {
            unimplemented!()
        }
        fn write_u16(&self, _addr: u64, _v: u16) {
            unimplemented!()
        }
        fn write_u32(&self, _addr: u64, _v: u32) {
            unimplemented!()
        }
        fn write_u64(&self, addr: u64, v: u64) {
            self.set_u64(addr, v)
        }
    }

    fn build_identity_map(bus: &FakeBus, cr3: u64, gva: Gva, gpa: Gpa) {
        let pml4_base = cr3;
        let pdpt_base = 0x2000;
        let pd_base = 0x3000;
        let pt_base = 0x4000;

        bus.set_u64(pml4_base + index(gva, 39) * 8, pdpt_base | PRESENT);
        bus.set_u64(pdpt_base + index(gva, 30) * 8, pd_base | PRESENT);
        bus.set_u64(pd_base + index(gva, 21) * 8, pt_base | PRESENT);
        bus.set_u64(pt_base + index(gva, 12) * 8, (gpa.raw() & PTE_ADDR_MASK) | PRESENT);
    }

    #[test]
    fn four_level_walk_resolves_4k_page() {
        let bus = FakeBus::default();
        let cr3 = 0x1000u64;
        let gva = Gva::new(0x0000_7fff_1234_5678);
        let gpa = Gpa::new(0x10_0000 + gva.offset());
        build_identity_map(&bus, cr3, gva, gpa);

        let resolved = virt_translate(&bus, gva, cr3, Access::READ).unwrap();
        assert_eq!(resolved, gpa);
    }

    #[test]
    fn not_present_pml4e_faults_at_pml4_level() {
        let bus = FakeBus::default();
        let gva = Gva::new(0x1000);
        let err = virt_translate(&bus, gva, 0x1000, Access::READ).unwrap_err();
        assert_eq!(err.level, PageLevel::Pml4);
        assert_eq!(err.reason, PageFaultReason::NotPresent);
    }

    #[test]
    fn large_2mb_page_resolves_without_walking_pt() {
        let bus = FakeBus::default();
        let cr3 = 0x1000u64;
        let gva = Gva::new(0x20_0000 + 0x123);
        let pdpt_base = 0x2000;
        let pd_base = 0x3000;
        bus.set_u64(cr3 + index(gva, 39) * 8, pdpt_base | PRESENT);
        bus.set_u64(pdpt_base + index(gva, 30) * 8, pd_base | PRESENT);
        bus.set_u64(
            pd_base + index(gva, 21) * 8,
            (0x20_0000u64 & 0x000f_ffff_ffe0_0000) | PRESENT | PAGE_SIZE_BIT,
        );

        let resolved = virt_translate(&bus, gva, cr3, Access::EXECUTE).unwrap();
        assert_eq!(resolved, Gpa::new(0x20_0000 + 0x123));
    }

    #[test]
    fn large_2mb_page_with_unaligned_frame_bits_faults_with_reserved_bit_set() {
        let bus = FakeBus::default();
        let cr3 = 0x1000u64;
        let gva = Gva::new(0x20_0000 + 0x123);
        let pdpt_base = 0x2000;
        let pd_base = 0x3000;
        bus.set_u64(cr3 + index(gva, 39) * 8, pdpt_base | PRESENT);
        bus.set_u64(pdpt_base + index(gva, 30) * 8, pd_base | PRESENT);
        // A would-be 2 MiB frame address with bit 13 set: not aligned to a
        // 2 MiB boundary, so it names a reserved bit per the SDM.
        bus.set_u64(
            pd_base + index(gva, 21) * 8,
            (0x20_0000u64 & 0x000f_ffff_ffe0_0000) | PRESENT | PAGE_SIZE_BIT | (1 << 13),
        );

        let err = virt_translate(&bus, gva, cr3, Access::EXECUTE).unwrap_err();
        assert_eq!(err.level, PageLevel::Pd);
        assert_eq!(err.reason, PageFaultReason::ReservedBitSet);
    }

    #[test]
    fn large_1gb_page_with_unaligned_frame_bits_faults_with_reserved_bit_set() {
        let bus = FakeBus::default();
        let cr3 = 0x1000u64;
        let gva = Gva::new(0x4000_0000 + 0x123);
        let pdpt_base = 0x2000;
        bus.set_u64(cr3 + index(gva, 39) * 8, pdpt_base | PRESENT);
        // A would-be 1 GiB frame address with bit 20 set: not aligned to a
        // 1 GiB boundary, so it names a reserved bit per the SDM.
        bus.set_u64(
            pdpt_base + index(gva, 30) * 8,
            (0x4000_0000u64 & 0x000f_ffff_c000_0000) | PRESENT | PAGE_SIZE_BIT | (1 << 20),
        );

        let err = virt_translate(&bus, gva, cr3, Access::EXECUTE).unwrap_err();
        assert_eq!(err.level, PageLevel::Pdpt);
        assert_eq!(err.reason, PageFaultReason::ReservedBitSet);
    }
}
