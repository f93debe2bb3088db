//! Guest physical memory with a copy-on-write breakpoint overlay (§4.1).
//!
//! The host buffer ([`aero_mem::PhysicalMemory`]) always holds the guest's
//! *current* view of memory — including any `0xCC` bytes placed by the
//! breakpoint/coverage engine and any writes the guest made during the
//! current run. The overlay holds, per page that has ever carried a
//! breakpoint, the *pristine* content with breakpoints re-applied; restoring
//! a dirty page is therefore a single memcpy that both rolls back guest
//! writes and re-arms every breakpoint on that page, without walking the
//! (potentially 500k+ entry) breakpoint table.

use std::collections::{HashMap, HashSet};

use aero_mem::PhysicalMemory;
use aero_types::{Gpa, Page, PAGE_SIZE};

const BREAKPOINT_BYTE: u8 = 0xcc;

/// The dump-provided, immutable backing: `{aligned-Gpa -> 4 KiB bytes}`.
pub type DumpPages = HashMap<u64, Page>;

pub struct Ram {
    buffer: PhysicalMemory,
    dump: DumpPages,
    overlay: HashMap<u64, Page>,
    /// Original (pre-breakpoint) byte for every currently-armed breakpoint,
    /// keyed by its exact (unaligned) GPA. Needed because the overlay page
    /// itself only remembers "pristine with 0xCC punched in", not what used
    /// to be under each 0xCC.
    bp_original_byte: HashMap<u64, u8>,
    dirty: HashSet<u64>,
}

fn pristine_byte(dump: &DumpPages, overlay: &HashMap<u64, Page>, gpa: u64) -> u8 {
    let aligned = aero_types::align(gpa);
    let off = aero_types::offset(gpa) as usize;
    if let Some(page) = overlay.get(&aligned) {
        return page[off];
    }
    if let Some(page) = dump.get(&aligned) {
        return page[off];
    }
    0
}

fn pristine_page(dump: &DumpPages, overlay: &HashMap<u64, Page>, aligned: u64) -> Page {
    if let Some(page) = overlay.get(&aligned) {
        return *page;
    }
    if let Some(page) = dump.get(&aligned) {
        return *page;
    }
    aero_types::zero_page()
}

impl Ram {
    /// Build RAM sized to fit every dump page, eagerly copying dump content
    /// into the host buffer (the directory-based snapshot loader always
    /// behaves like the hypervisor-backend eager-copy path; see SPEC_FULL §4.1.1).
    pub fn from_dump(dump: DumpPages) -> Self {
        let max_end = dump.keys().copied().max().map(|g| g + PAGE_SIZE).unwrap_or(0);
        let buffer = PhysicalMemory::new(max_end).expect("dump size fits in host memory");
        for (&gpa, page) in &dump {
            buffer.write_bytes(gpa, page);
        }
        Self {
            buffer,
            dump,
            overlay: HashMap::new(),
            bp_original_byte: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.buffer.size()
    }

    pub fn read_bytes(&self, gpa: Gpa, out: &mut [u8]) {
        self.buffer.read_bytes(gpa.raw(), out);
    }

    pub fn read_u8(&self, gpa: Gpa) -> u8 {
        self.buffer.read_u8(gpa.raw())
    }

    /// Write performed by the guest during a run: dirties the containing
    /// page so `restore` knows to roll it back.
    pub fn write_bytes(&mut self, gpa: Gpa, data: &[u8]) {
        self.buffer.write_bytes(gpa.raw(), data);
        let first_page = gpa.align().raw();
        let last_page = (gpa + data.len().saturating_sub(1) as u64).align().raw();
        let mut page = first_page;
        loop {
            self.dirty.insert(page);
            if page == last_page {
                break;
            }
            page += PAGE_SIZE;
        }
    }

    /// Place a one-shot or user breakpoint byte at `gpa`. Idempotent: placing
    /// a breakpoint that is already armed at this exact address is a no-op.
    pub fn add_breakpoint(&mut self, gpa: Gpa) {
        let raw = gpa.raw();
        if self.bp_original_byte.contains_key(&raw) {
            return;
        }
        let aligned = gpa.align().raw();
        let off = gpa.offset() as usize;

        let mut page = pristine_page(&self.dump, &self.overlay, aligned);
        let original = page[off];
        page[off] = BREAKPOINT_BYTE;
        self.overlay.insert(aligned, page);
        self.bp_original_byte.insert(raw, original);

        self.buffer.write_u8(raw, BREAKPOINT_BYTE);
    }

    /// Remove a previously-placed breakpoint, restoring the original byte in
    /// both the overlay and the live buffer.
    pub fn remove_breakpoint(&mut self, gpa: Gpa) {
        let raw = gpa.raw();
        let Some(original) = self.bp_original_byte.remove(&raw) else {
            return;
        };
        let aligned = gpa.align().raw();
        let off = gpa.offset() as usize;
        if let Some(page) = self.overlay.get_mut(&aligned) {
            page[off] = original;
        }
        self.buffer.write_u8(raw, original);
    }

    pub fn has_breakpoint(&self, gpa: Gpa) -> bool {
        self.bp_original_byte.contains_key(&gpa.raw())
    }

    /// Roll back every dirty page to its pristine (overlay-or-dump-or-zero)
    /// content and clear the dirty set. This is the whole of §4.6 step 2/3 as
    /// far as RAM is concerned; CPU-state reapplication is the caller's job.
    pub fn restore_dirty(&mut self) {
        for aligned in self.dirty.drain() {
            let page = pristine_page(&self.dump, &self.overlay, aligned);
            self.buffer.write_bytes(aligned, &page);
        }
    }

    pub fn dirty_pages(&self) -> impl Iterator<Item = Gpa> + '_ {
        self.dirty.iter().map(|&raw| Gpa::new(raw))
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }
}
