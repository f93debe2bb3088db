//! A small memory bus layered over [`PhysicalMemory`]: RAM by default, with
//! ROM, MMIO and open-bus regions that can be registered on top.

use std::ops::Range;
use std::sync::Arc;

use thiserror::Error;

use crate::PhysicalMemory;

/// A memory-mapped I/O device, addressed with offsets relative to the start
/// of its registered range.
pub trait MmioHandler: Send + Sync {
    fn read(&self, offset: u64, data: &mut [u8]);
    fn write(&self, offset: u64, data: &[u8]);
}

struct FnMmio<R, W> {
    read: R,
    write: W,
}

impl<R, W> MmioHandler for FnMmio<R, W>
where
    R: Fn(u64, &mut [u8]) + Send + Sync,
    W: Fn(u64, &[u8]) + Send + Sync,
{
    fn read(&self, offset: u64, data: &mut [u8]) {
        (self.read)(offset, data)
    }

    fn write(&self, offset: u64, data: &[u8]) {
        (self.write)(offset, data)
    }
}

#[derive(Debug, Error)]
pub enum MemoryBusError {
    #[error("allocation of {len} bytes at {addr:#x} failed")]
    OutOfMemory { addr: u64, len: usize },
    #[error("scatter/gather length mismatch: segments total {expected} bytes, buffer has {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("access at {addr:#x} falls inside an MMIO region")]
    MmioAccess { addr: u64 },
    #[error("write at {addr:#x} falls inside a ROM region")]
    RomAccess { addr: u64 },
    #[error("region {range:?} overlaps an already-registered region")]
    Overlap { range: Range<u64> },
    #[error("region {range:?} is empty or invalid")]
    InvalidRange { range: Range<u64> },
    #[error("address {addr:#x} + length {len} overflows a 64-bit address")]
    AddressOverflow { addr: u64, len: usize },
}

enum RegionKind {
    Rom(Arc<[u8]>),
    Mmio(Arc<dyn MmioHandler>),
    OpenBus,
}

struct Region {
    range: Range<u64>,
    kind: RegionKind,
}

/// Layers ROM/MMIO/open-bus regions over a [`PhysicalMemory`] backing.
pub struct MemoryBus {
    ram: Arc<PhysicalMemory>,
    regions: Vec<Region>,
}

enum Dispatch<'a> {
    Ram,
    Rom(&'a [u8], u64),
    Mmio(&'a Arc<dyn MmioHandler>, u64),
    OpenBus,
}

impl MemoryBus {
    pub fn new(ram: Arc<PhysicalMemory>) -> Self {
        Self { ram, regions: Vec::new() }
    }

    fn validate_range(&self, range: &Range<u64>) -> Result<(), MemoryBusError> {
        if range.start >= range.end {
            return Err(MemoryBusError::InvalidRange { range: range.clone() });
        }
        for r in &self.regions {
            if range.start < r.range.end && r.range.start < range.end {
                return Err(MemoryBusError::Overlap { range: range.clone() });
            }
        }
        Ok(())
    }

    pub fn register_mmio(
        &mut self,
        range: Range<u64>,
        handler: Arc<dyn MmioHandler>,
    ) -> Result<(), MemoryBusError> {
        self.validate_range(&range)?;
        self.regions.push(Region { range, kind: RegionKind::Mmio(handler) });
        Ok(())
    }

    pub fn register_mmio_fn<R, W>(
        &mut self,
        range: Range<u64>,
        read: R,
        write: W,
    ) -> Result<(), MemoryBusError>
    where
        R: Fn(u64, &mut [u8]) + Send + Sync + 'static,
        W: Fn(u64, &[u8]) + Send + Sync + 'static,
    {
        self.register_mmio(range, Arc::new(FnMmio { read, write }))
    }

    pub fn register_rom(&mut self, base: u64, bytes: Arc<[u8]>) -> Result<(), MemoryBusError> {
        if bytes.is_empty() {
            return Err(MemoryBusError::InvalidRange { range: base..base });
        }
        let range = base..base + bytes.len() as u64;
        self.validate_range(&range)?;
        self.regions.push(Region { range, kind: RegionKind::Rom(bytes) });
        Ok(())
    }

    pub fn register_open_bus(&mut self, range: Range<u64>) -> Result<(), MemoryBusError> {
        self.validate_range(&range)?;
        self.regions.push(Region { range, kind: RegionKind::OpenBus });
        Ok(())
    }

    fn dispatch(&self, addr: u64) -> Dispatch<'_> {
        for r in &self.regions {
            if r.range.contains(&addr) {
                let rel = addr - r.range.start;
                return match &r.kind {
                    RegionKind::Rom(bytes) => Dispatch::Rom(bytes, rel),
                    RegionKind::Mmio(h) => Dispatch::Mmio(h, rel),
                    RegionKind::OpenBus => Dispatch::OpenBus,
                };
            }
        }
        Dispatch::Ram
    }

    /// Byte-by-byte read honoring region boundaries; slow path used for
    /// cross-region or cross-device reads. Single-region reads take the
    /// dedicated fast paths below.
    fn read_dispatched(&self, addr: u64, out: &mut [u8]) {
        let mut pos = 0usize;
        while pos < out.len() {
            let a = addr + pos as u64;
            match self.dispatch(a) {
                Dispatch::Ram => {
                    // Extend the RAM run as far as possible to avoid a
                    // byte-at-a-time fallback for the common case.
                    let mut run = 1usize;
                    while pos + run < out.len()
                        && matches!(self.dispatch(a + run as u64), Dispatch::Ram)
                    {
                        run += 1;
                    }
                    self.ram.read_bytes(a, &mut out[pos..pos + run]);
                    pos += run;
                }
                Dispatch::Rom(bytes, rel) => {
                    out[pos] = bytes[rel as usize];
                    pos += 1;
                }
                Dispatch::Mmio(h, rel) => {
                    h.read(rel, &mut out[pos..pos + 1]);
                    pos += 1;
                }
                Dispatch::OpenBus => {
                    out[pos] = 0xff;
                    pos += 1;
                }
            }
        }
    }

    fn write_dispatched(&self, addr: u64, data: &[u8]) {
        let mut pos = 0usize;
        while pos < data.len() {
            let a = addr + pos as u64;
            match self.dispatch(a) {
                Dispatch::Ram => {
                    let mut run = 1usize;
                    while pos + run < data.len()
                        && matches!(self.dispatch(a + run as u64), Dispatch::Ram)
                    {
                        run += 1;
                    }
                    self.ram.write_bytes(a, &data[pos..pos + run]);
                    pos += run;
                }
                Dispatch::Rom(_, _) | Dispatch::OpenBus => {
                    pos += 1;
                }
                Dispatch::Mmio(h, rel) => {
                    h.write(rel, &data[pos..pos + 1]);
                    pos += 1;
                }
            }
        }
    }

    pub fn read_bytes(&self, addr: u64, out: &mut [u8]) {
        self.read_dispatched(addr, out);
    }

    pub fn write_bytes(&self, addr: u64, data: &[u8]) {
        self.write_dispatched(addr, data);
    }

    pub fn try_read_bytes(&self, addr: u64, out: &mut [u8]) -> Result<(), MemoryBusError> {
        addr.checked_add(out.len() as u64)
            .ok_or(MemoryBusError::AddressOverflow { addr, len: out.len() })?;
        self.read_bytes(addr, out);
        Ok(())
    }

    pub fn try_write_bytes(&self, addr: u64, data: &[u8]) -> Result<(), MemoryBusError> {
        addr.checked_add(data.len() as u64)
            .ok_or(MemoryBusError::AddressOverflow { addr, len: data.len() })?;
        self.write_bytes(addr, data);
        Ok(())
    }

    pub fn read_u8(&self, addr: u64) -> u8 {
        let mut b = [0u8; 1];
        self.read_bytes(addr, &mut b);
        b[0]
    }

    pub fn write_u8(&self, addr: u64, v: u8) {
        self.write_bytes(addr, &[v]);
    }

    pub fn read_u16(&self, addr: u64) -> u16 {
        let mut b = [0u8; 2];
        self.read_bytes(addr, &mut b);
        u16::from_le_bytes(b)
    }

    pub fn write_u16(&self, addr: u64, v: u16) {
        self.write_bytes(addr, &v.to_le_bytes());
    }

    pub fn read_u32(&self, addr: u64) -> u32 {
        let mut b = [0u8; 4];
        self.read_bytes(addr, &mut b);
        u32::from_le_bytes(b)
    }

    pub fn write_u32(&self, addr: u64, v: u32) {
        self.write_bytes(addr, &v.to_le_bytes());
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        let mut b = [0u8; 8];
        self.read_bytes(addr, &mut b);
        u64::from_le_bytes(b)
    }

    pub fn write_u64(&self, addr: u64, v: u64) {
        self.write_bytes(addr, &v.to_le_bytes());
    }

    pub fn read_u128(&self, addr: u64) -> u128 {
        let mut b = [0u8; 16];
        self.read_bytes(addr, &mut b);
        u128::from_le_bytes(b)
    }

    pub fn write_u128(&self, addr: u64, v: u128) {
        self.write_bytes(addr, &v.to_le_bytes());
    }

    /// Read a run of bytes, failing atomically (no partial read) if any byte
    /// in the range falls inside an MMIO region.
    pub fn read_physical_into(&self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryBusError> {
        self.reject_mmio(addr, dst.len())?;
        self.try_read_bytes(addr, dst)
    }

    /// Write a run of bytes, failing atomically (no partial write) if any
    /// byte in the range falls inside a ROM or MMIO region.
    pub fn write_physical_from(&self, addr: u64, src: &[u8]) -> Result<(), MemoryBusError> {
        self.reject_rom(addr, src.len())?;
        self.reject_mmio(addr, src.len())?;
        self.try_write_bytes(addr, src)
    }

    /// Like [`Self::read_physical_into`] but also rejects ROM, leaving only RAM.
    pub fn try_read_ram_bytes(&self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryBusError> {
        self.reject_rom(addr, dst.len())?;
        self.reject_mmio(addr, dst.len())?;
        self.try_read_bytes(addr, dst)
    }

    fn reject_mmio(&self, addr: u64, len: usize) -> Result<(), MemoryBusError> {
        let end = addr.checked_add(len as u64).unwrap_or(u64::MAX);
        for r in &self.regions {
            if matches!(r.kind, RegionKind::Mmio(_)) && addr < r.range.end && r.range.start < end {
                return Err(MemoryBusError::MmioAccess { addr: addr.max(r.range.start) });
            }
        }
        Ok(())
    }

    fn reject_rom(&self, addr: u64, len: usize) -> Result<(), MemoryBusError> {
        let end = addr.checked_add(len as u64).unwrap_or(u64::MAX);
        for r in &self.regions {
            if matches!(r.kind, RegionKind::Rom(_)) && addr < r.range.end && r.range.start < end {
                return Err(MemoryBusError::RomAccess { addr: addr.max(r.range.start) });
            }
        }
        Ok(())
    }

    /// Read each `(addr, len)` segment contiguously into `dst`.
    pub fn read_sg(&self, segments: &[(u64, usize)], dst: &mut [u8]) -> Result<(), MemoryBusError> {
        let total: usize = segments.iter().map(|(_, l)| *l).sum();
        if total != dst.len() {
            return Err(MemoryBusError::LengthMismatch { expected: total, actual: dst.len() });
        }
        let mut pos = 0;
        for (addr, len) in segments {
            self.try_read_bytes(*addr, &mut dst[pos..pos + len])?;
            pos += len;
        }
        Ok(())
    }

    /// Write each `(addr, len)` segment from contiguous `src`, best-effort
    /// (partial writes on a later segment's error are possible).
    pub fn write_sg(&self, segments: &[(u64, usize)], src: &[u8]) -> Result<(), MemoryBusError> {
        let total: usize = segments.iter().map(|(_, l)| *l).sum();
        if total != src.len() {
            return Err(MemoryBusError::LengthMismatch { expected: total, actual: src.len() });
        }
        let mut pos = 0;
        for (addr, len) in segments {
            self.try_write_bytes(*addr, &src[pos..pos + len])?;
            pos += len;
        }
        Ok(())
    }

    /// Like [`Self::write_sg`] but validates every segment against MMIO/ROM
    /// and bounds *before* writing any of them, so a rejected write never
    /// partially lands.
    pub fn try_write_sg(&self, segments: &[(u64, usize)], src: &[u8]) -> Result<(), MemoryBusError> {
        let total: usize = segments.iter().map(|(_, l)| *l).sum();
        if total != src.len() {
            return Err(MemoryBusError::LengthMismatch { expected: total, actual: src.len() });
        }
        for (addr, len) in segments {
            addr.checked_add(*len as u64)
                .ok_or(MemoryBusError::AddressOverflow { addr: *addr, len: *len })?;
            self.reject_rom(*addr, *len)?;
            self.reject_mmio(*addr, *len)?;
        }
        let mut pos = 0;
        for (addr, len) in segments {
            self.ram.write_bytes(*addr, &src[pos..pos + len]);
            pos += len;
        }
        Ok(())
    }

    /// Copy `len` bytes starting at `addr` out of RAM into a freshly
    /// allocated buffer, used by DMA-style bulk transfers.
    pub fn memcpy_from_guest(&self, addr: u64, len: usize) -> Result<Vec<u8>, MemoryBusError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| MemoryBusError::OutOfMemory { addr, len })?;
        buf.resize(len, 0);
        self.try_read_bytes(addr, &mut buf)?;
        Ok(buf)
    }
}
