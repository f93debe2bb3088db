use aero_cpu_core::CpuStateError;
use aero_mem::MemoryError;
use aero_mmu::PageFault;
use aero_snapshot::SnapshotError;

/// Errors a backend can fail with outside of a testcase's own terminal
/// outcome (`TestcaseResult` is never an `Err` — see §7).
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("address translation failed: {0}")]
    Translate(#[from] PageFault),

    #[error("host memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("placing a breakpoint at {gva} collides with an existing one")]
    BreakpointCollision { gva: String },

    #[error("unknown vm-exit reason: {reason}")]
    UnknownExit { reason: String },

    #[error("backend capability unavailable on this host: {0}")]
    Unavailable(String),

    #[error("hypervisor ioctl failed: {0}")]
    Hypervisor(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("declared message length {len} exceeds the {limit}-byte framing limit")]
    MessageTooLarge { len: u32, limit: u32 },

    #[error("malformed wire payload: {0}")]
    Malformed(String),

    #[error("peer closed the connection")]
    ConnectionClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum FuzzError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Cpu(#[from] CpuStateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
