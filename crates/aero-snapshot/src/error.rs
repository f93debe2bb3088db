use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot directory {path:?} is missing required file {name}")]
    MissingFile { path: PathBuf, name: &'static str },

    #[error("io error reading snapshot: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed mem.dmp: {reason}")]
    MalformedDump { reason: String },

    #[error("malformed regs.json: {0}")]
    Cpu(#[from] aero_cpu_core::CpuStateError),

    #[error("malformed {file}: {reason}")]
    MalformedJson { file: &'static str, reason: String },

    #[error("symbol {0:?} not found in symbol store")]
    UnknownSymbol(String),
}
