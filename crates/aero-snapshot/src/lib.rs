//! Loads a fuzzing target's on-disk snapshot (CPU state, physical memory,
//! symbol names, coverage breakpoint sites) and implements the dirty-page
//! restore cycle run between testcases.

mod coverage;
mod dump;
mod error;
mod ram;
mod snapshot;
mod symbols;

#[cfg(test)]
mod test_support;

pub use coverage::CoverageSite;
pub use error::SnapshotError;
pub use ram::{DumpPages, Ram};
pub use snapshot::{Snapshot, TestcaseResult};
pub use symbols::SymbolStore;
