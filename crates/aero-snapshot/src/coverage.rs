//! Loader for `state/coverage/*.cov`: each file names a module and the list
//! of RVAs inside it that should carry a coverage breakpoint. Resolving an
//! RVA to a GVA requires the module's base address, which we get from the
//! same [`SymbolStore`](crate::symbols::SymbolStore) used for naming.

use serde::Deserialize;

use aero_types::Gva;

use crate::symbols::SymbolStore;
use crate::SnapshotError;

#[derive(Deserialize)]
struct RawCovFile {
    name: String,
    addresses: Vec<u64>,
}

/// One `(module, rva)` coverage site, already resolved to an absolute GVA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageSite {
    pub gva: Gva,
}

/// Parse a single `.cov` file's contents. `module_base` must be the symbol
/// store's address for the `name` field this file declares; callers resolve
/// that lookup (and decide how to report an unresolvable module) before
/// calling in, mirroring the original tool's per-file skip-on-miss behavior.
pub fn parse_cov_file(data: &str, symbols: &SymbolStore) -> Result<Vec<CoverageSite>, SnapshotError> {
    let raw: RawCovFile = serde_json::from_str(data).map_err(|e| SnapshotError::MalformedJson {
        file: "*.cov",
        reason: e.to_string(),
    })?;

    let base = symbols
        .resolve(&raw.name)
        .ok_or_else(|| SnapshotError::UnknownSymbol(raw.name.clone()))?;

    Ok(raw
        .addresses
        .into_iter()
        .map(|rva| CoverageSite { gva: base + rva })
        .collect())
}
