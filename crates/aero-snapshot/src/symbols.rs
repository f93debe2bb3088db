//! `state/symbol-store.json`: a flat `{name -> "0x...hex address"}` object,
//! the same shape the non-debugger-engine build of the original tool reads
//! when no local debug-symbol engine is available. We always load it this
//! way since resolving PDBs/DWARF is an external collaborator (§1).

use std::collections::BTreeMap;

use aero_types::Gva;
use serde::Deserialize;

use crate::SnapshotError;

#[derive(Deserialize)]
#[serde(transparent)]
struct RawSymbolStore(std::collections::HashMap<String, String>);

/// Bidirectional `{name <-> address}` table with nearest-symbol-at-or-below
/// lookup for turning a bare RIP into `module!func+0x123`-style names.
pub struct SymbolStore {
    by_name: std::collections::HashMap<String, Gva>,
    /// Sorted by address for `nearest_below`.
    by_address: BTreeMap<u64, String>,
}

impl SymbolStore {
    pub fn empty() -> Self {
        Self {
            by_name: std::collections::HashMap::new(),
            by_address: BTreeMap::new(),
        }
    }

    pub fn from_json_str(data: &str) -> Result<Self, SnapshotError> {
        let raw: RawSymbolStore =
            serde_json::from_str(data).map_err(|e| SnapshotError::MalformedJson {
                file: "symbol-store.json",
                reason: e.to_string(),
            })?;

        let mut by_name = std::collections::HashMap::with_capacity(raw.0.len());
        let mut by_address = BTreeMap::new();
        for (name, addr_str) in raw.0 {
            let addr = parse_address(&addr_str).ok_or_else(|| SnapshotError::MalformedJson {
                file: "symbol-store.json",
                reason: format!("{name:?} has non-numeric address {addr_str:?}"),
            })?;
            by_address.insert(addr, name.clone());
            by_name.insert(name, Gva::new(addr));
        }

        Ok(Self { by_name, by_address })
    }

    pub fn resolve(&self, name: &str) -> Option<Gva> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// The closest known symbol at or below `addr`, formatted the way the
    /// original debugger's fallback name resolution does: `name+0xoffset`
    /// (or bare `name` if the offset is zero). `None` if `addr` falls before
    /// every known symbol.
    pub fn name_for(&self, addr: Gva) -> Option<String> {
        let (&base, name) = self.by_address.range(..=addr.raw()).next_back()?;
        let offset = addr.raw() - base;
        if offset == 0 {
            Some(name.clone())
        } else {
            Some(format!("{name}+{offset:#x}"))
        }
    }
}

fn parse_address(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<u64>().ok().or_else(|| u64::from_str_radix(s, 16).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "ntdll!NtReadFile": "0xfffff8010a001000",
            "fuzzme!main": "0x140001000"
        }"#
    }

    #[test]
    fn resolves_by_exact_name() {
        let store = SymbolStore::from_json_str(sample_json()).unwrap();
        assert_eq!(store.resolve("fuzzme!main"), Some(Gva::new(0x140001000)));
        assert_eq!(store.resolve("missing!sym"), None);
    }

    #[test]
    fn nearest_below_finds_containing_function() {
        let store = SymbolStore::from_json_str(sample_json()).unwrap();
        assert_eq!(
            store.name_for(Gva::new(0x140001010)).as_deref(),
            Some("fuzzme!main+0x10")
        );
        assert_eq!(store.name_for(Gva::new(0x140001000)).as_deref(), Some("fuzzme!main"));
    }

    #[test]
    fn address_before_every_symbol_resolves_to_none() {
        let store = SymbolStore::from_json_str(sample_json()).unwrap();
        assert_eq!(store.name_for(Gva::new(0x10)), None);
    }
}
