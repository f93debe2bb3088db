//! Coverage id derivation shared by the emulator backend's `before_execution`
//! hook (§4.3.1, §4.4): edge coverage, LAF opcode-level comparisons, and
//! CompCov well-known-function hooks. All three produce synthetic 64-bit ids
//! via `splitmix64`, distinct from the Gva-valued ids one-shot coverage
//! breakpoints contribute.

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind};

use crate::breakpoints::CoverageId;

/// The fixed-point mixing step used throughout this module to turn an
/// address (or address-derived key) into a well-distributed 64-bit id.
pub fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

/// Edge-coverage id for a taken branch from `rip` to `next_rip` (§4.3.1).
pub fn edge_id(rip: u64, next_rip: u64) -> CoverageId {
    splitmix64(rip) ^ next_rip
}

/// Maximum bytes read per operand by CompCov's well-known-function hooks and
/// by LAF's memory-operand decoding (§9 "Resolved — CompCov bound").
pub const COMPCOV_MAX_LEN: usize = 4096;

/// LAF byte-level comparison ids: for a `CMP`/`SUB` instruction at `rip`
/// comparing `lhs` against `rhs` (same width, widest lane first), emit one id
/// per matching leading byte, matching the "byte_index" enumeration in §4.3.1
/// and §4.4. Returns an empty vec if the leading bytes already differ.
pub fn laf_ids(rip: u64, lhs: u64, rhs: u64, width_bytes: usize) -> Vec<CoverageId> {
    let lhs_bytes = lhs.to_le_bytes();
    let rhs_bytes = rhs.to_le_bytes();
    let mut ids = Vec::new();
    // Compare from the most-significant matching byte down, mirroring the
    // "decompose into byte-level prefix comparisons" framing: byte_index 0
    // is the first (most significant, within width) byte compared.
    for byte_index in 0..width_bytes.min(8) {
        let idx = width_bytes - 1 - byte_index;
        if lhs_bytes[idx] != rhs_bytes[idx] {
            break;
        }
        ids.push(splitmix64(rip).wrapping_add(byte_index as u64));
    }
    ids
}

/// Is this instruction a LAF-eligible `CMP`/`SUB` against an immediate or
/// another operand (as opposed to e.g. a `CMP` with a memory destination we
/// cannot read without a full memory-operand evaluator)? Returns the
/// comparison width in bytes if so.
pub fn laf_eligible(instr: &Instruction) -> Option<usize> {
    if !matches!(instr.mnemonic(), Mnemonic::Cmp | Mnemonic::Sub) {
        return None;
    }
    if instr.op_count() < 2 {
        return None;
    }
    if instr.op0_kind() != OpKind::Register {
        return None;
    }
    match instr.op1_kind() {
        OpKind::Register | OpKind::Immediate8 | OpKind::Immediate16 | OpKind::Immediate32
        | OpKind::Immediate64 | OpKind::Immediate8to16 | OpKind::Immediate8to32
        | OpKind::Immediate8to64 | OpKind::Immediate32to64 => Some(instr.op0_register().size() as usize),
        _ => None,
    }
}

/// Decode the single instruction at the start of `code` (guest bytes already
/// read from `rip`), returning `None` if decoding failed or produced no
/// instruction, used by both LAF and the CompCov entry-hook RIP comparisons.
pub fn decode_one(code: &[u8], rip: u64) -> Option<Instruction> {
    let mut decoder = Decoder::with_ip(64, code, rip, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return None;
    }
    let instr = decoder.decode();
    if instr.is_invalid() {
        return None;
    }
    Some(instr)
}

/// CompCov well-known-function hooks (§4.3.1, source: `compcov.h`): counts
/// the common prefix of two bounded byte buffers, producing one coverage id
/// per matching byte keyed off the call's return address.
pub fn compcov_ids(return_address: u64, a: &[u8], b: &[u8]) -> Vec<CoverageId> {
    let n = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
    (0..n).map(|i| splitmix64(return_address).wrapping_add(i as u64)).collect()
}

/// Names CompCov hooks by entry-point symbol, matching §4.3.1's enumerated
/// list of well-known comparison functions.
pub const COMPCOV_HOOK_SYMBOLS: &[&str] = &[
    "strcmp",
    "strncmp",
    "wcscmp",
    "wcsncmp",
    "memcmp",
    "CompareStringA",
    "CompareStringW",
    "CompareStringEx",
    "RtlCompareMemory",
];
