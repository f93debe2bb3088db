//! `regs.json` deserialization: every integer field is a 0x-prefixed hex
//! string, matching the source dumper's output format.

use serde::Deserialize;

use crate::{CpuState, CpuStateError, GlobalSegment, Segment, Zmm};

fn parse_hex(field: &'static str, value: &str) -> Result<u64, CpuStateError> {
    let trimmed = value.trim();
    let digits = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X"));
    let result = match digits {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse::<u64>(),
    };
    result.map_err(|_| CpuStateError::InvalidInteger { field, value: value.to_string() })
}

#[derive(Debug, Deserialize)]
struct RawSegment {
    selector: String,
    base: String,
    limit: String,
    attr: String,
    present: bool,
}

impl RawSegment {
    fn into_segment(self, field: &'static str) -> Result<Segment, CpuStateError> {
        Ok(Segment {
            selector: parse_hex(field, &self.selector)? as u16,
            base: parse_hex(field, &self.base)?,
            limit: parse_hex(field, &self.limit)? as u32,
            attr: parse_hex(field, &self.attr)? as u16,
            present: self.present,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawGlobalSegment {
    base: String,
    limit: String,
}

impl RawGlobalSegment {
    fn into_global(self, field: &'static str) -> Result<GlobalSegment, CpuStateError> {
        Ok(GlobalSegment {
            base: parse_hex(field, &self.base)?,
            limit: parse_hex(field, &self.limit)? as u16,
        })
    }
}

/// Raw, not-yet-sanitized view of `regs.json`. All register/segment fields
/// are strings encoding 0x-prefixed integers.
#[derive(Debug, Deserialize)]
pub struct RegsJson {
    #[serde(default)]
    seed: Option<String>,
    rax: String,
    rcx: String,
    rdx: String,
    rbx: String,
    rsp: String,
    rbp: String,
    rsi: String,
    rdi: String,
    r8: String,
    r9: String,
    r10: String,
    r11: String,
    r12: String,
    r13: String,
    r14: String,
    r15: String,
    rip: String,
    rflags: String,

    es: RawSegment,
    cs: RawSegment,
    ss: RawSegment,
    ds: RawSegment,
    fs: RawSegment,
    gs: RawSegment,
    ldtr: RawSegment,
    tr: RawSegment,
    gdtr: RawGlobalSegment,
    idtr: RawGlobalSegment,

    cr0: String,
    cr2: String,
    cr3: String,
    cr4: String,
    cr8: String,
    xcr0: String,

    dr0: String,
    dr1: String,
    dr2: String,
    dr3: String,
    dr6: String,
    dr7: String,

    #[serde(default)]
    zmm: Option<Vec<[String; 8]>>,

    fpcw: String,
    fpsw: String,
    fptw: String,
    fpop: String,
    fpst: [String; 8],

    mxcsr: String,
    #[serde(default, rename = "mxcsr_mask")]
    mxcsr_mask: Option<String>,

    tsc: String,
    efer: String,
    kernel_gs_base: String,
    apic_base: String,
    pat: String,
    sysenter_cs: String,
    sysenter_eip: String,
    sysenter_esp: String,
    star: String,
    lstar: String,
    cstar: String,
    sfmask: String,
    #[serde(default, rename = "tsc_aux")]
    tsc_aux: Option<String>,
}

/// Decode one `fpst[N]` slot, honoring the `"Infinity"`/`"-Infinity"`
/// sentinel that stands in for the FPU empty-stack convention (§3).
fn parse_fpst_slot(value: &str) -> Result<(u64, bool), CpuStateError> {
    if value.contains("Infinity") {
        return Ok((0, true));
    }
    Ok((parse_hex("fpst", value)?, false))
}

impl RegsJson {
    /// Parses the JSON record into a `CpuState` plus whether every `fpst`
    /// slot decoded as the `"Infinity"`/`"-Infinity"` sentinel — the signal
    /// `CpuState::sanitize` needs to apply the §3 empty-stack invariant,
    /// which is distinct from the slots merely parsing to zero.
    pub fn into_cpu_state(self) -> Result<(CpuState, bool), CpuStateError> {
        let mut fpst = [0u64; 8];
        let mut fpu_stack_all_infinity = true;
        for (idx, slot) in self.fpst.iter().enumerate() {
            let (value, infinity) = parse_fpst_slot(slot)?;
            fpst[idx] = value;
            fpu_stack_all_infinity &= infinity;
        }

        let mut zmm = [Zmm::default(); 32];
        if let Some(rows) = &self.zmm {
            for (idx, lanes) in rows.iter().enumerate().take(32) {
                let mut parsed = [0u64; 8];
                for (lane_idx, lane) in lanes.iter().enumerate() {
                    parsed[lane_idx] = parse_hex("zmm", lane)?;
                }
                zmm[idx] = Zmm(parsed);
            }
        }

        let state = CpuState {
            seed: match &self.seed {
                Some(s) => parse_hex("seed", s)?,
                None => 0,
            },
            rax: parse_hex("rax", &self.rax)?,
            rcx: parse_hex("rcx", &self.rcx)?,
            rdx: parse_hex("rdx", &self.rdx)?,
            rbx: parse_hex("rbx", &self.rbx)?,
            rsp: parse_hex("rsp", &self.rsp)?,
            rbp: parse_hex("rbp", &self.rbp)?,
            rsi: parse_hex("rsi", &self.rsi)?,
            rdi: parse_hex("rdi", &self.rdi)?,
            r8: parse_hex("r8", &self.r8)?,
            r9: parse_hex("r9", &self.r9)?,
            r10: parse_hex("r10", &self.r10)?,
            r11: parse_hex("r11", &self.r11)?,
            r12: parse_hex("r12", &self.r12)?,
            r13: parse_hex("r13", &self.r13)?,
            r14: parse_hex("r14", &self.r14)?,
            r15: parse_hex("r15", &self.r15)?,
            rip: parse_hex("rip", &self.rip)?,
            rflags: parse_hex("rflags", &self.rflags)?,

            es: self.es.into_segment("es")?,
            cs: self.cs.into_segment("cs")?,
            ss: self.ss.into_segment("ss")?,
            ds: self.ds.into_segment("ds")?,
            fs: self.fs.into_segment("fs")?,
            gs: self.gs.into_segment("gs")?,
            ldtr: self.ldtr.into_segment("ldtr")?,
            tr: self.tr.into_segment("tr")?,
            gdtr: self.gdtr.into_global("gdtr")?,
            idtr: self.idtr.into_global("idtr")?,

            cr0: crate::Cr0::from_bits_truncate(parse_hex("cr0", &self.cr0)?),
            cr2: parse_hex("cr2", &self.cr2)?,
            cr3: parse_hex("cr3", &self.cr3)?,
            cr4: crate::Cr4::from_bits_truncate(parse_hex("cr4", &self.cr4)?),
            cr8: parse_hex("cr8", &self.cr8)?,
            xcr0: parse_hex("xcr0", &self.xcr0)? as u32,

            dr0: parse_hex("dr0", &self.dr0)?,
            dr1: parse_hex("dr1", &self.dr1)?,
            dr2: parse_hex("dr2", &self.dr2)?,
            dr3: parse_hex("dr3", &self.dr3)?,
            dr6: parse_hex("dr6", &self.dr6)? as u32,
            dr7: parse_hex("dr7", &self.dr7)? as u32,

            zmm,

            fpcw: parse_hex("fpcw", &self.fpcw)? as u16,
            fpsw: parse_hex("fpsw", &self.fpsw)? as u16,
            fptw: parse_hex("fptw", &self.fptw)? as u16,
            fpop: parse_hex("fpop", &self.fpop)? as u16,
            fpst,

            mxcsr: parse_hex("mxcsr", &self.mxcsr)? as u32,
            mxcsr_mask: match &self.mxcsr_mask {
                Some(s) => parse_hex("mxcsr_mask", s)? as u32,
                None => 0,
            },

            tsc: parse_hex("tsc", &self.tsc)?,
            efer: crate::Efer::from_bits_truncate(parse_hex("efer", &self.efer)?),
            kernel_gs_base: parse_hex("kernel_gs_base", &self.kernel_gs_base)?,
            apic_base: parse_hex("apic_base", &self.apic_base)?,
            pat: parse_hex("pat", &self.pat)?,
            sysenter_cs: parse_hex("sysenter_cs", &self.sysenter_cs)?,
            sysenter_eip: parse_hex("sysenter_eip", &self.sysenter_eip)?,
            sysenter_esp: parse_hex("sysenter_esp", &self.sysenter_esp)?,
            star: parse_hex("star", &self.star)?,
            lstar: parse_hex("lstar", &self.lstar)?,
            cstar: parse_hex("cstar", &self.cstar)?,
            sfmask: parse_hex("sfmask", &self.sfmask)?,
            tsc_aux: match &self.tsc_aux {
                Some(s) => parse_hex("tsc_aux", s)?,
                None => 0,
            },
        };

        Ok((state, fpu_stack_all_infinity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> String {
        r#"{
            "rax": "0x3", "rcx": "0x0", "rdx": "0x0", "rbx": "0x0",
            "rsp": "0x0", "rbp": "0x0", "rsi": "0x0", "rdi": "0x0",
            "r8": "0x0", "r9": "0x0", "r10": "0x0", "r11": "0xffffa8848825e000",
            "r12": "0x0", "r13": "0x0", "r14": "0x0", "r15": "0x0",
            "rip": "0xfffff8048825e000", "rflags": "0x244",
            "es": {"selector": "0x0", "base": "0x0", "limit": "0x0", "attr": "0x0", "present": false},
            "cs": {"selector": "0x10", "base": "0x0", "limit": "0xffffffff", "attr": "0xa09b", "present": true},
            "ss": {"selector": "0x18", "base": "0x0", "limit": "0xffffffff", "attr": "0xc093", "present": true},
            "ds": {"selector": "0x0", "base": "0x0", "limit": "0x0", "attr": "0x0", "present": false},
            "fs": {"selector": "0x53", "base": "0x0", "limit": "0x0", "attr": "0x0", "present": false},
            "gs": {"selector": "0x0", "base": "0x0", "limit": "0x0", "attr": "0x0", "present": false},
            "ldtr": {"selector": "0x0", "base": "0x0", "limit": "0x0", "attr": "0x0", "present": false},
            "tr": {"selector": "0x40", "base": "0x0", "limit": "0x67", "attr": "0x8b", "present": true},
            "gdtr": {"base": "0x0", "limit": "0x0"},
            "idtr": {"base": "0x0", "limit": "0x0"},
            "cr0": "0x80050033", "cr2": "0x0", "cr3": "0x1ab000", "cr4": "0x370678", "cr8": "0x0",
            "xcr0": "0x7",
            "dr0": "0x0", "dr1": "0x0", "dr2": "0x0", "dr3": "0x0", "dr6": "0x0", "dr7": "0x0",
            "fpcw": "0x27f", "fpsw": "0x0", "fptw": "0x0", "fpop": "0x0",
            "fpst": ["Infinity", "Infinity", "Infinity", "Infinity", "Infinity", "Infinity", "Infinity", "Infinity"],
            "mxcsr": "0x1f80", "mxcsr_mask": "0x0",
            "tsc": "0x0", "efer": "0xd01", "kernel_gs_base": "0x0", "apic_base": "0xfee00900",
            "pat": "0x7040600070406", "sysenter_cs": "0x0", "sysenter_eip": "0x0", "sysenter_esp": "0x0",
            "star": "0x0", "lstar": "0x0", "cstar": "0x0", "sfmask": "0x0"
        }"#
        .to_string()
    }

    #[test]
    fn parses_s2_scenario_registers() {
        let state = CpuState::from_json_str(&sample_json()).unwrap();
        assert_eq!(state.rax, 0x3);
        assert_eq!(state.r11, 0xffffa8848825e000);
    }

    #[test]
    fn applies_invariants_after_parsing() {
        let state = CpuState::from_json_str(&sample_json()).unwrap();
        assert_eq!(state.mxcsr_mask, crate::DEFAULT_MXCSR_MASK);
        assert_eq!(state.fptw, crate::FPTW_EMPTY_STACK);
        assert_eq!(state.fpst, [0u64; 8]);
    }

    #[test]
    fn rejects_malformed_integer_literal() {
        let bad = sample_json().replace(r#""rax": "0x3""#, r#""rax": "not-a-number""#);
        let err = CpuState::from_json_str(&bad).unwrap_err();
        assert!(matches!(err, CpuStateError::InvalidInteger { .. }));
    }
}
