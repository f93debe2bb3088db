//! Shared `regs.json` fixture for this crate's own tests.

pub fn sample_regs_json() -> String {
    r#"{
        "rax": "0x3", "rcx": "0x0", "rdx": "0x0", "rbx": "0x0",
        "rsp": "0x0", "rbp": "0x0", "rsi": "0x0", "rdi": "0x0",
        "r8": "0x0", "r9": "0x0", "r10": "0x0", "r11": "0x0",
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
