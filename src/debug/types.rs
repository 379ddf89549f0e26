//! Common types for debugging functionality.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Register name -> rendered value
pub type RegisterSnapshot = BTreeMap<String, String>;

/// Breakpoint/watchpoint number, unique per session
pub type BreakpointId = u32;

/// Run state of the inferior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InferiorStatus {
    #[default]
    Stopped,
    Running,
    Detached,
    Exited,
}

impl InferiorStatus {
    pub fn is_running(self) -> bool {
        self == InferiorStatus::Running
    }

    /// Whether control primitives can still be issued
    pub fn is_alive(self) -> bool {
        matches!(self, InferiorStatus::Stopped | InferiorStatus::Running)
    }
}

/// Access class a watchpoint triggers on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchpointKind {
    #[default]
    Write,
    Read,
    Access,
}

/// Why the inferior stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopEvent {
    /// Software breakpoint hit; `address` is the breakpoint address
    Breakpoint { id: BreakpointId, address: u64 },
    /// Watchpoint triggered; `pc` is the instruction after the access
    Watchpoint { id: BreakpointId, pc: u64 },
    /// Interrupted or stopped by another signal
    Signal { signal: i32, pc: u64 },
    /// Process is gone
    Exited { code: i32 },
}

/// Register groups that can be collected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterClass {
    General,
    Flags,
    Segment,
    Float,
}

/// Which register classes to collect into a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegisterSelection {
    pub general: bool,
    pub flags: bool,
    pub segment: bool,
    pub float: bool,
}

impl RegisterSelection {
    /// General, flag and segment registers
    pub const CPU: Self = Self {
        general: true,
        flags: true,
        segment: true,
        float: false,
    };

    pub const NONE: Self = Self {
        general: false,
        flags: false,
        segment: false,
        float: false,
    };

    pub fn is_empty(&self) -> bool {
        !(self.general || self.flags || self.segment || self.float)
    }

    /// Selected classes, in collection order
    pub fn classes(&self) -> Vec<RegisterClass> {
        let mut classes = Vec::new();
        if self.general {
            classes.push(RegisterClass::General);
        }
        if self.flags {
            classes.push(RegisterClass::Flags);
        }
        if self.segment {
            classes.push(RegisterClass::Segment);
        }
        if self.float {
            classes.push(RegisterClass::Float);
        }
        classes
    }
}

/// CPU register state (x64)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ss: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

/// (name, bit) of each rflags bit exposed as a flag register
const FLAG_BITS: [(&str, u32); 9] = [
    ("cf", 0),
    ("pf", 2),
    ("af", 4),
    ("zf", 6),
    ("sf", 7),
    ("tf", 8),
    ("if", 9),
    ("df", 10),
    ("of", 11),
];

impl RegisterState {
    fn general(&self) -> [(&'static str, u64); 17] {
        [
            ("rax", self.rax),
            ("rbx", self.rbx),
            ("rcx", self.rcx),
            ("rdx", self.rdx),
            ("rsi", self.rsi),
            ("rdi", self.rdi),
            ("rbp", self.rbp),
            ("rsp", self.rsp),
            ("r8", self.r8),
            ("r9", self.r9),
            ("r10", self.r10),
            ("r11", self.r11),
            ("r12", self.r12),
            ("r13", self.r13),
            ("r14", self.r14),
            ("r15", self.r15),
            ("rip", self.rip),
        ]
    }

    fn segments(&self) -> [(&'static str, u64); 6] {
        [
            ("cs", self.cs),
            ("ss", self.ss),
            ("ds", self.ds),
            ("es", self.es),
            ("fs", self.fs),
            ("gs", self.gs),
        ]
    }

    /// Look a register up by name. Accepts 64-bit names, their 32-bit
    /// halves (`eax`, `r8d`), and the `pc`/`sp`/`fp` aliases.
    pub fn get(&self, name: &str) -> Option<u64> {
        let name = name.to_ascii_lowercase();
        let alias = match name.as_str() {
            "pc" => "rip",
            "sp" => "rsp",
            "fp" => "rbp",
            "eflags" => "rflags",
            other => other,
        };
        if alias == "rflags" {
            return Some(self.rflags);
        }
        if let Some((_, value)) = self
            .general()
            .iter()
            .chain(self.segments().iter())
            .find(|(n, _)| *n == alias)
        {
            return Some(*value);
        }
        if let Some((_, bit)) = FLAG_BITS.iter().find(|(n, _)| *n == alias) {
            return Some((self.rflags >> bit) & 1);
        }

        // 32-bit views
        let wide = if let Some(rest) = alias.strip_prefix('e') {
            format!("r{}", rest)
        } else if let Some(num) = alias.strip_suffix('d') {
            num.to_string()
        } else {
            return None;
        };
        self.general()
            .iter()
            .find(|(n, _)| *n == wide)
            .map(|(_, value)| value & 0xffff_ffff)
    }

    /// Render one register class
    pub fn snapshot(&self, class: RegisterClass) -> RegisterSnapshot {
        let hex = |(name, value): &(&str, u64)| (name.to_string(), format!("{:#x}", value));
        match class {
            RegisterClass::General => self.general().iter().map(hex).collect(),
            RegisterClass::Segment => self.segments().iter().map(hex).collect(),
            RegisterClass::Flags => FLAG_BITS
                .iter()
                .map(|(name, bit)| (name.to_string(), ((self.rflags >> bit) & 1).to_string()))
                .collect(),
            RegisterClass::Float => RegisterSnapshot::new(),
        }
    }
}

/// x87 and SSE register state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatRegisterState {
    /// st0-st7, 80-bit extended precision, little endian
    pub st: Vec<[u8; 10]>,
    /// xmm0-xmm15, little endian
    pub xmm: Vec<[u8; 16]>,
}

impl FloatRegisterState {
    pub fn snapshot(&self) -> RegisterSnapshot {
        let mut out = RegisterSnapshot::new();
        for (i, raw) in self.st.iter().enumerate() {
            out.insert(format!("st{}", i), extended_to_f64(raw).to_string());
        }
        for (i, raw) in self.xmm.iter().enumerate() {
            let be: Vec<u8> = raw.iter().rev().copied().collect();
            out.insert(format!("xmm{}", i), format!("0x{}", hex::encode(be)));
        }
        out
    }
}

/// Convert an x87 80-bit extended value to the nearest f64
pub fn extended_to_f64(raw: &[u8; 10]) -> f64 {
    let mut mantissa_bytes = [0u8; 8];
    mantissa_bytes.copy_from_slice(&raw[..8]);
    let mantissa = u64::from_le_bytes(mantissa_bytes);
    let sign_exp = u16::from_le_bytes([raw[8], raw[9]]);
    let negative = sign_exp & 0x8000 != 0;
    let exponent = (sign_exp & 0x7fff) as i32;

    let magnitude = if exponent == 0 && mantissa == 0 {
        0.0
    } else if exponent == 0x7fff {
        if mantissa << 1 == 0 {
            f64::INFINITY
        } else {
            f64::NAN
        }
    } else {
        // Explicit integer bit: value = mantissa * 2^(exponent - 16383 - 63)
        let exponent = if exponent == 0 { 1 } else { exponent };
        (mantissa as f64) * 2f64.powi(exponent - 16383 - 63)
    };

    if negative {
        -magnitude
    } else {
        magnitude
    }
}
