// Here reside the definitions of instruction fields; rather than have magic numbers
// everywhere, we opt for rich types wherever it is not too ridiculous.
// The parser is the naturally messy code responsible for constructing said rich types.

use crate::processor::{Flag, CPU};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Size {
    Byte = 1,
    Half = 2,
    Word = 4,
}

impl Size {
    pub fn mask(&self) -> u32 {
        match *self {
            Self::Byte => 0xff,
            Self::Half => 0xffff,
            Self::Word => 0xffff_ffff,
        }
    }
    pub fn align(&self, address: u32) -> u32 {
        address & !(*self as u32 - 1)
    }
}

/// Bus access classification, used solely for wait state accounting.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Access {
    Sequential,
    NonSequential,
    Internal,
}

/// What the front end should charge for the next instruction fetch.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Fetch {
    Sequential,
    NonSequential,
    Branch,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Condition {
    EQ = 0,
    NE = 1,
    CS = 2,
    CC = 3,
    MI = 4,
    PL = 5,
    VS = 6,
    VC = 7,
    HI = 8,
    LS = 9,
    GE = 10,
    LT = 11,
    GT = 12,
    LE = 13,
    AL = 14,
    NV = 15,
}

impl Condition {
    pub fn from(condition: u32) -> Self {
        match condition {
            0 => Self::EQ,
            1 => Self::NE,
            2 => Self::CS,
            3 => Self::CC,
            4 => Self::MI,
            5 => Self::PL,
            6 => Self::VS,
            7 => Self::VC,
            8 => Self::HI,
            9 => Self::LS,
            10 => Self::GE,
            11 => Self::LT,
            12 => Self::GT,
            13 => Self::LE,
            14 => Self::AL,
            _ => Self::NV,
        }
    }
    pub fn evaluate(&self, cpu: &CPU) -> bool {
        match *self {
            Self::EQ => cpu.flag(Flag::Z),
            Self::NE => !cpu.flag(Flag::Z),
            Self::CS => cpu.flag(Flag::C),
            Self::CC => !cpu.flag(Flag::C),
            Self::MI => cpu.flag(Flag::N),
            Self::PL => !cpu.flag(Flag::N),
            Self::VS => cpu.flag(Flag::V),
            Self::VC => !cpu.flag(Flag::V),
            Self::HI => cpu.flag(Flag::C) && !cpu.flag(Flag::Z),
            Self::LS => !cpu.flag(Flag::C) || cpu.flag(Flag::Z),
            Self::GE => cpu.flag(Flag::N) == cpu.flag(Flag::V),
            Self::LT => cpu.flag(Flag::N) != cpu.flag(Flag::V),
            Self::GT => !cpu.flag(Flag::Z) && (cpu.flag(Flag::N) == cpu.flag(Flag::V)),
            Self::LE => cpu.flag(Flag::Z) || (cpu.flag(Flag::N) != cpu.flag(Flag::V)),
            Self::AL => true,
            // NV is reserved on ARMv4; treated as never executing.
            Self::NV => false,
        }
    }
    pub fn as_asm(&self) -> String {
        match *self {
            Self::EQ => String::from("eq"),
            Self::NE => String::from("ne"),
            Self::CS => String::from("cs"),
            Self::CC => String::from("cc"),
            Self::MI => String::from("mi"),
            Self::PL => String::from("pl"),
            Self::VS => String::from("vs"),
            Self::VC => String::from("vc"),
            Self::HI => String::from("hi"),
            Self::LS => String::from("ls"),
            Self::GE => String::from("ge"),
            Self::LT => String::from("lt"),
            Self::GT => String::from("gt"),
            Self::LE => String::from("le"),
            Self::AL => String::new(),
            Self::NV => String::from("nv"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ShiftKind {
    LSL = 0,
    LSR = 1,
    ASR = 2,
    ROR = 3,
}

impl ShiftKind {
    pub fn from(bits: u32) -> Self {
        match bits & 3 {
            0 => Self::LSL,
            1 => Self::LSR,
            2 => Self::ASR,
            _ => Self::ROR,
        }
    }
    /// Apply the barrel shifter. `by_register` distinguishes the register-specified
    /// form (where amount 0 leaves value and carry untouched) from the immediate form
    /// (where amount 0 encodes LSR #32, ASR #32 and RRX).
    pub fn apply(&self, value: u32, amount: u32, carry: bool, by_register: bool) -> (u32, bool) {
        if by_register && amount == 0 {
            return (value, carry);
        }
        match *self {
            Self::LSL => match amount {
                0 => (value, carry),
                1..=31 => (value << amount, value & (1 << (32 - amount)) != 0),
                32 => (0, value & 1 != 0),
                _ => (0, false),
            },
            Self::LSR => match amount {
                0 | 32 => (0, value >> 31 != 0),
                1..=31 => (value >> amount, value & (1 << (amount - 1)) != 0),
                _ => (0, false),
            },
            Self::ASR => match amount {
                1..=31 => (
                    ((value as i32) >> amount) as u32,
                    value & (1 << (amount - 1)) != 0,
                ),
                _ => (((value as i32) >> 31) as u32, value >> 31 != 0),
            },
            Self::ROR => {
                if amount == 0 {
                    // RRX: rotate right extended through carry
                    (((carry as u32) << 31) | (value >> 1), value & 1 != 0)
                } else if amount & 31 == 0 {
                    (value, value >> 31 != 0)
                } else {
                    let amount = amount & 31;
                    (
                        value.rotate_right(amount),
                        value & (1 << (amount - 1)) != 0,
                    )
                }
            }
        }
    }
    pub fn as_asm(&self) -> String {
        match *self {
            Self::LSL => String::from("lsl"),
            Self::LSR => String::from("lsr"),
            Self::ASR => String::from("asr"),
            Self::ROR => String::from("ror"),
        }
    }
}

/// The seven recognized privilege modes and their CPSR encodings.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Mode {
    User = 0x10,
    Fiq = 0x11,
    Irq = 0x12,
    Supervisor = 0x13,
    Abort = 0x17,
    Undefined = 0x1b,
    System = 0x1f,
}

impl Mode {
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits & 0x1f {
            0x10 => Some(Self::User),
            0x11 => Some(Self::Fiq),
            0x12 => Some(Self::Irq),
            0x13 => Some(Self::Supervisor),
            0x17 => Some(Self::Abort),
            0x1b => Some(Self::Undefined),
            0x1f => Some(Self::System),
            _ => None,
        }
    }
    /// Index into the banked r13/r14/SPSR stashes. User and System share bank 0.
    pub fn bank(&self) -> usize {
        match *self {
            Self::User | Self::System => 0,
            Self::Fiq => 1,
            Self::Irq => 2,
            Self::Supervisor => 3,
            Self::Abort => 4,
            Self::Undefined => 5,
        }
    }
    pub fn has_spsr(&self) -> bool {
        self.bank() != 0
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::User => "usr",
            Self::Fiq => "fiq",
            Self::Irq => "irq",
            Self::Supervisor => "svc",
            Self::Abort => "abt",
            Self::Undefined => "und",
            Self::System => "sys",
        };
        write!(f, "{}", name)
    }
}

/// Hardware exceptions with their vector addresses and entry modes.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Exception {
    Reset,
    Undefined,
    Swi,
    PrefetchAbort,
    DataAbort,
    Irq,
    Fiq,
}

impl Exception {
    pub fn vector(&self) -> u32 {
        match *self {
            Self::Reset => 0x00,
            Self::Undefined => 0x04,
            Self::Swi => 0x08,
            Self::PrefetchAbort => 0x0c,
            Self::DataAbort => 0x10,
            Self::Irq => 0x18,
            Self::Fiq => 0x1c,
        }
    }
    pub fn mode(&self) -> Mode {
        match *self {
            Self::Reset | Self::Swi => Mode::Supervisor,
            Self::Undefined => Mode::Undefined,
            Self::PrefetchAbort | Self::DataAbort => Mode::Abort,
            Self::Irq => Mode::Irq,
            Self::Fiq => Mode::Fiq,
        }
    }
    pub fn disables_fiq(&self) -> bool {
        match *self {
            Self::Reset | Self::Fiq => true,
            _ => false,
        }
    }
}

/// The sixteen data processing opcodes.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum AluOp {
    AND = 0,
    EOR = 1,
    SUB = 2,
    RSB = 3,
    ADD = 4,
    ADC = 5,
    SBC = 6,
    RSC = 7,
    TST = 8,
    TEQ = 9,
    CMP = 10,
    CMN = 11,
    ORR = 12,
    MOV = 13,
    BIC = 14,
    MVN = 15,
}

impl AluOp {
    pub fn from(bits: u32) -> Self {
        match bits & 0xf {
            0 => Self::AND,
            1 => Self::EOR,
            2 => Self::SUB,
            3 => Self::RSB,
            4 => Self::ADD,
            5 => Self::ADC,
            6 => Self::SBC,
            7 => Self::RSC,
            8 => Self::TST,
            9 => Self::TEQ,
            10 => Self::CMP,
            11 => Self::CMN,
            12 => Self::ORR,
            13 => Self::MOV,
            14 => Self::BIC,
            _ => Self::MVN,
        }
    }
    /// TST/TEQ/CMP/CMN only set flags.
    pub fn writes_result(&self) -> bool {
        match *self {
            Self::TST | Self::TEQ | Self::CMP | Self::CMN => false,
            _ => true,
        }
    }
    pub fn as_asm(&self) -> String {
        match *self {
            Self::AND => String::from("and"),
            Self::EOR => String::from("eor"),
            Self::SUB => String::from("sub"),
            Self::RSB => String::from("rsb"),
            Self::ADD => String::from("add"),
            Self::ADC => String::from("adc"),
            Self::SBC => String::from("sbc"),
            Self::RSC => String::from("rsc"),
            Self::TST => String::from("tst"),
            Self::TEQ => String::from("teq"),
            Self::CMP => String::from("cmp"),
            Self::CMN => String::from("cmn"),
            Self::ORR => String::from("orr"),
            Self::MOV => String::from("mov"),
            Self::BIC => String::from("bic"),
            Self::MVN => String::from("mvn"),
        }
    }
}

/// Shift amount source for the register form of the shifter operand.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ShiftBy {
    Immediate(u32),
    Register(usize),
}

/// The shifter operand of a data processing instruction.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Operand {
    /// 8 bit immediate rotated right by twice the 4 bit rotate field.
    Immediate { value: u32, rotate: u32 },
    Register { rm: usize, shift: ShiftKind, by: ShiftBy },
}

impl Operand {
    pub fn immediate(value: u32) -> Self {
        Self::Immediate { value, rotate: 0 }
    }
    pub fn register(rm: usize) -> Self {
        Self::Register { rm, shift: ShiftKind::LSL, by: ShiftBy::Immediate(0) }
    }
    pub fn as_asm(&self) -> String {
        match *self {
            Self::Immediate { value, rotate } => {
                format!("#0x{:x}", value.rotate_right(2 * rotate))
            }
            Self::Register { rm, shift, by } => match by {
                ShiftBy::Immediate(0) if shift == ShiftKind::LSL => format!("r{}", rm),
                ShiftBy::Immediate(amount) => format!("r{}, {} #{}", rm, shift, amount),
                ShiftBy::Register(rs) => format!("r{}, {} r{}", rm, shift, rs),
            },
        }
    }
}

/// Address offset of the single and halfword transfer families.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Offset {
    Immediate(u32),
    Register { rm: usize, shift: ShiftKind, amount: u32 },
}

impl Offset {
    pub fn as_asm(&self) -> String {
        match *self {
            Self::Immediate(value) => format!("#0x{:x}", value),
            Self::Register { rm, shift: ShiftKind::LSL, amount: 0 } => format!("r{}", rm),
            Self::Register { rm, shift, amount } => format!("r{}, {} #{}", rm, shift, amount),
        }
    }
}

/// Halfword and signed transfer flavors.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum HalfOp {
    LoadHalf,
    StoreHalf,
    LoadSignedByte,
    LoadSignedHalf,
}

impl HalfOp {
    pub fn as_asm(&self) -> String {
        match *self {
            Self::LoadHalf => String::from("ldrh"),
            Self::StoreHalf => String::from("strh"),
            Self::LoadSignedByte => String::from("ldrsb"),
            Self::LoadSignedHalf => String::from("ldrsh"),
        }
    }
}

#[derive(Debug)]
pub struct FlagUpdate {
    pub n: Option<bool>,
    pub z: Option<bool>,
    pub c: Option<bool>,
    pub v: Option<bool>,
}

impl FlagUpdate {
    pub fn new() -> FlagUpdate {
        FlagUpdate { n: None, z: None, c: None, v: None }
    }
    pub fn set(&self, cpu: &mut CPU) {
        if let Some(value) = self.n {
            cpu.set_flag(Flag::N, value)
        };
        if let Some(value) = self.z {
            cpu.set_flag(Flag::Z, value)
        };
        if let Some(value) = self.c {
            cpu.set_flag(Flag::C, value)
        };
        if let Some(value) = self.v {
            cpu.set_flag(Flag::V, value)
        };
    }
}

/// 32 bit addition with carry in, computing the full NZCV set.
pub fn add_with_carry(a: u32, b: u32, carry: u32) -> (u32, FlagUpdate) {
    let mut flags = FlagUpdate::new();
    let wide = a as u64 + b as u64 + carry as u64;
    let result = wide as u32;
    flags.n = Some(result >> 31 != 0);
    flags.z = Some(result == 0);
    flags.c = Some(wide > 0xffff_ffff);
    flags.v = Some((!(a ^ b) & (a ^ result)) >> 31 != 0);
    (result, flags)
}

/// 32 bit subtraction as `a + NOT b + carry`; carry out is NOT borrow.
/// Plain SUB/CMP pass carry = 1, SBC passes the current C flag.
pub fn sub_with_carry(a: u32, b: u32, carry: u32) -> (u32, FlagUpdate) {
    let (result, mut flags) = add_with_carry(a, !b, carry);
    flags.v = Some(((a ^ b) & (a ^ result)) >> 31 != 0);
    (result, flags)
}

/// N and Z for the logical opcodes; C comes from the shifter, V is untouched.
pub fn logical_flags(result: u32, shifter_carry: bool) -> FlagUpdate {
    let mut flags = FlagUpdate::new();
    flags.n = Some(result >> 31 != 0);
    flags.z = Some(result == 0);
    flags.c = Some(shifter_carry);
    flags
}

/// Expand the MSR `_field` nibble (f-s-x-c) into a byte mask over the PSR.
pub fn psr_field_mask(fields: u32) -> u32 {
    let mut mask = 0;
    if fields & 0b1000 != 0 {
        mask |= 0xff00_0000;
    }
    if fields & 0b0100 != 0 {
        mask |= 0x00ff_0000;
    }
    if fields & 0b0010 != 0 {
        mask |= 0x0000_ff00;
    }
    if fields & 0b0001 != 0 {
        mask |= 0x0000_00ff;
    }
    mask
}

/// Multiply timing: leading bytes of Rs that are all zeroes (or all ones for
/// the signed variants) shorten the operation.
pub fn multiplier_cycles(rs: u32, signed: bool) -> u32 {
    for &(m, shift) in [(1u32, 8u32), (2, 16), (3, 24)].iter() {
        let top = rs >> shift;
        if top == 0 || (signed && top == 0xffff_ffff >> shift) {
            return m;
        }
    }
    4
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_asm())
    }
}

impl fmt::Display for ShiftKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_asm())
    }
}
