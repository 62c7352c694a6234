// Execution semantics for both instruction sets. Thumb opcodes share the
// semantics of their ARM counterparts, so the parser folds them onto the same
// variants and everything funnels through one execute.

use crate::conversions::SignExtend;
use crate::fields::{
    add_with_carry, logical_flags, multiplier_cycles, psr_field_mask, sub_with_carry, Access,
    AluOp, Condition, Exception, Fetch, HalfOp, Mode, Offset, Operand, ShiftBy,
};
use crate::memory::Bus;
use crate::processor::{Flag, CPU, LR, PC};

pub enum Instruction {
    DataProcessing { op: AluOp, rd: usize, rn: usize, op2: Operand, set_flags: bool },
    Multiply { accumulate: bool, set_flags: bool, rd: usize, rn: usize, rs: usize, rm: usize },
    MultiplyLong {
        signed: bool,
        accumulate: bool,
        set_flags: bool,
        rdhi: usize,
        rdlo: usize,
        rs: usize,
        rm: usize,
    },
    Mrs { rd: usize, spsr: bool },
    Msr { spsr: bool, fields: u32, op2: Operand },
    SingleTransfer {
        load: bool,
        byte: bool,
        pre: bool,
        up: bool,
        writeback: bool,
        rd: usize,
        rn: usize,
        offset: Offset,
    },
    HalfwordTransfer {
        op: HalfOp,
        pre: bool,
        up: bool,
        writeback: bool,
        rd: usize,
        rn: usize,
        offset: Offset,
    },
    Swap { byte: bool, rd: usize, rm: usize, rn: usize },
    BlockTransfer {
        load: bool,
        pre: bool,
        up: bool,
        writeback: bool,
        user_bank: bool,
        rn: usize,
        register_list: u16,
    },
    Branch { link: bool, offset: i32 },
    BranchExchange { link: bool, rm: usize },
    LongBranchPrefix { offset: i32 },
    LongBranchSuffix { offset: u32 },
    SoftwareInterrupt { comment: u32 },
    Undefined { opcode: u32 },
}

impl Instruction {
    pub fn execute(&self, cpu: &mut CPU, bus: &mut Bus) -> Fetch {
        match *self {
            Self::DataProcessing { op, rd, rn, op2, set_flags } => {
                data_processing(cpu, bus, op, rd, rn, op2, set_flags)
            }
            Self::Multiply { accumulate, set_flags, rd, rn, rs, rm } => {
                let rs_val = cpu.get(rs);
                let mut result = cpu.get(rm).wrapping_mul(rs_val);
                let mut internal = multiplier_cycles(rs_val, true);
                if accumulate {
                    result = result.wrapping_add(cpu.get(rn));
                    internal += 1;
                }
                cpu.set(rd, result);
                if set_flags {
                    cpu.set_flag(Flag::N, result >> 31 != 0);
                    cpu.set_flag(Flag::Z, result == 0);
                }
                for _ in 0..internal {
                    bus.idle();
                }
                Fetch::NonSequential
            }
            Self::MultiplyLong { signed, accumulate, set_flags, rdhi, rdlo, rs, rm } => {
                let rs_val = cpu.get(rs);
                let mut result = if signed {
                    (cpu.get(rm) as i32 as i64).wrapping_mul(rs_val as i32 as i64) as u64
                } else {
                    (cpu.get(rm) as u64).wrapping_mul(rs_val as u64)
                };
                let mut internal = multiplier_cycles(rs_val, signed) + 1;
                if accumulate {
                    let acc = (cpu.get(rdhi) as u64) << 32 | cpu.get(rdlo) as u64;
                    result = result.wrapping_add(acc);
                    internal += 1;
                }
                cpu.set(rdhi, (result >> 32) as u32);
                cpu.set(rdlo, result as u32);
                if set_flags {
                    cpu.set_flag(Flag::N, result >> 63 != 0);
                    cpu.set_flag(Flag::Z, result == 0);
                }
                for _ in 0..internal {
                    bus.idle();
                }
                Fetch::NonSequential
            }
            Self::Mrs { rd, spsr } => {
                let value = if spsr { cpu.spsr() } else { cpu.cpsr };
                cpu.set(rd, value);
                Fetch::Sequential
            }
            Self::Msr { spsr, fields, op2 } => {
                let (value, _, _) = shifter_operand(cpu, op2);
                let mut mask = psr_field_mask(fields);
                if cpu.mode() == Mode::User {
                    // user code may only touch the flag byte
                    mask &= 0xff00_0000;
                }
                if spsr {
                    let updated = (cpu.spsr() & !mask) | (value & mask);
                    cpu.set_spsr(updated);
                } else {
                    let mut updated = (cpu.cpsr & !mask) | (value & mask);
                    // the T bit cannot be rewritten through MSR
                    updated = (updated & !0x20) | (cpu.cpsr & 0x20);
                    match Mode::from_bits(updated) {
                        Some(mode) => {
                            cpu.switch_mode(mode);
                            cpu.cpsr = updated;
                        }
                        None => {
                            log::warn!("MSR with invalid mode bits {:02x} ignored", updated & 0x1f);
                            cpu.cpsr = (updated & !0x1f) | (cpu.cpsr & 0x1f);
                        }
                    }
                }
                Fetch::Sequential
            }
            Self::SingleTransfer { load, byte, pre, up, writeback, rd, rn, offset } => {
                single_transfer(cpu, bus, load, byte, pre, up, writeback, rd, rn, offset)
            }
            Self::HalfwordTransfer { op, pre, up, writeback, rd, rn, offset } => {
                halfword_transfer(cpu, bus, op, pre, up, writeback, rd, rn, offset)
            }
            Self::Swap { byte, rd, rm, rn } => {
                let address = cpu.get(rn);
                let rm_val = cpu.get(rm);
                if byte {
                    let data = bus.read8(address, Access::NonSequential) as u32;
                    bus.write8(address, rm_val as u8, Access::NonSequential);
                    cpu.set(rd, data);
                } else {
                    // reads come back rotated, the write goes out unrotated
                    let data = bus.read32(address, Access::NonSequential);
                    bus.write32(address, rm_val, Access::NonSequential);
                    cpu.set(rd, data);
                }
                bus.idle();
                Fetch::NonSequential
            }
            Self::BlockTransfer { load, pre, up, writeback, user_bank, rn, register_list } => {
                block_transfer(cpu, bus, load, pre, up, writeback, user_bank, rn, register_list)
            }
            Self::Branch { link, offset } => {
                let width = if cpu.thumb() { 2 } else { 4 };
                if link {
                    cpu.set(LR, cpu.regs[PC].wrapping_sub(width));
                }
                let target = (cpu.regs[PC] as i64 + offset as i64) as u32;
                cpu.set(PC, target);
                Fetch::Branch
            }
            Self::BranchExchange { link, rm } => {
                let target = cpu.get(rm);
                if link {
                    let width = if cpu.thumb() { 2 } else { 4 };
                    cpu.set(LR, cpu.regs[PC].wrapping_sub(width));
                }
                cpu.set_flag(Flag::T, target & 1 != 0);
                cpu.set(PC, target);
                Fetch::Branch
            }
            Self::LongBranchPrefix { offset } => {
                let lr = (cpu.regs[PC] as i64 + offset as i64) as u32;
                cpu.set(LR, lr);
                Fetch::Sequential
            }
            Self::LongBranchSuffix { offset } => {
                let target = cpu.get(LR).wrapping_add(offset << 1);
                let ret = cpu.regs[PC].wrapping_sub(4) | 1;
                cpu.set(PC, target);
                cpu.set(LR, ret);
                Fetch::Branch
            }
            Self::SoftwareInterrupt { comment: _ } => {
                let width = if cpu.thumb() { 2 } else { 4 };
                let ret = cpu.regs[PC].wrapping_sub(width);
                cpu.exception(Exception::Swi, ret);
                Fetch::Branch
            }
            Self::Undefined { opcode } => {
                log::warn!("undefined opcode {:08x}", opcode);
                let width = if cpu.thumb() { 2 } else { 4 };
                let ret = cpu.regs[PC].wrapping_sub(width);
                cpu.exception(Exception::Undefined, ret);
                bus.idle();
                Fetch::Branch
            }
        }
    }

    pub fn as_asm(&self, condition: Condition) -> String {
        let cc = condition.as_asm();
        match *self {
            Self::DataProcessing { op, rd, rn, op2, set_flags } => {
                let s = if set_flags && op.writes_result() { "s" } else { "" };
                match op {
                    AluOp::MOV | AluOp::MVN => {
                        format!("{}{}{} r{}, {}", op.as_asm(), cc, s, rd, op2.as_asm())
                    }
                    AluOp::TST | AluOp::TEQ | AluOp::CMP | AluOp::CMN => {
                        format!("{}{} r{}, {}", op.as_asm(), cc, rn, op2.as_asm())
                    }
                    _ => format!("{}{}{} r{}, r{}, {}", op.as_asm(), cc, s, rd, rn, op2.as_asm()),
                }
            }
            Self::Multiply { accumulate, set_flags, rd, rn, rs, rm } => {
                let s = if set_flags { "s" } else { "" };
                if accumulate {
                    format!("mla{}{} r{}, r{}, r{}, r{}", cc, s, rd, rm, rs, rn)
                } else {
                    format!("mul{}{} r{}, r{}, r{}", cc, s, rd, rm, rs)
                }
            }
            Self::MultiplyLong { signed, accumulate, set_flags, rdhi, rdlo, rs, rm } => {
                let mnemonic = match (signed, accumulate) {
                    (false, false) => "umull",
                    (false, true) => "umlal",
                    (true, false) => "smull",
                    (true, true) => "smlal",
                };
                let s = if set_flags { "s" } else { "" };
                format!("{}{}{} r{}, r{}, r{}, r{}", mnemonic, cc, s, rdlo, rdhi, rm, rs)
            }
            Self::Mrs { rd, spsr } => {
                format!("mrs{} r{}, {}", cc, rd, if spsr { "spsr" } else { "cpsr" })
            }
            Self::Msr { spsr, fields: _, op2 } => {
                format!("msr{} {}, {}", cc, if spsr { "spsr" } else { "cpsr" }, op2.as_asm())
            }
            Self::SingleTransfer { load, byte, pre, up, writeback, rd, rn, offset } => {
                let mnemonic = if load { "ldr" } else { "str" };
                let b = if byte { "b" } else { "" };
                format!(
                    "{}{}{} r{}, {}",
                    mnemonic,
                    cc,
                    b,
                    rd,
                    address_asm(rn, &offset, pre, up, writeback)
                )
            }
            Self::HalfwordTransfer { op, pre, up, writeback, rd, rn, offset } => format!(
                "{}{} r{}, {}",
                op.as_asm(),
                cc,
                rd,
                address_asm(rn, &offset, pre, up, writeback)
            ),
            Self::Swap { byte, rd, rm, rn } => {
                format!("swp{}{} r{}, r{}, [r{}]", cc, if byte { "b" } else { "" }, rd, rm, rn)
            }
            Self::BlockTransfer { load, pre, up, writeback, user_bank, rn, register_list } => {
                let mnemonic = if load { "ldm" } else { "stm" };
                let amod = match (up, pre) {
                    (true, false) => "ia",
                    (true, true) => "ib",
                    (false, false) => "da",
                    (false, true) => "db",
                };
                let mut regs = String::new();
                for j in 0..16 {
                    if register_list & (1 << j) != 0 {
                        if !regs.is_empty() {
                            regs.push_str(", ");
                        }
                        regs.push_str(&format!("r{}", j));
                    }
                }
                format!(
                    "{}{}{} r{}{}, {{{}}}{}",
                    mnemonic,
                    cc,
                    amod,
                    rn,
                    if writeback { "!" } else { "" },
                    regs,
                    if user_bank { "^" } else { "" }
                )
            }
            Self::Branch { link, offset } => {
                format!("b{}{} pc{:+}", if link { "l" } else { "" }, cc, offset)
            }
            Self::BranchExchange { link, rm } => {
                format!("b{}x{} r{}", if link { "l" } else { "" }, cc, rm)
            }
            Self::LongBranchPrefix { offset } => format!("bl.hi pc{:+}", offset),
            Self::LongBranchSuffix { offset } => format!("bl.lo +{:#x}", offset << 1),
            Self::SoftwareInterrupt { comment } => format!("swi{} {:#x}", cc, comment),
            Self::Undefined { opcode } => format!("dc {:08x}", opcode),
        }
    }
}

/// Evaluate the shifter operand: value, carry out and whether a register
/// specified the shift amount (which costs an internal cycle and makes the PC
/// read ahead by one more fetch).
fn shifter_operand(cpu: &CPU, op2: Operand) -> (u32, bool, bool) {
    match op2 {
        Operand::Immediate { value, rotate } => {
            let result = value.rotate_right(2 * rotate);
            let carry = if rotate == 0 { cpu.flag(Flag::C) } else { result >> 31 != 0 };
            (result, carry, false)
        }
        Operand::Register { rm, shift, by } => match by {
            ShiftBy::Immediate(amount) => {
                let (result, carry) =
                    shift.apply(cpu.get(rm), amount, cpu.flag(Flag::C), false);
                (result, carry, false)
            }
            ShiftBy::Register(rs) => {
                let mut value = cpu.get(rm);
                if rm == PC {
                    // with a register shift the PC reads as current + 12
                    value = value.wrapping_add(4);
                }
                let amount = cpu.get(rs) & 0xff;
                let (result, carry) = shift.apply(value, amount, cpu.flag(Flag::C), true);
                (result, carry, true)
            }
        },
    }
}

fn data_processing(
    cpu: &mut CPU,
    bus: &mut Bus,
    op: AluOp,
    rd: usize,
    rn: usize,
    op2: Operand,
    set_flags: bool,
) -> Fetch {
    let (op2_val, shifter_carry, register_shift) = shifter_operand(cpu, op2);
    let mut rn_val = cpu.get(rn);
    if rn == PC {
        if register_shift {
            rn_val = rn_val.wrapping_add(4);
        }
        if cpu.thumb() {
            // Thumb address generation reads a word aligned PC
            rn_val &= !2;
        }
    }
    let carry = cpu.flag(Flag::C) as u32;
    let (result, flags) = match op {
        AluOp::AND | AluOp::TST => {
            let result = rn_val & op2_val;
            (result, logical_flags(result, shifter_carry))
        }
        AluOp::EOR | AluOp::TEQ => {
            let result = rn_val ^ op2_val;
            (result, logical_flags(result, shifter_carry))
        }
        AluOp::SUB | AluOp::CMP => sub_with_carry(rn_val, op2_val, 1),
        AluOp::RSB => sub_with_carry(op2_val, rn_val, 1),
        AluOp::ADD | AluOp::CMN => add_with_carry(rn_val, op2_val, 0),
        AluOp::ADC => add_with_carry(rn_val, op2_val, carry),
        AluOp::SBC => sub_with_carry(rn_val, op2_val, carry),
        AluOp::RSC => sub_with_carry(op2_val, rn_val, carry),
        AluOp::ORR => {
            let result = rn_val | op2_val;
            (result, logical_flags(result, shifter_carry))
        }
        AluOp::MOV => (op2_val, logical_flags(op2_val, shifter_carry)),
        AluOp::BIC => {
            let result = rn_val & !op2_val;
            (result, logical_flags(result, shifter_carry))
        }
        AluOp::MVN => (!op2_val, logical_flags(!op2_val, shifter_carry)),
    };
    let branches = rd == PC && op.writes_result();
    if branches && set_flags {
        // the standard return-from-exception form restores CPSR first so the
        // PC write aligns for the restored state
        cpu.restore_cpsr();
        cpu.set(PC, result);
    } else {
        if op.writes_result() {
            cpu.set(rd, result);
        }
        if set_flags {
            flags.set(cpu);
        }
    }
    if register_shift {
        bus.idle();
    }
    if branches {
        Fetch::Branch
    } else if register_shift {
        Fetch::NonSequential
    } else {
        Fetch::Sequential
    }
}

fn offset_value(cpu: &CPU, offset: Offset) -> u32 {
    match offset {
        Offset::Immediate(value) => value,
        Offset::Register { rm, shift, amount } => {
            shift.apply(cpu.get(rm), amount, cpu.flag(Flag::C), false).0
        }
    }
}

fn single_transfer(
    cpu: &mut CPU,
    bus: &mut Bus,
    load: bool,
    byte: bool,
    pre: bool,
    up: bool,
    writeback: bool,
    rd: usize,
    rn: usize,
    offset: Offset,
) -> Fetch {
    let mut base = cpu.get(rn);
    if rn == PC && cpu.thumb() {
        base &= !2;
    }
    let offset_val = offset_value(cpu, offset);
    let indexed = if up { base.wrapping_add(offset_val) } else { base.wrapping_sub(offset_val) };
    let address = if pre { indexed } else { base };
    if load {
        if !pre {
            cpu.set(rn, indexed);
        } else if writeback {
            cpu.set(rn, indexed);
        }
        let value = if byte {
            bus.read8(address, Access::NonSequential) as u32
        } else {
            bus.read32(address, Access::NonSequential)
        };
        // a load into the base register beats the writeback
        cpu.set(rd, value);
        bus.idle();
        if rd == PC {
            Fetch::Branch
        } else {
            Fetch::NonSequential
        }
    } else {
        let mut value = cpu.get(rd);
        if rd == PC {
            // stores of the PC drive current + 12 onto the bus
            value = value.wrapping_add(4);
        }
        if !pre || writeback {
            cpu.set(rn, indexed);
        }
        if byte {
            bus.write8(address, value as u8, Access::NonSequential);
        } else {
            bus.write32(address, value, Access::NonSequential);
        }
        Fetch::NonSequential
    }
}

fn halfword_transfer(
    cpu: &mut CPU,
    bus: &mut Bus,
    op: HalfOp,
    pre: bool,
    up: bool,
    writeback: bool,
    rd: usize,
    rn: usize,
    offset: Offset,
) -> Fetch {
    let base = cpu.get(rn);
    let offset_val = offset_value(cpu, offset);
    let indexed = if up { base.wrapping_add(offset_val) } else { base.wrapping_sub(offset_val) };
    let address = if pre { indexed } else { base };
    if !pre || writeback {
        cpu.set(rn, indexed);
    }
    let load = op != HalfOp::StoreHalf;
    match op {
        HalfOp::StoreHalf => {
            let mut value = cpu.get(rd);
            if rd == PC {
                value = value.wrapping_add(4);
            }
            bus.write16(address, value as u16, Access::NonSequential);
        }
        HalfOp::LoadHalf => {
            let value = bus.read16(address, Access::NonSequential);
            cpu.set(rd, value);
            bus.idle();
        }
        HalfOp::LoadSignedByte => {
            let value = bus.read8(address, Access::NonSequential);
            cpu.set(rd, value.sign_extend());
            bus.idle();
        }
        HalfOp::LoadSignedHalf => {
            // from an odd address this degenerates to a sign extended byte load
            let value = if address & 1 != 0 {
                bus.read8(address, Access::NonSequential).sign_extend()
            } else {
                (bus.read16(address, Access::NonSequential) as u16).sign_extend()
            };
            cpu.set(rd, value);
            bus.idle();
        }
    }
    if rd == PC && load {
        Fetch::Branch
    } else {
        Fetch::NonSequential
    }
}

fn block_transfer(
    cpu: &mut CPU,
    bus: &mut Bus,
    load: bool,
    pre: bool,
    up: bool,
    writeback: bool,
    user_bank: bool,
    rn: usize,
    register_list: u16,
) -> Fetch {
    let base = cpu.get(rn);
    let mut list = register_list;
    let mut writeback = writeback;
    if list == 0 {
        // empty list: R15 transfers and the base moves by a full block
        list = 0x8000;
        writeback = false;
        cpu.set(rn, if up { base.wrapping_add(0x40) } else { base.wrapping_sub(0x40) });
    }
    // with the S bit, the user bank is transferred, unless this is an LDM
    // that also reloads the PC (the mode-restore form)
    let use_user = user_bank && !(load && list & 0x8000 != 0);
    let count = list.count_ones();
    let lowest = list.trailing_zeros() as usize;
    // transfers always walk addresses upwards from the lowest slot
    let bottom = if up { base } else { base.wrapping_sub(4 * count) };
    let start = if pre == up { bottom.wrapping_add(4) } else { bottom };
    let final_base = if up { base.wrapping_add(4 * count) } else { base.wrapping_sub(4 * count) };
    let mut address = start;
    let mut first = true;
    let mut base_slot: Option<u32> = None;
    for reg in 0..16 {
        if list & (1 << reg) == 0 {
            continue;
        }
        let access = if first { Access::NonSequential } else { Access::Sequential };
        if load {
            let data = bus.read32(address & !3, access);
            if use_user {
                cpu.set_user(reg, data);
            } else {
                cpu.set(reg, data);
            }
            if reg == rn {
                // base in the list suppresses the writeback on a load
                writeback = false;
            }
        } else {
            if reg == rn {
                base_slot = Some(address);
            }
            let mut data = if use_user { cpu.get_user(reg) } else { cpu.get(reg) };
            if reg == PC {
                data = data.wrapping_add(4);
            }
            bus.write32(address & !3, data, access);
        }
        first = false;
        address = address.wrapping_add(4);
    }
    if writeback {
        if !load {
            if let Some(slot) = base_slot {
                if rn != lowest {
                    // base stored anywhere but first picks up the written back value
                    bus.write32(slot & !3, final_base, Access::Sequential);
                }
            }
        }
        cpu.set(rn, final_base);
    }
    let restores_cpsr = user_bank && load && list & 0x8000 != 0;
    if restores_cpsr {
        cpu.restore_cpsr();
        // realign the already loaded PC for the restored state
        let pc = cpu.regs[PC];
        cpu.set(PC, pc);
    }
    if load {
        bus.idle();
    }
    if load && list & 0x8000 != 0 {
        Fetch::Branch
    } else {
        Fetch::NonSequential
    }
}

fn address_asm(rn: usize, offset: &Offset, pre: bool, up: bool, writeback: bool) -> String {
    let sign = if up { "" } else { "-" };
    if pre {
        format!(
            "[r{}, {}{}]{}",
            rn,
            sign,
            offset.as_asm(),
            if writeback { "!" } else { "" }
        )
    } else {
        format!("[r{}], {}{}", rn, sign, offset.as_asm())
    }
}
