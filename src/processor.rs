// This is the place for the basic processor implementation: the register file with
// its per-mode banks, status registers, exception entry and the fetch/decode/execute
// step. How memory behaves underneath is the business of the memory module.

use crate::devices::Signal;
use crate::fields::{Access, Exception, Fetch, Mode};
use crate::memory::Bus;
use crate::parser::{parse_arm, parse_thumb};
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::io::prelude::*;
use termion::{clear, color, cursor};

pub const SP: usize = 13;
pub const LR: usize = 14;
pub const PC: usize = 15;

/// CPSR bit positions.
#[derive(Copy, Clone)]
pub enum Flag {
    N = 31,
    Z = 30,
    C = 29,
    V = 28,
    I = 7,
    F = 6,
    T = 5,
}

pub struct CPU {
    pub regs: [u32; 16],     // Currently visible register window
    pub cpsr: u32,           // Current program status register
    spsr: [u32; 6],          // Saved PSR per bank (slot 0 unused)
    banked_r13: [u32; 6],    // Stashed SP per bank
    banked_r14: [u32; 6],    // Stashed LR per bank
    r8_12_user: [u32; 5],    // User-bank r8..r12 while in FIQ
    r8_12_fiq: [u32; 5],     // FIQ-bank r8..r12 while outside FIQ
    pub next_fetch: Fetch,   // Access class of the upcoming instruction fetch
}

impl CPU {
    pub fn new() -> Self {
        CPU {
            regs: [0; 16],
            cpsr: Mode::Supervisor as u32 | (1 << Flag::I as u32) | (1 << Flag::F as u32),
            spsr: [0; 6],
            banked_r13: [0; 6],
            banked_r14: [0; 6],
            r8_12_user: [0; 5],
            r8_12_fiq: [0; 5],
            next_fetch: Fetch::Branch,
        }
    }

    /// Register the CPU as if the boot ROM had already run: System mode, the
    /// conventional stack pointers, execution starting at the cartridge vector.
    pub fn reset_to_rom(&mut self, entry: u32) {
        self.cpsr = Mode::Supervisor as u32 | (1 << Flag::I as u32) | (1 << Flag::F as u32);
        self.banked_r13[Mode::Supervisor.bank()] = 0x0300_7fe0;
        self.banked_r13[Mode::Irq.bank()] = 0x0300_7fa0;
        self.regs[SP] = 0x0300_7fe0;
        self.switch_mode(Mode::System);
        self.regs[SP] = 0x0300_7f00;
        self.set_flag(Flag::I, false);
        self.set_flag(Flag::F, false);
        self.regs[PC] = entry;
        self.next_fetch = Fetch::Branch;
    }

    pub fn flag(&self, flag: Flag) -> bool {
        self.cpsr & (1 << flag as u32) != 0
    }
    pub fn set_flag(&mut self, flag: Flag, value: bool) {
        if value {
            self.cpsr |= 1 << flag as u32;
        } else {
            self.cpsr &= !(1 << flag as u32);
        }
    }
    pub fn thumb(&self) -> bool {
        self.flag(Flag::T)
    }
    pub fn mode(&self) -> Mode {
        debug_assert!(Mode::from_bits(self.cpsr).is_some());
        Mode::from_bits(self.cpsr).unwrap_or(Mode::System)
    }

    pub fn get(&self, register: usize) -> u32 {
        self.regs[register]
    }
    /// Writes to PC are force-aligned to the current instruction width.
    pub fn set(&mut self, register: usize, value: u32) {
        if register == PC {
            self.regs[PC] = if self.thumb() { value & !1 } else { value & !3 };
        } else {
            self.regs[register] = value;
        }
    }

    /// User-bank view regardless of the current mode, for LDM/STM with `^`.
    pub fn get_user(&self, register: usize) -> u32 {
        match register {
            8..=12 if self.mode() == Mode::Fiq => self.r8_12_user[register - 8],
            13 if self.mode().bank() != 0 => self.banked_r13[0],
            14 if self.mode().bank() != 0 => self.banked_r14[0],
            _ => self.regs[register],
        }
    }
    pub fn set_user(&mut self, register: usize, value: u32) {
        match register {
            8..=12 if self.mode() == Mode::Fiq => self.r8_12_user[register - 8] = value,
            13 if self.mode().bank() != 0 => self.banked_r13[0] = value,
            14 if self.mode().bank() != 0 => self.banked_r14[0] = value,
            _ => self.regs[register] = value,
        }
    }

    /// Swap the banked subset between the live window and the stashes.
    pub fn switch_mode(&mut self, new: Mode) {
        let old = self.mode();
        let (ob, nb) = (old.bank(), new.bank());
        if ob != nb {
            self.banked_r13[ob] = self.regs[13];
            self.banked_r14[ob] = self.regs[14];
            self.regs[13] = self.banked_r13[nb];
            self.regs[14] = self.banked_r14[nb];
            if old == Mode::Fiq {
                for j in 0..5 {
                    self.r8_12_fiq[j] = self.regs[8 + j];
                    self.regs[8 + j] = self.r8_12_user[j];
                }
            }
            if new == Mode::Fiq {
                for j in 0..5 {
                    self.r8_12_user[j] = self.regs[8 + j];
                    self.regs[8 + j] = self.r8_12_fiq[j];
                }
            }
        }
        self.cpsr = (self.cpsr & !0x1f) | new as u32;
    }

    pub fn spsr(&self) -> u32 {
        let mode = self.mode();
        if mode.has_spsr() {
            self.spsr[mode.bank()]
        } else {
            self.cpsr
        }
    }
    pub fn set_spsr(&mut self, value: u32) {
        let mode = self.mode();
        if mode.has_spsr() {
            self.spsr[mode.bank()] = value;
        }
    }

    /// Copy the current SPSR back into the CPSR, switching banks along the way.
    /// This is the return-from-exception path of data processing with Rd=PC.
    pub fn restore_cpsr(&mut self) {
        let spsr = self.spsr();
        if let Some(mode) = Mode::from_bits(spsr) {
            self.switch_mode(mode);
        }
        self.cpsr = spsr;
    }

    /// Atomic exception entry: stash CPSR, switch mode, mask interrupts, load
    /// the link register with `lr` and jump through the vector table.
    pub fn exception(&mut self, exception: Exception, lr: u32) {
        let old_cpsr = self.cpsr;
        self.switch_mode(exception.mode());
        self.spsr[exception.mode().bank()] = old_cpsr;
        self.set_flag(Flag::T, false);
        self.set_flag(Flag::I, true);
        if exception.disables_fiq() {
            self.set_flag(Flag::F, true);
        }
        self.regs[LR] = lr;
        self.regs[PC] = exception.vector();
        self.next_fetch = Fetch::Branch;
    }

    /// Take a pending IRQ at the instruction boundary, if the controller asserts
    /// one and the CPSR does not mask it. Returns whether the exception was taken.
    pub fn serve_interrupt_requests(&mut self, bus: &mut Bus) -> bool {
        if !self.flag(Flag::I) && bus.irq_pending() {
            let lr = self.regs[PC].wrapping_add(4);
            self.exception(Exception::Irq, lr);
            return true;
        }
        false
    }

    /// Execute one instruction and return the cycles charged to it, wait states
    /// and internal cycles included.
    pub fn step(&mut self, bus: &mut Bus) -> u32 {
        bus.reset_cycles();
        let pc = self.regs[PC];
        let access = match self.next_fetch {
            Fetch::Sequential => Access::Sequential,
            _ => Access::NonSequential,
        };
        bus.note_fetch(pc);
        let (condition, instruction) = if self.thumb() {
            let opcode = bus.read16(pc, access) as u16;
            if self.next_fetch == Fetch::Branch {
                // pipeline refill behind the branch target
                let _ = bus.read16(pc.wrapping_add(2), Access::Sequential);
            }
            parse_thumb(opcode)
        } else {
            let opcode = bus.read32(pc, access);
            if self.next_fetch == Fetch::Branch {
                let _ = bus.read32(pc.wrapping_add(4), Access::Sequential);
            }
            parse_arm(opcode)
        };
        let width = if self.thumb() { 2 } else { 4 };
        if !condition.evaluate(self) {
            // A failed condition consumes nothing but its fetch.
            self.regs[PC] = pc.wrapping_add(width);
            self.next_fetch = Fetch::Sequential;
            return bus.cycles();
        }
        // The visible PC during execution points one fetch beyond the next
        // instruction: current + 8 in ARM state, current + 4 in Thumb state.
        self.regs[PC] = pc.wrapping_add(2 * width);
        let fetch = instruction.execute(self, bus);
        if fetch != Fetch::Branch {
            self.regs[PC] = pc.wrapping_add(width);
        }
        self.next_fetch = fetch;
        bus.cycles()
    }

    pub fn save_state(&self, out: &mut Vec<u8>) {
        for value in self
            .regs
            .iter()
            .chain(Some(&self.cpsr))
            .chain(self.spsr.iter())
            .chain(self.banked_r13.iter())
            .chain(self.banked_r14.iter())
            .chain(self.r8_12_user.iter())
            .chain(self.r8_12_fiq.iter())
        {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out.push(match self.next_fetch {
            Fetch::Sequential => 0,
            Fetch::NonSequential => 1,
            Fetch::Branch => 2,
        });
    }

    pub fn load_state(&mut self, input: &mut &[u8]) -> Result<(), crate::StateError> {
        for j in 0..16 {
            self.regs[j] = crate::take_u32(input)?;
        }
        self.cpsr = crate::take_u32(input)?;
        for j in 0..6 {
            self.spsr[j] = crate::take_u32(input)?;
        }
        for j in 0..6 {
            self.banked_r13[j] = crate::take_u32(input)?;
        }
        for j in 0..6 {
            self.banked_r14[j] = crate::take_u32(input)?;
        }
        for j in 0..5 {
            self.r8_12_user[j] = crate::take_u32(input)?;
        }
        for j in 0..5 {
            self.r8_12_fiq[j] = crate::take_u32(input)?;
        }
        self.next_fetch = match crate::take_u8(input)? {
            0 => Fetch::Sequential,
            1 => Fetch::NonSequential,
            _ => Fetch::Branch,
        };
        Ok(())
    }

    /// Decode without side effects, for the debugger listing.
    pub fn disassemble(&self, bus: &Bus, lines: usize) -> Vec<(u32, u32, String)> {
        let width = if self.thumb() { 2u32 } else { 4u32 };
        let mut listing = Vec::with_capacity(lines);
        for j in 0..lines {
            let address = self.regs[PC].wrapping_add(j as u32 * width);
            let (opcode, decoded) = if self.thumb() {
                let halfword = bus.view32(address) >> ((address & 2) * 8) & 0xffff;
                (halfword, parse_thumb(halfword as u16))
            } else {
                let word = bus.view32(address);
                (word, parse_arm(word))
            };
            let (condition, instruction) = decoded;
            listing.push((address, opcode, instruction.as_asm(condition)));
        }
        listing
    }
}

impl fmt::Display for CPU {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::from("\n");
        s.push_str(&format!("{r}╔══════════════════════════════════╦", r = cursor::Goto(1, 2)));
        s.push_str(&format!("{r}║ CPU state                        ║", r = cursor::Goto(1, 3)));
        s.push_str(&format!("{r}╟─────┬───────────┬─────┬──────────╫", r = cursor::Goto(1, 4)));
        for j in 0..8 {
            s.push_str(&format!(
                "{r}║ R{j:<2} │  {a:08x} │ R{k:<2} │ {b:08x} ║\n",
                j = j,
                k = j + 8,
                a = self.regs[j],
                b = self.regs[j + 8],
                r = cursor::Goto(1, (j + 5) as u16),
            ));
        }
        s.push_str(&format!("{r}╟─────┼─┬─┬─┬─┬─┬─┬─┼───┼──────────╢", r = cursor::Goto(1, 13)));
        s.push_str(&format!("{r}║ {m} │N│Z│C│V│I│F│T│CPSR│ {c:08x} ║", m = self.mode(), c = self.cpsr, r = cursor::Goto(1, 14)));
        s.push_str(&format!(
            "{r}║     │{}│{}│{}│{}│{}│{}│{}│    │          ║\n",
            self.flag(Flag::N) as u8,
            self.flag(Flag::Z) as u8,
            self.flag(Flag::C) as u8,
            self.flag(Flag::V) as u8,
            self.flag(Flag::I) as u8,
            self.flag(Flag::F) as u8,
            self.flag(Flag::T) as u8,
            r = cursor::Goto(1, 15)
        ));
        s.push_str(&format!("{r}╚═════╧═╧═╧═╧═╧═╧═╧═╧════╧══════════╩", r = cursor::Goto(1, 16)));
        write!(f, "{}", s)
    }
}

pub struct Debugger {
    breakpoints: HashSet<u32>,
    code_running: bool,
    last_cmd: DebugCommand,
}

#[derive(PartialEq, Clone)]
enum DebugCommand {
    Quit,
    SetBreakpoint(Option<String>),
    DeleteBreakpoint(Option<String>),
    Continue,
    Step,
}

impl Debugger {
    pub fn new() -> Box<Self> {
        Box::new(Debugger {
            breakpoints: HashSet::new(),
            code_running: false,
            last_cmd: DebugCommand::Step,
        })
    }
    fn get_command(&mut self) -> DebugCommand {
        let mut input = String::new();
        io::stdin().read_line(&mut input).unwrap();
        let mut cmd = input.split_whitespace();
        match cmd.next() {
            Some("q") => DebugCommand::Quit,
            Some("s") | Some("n") => DebugCommand::Step,
            Some("b") => DebugCommand::SetBreakpoint(cmd.next().map(String::from)),
            Some("d") => DebugCommand::DeleteBreakpoint(cmd.next().map(String::from)),
            Some("c") => DebugCommand::Continue,
            _ => self.last_cmd.clone(),
        }
    }
    fn set_breakpoint(&mut self, breakpoint: &Option<String>, delete: bool) {
        if let Some(address) = parse_address(breakpoint) {
            if delete {
                self.breakpoints.remove(&address);
                println!("Breakpoint deleted.");
            } else {
                self.breakpoints.insert(address);
                println!("Breakpoint created.");
            }
        } else {
            println!("Invalid address!");
        }
    }
    fn draw_user_interface(&mut self, cpu: &CPU, bus: &Bus) {
        print!("{c}{tl}{cpu}", c = clear::All, tl = cursor::Goto(1, 1), cpu = cpu);
        for (j, (address, opcode, asm)) in cpu.disassemble(bus, 12).iter().enumerate() {
            let (symbol, col) = if j == 0 {
                (">", format!("{}", color::Fg(color::Green)))
            } else if self.breakpoints.contains(address) {
                ("*", format!("{}", color::Fg(color::Red)))
            } else {
                (" ", format!("{}", color::Fg(color::Reset)))
            };
            println!(
                "{r}{col}{sym}{a:08x} │ {o:08x} │ {i:<32}{n}",
                r = cursor::Goto(40, (j + 3) as u16),
                col = col,
                sym = symbol,
                a = address,
                o = opcode,
                i = asm,
                n = color::Fg(color::Reset),
            );
        }
        println!("{r}\nDebugger attached. Enter n to single step, c to continue, b/d <addr> to enter/delete a breakpoint at addr or q to quit.",
            r = cursor::Goto(1, 20));
        print!("{r}> ", r = cursor::Goto(1, 22));
        io::stdout().flush().expect("");
    }
    pub fn update(&mut self, cpu: &mut CPU, bus: &Bus) -> Signal {
        if !self.code_running || self.breakpoints.contains(&cpu.regs[PC]) {
            self.code_running = false;
            self.draw_user_interface(cpu, bus);
            let cmd = self.get_command();
            match &cmd {
                DebugCommand::Quit => Signal::Quit,
                DebugCommand::SetBreakpoint(b) => {
                    self.set_breakpoint(&b, false);
                    Signal::NoOp
                }
                DebugCommand::DeleteBreakpoint(b) => {
                    self.set_breakpoint(&b, true);
                    Signal::NoOp
                }
                DebugCommand::Continue => {
                    self.code_running = true;
                    Signal::Ok
                }
                DebugCommand::Step => {
                    self.last_cmd = cmd;
                    Signal::Ok
                }
            }
        } else {
            Signal::Ok
        }
    }
}

fn parse_address(address: &Option<String>) -> Option<u32> {
    match address {
        Some(addr) => u32::from_str_radix(&addr, 16).ok(),
        None => None,
    }
}
