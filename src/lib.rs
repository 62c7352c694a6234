use std::error::Error;
use std::fmt;
use std::path::PathBuf;
mod instructions;
pub mod memory;
mod parser;
pub mod processor;
use memory::Bus;
use processor::{Debugger, CPU};
mod conversions;
pub mod cartridge;
pub mod devices;
use cartridge::{PersistError, SaveKind, SaveMedia};
use devices::{Dma, DmaTiming, Signal, Timers, Video, VISIBLE_LINES};
pub mod fields;
pub mod gba;
use gba::{Event, Scheduler};

/// Cycles per displayed frame: 228 scanlines of 1232 cycles each.
pub const FRAME_CYCLES: u64 = devices::H_TOTAL as u64 * devices::TOTAL_LINES as u64;

pub struct Configuration {
    pub entry_point: u32,
    pub bios: Option<Vec<u8>>,
    pub save_path: Option<PathBuf>,
    pub memory_layout: Vec<(u32, u32)>,
}

#[derive(Debug)]
pub enum RomLoadError {
    Missing,
    TooLarge,
}

impl fmt::Display for RomLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RomLoadError::Missing => write!(f, "no ROM image"),
            RomLoadError::TooLarge => {
                write!(f, "ROM image exceeds the 32 MB cartridge window")
            }
        }
    }
}

impl Error for RomLoadError {}

#[derive(Debug)]
pub struct StateError;

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "truncated or malformed state snapshot")
    }
}

impl Error for StateError {}

pub(crate) fn take<'a>(input: &mut &'a [u8], count: usize) -> Result<&'a [u8], StateError> {
    if input.len() < count {
        return Err(StateError);
    }
    let (head, rest) = input.split_at(count);
    *input = rest;
    Ok(head)
}
pub(crate) fn take_u8(input: &mut &[u8]) -> Result<u8, StateError> {
    Ok(take(input, 1)?[0])
}
pub(crate) fn take_u16(input: &mut &[u8]) -> Result<u16, StateError> {
    let bytes = take(input, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}
pub(crate) fn take_u32(input: &mut &[u8]) -> Result<u32, StateError> {
    let bytes = take(input, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
pub(crate) fn take_u64(input: &mut &[u8]) -> Result<u64, StateError> {
    let bytes = take(input, 8)?;
    let mut raw = [0; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(raw))
}

const STATE_MAGIC: u32 = 0x4247_4d45;

pub struct Emulator {
    pub cpu: CPU,
    pub bus: Bus,
    pub dma: Dma,
    pub timers: Timers,
    pub video: Video,
    scheduler: Scheduler,
    cycles: u64,
    input_mask: u16,
    entry_point: u32,
    save_path: Option<PathBuf>,
}

impl Emulator {
    pub fn new(config: Configuration) -> Emulator {
        let mut bus = Bus::new();
        if let Some(image) = &config.bios {
            bus.load_bios(image);
        }
        for &(address, value) in &config.memory_layout {
            bus.write32(address, value, fields::Access::Internal);
        }
        bus.reset_cycles();
        let mut cpu = CPU::new();
        cpu.reset_to_rom(config.entry_point);
        Emulator {
            cpu,
            bus,
            dma: Dma::new(),
            timers: Timers::new(),
            video: Video::new(),
            scheduler: Scheduler::new(),
            cycles: 0,
            input_mask: 0x3ff,
            entry_point: config.entry_point,
            save_path: config.save_path,
        }
    }

    /// Map a raw cartridge image, pick its save backend and point the CPU at
    /// the entry vector.
    pub fn load_rom(&mut self, image: &[u8]) -> Result<(), RomLoadError> {
        if image.is_empty() {
            return Err(RomLoadError::Missing);
        }
        if image.len() > memory::ROM_MAX {
            return Err(RomLoadError::TooLarge);
        }
        let kind = SaveKind::detect(image);
        log::info!("save media: {:?}", kind);
        self.bus.save = SaveMedia::new(kind, self.save_path.clone());
        self.bus.load_rom(image.to_vec());
        self.cpu.reset_to_rom(self.entry_point);
        Ok(())
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Drive the machine until the master counter reaches the deadline.
    pub fn run_until(&mut self, deadline_cycles: u64) {
        while self.cycles < deadline_cycles {
            self.advance();
        }
    }

    pub fn run_frame(&mut self) {
        self.run_until(self.cycles + FRAME_CYCLES);
    }

    /// A single master loop iteration: one instruction (or one halt skip)
    /// plus whatever events and DMA fall due behind it.
    pub fn step(&mut self) {
        self.advance();
    }

    /// Terminal run loop with an optional attached debugger; used by the
    /// embedding binary for headless and single-step sessions.
    pub fn run(&mut self, debug: bool) {
        let mut debugger = Debugger::new();
        loop {
            if debug {
                match debugger.update(&mut self.cpu, &self.bus) {
                    Signal::Quit => return,
                    Signal::NoOp => continue,
                    Signal::Ok => {}
                }
            }
            self.advance();
        }
    }

    /// One iteration of the master loop: execute (or sleep through halt),
    /// dispatch due calendar events, pump DMA, deliver interrupts.
    fn advance(&mut self) {
        if self.bus.halted {
            // fast-forward an idle CPU to the next scheduled deadline
            let wake = self.scheduler.next_deadline().max(self.cycles + 1);
            let elapsed = (wake - self.cycles) as u32;
            self.cycles = wake;
            self.timers.step(&mut self.bus, elapsed);
        } else {
            let spent = self.cpu.step(&mut self.bus);
            self.cycles += spent as u64;
            self.timers.step(&mut self.bus, spent);
        }
        for index in 0..4 {
            match self.timers.cycles_to_overflow(&self.bus, index) {
                Some(delta) => self
                    .scheduler
                    .set(Event::TimerOverflow(index), self.cycles + delta),
                None => self.scheduler.clear(Event::TimerOverflow(index)),
            }
        }
        while let Some((event, deadline)) = self.scheduler.next_due(self.cycles) {
            self.dispatch(event, deadline);
        }
        self.dma.scan(&mut self.bus);
        if self.dma.any_active() {
            self.bus.reset_cycles();
            self.dma.pump(&mut self.bus);
            let spent = self.bus.cycles();
            self.cycles += spent as u64;
            self.timers.step(&mut self.bus, spent);
        }
        self.cpu.serve_interrupt_requests(&mut self.bus);
    }

    fn dispatch(&mut self, event: Event, deadline: u64) {
        match event {
            Event::HBlankStart => {
                self.video.enter_hblank(&mut self.bus);
                if self.video.scanline < VISIBLE_LINES {
                    self.scheduler
                        .set(Event::DmaTrigger(DmaTiming::HBlank), self.cycles);
                }
                self.scheduler
                    .set(Event::HBlankStart, deadline + devices::H_TOTAL as u64);
            }
            Event::HBlankEnd => {
                self.video.leave_hblank(&mut self.bus);
                self.scheduler
                    .set(Event::HBlankEnd, deadline + devices::H_TOTAL as u64);
            }
            Event::VBlankStart => {
                self.video.enter_vblank(&mut self.bus);
                self.scheduler
                    .set(Event::DmaTrigger(DmaTiming::VBlank), self.cycles);
                self.scheduler.set(Event::VBlankStart, deadline + FRAME_CYCLES);
            }
            Event::VBlankEnd => {
                self.video.leave_vblank(&mut self.bus);
                // the front end's key mask is sampled once per frame
                self.bus.set_keyinput(self.input_mask);
                self.scheduler.set(Event::VBlankEnd, deadline + FRAME_CYCLES);
            }
            // overflow slots only exist to bound the halt fast-forward; the
            // stepped timers already did the work
            Event::TimerOverflow(_) => {}
            Event::DmaTrigger(timing) => self.dma.trigger(&mut self.bus, timing),
        }
    }

    /// Latest rendered frame, once per VBlank.
    pub fn frame_ready(&mut self) -> Option<&[u32]> {
        if self.video.frame_ready {
            self.video.frame_ready = false;
            Some(&self.video.frame)
        } else {
            None
        }
    }

    pub fn set_inputs(&mut self, mask: u16) {
        self.input_mask = mask;
    }

    /// Flush save media to its sibling file; the run continues in memory
    /// even if this fails.
    pub fn persist(&mut self) -> Result<(), PersistError> {
        self.bus.save.flush()
    }

    pub fn save_state(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&STATE_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.cycles.to_le_bytes());
        out.extend_from_slice(&self.input_mask.to_le_bytes());
        self.cpu.save_state(&mut out);
        self.bus.save_state(&mut out);
        self.timers.save_state(&mut out);
        self.dma.save_state(&mut out);
        self.video.save_state(&mut out);
        self.scheduler.save_state(&mut out);
        out
    }

    pub fn load_state(&mut self, snapshot: &[u8]) -> Result<(), StateError> {
        let mut input = snapshot;
        if take_u32(&mut input)? != STATE_MAGIC {
            return Err(StateError);
        }
        self.cycles = take_u64(&mut input)?;
        self.input_mask = take_u16(&mut input)?;
        self.cpu.load_state(&mut input)?;
        self.bus.load_state(&mut input)?;
        self.timers.load_state(&mut input)?;
        self.dma.load_state(&mut input)?;
        self.video.load_state(&mut input)?;
        self.scheduler.load_state(&mut input)?;
        Ok(())
    }
}
