// The peripherals that share the bus with the CPU: the four DMA channels, the
// four hardware timers, the raster beam bookkeeping and the bitmap renderer
// behind it. All of them own no memory; their registers live in the I/O file
// on the bus and their work is driven from the master loop.

use crate::fields::Access;
use crate::memory::{io, Bus};

pub enum Signal {
    Ok,
    Quit,
    NoOp,
}

/// Interrupt sources, by IE/IF bit index.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Interrupt {
    VBlank = 0,
    HBlank = 1,
    VCounterMatch = 2,
    Timer0 = 3,
    Timer1 = 4,
    Timer2 = 5,
    Timer3 = 6,
    Serial = 7,
    Dma0 = 8,
    Dma1 = 9,
    Dma2 = 10,
    Dma3 = 11,
    Keypad = 12,
    GamePak = 13,
}

impl Interrupt {
    pub fn bit(&self) -> u16 {
        1 << *self as u16
    }
    pub fn timer(index: usize) -> Self {
        match index {
            0 => Self::Timer0,
            1 => Self::Timer1,
            2 => Self::Timer2,
            _ => Self::Timer3,
        }
    }
    pub fn dma(index: usize) -> Self {
        match index {
            0 => Self::Dma0,
            1 => Self::Dma1,
            2 => Self::Dma2,
            _ => Self::Dma3,
        }
    }
}

/// DMA start timings, bits 12-13 of the control word.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum DmaTiming {
    Immediate = 0,
    VBlank = 1,
    HBlank = 2,
    Special = 3,
}

impl DmaTiming {
    fn from(bits: u16) -> Self {
        match bits & 3 {
            0 => Self::Immediate,
            1 => Self::VBlank,
            2 => Self::HBlank,
            _ => Self::Special,
        }
    }
}

const DMA_SRC_MASK: [u32; 4] = [0x07ff_ffff, 0x0fff_ffff, 0x0fff_ffff, 0x0fff_ffff];
const DMA_DST_MASK: [u32; 4] = [0x07ff_ffff, 0x07ff_ffff, 0x07ff_ffff, 0x0fff_ffff];
const DMA_COUNT_MASK: [u32; 4] = [0x3fff, 0x3fff, 0x3fff, 0xffff];

#[derive(Default)]
struct DmaChannel {
    enabled: bool, // mirror of the enable bit, for edge detection
    active: bool,
    first: bool, // next unit is the first of the block
    src: u32,
    dst: u32,
    remaining: u32,
}

pub struct Dma {
    channels: [DmaChannel; 4],
}

impl Dma {
    pub fn new() -> Self {
        Dma { channels: Default::default() }
    }

    fn cnt_h(index: usize) -> usize {
        io::DMA0CNT_H + index * io::DMA_STRIDE
    }

    /// Pick up enable bit edges from the register file. Latching of the
    /// programmed source, destination and count happens here.
    pub fn scan(&mut self, bus: &mut Bus) {
        for index in 0..4 {
            let control = bus.io_half(Self::cnt_h(index));
            let enable = control & 0x8000 != 0;
            if enable && !self.channels[index].enabled {
                self.channels[index].enabled = true;
                self.latch(index, bus, true);
                match DmaTiming::from(control >> 12) {
                    DmaTiming::Immediate => {
                        self.channels[index].active = true;
                    }
                    DmaTiming::Special => {
                        // special timing fires off the sound FIFOs (channels
                        // 1/2) and the video capture unit (channel 3), none of
                        // which live in this core; the channel latches and
                        // stays armed but no trigger ever reaches it
                        log::warn!(
                            "DMA {} armed with special timing; no trigger source here",
                            index
                        )
                    }
                    _ => {}
                }
            } else if !enable && self.channels[index].enabled {
                self.channels[index].enabled = false;
                self.channels[index].active = false;
            }
        }
    }

    fn latch(&mut self, index: usize, bus: &mut Bus, addresses: bool) {
        let base = io::DMA0SAD + index * io::DMA_STRIDE;
        let count = bus.io_half(io::DMA0CNT_L + index * io::DMA_STRIDE) as u32 & DMA_COUNT_MASK[index];
        let channel = &mut self.channels[index];
        channel.remaining = if count == 0 { DMA_COUNT_MASK[index] + 1 } else { count };
        if addresses {
            channel.src = bus.io_word(base) & DMA_SRC_MASK[index];
            channel.dst = bus.io_word(base + 4) & DMA_DST_MASK[index];
        }
        channel.first = true;
        let (dst, remaining) = (channel.dst, channel.remaining);
        if bus.save.is_eeprom_address(dst, bus.rom().len()) {
            bus.save.set_eeprom_width_from_dma(remaining);
        }
    }

    /// Arm every enabled channel whose start timing matches the event.
    pub fn trigger(&mut self, bus: &mut Bus, timing: DmaTiming) {
        for index in 0..4 {
            let control = bus.io_half(Self::cnt_h(index));
            if control & 0x8000 != 0
                && DmaTiming::from(control >> 12) == timing
                && !self.channels[index].active
            {
                // count is re-latched per trigger; the destination only when
                // the control word asks for a reload
                self.latch(index, bus, false);
                if (control >> 5) & 3 == 3 {
                    let base = io::DMA0SAD + index * io::DMA_STRIDE;
                    self.channels[index].dst = bus.io_word(base + 4) & DMA_DST_MASK[index];
                }
                self.channels[index].active = true;
            }
        }
    }

    pub fn any_active(&self) -> bool {
        self.channels.iter().any(|c| c.active)
    }

    /// Run transfer units until no channel is active. Priority 0 beats 3 and a
    /// higher channel preempts a lower one between units because the winner is
    /// re-elected for every unit.
    pub fn pump(&mut self, bus: &mut Bus) {
        while let Some(index) = (0..4).find(|&i| self.channels[i].active) {
            self.transfer_unit(index, bus);
        }
    }

    fn transfer_unit(&mut self, index: usize, bus: &mut Bus) {
        let control = bus.io_half(Self::cnt_h(index));
        let word = control & 0x0400 != 0;
        let unit = if word { 4u32 } else { 2u32 };
        let access = if self.channels[index].first {
            // two internal cycles of startup before the first unit
            bus.idle();
            bus.idle();
            Access::NonSequential
        } else {
            Access::Sequential
        };
        let (src, dst) = (self.channels[index].src, self.channels[index].dst);
        if word {
            let value = bus.read32(src & !3, access);
            bus.write32(dst & !3, value, access);
        } else {
            let value = bus.read16(src & !1, access) as u16;
            bus.write16(dst & !1, value, access);
        }
        let channel = &mut self.channels[index];
        channel.first = false;
        channel.src = adjust(channel.src, (control >> 7) & 3, unit);
        channel.dst = adjust(channel.dst, (control >> 5) & 3, unit);
        channel.remaining -= 1;
        if channel.remaining == 0 {
            self.complete(index, bus, control);
        }
    }

    fn complete(&mut self, index: usize, bus: &mut Bus, control: u16) {
        self.channels[index].active = false;
        if control & 0x4000 != 0 {
            bus.request_interrupt(Interrupt::dma(index));
        }
        let repeat = control & 0x0200 != 0;
        if !repeat || DmaTiming::from(control >> 12) == DmaTiming::Immediate {
            bus.io_set_half(Self::cnt_h(index), control & !0x8000);
            self.channels[index].enabled = false;
        }
    }
}

impl Dma {
    pub fn save_state(&self, out: &mut Vec<u8>) {
        for channel in self.channels.iter() {
            out.push(channel.enabled as u8);
            out.push(channel.active as u8);
            out.push(channel.first as u8);
            out.extend_from_slice(&channel.src.to_le_bytes());
            out.extend_from_slice(&channel.dst.to_le_bytes());
            out.extend_from_slice(&channel.remaining.to_le_bytes());
        }
    }
    pub fn load_state(&mut self, input: &mut &[u8]) -> Result<(), crate::StateError> {
        for channel in self.channels.iter_mut() {
            channel.enabled = crate::take_u8(input)? != 0;
            channel.active = crate::take_u8(input)? != 0;
            channel.first = crate::take_u8(input)? != 0;
            channel.src = crate::take_u32(input)?;
            channel.dst = crate::take_u32(input)?;
            channel.remaining = crate::take_u32(input)?;
        }
        Ok(())
    }
}

/// Apply a destination/source address control field after one unit.
fn adjust(address: u32, control: u16, unit: u32) -> u32 {
    match control {
        0 | 3 => address.wrapping_add(unit), // increment (3 = increment + reload)
        1 => address.wrapping_sub(unit),
        _ => address, // fixed
    }
}

const PRESCALE: [u32; 4] = [1, 64, 256, 1024];

pub struct Timers {
    enabled: [bool; 4],
    counters: [u32; 4],
    fraction: [u32; 4], // cycles not yet converted into ticks
    start_delay: [u32; 4],
}

impl Timers {
    pub fn new() -> Self {
        Timers {
            enabled: [false; 4],
            counters: [0; 4],
            fraction: [0; 4],
            start_delay: [0; 4],
        }
    }

    fn control(bus: &Bus, index: usize) -> u16 {
        bus.io_half(io::TM0CNT_H + index * io::TM_STRIDE)
    }
    fn reload(bus: &Bus, index: usize) -> u32 {
        bus.io_half(io::TM0CNT_L + index * io::TM_STRIDE) as u32
    }

    /// Advance all four timers by the cycles the CPU just consumed.
    pub fn step(&mut self, bus: &mut Bus, cycles: u32) {
        for index in 0..4 {
            let control = Self::control(bus, index);
            let enable = control & 0x80 != 0;
            if enable && !self.enabled[index] {
                // the counter reloads on the enable edge and starts one
                // cycle later
                self.counters[index] = Self::reload(bus, index);
                self.fraction[index] = 0;
                self.start_delay[index] = 1;
                self.enabled[index] = true;
            } else if !enable {
                self.enabled[index] = false;
                continue;
            }
            // Timer 0 has no previous timer to cascade from.
            let cascade = control & 0x04 != 0 && index > 0;
            if cascade {
                continue;
            }
            let mut budget = cycles;
            if self.start_delay[index] > 0 {
                let eaten = self.start_delay[index].min(budget);
                self.start_delay[index] -= eaten;
                budget -= eaten;
            }
            self.fraction[index] += budget;
            let prescale = PRESCALE[(control & 3) as usize];
            let ticks = self.fraction[index] / prescale;
            self.fraction[index] %= prescale;
            self.advance(bus, index, ticks);
        }
        for index in 0..4 {
            bus.timer_counters[index] = self.counters[index] as u16;
        }
    }

    /// Cycles until the timer wraps, for the overflow slots of the deadline
    /// calendar. Cascading timers have no deadline of their own.
    pub fn cycles_to_overflow(&self, bus: &Bus, index: usize) -> Option<u64> {
        if !self.enabled[index] {
            return None;
        }
        let control = Self::control(bus, index);
        if control & 0x04 != 0 && index > 0 {
            return None;
        }
        let prescale = PRESCALE[(control & 3) as usize] as u64;
        let ticks = 0x10000u64 - self.counters[index] as u64;
        Some(ticks * prescale - self.fraction[index] as u64 + self.start_delay[index] as u64)
    }

    fn advance(&mut self, bus: &mut Bus, index: usize, ticks: u32) {
        if ticks == 0 || !self.enabled[index] {
            return;
        }
        let control = Self::control(bus, index);
        let reload = Self::reload(bus, index);
        let mut value = self.counters[index] + ticks;
        let mut overflows = 0;
        while value > 0xffff {
            // each wrap restarts from the reload value
            value = reload + (value - 0x10000);
            overflows += 1;
        }
        self.counters[index] = value;
        if overflows > 0 {
            if control & 0x40 != 0 {
                bus.request_interrupt(Interrupt::timer(index));
            }
            if index < 3 {
                let next = Self::control(bus, index + 1);
                if next & 0x80 != 0 && next & 0x04 != 0 {
                    self.advance(bus, index + 1, overflows);
                }
            }
        }
    }
}

impl Timers {
    pub fn save_state(&self, out: &mut Vec<u8>) {
        for index in 0..4 {
            out.push(self.enabled[index] as u8);
            out.extend_from_slice(&self.counters[index].to_le_bytes());
            out.extend_from_slice(&self.fraction[index].to_le_bytes());
            out.extend_from_slice(&self.start_delay[index].to_le_bytes());
        }
    }
    pub fn load_state(&mut self, input: &mut &[u8]) -> Result<(), crate::StateError> {
        for index in 0..4 {
            self.enabled[index] = crate::take_u8(input)? != 0;
            self.counters[index] = crate::take_u32(input)?;
            self.fraction[index] = crate::take_u32(input)?;
            self.start_delay[index] = crate::take_u32(input)?;
        }
        Ok(())
    }
}

// Raster geometry, in CPU cycles.
pub const H_VISIBLE_CYCLES: u32 = 960;
pub const H_TOTAL: u32 = 1232;
pub const VISIBLE_LINES: u16 = 160;
pub const TOTAL_LINES: u16 = 228;

pub const FRAME_WIDTH: usize = 240;
pub const FRAME_HEIGHT: usize = 160;

/// Beam bookkeeping and the bitmap-mode scanline renderer behind it. Memory
/// stays on the bus; the renderer only reads it.
pub struct Video {
    pub scanline: u16,
    pub frame: Vec<u32>,
    pub frame_ready: bool,
}

impl Video {
    pub fn new() -> Self {
        Video {
            scanline: 0,
            frame: vec![0; FRAME_WIDTH * FRAME_HEIGHT],
            frame_ready: false,
        }
    }

    pub fn enter_hblank(&mut self, bus: &mut Bus) {
        let dispstat = bus.io_half(io::DISPSTAT);
        bus.io_set_half(io::DISPSTAT, dispstat | 0x2);
        if dispstat & 0x10 != 0 {
            bus.request_interrupt(Interrupt::HBlank);
        }
    }

    /// End of the scanline: render it, move the beam and update the
    /// VCOUNT/VCounter-match machinery.
    pub fn leave_hblank(&mut self, bus: &mut Bus) {
        if self.scanline < VISIBLE_LINES {
            self.render_scanline(bus);
        }
        self.scanline = (self.scanline + 1) % TOTAL_LINES;
        let mut dispstat = bus.io_half(io::DISPSTAT) & !0x2;
        let target = dispstat >> 8;
        if self.scanline == target {
            dispstat |= 0x4;
            if dispstat & 0x20 != 0 {
                bus.request_interrupt(Interrupt::VCounterMatch);
            }
        } else {
            dispstat &= !0x4;
        }
        bus.io_set_half(io::DISPSTAT, dispstat);
        bus.io_set_byte(io::VCOUNT, self.scanline as u8);
        bus.io_set_byte(io::VCOUNT + 1, (self.scanline >> 8) as u8);
    }

    pub fn enter_vblank(&mut self, bus: &mut Bus) {
        let dispstat = bus.io_half(io::DISPSTAT);
        bus.io_set_half(io::DISPSTAT, dispstat | 0x1);
        if dispstat & 0x8 != 0 {
            bus.request_interrupt(Interrupt::VBlank);
        }
        self.frame_ready = true;
    }

    pub fn leave_vblank(&mut self, bus: &mut Bus) {
        let dispstat = bus.io_half(io::DISPSTAT);
        bus.io_set_half(io::DISPSTAT, dispstat & !0x1);
    }

    pub fn save_state(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.scanline.to_le_bytes());
        out.push(self.frame_ready as u8);
    }
    pub fn load_state(&mut self, input: &mut &[u8]) -> Result<(), crate::StateError> {
        self.scanline = crate::take_u16(input)?;
        self.frame_ready = crate::take_u8(input)? != 0;
        Ok(())
    }

    /// The display modes the core surfaces to the front end: the two bitmap
    /// modes plus the backdrop color for everything else.
    fn render_scanline(&mut self, bus: &Bus) {
        let y = self.scanline as usize;
        let dispcnt = bus.io_half(io::DISPCNT);
        let row = &mut self.frame[y * FRAME_WIDTH..(y + 1) * FRAME_WIDTH];
        match dispcnt & 7 {
            3 => {
                for x in 0..FRAME_WIDTH {
                    let offset = 0x0600_0000 + 2 * (y * FRAME_WIDTH + x) as u32;
                    let raw = bus.view32(offset) >> ((offset & 2) * 8);
                    row[x] = rgb555(raw as u16);
                }
            }
            4 => {
                let page = if dispcnt & 0x10 != 0 { 0xa000u32 } else { 0 };
                for x in 0..FRAME_WIDTH {
                    let offset = 0x0600_0000 + page + (y * FRAME_WIDTH + x) as u32;
                    let index = (bus.view32(offset) >> ((offset & 3) * 8)) & 0xff;
                    let color = bus.view32(0x0500_0000 + 2 * index) >> ((index & 1) * 16);
                    row[x] = rgb555(color as u16);
                }
            }
            _ => {
                let backdrop = rgb555(bus.view32(0x0500_0000) as u16);
                for x in 0..FRAME_WIDTH {
                    row[x] = backdrop;
                }
            }
        }
    }
}

/// 15 bit BGR to ARGB8888.
fn rgb555(color: u16) -> u32 {
    let r = (color & 0x1f) as u32;
    let g = (color >> 5 & 0x1f) as u32;
    let b = (color >> 10 & 0x1f) as u32;
    0xff00_0000 | (r << 3 | r >> 2) << 16 | (g << 3 | g >> 2) << 8 | (b << 3 | b >> 2)
}
