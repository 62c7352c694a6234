// Address decoding, mirroring and wait state accounting for the whole 32 bit
// bus. All "hardware" memory lives here: the RAM banks, the I/O register file
// and the cartridge windows. Reads come back pre-rotated for misaligned
// addresses, so the load instructions never see alignment.

use crate::cartridge::SaveMedia;
use crate::conversions::Truncate;
use crate::devices::Interrupt;
use crate::fields::{Access, Size};

pub const BIOS_SIZE: usize = 0x4000;
pub const EWRAM_SIZE: usize = 0x40000;
pub const IWRAM_SIZE: usize = 0x8000;
pub const IO_SIZE: usize = 0x400;
pub const PALETTE_SIZE: usize = 0x400;
pub const VRAM_SIZE: usize = 0x18000;
pub const OAM_SIZE: usize = 0x400;
pub const ROM_MAX: usize = 0x0200_0000;

// I/O register offsets into the 0x04000000 block.
pub mod io {
    pub const DISPCNT: usize = 0x000; // LCD control
    pub const DISPSTAT: usize = 0x004; // General LCD status
    pub const VCOUNT: usize = 0x006; // Vertical counter (read only)
    pub const DMA0SAD: usize = 0x0b0; // DMA source addresses
    pub const DMA0DAD: usize = 0x0b4; // DMA destination addresses
    pub const DMA0CNT_L: usize = 0x0b8; // DMA word counts
    pub const DMA0CNT_H: usize = 0x0ba; // DMA control words
    pub const DMA_STRIDE: usize = 0x0c; // Per-channel register spacing
    pub const TM0CNT_L: usize = 0x100; // Timer counter/reload registers
    pub const TM0CNT_H: usize = 0x102; // Timer control registers
    pub const TM_STRIDE: usize = 0x04;
    pub const KEYINPUT: usize = 0x130; // Key status (read only, 0 = pressed)
    pub const KEYCNT: usize = 0x132; // Key interrupt control
    pub const IE: usize = 0x200; // Interrupt enable
    pub const IF: usize = 0x202; // Interrupt request / acknowledge
    pub const WAITCNT: usize = 0x204; // Game Pak wait state control
    pub const IME: usize = 0x208; // Interrupt master enable
    pub const POSTFLG: usize = 0x300;
    pub const HALTCNT: usize = 0x301; // Low power mode control (write only)
    pub const INTERNAL_MEM_CNT: usize = 0x800; // Mirrored every 64K in I/O space
}

pub struct Bus {
    bios: Vec<u8>,
    ewram: Vec<u8>,
    iwram: Vec<u8>,
    ioregs: Vec<u8>,
    palette: Vec<u8>,
    vram: Vec<u8>,
    oam: Vec<u8>,
    rom: Vec<u8>,
    pub save: SaveMedia,
    imc: [u8; 4],              // Undocumented internal memory control
    cycles: u32,               // Cycles charged since the last reset_cycles
    wait_n: [u32; 3],          // Decoded WAITCNT: total first-access cycles per window
    wait_s: [u32; 3],          // Decoded WAITCNT: total sequential cycles per window
    sram_wait: u32,
    fetch_addr: u32,           // Origin of the current instruction fetch
    bios_latch: u32,           // Last opcode successfully fetched from BIOS
    open_bus: u32,             // Last value driven on the bus
    pub timer_counters: [u16; 4], // Live counters, surfaced on TMxCNT_L reads
    pub halted: bool,
}

impl Bus {
    pub fn new() -> Self {
        let mut bus = Bus {
            bios: vec![0; BIOS_SIZE],
            ewram: vec![0; EWRAM_SIZE],
            iwram: vec![0; IWRAM_SIZE],
            ioregs: vec![0; IO_SIZE],
            palette: vec![0; PALETTE_SIZE],
            vram: vec![0; VRAM_SIZE],
            oam: vec![0; OAM_SIZE],
            rom: Vec::new(),
            save: SaveMedia::none(),
            imc: [0x20, 0x00, 0x00, 0x0d],
            cycles: 0,
            wait_n: [0; 3],
            wait_s: [0; 3],
            sram_wait: 0,
            fetch_addr: 0,
            bios_latch: 0,
            open_bus: 0,
            timer_counters: [0; 4],
            halted: false,
        };
        // KEYINPUT idles with all ten keys released.
        bus.ioregs[io::KEYINPUT] = 0xff;
        bus.ioregs[io::KEYINPUT + 1] = 0x03;
        bus.refresh_waitstates();
        bus
    }

    pub fn load_bios(&mut self, image: &[u8]) {
        let n = image.len().min(BIOS_SIZE);
        self.bios[..n].copy_from_slice(&image[..n]);
    }

    pub fn load_rom(&mut self, image: Vec<u8>) {
        self.rom = image;
    }

    pub fn rom(&self) -> &[u8] {
        &self.rom
    }

    // ---- cycle accounting ----

    pub fn reset_cycles(&mut self) {
        self.cycles = 0;
    }
    pub fn cycles(&self) -> u32 {
        self.cycles
    }
    /// Charge one internal cycle.
    pub fn idle(&mut self) {
        self.cycles += 1;
    }

    pub fn note_fetch(&mut self, address: u32) {
        self.fetch_addr = address;
    }

    fn charge(&mut self, address: u32, size: Size, access: Access) {
        if access == Access::Internal {
            self.cycles += 1;
            return;
        }
        let aligned = size.align(address);
        let cost = match address >> 24 {
            0x02 => match size {
                Size::Word => 6,
                _ => 3,
            },
            0x05 | 0x06 => match size {
                Size::Word => 2,
                _ => 1,
            },
            0x08..=0x0d => {
                let window = ((address >> 24) as usize - 8) / 2;
                // The first access of each 128K block is always non-sequential.
                let sequential =
                    access == Access::Sequential && aligned & 0x1_ffff != 0;
                let (n, s) = (self.wait_n[window], self.wait_s[window]);
                let first = if sequential { s } else { n };
                match size {
                    // A 32 bit ROM access is two halfword bus cycles.
                    Size::Word => first + s,
                    _ => first,
                }
            }
            0x0e | 0x0f => self.sram_wait,
            _ => 1,
        };
        self.cycles += cost;
    }

    /// Re-derive the cached per-window cycle counts from WAITCNT.
    fn refresh_waitstates(&mut self) {
        const FIRST: [u32; 4] = [4, 3, 2, 8];
        const SECOND: [[u32; 2]; 3] = [[2, 1], [4, 1], [8, 1]];
        let waitcnt = self.io_half(io::WAITCNT) as u32;
        self.sram_wait = 1 + FIRST[(waitcnt & 3) as usize];
        for window in 0..3 {
            let shift = 2 + 3 * window;
            self.wait_n[window] = 1 + FIRST[((waitcnt >> shift) & 3) as usize];
            self.wait_s[window] = 1 + SECOND[window][((waitcnt >> (shift + 2)) & 1) as usize];
        }
    }

    // ---- read side ----

    pub fn read8(&mut self, address: u32, access: Access) -> u8 {
        self.charge(address, Size::Byte, access);
        let value = self.load(address, Size::Byte);
        self.open_bus = value;
        value.truncate()
    }

    /// Halfword read; a read from an odd address comes back rotated right by 8
    /// within the full register width.
    pub fn read16(&mut self, address: u32, access: Access) -> u32 {
        self.charge(address, Size::Half, access);
        let value = self.load(address, Size::Half);
        self.open_bus = value;
        value.rotate_right((address & 1) * 8)
    }

    /// Word read; misaligned addresses return the aligned word rotated right
    /// by 8 times the dropped address bits.
    pub fn read32(&mut self, address: u32, access: Access) -> u32 {
        self.charge(address, Size::Word, access);
        let value = self.load(address, Size::Word);
        self.open_bus = value;
        value.rotate_right((address & 3) * 8)
    }

    /// Side effect free word view, for the debugger and the PPU.
    pub fn view32(&self, address: u32) -> u32 {
        let address = Size::Word.align(address);
        let lo = self.view8(address) as u32;
        let b1 = self.view8(address + 1) as u32;
        let b2 = self.view8(address + 2) as u32;
        let b3 = self.view8(address + 3) as u32;
        lo | b1 << 8 | b2 << 16 | b3 << 24
    }

    pub fn view8(&self, address: u32) -> u8 {
        match address >> 24 {
            0x00 => self.bios.get(address as usize & 0x3fff).copied().unwrap_or(0),
            0x02 => self.ewram[address as usize & 0x3ffff],
            0x03 => self.iwram[address as usize & 0x7fff],
            0x05 => self.palette[address as usize & 0x3ff],
            0x06 => self.vram[Self::mirror_vram(address)],
            0x07 => self.oam[address as usize & 0x3ff],
            0x08..=0x0d => {
                let offset = address as usize & (ROM_MAX - 1);
                self.rom.get(offset).copied().unwrap_or(0)
            }
            _ => 0,
        }
    }

    fn mirror_vram(address: u32) -> usize {
        // 96K mirrored into a 128K block: the last 32K repeats.
        let mut offset = address as usize & 0x1_ffff;
        if offset >= VRAM_SIZE {
            offset -= 0x8000;
        }
        offset
    }

    fn load(&mut self, address: u32, size: Size) -> u32 {
        let aligned = size.align(address);
        match address >> 24 {
            0x00 => {
                if aligned as usize >= BIOS_SIZE {
                    log::debug!("open bus read at {:08x}", address);
                    return self.open_bus & size.mask();
                }
                // BIOS is readable only while executing from it; otherwise the
                // last fetched BIOS opcode lingers on the bus.
                if (self.fetch_addr as usize) < BIOS_SIZE {
                    let word = read_array(&self.bios, aligned as usize & !3, Size::Word);
                    self.bios_latch = word;
                    read_array(&self.bios, aligned as usize, size)
                } else {
                    self.bios_latch >> ((aligned & 3) * 8) & size.mask()
                }
            }
            0x02 => read_array(&self.ewram, aligned as usize & 0x3ffff, size),
            0x03 => read_array(&self.iwram, aligned as usize & 0x7fff, size),
            0x04 => self.io_read(aligned, size),
            0x05 => read_array(&self.palette, aligned as usize & 0x3ff, size),
            0x06 => read_array(&self.vram, Self::mirror_vram(aligned), size),
            0x07 => read_array(&self.oam, aligned as usize & 0x3ff, size),
            0x08..=0x0d => {
                if self.save.is_eeprom_address(aligned, self.rom.len()) {
                    return self.save.eeprom_read() as u32;
                }
                let offset = aligned as usize & (ROM_MAX - 1);
                if offset + size as usize <= self.rom.len() {
                    read_array(&self.rom, offset, size)
                } else {
                    self.out_of_range(aligned, size)
                }
            }
            0x0e | 0x0f => {
                // 8 bit bus: wider reads replicate the byte.
                let byte = self.save.read8(aligned) as u32;
                match size {
                    Size::Byte => byte,
                    Size::Half => byte * 0x0101,
                    Size::Word => byte * 0x0101_0101,
                }
            }
            _ => {
                log::debug!("open bus read at {:08x}", address);
                self.open_bus & size.mask()
            }
        }
    }

    /// Reads past the end of the ROM image return the prefetch pattern
    /// `(addr/2) | ((addr/2+1) << 16)`.
    fn out_of_range(&self, address: u32, size: Size) -> u32 {
        let half = address >> 1;
        match size {
            Size::Byte => half >> ((address & 1) * 8) & 0xff,
            Size::Half => half & 0xffff,
            Size::Word => (half & 0xffff) | (half.wrapping_add(1) << 16),
        }
    }

    // ---- write side ----

    pub fn write8(&mut self, address: u32, value: u8, access: Access) {
        self.charge(address, Size::Byte, access);
        self.open_bus = value as u32 * 0x0101_0101;
        match address >> 24 {
            0x05 => {
                // 8 bit palette writes drive the byte onto both halves of the
                // containing halfword.
                let offset = address as usize & 0x3fe;
                self.palette[offset] = value;
                self.palette[offset + 1] = value;
            }
            0x06 => {
                let offset = Self::mirror_vram(address) & !1;
                self.vram[offset] = value;
                self.vram[offset + 1] = value;
            }
            0x07 => {} // 8 bit OAM writes are dropped
            _ => self.store(address, value as u32, Size::Byte),
        }
    }

    pub fn write16(&mut self, address: u32, value: u16, access: Access) {
        self.charge(address, Size::Half, access);
        self.open_bus = value as u32 | (value as u32) << 16;
        self.store(Size::Half.align(address), value as u32, Size::Half);
    }

    pub fn write32(&mut self, address: u32, value: u32, access: Access) {
        self.charge(address, Size::Word, access);
        self.open_bus = value;
        self.store(Size::Word.align(address), value, Size::Word);
    }

    fn store(&mut self, address: u32, value: u32, size: Size) {
        match address >> 24 {
            0x00 => log::debug!("write to BIOS ROM at {:08x} ignored", address),
            0x02 => write_array(&mut self.ewram, address as usize & 0x3ffff, value, size),
            0x03 => write_array(&mut self.iwram, address as usize & 0x7fff, value, size),
            0x04 => self.io_write(address, value, size),
            0x05 => write_array(&mut self.palette, address as usize & 0x3ff, value, size),
            0x06 => write_array(&mut self.vram, Self::mirror_vram(address), value, size),
            0x07 => write_array(&mut self.oam, address as usize & 0x3ff, value, size),
            0x08..=0x0d => {
                if self.save.is_eeprom_address(address, self.rom.len()) {
                    self.save.eeprom_write(value & 1 != 0);
                } else {
                    log::debug!("write to cart ROM at {:08x} ignored", address);
                }
            }
            0x0e | 0x0f => {
                let byte = (value >> ((address & (size as u32 - 1)) * 8)).truncate();
                self.save.write8(address, byte);
            }
            _ => log::debug!("open bus write at {:08x} ignored", address),
        }
    }

    // ---- I/O register file ----

    pub fn io_half(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.ioregs[offset], self.ioregs[offset + 1]])
    }
    pub fn io_word(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.ioregs[offset],
            self.ioregs[offset + 1],
            self.ioregs[offset + 2],
            self.ioregs[offset + 3],
        ])
    }
    pub fn io_set_byte(&mut self, offset: usize, value: u8) {
        self.ioregs[offset] = value;
    }
    pub fn io_set_half(&mut self, offset: usize, value: u16) {
        self.ioregs[offset] = value as u8;
        self.ioregs[offset + 1] = (value >> 8) as u8;
    }

    fn io_read(&mut self, address: u32, size: Size) -> u32 {
        let offset = address as usize & 0x00ff_ffff;
        let mut value = 0;
        for j in 0..size as usize {
            value |= (self.io_read_byte(offset + j) as u32) << (8 * j);
        }
        value
    }

    fn io_read_byte(&mut self, offset: usize) -> u8 {
        // The internal memory control register is mirrored every 64K.
        if offset & 0xffff >= 0x800 && offset & 0xffff < 0x804 {
            return self.imc[offset & 3];
        }
        if offset >= IO_SIZE {
            log::debug!("unmapped I/O read at 04{:06x}", offset);
            return 0;
        }
        match offset & !1 {
            io::TM0CNT_L | 0x104 | 0x108 | 0x10c => {
                let timer = (offset - io::TM0CNT_L) / io::TM_STRIDE;
                (self.timer_counters[timer] >> ((offset & 1) * 8)) as u8
            }
            _ => self.ioregs[offset],
        }
    }

    fn io_write(&mut self, address: u32, value: u32, size: Size) {
        let offset = address as usize & 0x00ff_ffff;
        for j in 0..size as usize {
            self.io_write_byte(offset + j, (value >> (8 * j)).truncate());
        }
    }

    fn io_write_byte(&mut self, offset: usize, value: u8) {
        if offset & 0xffff >= 0x800 && offset & 0xffff < 0x804 {
            self.imc[offset & 3] = value;
            return;
        }
        if offset >= IO_SIZE {
            log::debug!("unmapped I/O write at 04{:06x} ignored", offset);
            return;
        }
        match offset {
            // Pending interrupt flags acknowledge on writing ones.
            io::IF | 0x203 => self.ioregs[offset] &= !value,
            // Read-only registers.
            io::VCOUNT | 0x007 | io::KEYINPUT | 0x131 => {}
            io::HALTCNT => {
                if value & 0x80 != 0 {
                    log::warn!("STOP mode requested, treating as halt");
                }
                self.halted = true;
            }
            io::WAITCNT | 0x205 => {
                self.ioregs[offset] = value;
                self.refresh_waitstates();
            }
            _ => self.ioregs[offset] = value,
        }
    }

    // ---- interrupt controller ----

    pub fn ime(&self) -> bool {
        self.ioregs[io::IME] & 1 != 0
    }
    pub fn interrupt_enable(&self) -> u16 {
        self.io_half(io::IE)
    }
    pub fn interrupt_flags(&self) -> u16 {
        self.io_half(io::IF)
    }
    /// Latch a rising interrupt line into IF and wake the CPU if the source
    /// is enabled.
    pub fn request_interrupt(&mut self, interrupt: Interrupt) {
        let flags = self.interrupt_flags() | interrupt.bit();
        self.io_set_half(io::IF, flags);
        if self.interrupt_enable() & flags != 0 {
            self.halted = false;
        }
    }
    /// True when the controller asserts the IRQ line towards the CPU.
    pub fn irq_pending(&self) -> bool {
        self.ime() && self.interrupt_enable() & self.interrupt_flags() != 0
    }

    // ---- snapshots ----

    pub fn save_state(&self, out: &mut Vec<u8>) {
        for array in [
            &self.ewram,
            &self.iwram,
            &self.ioregs,
            &self.palette,
            &self.vram,
            &self.oam,
        ]
        .iter()
        {
            out.extend_from_slice(array);
        }
        out.extend_from_slice(&self.imc);
        out.extend_from_slice(&self.fetch_addr.to_le_bytes());
        out.extend_from_slice(&self.bios_latch.to_le_bytes());
        out.extend_from_slice(&self.open_bus.to_le_bytes());
        for counter in self.timer_counters.iter() {
            out.extend_from_slice(&counter.to_le_bytes());
        }
        out.push(self.halted as u8);
        out.extend_from_slice(&(self.save.data().len() as u32).to_le_bytes());
        out.extend_from_slice(self.save.data());
    }

    pub fn load_state(&mut self, input: &mut &[u8]) -> Result<(), crate::StateError> {
        self.ewram.copy_from_slice(crate::take(input, EWRAM_SIZE)?);
        self.iwram.copy_from_slice(crate::take(input, IWRAM_SIZE)?);
        self.ioregs.copy_from_slice(crate::take(input, IO_SIZE)?);
        self.palette.copy_from_slice(crate::take(input, PALETTE_SIZE)?);
        self.vram.copy_from_slice(crate::take(input, VRAM_SIZE)?);
        self.oam.copy_from_slice(crate::take(input, OAM_SIZE)?);
        self.imc.copy_from_slice(crate::take(input, 4)?);
        self.fetch_addr = crate::take_u32(input)?;
        self.bios_latch = crate::take_u32(input)?;
        self.open_bus = crate::take_u32(input)?;
        for j in 0..4 {
            self.timer_counters[j] = crate::take_u16(input)?;
        }
        self.halted = crate::take_u8(input)? != 0;
        let save_len = crate::take_u32(input)? as usize;
        let save_data = crate::take(input, save_len)?;
        self.save.load_data(save_data);
        self.cycles = 0;
        self.refresh_waitstates();
        Ok(())
    }

    // ---- keypad ----

    /// Latch the front end's key mask (0 = pressed) and evaluate KEYCNT.
    pub fn set_keyinput(&mut self, mask: u16) {
        self.io_set_half(io::KEYINPUT, mask & 0x3ff);
        let keycnt = self.io_half(io::KEYCNT);
        if keycnt & 0x4000 != 0 {
            let selected = keycnt & 0x3ff;
            let pressed = !mask & 0x3ff;
            let fire = if keycnt & 0x8000 != 0 {
                selected != 0 && pressed & selected == selected
            } else {
                pressed & selected != 0
            };
            if fire {
                self.request_interrupt(Interrupt::Keypad);
            }
        }
    }
}

fn read_array(memory: &[u8], offset: usize, size: Size) -> u32 {
    let mut value = 0;
    for j in 0..size as usize {
        value |= (memory[offset + j] as u32) << (8 * j);
    }
    value
}

fn write_array(memory: &mut [u8], offset: usize, value: u32, size: Size) {
    for j in 0..size as usize {
        memory[offset + j] = (value >> (8 * j)) as u8;
    }
}
