// Cartridge save media. The backend is picked by scanning the ROM image for
// the library version strings the manufacturers compiled into their save
// drivers; SRAM is the fallback. Each backend persists its raw byte array to
// a file sibling to the ROM, with no header.

use std::error::Error;
use std::fmt;
use std::fs;
use std::path::PathBuf;

pub const SRAM_SIZE: usize = 0x8000;
pub const FLASH512_SIZE: usize = 0x10000;
pub const FLASH1024_SIZE: usize = 0x20000;
pub const EEPROM_SIZE: usize = 0x2000;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum SaveKind {
    Sram,
    Flash512,
    Flash1024,
    Eeprom,
}

impl SaveKind {
    /// Scan the ROM for save driver version strings; the earliest match wins.
    pub fn detect(rom: &[u8]) -> Self {
        let patterns: [(&[u8], SaveKind); 5] = [
            (b"SRAM_V", Self::Sram),
            (b"FLASH1024_V", Self::Flash1024),
            (b"FLASH512_V", Self::Flash512),
            (b"FLASH_V", Self::Flash512),
            (b"EEPROM_V", Self::Eeprom),
        ];
        let mut found: Option<(usize, SaveKind)> = None;
        for &(pattern, kind) in patterns.iter() {
            if let Some(position) = find(rom, pattern) {
                match found {
                    Some((best, _)) if best <= position => {}
                    _ => found = Some((position, kind)),
                }
            }
        }
        match found {
            Some((_, kind)) => kind,
            None => {
                log::debug!("no save driver string in ROM, assuming SRAM");
                Self::Sram
            }
        }
    }
    pub fn capacity(&self) -> usize {
        match *self {
            Self::Sram => SRAM_SIZE,
            Self::Flash512 => FLASH512_SIZE,
            Self::Flash1024 => FLASH1024_SIZE,
            Self::Eeprom => EEPROM_SIZE,
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[derive(Debug)]
pub enum PersistError {
    Write(PathBuf, std::io::Error),
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistError::Write(path, e) => {
                write!(f, "could not persist save data to {}: {}", path.display(), e)
            }
        }
    }
}

impl Error for PersistError {}

#[derive(Debug, Copy, Clone, PartialEq)]
enum FlashState {
    Ready,
    Unlock1,
    Unlock2,
    Erase,
    EraseUnlock1,
    EraseUnlock2,
    WriteByte,
    SelectBank,
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum EepromState {
    Receive,
    Reply,
}

pub struct SaveMedia {
    kind: SaveKind,
    data: Vec<u8>,
    path: Option<PathBuf>,
    dirty: bool,
    // Flash command sequencing
    flash_state: FlashState,
    flash_bank: usize,
    chip_id_mode: bool,
    // EEPROM serial link
    eeprom_state: EepromState,
    eeprom_bits: u128,
    eeprom_count: u32,
    eeprom_addr_bits: u32,
    reply_bits: u64,
    reply_count: u32,
}

impl SaveMedia {
    pub fn new(kind: SaveKind, path: Option<PathBuf>) -> Self {
        let mut data = vec![0xff; kind.capacity()];
        if let Some(ref path) = path {
            if let Ok(stored) = fs::read(path) {
                let n = stored.len().min(data.len());
                data[..n].copy_from_slice(&stored[..n]);
                log::info!("loaded {} byte save file {}", n, path.display());
            }
        }
        SaveMedia {
            kind,
            data,
            path,
            dirty: false,
            flash_state: FlashState::Ready,
            flash_bank: 0,
            chip_id_mode: false,
            eeprom_state: EepromState::Receive,
            eeprom_bits: 0,
            eeprom_count: 0,
            eeprom_addr_bits: 6,
            reply_bits: 0,
            reply_count: 0,
        }
    }

    pub fn none() -> Self {
        Self::new(SaveKind::Sram, None)
    }

    pub fn kind(&self) -> SaveKind {
        self.kind
    }
    pub fn data(&self) -> &[u8] {
        &self.data
    }
    pub fn load_data(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
    }

    /// Write the raw array back to disk. A failure is surfaced but leaves the
    /// in-memory state intact so the run can continue.
    pub fn flush(&mut self) -> Result<(), PersistError> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(ref path) = self.path {
            fs::write(path, &self.data).map_err(|e| PersistError::Write(path.clone(), e))?;
            self.dirty = false;
        }
        Ok(())
    }

    // ---- 8 bit window at 0x0E000000 ----

    pub fn read8(&mut self, address: u32) -> u8 {
        let offset = address as usize & 0xffff;
        match self.kind {
            SaveKind::Sram => self.data[offset & (SRAM_SIZE - 1)],
            SaveKind::Flash512 | SaveKind::Flash1024 => {
                if self.chip_id_mode {
                    // Panasonic for the 512K part, Sanyo for the 1M part.
                    let id: [u8; 2] = if self.kind == SaveKind::Flash512 {
                        [0x32, 0x1b]
                    } else {
                        [0x62, 0x13]
                    };
                    return id[offset & 1];
                }
                self.data[self.flash_bank * FLASH512_SIZE + offset]
            }
            SaveKind::Eeprom => 1,
        }
    }

    pub fn write8(&mut self, address: u32, value: u8) {
        let offset = address as usize & 0xffff;
        match self.kind {
            SaveKind::Sram => {
                self.data[offset & (SRAM_SIZE - 1)] = value;
                self.dirty = true;
            }
            SaveKind::Flash512 | SaveKind::Flash1024 => self.flash_command(offset, value),
            SaveKind::Eeprom => {}
        }
    }

    fn flash_command(&mut self, offset: usize, value: u8) {
        match self.flash_state {
            FlashState::Ready | FlashState::Erase => {
                if offset == 0x5555 && value == 0xaa {
                    self.flash_state = if self.flash_state == FlashState::Erase {
                        FlashState::EraseUnlock1
                    } else {
                        FlashState::Unlock1
                    };
                }
            }
            FlashState::Unlock1 | FlashState::EraseUnlock1 => {
                if offset == 0x2aaa && value == 0x55 {
                    self.flash_state = if self.flash_state == FlashState::EraseUnlock1 {
                        FlashState::EraseUnlock2
                    } else {
                        FlashState::Unlock2
                    };
                } else {
                    self.flash_state = FlashState::Ready;
                }
            }
            FlashState::Unlock2 => {
                self.flash_state = FlashState::Ready;
                if offset != 0x5555 {
                    return;
                }
                match value {
                    0x90 => self.chip_id_mode = true,
                    0xf0 => self.chip_id_mode = false,
                    0x80 => self.flash_state = FlashState::Erase,
                    0xa0 => self.flash_state = FlashState::WriteByte,
                    0xb0 if self.kind == SaveKind::Flash1024 => {
                        self.flash_state = FlashState::SelectBank
                    }
                    _ => log::debug!("unknown flash command {:02x}", value),
                }
            }
            FlashState::EraseUnlock2 => {
                self.flash_state = FlashState::Ready;
                if value == 0x10 && offset == 0x5555 {
                    // chip erase
                    for byte in self.data.iter_mut() {
                        *byte = 0xff;
                    }
                    self.dirty = true;
                } else if value == 0x30 {
                    // 4K sector erase
                    let base = self.flash_bank * FLASH512_SIZE + (offset & 0xf000);
                    for byte in self.data[base..base + 0x1000].iter_mut() {
                        *byte = 0xff;
                    }
                    self.dirty = true;
                }
            }
            FlashState::WriteByte => {
                // Flash can only clear bits until the sector is erased.
                self.data[self.flash_bank * FLASH512_SIZE + offset] &= value;
                self.dirty = true;
                self.flash_state = FlashState::Ready;
            }
            FlashState::SelectBank => {
                if offset == 0 {
                    self.flash_bank = value as usize & 1;
                }
                self.flash_state = FlashState::Ready;
            }
        }
    }

    // ---- EEPROM serial link in the 0x0D000000 window ----

    pub fn is_eeprom_address(&self, address: u32, rom_len: usize) -> bool {
        if self.kind != SaveKind::Eeprom || address >> 24 != 0x0d {
            return false;
        }
        // Small carts decode the whole 0x0D window; 32M carts only the top 256 bytes.
        rom_len <= 0x0100_0000 || address & 0x01ff_ffff >= 0x01ff_ff00
    }

    /// The serial bus width follows from the word count the game programs
    /// into its EEPROM DMA transfers.
    pub fn set_eeprom_width_from_dma(&mut self, count: u32) {
        match count {
            9 | 73 => self.eeprom_addr_bits = 6,
            17 | 81 => self.eeprom_addr_bits = 14,
            _ => {}
        }
    }

    pub fn eeprom_write(&mut self, bit: bool) {
        self.eeprom_state = EepromState::Receive;
        self.eeprom_bits = (self.eeprom_bits << 1) | bit as u128;
        self.eeprom_count += 1;
        if self.eeprom_count < 2 {
            return;
        }
        let request = (self.eeprom_bits >> (self.eeprom_count - 2)) & 3;
        let addr_bits = self.eeprom_addr_bits;
        if request == 0b11 && self.eeprom_count == 2 + addr_bits + 1 {
            // read request: 2 bit preamble, address, stop bit
            let address = (self.eeprom_bits >> 1) & ((1 << addr_bits) - 1);
            let block = (address as usize & 0x3ff) * 8;
            let mut bits = 0u64;
            for j in 0..8 {
                bits = bits << 8 | self.data[block + j] as u64;
            }
            // replies lead with four dummy bits
            self.reply_bits = bits;
            self.reply_count = 68;
            self.eeprom_state = EepromState::Reply;
            self.reset_link();
        } else if request == 0b10 && self.eeprom_count == 2 + addr_bits + 64 + 1 {
            // write request: preamble, address, 64 data bits, stop bit
            let address = (self.eeprom_bits >> 65) & ((1 << addr_bits) - 1);
            let block = (address as usize & 0x3ff) * 8;
            let data = (self.eeprom_bits >> 1) as u64;
            for j in 0..8 {
                self.data[block + j] = (data >> (8 * (7 - j))) as u8;
            }
            self.dirty = true;
            self.reset_link();
        }
    }

    pub fn eeprom_read(&mut self) -> u8 {
        match self.eeprom_state {
            // Outside a read reply the chip reports ready.
            EepromState::Receive => 1,
            EepromState::Reply => {
                self.reply_count = self.reply_count.saturating_sub(1);
                let bit = if self.reply_count >= 64 {
                    0
                } else {
                    (self.reply_bits >> self.reply_count) as u8 & 1
                };
                if self.reply_count == 0 {
                    self.eeprom_state = EepromState::Receive;
                }
                bit
            }
        }
    }

    fn reset_link(&mut self) {
        self.eeprom_bits = 0;
        self.eeprom_count = 0;
    }
}

impl Drop for SaveMedia {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::warn!("{}", e);
        }
    }
}
