use crate::devices::{DmaTiming, H_TOTAL, H_VISIBLE_CYCLES, TOTAL_LINES, VISIBLE_LINES};
use crate::Configuration;

pub const ROM_BASE: u32 = 0x0800_0000;

// Memory map
//
//   $00000000-$00003FFF   BIOS - system ROM (16 KB, read only)
//   $02000000-$0203FFFF   on-board work RAM (256 KB, mirrored through $02FFFFFF)
//   $03000000-$03007FFF   on-chip work RAM (32 KB, mirrored through $03FFFFFF)
//   $04000000-$040003FE   I/O registers
//   $05000000-$050003FF   BG/OBJ palette RAM (1 KB, mirrored)
//   $06000000-$06017FFF   VRAM (96 KB, mirrored in 128 KB steps)
//   $07000000-$070003FF   OBJ attribute memory (1 KB, mirrored)
//   $08000000-$09FFFFFF   Game Pak ROM - wait state window 0
//   $0A000000-$0BFFFFFF   Game Pak ROM - wait state window 1
//   $0C000000-$0DFFFFFF   Game Pak ROM - wait state window 2
//   $0E000000-$0E00FFFF   Game Pak SRAM / flash (8 bit bus)

// I/O registers served by the core
//
//   $4000000.W  DISPCNT   LCD control
//   $4000004.W  DISPSTAT  LCD status (V/H blank flags, VCount setting)
//   $4000006.W  VCOUNT    Current scanline (read only)
//   $40000B0.L  DMA0SAD   DMA 0 source address
//   $40000B4.L  DMA0DAD   DMA 0 destination address
//   $40000B8.W  DMA0CNT_L DMA 0 word count
//   $40000BA.W  DMA0CNT_H DMA 0 control
//   $40000BC-$40000DE     DMA 1-3, same layout, 12 byte stride
//   $4000100.W  TM0CNT_L  Timer 0 counter/reload
//   $4000102.W  TM0CNT_H  Timer 0 control
//   $4000104-$400010E     Timer 1-3, same layout, 4 byte stride
//   $4000130.W  KEYINPUT  Key status (read only, 0 = pressed)
//   $4000132.W  KEYCNT    Key interrupt control
//   $4000200.W  IE        Interrupt enable mask
//   $4000202.W  IF        Interrupt request flags, write 1 to acknowledge
//   $4000204.W  WAITCNT   Game Pak wait state control
//   $4000208.W  IME       Interrupt master enable
//   $4000301.B  HALTCNT   Low power mode control (write only)
//   $4000800.L  IMC       Undocumented internal memory control,
//                         mirrored every 64 KB across the I/O block

/// The stock machine: execution starts at the cartridge entry vector with the
/// boot ROM already skipped.
pub fn gba() -> Configuration {
    Configuration {
        entry_point: ROM_BASE,
        bios: None,
        save_path: None,
        memory_layout: Vec::new(),
    }
}

/// Calendar event kinds. The H/V blank events re-arm themselves every raster
/// period; timer overflow slots carry the predicted wrap of the running
/// timers so halt mode can fast-forward to them; DMA trigger slots are armed
/// by the blank events they follow.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Event {
    HBlankStart,
    HBlankEnd,
    VBlankStart,
    VBlankEnd,
    TimerOverflow(usize),
    DmaTrigger(DmaTiming),
}

const EVENT_COUNT: usize = 10;
const INACTIVE: u64 = u64::max_value();

impl Event {
    fn slot(&self) -> usize {
        match *self {
            Self::HBlankStart => 0,
            Self::HBlankEnd => 1,
            Self::VBlankStart => 2,
            Self::VBlankEnd => 3,
            Self::TimerOverflow(index) => 4 + index,
            Self::DmaTrigger(DmaTiming::VBlank) => 8,
            Self::DmaTrigger(_) => 9,
        }
    }
    fn of_slot(slot: usize) -> Event {
        match slot {
            0 => Self::HBlankStart,
            1 => Self::HBlankEnd,
            2 => Self::VBlankStart,
            3 => Self::VBlankEnd,
            4..=7 => Self::TimerOverflow(slot - 4),
            8 => Self::DmaTrigger(DmaTiming::VBlank),
            _ => Self::DmaTrigger(DmaTiming::HBlank),
        }
    }
}

/// A small calendar of absolute cycle deadlines, one slot per event kind.
/// The earliest armed deadline is always at or beyond the master counter.
pub struct Scheduler {
    deadlines: [u64; EVENT_COUNT],
}

impl Scheduler {
    pub fn new() -> Self {
        let mut scheduler = Scheduler { deadlines: [INACTIVE; EVENT_COUNT] };
        scheduler.set(Event::HBlankStart, H_VISIBLE_CYCLES as u64);
        scheduler.set(Event::HBlankEnd, H_TOTAL as u64);
        scheduler.set(Event::VBlankStart, VISIBLE_LINES as u64 * H_TOTAL as u64);
        scheduler.set(Event::VBlankEnd, TOTAL_LINES as u64 * H_TOTAL as u64);
        scheduler
    }

    pub fn set(&mut self, event: Event, deadline: u64) {
        self.deadlines[event.slot()] = deadline;
    }
    pub fn clear(&mut self, event: Event) {
        self.deadlines[event.slot()] = INACTIVE;
    }

    /// Earliest armed deadline, for the halt mode fast-forward.
    pub fn next_deadline(&self) -> u64 {
        self.deadlines.iter().copied().min().unwrap_or(INACTIVE)
    }

    /// Pop the earliest event due at or before `now`, if any, along with the
    /// deadline it was armed for (periodic events re-arm relative to it).
    pub fn next_due(&mut self, now: u64) -> Option<(Event, u64)> {
        let mut earliest: Option<usize> = None;
        for (slot, &deadline) in self.deadlines.iter().enumerate() {
            if deadline <= now {
                match earliest {
                    Some(best) if self.deadlines[best] <= deadline => {}
                    _ => earliest = Some(slot),
                }
            }
        }
        earliest.map(|slot| {
            let deadline = self.deadlines[slot];
            self.deadlines[slot] = INACTIVE;
            (Event::of_slot(slot), deadline)
        })
    }

    pub fn save_state(&self, out: &mut Vec<u8>) {
        for deadline in self.deadlines.iter() {
            out.extend_from_slice(&deadline.to_le_bytes());
        }
    }
    pub fn load_state(&mut self, input: &mut &[u8]) -> Result<(), crate::StateError> {
        for slot in 0..EVENT_COUNT {
            self.deadlines[slot] = crate::take_u64(input)?;
        }
        Ok(())
    }
}
