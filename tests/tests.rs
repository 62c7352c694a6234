use emgba::cartridge::{SaveKind, SaveMedia};
use emgba::devices::Interrupt;
use emgba::fields::{Access, Mode};
use emgba::gba::gba;
use emgba::memory::io;
use emgba::processor::Flag;
use emgba::{Configuration, Emulator, FRAME_CYCLES};

const IWRAM_BASE: u32 = 0x0300_0000;
const EWRAM_BASE: u32 = 0x0200_0000;
const VBLANK_START: u64 = 160 * 1232;

/// A machine with the program words preloaded into on-chip RAM, where
/// every access costs a single cycle.
fn test_configuration(program: &[u32]) -> Configuration {
    let mut config = gba();
    config.entry_point = IWRAM_BASE;
    for (j, &word) in program.iter().enumerate() {
        config.memory_layout.push((IWRAM_BASE + 4 * j as u32, word));
    }
    config
}

fn emulator(program: &[u32]) -> Emulator {
    Emulator::new(test_configuration(program))
}

#[test]
fn flag_round_trip() {
    // MOV R0, #1 ; CMP R0, R0
    let mut em = emulator(&[0xe3a0_0001, 0xe150_0000]);
    em.step();
    em.step();
    assert_eq!(em.cpu.get(0), 1);
    assert!(!em.cpu.flag(Flag::N));
    assert!(em.cpu.flag(Flag::Z));
    assert!(em.cpu.flag(Flag::C));
    assert!(!em.cpu.flag(Flag::V));
}

#[test]
fn rotated_read() {
    // LDR R0, [R1] with a byte-misaligned base
    let mut em = emulator(&[0xe591_0000]);
    em.bus.write32(EWRAM_BASE + 0x1000, 0xaabb_ccdd, Access::Internal);
    em.cpu.set(1, EWRAM_BASE + 0x1001);
    em.step();
    assert_eq!(em.cpu.get(0), 0xddaa_bbcc);
}

#[test]
fn rotated_read_all_offsets() {
    let mut em = emulator(&[0xe591_0000, 0xe591_0000, 0xe591_0000, 0xe591_0000]);
    em.bus.write32(EWRAM_BASE + 0x1000, 0xaabb_ccdd, Access::Internal);
    for misalignment in 0..4u32 {
        em.cpu.set(1, EWRAM_BASE + 0x1000 + misalignment);
        em.step();
        let expected = 0xaabb_ccddu32.rotate_right(misalignment * 8);
        assert_eq!(em.cpu.get(0), expected, "offset {}", misalignment);
    }
}

#[test]
fn condition_failed_is_a_fetch_and_nothing_else() {
    // MOV R0, R0 ; MOVEQ R0, #5 with Z clear
    let mut em = emulator(&[0xe1a0_0000, 0x03a0_0005]);
    em.step();
    let cpsr = em.cpu.cpsr;
    let before = em.cycles();
    em.step();
    assert_eq!(em.cpu.get(0), 0);
    assert_eq!(em.cpu.cpsr, cpsr);
    assert_eq!(em.cpu.regs[15], IWRAM_BASE + 8);
    // one sequential on-chip fetch costs a single cycle
    assert_eq!(em.cycles() - before, 1);
}

#[test]
fn register_shift_reads_pc_plus_twelve() {
    // MOV R0, R15, LSL R2 with R2 = 0
    let mut em = emulator(&[0xe1a0_021f]);
    em.cpu.set(2, 0);
    let before = em.cycles();
    em.step();
    assert_eq!(em.cpu.get(0), IWRAM_BASE + 12);
    // branch refill (2) plus the internal cycle of the register shift
    assert_eq!(em.cycles() - before, 3);
}

#[test]
fn multiply_internal_cycles_follow_rs() {
    // MOV R0, R0 ; MUL R0, R1, R2
    let mut em = emulator(&[0xe1a0_0000, 0xe000_0291]);
    em.cpu.set(1, 3);
    em.cpu.set(2, 5);
    em.step();
    let before = em.cycles();
    em.step();
    assert_eq!(em.cpu.get(0), 15);
    // sequential fetch plus one internal cycle for a one-byte Rs
    assert_eq!(em.cycles() - before, 2);

    let mut em = emulator(&[0xe1a0_0000, 0xe000_0291]);
    em.cpu.set(1, 3);
    em.cpu.set(2, 0x0001_0000);
    em.step();
    let before = em.cycles();
    em.step();
    // three significant bytes in Rs cost three internal cycles
    assert_eq!(em.cycles() - before, 4);
}

#[test]
fn long_multiply() {
    // UMULL R2, R3, R0, R1
    let mut em = emulator(&[0xe083_2091]);
    em.cpu.set(0, 0x8000_0001);
    em.cpu.set(1, 0x10);
    em.step();
    assert_eq!(em.cpu.get(2), 0x0000_0010);
    assert_eq!(em.cpu.get(3), 0x8);
    // SMULL R2, R3, R0, R1 with a negative factor
    let mut em = emulator(&[0xe0c3_2091]);
    em.cpu.set(0, (-2i32) as u32);
    em.cpu.set(1, 3);
    em.step();
    assert_eq!(em.cpu.get(2), (-6i64) as u32);
    assert_eq!(em.cpu.get(3), ((-6i64) >> 32) as u32);
}

#[test]
fn branch_and_exchange_enters_thumb() {
    // BX R3
    let mut em = emulator(&[0xe12f_ff13]);
    em.cpu.set(3, IWRAM_BASE + 0x101);
    em.step();
    assert!(em.cpu.thumb());
    assert_eq!(em.cpu.regs[15], IWRAM_BASE + 0x100);
}

#[test]
fn software_interrupt_enters_supervisor() {
    let mut em = emulator(&[0xef00_0000]);
    let cpsr = em.cpu.cpsr;
    em.step();
    assert_eq!(em.cpu.mode(), Mode::Supervisor);
    assert_eq!(em.cpu.regs[15], 0x08);
    assert_eq!(em.cpu.get(14), IWRAM_BASE + 4);
    assert!(em.cpu.flag(Flag::I));
    assert_eq!(em.cpu.spsr(), cpsr);
}

#[test]
fn mode_banking_matches_the_bank_table() {
    let mut em = emulator(&[0xe1a0_0000]);
    em.cpu.set(8, 0x1111);
    em.cpu.set(13, 0x2222);
    let user_sp = em.cpu.get(13);
    em.cpu.switch_mode(Mode::Fiq);
    // FIQ banks r8-r14
    assert_eq!(em.cpu.get(8), 0);
    assert_eq!(em.cpu.get(13), 0);
    em.cpu.set(8, 0x3333);
    assert_eq!(em.cpu.get_user(8), 0x1111);
    assert_eq!(em.cpu.get_user(13), user_sp);
    em.cpu.switch_mode(Mode::Irq);
    // IRQ banks only r13/r14, so r8 shows the user copy again
    assert_eq!(em.cpu.get(8), 0x1111);
    assert_eq!(em.cpu.get(13), 0x0300_7fa0);
    em.cpu.switch_mode(Mode::System);
    assert_eq!(em.cpu.get(8), 0x1111);
    assert_eq!(em.cpu.get(13), 0x2222);
}

#[test]
fn ldm_with_s_bit_and_pc_restores_the_saved_psr() {
    // LDMIA R0!, {R15}^ out of Supervisor with SPSR pointing at User
    let mut em = emulator(&[0xe8f0_8000]);
    em.cpu.switch_mode(Mode::Supervisor);
    em.cpu.set_spsr(0x6000_0010);
    em.cpu.set(0, EWRAM_BASE + 0x1000);
    em.bus.write32(EWRAM_BASE + 0x1000, EWRAM_BASE + 0x100, Access::Internal);
    em.step();
    assert_eq!(em.cpu.mode(), Mode::User);
    assert!(em.cpu.flag(Flag::Z));
    assert!(em.cpu.flag(Flag::C));
    assert!(!em.cpu.flag(Flag::N));
    assert_eq!(em.cpu.regs[15], EWRAM_BASE + 0x100);
    assert_eq!(em.cpu.get_user(0), EWRAM_BASE + 0x1004);
}

#[test]
fn stm_with_base_first_in_list_stores_the_original_base() {
    // STMIA R0!, {R0,R1}
    let mut em = emulator(&[0xe8a0_0003]);
    em.cpu.set(0, EWRAM_BASE + 0x2000);
    em.cpu.set(1, 0x1111_1111);
    em.step();
    assert_eq!(em.bus.view32(EWRAM_BASE + 0x2000), EWRAM_BASE + 0x2000);
    assert_eq!(em.bus.view32(EWRAM_BASE + 0x2004), 0x1111_1111);
    assert_eq!(em.cpu.get(0), EWRAM_BASE + 0x2008);
}

#[test]
fn stm_with_base_second_in_list_stores_the_written_back_base() {
    // STMIA R1!, {R0,R1}
    let mut em = emulator(&[0xe8a1_0003]);
    em.cpu.set(0, 0x77);
    em.cpu.set(1, EWRAM_BASE + 0x2000);
    em.step();
    assert_eq!(em.bus.view32(EWRAM_BASE + 0x2000), 0x77);
    assert_eq!(em.bus.view32(EWRAM_BASE + 0x2004), EWRAM_BASE + 0x2008);
    assert_eq!(em.cpu.get(1), EWRAM_BASE + 0x2008);
}

#[test]
fn ldm_with_base_in_list_suppresses_writeback() {
    // LDMIA R0!, {R0,R1}
    let mut em = emulator(&[0xe8b0_0003]);
    em.cpu.set(0, EWRAM_BASE + 0x2000);
    em.bus.write32(EWRAM_BASE + 0x2000, 0xaaaa, Access::Internal);
    em.bus.write32(EWRAM_BASE + 0x2004, 0xbbbb, Access::Internal);
    em.step();
    assert_eq!(em.cpu.get(0), 0xaaaa);
    assert_eq!(em.cpu.get(1), 0xbbbb);
}

#[test]
fn ldm_with_empty_list_transfers_r15_and_a_full_block() {
    // LDMIA R0, {} assembles to an empty register list
    let mut em = emulator(&[0xe890_0000]);
    em.cpu.set(0, EWRAM_BASE + 0x2000);
    em.bus.write32(EWRAM_BASE + 0x2000, EWRAM_BASE + 0x200, Access::Internal);
    em.step();
    assert_eq!(em.cpu.regs[15], EWRAM_BASE + 0x200);
    assert_eq!(em.cpu.get(0), EWRAM_BASE + 0x2040);
}

#[test]
fn block_transfer_descending_addresses() {
    // STMDB R0!, {R1,R2} then LDMIA R0!, {R3,R4}
    let mut em = emulator(&[0xe920_0006, 0xe8b0_0018]);
    em.cpu.set(0, EWRAM_BASE + 0x2010);
    em.cpu.set(1, 0xdead);
    em.cpu.set(2, 0xbeef);
    em.step();
    assert_eq!(em.cpu.get(0), EWRAM_BASE + 0x2008);
    assert_eq!(em.bus.view32(EWRAM_BASE + 0x2008), 0xdead);
    assert_eq!(em.bus.view32(EWRAM_BASE + 0x200c), 0xbeef);
    em.step();
    assert_eq!(em.cpu.get(3), 0xdead);
    assert_eq!(em.cpu.get(4), 0xbeef);
    assert_eq!(em.cpu.get(0), EWRAM_BASE + 0x2010);
}

#[test]
fn thumb_long_branch_pair() {
    // the BL prefix/suffix pair F000 F801 out of cartridge space
    let mut rom = vec![0u8; 0x200];
    rom[0x100..0x104].copy_from_slice(&[0x00, 0xf0, 0x01, 0xf8]);
    let mut em = emulator(&[]);
    em.load_rom(&rom).unwrap();
    em.cpu.set_flag(Flag::T, true);
    em.cpu.regs[15] = 0x0800_0100;
    em.step();
    em.step();
    assert_eq!(em.cpu.regs[15], 0x0800_0106);
    assert_eq!(em.cpu.get(14), 0x0800_0103);
}

#[test]
fn thumb_push_and_pop() {
    // PUSH {R0,R1} ; POP {R2,R3}
    let mut em = emulator(&[0xbc0c_b403]);
    em.cpu.set_flag(Flag::T, true);
    em.cpu.set(0, 0x1234);
    em.cpu.set(1, 0x5678);
    let sp = em.cpu.get(13);
    em.step();
    assert_eq!(em.cpu.get(13), sp - 8);
    em.step();
    assert_eq!(em.cpu.get(2), 0x1234);
    assert_eq!(em.cpu.get(3), 0x5678);
    assert_eq!(em.cpu.get(13), sp);
}

#[test]
fn thumb_alu_and_add() {
    // LSL R0, R1, #4 ; ADD R2, R1, R0
    let mut em = emulator(&[0x180a_0108]);
    em.cpu.set_flag(Flag::T, true);
    em.cpu.set(1, 0x11);
    em.step();
    assert_eq!(em.cpu.get(0), 0x110);
    em.step();
    assert_eq!(em.cpu.get(2), 0x121);
}

#[test]
fn halfword_and_signed_transfers() {
    // STRH R1, [R0] ; LDRSH R2, [R0] ; LDRSB R3, [R0]
    let mut em = emulator(&[0xe1c0_10b0, 0xe1d0_20f0, 0xe1d0_30d0]);
    em.cpu.set(0, EWRAM_BASE + 0x3000);
    em.cpu.set(1, 0x8001);
    em.step();
    em.step();
    em.step();
    assert_eq!(em.bus.view32(EWRAM_BASE + 0x3000) & 0xffff, 0x8001);
    assert_eq!(em.cpu.get(2), 0xffff_8001);
    assert_eq!(em.cpu.get(3), 0x0000_0001);
}

#[test]
fn ldrsh_from_odd_address_degenerates_to_byte() {
    // LDRSH R2, [R0] from an odd address
    let mut em = emulator(&[0xe1d0_20f0]);
    em.bus.write16(EWRAM_BASE + 0x3000, 0x80ff, Access::Internal);
    em.cpu.set(0, EWRAM_BASE + 0x3001);
    em.step();
    assert_eq!(em.cpu.get(2), 0xffff_ff80);
}

#[test]
fn swap_is_read_rotated_write_unrotated() {
    // SWP R2, R1, [R0]
    let mut em = emulator(&[0xe100_2091]);
    em.bus.write32(EWRAM_BASE + 0x3000, 0x1122_3344, Access::Internal);
    em.cpu.set(0, EWRAM_BASE + 0x3002);
    em.cpu.set(1, 0xaabb_ccdd);
    em.step();
    assert_eq!(em.cpu.get(2), 0x3344_1122);
    assert_eq!(em.bus.view32(EWRAM_BASE + 0x3000), 0xaabb_ccdd);
}

#[test]
fn width_round_trips_per_region() {
    let mut em = emulator(&[]);
    let regions = [EWRAM_BASE + 0x100, IWRAM_BASE + 0x100, 0x0600_0100, 0x0500_0100, 0x0700_0100];
    for &base in regions.iter() {
        em.bus.write32(base, 0xcafe_babe, Access::Internal);
        assert_eq!(em.bus.read32(base, Access::Internal), 0xcafe_babe, "at {:08x}", base);
        em.bus.write16(base, 0x1234, Access::Internal);
        assert_eq!(em.bus.read16(base, Access::Internal), 0x1234, "at {:08x}", base);
    }
    // byte writes are honored in the RAM banks
    em.bus.write8(EWRAM_BASE + 0x100, 0x42, Access::Internal);
    assert_eq!(em.bus.read8(EWRAM_BASE + 0x100, Access::Internal), 0x42);
}

#[test]
fn palette_byte_writes_broadcast_and_oam_byte_writes_drop() {
    let mut em = emulator(&[]);
    em.bus.write8(0x0500_0021, 0x42, Access::Internal);
    assert_eq!(em.bus.read16(0x0500_0020, Access::Internal), 0x4242);
    em.bus.write8(0x0600_0011, 0x9a, Access::Internal);
    assert_eq!(em.bus.read16(0x0600_0010, Access::Internal), 0x9a9a);
    em.bus.write16(0x0700_0010, 0x1234, Access::Internal);
    em.bus.write8(0x0700_0010, 0xff, Access::Internal);
    assert_eq!(em.bus.read16(0x0700_0010, Access::Internal), 0x1234);
}

#[test]
fn mirrored_regions_alias() {
    let mut em = emulator(&[]);
    em.bus.write32(EWRAM_BASE + 0x20, 0x1111_2222, Access::Internal);
    assert_eq!(em.bus.view32(0x0204_0020), 0x1111_2222);
    em.bus.write32(IWRAM_BASE + 0x40, 0x3333_4444, Access::Internal);
    assert_eq!(em.bus.view32(0x0300_8040), 0x3333_4444);
    // the last 32K of VRAM repeat inside the 128K block
    em.bus.write16(0x0601_0000, 0xbeef, Access::Internal);
    assert_eq!(em.bus.read16(0x0601_8000, Access::Internal), 0xbeef);
}

#[test]
fn out_of_range_rom_reads_return_the_prefetch_pattern() {
    let mut em = emulator(&[]);
    em.load_rom(&vec![0xff; 0x200]).unwrap();
    let address = 0x0800_1000u32;
    let half = address >> 1;
    let expected = (half & 0xffff) | (half.wrapping_add(1) << 16);
    assert_eq!(em.bus.read32(address, Access::Internal), expected);
    assert_eq!(em.bus.read16(address, Access::Internal), half & 0xffff);
}

#[test]
fn open_bus_returns_the_last_driven_value() {
    let mut em = emulator(&[]);
    em.bus.write32(EWRAM_BASE, 0x5555_aaaa, Access::Internal);
    let _ = em.bus.read32(EWRAM_BASE, Access::Internal);
    assert_eq!(em.bus.read32(0x0100_0000, Access::Internal), 0x5555_aaaa);
}

#[test]
fn waitcnt_reprograms_the_cart_windows() {
    let mut em = emulator(&[]);
    em.load_rom(&vec![0u8; 0x40000]).unwrap();
    em.bus.reset_cycles();
    em.bus.read16(0x0800_0000, Access::NonSequential);
    // default wait state 0: 4 waits on a first access
    assert_eq!(em.bus.cycles(), 5);
    em.bus.reset_cycles();
    em.bus.read16(0x0800_0002, Access::Sequential);
    assert_eq!(em.bus.cycles(), 3);
    em.bus.reset_cycles();
    // a 32 bit ROM access is charged as two halfword cycles
    em.bus.read32(0x0800_0004, Access::NonSequential);
    assert_eq!(em.bus.cycles(), 8);
    // reprogram window 0 to 2/1
    em.bus.write16(0x0400_0204, 0x0018, Access::Internal);
    em.bus.reset_cycles();
    em.bus.read16(0x0800_0000, Access::NonSequential);
    assert_eq!(em.bus.cycles(), 3);
    em.bus.reset_cycles();
    em.bus.read16(0x0800_0002, Access::Sequential);
    assert_eq!(em.bus.cycles(), 2);
}

#[test]
fn rom_block_boundary_forces_nonsequential() {
    let mut em = emulator(&[]);
    em.load_rom(&vec![0u8; 0x40000]).unwrap();
    em.bus.reset_cycles();
    // first access of a 128K block ignores the sequential hint
    em.bus.read16(0x0802_0000, Access::Sequential);
    assert_eq!(em.bus.cycles(), 5);
    em.bus.reset_cycles();
    em.bus.read16(0x0802_0002, Access::Sequential);
    assert_eq!(em.bus.cycles(), 3);
}

#[test]
fn dma_immediate_transfer_and_cycle_charge() {
    // B . in on-chip RAM keeps the CPU busy at 2 cycles per step
    let mut em = emulator(&[0xeaff_fffe]);
    em.bus.write32(EWRAM_BASE, 0x1111_2222, Access::Internal);
    em.bus.write32(EWRAM_BASE + 4, 0x3333_4444, Access::Internal);
    em.step();
    let base = io::DMA0SAD + 3 * io::DMA_STRIDE;
    em.bus.write32(0x0400_0000 + base as u32, EWRAM_BASE, Access::Internal);
    em.bus.write32(0x0400_0000 + base as u32 + 4, 0x0600_0000, Access::Internal);
    em.bus.write16(0x0400_0000 + io::DMA0CNT_L as u32 + 3 * io::DMA_STRIDE as u32, 4, Access::Internal);
    em.bus.write16(0x0400_0000 + io::DMA0CNT_H as u32 + 3 * io::DMA_STRIDE as u32, 0x8000, Access::Internal);
    let before = em.cycles();
    em.step();
    assert_eq!(em.bus.view32(0x0600_0000), 0x1111_2222);
    assert_eq!(em.bus.view32(0x0600_0004), 0x3333_4444);
    // 2 cycles for the branch, 2 internal start cycles, then 4 reads from
    // EWRAM (3+3+3+3) and 4 writes to VRAM (1+1+1+1)
    assert_eq!(em.cycles() - before, 2 + 2 + 12 + 4);
    // without repeat the enable bit clears on completion
    let cnt = em.bus.io_half(io::DMA0CNT_H + 3 * io::DMA_STRIDE);
    assert_eq!(cnt & 0x8000, 0);
}

#[test]
fn dma_on_vblank_start() {
    let mut em = emulator(&[0xeaff_fffe]);
    for j in 0..4u32 {
        em.bus.write16(EWRAM_BASE + 2 * j, 0x1000 + j as u16, Access::Internal);
    }
    let base = 0x0400_0000 + (io::DMA0SAD + 3 * io::DMA_STRIDE) as u32;
    em.bus.write32(base, EWRAM_BASE, Access::Internal);
    em.bus.write32(base + 4, 0x0600_0000, Access::Internal);
    em.bus.write16(base + 8, 4, Access::Internal);
    em.bus.write16(base + 10, 0x9000, Access::Internal);
    em.run_until(VBLANK_START - 16);
    // nothing moves before the blanking edge
    assert_eq!(em.bus.view32(0x0600_0000), 0);
    let before = em.cycles();
    while em.cycles() < VBLANK_START {
        em.step();
    }
    // the looping branch costs 2 cycles per step up to the edge; the block
    // behind it adds 2 internal start cycles, four EWRAM reads at 3 cycles
    // and four VRAM writes at 1 cycle
    assert_eq!(em.cycles() - before, (VBLANK_START - before) + 2 + 12 + 4);
    assert_eq!(em.bus.read16(0x0600_0000, Access::Internal), 0x1000);
    assert_eq!(em.bus.read16(0x0600_0006, Access::Internal), 0x1003);
    assert_eq!(em.bus.io_half(io::DMA0CNT_H + 3 * io::DMA_STRIDE) & 0x8000, 0);
}

#[test]
fn timer_overflow_raises_irq_at_the_next_boundary() {
    // MSR CPSR_c, #0x10 drops the I mask, then a NOP retires
    let mut em = emulator(&[0xe321_f010, 0xe1a0_0000]);
    em.cpu.set_flag(Flag::I, true);
    em.bus.write16(0x0400_0100, 0xfffe, Access::Internal);
    em.bus.write16(0x0400_0102, 0x00c0, Access::Internal);
    em.bus.write16(0x0400_0200, 1 << Interrupt::Timer0 as u16, Access::Internal);
    em.bus.write16(0x0400_0208, 1, Access::Internal);
    em.step();
    assert_eq!(em.cycles(), 2);
    assert_eq!(em.bus.interrupt_flags(), 0);
    // the IRQ link register is the boundary PC plus 4
    let boundary = em.cpu.regs[15] + 4;
    em.step();
    // the reload of 0xFFFE wraps after three cycles, enable latency included
    assert_eq!(em.cycles(), 3);
    assert!(em.bus.interrupt_flags() & Interrupt::Timer0.bit() != 0);
    assert_eq!(em.cpu.mode(), Mode::Irq);
    assert_eq!(em.cpu.get(14), boundary + 4);
    assert_eq!(em.cpu.regs[15], 0x18);
    assert!(em.cpu.flag(Flag::I));
}

#[test]
fn timer_cascade_counts_overflows_of_the_previous_timer() {
    let mut em = emulator(&[0xeaff_fffe]);
    // timer 1 cascades; timer 0 wraps every tick off a 0xFFFF reload
    em.bus.write16(0x0400_0106, 0x0084, Access::Internal);
    em.step();
    em.bus.write16(0x0400_0100, 0xffff, Access::Internal);
    em.bus.write16(0x0400_0102, 0x0080, Access::Internal);
    let start = em.cycles();
    for _ in 0..8 {
        em.step();
    }
    let elapsed = (em.cycles() - start) as u16;
    assert_eq!(em.bus.timer_counters[1], elapsed - 1);
}

#[test]
fn timer_cascade_is_independent_of_the_prescaler() {
    let mut em = emulator(&[0xeaff_fffe]);
    em.bus.write16(0x0400_0106, 0x0084, Access::Internal);
    em.step();
    // prescaler 64 on timer 0
    em.bus.write16(0x0400_0100, 0xffff, Access::Internal);
    em.bus.write16(0x0400_0102, 0x0081, Access::Internal);
    let start = em.cycles();
    while em.cycles() - start < 200 {
        em.step();
    }
    let ticks = (em.cycles() - start - 1) / 64;
    assert_eq!(em.bus.timer_counters[1] as u64, ticks);
}

#[test]
fn halt_fast_forwards_to_the_waking_interrupt() {
    let mut em = emulator(&[0xeaff_fffe]);
    // VBlank IRQ enabled in DISPSTAT and IE
    em.bus.write16(0x0400_0004, 0x0008, Access::Internal);
    em.bus.write16(0x0400_0200, 1, Access::Internal);
    em.bus.write16(0x0400_0208, 1, Access::Internal);
    em.bus.write8(0x0400_0301, 0, Access::Internal);
    em.run_until(VBLANK_START + 16);
    assert!(em.bus.interrupt_flags() & Interrupt::VBlank.bit() != 0);
    assert_eq!(em.cpu.mode(), Mode::Irq);
    assert!(!em.bus.halted);
    // the skipped stretch passed in a handful of loop iterations
    assert!(em.cycles() >= VBLANK_START);
}

#[test]
fn keypad_matches_against_keycnt() {
    let mut em = emulator(&[0xeaff_fffe]);
    // IRQ on button A, OR condition
    em.bus.write16(0x0400_0132, 0x4001, Access::Internal);
    em.set_inputs(0x3ff & !1);
    em.run_until(FRAME_CYCLES + 16);
    assert!(em.bus.interrupt_flags() & Interrupt::Keypad.bit() != 0);
    assert_eq!(em.bus.io_half(io::KEYINPUT), 0x3fe);
}

#[test]
fn vcount_and_dispstat_track_the_beam() {
    let mut em = emulator(&[0xeaff_fffe]);
    em.run_until(3 * 1232 + 16);
    assert_eq!(em.bus.io_half(io::VCOUNT), 3);
    em.run_until(VBLANK_START + 16);
    assert!(em.bus.io_half(io::DISPSTAT) & 1 != 0);
    em.run_until(FRAME_CYCLES + 16);
    assert!(em.bus.io_half(io::DISPSTAT) & 1 == 0);
}

#[test]
fn vcounter_match_interrupt() {
    let mut em = emulator(&[0xeaff_fffe]);
    // match on scanline 5 with the VCounter IRQ enabled
    em.bus.write16(0x0400_0004, 0x0520, Access::Internal);
    em.run_until(5 * 1232 + 16);
    assert!(em.bus.io_half(io::DISPSTAT) & 4 != 0);
    assert!(em.bus.interrupt_flags() & Interrupt::VCounterMatch.bit() != 0);
}

#[test]
fn interrupt_acknowledge_is_write_one_to_clear() {
    let mut em = emulator(&[0xeaff_fffe]);
    em.bus.request_interrupt(Interrupt::Timer2);
    em.bus.request_interrupt(Interrupt::VBlank);
    em.bus.write16(0x0400_0202, Interrupt::Timer2.bit(), Access::Internal);
    assert_eq!(em.bus.interrupt_flags(), Interrupt::VBlank.bit());
}

#[test]
fn irq_is_masked_by_cpsr_and_ime() {
    let mut em = emulator(&[0xe1a0_0000, 0xe1a0_0000, 0xe1a0_0000]);
    em.bus.write16(0x0400_0200, 1, Access::Internal);
    em.bus.request_interrupt(Interrupt::VBlank);
    em.step();
    // IME is still off
    assert_eq!(em.cpu.mode(), Mode::System);
    em.bus.write16(0x0400_0208, 1, Access::Internal);
    em.cpu.set_flag(Flag::I, true);
    em.step();
    assert_eq!(em.cpu.mode(), Mode::System);
    em.cpu.set_flag(Flag::I, false);
    em.step();
    assert_eq!(em.cpu.mode(), Mode::Irq);
}

#[test]
fn save_type_detection_scans_the_image() {
    let mut rom = vec![0u8; 0x100];
    rom.extend_from_slice(b"FLASH1024_V102");
    assert_eq!(SaveKind::detect(&rom), SaveKind::Flash1024);
    let mut rom = vec![0u8; 0x100];
    rom.extend_from_slice(b"EEPROM_V111");
    assert_eq!(SaveKind::detect(&rom), SaveKind::Eeprom);
    // no driver string falls back to SRAM
    assert_eq!(SaveKind::detect(&vec![0u8; 0x100]), SaveKind::Sram);
}

#[test]
fn sram_is_byte_wide() {
    let mut em = emulator(&[]);
    em.load_rom(&vec![0u8; 0x200]).unwrap();
    em.bus.write8(0x0e00_0010, 0x5a, Access::Internal);
    assert_eq!(em.bus.read8(0x0e00_0010, Access::Internal), 0x5a);
    // wider reads replicate the byte on the 8 bit bus
    assert_eq!(em.bus.read16(0x0e00_0010, Access::Internal), 0x5a5a);
}

#[test]
fn flash_command_sequences() {
    let mut rom = vec![0u8; 0x100];
    rom.extend_from_slice(b"FLASH512_V131");
    let mut em = emulator(&[]);
    em.load_rom(&rom).unwrap();
    // enter chip identification mode
    em.bus.write8(0x0e00_5555, 0xaa, Access::Internal);
    em.bus.write8(0x0e00_2aaa, 0x55, Access::Internal);
    em.bus.write8(0x0e00_5555, 0x90, Access::Internal);
    assert_eq!(em.bus.read8(0x0e00_0000, Access::Internal), 0x32);
    assert_eq!(em.bus.read8(0x0e00_0001, Access::Internal), 0x1b);
    em.bus.write8(0x0e00_5555, 0xaa, Access::Internal);
    em.bus.write8(0x0e00_2aaa, 0x55, Access::Internal);
    em.bus.write8(0x0e00_5555, 0xf0, Access::Internal);
    // program a byte
    em.bus.write8(0x0e00_5555, 0xaa, Access::Internal);
    em.bus.write8(0x0e00_2aaa, 0x55, Access::Internal);
    em.bus.write8(0x0e00_5555, 0xa0, Access::Internal);
    em.bus.write8(0x0e00_0123, 0x5a, Access::Internal);
    assert_eq!(em.bus.read8(0x0e00_0123, Access::Internal), 0x5a);
    // sector erase brings the page back to 0xFF
    em.bus.write8(0x0e00_5555, 0xaa, Access::Internal);
    em.bus.write8(0x0e00_2aaa, 0x55, Access::Internal);
    em.bus.write8(0x0e00_5555, 0x80, Access::Internal);
    em.bus.write8(0x0e00_5555, 0xaa, Access::Internal);
    em.bus.write8(0x0e00_2aaa, 0x55, Access::Internal);
    em.bus.write8(0x0e00_0000, 0x30, Access::Internal);
    assert_eq!(em.bus.read8(0x0e00_0123, Access::Internal), 0xff);
}

#[test]
fn eeprom_serial_round_trip() {
    let mut media = SaveMedia::new(SaveKind::Eeprom, None);
    media.set_eeprom_width_from_dma(9);
    let block: u64 = 0xdead_beef_cafe_babe;
    // write request: preamble 10, six address bits, 64 data bits, stop
    for bit in [true, false].iter() {
        media.eeprom_write(*bit);
    }
    for j in (0..6).rev() {
        media.eeprom_write(3 >> j & 1 != 0);
    }
    for j in (0..64).rev() {
        media.eeprom_write(block >> j & 1 != 0);
    }
    media.eeprom_write(false);
    // read request: preamble 11, address, stop
    for bit in [true, true].iter() {
        media.eeprom_write(*bit);
    }
    for j in (0..6).rev() {
        media.eeprom_write(3 >> j & 1 != 0);
    }
    media.eeprom_write(false);
    // the reply leads with four dummy bits
    for _ in 0..4 {
        assert_eq!(media.eeprom_read(), 0);
    }
    let mut readback = 0u64;
    for _ in 0..64 {
        readback = readback << 1 | media.eeprom_read() as u64;
    }
    assert_eq!(readback, block);
}

#[test]
fn bios_reads_are_gated_by_the_fetch_origin() {
    let mut config = test_configuration(&[]);
    config.bios = Some(vec![0x11, 0x22, 0x33, 0x44]);
    let mut em = Emulator::new(config);
    em.bus.note_fetch(0);
    assert_eq!(em.bus.read32(0, Access::Internal), 0x4433_2211);
    em.bus.note_fetch(IWRAM_BASE);
    // from outside the BIOS only the last fetched opcode is visible
    assert_eq!(em.bus.read32(0, Access::Internal), 0x4433_2211);
}

#[test]
fn state_snapshot_round_trip() {
    let mut em = emulator(&[0xe3a0_0001, 0xe150_0000, 0xeaff_fffe]);
    em.run_until(64);
    let snapshot = em.save_state();
    let regs = em.cpu.regs;
    let cycles = em.cycles();
    em.run_until(5000);
    em.bus.write32(EWRAM_BASE, 0x1234_5678, Access::Internal);
    em.load_state(&snapshot).unwrap();
    assert_eq!(em.cpu.regs, regs);
    assert_eq!(em.cycles(), cycles);
    assert_eq!(em.bus.view32(EWRAM_BASE), 0);
    // a truncated snapshot is rejected
    assert!(em.load_state(&snapshot[..40]).is_err());
}

#[test]
fn rom_load_errors() {
    let mut em = emulator(&[]);
    assert!(em.load_rom(&[]).is_err());
    assert!(em.load_rom(&vec![0u8; 0x0200_0004]).is_err());
}

#[test]
fn undefined_opcode_enters_undefined_mode() {
    let mut em = emulator(&[0xe700_0010]);
    em.step();
    assert_eq!(em.cpu.mode(), Mode::Undefined);
    assert_eq!(em.cpu.regs[15], 0x04);
    assert_eq!(em.cpu.get(14), IWRAM_BASE + 4);
}

#[test]
fn disassembly_names_what_it_decodes() {
    let em = emulator(&[0xe3a0_0001, 0xe150_0000]);
    let listing = em.cpu.disassemble(&em.bus, 2);
    assert!(listing[0].2.starts_with("mov r0"));
    assert!(listing[1].2.starts_with("cmp r0"));
}
