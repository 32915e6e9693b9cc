//! Type-III command tests: Read Address, Read Track and the unimplemented
//! Write Track.

mod common;

use common::*;
use stemu_core::device_types::fdc::{crc16, SectorId};

#[test]
fn test_read_address_after_seek() {
    let mut h = FdcHarness::with_disk();

    // Seek to track 12.
    h.write_data_reg(12);
    h.write_command(0x18);
    h.align_index();
    h.run(90 + 800 + 12 * 48_000 + 10_000);
    assert!(!h.busy());

    h.program_dma_read(0x5000, 1);
    h.write_command(0xC8);
    h.align_index();
    h.run(REV + 100_000);
    assert!(!h.busy());
    assert_eq!(h.peek_status() & ST_RNF, 0);

    // Six ID bytes sit in the FIFO; the track byte landed in the sector
    // register.
    assert_eq!(h.fdc.dma().fifo_size(), 6);
    assert_eq!(h.read_sector_reg(), 12);

    // Two more Read Address commands push the FIFO past 16 bytes so the
    // first block reaches memory.
    h.write_command(0xC8);
    h.run(REV);
    h.write_command(0xC8);
    h.run(REV);

    // Each six-byte ID starts with track and side.
    assert_eq!(h.bus.read_u8(0x5000), 12);
    assert_eq!(h.bus.read_u8(0x5001), 0);
    assert_eq!(h.bus.read_u8(0x5006), 12);
    assert_eq!(h.bus.read_u8(0x5007), 0);
    assert_eq!(h.bus.read_u8(0x500C), 12);

    let sector = h.bus.read_u8(0x5002);
    assert!(sector >= 1 && sector <= SPT);
    assert_eq!(h.bus.read_u8(0x5003), 0x02);

    let id = SectorId {
        track: 12,
        side: 0,
        sector,
        len_code: 0x02,
    };
    let crc = id.crc();
    assert_eq!(h.bus.read_u8(0x5004), (crc >> 8) as u8);
    assert_eq!(h.bus.read_u8(0x5005), crc as u8);
}

#[test]
fn test_read_address_on_missing_side() {
    let mut h = FdcHarness::with_disk();

    // Side 1 of a single-sided disk.
    h.fdc.set_drive_side(0x00, 0x04);

    h.program_dma_read(0x5000, 1);
    h.write_command(0xC8);
    h.align_index();
    h.run(REV + 100_000);

    // The command completes normally with six garbage bytes transferred
    // and no error flags.
    assert!(h.fdc.irq());
    assert!(!h.busy());
    assert_eq!(h.peek_status() & (ST_RNF | ST_CRC), 0);
    assert_eq!(h.fdc.dma().fifo_size(), 6);
}

#[test]
fn test_read_track_layout() {
    let mut h = FdcHarness::with_disk();

    // 6268 track bytes: program 13 sectors worth of DMA.
    h.program_dma_read(0x8000, 13);
    h.write_command(0xE8);
    h.align_index();

    // Wait for the index, then one revolution of data at the MFM byte
    // rate.
    h.run(4 * REV);
    assert!(!h.busy());

    let base = 0x8000u32;

    // GAP1 of 4E.
    for i in 0..60 {
        assert_eq!(h.bus.read_u8(base + i), 0x4E);
    }

    // First ID field: track 0, side 0, sector 1, 512-byte length code.
    assert_eq!(h.bus.read_u8(base + 76), 0);
    assert_eq!(h.bus.read_u8(base + 77), 0);
    assert_eq!(h.bus.read_u8(base + 78), 1);
    assert_eq!(h.bus.read_u8(base + 79), 0x02);

    // Its CRC covers the sync marks, address mark and ID bytes.
    let id_crc = crc16(&[0xA1, 0xA1, 0xA1, 0xFE, 0, 0, 1, 0x02]);
    assert_eq!(h.bus.read_u8(base + 80), (id_crc >> 8) as u8);
    assert_eq!(h.bus.read_u8(base + 81), id_crc as u8);

    // First data field payload.
    for i in 0..64 {
        assert_eq!(h.bus.read_u8(base + 120 + i as u32), sector_byte(0, 0, 1, i));
    }

    // Second sector's ID field, one layout stride later.
    assert_eq!(h.bus.read_u8(base + 76 + 614), 0);
    assert_eq!(h.bus.read_u8(base + 78 + 614), 2);

    // GAP5 fill near the end of the track.
    assert_eq!(h.bus.read_u8(base + 6000), 0x4E);

    // 6268 bytes pushed: 391 full FIFO blocks hit memory, accounting for
    // twelve 512-byte units of the sector counter.
    assert_eq!(h.fdc.dma().sector_count(), 1);
    assert_eq!(h.fdc.dma().fifo_size(), 12);
}

#[test]
fn test_write_track_reports_rnf() {
    let mut h = FdcHarness::with_disk();

    h.write_command(0xF8);
    h.align_index();
    h.run(100_000);

    assert!(!h.busy());
    assert_ne!(h.peek_status() & ST_RNF, 0);
}
