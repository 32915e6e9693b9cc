//! Register window tests: access width faults, the FF8604 shadow, and the
//! DMA address register.

mod common;

use common::*;
use stemu_core::{
    devices::fdc::controller::{
        DMA_ADDRESS_HIGH_REGISTER,
        DMA_ADDRESS_LOW_REGISTER,
        DMA_MODE_STATUS_REGISTER,
        FDC_ACCESS_REGISTER,
        FLOPPY_MODE_REGISTER,
    },
    BusFault,
    BusWidth,
    FloppyController,
    MachineType,
};

#[test]
fn test_byte_access_to_word_registers_faults() {
    let mut h = FdcHarness::new();

    for address in [FDC_ACCESS_REGISTER, 0x00FF_8605, DMA_MODE_STATUS_REGISTER, 0x00FF_8607] {
        assert_eq!(
            h.fdc.mmio_read(address, BusWidth::Byte),
            Err(BusFault::ByteAccessOnWordRegister { address })
        );
        assert_eq!(
            h.fdc.mmio_write(address, 0, BusWidth::Byte),
            Err(BusFault::ByteAccessOnWordRegister { address })
        );
    }

    // Word access is fine.
    assert!(h.fdc.mmio_read(DMA_MODE_STATUS_REGISTER, BusWidth::Word).is_ok());
}

#[test]
fn test_unmapped_window_offsets_fault() {
    let mut h = FdcHarness::new();

    assert_eq!(
        h.fdc.mmio_read(0x00FF_8600, BusWidth::Word),
        Err(BusFault::UnmappedAccess { address: 0x00FF_8600 })
    );

    // The floppy mode register does not exist on an ST.
    assert_eq!(
        h.fdc.mmio_read(FLOPPY_MODE_REGISTER, BusWidth::Byte),
        Err(BusFault::UnmappedAccess { address: FLOPPY_MODE_REGISTER })
    );
}

#[test]
fn test_falcon_floppy_mode_register() {
    let mut fdc = FloppyController::new(MachineType::Falcon);
    assert_eq!(fdc.mmio_read(FLOPPY_MODE_REGISTER, BusWidth::Byte), Ok(0x80));
    assert!(fdc.mmio_write(FLOPPY_MODE_REGISTER, 0x01, BusWidth::Byte).is_ok());
}

#[test]
fn test_dma_status_overlays_shadow() {
    let mut h = FdcHarness::new();

    // Write through the register window; the word becomes the shadow.
    h.write_fdc_reg(1, 0xABCD);
    assert_eq!(h.read_track_reg(), 0xCD);

    // Status read: shadow bits everywhere except the three defined ones.
    // No error (bit 0 set) and sector count zero (bit 1 clear).
    assert_eq!(h.read_dma_status(), (0xABCD & !0x7) | 0x01);
}

#[test]
fn test_sector_count_is_write_only() {
    let mut h = FdcHarness::new();

    h.set_sector_count(3);

    // With the sector-count select bit still set, reads return the
    // shadow, not the counter.
    let word = h.fdc.mmio_read(FDC_ACCESS_REGISTER, BusWidth::Word).unwrap();
    assert_eq!(word, 0x0003);
    assert_eq!(h.fdc.dma().sector_count(), 3);

    // The counter shows up as the status "non-zero" bit.
    assert_ne!(h.read_dma_status() & 0x02, 0);
}

#[test]
fn test_dma_address_register() {
    let mut h = FdcHarness::new();

    h.set_dma_address(0xFF_8765);

    // Six-bit high byte on a 4MB machine; even low byte.
    assert_eq!(
        h.fdc.mmio_read(DMA_ADDRESS_HIGH_REGISTER, BusWidth::Byte),
        Ok(0x3F)
    );
    assert_eq!(
        h.fdc.mmio_read(DMA_ADDRESS_LOW_REGISTER, BusWidth::Byte),
        Ok(0x64)
    );
    assert_eq!(h.fdc.dma().address(), 0x3F_8764);
}
