//! Shared harness for driving the floppy subsystem through its public
//! register window, the way a guest program would.

#![allow(dead_code)]

use stemu_core::{
    device_types::disk::RawSectorImage,
    devices::fdc::controller::{
        DMA_ADDRESS_HIGH_REGISTER,
        DMA_ADDRESS_LOW_REGISTER,
        DMA_ADDRESS_MID_REGISTER,
        DMA_MODE_STATUS_REGISTER,
        FDC_ACCESS_REGISTER,
    },
    BusInterface,
    BusWidth,
    FloppyController,
    MachineType,
};

pub const RAM_SIZE: usize = 0x10_0000;

/// Standard double-density test geometry.
pub const TRACKS: u8 = 80;
pub const SPT: u8 = 9;

/// One revolution at 300 RPM in CPU cycles on an ST.
pub const REV: u64 = 1_600_000;

// Status register bits.
pub const ST_BUSY: u8 = 0x01;
pub const ST_INDEX: u8 = 0x02;
pub const ST_TRACK0: u8 = 0x04;
pub const ST_CRC: u8 = 0x08;
pub const ST_RNF: u8 = 0x10;
pub const ST_SPIN_UP: u8 = 0x20;
pub const ST_WPRT: u8 = 0x40;
pub const ST_MOTOR: u8 = 0x80;

/// Deterministic sector fill so any byte can be predicted from its address.
pub fn sector_byte(track: u8, side: u8, sector: u8, i: usize) -> u8 {
    (track as usize * 7 + side as usize * 13 + sector as usize * 17 + i) as u8
}

pub fn patterned_image(sides: u8) -> RawSectorImage {
    let mut data = Vec::new();
    for track in 0..TRACKS {
        for side in 0..sides {
            for sector in 1..=SPT {
                for i in 0..512 {
                    data.push(sector_byte(track, side, sector, i));
                }
            }
        }
    }
    RawSectorImage::from_vec(data, sides, SPT).unwrap()
}

pub struct FdcHarness {
    pub fdc: FloppyController,
    pub bus: BusInterface,
    mode: u16,
}

impl FdcHarness {
    pub fn new() -> Self {
        Self {
            fdc: FloppyController::new(MachineType::St),
            bus: BusInterface::new(RAM_SIZE),
            mode: 0,
        }
    }

    pub fn with_disk() -> Self {
        let mut harness = Self::new();
        harness.fdc.insert_disk(0, Box::new(patterned_image(1)));
        harness
    }

    /// Run the core, stepping finely enough to honor the index poll
    /// cadence. On an ST, CPU cycles and controller cycles are 1:1.
    pub fn run(&mut self, cycles: u64) {
        let mut remaining = cycles;
        while remaining > 0 {
            let step = remaining.min(250) as u32;
            self.fdc.run(&mut self.bus, step);
            remaining -= step as u64;
        }
    }

    /// Pin drive 0's index pulse to the current cycle, making rotational
    /// timing deterministic.
    pub fn align_index(&mut self) {
        let now = self.fdc.time();
        self.fdc.drive_mut(0).align_index_pulse(now);
    }

    /// The status byte without the IRQ-clearing side effect of a guest
    /// status read.
    pub fn peek_status(&self) -> u8 {
        self.fdc.get_debug_state().status
    }

    pub fn busy(&self) -> bool {
        self.peek_status() & ST_BUSY != 0
    }

    pub fn set_mode(&mut self, mode: u16) {
        self.mode = mode;
        self.fdc
            .mmio_write(DMA_MODE_STATUS_REGISTER, mode, BusWidth::Word)
            .unwrap();
    }

    fn select_reg(&mut self, select: u16) {
        let mode = (select << 1) | (self.mode & 0x0100);
        self.set_mode(mode);
    }

    pub fn write_fdc_reg(&mut self, select: u16, data: u16) {
        self.select_reg(select);
        self.fdc
            .mmio_write(FDC_ACCESS_REGISTER, data, BusWidth::Word)
            .unwrap();
    }

    pub fn read_fdc_reg(&mut self, select: u16) -> u16 {
        self.select_reg(select);
        self.fdc.mmio_read(FDC_ACCESS_REGISTER, BusWidth::Word).unwrap()
    }

    pub fn write_command(&mut self, command: u8) {
        self.write_fdc_reg(0, command as u16);
    }

    pub fn write_track_reg(&mut self, data: u8) {
        self.write_fdc_reg(1, data as u16);
    }

    pub fn write_sector_reg(&mut self, data: u8) {
        self.write_fdc_reg(2, data as u16);
    }

    pub fn write_data_reg(&mut self, data: u8) {
        self.write_fdc_reg(3, data as u16);
    }

    /// A guest status read, with its IRQ-clearing side effect.
    pub fn read_status(&mut self) -> u8 {
        self.read_fdc_reg(0) as u8
    }

    pub fn read_track_reg(&mut self) -> u8 {
        self.read_fdc_reg(1) as u8
    }

    pub fn read_sector_reg(&mut self) -> u8 {
        self.read_fdc_reg(2) as u8
    }

    pub fn read_dma_status(&mut self) -> u16 {
        self.fdc
            .mmio_read(DMA_MODE_STATUS_REGISTER, BusWidth::Word)
            .unwrap()
    }

    /// Reset the DMA by toggling the direction bit, leaving it set for the
    /// requested transfer direction.
    pub fn reset_dma(&mut self, write_to_disk: bool) {
        let dir = if write_to_disk { 0x0100 } else { 0x0000 };
        self.set_mode(dir ^ 0x0100);
        self.set_mode(dir);
    }

    pub fn set_sector_count(&mut self, count: u16) {
        let mode = 0x0010 | (self.mode & 0x0100);
        self.set_mode(mode);
        self.fdc
            .mmio_write(FDC_ACCESS_REGISTER, count, BusWidth::Word)
            .unwrap();
    }

    pub fn set_dma_address(&mut self, address: u32) {
        self.fdc
            .mmio_write(DMA_ADDRESS_HIGH_REGISTER, ((address >> 16) & 0xFF) as u16, BusWidth::Byte)
            .unwrap();
        self.fdc
            .mmio_write(DMA_ADDRESS_MID_REGISTER, ((address >> 8) & 0xFF) as u16, BusWidth::Byte)
            .unwrap();
        self.fdc
            .mmio_write(DMA_ADDRESS_LOW_REGISTER, (address & 0xFF) as u16, BusWidth::Byte)
            .unwrap();
    }

    /// Program DMA for a disk-to-memory transfer of `sectors` sectors.
    pub fn program_dma_read(&mut self, address: u32, sectors: u16) {
        self.reset_dma(false);
        self.set_dma_address(address);
        self.set_sector_count(sectors);
    }

    /// Program DMA for a memory-to-disk transfer of `sectors` sectors.
    pub fn program_dma_write(&mut self, address: u32, sectors: u16) {
        self.reset_dma(true);
        self.set_dma_address(address);
        self.set_sector_count(sectors);
    }
}
