/*
    stemu
    https://github.com/stemu-dev/stemu

    Copyright 2023-2026 The stemu contributors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    devices::dma.rs

    Implements the Atari ST DMA engine: the 16-byte FIFO between the floppy
    controller's data port and main memory, the 24-bit DMA address counter,
    the sector counter and the mode/status words.

*/

use modular_bitfield::{bitfield, prelude::*};
use serde_derive::{Deserialize, Serialize};

use crate::{
    bus::BusInterface,
    device_types::fdc::SECTOR_SIZE,
};

pub const DMA_FIFO_SIZE: usize = 16;

// DMA status word (read of FF8606). Only the low three bits carry meaning;
// the remaining positions reflect the FF8604 access shadow.
pub const DMA_STATUS_NO_ERROR: u16 = 0b0000_0001;
pub const DMA_STATUS_SECTOR_COUNT_NONZERO: u16 = 0b0000_0010;
pub const DMA_STATUS_DRQ: u16 = 0b0000_0100;

pub const DMA_STATUS_BITS: u16 = 0b0000_0111;

/// The DMA mode/control word, written at FF8606.
#[bitfield]
#[derive(Copy, Clone)]
pub struct DmaMode {
    #[skip]
    unused0: B1,
    /// Controller register addressed through FF8604.
    pub reg_select: B2,
    /// Route FF8604 register accesses to the HDC instead of the FDC.
    pub hdc_register: bool,
    /// FF8604 addresses the DMA sector counter.
    pub sector_count: bool,
    #[skip]
    unused5: B1,
    pub dma_enable: bool,
    /// DMA transfers service the HDC instead of the FDC.
    pub hdc_dma: bool,
    /// Transfer direction: set = memory to disk. Toggling resets the DMA.
    pub write_to_disk: bool,
    #[skip]
    unused9: B7,
}

impl DmaMode {
    pub fn from_word(word: u16) -> Self {
        DmaMode::from_bytes(word.to_le_bytes())
    }
}

/// Byte lanes of the 24-bit DMA address register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DmaAddressByte {
    High,
    Mid,
    Low,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DmaEngine {
    fifo: [u8; DMA_FIFO_SIZE],
    fifo_size: u8,
    /// Status bits; only the no-error latch (bit 0) is stored, the rest are
    /// derived at read time.
    status: u16,
    mode: u16,
    /// Each unit represents 512 bytes to transfer.
    sector_count: u16,
    bytes_in_sector: i32,
    /// The most recent word seen at FF8604; reads report unused bit
    /// positions from here.
    ff8604_recent: u16,
    /// 24-bit DMA address counter, kept word aligned.
    address: u32,
    /// Mask applied to the address high byte; 4MB machines decode six bits.
    address_high_mask: u8,
}

impl DmaEngine {
    pub fn new(address_high_mask: u8) -> Self {
        Self {
            fifo: [0; DMA_FIFO_SIZE],
            fifo_size: 0,
            status: DMA_STATUS_NO_ERROR,
            mode: 0,
            sector_count: 0,
            bytes_in_sector: SECTOR_SIZE as i32,
            ff8604_recent: 0,
            address: 0,
            address_high_mask,
        }
    }

    /// Full power-on reset.
    pub fn reset(&mut self) {
        *self = Self::new(self.address_high_mask);
    }

    /// The transfer reset triggered by toggling the direction bit of the
    /// mode word.
    pub fn reset_transfer(&mut self) {
        log::trace!("DMA transfer reset");
        self.fifo_size = 0;
        self.bytes_in_sector = SECTOR_SIZE as i32;
        self.sector_count = 0;
        self.status |= DMA_STATUS_NO_ERROR;
    }

    pub fn mode(&self) -> DmaMode {
        DmaMode::from_word(self.mode)
    }

    pub fn mode_word(&self) -> u16 {
        self.mode
    }

    pub fn write_mode(&mut self, word: u16) {
        // A flip of the direction bit resets the engine.
        if (self.mode ^ word) & 0x0100 != 0 {
            self.reset_transfer();
        }
        self.mode = word;
    }

    /// Status read at FF8606: the three meaningful bits overlaid on the
    /// FF8604 shadow. DRQ reads 0 on this platform; the DMA itself services
    /// every request.
    pub fn read_status(&self) -> u16 {
        let mut status = self.ff8604_recent & !DMA_STATUS_BITS;
        status |= self.status & DMA_STATUS_NO_ERROR;
        if self.sector_count != 0 {
            status |= DMA_STATUS_SECTOR_COUNT_NONZERO;
        }
        status
    }

    pub fn sector_count(&self) -> u16 {
        self.sector_count
    }

    pub fn set_sector_count(&mut self, count: u16) {
        log::trace!("DMA sector count set to {}", count);
        self.sector_count = count;
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn shadow_word(&self) -> u16 {
        self.ff8604_recent
    }

    pub fn set_shadow_word(&mut self, word: u16) {
        self.ff8604_recent = word;
    }

    pub fn set_shadow_low(&mut self, byte: u8) {
        self.ff8604_recent = (self.ff8604_recent & 0xFF00) | byte as u16;
    }

    pub fn read_address_byte(&self, lane: DmaAddressByte) -> u8 {
        match lane {
            DmaAddressByte::High => (self.address >> 16) as u8,
            DmaAddressByte::Mid => (self.address >> 8) as u8,
            DmaAddressByte::Low => self.address as u8,
        }
    }

    pub fn write_address_byte(&mut self, lane: DmaAddressByte, data: u8) {
        self.address = match lane {
            DmaAddressByte::High => {
                (self.address & 0x00_00FF_FF) | (((data & self.address_high_mask) as u32) << 16)
            }
            DmaAddressByte::Mid => (self.address & 0x00_FF00_FF) | ((data as u32) << 8),
            // Bit 0 is forced clear: transfers are word aligned.
            DmaAddressByte::Low => (self.address & 0x00_FFFF_00) | ((data & 0xFE) as u32),
        };
    }

    fn set_error(&mut self) {
        self.status &= !DMA_STATUS_NO_ERROR;
    }

    fn clear_error(&mut self) {
        self.status |= DMA_STATUS_NO_ERROR;
    }

    /// Account one 16-byte block against the sector counter.
    fn account_block(&mut self) {
        self.bytes_in_sector -= DMA_FIFO_SIZE as i32;
        if self.bytes_in_sector <= 0 {
            self.sector_count = self.sector_count.saturating_sub(1);
            self.bytes_in_sector = SECTOR_SIZE as i32;
        }
    }

    /// The controller-to-memory port. Bytes accumulate in the FIFO and are
    /// flushed to RAM as a 16-byte block.
    pub fn push(&mut self, bus: &mut BusInterface, data: u8) {
        self.set_shadow_low(data);

        if self.sector_count == 0 {
            self.set_error();
            return;
        }
        self.clear_error();

        self.fifo[self.fifo_size as usize] = data;
        self.fifo_size += 1;

        if self.fifo_size as usize == DMA_FIFO_SIZE {
            bus.write_block(self.address, &self.fifo);
            self.address = (self.address + DMA_FIFO_SIZE as u32) & 0x00FF_FFFF;
            let last_word = u16::from_be_bytes([self.fifo[14], self.fifo[15]]);
            self.ff8604_recent = (self.ff8604_recent & 0x00FF) | (last_word & 0xFF00);
            self.fifo_size = 0;
            self.account_block();
        }
    }

    /// The memory-to-controller port. The FIFO is refilled 16 bytes at a
    /// time and drained in hardware order.
    pub fn pull(&mut self, bus: &mut BusInterface) -> u8 {
        if self.sector_count == 0 {
            self.set_error();
            self.set_shadow_low(0);
            return 0;
        }
        self.clear_error();

        if self.fifo_size == 0 {
            bus.read_block(self.address, &mut self.fifo);
            self.address = (self.address + DMA_FIFO_SIZE as u32) & 0x00FF_FFFF;
            self.fifo_size = DMA_FIFO_SIZE as u8;
            self.account_block();
        }

        let data = self.fifo[DMA_FIFO_SIZE - self.fifo_size as usize];
        self.fifo_size -= 1;
        self.set_shadow_low(data);
        data
    }

    pub fn fifo_size(&self) -> usize {
        self.fifo_size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bus() -> BusInterface {
        BusInterface::new(0x1_0000)
    }

    fn test_dma(address: u32, sector_count: u16) -> DmaEngine {
        let mut dma = DmaEngine::new(0x3F);
        dma.write_address_byte(DmaAddressByte::High, (address >> 16) as u8);
        dma.write_address_byte(DmaAddressByte::Mid, (address >> 8) as u8);
        dma.write_address_byte(DmaAddressByte::Low, address as u8);
        dma.set_sector_count(sector_count);
        dma
    }

    #[test]
    fn test_push_flushes_blocks() {
        let mut bus = test_bus();
        let mut dma = test_dma(0x1000, 1);

        for i in 0..16u8 {
            dma.push(&mut bus, i);
        }
        assert_eq!(dma.fifo_size(), 0);
        assert_eq!(dma.address(), 0x1010);
        for i in 0..16u8 {
            assert_eq!(bus.read_u8(0x1000 + i as u32), i);
        }
        // High half of the shadow reflects the last word transferred.
        assert_eq!(dma.shadow_word() & 0xFF00, 0x0E00);
    }

    #[test]
    fn test_sector_accounting() {
        let mut bus = test_bus();
        let mut dma = test_dma(0x1000, 2);

        for i in 0..512usize {
            dma.push(&mut bus, i as u8);
        }
        assert_eq!(dma.sector_count(), 1);
        assert_eq!(dma.address(), 0x1200);

        for i in 0..512usize {
            dma.push(&mut bus, i as u8);
        }
        assert_eq!(dma.sector_count(), 0);

        // Counter exhausted: further pushes set the error bit and do not
        // touch memory.
        let before = bus.read_u8(0x1400);
        dma.push(&mut bus, 0xAA);
        assert_eq!(dma.read_status() & DMA_STATUS_NO_ERROR, 0);
        assert_eq!(bus.read_u8(0x1400), before);
    }

    #[test]
    fn test_pull_drain_order() {
        let mut bus = test_bus();
        for i in 0..16u8 {
            bus.write_u8(0x2000 + i as u32, 0x40 + i);
        }
        let mut dma = test_dma(0x2000, 1);

        // The refilled FIFO drains first-loaded byte first.
        assert_eq!(dma.pull(&mut bus), 0x40);
        assert_eq!(dma.pull(&mut bus), 0x41);
        assert_eq!(dma.address(), 0x2010);
        for i in 2..16u8 {
            assert_eq!(dma.pull(&mut bus), 0x40 + i);
        }
        assert_eq!(dma.fifo_size(), 0);
    }

    #[test]
    fn test_pull_with_no_sectors() {
        let mut bus = test_bus();
        let mut dma = test_dma(0x2000, 0);
        assert_eq!(dma.pull(&mut bus), 0);
        assert_eq!(dma.read_status() & DMA_STATUS_NO_ERROR, 0);
    }

    #[test]
    fn test_direction_toggle_resets() {
        let mut bus = test_bus();
        let mut dma = test_dma(0x3000, 4);
        dma.push(&mut bus, 0x11);
        assert_eq!(dma.fifo_size(), 1);

        dma.write_mode(0x0100);
        assert_eq!(dma.fifo_size(), 0);
        assert_eq!(dma.sector_count(), 0);
        assert_ne!(dma.read_status() & DMA_STATUS_NO_ERROR, 0);

        // Writing the same direction again does not reset.
        dma.set_sector_count(2);
        dma.write_mode(0x0100 | 0x0040);
        assert_eq!(dma.sector_count(), 2);
    }

    #[test]
    fn test_address_register_masking() {
        let mut dma = DmaEngine::new(0x3F);
        dma.write_address_byte(DmaAddressByte::High, 0xFF);
        dma.write_address_byte(DmaAddressByte::Mid, 0x34);
        dma.write_address_byte(DmaAddressByte::Low, 0x57);

        // High byte is masked to six bits, low bit is forced even.
        assert_eq!(dma.address(), 0x3F3456);
        assert_eq!(dma.read_address_byte(DmaAddressByte::High), 0x3F);
        assert_eq!(dma.read_address_byte(DmaAddressByte::Low), 0x56);
    }
}
