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
*/

//! Module for modelling the slice of the system bus the floppy subsystem
//! sees: main memory for DMA block transfers, and the fault type raised when
//! the guest accesses the word-addressed register window with the wrong
//! width. The 68000 side of bus-error delivery belongs to the host machine.

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Byte returned when the DMA engine reads past the end of populated RAM.
pub const OPEN_BUS_BYTE: u8 = 0xFF;

/// Access width of a register window access.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BusWidth {
    Byte,
    Word,
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BusFault {
    #[error("byte access to word-addressed register {address:#08X}")]
    ByteAccessOnWordRegister { address: u32 },
    #[error("access to unmapped register window offset {address:#08X}")]
    UnmappedAccess { address: u32 },
}

/// System RAM as seen by the DMA engine. Addresses are 24-bit physical;
/// reads beyond populated memory return the open-bus byte and writes there
/// are dropped.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BusInterface {
    ram: Vec<u8>,
}

impl BusInterface {
    pub fn new(size: usize) -> Self {
        Self { ram: vec![0; size] }
    }

    pub fn size(&self) -> usize {
        self.ram.len()
    }

    pub fn read_u8(&self, address: u32) -> u8 {
        let address = (address & 0x00FF_FFFF) as usize;
        match self.ram.get(address) {
            Some(b) => *b,
            None => OPEN_BUS_BYTE,
        }
    }

    pub fn write_u8(&mut self, address: u32, data: u8) {
        let address = (address & 0x00FF_FFFF) as usize;
        match self.ram.get_mut(address) {
            Some(b) => *b = data,
            None => {
                log::warn!("write_u8(): dropped write past end of RAM: {:06X}", address);
            }
        }
    }

    /// Read a DMA-sized block. The FIFO transfers 16 bytes at a time.
    pub fn read_block(&self, address: u32, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.read_u8(address.wrapping_add(i as u32));
        }
    }

    pub fn write_block(&mut self, address: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.write_u8(address.wrapping_add(i as u32), *b);
        }
    }
}
