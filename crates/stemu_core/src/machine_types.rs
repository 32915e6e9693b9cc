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

    machine_types.rs

    This module manages machine-related type definitions.

*/

use std::{fmt::Display, str::FromStr};

use serde_derive::{Deserialize, Serialize};

/// Nominal WD1772 controller clock. Machine variants with a doubled
/// controller clock report twice this from [MachineType::fdc_hz].
pub const FDC_BASE_HZ: u32 = 8_000_000;

#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize, Hash, Eq, PartialEq)]
pub enum MachineType {
    #[default]
    St,
    MegaSte,
    Tt,
    Falcon,
}

impl FromStr for MachineType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String>
    where
        Self: Sized,
    {
        match s.to_lowercase().as_str() {
            "st" => Ok(MachineType::St),
            "megaste" => Ok(MachineType::MegaSte),
            "tt" => Ok(MachineType::Tt),
            "falcon" => Ok(MachineType::Falcon),
            _ => Err("Bad value for model".to_string()),
        }
    }
}

impl Display for MachineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineType::St => write!(f, "ST"),
            MachineType::MegaSte => write!(f, "Mega STE"),
            MachineType::Tt => write!(f, "TT"),
            MachineType::Falcon => write!(f, "Falcon"),
        }
    }
}

impl MachineType {
    pub fn cpu_hz(&self) -> u32 {
        match self {
            MachineType::St => 8_000_000,
            MachineType::MegaSte => 8_000_000,
            MachineType::Tt => 32_000_000,
            MachineType::Falcon => 16_000_000,
        }
    }

    /// The TT and Falcon drive the controller at twice the base clock so that
    /// HD/ED media can be read at the doubled MFM rate.
    pub fn fdc_clock_doubled(&self) -> bool {
        matches!(self, MachineType::Tt | MachineType::Falcon)
    }

    pub fn fdc_hz(&self) -> u32 {
        match self.fdc_clock_doubled() {
            true => FDC_BASE_HZ * 2,
            false => FDC_BASE_HZ,
        }
    }

    /// Machines limited to 4MB of RAM only decode six bits of the DMA
    /// address high byte.
    pub fn dma_address_high_mask(&self) -> u8 {
        match self {
            MachineType::St | MachineType::MegaSte => 0x3F,
            MachineType::Tt | MachineType::Falcon => 0xFF,
        }
    }

    /// The FF860F floppy mode/control register only exists on the Falcon.
    pub fn has_floppy_mode_register(&self) -> bool {
        matches!(self, MachineType::Falcon)
    }
}

/// Delay expressed in controller (FDC) cycles.
pub type FdcCycles = u32;

/// The global cycle clock plus the conversion between controller cycles and
/// host-CPU cycles. All command delays are stored in controller cycles and
/// converted at scheduling time; only integer math is used after
/// construction.
#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
pub struct FdcClock {
    pub cpu_hz: u32,
    pub fdc_hz: u32,
    /// Divisor applied to scheduled command delays for accelerated
    /// emulation. 1 = real time. Does not affect rotational bookkeeping.
    pub fast_fdc_divisor: u32,
    /// Current global time in CPU cycles.
    pub now: u64,
}

impl FdcClock {
    pub fn new(machine: MachineType) -> Self {
        Self {
            cpu_hz: machine.cpu_hz(),
            fdc_hz: machine.fdc_hz(),
            fast_fdc_divisor: 1,
            now: 0,
        }
    }

    /// Convert a controller-cycle delay into CPU cycles, applying the
    /// fast-FDC divisor. Never returns 0 so an armed timer always fires
    /// strictly in the future.
    pub fn fdc_to_cpu(&self, cycles: FdcCycles) -> u64 {
        let cpu = (cycles as u64 * self.cpu_hz as u64) / self.fdc_hz as u64;
        (cpu / self.fast_fdc_divisor as u64).max(1)
    }

    /// Convert an elapsed CPU-cycle span into controller cycles. Used for
    /// rotational position math, so the fast-FDC divisor does not apply.
    pub fn cpu_to_fdc(&self, cpu_cycles: u64) -> u64 {
        cpu_cycles * self.fdc_hz as u64 / self.cpu_hz as u64
    }

    /// Convert controller cycles to CPU cycles without the fast-FDC divisor.
    pub fn fdc_to_cpu_real(&self, cycles: u64) -> u64 {
        cycles * self.cpu_hz as u64 / self.fdc_hz as u64
    }
}

/// The single one-shot timer driving the controller state machine. Armed
/// with an absolute CPU-cycle deadline; disarmed while the controller is
/// idle.
#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize)]
pub struct CycleTimer {
    pub deadline: Option<u64>,
}

impl CycleTimer {
    pub fn arm(&mut self, deadline: u64) {
        self.deadline = Some(deadline);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn due(&self, now: u64) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}
