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

    devices::fdc::controller.rs

    Implements the WD1772 Floppy Disk Controller and its register window,
    including the controller/DMA/HDC access mux at FF8604/FF8606.

*/

#![allow(dead_code)]

use std::{collections::VecDeque, fmt::Display};

use anyhow::Error;
use modular_bitfield::{bitfield, prelude::*};
use rand::Rng;
use serde_derive::{Deserialize, Serialize};

use crate::{
    bus::{BusFault, BusInterface, BusWidth},
    device_types::{
        disk::FloppyImage,
        fdc::{
            crc16,
            data_field_offset,
            id_field_offset,
            SectorId,
            CYCLES_PER_MFM_BYTE,
            DATA_ADDRESS_MARK,
            GAP1_BYTES,
            GAP2_BYTES,
            GAP3A_BYTES,
            GAP3B_BYTES,
            GAP4_BYTES,
            GAP_FILL_BYTE,
            ID_ADDRESS_MARK,
            ID_FIELD_BYTES,
            SECTOR_LAYOUT_BYTES,
            SECTOR_LEN_CODE,
            SECTOR_SIZE,
            STEP_RATE_MS,
            SYNC_BYTE,
            TRACK_BYTES_DD,
        },
    },
    devices::{
        dma::{DmaAddressByte, DmaEngine},
        floppy_drive::FloppyDrive,
    },
    machine_types::{CycleTimer, FdcClock, FdcCycles, MachineType, FDC_BASE_HZ},
};

pub const FDC_LOG_LEN: usize = 256;
pub const FDC_MAX_DRIVES: usize = 2;

// Register window addresses.
pub const FDC_ACCESS_REGISTER: u32 = 0x00FF_8604;
pub const DMA_MODE_STATUS_REGISTER: u32 = 0x00FF_8606;
pub const DMA_ADDRESS_HIGH_REGISTER: u32 = 0x00FF_8609;
pub const DMA_ADDRESS_MID_REGISTER: u32 = 0x00FF_860B;
pub const DMA_ADDRESS_LOW_REGISTER: u32 = 0x00FF_860D;
pub const FLOPPY_MODE_REGISTER: u32 = 0x00FF_860F;

// Status register bit definitions. Bits 1, 2 and 5 read differently between
// the type-I and type-II/III status views.
pub const FDC_STATUS_BUSY: u8 = 0b0000_0001;
pub const FDC_STATUS_INDEX: u8 = 0b0000_0010; // type I
pub const FDC_STATUS_DRQ: u8 = 0b0000_0010; // type II/III
pub const FDC_STATUS_TRACK0: u8 = 0b0000_0100; // type I
pub const FDC_STATUS_LOST_DATA: u8 = 0b0000_0100; // type II/III
pub const FDC_STATUS_CRC_ERROR: u8 = 0b0000_1000;
pub const FDC_STATUS_RNF: u8 = 0b0001_0000;
pub const FDC_STATUS_SPIN_UP: u8 = 0b0010_0000; // type I
pub const FDC_STATUS_RECORD_TYPE: u8 = 0b0010_0000; // type II/III
pub const FDC_STATUS_WRITE_PROTECT: u8 = 0b0100_0000;
pub const FDC_STATUS_MOTOR_ON: u8 = 0b1000_0000;

// The spin-up disable bit sits at the same position in every command type.
pub const CMD_SPIN_UP_DISABLE: u8 = 0b0000_1000;

// Force-interrupt condition bits.
pub const FORCE_INT_INDEX_PULSE: u8 = 0b0000_0100;
pub const FORCE_INT_IMMEDIATE: u8 = 0b0000_1000;

// Sub-state delays, in controller cycles at the nominal 8MHz clock.
pub const DELAY_PREPARE_TYPE_I: FdcCycles = 90;
pub const DELAY_PREPARE_TYPE_II_III: FdcCycles = 1;
pub const DELAY_MOTOR_SETTLE: FdcCycles = 800;
pub const DELAY_SPIN_UP_POLL: FdcCycles = 500;
pub const DELAY_INDEX_POLL: FdcCycles = 500;
pub const DELAY_EMPTY_DRIVE_POLL: FdcCycles = 50_000;
pub const DELAY_HEAD_SETTLE: FdcCycles = 15 * FDC_BASE_HZ / 1000;

pub const SPIN_UP_INDEX_PULSES: u32 = 6;
pub const MOTOR_STOP_INDEX_PULSES: u32 = 9;
pub const RNF_INDEX_PULSES: u32 = 5;
pub const RESTORE_MAX_STEPS: u16 = 255;

/// A type-I command byte.
#[bitfield]
#[derive(Copy, Clone)]
pub struct TypeICommand {
    pub step_rate: B2,
    pub verify: bool,
    pub spin_up_disable: bool,
    pub update_track: bool,
    pub opcode: B3,
}

/// A type-II command byte.
#[bitfield]
#[derive(Copy, Clone)]
pub struct TypeIICommand {
    pub data_mark: bool,
    pub precomp: bool,
    pub settle_delay: bool,
    pub spin_up_disable: bool,
    pub multiple: bool,
    pub opcode: B3,
}

/// A type-III command byte.
#[bitfield]
#[derive(Copy, Clone)]
pub struct TypeIIICommand {
    #[skip]
    unused: B2,
    pub settle_delay: bool,
    pub spin_up_disable: bool,
    #[skip]
    unused4: B1,
    pub opcode: B3,
}

/// Represents the WD1772 command set, plus None while idle.
#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub enum Command {
    #[default]
    None,
    Restore,
    Seek,
    Step,
    StepIn,
    StepOut,
    ReadSector,
    WriteSector,
    ReadAddress,
    ReadTrack,
    WriteTrack,
    ForceInterrupt,
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::None => write!(f, "None"),
            Command::Restore => write!(f, "Restore"),
            Command::Seek => write!(f, "Seek"),
            Command::Step => write!(f, "Step"),
            Command::StepIn => write!(f, "Step In"),
            Command::StepOut => write!(f, "Step Out"),
            Command::ReadSector => write!(f, "Read Sector"),
            Command::WriteSector => write!(f, "Write Sector"),
            Command::ReadAddress => write!(f, "Read Address"),
            Command::ReadTrack => write!(f, "Read Track"),
            Command::WriteTrack => write!(f, "Write Track"),
            Command::ForceInterrupt => write!(f, "Force Interrupt"),
        }
    }
}

/// Command classification from the top nibble of the command byte.
#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub enum CommandType {
    #[default]
    None,
    I,
    II,
    III,
    IV,
}

/// Sub-states of the positioning (type I) commands.
#[derive(Copy, Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub enum PositioningState {
    Step,
    SettleHead,
    SearchId,
    CheckId,
}

/// Sub-states of the sector transfer (type II) commands.
#[derive(Copy, Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub enum TransferState {
    SettleHead,
    SearchId,
    CheckId,
    DataByte,
}

/// Sub-states of the raw track/address (type III) commands.
#[derive(Copy, Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub enum TrackOpState {
    SettleHead,
    SearchId,
    WaitIndex,
    Assemble,
    DataByte,
}

/// The controller's current sub-state. The prepare/spin-up/motor phases are
/// shared by all command types; the per-type execution phases are grouped
/// under their outer command family.
#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub enum Substate {
    #[default]
    Idle,
    Prepare,
    SpinUp,
    MotorSettle,
    Positioning(PositioningState),
    Transfer(TransferState),
    TrackOp(TrackOpState),
    MotorStop,
}

/// What the state machine should do after executing one sub-state.
enum Advance {
    /// Chain directly into the next sub-state.
    Immediate,
    /// Suspend for the given number of controller cycles.
    Delay(FdcCycles),
    /// Nothing left to run; disarm the timer.
    Idle,
}

/// Result of one header-search step.
enum SearchStep {
    /// No ID field can pass the head yet; poll again after this delay.
    Wait(FdcCycles),
    /// The next ID field arrives under the head after this delay.
    Found(FdcCycles),
    /// The five-revolution search limit expired.
    Timeout,
}

/// The hard disk controller seen through the FF8604 mux. Only register
/// routing crosses this boundary; the HDC command surface lives elsewhere.
pub trait HdcPort: Send {
    fn read_reg(&mut self) -> u16;
    fn write_reg(&mut self, data: u16);
}

/// Values captured by [FloppyController::selected_drive_view] so sub-state
/// handlers can do angular math without holding a borrow on the drive.
#[derive(Copy, Clone)]
struct DriveView {
    head_track: u8,
    spt: u8,
    sides: u8,
    density: u32,
    tracked: bool,
    pos_bytes: usize,
    bytes_per_rev: usize,
    cycles_since_index: u64,
    rotation_period: u64,
}

#[derive(Default)]
pub struct FdcDebugState {
    pub command: Command,
    pub substate: Substate,
    pub status: u8,
    pub data_reg: u8,
    pub track_reg: u8,
    pub sector_reg: u8,
    pub command_reg: u8,
    pub side: u8,
    pub drive_select: i8,
    pub id_field: SectorId,
    pub irq: bool,
    pub replace_possible: bool,
    pub dma_address: u32,
    pub dma_sector_count: u16,
    pub dma_fifo_size: usize,
    pub cmd_log: Vec<String>,
}

#[derive(Deserialize, Serialize)]
pub struct FloppyController {
    machine: MachineType,
    clock: FdcClock,
    timer: CycleTimer,

    // WD1772 register file.
    data_reg: u8,
    track_reg: u8,
    sector_reg: u8,
    command_reg: u8,
    status_reg: u8,

    step_dir: i8,
    side: u8,
    drive_select: i8,
    porta_latch: u8,

    command: Command,
    command_type: CommandType,
    substate: Substate,
    replace_possible: bool,
    status_type_i: bool,
    spin_up_wait: bool,
    /// Whether the motor has completed its six-revolution spin-up. Shown as
    /// status bit 5 in the type-I view only.
    spin_up_complete: bool,
    index_pulse_count: u32,
    /// The most recently observed ID field.
    id_field: SectorId,
    int_cond: u8,
    irq_line: bool,
    irq_immediate_latch: bool,

    step_count: u16,
    search_index_start: u32,
    search_sector_idx: u8,
    transfer_pos: usize,
    transfer_len: usize,

    dma: DmaEngine,
    drives: [FloppyDrive; FDC_MAX_DRIVES],
    /// Work buffer holding one raw track at maximum density.
    track_buffer: Vec<u8>,

    #[serde(skip)]
    hdc: Option<Box<dyn HdcPort>>,

    cmd_log: VecDeque<String>,
}

impl Default for FloppyController {
    fn default() -> Self {
        Self {
            machine: MachineType::St,
            clock: FdcClock::new(MachineType::St),
            timer: CycleTimer::default(),

            data_reg: 0,
            track_reg: 0,
            sector_reg: 1,
            command_reg: 0,
            status_reg: 0,

            step_dir: 1,
            side: 0,
            drive_select: 0,
            porta_latch: 0,

            command: Command::None,
            command_type: CommandType::None,
            substate: Substate::Idle,
            replace_possible: false,
            status_type_i: true,
            spin_up_wait: false,
            spin_up_complete: false,
            index_pulse_count: 0,
            id_field: SectorId::default(),
            int_cond: 0,
            irq_line: false,
            irq_immediate_latch: false,

            step_count: 0,
            search_index_start: 0,
            search_sector_idx: 0,
            transfer_pos: 0,
            transfer_len: 0,

            dma: DmaEngine::new(MachineType::St.dma_address_high_mask()),
            drives: [FloppyDrive::new(0), FloppyDrive::new(1)],
            track_buffer: vec![0; TRACK_BYTES_DD * 4],

            hdc: None,
            cmd_log: VecDeque::new(),
        }
    }
}

impl FloppyController {
    pub fn new(machine: MachineType) -> Self {
        let mut fdc = FloppyController {
            machine,
            clock: FdcClock::new(machine),
            dma: DmaEngine::new(machine.dma_address_high_mask()),
            ..Default::default()
        };

        // A stock machine ships with one internal drive; the host enables
        // drive B explicitly.
        fdc.drives[0].set_enabled(true);
        fdc
    }

    /// Reset the controller, DMA engine and drives, preserving inserted
    /// media.
    pub fn reset(&mut self) {
        self.timer.disarm();
        self.data_reg = 0;
        self.track_reg = 0;
        self.sector_reg = 1;
        self.command_reg = 0;
        self.status_reg = 0;
        self.step_dir = 1;
        self.command = Command::None;
        self.command_type = CommandType::None;
        self.substate = Substate::Idle;
        self.replace_possible = false;
        self.status_type_i = true;
        self.spin_up_wait = false;
        self.spin_up_complete = false;
        self.index_pulse_count = 0;
        self.id_field = SectorId::default();
        self.int_cond = 0;
        self.irq_line = false;
        self.irq_immediate_latch = false;
        self.step_count = 0;
        self.transfer_pos = 0;
        self.transfer_len = 0;

        self.dma.reset();
        for drive in self.drives.iter_mut() {
            drive.reset();
        }

        self.log_str("FDC reset");
    }

    pub fn machine(&self) -> MachineType {
        self.machine
    }

    pub fn time(&self) -> u64 {
        self.clock.now
    }

    pub fn set_fast_fdc_divisor(&mut self, divisor: u32) {
        self.clock.fast_fdc_divisor = divisor.max(1);
    }

    pub fn irq(&self) -> bool {
        self.irq_line
    }

    pub fn dma(&self) -> &DmaEngine {
        &self.dma
    }

    pub fn drive(&self, drive_n: usize) -> &FloppyDrive {
        &self.drives[drive_n]
    }

    pub fn drive_mut(&mut self, drive_n: usize) -> &mut FloppyDrive {
        &mut self.drives[drive_n]
    }

    pub fn attach_hdc(&mut self, hdc: Box<dyn HdcPort>) {
        self.hdc = Some(hdc);
    }

    /// Enable or disable a drive. Idempotent.
    pub fn enable_drive(&mut self, drive_n: usize, enabled: bool) {
        self.drives[drive_n].set_enabled(enabled);
    }

    /// Insert a disk into the given drive. Density is re-derived from the
    /// image; with the motor running the rotational reference is re-seeded.
    pub fn insert_disk(&mut self, drive_n: usize, image: Box<dyn FloppyImage>) {
        let motor_on = self.status_reg & FDC_STATUS_MOTOR_ON != 0;
        let clock = self.clock;
        self.drives[drive_n].insert_image(image, &clock, motor_on);
    }

    /// Eject the disk from the given drive, returning its image.
    pub fn eject_disk(&mut self, drive_n: usize) -> Option<Box<dyn FloppyImage>> {
        let clock = self.clock;
        self.drives[drive_n].eject_image(&clock)
    }

    /// Apply a write to the auxiliary I/O port latch that carries the side
    /// and drive select lines. Bit 0 selects the side (inverted); bits 1
    /// and 2 select drive 0/1 active-low, drive 0 winning ties.
    pub fn set_drive_side(&mut self, prev_porta: u8, new_porta: u8) {
        fn decode_drive(porta: u8) -> i8 {
            if porta & 0x02 == 0 {
                0
            }
            else if porta & 0x04 == 0 {
                1
            }
            else {
                -1
            }
        }

        self.side = (!new_porta) & 0x01;
        let prev_drive = decode_drive(prev_porta);
        let new_drive = decode_drive(new_porta);

        if prev_drive != new_drive {
            log::debug!("Drive select change: {} -> {}", prev_drive, new_drive);
            if prev_drive >= 0 {
                self.drives[prev_drive as usize].clear_index_pulse();
            }
            self.drive_select = new_drive;
            if new_drive >= 0
                && self.status_reg & FDC_STATUS_MOTOR_ON != 0
                && self.drives[new_drive as usize].disk_present()
            {
                let clock = self.clock;
                self.drives[new_drive as usize].seed_index_pulse(&clock);
            }
        }
        else {
            self.drive_select = new_drive;
        }

        self.porta_latch = new_porta;
    }

    fn selected_drive(&self) -> Option<&FloppyDrive> {
        match self.drive_select {
            n if n >= 0 => Some(&self.drives[n as usize]),
            _ => None,
        }
    }

    /// Capture the selected drive's angular state into plain values.
    fn selected_drive_view(&self) -> Option<DriveView> {
        let drive = self.selected_drive()?;
        Some(DriveView {
            head_track: drive.head_track(),
            spt: drive.sectors_per_track(),
            sides: drive.sides(),
            density: drive.density().factor(),
            tracked: drive.rotation_tracked(),
            pos_bytes: drive.bytes_since_index(&self.clock) as usize,
            bytes_per_rev: drive.bytes_per_rev(&self.clock) as usize,
            cycles_since_index: drive.cycles_since_index(&self.clock),
            rotation_period: drive.rotation_period_fdc(&self.clock),
        })
    }

    fn selected_density(&self) -> u32 {
        self.selected_drive().map_or(1, |d| d.density().factor())
    }

    fn bytes_to_cycles(bytes: usize, density: u32) -> FdcCycles {
        (bytes as u32) * CYCLES_PER_MFM_BYTE / density
    }

    fn byte_cycles(&self) -> FdcCycles {
        CYCLES_PER_MFM_BYTE / self.selected_density()
    }

    // ------------------------------------------------------------------
    // Register window (FF8604..FF860F)
    // ------------------------------------------------------------------

    pub fn mmio_read(&mut self, address: u32, width: BusWidth) -> Result<u16, BusFault> {
        match address {
            FDC_ACCESS_REGISTER..=0x00FF_8607 if width == BusWidth::Byte => {
                Err(BusFault::ByteAccessOnWordRegister { address })
            }
            FDC_ACCESS_REGISTER => Ok(self.handle_access_register_read()),
            DMA_MODE_STATUS_REGISTER => Ok(self.dma.read_status()),
            DMA_ADDRESS_HIGH_REGISTER => Ok(self.dma.read_address_byte(DmaAddressByte::High) as u16),
            DMA_ADDRESS_MID_REGISTER => Ok(self.dma.read_address_byte(DmaAddressByte::Mid) as u16),
            DMA_ADDRESS_LOW_REGISTER => Ok(self.dma.read_address_byte(DmaAddressByte::Low) as u16),
            FLOPPY_MODE_REGISTER if self.machine.has_floppy_mode_register() => Ok(0x80),
            _ => Err(BusFault::UnmappedAccess { address }),
        }
    }

    pub fn mmio_write(&mut self, address: u32, data: u16, width: BusWidth) -> Result<(), BusFault> {
        match address {
            FDC_ACCESS_REGISTER..=0x00FF_8607 if width == BusWidth::Byte => {
                Err(BusFault::ByteAccessOnWordRegister { address })
            }
            FDC_ACCESS_REGISTER => {
                self.handle_access_register_write(data);
                Ok(())
            }
            DMA_MODE_STATUS_REGISTER => {
                self.dma.write_mode(data);
                Ok(())
            }
            DMA_ADDRESS_HIGH_REGISTER => {
                self.dma.write_address_byte(DmaAddressByte::High, data as u8);
                Ok(())
            }
            DMA_ADDRESS_MID_REGISTER => {
                self.dma.write_address_byte(DmaAddressByte::Mid, data as u8);
                Ok(())
            }
            DMA_ADDRESS_LOW_REGISTER => {
                self.dma.write_address_byte(DmaAddressByte::Low, data as u8);
                Ok(())
            }
            FLOPPY_MODE_REGISTER if self.machine.has_floppy_mode_register() => {
                log::trace!("Write to floppy mode register: {:04X}", data);
                Ok(())
            }
            _ => Err(BusFault::UnmappedAccess { address }),
        }
    }

    /// Read of FF8604, demultiplexed by the DMA mode word.
    fn handle_access_register_read(&mut self) -> u16 {
        let mode = self.dma.mode();

        if mode.sector_count() {
            // The sector counter is write-only; reads see the shadow.
            return self.dma.shadow_word();
        }

        if mode.hdc_register() {
            return match self.hdc.as_mut() {
                Some(hdc) => {
                    let data = hdc.read_reg();
                    self.dma.set_shadow_word(data);
                    data
                }
                None => {
                    log::warn!("HDC register read with no HDC attached");
                    self.dma.shadow_word()
                }
            };
        }

        let byte = match mode.reg_select() {
            0 => self.read_status_register(),
            1 => self.track_reg,
            2 => self.sector_reg,
            _ => self.data_reg,
        };

        let word = (self.dma.shadow_word() & 0xFF00) | byte as u16;
        self.dma.set_shadow_low(byte);
        word
    }

    /// Write to FF8604, demultiplexed by the DMA mode word.
    fn handle_access_register_write(&mut self, data: u16) {
        self.dma.set_shadow_word(data);
        let mode = self.dma.mode();

        if mode.sector_count() {
            self.dma.set_sector_count(data);
            return;
        }

        if mode.hdc_register() {
            match self.hdc.as_mut() {
                Some(hdc) => hdc.write_reg(data),
                None => log::warn!("HDC register write with no HDC attached: {:04X}", data),
            }
            return;
        }

        match mode.reg_select() {
            0 => self.write_command_register(data as u8),
            1 => {
                if self.status_reg & FDC_STATUS_BUSY != 0 {
                    log::warn!("Track register write while busy: {:02X}", data as u8);
                }
                self.track_reg = data as u8;
            }
            2 => {
                if self.status_reg & FDC_STATUS_BUSY != 0 {
                    log::warn!("Sector register write while busy: {:02X}", data as u8);
                }
                self.sector_reg = data as u8;
            }
            _ => self.data_reg = data as u8,
        }
    }

    /// Compose the status byte. The type-I view derives TR00, INDEX, WPRT
    /// and spin-up live from the drive and angular clock.
    fn compose_status(&self) -> u8 {
        let mut status = self.status_reg;

        if self.status_type_i {
            status &= !(FDC_STATUS_INDEX | FDC_STATUS_TRACK0 | FDC_STATUS_WRITE_PROTECT | FDC_STATUS_SPIN_UP);
            if self.spin_up_complete {
                status |= FDC_STATUS_SPIN_UP;
            }
            match self.selected_drive() {
                Some(drive) => {
                    if drive.head_track() == 0 {
                        status |= FDC_STATUS_TRACK0;
                    }
                    if drive.index_state(&self.clock) {
                        status |= FDC_STATUS_INDEX;
                    }
                    if drive.write_protect_state(&self.clock) {
                        status |= FDC_STATUS_WRITE_PROTECT;
                    }
                }
                None => {
                    // No drive selected: the write-protect sensor's light
                    // path is open.
                    status |= FDC_STATUS_WRITE_PROTECT;
                }
            }
        }

        status
    }

    /// A guest read of the status register: the composed status, plus the
    /// side effect of releasing the IRQ line unless the immediate
    /// force-interrupt condition is latched.
    pub fn read_status_register(&mut self) -> u8 {
        let status = self.compose_status();

        if !self.irq_immediate_latch {
            self.irq_line = false;
        }

        status
    }

    // ------------------------------------------------------------------
    // Command register
    // ------------------------------------------------------------------

    pub fn classify_command(data: u8) -> (Command, CommandType) {
        match data >> 4 {
            0x0 => (Command::Restore, CommandType::I),
            0x1 => (Command::Seek, CommandType::I),
            0x2 | 0x3 => (Command::Step, CommandType::I),
            0x4 | 0x5 => (Command::StepIn, CommandType::I),
            0x6 | 0x7 => (Command::StepOut, CommandType::I),
            0x8 | 0x9 => (Command::ReadSector, CommandType::II),
            0xA | 0xB => (Command::WriteSector, CommandType::II),
            0xC => (Command::ReadAddress, CommandType::III),
            0xD => (Command::ForceInterrupt, CommandType::IV),
            0xE => (Command::ReadTrack, CommandType::III),
            _ => (Command::WriteTrack, CommandType::III),
        }
    }

    /// Write to the command register. A new command while busy is accepted
    /// only if it is a Force Interrupt, or the running command is still in
    /// its replace window and the new command has the same type.
    pub fn write_command_register(&mut self, data: u8) {
        // Observations made by a fresh command reflect "now".
        self.tick_index_pulses();

        let (command, command_type) = FloppyController::classify_command(data);

        if command_type == CommandType::IV {
            self.force_interrupt(data);
            return;
        }

        if self.status_reg & FDC_STATUS_BUSY != 0 {
            let replaceable = self.replace_possible
                && command_type == self.command_type
                && matches!(command_type, CommandType::I | CommandType::II);
            if !replaceable {
                self.log_cmd(
                    command,
                    "write_command_register",
                    &format!("{:02X} ignored while busy", data),
                );
                return;
            }
            self.log_cmd(
                command,
                "write_command_register",
                &format!("{:02X} replaces {}", data, self.command),
            );
        }

        self.command_reg = data;
        self.command = command;
        self.command_type = command_type;
        self.status_reg |= FDC_STATUS_BUSY;
        self.status_reg &= !(FDC_STATUS_RNF | FDC_STATUS_CRC_ERROR);
        if command_type != CommandType::I {
            self.status_reg &=
                !(FDC_STATUS_LOST_DATA | FDC_STATUS_RECORD_TYPE | FDC_STATUS_WRITE_PROTECT);
        }
        self.status_type_i = command_type == CommandType::I;

        // A new command supersedes any latched interrupt condition.
        self.int_cond = 0;
        self.irq_line = false;
        self.irq_immediate_latch = false;

        let motor_was_off = self.status_reg & FDC_STATUS_MOTOR_ON == 0;
        self.status_reg |= FDC_STATUS_MOTOR_ON;
        if motor_was_off {
            let clock = self.clock;
            if let Some(n) = (self.drive_select >= 0).then_some(self.drive_select as usize) {
                if self.drives[n].disk_present() {
                    self.drives[n].seed_index_pulse(&clock);
                }
            }
        }
        self.spin_up_wait = motor_was_off && (data & CMD_SPIN_UP_DISABLE == 0);

        self.replace_possible = true;
        self.step_count = 0;
        self.transfer_pos = 0;
        self.transfer_len = 0;
        self.substate = Substate::Prepare;

        let prepare = match command_type {
            CommandType::I => DELAY_PREPARE_TYPE_I,
            _ => DELAY_PREPARE_TYPE_II_III,
        };
        self.log_cmd(
            command,
            "write_command_register",
            &format!("{:02X} accepted, tr:{} sr:{} dr:{}", data, self.track_reg, self.sector_reg, self.data_reg),
        );
        self.schedule(prepare);
    }

    /// Type IV. Applied at the command write: latches the condition bits,
    /// raises IRQ for the immediate condition, and terminates any running
    /// command leaving its status bits as they were.
    fn force_interrupt(&mut self, data: u8) {
        self.command_reg = data;
        self.int_cond = data & 0x0F;
        let was_running = self.command != Command::None;

        self.log_cmd(
            Command::ForceInterrupt,
            "force_interrupt",
            &format!("condition:{:01X} busy:{}", self.int_cond, was_running),
        );

        if data & FORCE_INT_IMMEDIATE != 0 {
            self.irq_line = true;
            self.irq_immediate_latch = true;
        }
        else if self.int_cond == 0 {
            // 0xD0 terminates without interrupt and releases the latch.
            self.irq_immediate_latch = false;
        }

        if was_running {
            self.command = Command::None;
            self.command_type = CommandType::None;
            self.status_reg &= !FDC_STATUS_BUSY;
            self.replace_possible = false;
            self.index_pulse_count = 0;
            self.substate = Substate::MotorStop;
            self.schedule(DELAY_INDEX_POLL);
        }
        else {
            self.status_reg &= !FDC_STATUS_BUSY;
            self.status_type_i = true;
        }
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    fn schedule(&mut self, delay: FdcCycles) {
        let deadline = self.clock.now + self.clock.fdc_to_cpu(delay);
        self.timer.arm(deadline);
    }

    /// Run the controller. The host calls this from its cycle loop; a poll
    /// cadence of ~500 controller cycles or better keeps index crossings
    /// accurate.
    pub fn run(&mut self, bus: &mut BusInterface, cpu_cycles: u32) {
        self.clock.now += cpu_cycles as u64;
        self.tick_index_pulses();

        while self.timer.due(self.clock.now) {
            self.timer.disarm();
            self.advance(bus);
            self.tick_index_pulses();
        }
    }

    /// Advance the angular clock of the selected drive, counting index
    /// pulses and raising IRQ for a latched index condition.
    fn tick_index_pulses(&mut self) {
        if self.status_reg & FDC_STATUS_MOTOR_ON == 0 {
            return;
        }
        let Some(n) = (self.drive_select >= 0).then_some(self.drive_select as usize) else {
            return;
        };
        let clock = self.clock;
        let drive = &mut self.drives[n];
        if !drive.rotation_tracked() {
            return;
        }

        let period = drive.rotation_period_cpu(&clock);
        let mut pulses = 0u32;
        while clock.now >= drive.index_pulse_cycle + period {
            drive.index_pulse_cycle += period;
            pulses += 1;
        }

        if pulses > 0 {
            self.index_pulse_count += pulses;
            if self.int_cond & FORCE_INT_INDEX_PULSE != 0 {
                self.irq_line = true;
            }
        }
    }

    /// Advance the state machine until a sub-state suspends or the
    /// controller goes idle. This lets chains of immediate transitions run
    /// without bouncing off the scheduler.
    fn advance(&mut self, bus: &mut BusInterface) {
        loop {
            match self.exec_substate(bus) {
                Advance::Immediate => continue,
                Advance::Delay(cycles) => {
                    self.schedule(cycles);
                    break;
                }
                Advance::Idle => {
                    self.timer.disarm();
                    break;
                }
            }
        }
    }

    fn exec_substate(&mut self, bus: &mut BusInterface) -> Advance {
        match self.substate {
            Substate::Idle => Advance::Idle,
            Substate::Prepare => self.exec_prepare(),
            Substate::SpinUp => self.exec_spin_up(),
            Substate::MotorSettle => self.exec_motor_settle(bus),
            Substate::Positioning(state) => self.exec_positioning(state),
            Substate::Transfer(state) => self.exec_transfer(bus, state),
            Substate::TrackOp(state) => self.exec_track_op(bus, state),
            Substate::MotorStop => self.exec_motor_stop(),
        }
    }

    // ------------------------------------------------------------------
    // Shared command phases
    // ------------------------------------------------------------------

    fn exec_prepare(&mut self) -> Advance {
        if self.spin_up_wait {
            self.spin_up_complete = false;
            self.index_pulse_count = 0;
            self.substate = Substate::SpinUp;
            Advance::Delay(DELAY_SPIN_UP_POLL)
        }
        else {
            if self.command_reg & CMD_SPIN_UP_DISABLE == 0 {
                self.spin_up_complete = true;
            }
            self.substate = Substate::MotorSettle;
            Advance::Delay(DELAY_MOTOR_SETTLE)
        }
    }

    fn exec_spin_up(&mut self) -> Advance {
        if self.index_pulse_count >= SPIN_UP_INDEX_PULSES {
            self.spin_up_complete = true;
            self.substate = Substate::MotorSettle;
            Advance::Delay(DELAY_MOTOR_SETTLE)
        }
        else {
            Advance::Delay(DELAY_SPIN_UP_POLL)
        }
    }

    /// The motor line has settled; the replace window closes and the
    /// command proper begins.
    fn exec_motor_settle(&mut self, _bus: &mut BusInterface) -> Advance {
        self.replace_possible = false;

        match self.command {
            Command::Restore | Command::Seek | Command::Step | Command::StepIn | Command::StepOut => {
                self.substate = Substate::Positioning(PositioningState::Step);
                Advance::Immediate
            }
            Command::ReadSector => self.begin_sector_phase(),
            Command::WriteSector => {
                // Write protect is checked up front.
                let clock = self.clock;
                let protected = self
                    .selected_drive()
                    .map_or(true, |d| d.write_protect_state(&clock));
                if protected {
                    self.log_str("Write Sector on protected disk");
                    self.status_reg |= FDC_STATUS_WRITE_PROTECT;
                    return self.complete_command(true);
                }
                self.begin_sector_phase()
            }
            Command::ReadAddress | Command::ReadTrack => self.begin_track_op_phase(),
            Command::WriteTrack => {
                // Not implemented: report record-not-found.
                log::warn!("Write Track command is not implemented");
                self.status_reg |= FDC_STATUS_RNF;
                self.complete_command(true)
            }
            _ => {
                log::error!("exec_motor_settle(): invalid command: {:?}", self.command);
                Advance::Idle
            }
        }
    }

    fn begin_sector_phase(&mut self) -> Advance {
        if TypeIICommand::from_bytes([self.command_reg]).settle_delay() {
            self.substate = Substate::Transfer(TransferState::SettleHead);
            Advance::Delay(DELAY_HEAD_SETTLE)
        }
        else {
            self.search_index_start = self.index_pulse_count;
            self.substate = Substate::Transfer(TransferState::SearchId);
            Advance::Immediate
        }
    }

    fn begin_track_op_phase(&mut self) -> Advance {
        if TypeIIICommand::from_bytes([self.command_reg]).settle_delay() {
            self.substate = Substate::TrackOp(TrackOpState::SettleHead);
            Advance::Delay(DELAY_HEAD_SETTLE)
        }
        else {
            self.search_index_start = self.index_pulse_count;
            self.substate = Substate::TrackOp(match self.command {
                Command::ReadTrack => TrackOpState::WaitIndex,
                _ => TrackOpState::SearchId,
            });
            Advance::Immediate
        }
    }

    /// Common completion path: clear BUSY, raise IRQ and hand over to the
    /// motor-stop timer.
    fn complete_command(&mut self, raise_irq: bool) -> Advance {
        self.log_cmd(self.command, "complete_command", &format!("status:{:02X}", self.status_reg));

        self.status_reg &= !FDC_STATUS_BUSY;
        self.command = Command::None;
        self.command_type = CommandType::None;
        self.replace_possible = false;
        if raise_irq {
            self.irq_line = true;
        }

        self.index_pulse_count = 0;
        self.substate = Substate::MotorStop;
        Advance::Delay(DELAY_INDEX_POLL)
    }

    /// The pseudo command that keeps the motor spinning for nine index
    /// pulses after completion.
    fn exec_motor_stop(&mut self) -> Advance {
        if self.index_pulse_count >= MOTOR_STOP_INDEX_PULSES {
            log::trace!("Motor stopped");
            self.status_reg &= !FDC_STATUS_MOTOR_ON;
            self.spin_up_complete = false;
            self.substate = Substate::Idle;
            Advance::Idle
        }
        else {
            Advance::Delay(DELAY_INDEX_POLL)
        }
    }

    // ------------------------------------------------------------------
    // Header search
    // ------------------------------------------------------------------

    /// Locate the next ID field to pass under the head. With no usable
    /// drive the search polls slowly so a later insertion resumes the
    /// command transparently.
    fn op_search_id(&mut self, require_side: bool) -> SearchStep {
        let Some(view) = self.selected_drive_view() else {
            return SearchStep::Wait(DELAY_EMPTY_DRIVE_POLL);
        };
        if !view.tracked {
            return SearchStep::Wait(DELAY_EMPTY_DRIVE_POLL);
        }

        if self.index_pulse_count.wrapping_sub(self.search_index_start) >= RNF_INDEX_PULSES {
            return SearchStep::Timeout;
        }

        if view.spt == 0 {
            return SearchStep::Wait(DELAY_INDEX_POLL);
        }
        if require_side && self.side >= view.sides {
            // No ID fields exist on a side the media does not have.
            return SearchStep::Wait(DELAY_INDEX_POLL);
        }

        let mut found = None;
        for n in 0..view.spt as usize {
            if id_field_offset(n) > view.pos_bytes {
                found = Some((n, id_field_offset(n) - view.pos_bytes));
                break;
            }
        }
        let (idx, delay_bytes) = match found {
            Some(hit) => hit,
            None => (0, view.bytes_per_rev - view.pos_bytes + id_field_offset(0)),
        };

        self.search_sector_idx = idx as u8;
        SearchStep::Found(FloppyController::bytes_to_cycles(delay_bytes, view.density))
    }

    /// The ID field whose start the head has just reached.
    fn current_id_field(&self, view: &DriveView) -> SectorId {
        SectorId {
            track: view.head_track,
            side: self.side,
            sector: self.search_sector_idx + 1,
            len_code: SECTOR_LEN_CODE,
        }
    }

    // ------------------------------------------------------------------
    // Type I: positioning
    // ------------------------------------------------------------------

    fn exec_positioning(&mut self, state: PositioningState) -> Advance {
        match state {
            PositioningState::Step => self.op_step(),
            PositioningState::SettleHead => {
                self.search_index_start = self.index_pulse_count;
                self.substate = Substate::Positioning(PositioningState::SearchId);
                Advance::Immediate
            }
            PositioningState::SearchId => match self.op_search_id(true) {
                SearchStep::Wait(delay) => Advance::Delay(delay),
                SearchStep::Found(delay) => {
                    self.substate = Substate::Positioning(PositioningState::CheckId);
                    Advance::Delay(delay)
                }
                SearchStep::Timeout => {
                    self.status_reg |= FDC_STATUS_RNF;
                    self.complete_command(true)
                }
            },
            PositioningState::CheckId => {
                let Some(view) = self.selected_drive_view() else {
                    self.substate = Substate::Positioning(PositioningState::SearchId);
                    return Advance::Immediate;
                };
                let id = self.current_id_field(&view);
                self.id_field = id;
                if id.track == self.track_reg {
                    // Verified.
                    self.complete_command(true)
                }
                else {
                    self.substate = Substate::Positioning(PositioningState::SearchId);
                    Advance::Immediate
                }
            }
        }
    }

    fn step_rate_cycles(&self) -> FdcCycles {
        let rate = TypeICommand::from_bytes([self.command_reg]).step_rate();
        STEP_RATE_MS[rate as usize] * (FDC_BASE_HZ / 1000)
    }

    fn op_step(&mut self) -> Advance {
        let rate = self.step_rate_cycles();

        match self.command {
            Command::Restore => {
                let at_track0 = self.selected_drive().is_some_and(|d| d.head_track() == 0);
                if at_track0 {
                    self.track_reg = 0;
                    self.status_reg |= FDC_STATUS_TRACK0;
                    return self.finish_positioning();
                }
                if self.step_count >= RESTORE_MAX_STEPS {
                    // Track zero never came up; dead or absent drive.
                    self.status_reg |= FDC_STATUS_RNF;
                    return self.complete_command(true);
                }
                self.step_dir = -1;
                if self.drive_select >= 0 {
                    self.drives[self.drive_select as usize].step_head(-1);
                }
                self.track_reg = self.track_reg.wrapping_sub(1);
                self.step_count += 1;
                Advance::Delay(rate)
            }
            Command::Seek => {
                if self.track_reg == self.data_reg {
                    return self.finish_positioning();
                }
                let dir: i8 = if self.data_reg > self.track_reg { 1 } else { -1 };
                self.step_dir = dir;
                if self.drive_select >= 0 {
                    self.drives[self.drive_select as usize].step_head(dir);
                }
                self.track_reg = match dir {
                    1 => self.track_reg.wrapping_add(1),
                    _ => self.track_reg.wrapping_sub(1),
                };
                Advance::Delay(rate)
            }
            Command::Step | Command::StepIn | Command::StepOut => {
                if self.step_count > 0 {
                    return self.finish_positioning();
                }
                let dir = match self.command {
                    Command::StepIn => 1,
                    Command::StepOut => -1,
                    _ => self.step_dir,
                };
                self.step_dir = dir;
                if self.drive_select >= 0 {
                    self.drives[self.drive_select as usize].step_head(dir);
                }
                if TypeICommand::from_bytes([self.command_reg]).update_track() {
                    self.track_reg = match dir {
                        1 => self.track_reg.wrapping_add(1),
                        _ => self.track_reg.wrapping_sub(1),
                    };
                }
                self.step_count = 1;
                Advance::Delay(rate)
            }
            _ => {
                log::error!("op_step(): invalid command: {:?}", self.command);
                Advance::Idle
            }
        }
    }

    fn finish_positioning(&mut self) -> Advance {
        if TypeICommand::from_bytes([self.command_reg]).verify() {
            self.substate = Substate::Positioning(PositioningState::SettleHead);
            Advance::Delay(DELAY_HEAD_SETTLE)
        }
        else {
            self.complete_command(true)
        }
    }

    // ------------------------------------------------------------------
    // Type II: sector transfer
    // ------------------------------------------------------------------

    fn exec_transfer(&mut self, bus: &mut BusInterface, state: TransferState) -> Advance {
        match state {
            TransferState::SettleHead => {
                self.search_index_start = self.index_pulse_count;
                self.substate = Substate::Transfer(TransferState::SearchId);
                Advance::Immediate
            }
            TransferState::SearchId => match self.op_search_id(true) {
                SearchStep::Wait(delay) => Advance::Delay(delay),
                SearchStep::Found(delay) => {
                    self.substate = Substate::Transfer(TransferState::CheckId);
                    Advance::Delay(delay)
                }
                SearchStep::Timeout => {
                    self.status_reg |= FDC_STATUS_RNF;
                    self.complete_command(true)
                }
            },
            TransferState::CheckId => self.op_sector_check_id(bus),
            TransferState::DataByte => self.op_sector_data_byte(bus),
        }
    }

    fn op_sector_check_id(&mut self, bus: &mut BusInterface) -> Advance {
        let Some(view) = self.selected_drive_view() else {
            self.substate = Substate::Transfer(TransferState::SearchId);
            return Advance::Immediate;
        };
        let id = self.current_id_field(&view);
        self.id_field = id;

        if id.sector != self.sector_reg {
            self.substate = Substate::Transfer(TransferState::SearchId);
            return Advance::Immediate;
        }

        // Matching header found. Stage the sector payload.
        let result = match self.command {
            Command::ReadSector => self.stage_sector_read(),
            _ => self.stage_sector_write(bus),
        };
        if let Err(e) = result {
            log::warn!("sector staging failed: {:?}", e);
            self.status_reg |= FDC_STATUS_RNF;
            return self.complete_command(true);
        }

        self.transfer_pos = 0;
        self.transfer_len = SECTOR_SIZE;
        self.substate = Substate::Transfer(TransferState::DataByte);

        // The data field begins a fixed gap after the ID field, then the
        // first byte takes one MFM period to pass the head.
        let gap = data_field_offset(0) - id_field_offset(0) + 1;
        Advance::Delay(FloppyController::bytes_to_cycles(gap, view.density))
    }

    /// Read the addressed sector from the backing image into the work
    /// buffer.
    fn stage_sector_read(&mut self) -> Result<(), Error> {
        let drive = &self.drives[self.drive_select as usize];
        let image = drive
            .image()
            .ok_or_else(|| anyhow::anyhow!("no media in drive"))?;
        image.read_sector(
            drive.head_track(),
            self.side,
            self.sector_reg,
            &mut self.track_buffer[..SECTOR_SIZE],
        )
    }

    /// Commit the sector to the backing image, sourced from the current
    /// DMA memory block, or zeros when the sector counter is exhausted.
    /// The FIFO accounting drain follows in the data-byte loop.
    fn stage_sector_write(&mut self, bus: &mut BusInterface) -> Result<(), Error> {
        let mut sector_buf = [0u8; SECTOR_SIZE];
        if self.dma.sector_count() > 0 {
            bus.read_block(self.dma.address(), &mut sector_buf);
        }

        let track = self.drives[self.drive_select as usize].head_track();
        let side = self.side;
        let sector = self.sector_reg;
        let image = self.drives[self.drive_select as usize]
            .image_mut()
            .ok_or_else(|| anyhow::anyhow!("no media in drive"))?;
        image.write_sector(track, side, sector, &sector_buf)
    }

    fn op_sector_data_byte(&mut self, bus: &mut BusInterface) -> Advance {
        match self.command {
            Command::ReadSector => {
                let byte = self.track_buffer[self.transfer_pos];
                self.dma.push(bus, byte);
            }
            _ => {
                // The written bytes already hit the image; pulling keeps the
                // FIFO and sector counter accounting consistent.
                let _ = self.dma.pull(bus);
            }
        }
        self.transfer_pos += 1;

        let byte_delay = self.byte_cycles();
        if self.transfer_pos < self.transfer_len {
            return Advance::Delay(byte_delay);
        }

        if TypeIICommand::from_bytes([self.command_reg]).multiple() {
            // Continue with the next sector id; the search limit restarts.
            self.sector_reg = self.sector_reg.wrapping_add(1);
            self.search_index_start = self.index_pulse_count;
            self.substate = Substate::Transfer(TransferState::SearchId);
            Advance::Delay(byte_delay)
        }
        else {
            self.complete_command(true)
        }
    }

    // ------------------------------------------------------------------
    // Type III: read address / read track
    // ------------------------------------------------------------------

    fn exec_track_op(&mut self, bus: &mut BusInterface, state: TrackOpState) -> Advance {
        match state {
            TrackOpState::SettleHead => {
                self.search_index_start = self.index_pulse_count;
                self.substate = Substate::TrackOp(match self.command {
                    Command::ReadTrack => TrackOpState::WaitIndex,
                    _ => TrackOpState::SearchId,
                });
                Advance::Immediate
            }
            TrackOpState::SearchId => match self.op_search_id(false) {
                SearchStep::Wait(delay) => Advance::Delay(delay),
                SearchStep::Found(delay) => {
                    self.substate = Substate::TrackOp(TrackOpState::Assemble);
                    Advance::Delay(delay)
                }
                SearchStep::Timeout => {
                    self.status_reg |= FDC_STATUS_RNF;
                    self.complete_command(true)
                }
            },
            TrackOpState::WaitIndex => {
                let Some(view) = self.selected_drive_view() else {
                    return Advance::Delay(DELAY_EMPTY_DRIVE_POLL);
                };
                if !view.tracked {
                    return Advance::Delay(DELAY_EMPTY_DRIVE_POLL);
                }
                self.substate = Substate::TrackOp(TrackOpState::Assemble);
                if view.cycles_since_index < DELAY_INDEX_POLL as u64 {
                    // Effectively on the mark already; do not wait a whole
                    // revolution for the next one.
                    Advance::Delay(DELAY_INDEX_POLL)
                }
                else {
                    Advance::Delay((view.rotation_period - view.cycles_since_index) as FdcCycles)
                }
            }
            TrackOpState::Assemble => match self.command {
                Command::ReadAddress => self.op_assemble_address(),
                _ => self.op_assemble_track(),
            },
            TrackOpState::DataByte => {
                let byte = self.track_buffer[self.transfer_pos];
                self.dma.push(bus, byte);
                self.transfer_pos += 1;
                if self.transfer_pos < self.transfer_len {
                    Advance::Delay(self.byte_cycles())
                }
                else {
                    self.complete_command(true)
                }
            }
        }
    }

    /// Synthesize the six Read Address bytes. A side the media does not
    /// have yields random bytes.
    fn op_assemble_address(&mut self) -> Advance {
        let Some(view) = self.selected_drive_view() else {
            self.substate = Substate::TrackOp(TrackOpState::SearchId);
            return Advance::Immediate;
        };

        if self.side >= view.sides {
            rand::thread_rng().fill(&mut self.track_buffer[..ID_FIELD_BYTES]);
        }
        else {
            let id = self.current_id_field(&view);
            self.id_field = id;
            let crc = id.crc();
            self.track_buffer[0] = id.track;
            self.track_buffer[1] = id.side;
            self.track_buffer[2] = id.sector;
            self.track_buffer[3] = id.len_code;
            self.track_buffer[4] = (crc >> 8) as u8;
            self.track_buffer[5] = crc as u8;
        }

        // The chip deposits the track byte of the ID field into the sector
        // register.
        self.sector_reg = self.track_buffer[0];

        self.transfer_pos = 0;
        self.transfer_len = ID_FIELD_BYTES;
        self.substate = Substate::TrackOp(TrackOpState::DataByte);
        Advance::Delay(self.byte_cycles())
    }

    /// Assemble one full synthesized track into the work buffer.
    fn op_assemble_track(&mut self) -> Advance {
        let Some(view) = self.selected_drive_view() else {
            self.substate = Substate::TrackOp(TrackOpState::WaitIndex);
            return Advance::Delay(DELAY_EMPTY_DRIVE_POLL);
        };

        let track_len = TRACK_BYTES_DD * view.density as usize;
        let drive = &self.drives[self.drive_select as usize];
        let buf = &mut self.track_buffer;

        let readable_side = match drive.image() {
            Some(image) if self.side < view.sides => Some(image),
            _ => None,
        };

        if let Some(image) = readable_side {
            let mut pos = 0;

            buf[pos..pos + GAP1_BYTES].fill(GAP_FILL_BYTE);
            pos += GAP1_BYTES;

            for sector in 1..=view.spt {
                if pos + SECTOR_LAYOUT_BYTES > track_len {
                    log::warn!(
                        "op_assemble_track(): {} sectors overflow the {} byte track, stopping at {}",
                        view.spt,
                        track_len,
                        sector
                    );
                    break;
                }

                buf[pos..pos + GAP2_BYTES].fill(0x00);
                pos += GAP2_BYTES;

                // ID field: sync, address mark, id bytes, CRC over all of
                // them.
                let id_start = pos;
                buf[pos..pos + 3].fill(SYNC_BYTE);
                pos += 3;
                buf[pos] = ID_ADDRESS_MARK;
                pos += 1;
                buf[pos] = view.head_track;
                buf[pos + 1] = self.side;
                buf[pos + 2] = sector;
                buf[pos + 3] = SECTOR_LEN_CODE;
                pos += 4;
                let id_crc = crc16(&buf[id_start..pos]);
                buf[pos] = (id_crc >> 8) as u8;
                buf[pos + 1] = id_crc as u8;
                pos += 2;

                buf[pos..pos + GAP3A_BYTES].fill(GAP_FILL_BYTE);
                pos += GAP3A_BYTES;
                buf[pos..pos + GAP3B_BYTES].fill(0x00);
                pos += GAP3B_BYTES;

                // Data field.
                let data_start = pos;
                buf[pos..pos + 3].fill(SYNC_BYTE);
                pos += 3;
                buf[pos] = DATA_ADDRESS_MARK;
                pos += 1;
                if let Err(e) =
                    image.read_sector(view.head_track, self.side, sector, &mut buf[pos..pos + SECTOR_SIZE])
                {
                    log::warn!("op_assemble_track(): sector {} read failed: {:?}", sector, e);
                    buf[pos..pos + SECTOR_SIZE].fill(0x00);
                }
                pos += SECTOR_SIZE;
                let data_crc = crc16(&buf[data_start..pos]);
                buf[pos] = (data_crc >> 8) as u8;
                buf[pos + 1] = data_crc as u8;
                pos += 2;

                buf[pos..pos + GAP4_BYTES].fill(GAP_FILL_BYTE);
                pos += GAP4_BYTES;
            }

            buf[pos..track_len].fill(GAP_FILL_BYTE);
        }
        else {
            // Nothing recorded on this side; the head sees noise.
            rand::thread_rng().fill(&mut buf[..track_len]);
        }

        self.transfer_pos = 0;
        self.transfer_len = track_len;
        self.substate = Substate::TrackOp(TrackOpState::DataByte);
        Advance::Delay(self.byte_cycles())
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Serialize the whole floppy subsystem (controller, DMA engine, drives
    /// and work buffer) into an opaque blob.
    pub fn save_state(&self) -> Result<Vec<u8>, Error> {
        Ok(bincode::serialize(self)?)
    }

    /// Restore from a blob produced by [FloppyController::save_state].
    /// Live collaborators (image backends, the HDC port) carry over from
    /// the current value; nothing else needs fixing up.
    pub fn restore_state(&mut self, blob: &[u8]) -> Result<(), Error> {
        let mut restored: FloppyController = bincode::deserialize(blob)?;
        for (restored_drive, live_drive) in restored.drives.iter_mut().zip(self.drives.iter_mut()) {
            restored_drive.image = live_drive.image.take();
        }
        restored.hdc = self.hdc.take();
        *self = restored;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn get_debug_state(&self) -> FdcDebugState {
        FdcDebugState {
            command: self.command,
            substate: self.substate,
            status: self.compose_status(),
            data_reg: self.data_reg,
            track_reg: self.track_reg,
            sector_reg: self.sector_reg,
            command_reg: self.command_reg,
            side: self.side,
            drive_select: self.drive_select,
            id_field: self.id_field,
            irq: self.irq_line,
            replace_possible: self.replace_possible,
            dma_address: self.dma.address(),
            dma_sector_count: self.dma.sector_count(),
            dma_fifo_size: self.dma.fifo_size(),
            cmd_log: self.cmd_log.iter().cloned().collect(),
        }
    }

    fn log_cmd(&mut self, cmd: Command, func: &str, s: &str) {
        if self.cmd_log.len() >= FDC_LOG_LEN {
            self.cmd_log.pop_front();
        }
        self.cmd_log.push_back(format!("{}: {}", cmd, s));
        log::trace!("{}(): {}", func, s);
    }

    fn log_str(&mut self, s: &str) {
        if self.cmd_log.len() >= FDC_LOG_LEN {
            self.cmd_log.pop_front();
        }
        self.cmd_log.push_back(s.to_string());
        log::trace!("{}", s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_classification() {
        assert_eq!(
            FloppyController::classify_command(0x00),
            (Command::Restore, CommandType::I)
        );
        assert_eq!(
            FloppyController::classify_command(0x1B),
            (Command::Seek, CommandType::I)
        );
        assert_eq!(
            FloppyController::classify_command(0x33),
            (Command::Step, CommandType::I)
        );
        assert_eq!(
            FloppyController::classify_command(0x48),
            (Command::StepIn, CommandType::I)
        );
        assert_eq!(
            FloppyController::classify_command(0x78),
            (Command::StepOut, CommandType::I)
        );
        assert_eq!(
            FloppyController::classify_command(0x80),
            (Command::ReadSector, CommandType::II)
        );
        assert_eq!(
            FloppyController::classify_command(0x90),
            (Command::ReadSector, CommandType::II)
        );
        assert_eq!(
            FloppyController::classify_command(0xA8),
            (Command::WriteSector, CommandType::II)
        );
        assert_eq!(
            FloppyController::classify_command(0xC8),
            (Command::ReadAddress, CommandType::III)
        );
        assert_eq!(
            FloppyController::classify_command(0xD8),
            (Command::ForceInterrupt, CommandType::IV)
        );
        assert_eq!(
            FloppyController::classify_command(0xE8),
            (Command::ReadTrack, CommandType::III)
        );
        assert_eq!(
            FloppyController::classify_command(0xF0),
            (Command::WriteTrack, CommandType::III)
        );
    }

    #[test]
    fn test_step_rates() {
        let mut fdc = FloppyController::new(MachineType::St);
        fdc.command_reg = 0x00;
        assert_eq!(fdc.step_rate_cycles(), 48_000);
        fdc.command_reg = 0x01;
        assert_eq!(fdc.step_rate_cycles(), 96_000);
        fdc.command_reg = 0x02;
        assert_eq!(fdc.step_rate_cycles(), 16_000);
        fdc.command_reg = 0x03;
        assert_eq!(fdc.step_rate_cycles(), 24_000);
    }
}
