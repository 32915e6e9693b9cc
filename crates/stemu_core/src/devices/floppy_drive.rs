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

    devices::floppy_drive.rs

    Implements a floppy drive: media and head state plus the angular clock
    that tracks the drive's rotational position and index pulses.

*/

use rand::Rng;
use serde_derive::{Deserialize, Serialize};

use crate::{
    device_types::{
        disk::FloppyImage,
        fdc::{DiskDensity, CYCLES_PER_MFM_BYTE, INDEX_PULSE_BYTES},
    },
    machine_types::FdcClock,
};

/// Stepping past this track is clamped; drives of the era had a physical
/// stop around track 85-90.
pub const MAX_HEAD_TRACK: u8 = 90;

pub const DEFAULT_RPM_X1000: u32 = 300_000;

/// How long the write-protect sensor stays obstructed around a media
/// change, in seconds of wall time.
const MEDIA_CHANGE_SECONDS: u64 = 1;

#[derive(Deserialize, Serialize)]
pub struct FloppyDrive {
    drive_n: usize,
    pub(crate) enabled: bool,
    pub(crate) disk_present: bool,
    /// Rotation rate times 1000, i.e. 300_000 for a 300 RPM drive.
    pub(crate) rpm_x1000: u32,
    pub(crate) density: DiskDensity,
    pub(crate) head_track: u8,
    /// CPU-cycle timestamp of the most recently witnessed index pulse.
    /// 0 means the rotational position is not being tracked.
    pub(crate) index_pulse_cycle: u64,
    /// CPU-cycle deadline of the media-change window during which the
    /// write-protect sensor is obstructed.
    pub(crate) media_change_cycle: u64,

    #[serde(skip)]
    pub(crate) image: Option<Box<dyn FloppyImage>>,
}

impl Default for FloppyDrive {
    fn default() -> Self {
        Self {
            drive_n: 0,
            enabled: false,
            disk_present: false,
            rpm_x1000: DEFAULT_RPM_X1000,
            density: DiskDensity::Double,
            head_track: 0,
            index_pulse_cycle: 0,
            media_change_cycle: 0,
            image: None,
        }
    }
}

impl FloppyDrive {
    pub fn new(drive_n: usize) -> Self {
        FloppyDrive {
            drive_n,
            ..Default::default()
        }
    }

    /// Reset the drive to default state, preserving inserted media.
    pub fn reset(&mut self) {
        let image = self.image.take();

        *self = Self {
            drive_n: self.drive_n,
            enabled: self.enabled,
            disk_present: self.disk_present,
            density: self.density,
            image,
            ..Default::default()
        };
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn disk_present(&self) -> bool {
        self.disk_present
    }

    pub fn head_track(&self) -> u8 {
        self.head_track
    }

    pub fn density(&self) -> DiskDensity {
        self.density
    }

    /// Insert a disk. Density is re-derived from the image geometry. If the
    /// motor is running the rotational reference is re-seeded, otherwise it
    /// is cleared until the motor starts.
    pub fn insert_image(&mut self, image: Box<dyn FloppyImage>, clock: &FdcClock, motor_on: bool) {
        self.density = DiskDensity::from_sectors_per_track(image.sectors_per_track());
        log::debug!(
            "Drive {}: inserted disk, {} spt, {} sides, density {}",
            self.drive_n,
            image.sectors_per_track(),
            image.sides(),
            self.density
        );
        self.image = Some(image);
        self.disk_present = true;
        self.media_change_cycle = clock.now + MEDIA_CHANGE_SECONDS * clock.cpu_hz as u64;

        if motor_on {
            self.seed_index_pulse(clock);
        }
        else {
            self.index_pulse_cycle = 0;
        }
    }

    /// Eject the disk, returning the image to the caller.
    pub fn eject_image(&mut self, clock: &FdcClock) -> Option<Box<dyn FloppyImage>> {
        if self.disk_present {
            log::debug!("Drive {}: ejected disk", self.drive_n);
        }
        self.disk_present = false;
        self.index_pulse_cycle = 0;
        self.media_change_cycle = clock.now + MEDIA_CHANGE_SECONDS * clock.cpu_hz as u64;
        self.image.take()
    }

    pub fn image(&self) -> Option<&dyn FloppyImage> {
        self.image.as_deref()
    }

    pub fn image_mut(&mut self) -> Option<&mut (dyn FloppyImage + 'static)> {
        self.image.as_deref_mut()
    }

    /// One rotation in controller cycles.
    pub fn rotation_period_fdc(&self, clock: &FdcClock) -> u64 {
        clock.fdc_hz as u64 * 60_000 / self.rpm_x1000 as u64
    }

    /// One rotation in CPU cycles. Mechanical, so the fast-FDC divisor does
    /// not apply.
    pub fn rotation_period_cpu(&self, clock: &FdcClock) -> u64 {
        clock.fdc_to_cpu_real(self.rotation_period_fdc(clock))
    }

    /// Seed the index reference to a random point in the revolution, as the
    /// motor spins up from an arbitrary position on real hardware.
    pub fn seed_index_pulse(&mut self, clock: &FdcClock) {
        let period = self.rotation_period_cpu(clock);
        let offset = rand::thread_rng().gen_range(0..period);
        self.index_pulse_cycle = clock.now.saturating_sub(offset).max(1);
    }

    /// Pin the index reference to a known cycle. Lets hosts (and tests)
    /// reproduce a fixed rotational alignment.
    pub fn align_index_pulse(&mut self, at_cycle: u64) {
        self.index_pulse_cycle = at_cycle.max(1);
    }

    pub fn clear_index_pulse(&mut self) {
        self.index_pulse_cycle = 0;
    }

    /// Whether the angular clock has a valid rotational reference.
    pub fn rotation_tracked(&self) -> bool {
        self.enabled && self.disk_present && self.index_pulse_cycle != 0
    }

    /// Controller cycles elapsed since the index pulse last passed the
    /// head, in [0, period).
    pub fn cycles_since_index(&self, clock: &FdcClock) -> u64 {
        if !self.rotation_tracked() {
            return 0;
        }
        let period_cpu = self.rotation_period_cpu(clock);
        let elapsed = clock.now.saturating_sub(self.index_pulse_cycle) % period_cpu;
        clock.cpu_to_fdc(elapsed)
    }

    /// MFM bytes passed since the index pulse.
    pub fn bytes_since_index(&self, clock: &FdcClock) -> u32 {
        (self.cycles_since_index(clock) as u32) * self.density.factor() / CYCLES_PER_MFM_BYTE
    }

    /// MFM bytes in one full revolution.
    pub fn bytes_per_rev(&self, clock: &FdcClock) -> u32 {
        (self.rotation_period_fdc(clock) as u32) * self.density.factor() / CYCLES_PER_MFM_BYTE
    }

    /// State of the index signal: high for the first few dozen bytes of
    /// each revolution.
    pub fn index_state(&self, clock: &FdcClock) -> bool {
        self.rotation_tracked() && self.bytes_since_index(clock) < INDEX_PULSE_BYTES
    }

    /// The write-protect optical sensor. With no disk the light path is
    /// open and the line reads protected; while media is moving past the
    /// sensor during a change it reads unprotected regardless of the disk.
    pub fn write_protect_state(&self, clock: &FdcClock) -> bool {
        if clock.now < self.media_change_cycle {
            return false;
        }
        match &self.image {
            Some(image) => image.write_protected(),
            None => true,
        }
    }

    /// Move the head one track in the given direction. Movement at the
    /// physical stops is clamped.
    pub fn step_head(&mut self, direction: i8) {
        if direction >= 0 {
            if self.head_track < MAX_HEAD_TRACK {
                self.head_track += 1;
            }
        }
        else if self.head_track > 0 {
            self.head_track -= 1;
        }
    }

    pub fn sectors_per_track(&self) -> u8 {
        self.image.as_ref().map_or(0, |i| i.sectors_per_track())
    }

    pub fn sides(&self) -> u8 {
        self.image.as_ref().map_or(0, |i| i.sides())
    }
}
