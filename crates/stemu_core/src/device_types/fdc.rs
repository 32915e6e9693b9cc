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

    device_types::fdc.rs

    Defines types and media constants common to the floppy controller and
    drive implementations: densities, MFM timing, the synthesized track
    layout and the ID-field CRC.

*/

use std::fmt::Display;

use serde_derive::{Deserialize, Serialize};

pub const SECTOR_SIZE: usize = 512;

/// Controller cycles per encoded MFM byte at double density (32us at the
/// nominal 8MHz clock). Divided by the density factor for HD/ED media.
pub const CYCLES_PER_MFM_BYTE: u32 = 256;

/// The index pulse stays high for this many MFM bytes at the start of each
/// revolution.
pub const INDEX_PULSE_BYTES: u32 = 46;

/// Byte length of one synthesized track at double density. HD/ED tracks are
/// two/four times this.
pub const TRACK_BYTES_DD: usize = 6268;

/// WD1772 step rates in milliseconds, indexed by the low two command bits.
pub const STEP_RATE_MS: [u32; 4] = [6, 12, 2, 3];

// Synthesized track layout, in bytes. GAP1, then per sector: GAP2 zeros,
// sync, ID address mark, ID + CRC, GAP3a, GAP3b zeros, sync, data address
// mark, data, CRC, GAP4. GAP5 pads to the track boundary.
pub const GAP1_BYTES: usize = 60;
pub const GAP2_BYTES: usize = 12;
pub const SYNC_BYTES: usize = 3;
pub const GAP3A_BYTES: usize = 22;
pub const GAP3B_BYTES: usize = 12;
pub const GAP4_BYTES: usize = 40;

pub const GAP_FILL_BYTE: u8 = 0x4E;
pub const SYNC_BYTE: u8 = 0xA1;
pub const ID_ADDRESS_MARK: u8 = 0xFE;
pub const DATA_ADDRESS_MARK: u8 = 0xFB;

/// ID field body (track, side, sector, length code) plus its CRC.
pub const ID_FIELD_BYTES: usize = 6;

/// Length code for 512-byte sectors, the only size the supported image
/// formats carry.
pub const SECTOR_LEN_CODE: u8 = 0x02;

/// Total bytes one sector occupies in the synthesized layout.
pub const SECTOR_LAYOUT_BYTES: usize = GAP2_BYTES
    + SYNC_BYTES
    + 1
    + ID_FIELD_BYTES
    + GAP3A_BYTES
    + GAP3B_BYTES
    + SYNC_BYTES
    + 1
    + SECTOR_SIZE
    + 2
    + GAP4_BYTES;

/// Byte offset of a sector's ID field body (the track byte, just past the
/// ID address mark) from the index pulse, for sector index `n` (0-based).
pub fn id_field_offset(n: usize) -> usize {
    GAP1_BYTES + n * SECTOR_LAYOUT_BYTES + GAP2_BYTES + SYNC_BYTES + 1
}

/// Byte offset of the first data byte of sector index `n` from the index
/// pulse.
pub fn data_field_offset(n: usize) -> usize {
    id_field_offset(n) + ID_FIELD_BYTES + GAP3A_BYTES + GAP3B_BYTES + SYNC_BYTES + 1
}

/// Media density, as a multiplier on double-density byte throughput.
#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub enum DiskDensity {
    #[default]
    Double,
    High,
    Extended,
}

impl DiskDensity {
    pub fn factor(&self) -> u32 {
        match self {
            DiskDensity::Double => 1,
            DiskDensity::High => 2,
            DiskDensity::Extended => 4,
        }
    }

    /// Derive the density from the sector count of a track; this is how
    /// media density is re-inspected on disk insertion.
    pub fn from_sectors_per_track(spt: u8) -> DiskDensity {
        match spt {
            0..=11 => DiskDensity::Double,
            12..=22 => DiskDensity::High,
            _ => DiskDensity::Extended,
        }
    }
}

impl Display for DiskDensity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskDensity::Double => write!(f, "DD"),
            DiskDensity::High => write!(f, "HD"),
            DiskDensity::Extended => write!(f, "ED"),
        }
    }
}

/// One ID field as read off the disk surface. The controller keeps the most
/// recently seen one as its next-sector-id shadow.
#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize)]
pub struct SectorId {
    pub track: u8,
    pub side: u8,
    pub sector: u8,
    pub len_code: u8,
}

impl Display for SectorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[t:{} s:{} sec:{} n:{}]",
            self.track, self.side, self.sector, self.len_code
        )
    }
}

impl SectorId {
    /// CRC of the ID field, computed over the sync marks, the ID address
    /// mark and the four ID bytes.
    pub fn crc(&self) -> u16 {
        crc16(&[
            SYNC_BYTE,
            SYNC_BYTE,
            SYNC_BYTE,
            ID_ADDRESS_MARK,
            self.track,
            self.side,
            self.sector,
            self.len_code,
        ])
    }
}

/// CRC-16 with polynomial x^16 + x^12 + x^5 + 1, preset 0xFFFF, as produced
/// by the WD1772 for ID and data fields.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            }
            else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_sync_marks() {
        // Known value for the three A1 sync marks alone.
        assert_eq!(crc16(&[0xA1, 0xA1, 0xA1]), 0xCDB4);
    }

    #[test]
    fn test_sector_layout() {
        assert_eq!(SECTOR_LAYOUT_BYTES, 614);
        // A nine-sector track plus gaps fits the standard track length.
        assert!(GAP1_BYTES + 9 * SECTOR_LAYOUT_BYTES < TRACK_BYTES_DD);
        assert_eq!(id_field_offset(0), 76);
        assert_eq!(data_field_offset(0) - id_field_offset(0), 44);
    }

    #[test]
    fn test_density_inspection() {
        assert_eq!(DiskDensity::from_sectors_per_track(9), DiskDensity::Double);
        assert_eq!(DiskDensity::from_sectors_per_track(11), DiskDensity::Double);
        assert_eq!(DiskDensity::from_sectors_per_track(18), DiskDensity::High);
        assert_eq!(DiskDensity::from_sectors_per_track(36), DiskDensity::Extended);
    }
}
