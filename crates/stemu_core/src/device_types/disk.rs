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

    device_types::disk.rs

    The disk image backend boundary. Image containers and format decoding
    live outside the core; a drive only needs the capability set below.
    One concrete backend ships: a raw sector dump in the layout of plain
    .st files.

*/

use anyhow::{anyhow, Error};

use crate::device_types::fdc::SECTOR_SIZE;

/// Capability set a drive requires from a mounted disk image. Chosen per
/// drive; the host decides which backend each drive carries.
pub trait FloppyImage: Send {
    fn read_sector(&self, track: u8, side: u8, sector: u8, buf: &mut [u8]) -> Result<(), Error>;
    fn write_sector(&mut self, track: u8, side: u8, sector: u8, data: &[u8]) -> Result<(), Error>;
    fn sectors_per_track(&self) -> u8;
    fn sides(&self) -> u8;
    fn write_protected(&self) -> bool;
}

/// A flat sector dump: 512-byte sectors, track-major order with the sides
/// of each track interleaved. This is the layout of raw .st images.
pub struct RawSectorImage {
    data: Vec<u8>,
    tracks: u8,
    sides: u8,
    spt: u8,
    write_protect: bool,
}

impl RawSectorImage {
    /// Create a blank, formatted image of the given geometry.
    pub fn new(tracks: u8, sides: u8, spt: u8) -> Self {
        let size = tracks as usize * sides as usize * spt as usize * SECTOR_SIZE;
        Self {
            data: vec![0; size],
            tracks,
            sides,
            spt,
            write_protect: false,
        }
    }

    /// Wrap an existing sector dump. The track count is derived from the
    /// data length, which must cover whole tracks.
    pub fn from_vec(data: Vec<u8>, sides: u8, spt: u8) -> Result<Self, Error> {
        let track_bytes = sides as usize * spt as usize * SECTOR_SIZE;
        if track_bytes == 0 || data.len() % track_bytes != 0 {
            return Err(anyhow!(
                "image size {} is not a whole number of {} byte tracks",
                data.len(),
                track_bytes
            ));
        }
        let tracks = (data.len() / track_bytes) as u8;
        Ok(Self {
            data,
            tracks,
            sides,
            spt,
            write_protect: false,
        })
    }

    pub fn set_write_protect(&mut self, protect: bool) {
        self.write_protect = protect;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn sector_offset(&self, track: u8, side: u8, sector: u8) -> Result<usize, Error> {
        if track >= self.tracks || side >= self.sides || sector == 0 || sector > self.spt {
            return Err(anyhow!(
                "sector out of range: t:{} s:{} sec:{} (geometry t:{} s:{} spt:{})",
                track,
                side,
                sector,
                self.tracks,
                self.sides,
                self.spt
            ));
        }
        let sectors_in = (track as usize * self.sides as usize + side as usize) * self.spt as usize
            + (sector as usize - 1);
        Ok(sectors_in * SECTOR_SIZE)
    }
}

impl FloppyImage for RawSectorImage {
    fn read_sector(&self, track: u8, side: u8, sector: u8, buf: &mut [u8]) -> Result<(), Error> {
        let offset = self.sector_offset(track, side, sector)?;
        buf[..SECTOR_SIZE].copy_from_slice(&self.data[offset..offset + SECTOR_SIZE]);
        Ok(())
    }

    fn write_sector(&mut self, track: u8, side: u8, sector: u8, data: &[u8]) -> Result<(), Error> {
        let offset = self.sector_offset(track, side, sector)?;
        self.data[offset..offset + SECTOR_SIZE].copy_from_slice(&data[..SECTOR_SIZE]);
        Ok(())
    }

    fn sectors_per_track(&self) -> u8 {
        self.spt
    }

    fn sides(&self) -> u8 {
        self.sides
    }

    fn write_protected(&self) -> bool {
        self.write_protect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_addressing() {
        let mut image = RawSectorImage::new(80, 2, 9);
        let data = [0x5A; SECTOR_SIZE];
        image.write_sector(3, 1, 2, &data).unwrap();

        let mut buf = [0u8; SECTOR_SIZE];
        image.read_sector(3, 1, 2, &mut buf).unwrap();
        assert_eq!(buf, data);

        // Track 3 side 1 sector 2 starts at ((3*2+1)*9 + 1) * 512.
        assert_eq!(image.sector_offset(3, 1, 2).unwrap(), 64 * SECTOR_SIZE);
    }

    #[test]
    fn test_out_of_range() {
        let image = RawSectorImage::new(80, 1, 9);
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(image.read_sector(0, 1, 1, &mut buf).is_err());
        assert!(image.read_sector(0, 0, 0, &mut buf).is_err());
        assert!(image.read_sector(0, 0, 10, &mut buf).is_err());
        assert!(image.read_sector(80, 0, 1, &mut buf).is_err());
    }

    #[test]
    fn test_from_vec_geometry() {
        let data = vec![0u8; 2 * 9 * SECTOR_SIZE * 80];
        let image = RawSectorImage::from_vec(data, 2, 9).unwrap();
        assert_eq!(image.sides(), 2);
        assert_eq!(image.sectors_per_track(), 9);

        let bad = vec![0u8; 1000];
        assert!(RawSectorImage::from_vec(bad, 2, 9).is_err());
    }
}
