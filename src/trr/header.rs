//! The header that precedes every TRR frame.
//!
//! Field descriptions follow the [TRR format notes](http://www.ks.uiuc.edu/~danorris/projects/formats/trr.shtml).
//! Several of the size records describe blocks this crate doesn't understand; they are written as
//! 0, and skipped by byte count when reading.

use std::io::{self, ErrorKind, Read, Write};

use crate::binary::{
    Precision, read_f32, read_size, read_string, write_f32, write_size, write_string,
};

/// Identifies a TRR header. Must be the first record of every frame.
pub const MAGIC: u32 = 1_993;
pub const VERSION: u32 = 13;
pub const DEFAULT_TITLE: &str = "Created by trr_files::TrrFile";

/// Number of u32 and f32 records in a header, not counting the title bytes.
const FIXED_RECORDS: u64 = 18;

#[derive(Clone, Debug, PartialEq)]
pub struct TrrHeader {
    /// Must be 1993.
    pub magic: u32,
    pub version: u32,
    /// Byte length of `title`. Use `set_title` to keep the two in sync.
    pub title_length: u32,
    pub title: String,
    pub ir_size: u32,
    pub e_size: u32,
    /// 9 for a general box, stored as x1 y1 z1 x2 y2 z2 x3 y3 z3. 3 for a rectangular box, stored
    /// as x1 y2 z3 with the other components 0. 0 if there is no box.
    pub bounding_box_data_size: u32,
    /// Byte count of a block following the box. Not decoded.
    pub vir_size: u32,
    /// Byte count of a block following `vir`. Not decoded.
    pub pres_size: u32,
    pub top_size: u32,
    pub sym_size: u32,
    /// Bytes per position component: 4 or 8.
    pub position_data_size: u32,
    /// Bytes per velocity component; 0 if velocities are absent.
    pub velocity_data_size: u32,
    /// Bytes per force component; 0 if forces are absent.
    pub force_data_size: u32,
    pub number_of_atoms: u32,
    pub timestep_index: u32,
    pub nre: u32,
    /// ps
    pub timestep_time: f32,
    pub lambda: f32,
}

impl Default for TrrHeader {
    fn default() -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            title_length: DEFAULT_TITLE.len() as u32,
            title: DEFAULT_TITLE.to_owned(),
            ir_size: 0,
            e_size: 0,
            bounding_box_data_size: 0,
            vir_size: 0,
            pres_size: 0,
            top_size: 0,
            sym_size: 0,
            position_data_size: Precision::Single.bytes(),
            velocity_data_size: 0,
            force_data_size: 0,
            number_of_atoms: 0,
            timestep_index: 0,
            nre: 0,
            timestep_time: 0.,
            lambda: 0.,
        }
    }
}

impl TrrHeader {
    pub fn set_title(&mut self, title: &str) {
        self.title = title.to_owned();
        self.title_length = title.len() as u32;
    }

    /// Write every record, in file order.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        if self.title_length as usize != self.title.len() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "Title length {} doesn't match the title's {} bytes",
                    self.title_length,
                    self.title.len()
                ),
            ));
        }

        write_size(w, self.magic)?;
        write_size(w, self.version)?;
        write_size(w, self.title_length)?;
        write_string(w, &self.title)?;

        for v in [
            self.ir_size,
            self.e_size,
            self.bounding_box_data_size,
            self.vir_size,
            self.pres_size,
            self.top_size,
            self.sym_size,
            self.position_data_size,
            self.velocity_data_size,
            self.force_data_size,
            self.number_of_atoms,
            self.timestep_index,
            self.nre,
        ] {
            write_size(w, v)?;
        }

        write_f32(w, self.timestep_time)?;
        write_f32(w, self.lambda)
    }

    /// Read every record, in file order. Fails with `InvalidData` as soon as the magic number
    /// doesn't match; nothing past it is consumed in that case.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let magic = read_size(r)?;
        if magic != MAGIC {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("Not a TRR frame: magic number is {magic}; expected {MAGIC}"),
            ));
        }

        let version = read_size(r)?;
        let title_length = read_size(r)?;
        let title = read_string(r, title_length as usize)?;

        let mut sizes = [0u32; 13];
        for s in &mut sizes {
            *s = read_size(r)?;
        }

        let timestep_time = read_f32(r)?;
        let lambda = read_f32(r)?;

        Ok(Self {
            magic,
            version,
            title_length,
            title,
            ir_size: sizes[0],
            e_size: sizes[1],
            bounding_box_data_size: sizes[2],
            vir_size: sizes[3],
            pres_size: sizes[4],
            top_size: sizes[5],
            sym_size: sizes[6],
            position_data_size: sizes[7],
            velocity_data_size: sizes[8],
            force_data_size: sizes[9],
            number_of_atoms: sizes[10],
            timestep_index: sizes[11],
            nre: sizes[12],
            timestep_time,
            lambda,
        })
    }

    /// Check the size records against what this codec can decode, and return the frame's
    /// precision.
    pub fn validate(&self) -> io::Result<Precision> {
        if !matches!(self.bounding_box_data_size, 0 | 3 | 9) {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!(
                    "Unsupported bounding box size: {}",
                    self.bounding_box_data_size
                ),
            ));
        }

        let precision = Precision::from_bytes(self.position_data_size).ok_or_else(|| {
            io::Error::new(
                ErrorKind::InvalidData,
                format!("Unsupported position size: {}", self.position_data_size),
            )
        })?;

        for (name, v) in [
            ("velocity", self.velocity_data_size),
            ("force", self.force_data_size),
        ] {
            if v != 0 && v != self.position_data_size {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "The {name} size ({v}) doesn't match the position size ({})",
                        self.position_data_size
                    ),
                ));
            }
        }

        Ok(precision)
    }

    /// Encoded size of this header, in bytes.
    pub fn byte_len(&self) -> u64 {
        FIXED_RECORDS * 4 + self.title.len() as u64
    }

    /// Bytes of all blocks following this header, including the ones we skip.
    pub fn payload_len(&self) -> u64 {
        let unused = [
            self.ir_size,
            self.e_size,
            self.top_size,
            self.sym_size,
            self.vir_size,
            self.pres_size,
        ]
        .iter()
        .map(|&v| v as u64)
        .sum::<u64>();

        let vec_block = self.number_of_atoms as u64 * 3;

        unused
            + self.bounding_box_data_size as u64 * self.position_data_size as u64
            + vec_block
                * (self.position_data_size as u64
                    + self.velocity_data_size as u64
                    + self.force_data_size as u64)
    }
}
