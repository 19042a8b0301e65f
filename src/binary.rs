//! Fixed-width scalar reads and writes. Every TRR record is composed of these.
//!
//! Byte order is fixed to big-endian (XDR network order, which is what GROMACS uses), so files
//! are portable between machines regardless of native layout.

use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Byte width of every floating-point payload scalar in a frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Precision {
    /// 4 bytes per scalar; `f32`.
    #[default]
    Single,
    /// 8 bytes per scalar; `f64`.
    Double,
}

impl Precision {
    /// Width in bytes, as stored in the header's `*_data_size` fields.
    pub fn bytes(self) -> u32 {
        match self {
            Self::Single => 4,
            Self::Double => 8,
        }
    }

    pub fn from_bytes(n: u32) -> Option<Self> {
        match n {
            4 => Some(Self::Single),
            8 => Some(Self::Double),
            _ => None,
        }
    }
}

pub fn write_size<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_u32::<BigEndian>(v)
}

pub fn read_size<R: Read>(r: &mut R) -> io::Result<u32> {
    r.read_u32::<BigEndian>()
}

pub fn write_char<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_u8(v)
}

pub fn read_char<R: Read>(r: &mut R) -> io::Result<u8> {
    r.read_u8()
}

pub fn write_f32<W: Write>(w: &mut W, v: f32) -> io::Result<()> {
    w.write_f32::<BigEndian>(v)
}

pub fn read_f32<R: Read>(r: &mut R) -> io::Result<f32> {
    r.read_f32::<BigEndian>()
}

pub fn write_f64<W: Write>(w: &mut W, v: f64) -> io::Result<()> {
    w.write_f64::<BigEndian>(v)
}

pub fn read_f64<R: Read>(r: &mut R) -> io::Result<f64> {
    r.read_f64::<BigEndian>()
}

/// Write a payload scalar at the file's active width. Single precision narrows the value.
pub fn write_real<W: Write>(w: &mut W, v: f64, precision: Precision) -> io::Result<()> {
    match precision {
        Precision::Single => write_f32(w, v as f32),
        Precision::Double => write_f64(w, v),
    }
}

pub fn read_real<R: Read>(r: &mut R, precision: Precision) -> io::Result<f64> {
    match precision {
        Precision::Single => Ok(read_f32(r)? as f64),
        Precision::Double => read_f64(r),
    }
}

/// Raw title bytes, one char at a time; no length prefix or padding.
pub fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    for b in s.bytes() {
        write_char(w, b)?;
    }
    Ok(())
}

pub fn read_string<R: Read>(r: &mut R, len: usize) -> io::Result<String> {
    let mut buf = Vec::with_capacity(len.min(256));
    r.take(len as u64).read_to_end(&mut buf)?;

    if buf.len() != len {
        return Err(io::Error::new(
            ErrorKind::UnexpectedEof,
            format!("Title is {len} bytes, but only {} remain", buf.len()),
        ));
    }

    String::from_utf8(buf)
        .map_err(|_| io::Error::new(ErrorKind::InvalidData, "Title is not valid UTF-8"))
}

/// Advance past `n` bytes without decoding them. Fails with `UnexpectedEof` if that would run
/// past the end of the stream; the cursor is then left where it was.
pub fn skip_bytes<R: Read + Seek>(r: &mut R, n: u64) -> io::Result<()> {
    if n == 0 {
        return Ok(());
    }

    let start = r.stream_position()?;
    let end = r.seek(SeekFrom::End(0))?;

    if start + n > end {
        r.seek(SeekFrom::Start(start))?;
        return Err(io::Error::new(
            ErrorKind::UnexpectedEof,
            format!("Can't skip {n} bytes; only {} remain", end - start),
        ));
    }

    r.seek(SeekFrom::Start(start + n))?;
    Ok(())
}
