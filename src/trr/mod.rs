//! For reading and writing the GROMACS TRR trajectory format.
//!
//! A TRR file has no file-level header. It's a sequence of frames, each made of a `TrrHeader`
//! followed by the bounding box, positions, and optionally velocities and forces. Each frame
//! describes itself: the header records the atom count and the width (4 or 8 bytes) of every
//! scalar that follows, so one file may mix precisions.
//!
//! Per-frame operations report success as a `bool`, and log the reason for a failure at `debug`
//! level. Use `at_end` to tell a clean end of file from a bad or truncated frame.

pub mod header;

use std::{
    fs::{File, OpenOptions},
    io::{self, BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

pub use header::TrrHeader;
use lin_alg::f64::Vec3;
use log::{debug, warn};

use crate::{
    OpenMode, Snapshot, SnapshotSink, TrajectoryFile, TrrError,
    binary::{Precision, read_real, skip_bytes, write_real},
};

/// ps
const DEFAULT_TIMESTEP: f32 = 0.002;

/// Settings consulted each time a frame is appended. Reading a frame overwrites them with what
/// that frame's header describes.
#[derive(Clone, Debug)]
pub struct TrrConfig {
    pub precision: Precision,
    pub has_velocities: bool,
    pub has_forces: bool,
    /// ps
    pub timestep: f32,
    /// Basis vectors of the simulation box. nm.
    pub bounding_box: [Vec3; 3],
}

impl Default for TrrConfig {
    fn default() -> Self {
        Self {
            precision: Precision::Single,
            has_velocities: false,
            has_forces: false,
            timestep: DEFAULT_TIMESTEP,
            bounding_box: [
                Vec3::new(0., 0., 0.),
                Vec3::new(0., 0., 0.),
                Vec3::new(0., 0., 0.),
            ],
        }
    }
}

impl PartialEq for TrrConfig {
    fn eq(&self, other: &Self) -> bool {
        self.precision == other.precision
            && self.has_velocities == other.has_velocities
            && self.has_forces == other.has_forces
            && self.timestep == other.timestep
            && self
                .bounding_box
                .iter()
                .zip(&other.bounding_box)
                .all(|(a, b)| a.x == b.x && a.y == b.y && a.z == b.z)
    }
}

#[derive(Default)]
enum Stream {
    #[default]
    Closed,
    Read(BufReader<File>),
    Write(BufWriter<File>),
}

/// One decoded frame, before it's handed to the caller.
struct Frame {
    header: TrrHeader,
    precision: Precision,
    bounding_box: Option<[Vec3; 3]>,
    snapshot: Snapshot,
}

/// A TRR file, opened for reading, writing, or appending. Owns its file handle; this is released
/// on `close` or `clear`, or when dropped. Appended frames are buffered: call `close` (or
/// `flush_to_disk`) to find out whether they reached the disk.
#[derive(Default)]
pub struct TrrFile {
    path: PathBuf,
    mode: OpenMode,
    stream: Stream,
    config: TrrConfig,
    /// The current frame's header: the last one read or written.
    header: TrrHeader,
    /// Index assigned to the next appended frame, or the index of the last frame read.
    timestep_index: u32,
    num_atoms: Option<u32>,
    /// File size when opened for appending.
    old_file_size: u64,
    /// File size when opened for reading.
    file_len: u64,
    /// When writing: frames already in the file, plus ones appended through this handle.
    frames_written: usize,
}

impl PartialEq for TrrFile {
    /// Compares configuration only; not file contents.
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.mode == other.mode && self.config == other.config
    }
}

impl TrrFile {
    /// A closed file, with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct, and open the file.
    pub fn open(path: &Path, mode: OpenMode) -> io::Result<Self> {
        let mut result = Self::new();
        result.path = path.to_owned();
        result.mode = mode;
        result.init()?;

        Ok(result)
    }

    /// Open the stream for this file's path and mode. When appending to a file that already has
    /// frames, precision, the optional blocks, box and atom count are taken from its first
    /// frame, and numbering continues after its highest timestep index.
    pub fn init(&mut self) -> io::Result<()> {
        self.stream = Stream::Closed;
        self.timestep_index = 0;
        self.num_atoms = None;
        self.frames_written = 0;
        self.old_file_size = 0;
        self.file_len = 0;

        match self.mode {
            OpenMode::Read => {
                let f = File::open(&self.path)?;
                self.file_len = f.metadata()?.len();
                self.stream = Stream::Read(BufReader::new(f));
            }
            OpenMode::Write => {
                let f = File::create(&self.path)?;
                self.stream = Stream::Write(BufWriter::new(f));
            }
            OpenMode::Append => {
                let f = OpenOptions::new()
                    .read(true)
                    .append(true)
                    .create(true)
                    .open(&self.path)?;

                self.old_file_size = f.metadata()?.len();
                if self.old_file_size > 0 {
                    self.scan_existing(&f)?;
                }

                self.stream = Stream::Write(BufWriter::new(f));
            }
        }

        Ok(())
    }

    /// Flush buffered frames, force them to disk, and close the stream. Settings are kept.
    pub fn close(&mut self) -> io::Result<()> {
        if let Stream::Write(mut w) = std::mem::take(&mut self.stream) {
            w.flush()?;
            w.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Close the file, and reset all settings to their defaults.
    pub fn clear(&mut self) {
        if let Err(e) = self.close() {
            warn!("Problem closing {}: {e}", self.path.display());
        }
        *self = Self::default();
    }

    fn scan_existing(&mut self, f: &File) -> io::Result<()> {
        let len = self.old_file_size;
        let mut r = BufReader::new(f);

        let first = read_frame(&mut r, len)?;
        self.apply_frame(&first);

        let mut max_index = first.header.timestep_index;
        let mut count = 1;
        let mut last = first.header;

        while r.stream_position()? < len {
            last = skip_frame_in(&mut r, len)?;
            max_index = max_index.max(last.timestep_index);
            count += 1;
        }

        // Frame times are index × timestep, so the last frame gives the step length.
        if last.timestep_index > 0 {
            self.config.timestep = last.timestep_time / last.timestep_index as f32;
        }

        self.timestep_index = max_index.saturating_add(1);
        self.frames_written = count;
        self.header = last;

        debug!(
            "Appending to {}: {count} existing frames, next timestep index {}",
            self.path.display(),
            self.timestep_index
        );

        Ok(())
    }

    /// Take on the settings a decoded frame describes.
    fn apply_frame(&mut self, frame: &Frame) {
        self.config.precision = frame.precision;
        self.config.has_velocities = frame.header.velocity_data_size != 0;
        self.config.has_forces = frame.header.force_data_size != 0;
        if let Some(b) = frame.bounding_box {
            self.config.bounding_box = b;
        }
        self.num_atoms = Some(frame.header.number_of_atoms);
    }

    /// Header for the next appended frame, from the current settings.
    fn next_header(&self, num_atoms: u32) -> TrrHeader {
        let width = self.config.precision.bytes();

        TrrHeader {
            bounding_box_data_size: box_data_size(&self.config.bounding_box),
            position_data_size: width,
            velocity_data_size: if self.config.has_velocities { width } else { 0 },
            force_data_size: if self.config.has_forces { width } else { 0 },
            number_of_atoms: num_atoms,
            timestep_index: self.timestep_index,
            timestep_time: self.timestep_index as f32 * self.config.timestep,
            ..Default::default()
        }
    }

    fn try_append(&mut self, snapshot: &Snapshot) -> io::Result<()> {
        let n = snapshot.positions.len();
        let n_atoms = u32::try_from(n)
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "Too many atoms for TRR"))?;

        if let Some(existing) = self.num_atoms {
            if existing != n_atoms {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("Atom count {n} doesn't match the file's {existing}"),
                ));
            }
        }

        for (enabled, block, name) in [
            (self.config.has_velocities, &snapshot.velocities, "velocities"),
            (self.config.has_forces, &snapshot.forces, "forces"),
        ] {
            if enabled && block.len() != n {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("Expected {n} {name}; got {}", block.len()),
                ));
            }
        }

        let header = self.next_header(n_atoms);
        let precision = self.config.precision;

        let Stream::Write(w) = &mut self.stream else {
            return Err(not_open("writing"));
        };

        header.write_to(w)?;
        write_box(
            w,
            &self.config.bounding_box,
            header.bounding_box_data_size,
            precision,
        )?;

        write_vecs(w, &snapshot.positions, precision)?;
        if header.velocity_data_size != 0 {
            write_vecs(w, &snapshot.velocities, precision)?;
        }
        if header.force_data_size != 0 {
            write_vecs(w, &snapshot.forces, precision)?;
        }

        self.timestep_index = self.timestep_index.saturating_add(1);
        self.num_atoms = Some(n_atoms);
        self.frames_written += 1;
        self.header = header;

        Ok(())
    }

    fn try_read(&mut self) -> io::Result<Frame> {
        let Stream::Read(r) = &mut self.stream else {
            return Err(not_open("reading"));
        };

        read_frame(r, self.file_len)
    }

    /// Whether the read cursor is at the end of the file. After a failed `read` or `skip_frame`,
    /// `false` means the failure was a bad or truncated frame, rather than the end of the data.
    pub fn at_end(&mut self) -> bool {
        match &mut self.stream {
            Stream::Read(r) => r
                .stream_position()
                .map(|p| p >= self.file_len)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Move the read cursor back to the first frame.
    pub fn rewind(&mut self) -> io::Result<()> {
        let Stream::Read(r) = &mut self.stream else {
            return Err(not_open("reading"));
        };

        r.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Read frames until one fails, passing each to `sink`. Returns the number of frames read.
    pub fn read_into<S: SnapshotSink>(&mut self, sink: &mut S) -> usize {
        let mut count = 0;
        let mut snapshot = Snapshot::default();

        while self.read(&mut snapshot) {
            sink.add_snapshot(std::mem::take(&mut snapshot));
            count += 1;
        }

        if count == 0 && self.file_len > 0 {
            warn!(
                "No frames could be read from {}, although it isn't empty",
                self.path.display()
            );
        }

        count
    }

    /// Append every snapshot in `buffer`, then force the data to disk. On error, the file's frame
    /// sequence is inconsistent: don't keep appending without checking it.
    pub fn flush_to_disk(&mut self, buffer: &[Snapshot]) -> Result<(), TrrError> {
        for (i, snapshot) in buffer.iter().enumerate() {
            if let Err(source) = self.try_append(snapshot) {
                return Err(TrrError::CannotWrite {
                    path: self.path.clone(),
                    frame: i,
                    source,
                });
            }
        }

        let Stream::Write(w) = &mut self.stream else {
            return Err(TrrError::CannotWrite {
                path: self.path.clone(),
                frame: buffer.len(),
                source: not_open("writing"),
            });
        };

        w.flush()
            .and_then(|_| w.get_ref().sync_all())
            .map_err(|source| TrrError::CannotWrite {
                path: self.path.clone(),
                frame: buffer.len(),
                source,
            })
    }

    /// Load every frame of a TRR file.
    pub fn load(path: &Path) -> io::Result<Vec<Snapshot>> {
        let mut file = Self::open(path, OpenMode::Read)?;

        let mut frames = Vec::new();
        file.read_into(&mut frames);

        if !file.at_end() {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("Problem reading TRR frame {}", frames.len()),
            ));
        }

        Ok(frames)
    }

    /// Create or overwrite a TRR file. Velocities and forces are stored if the first frame has
    /// them.
    pub fn save(path: &Path, precision: Precision, frames: &[Snapshot]) -> io::Result<()> {
        let mut file = Self::open(path, OpenMode::Write)?;

        file.config.precision = precision;
        if let Some(first) = frames.first() {
            file.config.has_velocities = !first.velocities.is_empty();
            file.config.has_forces = !first.forces.is_empty();
        }

        file.flush_to_disk(frames).map_err(io::Error::other)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn config(&self) -> &TrrConfig {
        &self.config
    }

    /// The last header read or written.
    pub fn header(&self) -> &TrrHeader {
        &self.header
    }

    pub fn num_atoms(&self) -> Option<u32> {
        self.num_atoms
    }

    pub fn old_file_size(&self) -> u64 {
        self.old_file_size
    }

    pub fn timestep_index(&self) -> u32 {
        self.timestep_index
    }

    pub fn has_velocities(&self) -> bool {
        self.config.has_velocities
    }

    /// Applies to frames appended from now on.
    pub fn set_velocity_storage(&mut self, storage: bool) {
        self.config.has_velocities = storage;
    }

    pub fn has_forces(&self) -> bool {
        self.config.has_forces
    }

    pub fn set_force_storage(&mut self, storage: bool) {
        self.config.has_forces = storage;
    }

    pub fn precision(&self) -> Precision {
        self.config.precision
    }

    /// `bytes` is the width of each stored scalar; 4 or 8.
    pub fn set_precision(&mut self, bytes: u32) -> Result<(), TrrError> {
        self.config.precision =
            Precision::from_bytes(bytes).ok_or(TrrError::InvalidPrecision(bytes))?;
        Ok(())
    }

    /// ps
    pub fn timestep(&self) -> f32 {
        self.config.timestep
    }

    pub fn set_timestep(&mut self, timestep: f32) {
        self.config.timestep = timestep;
    }

    pub fn bounding_box_x(&self) -> Vec3 {
        self.config.bounding_box[0]
    }

    pub fn bounding_box_y(&self) -> Vec3 {
        self.config.bounding_box[1]
    }

    pub fn bounding_box_z(&self) -> Vec3 {
        self.config.bounding_box[2]
    }

    /// nm. If all three vectors lie along their own axis, frames store the short, 3-value box.
    pub fn set_bounding_box(&mut self, x: Vec3, y: Vec3, z: Vec3) {
        self.config.bounding_box = [x, y, z];
    }
}

impl Drop for TrrFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Problem closing {}: {e}", self.path.display());
        }
    }
}

impl TrajectoryFile for TrrFile {
    type Header = TrrHeader;

    /// TRR files have no file-level header; this is a no-op.
    fn read_header(&mut self) -> bool {
        true
    }

    fn write_next_header(&mut self, header: &TrrHeader) -> bool {
        let Stream::Write(w) = &mut self.stream else {
            debug!("Can't write a header; {} isn't open for writing", self.path.display());
            return false;
        };

        match header.write_to(w) {
            Ok(()) => true,
            Err(e) => {
                debug!("Problem writing a TRR header to {}: {e}", self.path.display());
                false
            }
        }
    }

    /// Leaves the cursor after the header, at the start of its payload. On failure, the cursor
    /// is left at the start of the bad header.
    fn read_next_header(&mut self, header: &mut TrrHeader) -> bool {
        let Stream::Read(r) = &mut self.stream else {
            debug!("Can't read a header; {} isn't open for reading", self.path.display());
            return false;
        };

        match read_frame_header(r, self.file_len) {
            Ok((h, _)) => {
                self.header = h.clone();
                *header = h;
                true
            }
            Err(e) => {
                debug!("Problem reading a TRR header from {}: {e}", self.path.display());
                false
            }
        }
    }

    fn append(&mut self, snapshot: &Snapshot) -> bool {
        match self.try_append(snapshot) {
            Ok(()) => true,
            Err(e) => {
                debug!("Problem appending a TRR frame to {}: {e}", self.path.display());
                false
            }
        }
    }

    fn read(&mut self, snapshot: &mut Snapshot) -> bool {
        match self.try_read() {
            Ok(frame) => {
                self.apply_frame(&frame);
                self.timestep_index = frame.header.timestep_index;
                self.header = frame.header;
                *snapshot = frame.snapshot;
                true
            }
            Err(e) => {
                debug!("Problem reading a TRR frame from {}: {e}", self.path.display());
                false
            }
        }
    }

    fn skip_frame(&mut self) -> bool {
        let Stream::Read(r) = &mut self.stream else {
            return false;
        };

        match skip_frame_in(r, self.file_len) {
            Ok(header) => {
                self.timestep_index = header.timestep_index;
                self.header = header;
                true
            }
            Err(e) => {
                debug!("Problem skipping a TRR frame in {}: {e}", self.path.display());
                false
            }
        }
    }

    /// When reading, this scans the whole file, leaving the cursor after the last valid frame;
    /// call `rewind` before reading frames.
    fn number_of_snapshots(&mut self) -> usize {
        match self.stream {
            Stream::Read(_) => {
                if let Err(e) = self.rewind() {
                    debug!("Problem rewinding {}: {e}", self.path.display());
                    return 0;
                }

                let mut count = 0;
                while self.skip_frame() {
                    count += 1;
                }
                count
            }
            Stream::Write(_) => self.frames_written,
            Stream::Closed => 0,
        }
    }
}

fn not_open(purpose: &str) -> io::Error {
    io::Error::other(format!("TRR file isn't open for {purpose}"))
}

/// 3 if each basis vector lies along its own axis; 9 otherwise.
fn box_data_size(b: &[Vec3; 3]) -> u32 {
    let rectangular = b[0].y == 0.
        && b[0].z == 0.
        && b[1].x == 0.
        && b[1].z == 0.
        && b[2].x == 0.
        && b[2].y == 0.;

    if rectangular { 3 } else { 9 }
}

/// Read and validate a header, and check that its payload fits in the file. On error, the
/// cursor is returned to where the header started.
fn read_frame_header<R: Read + Seek>(
    r: &mut R,
    file_len: u64,
) -> io::Result<(TrrHeader, Precision)> {
    let start = r.stream_position()?;

    let result = TrrHeader::read_from(r).and_then(|header| {
        let precision = header.validate()?;

        let remaining = file_len.saturating_sub(r.stream_position()?);
        if header.payload_len() > remaining {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!(
                    "Frame {} is truncated: its payload is {} bytes, but only {remaining} remain",
                    header.timestep_index,
                    header.payload_len()
                ),
            ));
        }

        Ok((header, precision))
    });

    if result.is_err() {
        r.seek(SeekFrom::Start(start))?;
    }

    result
}

fn skip_frame_in<R: Read + Seek>(r: &mut BufReader<R>, file_len: u64) -> io::Result<TrrHeader> {
    let (header, _) = read_frame_header(r, file_len)?;
    r.seek_relative(header.payload_len() as i64)?;

    Ok(header)
}

fn read_frame<R: Read + Seek>(r: &mut R, file_len: u64) -> io::Result<Frame> {
    let start = r.stream_position()?;

    let result = read_frame_header(r, file_len).and_then(|(header, precision)| {
        skip_bytes(
            r,
            header.ir_size as u64
                + header.e_size as u64
                + header.top_size as u64
                + header.sym_size as u64,
        )?;

        let bounding_box = read_box(r, header.bounding_box_data_size, precision)?;

        skip_bytes(r, header.vir_size as u64 + header.pres_size as u64)?;

        let n = header.number_of_atoms as usize;
        let positions = read_vecs(r, n, precision)?;

        let velocities = if header.velocity_data_size != 0 {
            read_vecs(r, n, precision)?
        } else {
            Vec::new()
        };

        let forces = if header.force_data_size != 0 {
            read_vecs(r, n, precision)?
        } else {
            Vec::new()
        };

        Ok(Frame {
            snapshot: Snapshot {
                step: header.timestep_index,
                time: header.timestep_time,
                positions,
                velocities,
                forces,
            },
            header,
            precision,
            bounding_box,
        })
    });

    if result.is_err() {
        r.seek(SeekFrom::Start(start))?;
    }

    result
}

fn read_vec<R: Read>(r: &mut R, precision: Precision) -> io::Result<Vec3> {
    let x = read_real(r, precision)?;
    let y = read_real(r, precision)?;
    let z = read_real(r, precision)?;

    Ok(Vec3::new(x, y, z))
}

fn read_vecs<R: Read>(r: &mut R, n: usize, precision: Precision) -> io::Result<Vec<Vec3>> {
    let mut result = Vec::with_capacity(n);
    for _ in 0..n {
        result.push(read_vec(r, precision)?);
    }
    Ok(result)
}

fn write_vecs<W: Write>(w: &mut W, vecs: &[Vec3], precision: Precision) -> io::Result<()> {
    for v in vecs {
        write_real(w, v.x, precision)?;
        write_real(w, v.y, precision)?;
        write_real(w, v.z, precision)?;
    }
    Ok(())
}

fn read_box<R: Read>(
    r: &mut R,
    size: u32,
    precision: Precision,
) -> io::Result<Option<[Vec3; 3]>> {
    match size {
        9 => Ok(Some([
            read_vec(r, precision)?,
            read_vec(r, precision)?,
            read_vec(r, precision)?,
        ])),
        3 => {
            let x = read_real(r, precision)?;
            let y = read_real(r, precision)?;
            let z = read_real(r, precision)?;

            Ok(Some([
                Vec3::new(x, 0., 0.),
                Vec3::new(0., y, 0.),
                Vec3::new(0., 0., z),
            ]))
        }
        _ => Ok(None),
    }
}

fn write_box<W: Write>(
    w: &mut W,
    b: &[Vec3; 3],
    size: u32,
    precision: Precision,
) -> io::Result<()> {
    match size {
        9 => write_vecs(w, b, precision),
        3 => {
            write_real(w, b[0].x, precision)?;
            write_real(w, b[1].y, precision)?;
            write_real(w, b[2].z, precision)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::binary::write_size;

    const EPS_SINGLE: f64 = 1e-5;

    fn snapshot(n: usize, offset: f64, velocities: bool, forces: bool) -> Snapshot {
        let make = |scale: f64| {
            (0..n)
                .map(|i| {
                    let i = i as f64;
                    Vec3::new(
                        offset + scale * i,
                        offset - scale * i,
                        0.5 * offset + scale,
                    )
                })
                .collect::<Vec<_>>()
        };

        Snapshot {
            positions: make(0.1),
            velocities: if velocities { make(0.3) } else { Vec::new() },
            forces: if forces { make(1.7) } else { Vec::new() },
            ..Default::default()
        }
    }

    fn assert_vecs_close(a: &[Vec3], b: &[Vec3], eps: f64) {
        assert_eq!(a.len(), b.len());
        for (p, q) in a.iter().zip(b) {
            assert!((p.x - q.x).abs() <= eps, "{} vs {}", p.x, q.x);
            assert!((p.y - q.y).abs() <= eps, "{} vs {}", p.y, q.y);
            assert!((p.z - q.z).abs() <= eps, "{} vs {}", p.z, q.z);
        }
    }

    fn read_position(file: &mut TrrFile) -> u64 {
        match &mut file.stream {
            Stream::Read(r) => r.stream_position().unwrap(),
            _ => panic!("Not open for reading"),
        }
    }

    /// Writes `frames` with the given settings, and closes the file.
    fn write_file(path: &Path, precision: u32, vel: bool, forces: bool, frames: &[Snapshot]) {
        let mut file = TrrFile::open(path, OpenMode::Write).unwrap();
        file.set_precision(precision).unwrap();
        file.set_velocity_storage(vel);
        file.set_force_storage(forces);

        for frame in frames {
            assert!(file.append(frame));
        }
    }

    #[test]
    fn test_round_trip_both_precisions() {
        let dir = tempfile::tempdir().unwrap();

        for (precision, eps) in [(4, EPS_SINGLE), (8, 0.)] {
            let path = dir.path().join(format!("traj_{precision}.trr"));
            let frames: Vec<_> = (0..3)
                .map(|i| snapshot(10, i as f64, true, true))
                .collect();

            write_file(&path, precision, true, true, &frames);

            let mut file = TrrFile::open(&path, OpenMode::Read).unwrap();
            for (i, original) in frames.iter().enumerate() {
                let mut snap = Snapshot::default();
                assert!(file.read(&mut snap));

                assert_eq!(snap.step, i as u32);
                assert!((snap.time - i as f32 * DEFAULT_TIMESTEP).abs() < 1e-7);
                assert_vecs_close(&snap.positions, &original.positions, eps);
                assert_vecs_close(&snap.velocities, &original.velocities, eps);
                assert_vecs_close(&snap.forces, &original.forces, eps);
                assert_eq!(file.precision().bytes(), precision);
            }

            let mut snap = Snapshot::default();
            assert!(!file.read(&mut snap));
            assert!(file.at_end());
        }
    }

    #[test]
    fn test_precision_switch_doubles_payload() {
        let dir = tempfile::tempdir().unwrap();
        let frame = snapshot(25, 1., true, false);

        let mut payload_lens = Vec::new();
        for precision in [4, 8] {
            let path = dir.path().join(format!("p{precision}.trr"));
            write_file(&path, precision, true, false, &[frame.clone()]);

            let mut file = TrrFile::open(&path, OpenMode::Read).unwrap();
            let mut header = TrrHeader::default();
            assert!(file.read_next_header(&mut header));

            assert_eq!(header.position_data_size, precision);
            assert_eq!(header.velocity_data_size, precision);
            assert_eq!(header.force_data_size, 0);

            let len = fs::metadata(&path).unwrap().len();
            payload_lens.push(len - header.byte_len());
        }

        assert_eq!(payload_lens[1], 2 * payload_lens[0]);
        // 3 box scalars, and 25 positions and velocities.
        assert_eq!(payload_lens[0], (3 + 2 * 25 * 3) * 4);
    }

    #[test]
    fn test_bad_magic_leaves_outputs_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.trr");

        let mut bytes = Vec::new();
        write_size(&mut bytes, 1_992).unwrap();
        bytes.extend_from_slice(&[0; 100]);
        fs::write(&path, bytes).unwrap();

        let mut file = TrrFile::open(&path, OpenMode::Read).unwrap();

        let mut header = TrrHeader {
            number_of_atoms: 77,
            ..Default::default()
        };
        assert!(!file.read_next_header(&mut header));
        assert_eq!(header.number_of_atoms, 77);
        assert_eq!(read_position(&mut file), 0);

        let mut snap = snapshot(2, 3., false, false);
        assert!(!file.read(&mut snap));
        assert_eq!(snap.positions.len(), 2);
        assert_eq!(snap.positions[0].x, 3.);

        assert!(!file.skip_frame());
        assert!(!file.at_end());
        assert_eq!(file.number_of_snapshots(), 0);
    }

    #[test]
    fn test_skip_matches_read_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skip.trr");
        let frames: Vec<_> = (0..4).map(|i| snapshot(7, i as f64, true, false)).collect();
        write_file(&path, 8, true, false, &frames);

        let mut reader = TrrFile::open(&path, OpenMode::Read).unwrap();
        let mut skipper = TrrFile::open(&path, OpenMode::Read).unwrap();

        for _ in 0..3 {
            let mut snap = Snapshot::default();
            assert!(reader.read(&mut snap));
            assert!(skipper.skip_frame());
            assert_eq!(read_position(&mut reader), read_position(&mut skipper));
            assert_eq!(reader.timestep_index(), skipper.timestep_index());
        }
    }

    #[test]
    fn test_frame_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("count.trr");
        let frames: Vec<_> = (0..5).map(|i| snapshot(3, i as f64, false, false)).collect();

        {
            let mut file = TrrFile::open(&path, OpenMode::Write).unwrap();
            for frame in &frames {
                assert!(file.append(frame));
            }
            assert_eq!(file.number_of_snapshots(), 5);
        }

        let mut file = TrrFile::open(&path, OpenMode::Read).unwrap();
        assert_eq!(file.number_of_snapshots(), 5);
        assert!(file.at_end());

        // Counting leaves the cursor at the end; rewind to read.
        file.rewind().unwrap();
        let mut snap = Snapshot::default();
        assert!(file.read(&mut snap));
        assert_eq!(snap.step, 0);
    }

    #[test]
    fn test_optional_blocks_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vel.trr");
        let frames: Vec<_> = (0..3).map(|i| snapshot(4, i as f64, true, true)).collect();

        // Forces are present on the snapshots, but storage is off.
        write_file(&path, 4, true, false, &frames);

        let loaded = TrrFile::load(&path).unwrap();
        assert_eq!(loaded.len(), 3);
        for snap in &loaded {
            assert_eq!(snap.velocities.len(), 4);
            assert!(snap.forces.is_empty());
        }

        let mut file = TrrFile::open(&path, OpenMode::Read).unwrap();
        let mut snap = Snapshot::default();
        assert!(file.read(&mut snap));
        assert!(file.has_velocities());
        assert!(!file.has_forces());
    }

    #[test]
    fn test_append_continues_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("append.trr");
        let frames: Vec<_> = (0..2).map(|i| snapshot(6, i as f64, false, true)).collect();

        {
            let mut file = TrrFile::open(&path, OpenMode::Write).unwrap();
            file.set_precision(8).unwrap();
            file.set_force_storage(true);
            file.set_timestep(0.001);
            for frame in &frames {
                assert!(file.append(frame));
            }
            file.close().unwrap();
        }

        let size_before = fs::metadata(&path).unwrap().len();

        {
            let mut file = TrrFile::open(&path, OpenMode::Append).unwrap();
            assert_eq!(file.old_file_size(), size_before);
            assert_eq!(file.precision(), Precision::Double);
            assert!(file.has_forces());
            assert!(!file.has_velocities());
            assert_eq!(file.num_atoms(), Some(6));
            assert_eq!(file.timestep_index(), 2);
            assert_eq!(file.number_of_snapshots(), 2);
            assert!((file.timestep() - 0.001).abs() < 1e-9);

            let extra = snapshot(6, 9., false, true);
            file.flush_to_disk(&[extra]).unwrap();
            assert_eq!(file.number_of_snapshots(), 3);
        }

        let loaded = TrrFile::load(&path).unwrap();
        assert_eq!(loaded.len(), 3);

        for (orig, snap) in frames.iter().zip(&loaded) {
            assert_vecs_close(&snap.positions, &orig.positions, 0.);
            assert_vecs_close(&snap.forces, &orig.forces, 0.);
        }
        assert_eq!(loaded[2].step, 2);
        assert!(loaded[2].step > loaded[1].step);
        assert_eq!(loaded[2].positions[0].x, 9.);
        assert!((loaded[2].time - 0.002).abs() < 1e-7);
    }

    #[test]
    fn test_append_to_missing_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new.trr");

        let mut file = TrrFile::open(&path, OpenMode::Append).unwrap();
        assert_eq!(file.old_file_size(), 0);
        assert_eq!(file.timestep_index(), 0);
        assert!(file.append(&snapshot(2, 0., false, false)));
    }

    #[test]
    fn test_append_rejects_bad_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reject.trr");

        let mut file = TrrFile::open(&path, OpenMode::Write).unwrap();
        file.set_velocity_storage(true);

        // Velocities enabled, but missing.
        assert!(!file.append(&snapshot(3, 0., false, false)));
        assert_eq!(file.timestep_index(), 0);

        assert!(file.append(&snapshot(3, 0., true, false)));
        // Atom count differs from the first frame.
        assert!(!file.append(&snapshot(4, 0., true, false)));
        assert_eq!(file.timestep_index(), 1);
    }

    #[test]
    fn test_invalid_precision_is_rejected() {
        let mut file = TrrFile::new();
        file.set_precision(8).unwrap();

        let err = file.set_precision(6).unwrap_err();
        assert!(matches!(err, TrrError::InvalidPrecision(6)));
        assert_eq!(file.precision(), Precision::Double);
    }

    #[test]
    fn test_bounding_box_shapes() {
        let dir = tempfile::tempdir().unwrap();

        let rect = [
            Vec3::new(3., 0., 0.),
            Vec3::new(0., 4., 0.),
            Vec3::new(0., 0., 5.),
        ];
        let triclinic = [
            Vec3::new(3., 0., 0.),
            Vec3::new(1., 4., 0.),
            Vec3::new(0.5, 0.5, 5.),
        ];

        for (b, expected_size) in [(rect, 3), (triclinic, 9)] {
            let path = dir.path().join(format!("box{expected_size}.trr"));
            {
                let mut file = TrrFile::open(&path, OpenMode::Write).unwrap();
                file.set_bounding_box(b[0], b[1], b[2]);
                assert!(file.append(&snapshot(2, 0., false, false)));
                assert_eq!(file.header().bounding_box_data_size, expected_size);
            }

            let mut file = TrrFile::open(&path, OpenMode::Read).unwrap();
            let mut snap = Snapshot::default();
            assert!(file.read(&mut snap));

            assert_eq!(file.header().bounding_box_data_size, expected_size);
            assert_vecs_close(
                &[
                    file.bounding_box_x(),
                    file.bounding_box_y(),
                    file.bounding_box_z(),
                ],
                &b,
                EPS_SINGLE,
            );
        }
    }

    #[test]
    fn test_unsupported_sizes_are_format_errors() {
        let dir = tempfile::tempdir().unwrap();

        let bad_box = TrrHeader {
            bounding_box_data_size: 6,
            ..Default::default()
        };
        let no_positions = TrrHeader {
            position_data_size: 0,
            ..Default::default()
        };

        for (i, header) in [bad_box, no_positions].iter().enumerate() {
            let path = dir.path().join(format!("bad{i}.trr"));
            {
                let mut file = TrrFile::open(&path, OpenMode::Write).unwrap();
                assert!(file.write_next_header(header));
            }

            let mut file = TrrFile::open(&path, OpenMode::Read).unwrap();
            let mut snap = Snapshot::default();
            assert!(!file.read(&mut snap));
            assert!(!file.skip_frame());
            assert!(!file.at_end());
        }
    }

    #[test]
    fn test_unused_blocks_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vir.trr");

        let header = TrrHeader {
            bounding_box_data_size: 3,
            vir_size: 8,
            number_of_atoms: 1,
            ..Default::default()
        };
        {
            let mut file = TrrFile::open(&path, OpenMode::Write).unwrap();
            assert!(file.write_next_header(&header));
        }

        let mut bytes = fs::read(&path).unwrap();
        for v in [2f32, 3., 4.] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        bytes.extend_from_slice(&[0xab; 8]);
        for v in [0.25f32, 0.5, 0.75] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        fs::write(&path, bytes).unwrap();

        let mut file = TrrFile::open(&path, OpenMode::Read).unwrap();
        let mut snap = Snapshot::default();
        assert!(file.read(&mut snap));

        assert_vecs_close(&snap.positions, &[Vec3::new(0.25, 0.5, 0.75)], 0.);
        assert_eq!(file.bounding_box_y().y, 3.);
        assert!(file.at_end());
    }

    #[test]
    fn test_truncated_frame_is_not_a_clean_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torn.trr");
        let frames: Vec<_> = (0..2).map(|i| snapshot(5, i as f64, false, false)).collect();
        write_file(&path, 4, false, false, &frames);

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 6]).unwrap();

        let mut file = TrrFile::open(&path, OpenMode::Read).unwrap();
        let mut sink = Vec::new();
        assert_eq!(file.read_into(&mut sink), 1);
        assert!(!file.at_end());

        assert!(TrrFile::load(&path).is_err());
        assert!(TrrFile::open(&path, OpenMode::Append).is_err());
    }

    #[test]
    fn test_save_and_bulk_import() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.trr");
        let frames: Vec<_> = (0..4).map(|i| snapshot(3, i as f64, true, false)).collect();

        TrrFile::save(&path, Precision::Double, &frames).unwrap();

        let mut file = TrrFile::open(&path, OpenMode::Read).unwrap();
        assert!(file.read_header());

        let mut sink: Vec<Snapshot> = Vec::new();
        assert_eq!(file.read_into(&mut sink), 4);
        assert_eq!(sink[3].step, 3);
        assert_vecs_close(&sink[3].velocities, &frames[3].velocities, 0.);
    }

    #[test]
    fn test_flush_requires_write_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.trr");
        write_file(&path, 4, false, false, &[snapshot(1, 0., false, false)]);

        let mut file = TrrFile::open(&path, OpenMode::Read).unwrap();
        let err = file
            .flush_to_disk(&[snapshot(1, 0., false, false)])
            .unwrap_err();
        assert!(matches!(err, TrrError::CannotWrite { frame: 0, .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_flush_to_full_disk_fails() {
        let mut file = TrrFile::open(Path::new("/dev/full"), OpenMode::Write).unwrap();
        let frames = vec![snapshot(4, 0., false, false); 3];

        let err = file.flush_to_disk(&frames).unwrap_err();
        assert!(matches!(err, TrrError::CannotWrite { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_close_reports_buffered_write_failure() {
        let mut file = TrrFile::open(Path::new("/dev/full"), OpenMode::Write).unwrap();

        // Small frames only reach the buffer, so appending succeeds.
        for _ in 0..3 {
            assert!(file.append(&snapshot(4, 0., false, false)));
        }

        assert!(file.close().is_err());
        // The stream is gone after closing, failed or not.
        assert!(!file.append(&snapshot(4, 0., false, false)));
        assert!(file.close().is_ok());
    }

    #[test]
    fn test_close_persists_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closed.trr");

        let mut file = TrrFile::open(&path, OpenMode::Write).unwrap();
        assert!(file.append(&snapshot(3, 1., false, false)));
        file.close().unwrap();

        // Settings outlive the stream.
        assert_eq!(file.num_atoms(), Some(3));
        assert_eq!(TrrFile::load(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_equality_compares_configuration() {
        let mut a = TrrFile::new();
        let b = TrrFile::new();
        assert!(a == b);

        a.set_force_storage(true);
        assert!(a != b);

        a.clear();
        assert!(a == b);
        assert_eq!(a.timestep(), DEFAULT_TIMESTEP);
    }
}
