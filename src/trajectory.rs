//! Types shared by trajectory formats: the frame data passed in and out of a codec, and the
//! capability set a trajectory file provides.

use lin_alg::f64::Vec3;

/// How a trajectory file is opened.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum OpenMode {
    #[default]
    Read,
    /// Create or truncate.
    Write,
    /// Keep existing frames, and add new ones after them.
    Append,
}

/// The decoded atomic data of one frame. This is an intermediate format; it will likely be
/// converted to something application-specific.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    /// Timestep index. Filled on read; ignored on write, where the file assigns it.
    pub step: u32,
    /// ps. Filled on read; ignored on write.
    pub time: f32,
    /// nm
    pub positions: Vec<Vec3>,
    /// nm/ps. Empty if absent.
    pub velocities: Vec<Vec3>,
    /// kJ/(mol·nm). Empty if absent.
    pub forces: Vec<Vec3>,
}

impl Snapshot {
    pub fn new(positions: Vec<Vec3>) -> Self {
        Self {
            positions,
            ..Default::default()
        }
    }

    pub fn num_atoms(&self) -> usize {
        self.positions.len()
    }
}

/// Receives frames during a bulk import.
pub trait SnapshotSink {
    fn add_snapshot(&mut self, snapshot: Snapshot);
}

impl SnapshotSink for Vec<Snapshot> {
    fn add_snapshot(&mut self, snapshot: Snapshot) {
        self.push(snapshot);
    }
}

/// Operations every trajectory format provides. Per-frame operations report success as a
/// `bool`; formats log the cause of a failure.
pub trait TrajectoryFile {
    /// The per-frame header record of this format.
    type Header;

    /// Read the file-level header, for formats that have one.
    fn read_header(&mut self) -> bool;

    fn write_next_header(&mut self, header: &Self::Header) -> bool;

    /// On failure, `header` is left untouched.
    fn read_next_header(&mut self, header: &mut Self::Header) -> bool;

    fn append(&mut self, snapshot: &Snapshot) -> bool;

    /// On failure, `snapshot` is left untouched.
    fn read(&mut self, snapshot: &mut Snapshot) -> bool;

    fn skip_frame(&mut self) -> bool;

    fn number_of_snapshots(&mut self) -> usize;
}
