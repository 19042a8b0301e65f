//! Save and load GROMACS TRR molecular dynamics trajectories.
//!
//! See the `trr` module for the format, and `TrrFile` to open one.

pub mod binary;
mod error;
pub mod trajectory;
pub mod trr;

pub use binary::Precision;
pub use error::TrrError;
pub use trajectory::{OpenMode, Snapshot, SnapshotSink, TrajectoryFile};
pub use trr::{TrrConfig, TrrFile, TrrHeader};

/// Multiply a length in nm by this to convert to Å.
pub const TO_ANGSTROM: f64 = 10.;
/// Multiply a length in Å by this to convert to nm.
pub const TO_NANOMETER: f64 = 0.1;
