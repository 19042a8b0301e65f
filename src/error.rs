use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors that aren't reported per frame: bad configuration, and durability failures.
#[derive(Debug, Error)]
pub enum TrrError {
    /// Precision must be 4 or 8 bytes per scalar.
    #[error("invalid precision: {0} bytes per scalar; must be 4 or 8")]
    InvalidPrecision(u32),
    /// Writing a buffer to disk failed part way; the file's frame sequence can no longer be
    /// trusted. Writes are buffered, so `frame` is the buffered frame whose write failed, or the
    /// buffer length if the final flush failed. Earlier frames may be lost too: don't truncate the
    /// file at that index without reading it back.
    #[error("cannot write {} at buffered frame {frame}", path.display())]
    CannotWrite {
        path: PathBuf,
        frame: usize,
        #[source]
        source: io::Error,
    },
}
