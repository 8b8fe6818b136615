use std::path::PathBuf;
use thiserror::Error;

/// Fatal conditions of a conversion or container read.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("file name {path:?} does not match <index>-<timestamp>.<ext>: {reason}")]
    FilenameParse { path: PathBuf, reason: String },

    #[error("could not open intrinsics file {path:?}")]
    MissingCalibrationFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("intrinsics file {path:?} holds {found} numeric values, expected 9")]
    MalformedCalibration { path: PathBuf, found: usize },

    #[error("depth stream is empty but color stream has {color_frames} frames")]
    NoDepthFrames { color_frames: usize },

    #[error("start frame {start} is past end frame {end}")]
    InvalidFrameRange { start: u64, end: u64 },

    #[error("frame range {start}..{end} exceeds the {available} aligned frames in the capture")]
    FrameRangeExceeded { start: u64, end: u64, available: u64 },

    #[error("only {got} of {expected} bytes could be read from {path:?}")]
    PartialRead { path: PathBuf, expected: u64, got: u64 },

    #[error("depth image {path:?} is {width}x{height}, header declares {expected_width}x{expected_height}")]
    DepthSizeMismatch {
        path: PathBuf,
        width: u32,
        height: u32,
        expected_width: u32,
        expected_height: u32,
    },

    #[error("stream directory {path:?} is missing")]
    MissingStreamDir { path: PathBuf },

    #[error("corrupt container: {reason}")]
    CorruptContainer { reason: String },
}

impl ConvertError {
    pub fn corrupt(reason: impl Into<String>) -> Self {
        ConvertError::CorruptContainer {
            reason: reason.into(),
        }
    }
}
