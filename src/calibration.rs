use crate::error::ConvertError;

use std::path::Path;

pub type Mat4 = [[f32; 4]; 4];

pub const IDENTITY: Mat4 = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Camera calibration shared by the color and depth streams.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationData {
    /// 3x3 pinhole matrix embedded in a 4x4, `[3][3] = 1`.
    pub intrinsics: Mat4,
    /// Always identity, the capture carries no extrinsics.
    pub extrinsics: Mat4,
}

impl CalibrationData {
    pub fn from_intrinsics_3x3(k: [[f32; 3]; 3]) -> Self {
        let mut intrinsics = [[0.0f32; 4]; 4];
        for (row, src) in intrinsics.iter_mut().zip(k.iter()) {
            row[..3].copy_from_slice(src);
        }
        intrinsics[3][3] = 1.0;
        Self {
            intrinsics,
            extrinsics: IDENTITY,
        }
    }
}

pub fn load_intrinsics(path: &Path) -> Result<CalibrationData, ConvertError> {
    let bytes = std::fs::read(path).map_err(|source| ConvertError::MissingCalibrationFile {
        path: path.to_path_buf(),
        source,
    })?;
    // Non-UTF-8 bytes become U+FFFD and stop the numeric scan there.
    parse_intrinsics(&String::from_utf8_lossy(&bytes), path)
}

/// Reads nine whitespace separated floats, row-major. Anything after the
/// ninth value is ignored.
pub fn parse_intrinsics(text: &str, path: &Path) -> Result<CalibrationData, ConvertError> {
    let mut values = [0.0f32; 9];
    let mut found = 0usize;
    for token in text.split_whitespace().take(9) {
        match token.parse::<f32>() {
            Ok(v) => {
                values[found] = v;
                found += 1;
            }
            Err(_) => break,
        }
    }
    if found < 9 {
        return Err(ConvertError::MalformedCalibration {
            path: path.to_path_buf(),
            found,
        });
    }

    let mut k = [[0.0f32; 3]; 3];
    for (i, v) in values.iter().enumerate() {
        k[i / 3][i % 3] = *v;
    }
    Ok(CalibrationData::from_intrinsics_3x3(k))
}
