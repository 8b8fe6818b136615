use std::path::{Path, PathBuf};

/// Where a capture keeps its streams and calibration.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    pub color_dir: PathBuf,
    pub depth_dir: PathBuf,
    pub intrinsics: PathBuf,
}

impl DatasetLayout {
    pub fn under(root: &Path) -> Self {
        Self {
            color_dir: root.join("image"),
            depth_dir: root.join("depth"),
            intrinsics: root.join("intrinsics.txt"),
        }
    }
}

pub fn file_label(p: &Path) -> String {
    p.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| p.display().to_string())
}

/// Raw to compressed size ratio; 0 when nothing was compressed.
pub fn compression_ratio(raw: u64, compressed: u64) -> f64 {
    if compressed == 0 {
        0.0
    } else {
        raw as f64 / compressed as f64
    }
}
