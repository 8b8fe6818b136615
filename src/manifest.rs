use crate::error::ConvertError;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Color,
    Depth,
}

impl StreamKind {
    pub fn label(self) -> &'static str {
        match self {
            StreamKind::Color => "color",
            StreamKind::Depth => "depth",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub path: PathBuf,
    pub frame_index: u64,
    pub timestamp: u64,
    pub kind: StreamKind,
}

/// Parses `<frameIndex>-<timestamp>.<ext>` from the file name of `path`.
pub fn parse_descriptor(path: &Path, kind: StreamKind) -> Result<ImageDescriptor, ConvertError> {
    let fail = |reason: &str| ConvertError::FilenameParse {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| fail("file name is not valid UTF-8"))?;

    let stem = match file_name.rfind('.') {
        Some(dot) => &file_name[..dot],
        None => file_name,
    };

    let (index_str, ts_str) = stem
        .split_once('-')
        .ok_or_else(|| fail("missing '-' between index and timestamp"))?;

    let frame_index = index_str
        .parse::<u64>()
        .map_err(|e| fail(&format!("frame index {:?}: {}", index_str, e)))?;
    let timestamp = ts_str
        .parse::<u64>()
        .map_err(|e| fail(&format!("timestamp {:?}: {}", ts_str, e)))?;

    Ok(ImageDescriptor {
        path: path.to_path_buf(),
        frame_index,
        timestamp,
        kind,
    })
}

/// Lists the regular files directly under `dir` in file-name order and parses
/// each one. Any file that breaks the naming convention aborts the scan.
pub fn scan_stream_dir(dir: &Path, kind: StreamKind) -> Result<Vec<ImageDescriptor>> {
    if !dir.is_dir() {
        return Err(ConvertError::MissingStreamDir {
            path: dir.to_path_buf(),
        }
        .into());
    }

    let mut images = vec![];
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let e = entry.with_context(|| format!("enumerate {} dir {:?}", kind.label(), dir))?;
        if !e.file_type().is_file() {
            continue;
        }
        images.push(parse_descriptor(e.path(), kind)?);
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn parses_zero_padded_name() {
        let d = parse_descriptor(Path::new("/data/image/000123-48271.jpg"), StreamKind::Color)
            .expect("valid name");
        assert_eq!(d.frame_index, 123);
        assert_eq!(d.timestamp, 48271);
        assert_eq!(d.kind, StreamKind::Color);
    }

    #[test]
    fn extra_dash_or_dot_in_stem_is_rejected() {
        let err = parse_descriptor(Path::new("0001-22-33.png"), StreamKind::Depth)
            .expect_err("second dash is not numeric");
        assert!(matches!(err, ConvertError::FilenameParse { .. }));

        let d = parse_descriptor(Path::new("0007-99.depth.png"), StreamKind::Depth);
        assert!(d.is_err(), "stem after last dot is '0007-99.depth'");
    }

    #[test]
    fn rejects_malformed_names() {
        for name in ["abc.jpg", "123.jpg", "-5.jpg", "12-.jpg", "x-12.jpg"] {
            let err = parse_descriptor(Path::new(name), StreamKind::Color)
                .expect_err(name);
            assert!(
                matches!(err, ConvertError::FilenameParse { .. }),
                "{name}: {err}"
            );
        }
    }

    #[test]
    fn name_without_extension_is_accepted() {
        let d = parse_descriptor(Path::new("5-600"), StreamKind::Depth).expect("no extension");
        assert_eq!((d.frame_index, d.timestamp), (5, 600));
    }

    #[test]
    fn scan_orders_by_file_name_and_skips_dirs() {
        let tmp = TempDir::new().expect("tempdir");
        let dir = tmp.path().join("image");
        fs::create_dir_all(dir.join("nested")).expect("mkdir");
        fs::write(dir.join("0000002-300.jpg"), b"c").expect("write");
        fs::write(dir.join("0000000-100.jpg"), b"a").expect("write");
        fs::write(dir.join("0000001-200.jpg"), b"b").expect("write");

        let images = scan_stream_dir(&dir, StreamKind::Color).expect("scan");
        let stamps = images.iter().map(|d| d.timestamp).collect::<Vec<_>>();
        assert_eq!(stamps, vec![100, 200, 300]);
        assert!(images.iter().all(|d| d.kind == StreamKind::Color));
    }

    #[test]
    fn scan_fails_on_stray_file() {
        let tmp = TempDir::new().expect("tempdir");
        let dir = tmp.path().join("depth");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("0000000-100.png"), b"a").expect("write");
        fs::write(dir.join("notes.txt"), b"b").expect("write");

        let err = scan_stream_dir(&dir, StreamKind::Depth).expect_err("stray file");
        assert!(err.to_string().contains("notes.txt"), "{err}");
    }

    #[test]
    fn scan_reports_missing_dir() {
        let tmp = TempDir::new().expect("tempdir");
        let err = scan_stream_dir(&tmp.path().join("nope"), StreamKind::Depth)
            .expect_err("missing dir");
        assert!(matches!(
            err.downcast_ref::<ConvertError>(),
            Some(ConvertError::MissingStreamDir { .. })
        ));
    }
}
