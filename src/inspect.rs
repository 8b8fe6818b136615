use crate::container::{ColorCompression, SensHeader, SensReader};
use crate::depth;
use crate::error::ConvertError;
use crate::progress::{InspectSummary, ProgressConfig, ProgressReporter};

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// Header plus frame totals, as printed by `inspect --json`.
#[derive(Debug, Serialize)]
pub struct InspectReport<'a> {
    pub path: String,
    pub header: &'a SensHeader,
    pub frames_read: u64,
    pub color_bytes: u64,
    pub depth_bytes: u64,
    pub first_timestamp: Option<u64>,
    pub last_timestamp: Option<u64>,
    pub verified: bool,
}

impl<'a> InspectReport<'a> {
    pub fn from_summary(summary: &'a InspectSummary) -> Self {
        Self {
            path: summary.input_path.display().to_string(),
            header: &summary.header,
            frames_read: summary.frames_read,
            color_bytes: summary.color_bytes,
            depth_bytes: summary.depth_bytes,
            first_timestamp: summary.first_timestamp,
            last_timestamp: summary.last_timestamp,
            verified: summary.verified,
        }
    }
}

/// Walks every frame of a container. With `verify`, depth payloads are
/// inflated and color payloads of JPEG containers are checked for the SOI
/// marker.
pub fn inspect_container(
    path: &Path,
    verify: bool,
    progress_cfg: ProgressConfig,
) -> Result<InspectSummary> {
    let file = File::open(path).with_context(|| format!("open container {}", path.display()))?;
    let file_len = file.metadata().map(|m| m.len()).unwrap_or(0);

    let reporter = ProgressReporter::new("inspect", file_len, progress_cfg);
    let progress = reporter.handle();

    progress.set_stage("read header");
    let mut reader = SensReader::new(BufReader::new(file));
    let header = reader
        .read_header()
        .with_context(|| format!("read header of {}", path.display()))?;
    progress.set_totals(file_len, header.frame_count);
    progress.log(format!(
        "Header: version={} sensor={} color={}x{} depth={}x{} frames={}",
        header.version,
        header.sensor_name,
        header.color_width,
        header.color_height,
        header.depth_width,
        header.depth_height,
        header.frame_count
    ));

    progress.set_stage(if verify { "verify frames" } else { "scan frames" });
    let samples = header.depth_samples();
    let mut color_bytes = 0u64;
    let mut depth_bytes = 0u64;
    let mut first_timestamp = None;
    let mut last_timestamp = None;
    while let Some(frame) = reader.next_frame()? {
        let frame_no = reader.frames_read() - 1;
        if verify {
            depth::decode_depth(&frame.depth_payload, Some(samples))
                .with_context(|| format!("frame {}", frame_no))?;
            if header.color_compression == ColorCompression::Jpeg
                && !frame.color_payload.starts_with(&JPEG_SOI)
            {
                return Err(ConvertError::corrupt(format!(
                    "frame {} color payload is not a JPEG stream",
                    frame_no
                ))
                .into());
            }
        }

        first_timestamp.get_or_insert(frame.color_timestamp);
        last_timestamp = Some(frame.color_timestamp);
        color_bytes += frame.color_payload.len() as u64;
        depth_bytes += frame.depth_payload.len() as u64;
        progress.frame_done(frame.encoded_len());
    }

    let outcome = reporter.finish(format!("read {} frames", reader.frames_read()));
    Ok(InspectSummary {
        input_path: path.to_path_buf(),
        frames_read: reader.frames_read(),
        header,
        color_bytes,
        depth_bytes,
        first_timestamp,
        last_timestamp,
        verified: verify,
        elapsed: outcome.elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationData;
    use crate::container::{FrameRecord, SensWriter, UNKNOWN_POSE};
    use crate::progress::ProgressMode;
    use tempfile::TempDir;

    fn write_container(path: &Path, color: Vec<u8>) {
        let calib = CalibrationData::from_intrinsics_3x3([[1.0, 0.0, 0.5], [0.0, 1.0, 0.5], [0.0, 0.0, 1.0]]);
        let header = SensHeader::for_capture("Unknown", &calib, (2, 2), (2, 1), 1000.0, 2);
        let mut w = SensWriter::new(File::create(path).unwrap());
        w.write_header(&header).unwrap();
        for ts in [5u64, 9] {
            w.write_frame(&FrameRecord {
                camera_to_world: UNKNOWN_POSE,
                color_timestamp: ts,
                depth_timestamp: ts + 1,
                color_payload: color.clone(),
                depth_payload: depth::encode_depth(&[1, 2]).unwrap(),
            })
            .unwrap();
        }
        w.finish().unwrap();
    }

    #[test]
    fn summarizes_and_verifies() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.sens");
        write_container(&path, vec![0xFF, 0xD8, 0xFF, 0xD9]);

        let s = inspect_container(&path, true, ProgressConfig::new(ProgressMode::Quiet)).unwrap();
        assert_eq!(s.frames_read, 2);
        assert_eq!(s.color_bytes, 8);
        assert_eq!(s.first_timestamp, Some(5));
        assert_eq!(s.last_timestamp, Some(9));
        assert!(s.verified);

        let json = serde_json::to_value(InspectReport::from_summary(&s)).unwrap();
        assert_eq!(json["header"]["frame_count"], 2);
        assert_eq!(json["header"]["color_compression"], "jpeg");
    }

    #[test]
    fn verify_rejects_non_jpeg_color() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("b.sens");
        write_container(&path, b"GIF89a".to_vec());

        let cfg = ProgressConfig::new(ProgressMode::Quiet);
        assert!(inspect_container(&path, false, cfg).is_ok());
        let err = inspect_container(&path, true, cfg).expect_err("not jpeg");
        assert!(matches!(
            err.downcast_ref::<ConvertError>(),
            Some(ConvertError::CorruptContainer { .. })
        ));
    }
}
