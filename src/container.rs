use crate::calibration::{CalibrationData, Mat4};
use crate::error::ConvertError;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::io::{ErrorKind, Read, Write};

pub const SENS_VERSION: u32 = 4;
pub const DEFAULT_SENSOR_NAME: &str = "Unknown";
pub const DEFAULT_DEPTH_SHIFT: f32 = 1000.0;
pub const TRAILER: u8 = 0;

/// Pose written for every frame; the capture has no tracking.
pub const UNKNOWN_POSE: Mat4 = [[f32::NEG_INFINITY; 4]; 4];

const MAX_SENSOR_NAME_LEN: u64 = 4096;
const MAX_PAYLOAD_LEN: u64 = 1 << 30;

// Header layout (little-endian, packed):
//   version u32
//   name_len u64, name [name_len]
//   color intrinsics, color extrinsics, depth intrinsics, depth extrinsics: f32[16] each
//   color compression i32, depth compression i32
//   color w/h u32, depth w/h u32
//   depth shift f32
//   frame count u64
const HEADER_FIXED_LEN: usize = 4 + 8 + 4 * 64 + 4 + 4 + 16 + 4 + 8;

// Frame prefix: pose f32[16], color ts u64, depth ts u64, color len u64, depth len u64
const FRAME_PREFIX_LEN: usize = 64 + 8 * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorCompression {
    Unknown,
    Raw,
    Png,
    Jpeg,
}

impl ColorCompression {
    pub fn code(self) -> i32 {
        match self {
            ColorCompression::Unknown => -1,
            ColorCompression::Raw => 0,
            ColorCompression::Png => 1,
            ColorCompression::Jpeg => 2,
        }
    }
}

impl TryFrom<i32> for ColorCompression {
    type Error = ConvertError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Ok(match code {
            -1 => ColorCompression::Unknown,
            0 => ColorCompression::Raw,
            1 => ColorCompression::Png,
            2 => ColorCompression::Jpeg,
            other => {
                return Err(ConvertError::corrupt(format!(
                    "unknown color compression code {}",
                    other
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthCompression {
    Unknown,
    RawU16,
    ZlibU16,
    OcciU16,
}

impl DepthCompression {
    pub fn code(self) -> i32 {
        match self {
            DepthCompression::Unknown => -1,
            DepthCompression::RawU16 => 0,
            DepthCompression::ZlibU16 => 1,
            DepthCompression::OcciU16 => 2,
        }
    }
}

impl TryFrom<i32> for DepthCompression {
    type Error = ConvertError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Ok(match code {
            -1 => DepthCompression::Unknown,
            0 => DepthCompression::RawU16,
            1 => DepthCompression::ZlibU16,
            2 => DepthCompression::OcciU16,
            other => {
                return Err(ConvertError::corrupt(format!(
                    "unknown depth compression code {}",
                    other
                )))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensHeader {
    pub version: u32,
    pub sensor_name: String,
    pub color_intrinsics: Mat4,
    pub color_extrinsics: Mat4,
    pub depth_intrinsics: Mat4,
    pub depth_extrinsics: Mat4,
    pub color_compression: ColorCompression,
    pub depth_compression: DepthCompression,
    pub color_width: u32,
    pub color_height: u32,
    pub depth_width: u32,
    pub depth_height: u32,
    pub depth_shift: f32,
    pub frame_count: u64,
}

impl SensHeader {
    /// Header for a JPEG color / zlib depth capture sharing one calibration.
    pub fn for_capture(
        sensor_name: &str,
        calibration: &CalibrationData,
        color_dims: (u32, u32),
        depth_dims: (u32, u32),
        depth_shift: f32,
        frame_count: u64,
    ) -> Self {
        Self {
            version: SENS_VERSION,
            sensor_name: sensor_name.to_string(),
            color_intrinsics: calibration.intrinsics,
            color_extrinsics: calibration.extrinsics,
            depth_intrinsics: calibration.intrinsics,
            depth_extrinsics: calibration.extrinsics,
            color_compression: ColorCompression::Jpeg,
            depth_compression: DepthCompression::ZlibU16,
            color_width: color_dims.0,
            color_height: color_dims.1,
            depth_width: depth_dims.0,
            depth_height: depth_dims.1,
            depth_shift,
            frame_count,
        }
    }

    pub fn depth_samples(&self) -> usize {
        self.depth_width as usize * self.depth_height as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub camera_to_world: Mat4,
    pub color_timestamp: u64,
    pub depth_timestamp: u64,
    pub color_payload: Vec<u8>,
    pub depth_payload: Vec<u8>,
}

impl FrameRecord {
    pub fn encoded_len(&self) -> u64 {
        (FRAME_PREFIX_LEN + self.color_payload.len() + self.depth_payload.len()) as u64
    }
}

fn push_mat4(out: &mut Vec<u8>, m: &Mat4) {
    for row in m {
        for v in row {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
}

pub fn build_header_bytes(hdr: &SensHeader) -> Vec<u8> {
    let name = hdr.sensor_name.as_bytes();
    let mut out = Vec::with_capacity(HEADER_FIXED_LEN + name.len());
    out.extend_from_slice(&hdr.version.to_le_bytes());
    out.extend_from_slice(&(name.len() as u64).to_le_bytes());
    out.extend_from_slice(name);
    push_mat4(&mut out, &hdr.color_intrinsics);
    push_mat4(&mut out, &hdr.color_extrinsics);
    push_mat4(&mut out, &hdr.depth_intrinsics);
    push_mat4(&mut out, &hdr.depth_extrinsics);
    out.extend_from_slice(&hdr.color_compression.code().to_le_bytes());
    out.extend_from_slice(&hdr.depth_compression.code().to_le_bytes());
    out.extend_from_slice(&hdr.color_width.to_le_bytes());
    out.extend_from_slice(&hdr.color_height.to_le_bytes());
    out.extend_from_slice(&hdr.depth_width.to_le_bytes());
    out.extend_from_slice(&hdr.depth_height.to_le_bytes());
    out.extend_from_slice(&hdr.depth_shift.to_le_bytes());
    out.extend_from_slice(&hdr.frame_count.to_le_bytes());
    out
}

/// Fixed part of a frame record; the two payloads follow it verbatim.
pub fn build_frame_prefix(frame: &FrameRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_PREFIX_LEN);
    push_mat4(&mut out, &frame.camera_to_world);
    out.extend_from_slice(&frame.color_timestamp.to_le_bytes());
    out.extend_from_slice(&frame.depth_timestamp.to_le_bytes());
    out.extend_from_slice(&(frame.color_payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&(frame.depth_payload.len() as u64).to_le_bytes());
    out
}

/// Streams a container: one header, exactly `frame_count` frames, trailer.
pub struct SensWriter<W: Write> {
    inner: W,
    declared_frames: Option<u64>,
    written_frames: u64,
    bytes_written: u64,
}

impl<W: Write> SensWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            declared_frames: None,
            written_frames: 0,
            bytes_written: 0,
        }
    }

    pub fn write_header(&mut self, hdr: &SensHeader) -> Result<()> {
        if self.declared_frames.is_some() {
            bail!("container header already written");
        }
        let bytes = build_header_bytes(hdr);
        self.inner.write_all(&bytes).context("write container header")?;
        self.bytes_written += bytes.len() as u64;
        self.declared_frames = Some(hdr.frame_count);
        Ok(())
    }

    pub fn write_frame(&mut self, frame: &FrameRecord) -> Result<()> {
        let declared = self
            .declared_frames
            .context("frame written before container header")?;
        if self.written_frames >= declared {
            bail!(
                "header declares {} frames, refusing frame {}",
                declared,
                self.written_frames
            );
        }

        self.inner
            .write_all(&build_frame_prefix(frame))
            .and_then(|_| self.inner.write_all(&frame.color_payload))
            .and_then(|_| self.inner.write_all(&frame.depth_payload))
            .with_context(|| format!("write frame record {}", self.written_frames))?;

        self.written_frames += 1;
        self.bytes_written += frame.encoded_len();
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.written_frames
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Writes the trailer byte, flushes and hands back the sink.
    pub fn finish(mut self) -> Result<W> {
        let declared = self
            .declared_frames
            .context("container finished without a header")?;
        if self.written_frames != declared {
            bail!(
                "header declares {} frames but {} were written",
                declared,
                self.written_frames
            );
        }
        self.inner.write_all(&[TRAILER])?;
        self.inner.flush().context("flush container")?;
        Ok(self.inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    NeedHeader,
    Frames { remaining: u64 },
    Done,
}

/// Pull parser for containers produced by [`SensWriter`].
pub struct SensReader<R: Read> {
    inner: R,
    state: ReadState,
    frames_read: u64,
}

impl<R: Read> SensReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: ReadState::NeedHeader,
            frames_read: 0,
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    fn read_bytes<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        read_exact_or_corrupt(&mut self.inner, &mut buf, what)?;
        Ok(buf)
    }

    fn read_u32(&mut self, what: &str) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_bytes(what)?))
    }

    fn read_i32(&mut self, what: &str) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_bytes(what)?))
    }

    fn read_u64(&mut self, what: &str) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_bytes(what)?))
    }

    fn read_f32(&mut self, what: &str) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_bytes(what)?))
    }

    fn read_mat4(&mut self, what: &str) -> Result<Mat4> {
        let mut m = [[0.0f32; 4]; 4];
        for row in m.iter_mut() {
            for v in row.iter_mut() {
                *v = self.read_f32(what)?;
            }
        }
        Ok(m)
    }

    fn read_blob(&mut self, len: u64, cap: u64, what: &str) -> Result<Vec<u8>> {
        if len > cap {
            return Err(
                ConvertError::corrupt(format!("{} length {} exceeds {}", what, len, cap)).into(),
            );
        }
        let mut buf = vec![0u8; len as usize];
        read_exact_or_corrupt(&mut self.inner, &mut buf, what)?;
        Ok(buf)
    }

    pub fn read_header(&mut self) -> Result<SensHeader> {
        if self.state != ReadState::NeedHeader {
            bail!("container header already read");
        }

        let version = self.read_u32("version")?;
        if version != SENS_VERSION {
            return Err(ConvertError::corrupt(format!(
                "unsupported version {} (expected {})",
                version, SENS_VERSION
            ))
            .into());
        }
        let name_len = self.read_u64("sensor name length")?;
        let name = self.read_blob(name_len, MAX_SENSOR_NAME_LEN, "sensor name")?;
        let sensor_name = String::from_utf8(name)
            .map_err(|_| ConvertError::corrupt("sensor name is not UTF-8"))?;

        let hdr = SensHeader {
            version,
            sensor_name,
            color_intrinsics: self.read_mat4("color intrinsics")?,
            color_extrinsics: self.read_mat4("color extrinsics")?,
            depth_intrinsics: self.read_mat4("depth intrinsics")?,
            depth_extrinsics: self.read_mat4("depth extrinsics")?,
            color_compression: ColorCompression::try_from(self.read_i32("color compression")?)?,
            depth_compression: DepthCompression::try_from(self.read_i32("depth compression")?)?,
            color_width: self.read_u32("color width")?,
            color_height: self.read_u32("color height")?,
            depth_width: self.read_u32("depth width")?,
            depth_height: self.read_u32("depth height")?,
            depth_shift: self.read_f32("depth shift")?,
            frame_count: self.read_u64("frame count")?,
        };
        self.state = ReadState::Frames {
            remaining: hdr.frame_count,
        };
        Ok(hdr)
    }

    /// Next frame, or `None` once all declared frames and the trailer are read.
    pub fn next_frame(&mut self) -> Result<Option<FrameRecord>> {
        let remaining = match self.state {
            ReadState::NeedHeader => bail!("frame requested before container header"),
            ReadState::Done => return Ok(None),
            ReadState::Frames { remaining: 0 } => {
                let [b] = self.read_bytes::<1>("trailer")?;
                if b != TRAILER {
                    return Err(
                        ConvertError::corrupt(format!("trailer byte is {:#04x}", b)).into(),
                    );
                }
                self.state = ReadState::Done;
                return Ok(None);
            }
            ReadState::Frames { remaining } => remaining,
        };

        let what = format!("frame {}", self.frames_read);
        let camera_to_world = self.read_mat4(&what)?;
        let color_timestamp = self.read_u64(&what)?;
        let depth_timestamp = self.read_u64(&what)?;
        let color_len = self.read_u64(&what)?;
        let depth_len = self.read_u64(&what)?;
        let color_payload =
            self.read_blob(color_len, MAX_PAYLOAD_LEN, &format!("{} color payload", what))?;
        let depth_payload =
            self.read_blob(depth_len, MAX_PAYLOAD_LEN, &format!("{} depth payload", what))?;

        self.state = ReadState::Frames {
            remaining: remaining - 1,
        };
        self.frames_read += 1;
        Ok(Some(FrameRecord {
            camera_to_world,
            color_timestamp,
            depth_timestamp,
            color_payload,
            depth_payload,
        }))
    }
}

fn read_exact_or_corrupt(r: &mut impl Read, buf: &mut [u8], what: &str) -> Result<()> {
    match r.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            Err(ConvertError::corrupt(format!("truncated while reading {}", what)).into())
        }
        Err(e) => Err(e).with_context(|| format!("read {}", what)),
    }
}
