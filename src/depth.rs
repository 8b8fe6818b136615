use crate::error::ConvertError;

use anyhow::{Context, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::path::Path;

/// Bits each depth sample is rotated by before compression.
pub const DEPTH_ROTATION: u32 = 3;
/// zlib level used for depth payloads.
pub const DEPTH_ZLIB_LEVEL: u32 = 8;

#[derive(Debug, Clone)]
pub struct DepthImage {
    pub width: u32,
    pub height: u32,
    pub samples: Vec<u16>,
}

/// Loads a single channel depth image as 16-bit samples. 8-bit sources are
/// widened by 257 so full scale maps to full scale.
pub fn load_depth_image(path: &Path) -> Result<DepthImage> {
    let img = image::open(path)
        .with_context(|| format!("decode depth image {}", path.display()))?
        .into_luma16();
    let (width, height) = img.dimensions();
    Ok(DepthImage {
        width,
        height,
        samples: img.into_raw(),
    })
}

#[inline]
pub fn rotate_sample(v: u16) -> u16 {
    v.rotate_right(DEPTH_ROTATION)
}

#[inline]
pub fn restore_sample(v: u16) -> u16 {
    v.rotate_left(DEPTH_ROTATION)
}

/// Rotates every sample and zlib-compresses the little-endian byte stream.
pub fn encode_depth(samples: &[u16]) -> std::io::Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(samples.len() * 2);
    for &v in samples {
        raw.extend_from_slice(&rotate_sample(v).to_le_bytes());
    }

    let mut enc = ZlibEncoder::new(
        Vec::with_capacity(raw.len() / 2),
        Compression::new(DEPTH_ZLIB_LEVEL),
    );
    enc.write_all(&raw)?;
    enc.finish()
}

/// Inverse of [`encode_depth`]. When `expected_samples` is given the inflated
/// payload must hold exactly that many samples.
pub fn decode_depth(payload: &[u8], expected_samples: Option<usize>) -> Result<Vec<u16>, ConvertError> {
    let mut raw = Vec::with_capacity(expected_samples.map(|n| n * 2).unwrap_or(payload.len() * 4));
    ZlibDecoder::new(payload)
        .read_to_end(&mut raw)
        .map_err(|e| ConvertError::corrupt(format!("depth payload inflate failed: {}", e)))?;

    if raw.len() % 2 != 0 {
        return Err(ConvertError::corrupt(format!(
            "depth payload inflated to odd length {}",
            raw.len()
        )));
    }
    if let Some(n) = expected_samples {
        if raw.len() != n * 2 {
            return Err(ConvertError::corrupt(format!(
                "depth payload holds {} samples, expected {}",
                raw.len() / 2,
                n
            )));
        }
    }

    Ok(raw
        .chunks_exact(2)
        .map(|b| restore_sample(u16::from_le_bytes([b[0], b[1]])))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};
    use tempfile::TempDir;

    #[test]
    fn rotation_is_reversible_for_every_value() {
        for v in 0..=u16::MAX {
            assert_eq!(restore_sample(rotate_sample(v)), v);
        }
    }

    #[test]
    fn rotation_wraps_low_bits_into_high_bits() {
        assert_eq!(rotate_sample(0b0000_0000_0000_1000), 0b0000_0000_0000_0001);
        assert_eq!(rotate_sample(0b0000_0000_0000_0111), 0b1110_0000_0000_0000);
        assert_eq!(rotate_sample(1000), (1000 >> 3) | ((1000u16 << 13) & 0xFFFF));
    }

    #[test]
    fn encode_decode_restores_samples() {
        let samples = (0..640u32 * 4)
            .map(|i| (500 + (i % 640) * 3) as u16)
            .collect::<Vec<_>>();
        let payload = encode_depth(&samples).expect("encode");
        assert!(payload.len() < samples.len() * 2, "smooth ramp should compress");
        let back = decode_depth(&payload, Some(samples.len())).expect("decode");
        assert_eq!(back, samples);
    }

    #[test]
    fn payload_is_plain_zlib_of_rotated_le_bytes() {
        let payload = encode_depth(&[8, 0x0007]).expect("encode");
        let mut raw = vec![];
        ZlibDecoder::new(&payload[..])
            .read_to_end(&mut raw)
            .expect("inflate");
        assert_eq!(raw, vec![0x01, 0x00, 0x00, 0xE0]);
    }

    #[test]
    fn decode_rejects_wrong_sample_count() {
        let payload = encode_depth(&[1, 2, 3]).expect("encode");
        let err = decode_depth(&payload, Some(4)).expect_err("count mismatch");
        assert!(matches!(err, ConvertError::CorruptContainer { .. }));
        assert!(decode_depth(b"not zlib", None).is_err());
    }

    #[test]
    fn loads_16bit_png() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("0000000-1.png");
        let img: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_fn(3, 2, |x, y| Luma([(y * 3 + x) as u16 * 1000]));
        img.save(&path).expect("save png");

        let depth = load_depth_image(&path).expect("load");
        assert_eq!((depth.width, depth.height), (3, 2));
        assert_eq!(depth.samples, vec![0, 1000, 2000, 3000, 4000, 5000]);
    }

    #[test]
    fn loads_8bit_png_widened() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("0000000-1.png");
        let img: ImageBuffer<Luma<u8>, Vec<u8>> =
            ImageBuffer::from_raw(2, 1, vec![1u8, 255]).expect("buffer");
        img.save(&path).expect("save png");

        let depth = load_depth_image(&path).expect("load");
        assert_eq!(depth.samples, vec![257, 65535]);
    }
}
