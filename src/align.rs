use crate::error::ConvertError;
use crate::manifest::ImageDescriptor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePair {
    pub color: ImageDescriptor,
    pub depth: ImageDescriptor,
}

impl FramePair {
    pub fn skew(&self) -> u64 {
        self.color.timestamp.abs_diff(self.depth.timestamp)
    }
}

/// Pairs every color image with the depth image closest in time.
///
/// Both slices must be non-decreasing in timestamp. Ties go to the lower depth
/// index, so a depth image may serve several consecutive color images.
pub fn align_streams(
    color: &[ImageDescriptor],
    depth: &[ImageDescriptor],
) -> Result<Vec<FramePair>, ConvertError> {
    if depth.is_empty() {
        if color.is_empty() {
            return Ok(vec![]);
        }
        return Err(ConvertError::NoDepthFrames {
            color_frames: color.len(),
        });
    }

    let depth_ts = depth.iter().map(|d| d.timestamp).collect::<Vec<_>>();
    Ok(color
        .iter()
        .map(|c| FramePair {
            color: c.clone(),
            depth: depth[nearest_index(&depth_ts, c.timestamp)].clone(),
        })
        .collect())
}

/// Index of the timestamp nearest to `target` in a non-empty sorted slice.
pub fn nearest_index(sorted: &[u64], target: u64) -> usize {
    debug_assert!(!sorted.is_empty());

    // First entry at or after the target.
    let above = sorted.partition_point(|&t| t < target);
    if above == 0 {
        return 0;
    }
    // First occurrence of the largest value below the target.
    let below_value = sorted[above - 1];
    let below = sorted.partition_point(|&t| t < below_value);
    if above == sorted.len() {
        return below;
    }

    let below_diff = target - below_value;
    let above_diff = sorted[above] - target;
    if below_diff <= above_diff {
        below
    } else {
        above
    }
}

/// Summary of timestamp skew over a run of aligned frames.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AlignmentStats {
    pub max_skew: u64,
    pub mean_skew: f64,
    pub reused_depth: usize,
}

pub fn alignment_stats(pairs: &[FramePair]) -> AlignmentStats {
    if pairs.is_empty() {
        return AlignmentStats::default();
    }
    let max_skew = pairs.iter().map(FramePair::skew).max().unwrap_or(0);
    let mean_skew = pairs.iter().map(|p| p.skew() as f64).sum::<f64>() / pairs.len() as f64;
    let reused_depth = pairs
        .windows(2)
        .filter(|w| w[0].depth.path == w[1].depth.path)
        .count();
    AlignmentStats {
        max_skew,
        mean_skew,
        reused_depth,
    }
}
