use crate::align::{self, FramePair};
use crate::autotune;
use crate::calibration;
use crate::container::{FrameRecord, SensHeader, SensWriter, UNKNOWN_POSE};
use crate::depth;
use crate::error::ConvertError;
use crate::manifest::{self, StreamKind};
use crate::progress::{ConvertSummary, ProgressConfig, ProgressHandle, ProgressReporter};
use crate::util::{self, DatasetLayout};

use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const OUTPUT_BUFFER_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ConvertEngine {
    Parallel,
    Sequential,
}

/// What to convert and where to put it.
#[derive(Debug, Clone)]
pub struct ConvertConfig {
    pub input_root: PathBuf,
    pub output_path: PathBuf,
    pub start_frame: u64,
    pub end_frame: u64,
    pub sensor_name: String,
    pub depth_shift: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct ConvertPerfConfig {
    pub engine: ConvertEngine,
    pub workers: Option<usize>,
    pub queue_frames: Option<usize>,
}

impl Default for ConvertPerfConfig {
    fn default() -> Self {
        Self {
            engine: ConvertEngine::Parallel,
            workers: None,
            queue_frames: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ConvertRuntimeConfig {
    engine: ConvertEngine,
    workers: usize,
    queue_frames: usize,
}

/// Per-frame constants shared by every worker.
#[derive(Debug, Clone, Copy)]
struct FrameContext {
    depth_dims: (u32, u32),
}

struct EncodedFrame {
    record: FrameRecord,
    source_bytes: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct FrameTotals {
    frames: u64,
    color_bytes: u64,
    depth_bytes: u64,
}

impl FrameTotals {
    fn add(&mut self, frame: &EncodedFrame) {
        self.frames += 1;
        self.color_bytes += frame.record.color_payload.len() as u64;
        self.depth_bytes += frame.record.depth_payload.len() as u64;
    }
}

pub fn convert_dataset(
    cfg: &ConvertConfig,
    perf_cfg: ConvertPerfConfig,
    progress_cfg: ProgressConfig,
) -> Result<ConvertSummary> {
    let layout = DatasetLayout::under(&cfg.input_root);

    let reporter = ProgressReporter::new("convert", 0, progress_cfg);
    let progress = reporter.handle();

    progress.set_stage("scan streams");
    let color = manifest::scan_stream_dir(&layout.color_dir, StreamKind::Color)?;
    let depth = manifest::scan_stream_dir(&layout.depth_dir, StreamKind::Depth)?;
    progress.log(format!(
        "Streams: color={} depth={} root={}",
        color.len(),
        depth.len(),
        cfg.input_root.display()
    ));

    progress.set_stage("align streams");
    let pairs = align::align_streams(&color, &depth)?;
    let range = validate_frame_range(cfg.start_frame, cfg.end_frame, pairs.len())?;

    progress.set_stage("load calibration");
    let calib = calibration::load_intrinsics(&layout.intrinsics)?;

    progress.set_stage("probe dimensions");
    let (color_dims, depth_dims) = probe_dimensions(&pairs)?;
    progress.log(format!(
        "Dimensions: color={}x{} depth={}x{}",
        color_dims.0, color_dims.1, depth_dims.0, depth_dims.1
    ));

    let selected = &pairs[range];
    let stats = align::alignment_stats(selected);
    progress.log(format!(
        "Alignment: frames={} max_skew={} mean_skew={:.1} reused_depth={}",
        selected.len(),
        stats.max_skew,
        stats.mean_skew,
        stats.reused_depth
    ));
    if stats.reused_depth > 0 {
        progress.warning(format!(
            "{} color frames reuse the depth image of their predecessor",
            stats.reused_depth
        ));
    }

    let frame_bytes = estimate_frame_bytes(selected, depth_dims);
    let tune = autotune::auto_tune_for_convert(frame_bytes);
    let runtime = resolve_runtime_config(perf_cfg, tune, selected.len());
    progress.log(format!(
        "Decision snapshot: engine={:?} workers={} queue_frames={} cores={} ram_avail={}MiB frame_estimate={}KiB",
        runtime.engine,
        runtime.workers,
        runtime.queue_frames,
        tune.cores,
        tune.ram_avail_bytes / (1024 * 1024),
        frame_bytes / 1024,
    ));

    let header = SensHeader::for_capture(
        &cfg.sensor_name,
        &calib,
        color_dims,
        depth_dims,
        cfg.depth_shift,
        selected.len() as u64,
    );

    progress.set_stage("write header");
    let file = File::create(&cfg.output_path)
        .with_context(|| format!("create output {}", cfg.output_path.display()))?;
    let mut writer = SensWriter::new(BufWriter::with_capacity(OUTPUT_BUFFER_BYTES, file));
    writer.write_header(&header)?;

    progress.set_totals(source_bytes(selected), selected.len() as u64);
    let ctx = FrameContext { depth_dims };
    let totals = match runtime.engine {
        ConvertEngine::Sequential => {
            progress.set_stage("sequential convert");
            convert_sequential(selected, cfg.start_frame, ctx, &mut writer, &progress)?
        }
        ConvertEngine::Parallel => {
            progress.set_stage("parallel convert");
            convert_parallel(selected, cfg.start_frame, ctx, runtime, &mut writer, &progress)?
        }
    };

    progress.set_stage("finish container");
    let frames_written = writer.frames_written();
    let container_bytes = writer.bytes_written() + 1;
    writer.finish()?;

    let outcome = reporter.finish(format!(
        "wrote {} frames to {}",
        frames_written,
        cfg.output_path.display()
    ));

    Ok(ConvertSummary {
        output_path: cfg.output_path.clone(),
        engine: format!("{:?}", runtime.engine).to_lowercase(),
        workers: runtime.workers,
        queue_frames: runtime.queue_frames,
        start_frame: cfg.start_frame,
        end_frame: cfg.end_frame,
        frames_written,
        available_frames: pairs.len(),
        color_bytes: totals.color_bytes,
        depth_raw_bytes: totals.frames * header.depth_samples() as u64 * 2,
        depth_bytes: totals.depth_bytes,
        container_bytes,
        max_skew: stats.max_skew,
        mean_skew: stats.mean_skew,
        reused_depth: stats.reused_depth,
        elapsed: outcome.elapsed,
        avg_bytes_per_sec: outcome.avg_bytes_per_sec,
        warning_count: outcome.warning_count,
        warnings: outcome.warnings,
    })
}

/// Checks `[start, end)` against the number of aligned pairs.
pub fn validate_frame_range(
    start: u64,
    end: u64,
    available: usize,
) -> Result<Range<usize>, ConvertError> {
    if start > end {
        return Err(ConvertError::InvalidFrameRange { start, end });
    }
    if end > available as u64 {
        return Err(ConvertError::FrameRangeExceeded {
            start,
            end,
            available: available as u64,
        });
    }
    Ok(start as usize..end as usize)
}

/// Color and depth dimensions, taken from the first aligned pair.
fn probe_dimensions(pairs: &[FramePair]) -> Result<((u32, u32), (u32, u32))> {
    let Some(first) = pairs.first() else {
        return Ok(((0, 0), (0, 0)));
    };
    let color = image::image_dimensions(&first.color.path)
        .with_context(|| format!("probe color image {}", first.color.path.display()))?;
    let depth = image::image_dimensions(&first.depth.path)
        .with_context(|| format!("probe depth image {}", first.depth.path.display()))?;
    Ok((color, depth))
}

fn estimate_frame_bytes(pairs: &[FramePair], depth_dims: (u32, u32)) -> u64 {
    let color = pairs
        .first()
        .and_then(|p| std::fs::metadata(&p.color.path).ok())
        .map(|m| m.len())
        .unwrap_or(0);
    // decoded samples, rotated byte stream, compressed output
    let depth = depth_dims.0 as u64 * depth_dims.1 as u64 * 2 * 3;
    (color + depth).max(1)
}

fn source_bytes(pairs: &[FramePair]) -> u64 {
    pairs
        .iter()
        .flat_map(|p| [&p.color.path, &p.depth.path])
        .filter_map(|path| std::fs::metadata(path).ok())
        .map(|m| m.len())
        .sum()
}

fn resolve_runtime_config(
    perf_cfg: ConvertPerfConfig,
    tune: autotune::Tune,
    frame_count: usize,
) -> ConvertRuntimeConfig {
    let workers = match perf_cfg.engine {
        ConvertEngine::Sequential => 1,
        ConvertEngine::Parallel => perf_cfg
            .workers
            .unwrap_or(tune.workers)
            .clamp(1, frame_count.max(1)),
    };
    let queue_frames = perf_cfg
        .queue_frames
        .unwrap_or(tune.queue_frames)
        .max(1);

    ConvertRuntimeConfig {
        engine: perf_cfg.engine,
        workers,
        queue_frames,
    }
}

/// Reads a color file verbatim. A short read is fatal.
fn read_color_payload(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path).with_context(|| format!("open color image {}", path.display()))?;
    let expected = file
        .metadata()
        .with_context(|| format!("stat color image {}", path.display()))?
        .len();

    read_exact_payload(file, expected, path)
}

/// Reads exactly `expected` bytes from `src`; fewer is a `PartialRead`.
fn read_exact_payload(src: impl Read, expected: u64, path: &Path) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(expected as usize);
    src.take(expected)
        .read_to_end(&mut buf)
        .with_context(|| format!("read color image {}", path.display()))?;
    if buf.len() as u64 != expected {
        return Err(ConvertError::PartialRead {
            path: path.to_path_buf(),
            expected,
            got: buf.len() as u64,
        }
        .into());
    }
    Ok(buf)
}

fn encode_one_frame(pair: &FramePair, ctx: FrameContext) -> Result<EncodedFrame> {
    let color_payload = read_color_payload(&pair.color.path)?;

    let depth = depth::load_depth_image(&pair.depth.path)?;
    if (depth.width, depth.height) != ctx.depth_dims {
        return Err(ConvertError::DepthSizeMismatch {
            path: pair.depth.path.clone(),
            width: depth.width,
            height: depth.height,
            expected_width: ctx.depth_dims.0,
            expected_height: ctx.depth_dims.1,
        }
        .into());
    }
    let depth_source = std::fs::metadata(&pair.depth.path)
        .map(|m| m.len())
        .unwrap_or(0);
    let depth_payload = depth::encode_depth(&depth.samples)
        .with_context(|| format!("compress depth image {}", pair.depth.path.display()))?;

    Ok(EncodedFrame {
        source_bytes: color_payload.len() as u64 + depth_source,
        record: FrameRecord {
            camera_to_world: UNKNOWN_POSE,
            color_timestamp: pair.color.timestamp,
            depth_timestamp: pair.depth.timestamp,
            color_payload,
            depth_payload,
        },
    })
}

fn convert_sequential<W: Write>(
    pairs: &[FramePair],
    first_frame: u64,
    ctx: FrameContext,
    writer: &mut SensWriter<W>,
    progress: &ProgressHandle,
) -> Result<FrameTotals> {
    let mut totals = FrameTotals::default();
    for (i, pair) in pairs.iter().enumerate() {
        let frame_no = first_frame + i as u64;
        progress.set_operation_status(
            "seq",
            format!("frame={} {}", frame_no, util::file_label(&pair.color.path)),
        );
        let frame = encode_one_frame(pair, ctx).with_context(|| format!("frame {}", frame_no))?;
        writer.write_frame(&frame.record)?;
        totals.add(&frame);
        progress.frame_done(frame.source_bytes);
    }
    progress.clear_operation("seq");
    Ok(totals)
}

fn convert_parallel<W: Write>(
    pairs: &[FramePair],
    first_frame: u64,
    ctx: FrameContext,
    runtime: ConvertRuntimeConfig,
    writer: &mut SensWriter<W>,
    progress: &ProgressHandle,
) -> Result<FrameTotals> {
    let cancel = Arc::new(AtomicBool::new(false));
    let first_error = Arc::new(Mutex::new(None::<anyhow::Error>));
    let next_index = Arc::new(AtomicUsize::new(0));
    let written = Arc::new(AtomicUsize::new(0));
    let pairs_arc = Arc::new(pairs.to_vec());

    let (tx, rx) = bounded::<(usize, EncodedFrame)>(runtime.queue_frames);

    let worker_handles = (0..runtime.workers)
        .map(|worker_id| {
            let pairs_arc = Arc::clone(&pairs_arc);
            let next_index = Arc::clone(&next_index);
            let written = Arc::clone(&written);
            let cancel = Arc::clone(&cancel);
            let first_error = Arc::clone(&first_error);
            let progress = progress.clone();
            let tx = tx.clone();
            let window = runtime.queue_frames;

            std::thread::spawn(move || {
                let op_id = format!("enc{:02}", worker_id);
                loop {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let idx = next_index.fetch_add(1, Ordering::Relaxed);
                    if idx >= pairs_arc.len() {
                        break;
                    }
                    if !wait_for_window(idx, &written, window, &cancel) {
                        break;
                    }

                    let pair = &pairs_arc[idx];
                    let frame_no = first_frame + idx as u64;
                    progress.set_operation_status(
                        op_id.clone(),
                        format!(
                            "frame={}/{} {}",
                            idx + 1,
                            pairs_arc.len(),
                            util::file_label(&pair.color.path)
                        ),
                    );

                    match encode_one_frame(pair, ctx).with_context(|| format!("frame {}", frame_no)) {
                        Ok(frame) => {
                            if tx.send((idx, frame)).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            record_error(&first_error, &cancel, err);
                            break;
                        }
                    }
                }
                progress.clear_operation(&op_id);
            })
        })
        .collect::<Vec<_>>();
    drop(tx);

    // Writer: reorder into ascending frame order on the calling thread.
    let mut pending = BTreeMap::<usize, EncodedFrame>::new();
    let mut totals = FrameTotals::default();
    let mut next_to_write = 0usize;
    while !cancel.load(Ordering::Relaxed) {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok((idx, frame)) => {
                pending.insert(idx, frame);
                while let Some(frame) = pending.remove(&next_to_write) {
                    if let Err(err) = writer.write_frame(&frame.record) {
                        record_error(&first_error, &cancel, err);
                        break;
                    }
                    totals.add(&frame);
                    progress.frame_done(frame.source_bytes);
                    next_to_write += 1;
                    written.store(next_to_write, Ordering::Release);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                progress.set_stage(format!(
                    "parallel convert written={}/{} reorder={} window={}",
                    next_to_write,
                    pairs.len(),
                    pending.len(),
                    runtime.queue_frames
                ));
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    drop(rx);

    for h in worker_handles {
        if h.join().is_err() {
            record_error(&first_error, &cancel, anyhow!("convert worker thread panicked"));
        }
    }

    let err = first_error
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .take();
    if let Some(err) = err {
        return Err(err);
    }
    if next_to_write != pairs.len() {
        bail!(
            "parallel convert stopped after {} of {} frames",
            next_to_write,
            pairs.len()
        );
    }
    Ok(totals)
}

/// Blocks until frame `idx` fits in the writer's reorder window. Returns
/// false when the run was cancelled while waiting.
fn wait_for_window(idx: usize, written: &AtomicUsize, window: usize, cancel: &AtomicBool) -> bool {
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        if idx < written.load(Ordering::Acquire) + window {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn record_error(
    first_error: &Arc<Mutex<Option<anyhow::Error>>>,
    cancel: &Arc<AtomicBool>,
    err: anyhow::Error,
) {
    let mut g = first_error.lock().unwrap_or_else(|p| p.into_inner());
    if g.is_none() {
        *g = Some(err);
    }
    cancel.store(true, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::SensReader;
    use crate::progress::ProgressMode;
    use image::{ImageBuffer, Luma, Rgb, RgbImage};
    use tempfile::TempDir;

    fn write_capture(root: &Path, color_ts: &[u64], depth_ts: &[u64]) {
        let layout = DatasetLayout::under(root);
        std::fs::create_dir_all(&layout.color_dir).unwrap();
        std::fs::create_dir_all(&layout.depth_dir).unwrap();
        for (i, ts) in color_ts.iter().enumerate() {
            let img: RgbImage =
                ImageBuffer::from_fn(8, 6, |x, y| Rgb([(x * 30) as u8, (y * 40) as u8, i as u8]));
            img.save(layout.color_dir.join(format!("{:07}-{}.jpg", i, ts)))
                .unwrap();
        }
        for (i, ts) in depth_ts.iter().enumerate() {
            let img: ImageBuffer<Luma<u16>, Vec<u16>> =
                ImageBuffer::from_fn(4, 3, |x, y| Luma([(1000 + x * 10 + y + i as u32) as u16]));
            img.save(layout.depth_dir.join(format!("{:07}-{}.png", i, ts)))
                .unwrap();
        }
        std::fs::write(&layout.intrinsics, "525 0 319.5\n0 525 239.5\n0 0 1\n").unwrap();
    }

    fn config(root: &Path, out: &Path, start: u64, end: u64) -> ConvertConfig {
        ConvertConfig {
            input_root: root.to_path_buf(),
            output_path: out.to_path_buf(),
            start_frame: start,
            end_frame: end,
            sensor_name: "Unknown".to_string(),
            depth_shift: 1000.0,
        }
    }

    fn quiet() -> ProgressConfig {
        ProgressConfig::new(ProgressMode::Quiet)
    }

    #[test]
    fn frame_range_checks() {
        assert_eq!(validate_frame_range(0, 3, 3).unwrap(), 0..3);
        assert_eq!(validate_frame_range(2, 2, 3).unwrap(), 2..2);
        assert!(matches!(
            validate_frame_range(0, 4, 3),
            Err(ConvertError::FrameRangeExceeded { end: 4, available: 3, .. })
        ));
        assert!(matches!(
            validate_frame_range(3, 1, 5),
            Err(ConvertError::InvalidFrameRange { start: 3, end: 1 })
        ));
    }

    #[test]
    fn short_color_read_is_partial_read() {
        let path = Path::new("image/0000000-1.jpg");
        let data = [0xFFu8, 0xD8, 0xFF];
        let err = read_exact_payload(&data[..], 10, path).expect_err("short source");
        assert!(matches!(
            err.downcast_ref::<ConvertError>(),
            Some(ConvertError::PartialRead { expected: 10, got: 3, .. })
        ));

        let full = read_exact_payload(&data[..], 3, path).expect("exact length");
        assert_eq!(full, data);
    }

    #[test]
    fn engines_write_identical_containers() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("capture");
        write_capture(&root, &[100, 200, 300, 400, 500], &[90, 210, 330, 480]);

        let seq_out = tmp.path().join("seq.sens");
        let par_out = tmp.path().join("par.sens");
        let seq = convert_dataset(
            &config(&root, &seq_out, 1, 5),
            ConvertPerfConfig {
                engine: ConvertEngine::Sequential,
                ..Default::default()
            },
            quiet(),
        )
        .expect("sequential");
        let par = convert_dataset(
            &config(&root, &par_out, 1, 5),
            ConvertPerfConfig {
                engine: ConvertEngine::Parallel,
                workers: Some(3),
                queue_frames: Some(2),
            },
            quiet(),
        )
        .expect("parallel");

        assert_eq!(seq.frames_written, 4);
        assert_eq!(par.frames_written, 4);
        let a = std::fs::read(&seq_out).unwrap();
        let b = std::fs::read(&par_out).unwrap();
        assert_eq!(a, b);
        assert_eq!(seq.container_bytes, a.len() as u64);
    }

    #[test]
    fn written_frames_read_back() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("capture");
        write_capture(&root, &[10, 20, 35], &[9, 21, 40]);
        let out = tmp.path().join("out.sens");
        convert_dataset(&config(&root, &out, 0, 3), ConvertPerfConfig::default(), quiet())
            .expect("convert");

        let mut reader = SensReader::new(File::open(&out).unwrap());
        let header = reader.read_header().unwrap();
        assert_eq!(header.frame_count, 3);
        assert_eq!((header.color_width, header.color_height), (8, 6));
        assert_eq!((header.depth_width, header.depth_height), (4, 3));

        let mut depth_stamps = vec![];
        while let Some(frame) = reader.next_frame().unwrap() {
            let samples = depth::decode_depth(&frame.depth_payload, Some(12)).unwrap();
            assert_eq!(samples[0], 1000 + depth_stamps.len() as u16);
            depth_stamps.push(frame.depth_timestamp);
        }
        assert_eq!(depth_stamps, vec![9, 21, 40]);
    }

    #[test]
    fn range_error_leaves_no_output() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("capture");
        write_capture(&root, &[1, 2], &[1, 2]);
        let out = tmp.path().join("out.sens");
        let err = convert_dataset(&config(&root, &out, 0, 3), ConvertPerfConfig::default(), quiet())
            .expect_err("range exceeded");
        assert!(matches!(
            err.downcast_ref::<ConvertError>(),
            Some(ConvertError::FrameRangeExceeded { .. })
        ));
        assert!(!out.exists());
    }

    #[test]
    fn mismatched_depth_size_fails_both_engines() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("capture");
        write_capture(&root, &[1, 2, 3], &[1, 2, 3]);
        let odd: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_pixel(5, 3, Luma([7u16]));
        odd.save(root.join("depth").join("0000002-3.png")).unwrap();

        for engine in [ConvertEngine::Sequential, ConvertEngine::Parallel] {
            let out = tmp.path().join(format!("{:?}.sens", engine));
            let err = convert_dataset(
                &config(&root, &out, 0, 3),
                ConvertPerfConfig {
                    engine,
                    workers: Some(2),
                    queue_frames: Some(2),
                },
                quiet(),
            )
            .expect_err("size mismatch");
            assert!(
                matches!(
                    err.downcast_ref::<ConvertError>(),
                    Some(ConvertError::DepthSizeMismatch {
                        width: 5,
                        height: 3,
                        expected_width: 4,
                        expected_height: 3,
                        ..
                    })
                ),
                "{engine:?}: {err:#}"
            );
        }
    }
}
