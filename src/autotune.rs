use sysinfo::System;

/// Share of available RAM the in-flight frame queue may occupy.
const QUEUE_RAM_FRACTION: u64 = 8;
const MAX_WORKERS: usize = 16;
const MAX_QUEUE_FRAMES: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct Tune {
    pub workers: usize,
    pub queue_frames: usize,
    pub cores: usize,
    pub ram_avail_bytes: u64,
}

/// Picks worker count and queue depth for the frame pipeline.
///
/// `frame_bytes` is the estimated peak memory of one frame in flight (color
/// file + decoded depth + rotated copy + compressed output).
pub fn auto_tune_for_convert(frame_bytes: u64) -> Tune {
    let cores = num_cpus::get().max(1);
    let (_total, avail) = system_ram_bytes();
    tune_from(cores, avail, frame_bytes)
}

fn tune_from(cores: usize, ram_avail_bytes: u64, frame_bytes: u64) -> Tune {
    // Depth decode + deflate is CPU bound; leave one core to the writer.
    let workers = cores.saturating_sub(1).clamp(1, MAX_WORKERS);

    let budget = ram_avail_bytes / QUEUE_RAM_FRACTION;
    let by_ram = (budget / frame_bytes.max(1)) as usize;
    let queue_frames = by_ram.clamp(workers, MAX_QUEUE_FRAMES.max(workers)).max(2);

    Tune {
        workers,
        queue_frames,
        cores,
        ram_avail_bytes,
    }
}

fn system_ram_bytes() -> (u64, u64) {
    let mut sys = System::new();
    sys.refresh_memory();
    (sys.total_memory(), sys.available_memory())
}
