mod align;
mod autotune;
mod calibration;
mod container;
mod depth;
mod encoder;
mod error;
mod inspect;
mod manifest;
mod progress;
mod util;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use indicatif::HumanBytes;
use progress::{
    format_duration, format_rate, ConvertSummary, InspectSummary, ProgressConfig, ProgressMode,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "rgbd2sens",
    version,
    about = "Pack a timestamped RGB-D capture (image/, depth/, intrinsics.txt) into a .sens container"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert frames [START_FRAME, END_FRAME) of a capture directory into a .sens file
    Convert {
        input_root: PathBuf,
        output: PathBuf,

        /// First aligned frame to write.
        #[arg(default_value_t = 0)]
        start_frame: u64,

        /// One past the last aligned frame to write.
        end_frame: Option<u64>,

        /// Convert engine: parallel (default) or sequential.
        #[arg(long, value_enum, default_value_t = encoder::ConvertEngine::Parallel)]
        engine: encoder::ConvertEngine,

        /// Worker count override. Default: auto.
        #[arg(long)]
        workers: Option<usize>,

        /// Max frames in flight between workers and the writer. Default: auto.
        #[arg(long)]
        queue_frames: Option<usize>,

        /// Sensor name stored in the header.
        #[arg(long, default_value = container::DEFAULT_SENSOR_NAME)]
        sensor_name: String,

        /// Divisor converting depth samples to meters.
        #[arg(long, default_value_t = container::DEFAULT_DEPTH_SHIFT)]
        depth_shift: f32,

        /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
        #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
        progress: ProgressMode,
    },

    /// Print the header and frame totals of a .sens file
    Inspect {
        container: PathBuf,

        /// Inflate every depth payload and check color payload markers.
        #[arg(long, default_value_t = false)]
        verify: bool,

        /// Print the report as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
        #[arg(long, value_enum, default_value_t = ProgressMode::Quiet)]
        progress: ProgressMode,
    },
}

fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            // Usage mistakes are reported but do not fail the process.
            e.print().ok();
            return Ok(());
        }
    };

    match cli.cmd {
        Commands::Convert {
            input_root,
            output,
            start_frame,
            end_frame,
            engine,
            workers,
            queue_frames,
            sensor_name,
            depth_shift,
            progress,
        } => {
            let Some(end_frame) = end_frame else {
                print_convert_usage();
                return Ok(());
            };
            let cfg = encoder::ConvertConfig {
                input_root,
                output_path: output,
                start_frame,
                end_frame,
                sensor_name,
                depth_shift,
            };
            let summary = encoder::convert_dataset(
                &cfg,
                encoder::ConvertPerfConfig {
                    engine,
                    workers,
                    queue_frames,
                },
                ProgressConfig::new(progress),
            )?;
            print_convert_summary(&summary);
        }

        Commands::Inspect {
            container,
            verify,
            json,
            progress,
        } => {
            let summary =
                inspect::inspect_container(&container, verify, ProgressConfig::new(progress))?;
            if json {
                let report = inspect::InspectReport::from_summary(&summary);
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_inspect_summary(&summary);
            }
        }
    }

    Ok(())
}

fn print_convert_usage() {
    let mut cmd = Cli::command();
    cmd.build();
    if let Some(sub) = cmd.find_subcommand_mut("convert") {
        eprintln!(
            "error: END_FRAME is required\n\n{}\n\nFor more information, try '--help'.",
            sub.render_usage()
        );
    }
}

fn print_convert_summary(summary: &ConvertSummary) {
    println!(
        "Convert summary: output={} frames={} range={}..{} available={} engine={} workers={} queue_frames={} duration={} throughput={} color={} depth={} depth_ratio={:.2} container={} warnings={}",
        summary.output_path.display(),
        summary.frames_written,
        summary.start_frame,
        summary.end_frame,
        summary.available_frames,
        summary.engine,
        summary.workers,
        summary.queue_frames,
        format_duration(summary.elapsed),
        format_rate(summary.avg_bytes_per_sec),
        HumanBytes(summary.color_bytes),
        HumanBytes(summary.depth_bytes),
        util::compression_ratio(summary.depth_raw_bytes, summary.depth_bytes),
        HumanBytes(summary.container_bytes),
        summary.warning_count,
    );
    println!(
        "Alignment: max_skew={} mean_skew={:.1} reused_depth={}",
        summary.max_skew, summary.mean_skew, summary.reused_depth
    );
    for warning in &summary.warnings {
        println!("  warning: {}", warning);
    }
}

fn print_inspect_summary(summary: &InspectSummary) {
    let h = &summary.header;
    println!(
        "Header: file={} version={} sensor={} color={}x{} ({:?}) depth={}x{} ({:?}) depth_shift={} frames={}",
        summary.input_path.display(),
        h.version,
        h.sensor_name,
        h.color_width,
        h.color_height,
        h.color_compression,
        h.depth_width,
        h.depth_height,
        h.depth_compression,
        h.depth_shift,
        h.frame_count,
    );
    for row in h.color_intrinsics.iter().take(3) {
        println!("  intrinsics: {:?}", &row[..3]);
    }
    println!(
        "Inspect summary: frames={} color={} depth={} first_ts={} last_ts={} verified={} duration={}",
        summary.frames_read,
        HumanBytes(summary.color_bytes),
        HumanBytes(summary.depth_bytes),
        summary
            .first_timestamp
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string()),
        summary
            .last_timestamp
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string()),
        summary.verified,
        format_duration(summary.elapsed),
    );
}
