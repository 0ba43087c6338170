use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::Level;

use facecapture::config::{CaptureMode, Config};
use facecapture::frame::{Frame, PixelFormat};
use facecapture::slot::FaceRecord;
use facecapture::source::{DetectionSource, FrameLog, ReplaySource};
use facecapture::FaceCapture;

#[derive(Parser)]
#[command(
    name = "facecapture",
    about = "Replay recorded face detections through the tracker and best-shot capture engine",
    version = "0.1.0"
)]
struct Args {
    /// Recorded detections (JSON array or JSON lines of frames)
    #[arg(short, long, required = true)]
    input: PathBuf,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the capture mode (AUTO, FAST or CYCLE)
    #[arg(short, long)]
    mode: Option<String>,

    /// Directory holding the frame images referenced by the recording
    #[arg(long)]
    images: Option<PathBuf>,

    /// Directory to save emitted best shots as PNG
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: Level,
}

#[derive(Serialize)]
struct ShotLog<'a> {
    frame: u64,
    slot: usize,
    track_id: u64,
    width: u32,
    height: u32,
    record: &'a FaceRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
}

fn parse_mode(mode: &str) -> anyhow::Result<CaptureMode> {
    serde_json::from_value(serde_json::Value::String(mode.to_uppercase()))
        .with_context(|| format!("unknown capture mode {mode:?}"))
}

/// Load the frame image, or a blank frame sized from the log.
fn load_frame(log: &FrameLog, images: Option<&Path>) -> anyhow::Result<Frame> {
    if let (Some(dir), Some(name)) = (images, log.image.as_deref()) {
        let path = dir.join(name);
        let img = image::open(&path)
            .with_context(|| format!("failed to load frame image {path:?}"))?
            .to_rgb8();
        return Ok(Frame::from_rgb(img));
    }
    Ok(Frame::new(log.width.max(1), log.height.max(1), PixelFormat::Rgb888))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(args.log_level)
        .with_writer(io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {path:?}"))?,
        None => Config::default(),
    };
    if let Some(mode) = &args.mode {
        config.mode = parse_mode(mode)?;
    }
    tracing::info!(mode = ?config.mode, buffer_size = config.buffer_size, "starting replay");

    let mut source = ReplaySource::from_file(&args.input)
        .with_context(|| format!("failed to read detections from {:?}", args.input))?;
    let mut app = FaceCapture::new(config).context("failed to create pipeline")?;

    if let Some(dir) = &args.output {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {dir:?}"))?;
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut frames = 0u64;
    let mut shots = 0u64;

    while let Some(log) = source.next_frame()? {
        let frame = load_frame(&log, args.images.as_deref())?;
        // shots emitted before a failed capture pass are still delivered
        if let Err(e) = app.run(&frame, &log.detections) {
            tracing::error!(frame = log.frame, error = %e, "capture pass failed");
        }
        frames += 1;

        for shot in app.outputs() {
            let path = match &args.output {
                Some(dir) => {
                    let path = dir.join(format!(
                        "track{:05}_frame{:06}.png",
                        shot.track_id, log.frame
                    ));
                    shot.image
                        .to_rgb_image()?
                        .save(&path)
                        .with_context(|| format!("failed to save {path:?}"))?;
                    Some(path)
                }
                None => None,
            };
            let line = ShotLog {
                frame: log.frame,
                slot: shot.slot,
                track_id: shot.track_id,
                width: shot.image.width,
                height: shot.image.height,
                record: shot.record,
                path,
            };
            writeln!(out, "{}", serde_json::to_string(&line)?)?;
            shots += 1;
        }
    }

    let summary = app.engine().summary();
    tracing::info!(
        frames,
        shots,
        alive = app.engine().alive_count(),
        used_bytes = summary.used_bytes,
        "replay finished"
    );
    app.reset();
    Ok(())
}
