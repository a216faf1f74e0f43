//! frame_publisher - publish a directory of extracted frame images as one
//! stream on the work channel.
//!
//! Files (`.jpg`, `.jpeg`, `.png`) are taken in file-name order. The n-th
//! file is frame `n` (from 1) with timestamp `(n - 1) * 1000 / fps` ms.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use toolguard::pipeline::Session;
use toolguard::transport::wire::encode_frame;
use toolguard::{
    validate_stream_id, Frame, FrameEncoding, FrameMeta, MqttConnector, PipelineConfig, Shutdown,
    Supervisor, Topics,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Publish extracted frames to the toolguard work channel")]
struct Args {
    /// Directory of frame images.
    #[arg(long)]
    dir: PathBuf,

    /// Stream id the frames belong to.
    #[arg(long, env = "TOOLGUARD_STREAM_ID")]
    stream: String,

    /// Frame rate the images were extracted at.
    #[arg(long, default_value_t = 5.0)]
    fps: f64,

    /// Publish only every n-th frame.
    #[arg(long, default_value_t = 1)]
    every: u64,

    /// Stop after this many published frames.
    #[arg(long)]
    limit: Option<u64>,

    /// MQTT client id. Defaults to prefix-publisher-pid.
    #[arg(long, env = "TOOLGUARD_CLIENT_ID")]
    client_id: Option<String>,
}

fn encoding_for(path: &Path) -> Option<FrameEncoding> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some(FrameEncoding::Jpeg),
        "png" => Some(FrameEncoding::Png),
        _ => None,
    }
}

fn list_frames(dir: &Path) -> Result<Vec<(PathBuf, FrameEncoding)>> {
    let mut frames = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if let Some(encoding) = encoding_for(&path) {
            frames.push((path, encoding));
        }
    }
    frames.sort_by(|a, b| a.0.file_name().cmp(&b.0.file_name()));
    Ok(frames)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    validate_stream_id(&args.stream)?;
    if !(args.fps.is_finite() && args.fps > 0.0) {
        return Err(anyhow!("fps must be > 0"));
    }
    if args.every == 0 {
        return Err(anyhow!("every must be >= 1"));
    }

    let cfg = PipelineConfig::load()?;
    let frames = list_frames(&args.dir)?;
    if frames.is_empty() {
        return Err(anyhow!("no .jpg/.jpeg/.png files in {}", args.dir.display()));
    }

    let shutdown = Shutdown::new();
    shutdown.install_ctrlc_handler()?;
    let topics = Topics::new(cfg.broker.topic_prefix.clone());
    let topic = topics.frames(&args.stream);
    let mut session = Session::new(
        Arc::new(MqttConnector::new(cfg.broker.clone())?),
        args.client_id
            .unwrap_or_else(|| cfg.broker.client_id_for("publisher")),
        Vec::new(),
        Supervisor::new(cfg.retry.clone(), shutdown.clone()),
    );

    let mut published = 0u64;
    for (index, (path, encoding)) in frames.iter().enumerate() {
        if shutdown.is_triggered() {
            break;
        }
        if args.limit.is_some_and(|limit| published >= limit) {
            break;
        }
        let frame_id = index as u64 + 1;
        if (frame_id - 1) % args.every != 0 {
            continue;
        }
        let (width, height) = image::image_dimensions(path)
            .with_context(|| format!("failed to read image header of {}", path.display()))?;
        let payload = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let meta = FrameMeta {
            stream_id: args.stream.clone(),
            frame_id,
            timestamp_ms: ((frame_id - 1) as f64 * 1000.0 / args.fps) as u64,
        };
        let frame = Frame::new(meta, width, height, *encoding, payload)?;
        let bytes = encode_frame(&frame)?;
        session
            .publish_with_retry(&topic, &bytes)
            .map_err(|e| anyhow!("publishing {} failed: {}", frame.meta(), e))?;
        published += 1;
        log::debug!("published {} from {}", frame.meta(), path.display());
    }

    session.disconnect();
    log::info!(
        "published {} of {} frames to {}",
        published,
        frames.len(),
        topic
    );
    Ok(())
}
