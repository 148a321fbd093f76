//! stream_probe - Connect to a camera and report decode health.
//!
//! Reads frames until Ctrl-C, a frame limit, or a permanent failure, logging state changes
//! and periodic throughput. With the `cuda` feature each frame is copied into a device
//! tensor, exercising the full read-to-copy path.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vision_stream::{StreamSettings, StreamSource};

const IDLE_SLEEP: Duration = Duration::from_millis(5);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Probe an RTSP camera through the hardware decode pipeline"
)]
struct Args {
    /// JSON or TOML settings file.
    #[arg(long, env = "VISION_STREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Stream URI; overrides the settings file.
    #[arg(long)]
    uri: Option<String>,

    /// Stop after this many frames.
    #[arg(long)]
    frames: Option<u64>,

    /// Seconds between throughput reports.
    #[arg(long, default_value = "5")]
    report_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut settings = StreamSettings::load_from(args.config.as_deref())?;
    if let Some(uri) = args.uri {
        settings.stream.uri = uri;
    }

    let mut source = StreamSource::with_policy(settings.stream, settings.policy)?;
    let liveness = source.liveness();

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = Arc::clone(&running);
    ctrlc::set_handler(move || {
        running_handler.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let report_every = Duration::from_secs(args.report_secs.max(1));
    let mut last_report = Instant::now();
    let mut frames_since_report = 0u64;
    let mut total_frames = 0u64;
    let mut was_reconnecting = liveness.is_reconnecting();

    log::info!("stream_probe running against {}", source.stats().uri);

    while running.load(Ordering::SeqCst) {
        let delivered = match source.read() {
            Some(frame) => {
                let (height, width, channels) = frame.shape();
                log::debug!(
                    "frame seq={} gen={} {}x{}x{} on device {}",
                    frame.sequence(),
                    frame.generation(),
                    width,
                    height,
                    channels,
                    frame.device_index()
                );
                copy_out(frame)?;
                true
            }
            None => false,
        };
        if delivered {
            frames_since_report += 1;
            total_frames += 1;
        } else {
            if source.is_failed() {
                let reason = source
                    .last_error()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "unknown error".to_string());
                return Err(anyhow!("stream failed permanently: {}", reason));
            }
            std::thread::sleep(IDLE_SLEEP);
        }

        let reconnecting = liveness.is_reconnecting();
        if reconnecting != was_reconnecting {
            if reconnecting {
                log::warn!("stream lost, reconnecting");
            } else {
                log::info!("stream live");
            }
            was_reconnecting = reconnecting;
        }

        if last_report.elapsed() >= report_every {
            let stats = source.stats();
            log::info!(
                "{:.1} fps, state={:?}, delivered={}, rejected={}, reconnects={}",
                frames_since_report as f64 / last_report.elapsed().as_secs_f64(),
                stats.state,
                stats.frames_delivered,
                stats.frames_rejected,
                stats.reconnects
            );
            frames_since_report = 0;
            last_report = Instant::now();
        }

        if args.frames.map_or(false, |limit| total_frames >= limit) {
            break;
        }
    }

    source.close();
    log::info!("stream_probe stopped after {} frames", total_frames);
    Ok(())
}

#[cfg(feature = "cuda")]
fn copy_out(frame: vision_stream::DeviceFrame<'_>) -> Result<()> {
    let mut tensor = vision_stream::CudaTensorBuffer::for_frame(&frame)?;
    frame.copy_to(&mut tensor)?;
    Ok(())
}

#[cfg(not(feature = "cuda"))]
fn copy_out(frame: vision_stream::DeviceFrame<'_>) -> Result<()> {
    drop(frame);
    Ok(())
}
