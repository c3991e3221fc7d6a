use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use traceline::capture::{CameraConfig, CaptureSource, ReplayCapture, WebcamCapture};
use traceline::geometry::ScreenPoint;
use traceline::homography::RansacConfig;
use traceline::output::{OutputSink, PngSequence, V4L2Output};
use traceline::overlay::ReferenceImage;
use traceline::pipeline::{AlignmentPipeline, PipelineConfig, PipelineState};
use traceline::points::ClickOutcome;
use traceline::session::{FrameClock, FrameTimings, Session, TickReport};
use traceline::tracking::{
    DarkQuadLocator, FlowConfig, MarkerBackend, OpticalFlowBackend, TrackerBackend,
};

/// Seconds without a frame before the source is treated as stopped
const NOT_READY_SECONDS: u32 = 5;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    /// Pyramidal Lucas-Kanade optical flow
    Flow,
    /// Dark square fiducial located every frame
    Marker,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index; the rear-facing camera is preferred if unset
    #[arg(short, long)]
    input_device: Option<u32>,

    /// Play a directory of images instead of opening a camera
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Move to the next enumerated camera after opening the first one
    #[arg(long)]
    next_camera: bool,

    /// Capture resolution width
    #[arg(long, default_value_t = 1280)]
    capture_width: u32,

    /// Capture resolution height
    #[arg(long, default_value_t = 720)]
    capture_height: u32,

    /// Reference image to trace
    #[arg(short, long)]
    reference: Option<PathBuf>,

    /// Sheet corners as display clicks, "x,y x,y x,y x,y" from top-left clockwise
    #[arg(long)]
    corners: Option<String>,

    /// Width of the display the corners were clicked on (defaults to capture width)
    #[arg(long)]
    display_width: Option<u32>,

    /// Height of the display the corners were clicked on (defaults to capture height)
    #[arg(long)]
    display_height: Option<u32>,

    /// Output v4l2loopback device path
    #[arg(short, long, default_value = "/dev/video10")]
    output_device: String,

    /// Write numbered PNG frames to this directory instead of a loopback device
    #[arg(long)]
    png_dir: Option<PathBuf>,

    /// Target frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Stop after this many frames
    #[arg(long)]
    max_frames: Option<u64>,

    /// Reference opacity, 0 to 1
    #[arg(long, default_value_t = traceline::overlay::DEFAULT_OPACITY)]
    opacity: f32,

    /// Manual rotation in degrees, used until tracking starts
    #[arg(long, default_value_t = 0.0)]
    rotation: f64,

    /// Tracking backend
    #[arg(long, value_enum, default_value_t = Backend::Flow)]
    backend: Backend,

    /// Interior seed grid size for the flow backend (0 tracks only the corners)
    #[arg(long, default_value_t = 4)]
    grid: usize,

    /// RANSAC inlier threshold in pixels
    #[arg(long, default_value_t = 3.0)]
    ransac_threshold: f64,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Draw the selected corners on the output
    #[arg(long)]
    show_markers: bool,
}

fn parse_corners(text: &str) -> Result<Vec<ScreenPoint>> {
    let points = text
        .split_whitespace()
        .map(|pair| {
            let (x, y) = pair
                .split_once(',')
                .ok_or_else(|| anyhow!("Corner '{}' is not in x,y form", pair))?;
            let x: f64 = x.trim().parse().with_context(|| format!("Bad x in '{}'", pair))?;
            let y: f64 = y.trim().parse().with_context(|| format!("Bad y in '{}'", pair))?;
            Ok(ScreenPoint::new(x, y))
        })
        .collect::<Result<Vec<_>>>()?;

    if points.len() != 4 {
        bail!("Expected 4 corners, got {}", points.len());
    }
    Ok(points)
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("traceline starting");

    // Initialize capture
    let capture: Box<dyn CaptureSource> = match &args.replay {
        Some(dir) => Box::new(ReplayCapture::new(dir, true).context("Failed to open replay")?),
        None => {
            let config = CameraConfig {
                device_index: args.input_device,
                width: args.capture_width,
                height: args.capture_height,
                fps: args.fps,
                ..CameraConfig::default()
            };
            let mut webcam =
                WebcamCapture::new(config).context("Failed to initialize webcam capture")?;
            if args.next_camera {
                webcam.switch_device().context("Failed to switch camera")?;
            }
            Box::new(webcam)
        }
    };
    let (width, height) = capture.resolution();
    tracing::info!("Capture: {}x{}", width, height);

    // Initialize output
    let sink: Box<dyn OutputSink> = match &args.png_dir {
        Some(dir) => Box::new(PngSequence::new(dir, width, height)?),
        None => Box::new(
            V4L2Output::new(&args.output_device, width, height)
                .context("Failed to initialize v4l2loopback output")?,
        ),
    };

    let backend: Box<dyn TrackerBackend> = match args.backend {
        Backend::Flow => Box::new(OpticalFlowBackend::new(FlowConfig {
            grid: args.grid,
            ..FlowConfig::default()
        })),
        Backend::Marker => Box::new(MarkerBackend::new(DarkQuadLocator::default())),
    };
    let config = PipelineConfig {
        ransac: RansacConfig {
            inlier_threshold: args.ransac_threshold,
            ..RansacConfig::default()
        },
        opacity: args.opacity,
        ..PipelineConfig::default()
    };
    let mut pipeline = AlignmentPipeline::new(config, backend, (width, height));
    pipeline.set_rotation(args.rotation);

    let mut session = Session::new(capture, pipeline, sink, FrameClock::new(args.fps));
    session.show_markers(args.show_markers);
    tracing::info!(
        "Target FPS: {} ({:?} per frame)",
        args.fps,
        session.clock().period()
    );

    if let Some(path) = &args.reference {
        let reference = ReferenceImage::open(path)
            .with_context(|| format!("Failed to load reference {}", path.display()))?;
        session.set_reference(reference);
    } else {
        tracing::info!("No reference image, passing video through");
    }

    if let Some(text) = &args.corners {
        let corners = parse_corners(text)?;
        let display = (
            args.display_width.unwrap_or(width),
            args.display_height.unwrap_or(height),
        );
        let pipeline = session.pipeline_mut();
        pipeline
            .begin_point_selection()
            .context("Cannot select corners")?;
        for corner in corners {
            if let ClickOutcome::Completed(points) = pipeline.click(corner, display)? {
                tracing::info!("Corners in video space: {:?}", points);
            }
        }
    }

    // Main loop
    let result = run_loop(
        &mut session,
        args.max_frames,
        args.fps.max(1) * NOT_READY_SECONDS,
    );
    session.shutdown()?;
    result
}

fn run_loop(session: &mut Session, max_frames: Option<u64>, max_not_ready: u32) -> Result<()> {
    let mut frame_count = 0u64;
    let mut not_ready = 0u32;
    let mut totals = FrameTimings::default();
    let mut warned_reselect = false;

    tracing::info!("Starting main loop");
    tracing::info!("Press Ctrl+C to stop");

    loop {
        if max_frames.is_some_and(|max| frame_count >= max) {
            tracing::info!("Reached {} frames", frame_count);
            return Ok(());
        }

        let timings = match session.tick()? {
            TickReport::Stopped => return Ok(()),
            TickReport::NotReady => {
                not_ready += 1;
                if not_ready >= max_not_ready {
                    bail!("Video source delivered no frames for {} ticks", not_ready);
                }
                continue;
            }
            TickReport::Rendered { outcome, timings } => {
                not_ready = 0;
                tracing::debug!("Cycle: {:?}", outcome);
                timings
            }
        };
        totals.accumulate(&timings);
        frame_count += 1;

        let pipeline = session.pipeline();
        if pipeline.needs_reselection() && !warned_reselect {
            tracing::warn!("Tracking lost for too long, re-select the sheet corners");
            warned_reselect = true;
        } else if pipeline.state() == PipelineState::Tracking {
            warned_reselect = false;
        }

        // Log stats every 30 frames
        if frame_count % 30 == 0 {
            let avg = |d: Duration| d.as_secs_f64() * 1000.0 / frame_count as f64;
            let total_ms = avg(totals.total());
            tracing::info!(
                "Frame {}: sample={:.1}ms, track={:.1}ms, render={:.1}ms, output={:.1}ms, \
                 total={:.1}ms, fps={:.1}, state={:?}",
                frame_count,
                avg(totals.sample),
                avg(totals.track),
                avg(totals.render),
                avg(totals.output),
                total_ms,
                1000.0 / total_ms,
                pipeline.state()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    /// A stream that never delivers a frame.
    struct ClosedStream;

    impl CaptureSource for ClosedStream {
        fn capture_frame(&mut self) -> Result<Option<RgbImage>> {
            Ok(None)
        }
        fn resolution(&self) -> (u32, u32) {
            (8, 8)
        }
        fn release(&mut self) -> Result<()> {
            Ok(())
        }
        fn active_tracks(&self) -> usize {
            0
        }
    }

    struct Discard;

    impl OutputSink for Discard {
        fn write_frame(&mut self, _frame: &RgbImage) -> Result<()> {
            Ok(())
        }
        fn resolution(&self) -> (u32, u32) {
            (8, 8)
        }
    }

    #[test]
    fn frameless_source_ends_the_loop() {
        let backend = Box::new(MarkerBackend::new(DarkQuadLocator::default()));
        let pipeline = AlignmentPipeline::new(PipelineConfig::default(), backend, (8, 8));
        let mut session = Session::new(
            Box::new(ClosedStream),
            pipeline,
            Box::new(Discard),
            FrameClock::new(1000),
        );
        let err = run_loop(&mut session, Some(100), 5).unwrap_err();
        assert!(err.to_string().contains("no frames for 5 ticks"), "{err}");
    }

    #[test]
    fn parses_four_corners() {
        let corners = parse_corners("10,20 300,22.5  310,400 5,390").unwrap();
        assert_eq!(corners.len(), 4);
        assert_eq!(corners[1], ScreenPoint::new(300.0, 22.5));
    }

    #[test]
    fn rejects_malformed_corners() {
        assert!(parse_corners("10,20 30,40 50,60").is_err());
        assert!(parse_corners("10;20 30,40 50,60 70,80").is_err());
        assert!(parse_corners("a,1 2,3 4,5 6,7").is_err());
    }
}
