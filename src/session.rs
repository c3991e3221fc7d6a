//! Frame loop: one pipeline cycle per display tick, and orderly teardown.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::capture::{CaptureSource, FrameSampler, Sample};
use crate::output::OutputSink;
use crate::overlay::{OverlayRenderer, ReferenceImage};
use crate::pipeline::{AlignmentPipeline, CycleOutcome};

/// Stand-in for the host refresh callback. At most one tick is pending.
#[derive(Debug)]
pub struct FrameClock {
    period: Duration,
    deadline: Option<Instant>,
    last_tick: Option<Instant>,
}

impl FrameClock {
    pub fn new(fps: u32) -> Self {
        Self {
            period: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            deadline: None,
            last_tick: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Requests the next tick. Returns false if one is already pending.
    pub fn schedule(&mut self) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        let now = Instant::now();
        let due = self.last_tick.map_or(now, |t| (t + self.period).max(now));
        self.deadline = Some(due);
        true
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Number of pending ticks, 0 or 1.
    pub fn pending(&self) -> usize {
        usize::from(self.deadline.is_some())
    }

    /// Sleeps until the pending tick is due and consumes it. Returns false
    /// when nothing was scheduled.
    pub fn wait(&mut self) -> bool {
        let Some(due) = self.deadline.take() else {
            return false;
        };
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }
        self.last_tick = Some(Instant::now());
        true
    }
}

/// Time spent in each stage of one tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameTimings {
    pub sample: Duration,
    pub track: Duration,
    pub render: Duration,
    pub output: Duration,
}

impl FrameTimings {
    pub fn total(&self) -> Duration {
        self.sample + self.track + self.render + self.output
    }

    pub fn accumulate(&mut self, other: &FrameTimings) {
        self.sample += other.sample;
        self.track += other.track;
        self.render += other.render;
        self.output += other.output;
    }
}

#[derive(Debug)]
pub enum TickReport {
    /// No tick was pending; the session has been shut down.
    Stopped,
    /// The camera had no frame yet; the next tick is scheduled.
    NotReady,
    Rendered {
        outcome: CycleOutcome,
        timings: FrameTimings,
    },
}

/// Owns the camera, the pipeline and the output for one run.
pub struct Session {
    capture: Box<dyn CaptureSource>,
    sampler: FrameSampler,
    pipeline: AlignmentPipeline,
    sink: Box<dyn OutputSink>,
    reference: Option<ReferenceImage>,
    clock: FrameClock,
    show_markers: bool,
}

impl Session {
    pub fn new(
        capture: Box<dyn CaptureSource>,
        pipeline: AlignmentPipeline,
        sink: Box<dyn OutputSink>,
        clock: FrameClock,
    ) -> Self {
        let mut session = Self {
            capture,
            sampler: FrameSampler::new(),
            pipeline,
            sink,
            reference: None,
            clock,
            show_markers: false,
        };
        session.clock.schedule();
        session
    }

    /// Draws the collected corner markers on every output frame.
    pub fn show_markers(&mut self, show: bool) {
        self.show_markers = show;
    }

    pub fn set_reference(&mut self, reference: ReferenceImage) {
        self.pipeline.set_reference(reference.dimensions());
        self.reference = Some(reference);
    }

    pub fn pipeline(&self) -> &AlignmentPipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut AlignmentPipeline {
        &mut self.pipeline
    }

    pub fn capture(&self) -> &dyn CaptureSource {
        self.capture.as_ref()
    }

    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    /// Waits for the pending tick and runs one full cycle on it.
    pub fn tick(&mut self) -> Result<TickReport> {
        if !self.clock.wait() {
            return Ok(TickReport::Stopped);
        }
        let mut timings = FrameTimings::default();

        let start = Instant::now();
        let sample = self.sampler.sample(self.capture.as_mut());
        timings.sample = start.elapsed();
        let (color, gray) = match sample {
            Ok(Sample::Ready { color, gray }) => (color, gray),
            Ok(Sample::NotReady) => {
                self.clock.schedule();
                return Ok(TickReport::NotReady);
            }
            Err(e) => {
                tracing::error!("{}", e);
                return Err(e).context("Failed to sample frame");
            }
        };

        let (width, height) = color.dimensions();
        self.pipeline.set_video_size(width, height);

        let start = Instant::now();
        let outcome = self.pipeline.cycle(gray);
        timings.track = start.elapsed();

        let start = Instant::now();
        let mut frame = match &self.reference {
            Some(reference) => {
                let transform = OverlayRenderer::transform(
                    reference.dimensions(),
                    (width, height),
                    self.pipeline.overlay(),
                )
                .context("Failed to place reference")?;
                OverlayRenderer::composite(&color, &reference.image, &transform)
            }
            None => color,
        };
        if self.show_markers {
            self.pipeline.collector().draw_markers(&mut frame);
        }
        timings.render = start.elapsed();

        let start = Instant::now();
        self.sink
            .write_frame(&frame)
            .context("Failed to write frame")?;
        timings.output = start.elapsed();

        self.clock.schedule();
        Ok(TickReport::Rendered { outcome, timings })
    }

    /// Cancels the pending tick, drops all tracking state, then stops the
    /// camera.
    pub fn shutdown(&mut self) -> Result<()> {
        self.clock.cancel();
        self.pipeline.reset();
        self.capture.release().context("Failed to release camera")?;
        tracing::info!(
            "Session stopped after {} frames, {} camera tracks held",
            self.sampler.sampled(),
            self.capture.active_tracks()
        );
        Ok(())
    }
}
