//! Frame timing reports
//!
//! A stream opens a frame when a buffer arrives and closes it when the buffer
//! is submitted again.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::info;

pub trait PerfReport: Send + Sync {
    fn name_surface(&self, name: &str);
    fn begin_frame(&self, buffer_id: u32);
    fn end_frame(&self, buffer_id: u32);
}

/// Reports nothing
#[derive(Debug, Default)]
pub struct NullPerfReport;

impl PerfReport for NullPerfReport {
    fn name_surface(&self, _name: &str) {}
    fn begin_frame(&self, _buffer_id: u32) {}
    fn end_frame(&self, _buffer_id: u32) {}
}

// ============================================================================
// Frame counter
// ============================================================================

/// Rolling frames-per-second count
#[derive(Debug)]
pub struct FrameCounter {
    last_report: Instant,
    frame_count: u32,
    current_fps: f64,
    report_interval: Duration,
}

impl FrameCounter {
    pub fn new(report_interval: Duration) -> Self {
        Self {
            last_report: Instant::now(),
            frame_count: 0,
            current_fps: 0.0,
            report_interval,
        }
    }

    /// Count one frame; returns a fresh measurement once per interval
    pub fn tick(&mut self) -> Option<f64> {
        self.frame_count += 1;

        let elapsed = self.last_report.elapsed();
        if elapsed >= self.report_interval {
            self.current_fps = self.frame_count as f64 / elapsed.as_secs_f64();
            self.frame_count = 0;
            self.last_report = Instant::now();
            Some(self.current_fps)
        } else {
            None
        }
    }

    pub fn fps(&self) -> f64 {
        self.current_fps
    }
}

impl Default for FrameCounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

// ============================================================================
// Tracing report
// ============================================================================

#[derive(Default)]
struct Frames {
    surface: String,
    counter: FrameCounter,
    /// Frames currently being rendered, keyed by buffer id
    open: HashMap<u32, Instant>,
    render_time: Duration,
    rendered: u32,
}

/// Logs frame rate and average render time through `tracing`
#[derive(Default)]
pub struct TracingPerfReport {
    frames: Mutex<Frames>,
}

impl TracingPerfReport {
    pub fn new(report_interval: Duration) -> Self {
        Self {
            frames: Mutex::new(Frames {
                counter: FrameCounter::new(report_interval),
                ..Default::default()
            }),
        }
    }

    pub fn fps(&self) -> f64 {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .counter
            .fps()
    }
}

impl PerfReport for TracingPerfReport {
    fn name_surface(&self, name: &str) {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner).surface = name.to_string();
    }

    fn begin_frame(&self, buffer_id: u32) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open
            .insert(buffer_id, Instant::now());
    }

    fn end_frame(&self, buffer_id: u32) {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(started) = frames.open.remove(&buffer_id) {
            frames.render_time += started.elapsed();
            frames.rendered += 1;
        }
        if let Some(fps) = frames.counter.tick() {
            let average = frames
                .render_time
                .checked_div(frames.rendered)
                .unwrap_or_default();
            info!("{}: {:.1} FPS, {:?} per frame", frames.surface, fps, average);
            frames.render_time = Duration::ZERO;
            frames.rendered = 0;
        }
    }
}
