//! sluice-demo - buffer stream latency demo
//!
//! Renders into a buffer stream backed by an in-process loopback server and
//! reports how long each buffer takes to come back.

mod config;
mod loopback;

use anyhow::{Context, Result};
use config::{Config, DemoConfig};
use loopback::LoopbackServer;
use sluice::{BufferStream, ShmBufferFactory, StreamError, StreamMode, TracingPerfReport};
use sluice_ipc::{read_record, ChannelError};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Round-trip times of submitted buffers
#[derive(Debug, Default)]
struct LatencyStats {
    frames: u32,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
}

impl LatencyStats {
    fn record(&mut self, latency: Duration) {
        self.frames += 1;
        self.total += latency;
        self.min = Some(self.min.map_or(latency, |min| min.min(latency)));
        self.max = self.max.max(latency);
    }

    fn average(&self) -> Duration {
        self.total.checked_div(self.frames).unwrap_or_default()
    }
}

/// Fill a mapped buffer with one 32-bit color
fn fill(pixels: &mut [u8], color: u32) {
    match bytemuck::try_cast_slice_mut::<u8, u32>(pixels) {
        Ok(words) => words.fill(color),
        Err(_) => {
            for pixel in pixels.chunks_exact_mut(4) {
                pixel.copy_from_slice(&color.to_ne_bytes());
            }
        }
    }
}

/// I/O thread: feed records from the server into the stream
fn pump_buffers(socket: UnixStream, stream: Arc<BufferStream>) {
    loop {
        match read_record(&socket) {
            Ok(record) => {
                if let Err(e) = stream.buffer_available(record) {
                    warn!("Dropped buffer: {}", e);
                }
            }
            Err(ChannelError::Closed) => {
                info!("Server closed the buffer socket");
                break;
            }
            Err(e) => {
                error!("Failed to read buffer: {}", e);
                break;
            }
        }
    }
    stream.buffer_unavailable();
}

fn render_loop(stream: &BufferStream, demo: &DemoConfig, stop: &AtomicBool) -> Result<LatencyStats> {
    stream
        .set_swap_interval(demo.swap_interval)
        .context("Failed to set swap interval")?;

    let mut stats = LatencyStats::default();
    for frame in 0..demo.frames {
        if stop.load(Ordering::Relaxed) {
            info!("Stopping after {} frames", frame);
            break;
        }

        let region = stream
            .secure_for_cpu_write()
            .context("Failed to map current buffer")?;
        let shade = (frame % 256) as u32;
        region.with_pixels(|pixels| fill(pixels, 0xff00_0000 | shade << 16 | shade << 8 | shade));
        drop(region);

        let started = Instant::now();
        match stream.request_and_wait_for_next_buffer() {
            Ok(()) => {}
            Err(StreamError::Disconnected) => {
                warn!("Server went away after {} frames", frame);
                break;
            }
            Err(e) => return Err(e).context("Failed to exchange buffer"),
        }
        let latency = started.elapsed();
        debug!("Frame {} came back after {:?}", frame, latency);
        stats.record(latency);
    }
    Ok(stats)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sluice=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting sluice latency demo");
    let config = Config::load().context("Failed to load configuration")?;

    let (server, reply, socket) =
        LoopbackServer::start(&config).context("Failed to start loopback server")?;
    let perf = Arc::new(TracingPerfReport::new(Duration::from_secs(
        config.demo.report_interval_secs,
    )));
    let stream = Arc::new(
        BufferStream::new(
            server.clone(),
            Arc::new(ShmBufferFactory),
            reply,
            StreamMode::Producer,
            &config.stream,
            perf,
        )
        .context("Failed to create buffer stream")?,
    );
    info!("Stream parameters: {:?}", stream.parameters());

    let io = tokio::task::spawn_blocking({
        let stream = stream.clone();
        move || pump_buffers(socket, stream)
    });

    let stop = Arc::new(AtomicBool::new(false));
    let mut render = tokio::task::spawn_blocking({
        let stream = stream.clone();
        let stop = stop.clone();
        let demo = config.demo.clone();
        move || render_loop(&stream, &demo, &stop)
    });

    let stats = tokio::select! {
        result = &mut render => result.context("Render loop panicked")??,
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down gracefully");
            stop.store(true, Ordering::Relaxed);
            render.await.context("Render loop panicked")??
        }
    };

    server.shutdown();
    io.await.context("I/O thread panicked")?;

    info!(
        "{} frames over {:?}: average {:?}, min {:?}, max {:?}",
        stats.frames,
        config.demo.protocol,
        stats.average(),
        stats.min.unwrap_or_default(),
        stats.max
    );
    Ok(())
}
