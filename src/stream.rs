//! Buffer stream
//!
//! The object a renderer talks to. A stream owns one exchange strategy for its
//! whole life and routes the render thread's requests and the I/O thread's
//! deliveries into it. The stream's own lock only guards bookkeeping (size,
//! swap interval, the CPU mapping) and is never held while the strategy or
//! the server may block.

use crate::buffer::{ClientBuffer, ClientBufferFactory, MemoryRegion};
use crate::depository::CLIENT_BUFFER_CACHE_SIZE;
use crate::error::{Result, StreamError};
use crate::exchange::{DoneCallback, Exchange, PingPongExchange, VaultExchange};
use crate::perf::PerfReport;
use crate::rpc::{DisplayServer, ServerRequests};
use crate::vault::BufferVault;
use crate::wait_handle::WaitHandle;
use serde::{Deserialize, Serialize};
use sluice_ipc::{
    BufferRecord, BufferStreamId, BufferStreamReply, BufferUsage, PixelFormat, ScreencastId,
    Size, StreamConfiguration,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

/// Whether the stream produces frames or consumes them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    #[default]
    Producer,
    Screencast,
}

/// Client-side stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// Surface name passed to the perf report
    pub name: String,
    /// Buffers a vault allocates up front
    pub buffer_count: usize,
    /// Buffers the ping-pong depository keeps around
    pub cache_size: usize,
    pub usage: BufferUsage,
    /// Size requested when the server does not push a first buffer
    pub ideal_size: Size,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            name: "sluice".to_string(),
            buffer_count: 3,
            cache_size: CLIENT_BUFFER_CACHE_SIZE,
            usage: BufferUsage::Software,
            ideal_size: Size::new(640, 480),
        }
    }
}

/// Surface attributes a client may try to configure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceAttrib {
    SwapInterval,
    Focus,
    Dpi,
    Visibility,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceParameters {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub buffer_usage: BufferUsage,
}

struct StreamState {
    name: String,
    size: Size,
    format: PixelFormat,
    usage: BufferUsage,
    swap_interval: i32,
    secured_region: Option<Arc<MemoryRegion>>,
    error_message: String,
    disconnected: bool,
}

struct Inner {
    server: Arc<dyn DisplayServer>,
    exchange: Exchange,
    /// Set when the exchange is backed by our own vault
    vault: Option<Arc<BufferVault>>,
    perf: Arc<dyn PerfReport>,
    mode: StreamMode,
    id: BufferStreamId,
    state: Mutex<StreamState>,
    screencast_handle: WaitHandle,
    interval_handle: WaitHandle,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reject(&self, error: &str) -> StreamError {
        let err = StreamError::BufferDelivery(error.to_string());
        warn!("Stream {:?} rejected buffer: {}", self.id, error);
        self.lock().error_message = err.to_string();
        err
    }

    /// Size and format a record should be imported with
    fn import_params(&self, record: &BufferRecord) -> (Size, PixelFormat) {
        let mut state = self.lock();
        if let Some(size) = record.size() {
            state.size = size;
        }
        (state.size, state.format)
    }

    fn process_frame(&self, record: BufferRecord) -> Result<()> {
        if let Some(error) = &record.error {
            return Err(self.reject(error));
        }
        let id = record.buffer_id;
        let (size, format) = self.import_params(&record);
        self.exchange.receive_frame(record, size, format)?;
        self.perf.begin_frame(id);
        Ok(())
    }

    fn check_connected(&self) -> Result<()> {
        if self.lock().disconnected {
            Err(StreamError::Disconnected)
        } else {
            Ok(())
        }
    }

    fn check_producer(&self, what: &str) -> Result<()> {
        match self.mode {
            StreamMode::Producer => Ok(()),
            StreamMode::Screencast => Err(StreamError::misuse(format!(
                "{what} is not supported on screencast streams"
            ))),
        }
    }
}

/// A stream of buffers shared with the display server
pub struct BufferStream {
    inner: Arc<Inner>,
}

impl BufferStream {
    /// Set up a stream from the server's creation reply.
    ///
    /// A reply that carries a first buffer selects the ping-pong exchange;
    /// otherwise a producer stream allocates its own buffers through a vault.
    pub fn new(
        server: Arc<dyn DisplayServer>,
        factory: Arc<dyn ClientBufferFactory>,
        reply: BufferStreamReply,
        mode: StreamMode,
        options: &StreamOptions,
        perf: Arc<dyn PerfReport>,
    ) -> Result<Self> {
        if let Some(error) = reply.error {
            return Err(StreamError::Creation(error));
        }
        let id = reply
            .id
            .ok_or_else(|| StreamError::Creation("server did not assign a stream id".into()))?;
        let format = reply.pixel_format;

        let (exchange, vault, size, first_id) = match (mode, reply.buffer) {
            (_, Some(first)) => {
                if let Some(error) = &first.error {
                    return Err(StreamError::Creation(error.clone()));
                }
                let first_id = first.buffer_id;
                let size = first.size().unwrap_or(options.ideal_size);
                let exchange = PingPongExchange::new(
                    server.clone(),
                    factory,
                    options.cache_size,
                    first,
                    size,
                    format,
                )?;
                (Exchange::PingPong(exchange), None, size, Some(first_id))
            }
            (StreamMode::Screencast, None) => {
                return Err(StreamError::Creation(
                    "screencast stream created without a buffer".into(),
                ));
            }
            (StreamMode::Producer, None) => {
                let requests = Arc::new(ServerRequests::new(server.clone(), id));
                let vault = Arc::new(BufferVault::new(
                    factory,
                    requests,
                    options.ideal_size,
                    format,
                    reply.usage,
                    options.buffer_count,
                ));
                let exchange = VaultExchange::new(vault.clone(), server.clone());
                (Exchange::Vault(exchange), Some(vault), options.ideal_size, None)
            }
        };

        info!(
            "Created {:?} stream {:?} ({}, {:?}, {:?})",
            mode,
            id,
            exchange.name(),
            size,
            format
        );
        perf.name_surface(&options.name);
        if let Some(first_id) = first_id {
            perf.begin_frame(first_id);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                server,
                exchange,
                vault,
                perf,
                mode,
                id,
                state: Mutex::new(StreamState {
                    name: options.name.clone(),
                    size,
                    format,
                    usage: reply.usage,
                    swap_interval: 1,
                    secured_region: None,
                    error_message: String::new(),
                    disconnected: false,
                }),
                screencast_handle: WaitHandle::new(),
                interval_handle: WaitHandle::new(),
            }),
        })
    }

    // ========================================================================
    // Render thread
    // ========================================================================

    /// Hand back the current buffer and ask for the next one.
    ///
    /// `done` runs once the next buffer is current, or once the stream can
    /// no longer deliver one. The returned handle resolves at the same time.
    pub fn next_buffer(&self, done: DoneCallback) -> Result<&WaitHandle> {
        let inner = &self.inner;
        if inner.mode == StreamMode::Producer {
            inner.check_connected()?;
        }
        // may withdraw, so not under the stream lock
        let current_id = inner.exchange.current_id().ok();

        let (size, format) = {
            let mut state = inner.lock();
            if let Some(id) = current_id {
                inner.perf.end_frame(id);
            }
            state.secured_region = None;
            (state.size, state.format)
        };

        match inner.mode {
            StreamMode::Producer => inner.exchange.submit(done, size, format, inner.id),
            StreamMode::Screencast => self.request_screencast(done),
        }
    }

    fn request_screencast(&self, done: DoneCallback) -> Result<&WaitHandle> {
        let inner = &self.inner;
        inner.check_connected()?;
        inner.screencast_handle.expect_result()?;

        let weak: Weak<Inner> = Arc::downgrade(inner);
        inner.server.screencast_buffer(
            ScreencastId(inner.id.0),
            Box::new(move |result| {
                let Some(inner) = weak.upgrade() else {
                    done();
                    return;
                };
                if let Err(e) = result.and_then(|record| inner.process_frame(record)) {
                    warn!("Screencast frame for stream {:?} failed: {}", inner.id, e);
                }
                done();
                inner.screencast_handle.result_received();
            }),
        );
        Ok(&inner.screencast_handle)
    }

    /// [`next_buffer`](Self::next_buffer) and block until it completes
    pub fn request_and_wait_for_next_buffer(&self) -> Result<()> {
        self.next_buffer(Box::new(|| {}))?.wait_for_all();
        self.inner.check_connected()
    }

    pub fn current_buffer(&self) -> Result<Arc<dyn ClientBuffer>> {
        self.inner.exchange.current()
    }

    pub fn current_buffer_id(&self) -> Result<u32> {
        self.inner.exchange.current_id()
    }

    /// Map the current buffer for CPU writes. Repeated calls share one
    /// mapping until it is released.
    pub fn secure_for_cpu_write(&self) -> Result<Arc<MemoryRegion>> {
        if let Some(region) = self.inner.lock().secured_region.clone() {
            return Ok(region);
        }
        let region = self.current_buffer()?.secure_for_cpu_write()?;
        let mut state = self.inner.lock();
        Ok(state.secured_region.get_or_insert(region).clone())
    }

    pub fn release_cpu_region(&self) {
        self.inner.lock().secured_region = None;
    }

    // ========================================================================
    // I/O thread
    // ========================================================================

    /// A buffer pushed by the server
    pub fn buffer_available(&self, record: BufferRecord) -> Result<()> {
        let inner = &self.inner;
        if let Some(error) = &record.error {
            return Err(inner.reject(error));
        }
        let id = record.buffer_id;
        let (size, format) = inner.import_params(&record);
        inner.exchange.deposit(record, size, format)?;
        inner.perf.begin_frame(id);
        Ok(())
    }

    /// The connection to the server is gone; wake everything that waits on it
    pub fn buffer_unavailable(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.lock();
            state.disconnected = true;
            state.error_message = StreamError::Disconnected.to_string();
        }
        info!("Stream {:?} lost its server connection", inner.id);

        inner.exchange.lost_connection();
        if let Some(vault) = &inner.vault {
            vault.disconnected();
        }
        inner.exchange.force_resolve();
        inner.screencast_handle.result_received();
        inner.interval_handle.result_received();
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Ask the server for a new swap interval and wait for acknowledgment
    pub fn set_swap_interval(&self, interval: i32) -> Result<()> {
        let inner = &self.inner;
        inner.check_producer("swap interval")?;
        inner.check_connected()?;
        inner.interval_handle.expect_result()?;

        let weak: Weak<Inner> = Arc::downgrade(inner);
        inner.server.configure_buffer_stream(
            StreamConfiguration::swap_interval(inner.id, interval),
            Box::new(move |result| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(()) => inner.lock().swap_interval = interval,
                    Err(e) => warn!("Failed to set swap interval {}: {}", interval, e),
                }
                inner.interval_handle.result_received();
            }),
        );
        inner.interval_handle.wait_for_all();
        inner.check_connected()
    }

    pub fn request_and_wait_for_configure(&self, attrib: SurfaceAttrib, value: i32) -> Result<()> {
        match attrib {
            SurfaceAttrib::SwapInterval => self.set_swap_interval(value),
            other => Err(StreamError::misuse(format!(
                "attribute {other:?} can not be configured on a buffer stream"
            ))),
        }
    }

    /// Ask the server for a new buffer scale and wait for acknowledgment
    pub fn set_scale(&self, scale: f32) -> Result<()> {
        let inner = &self.inner;
        inner.check_producer("scale")?;
        inner.check_connected()?;
        inner.exchange.set_scale(scale, inner.id)?.wait_for_all();
        inner.check_connected()
    }

    pub fn set_size(&self, size: Size) {
        debug!("Stream {:?} resized to {:?}", self.inner.id, size);
        self.inner.lock().size = size;
        self.inner.exchange.set_size(size);
    }

    pub fn set_buffer_cache_size(&self, cache_size: usize) {
        self.inner.exchange.set_buffer_cache_size(cache_size);
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn swap_interval(&self) -> i32 {
        self.inner.lock().swap_interval
    }

    pub fn scale(&self) -> f32 {
        self.inner.exchange.scale()
    }

    pub fn parameters(&self) -> SurfaceParameters {
        let state = self.inner.lock();
        SurfaceParameters {
            name: state.name.clone(),
            width: state.size.width,
            height: state.size.height,
            pixel_format: state.format,
            buffer_usage: state.usage,
        }
    }

    pub fn rpc_id(&self) -> BufferStreamId {
        self.inner.id
    }

    pub fn mode(&self) -> StreamMode {
        self.inner.mode
    }

    /// False once the server connection is lost
    pub fn valid(&self) -> bool {
        !self.inner.lock().disconnected
    }

    /// The last error this stream ran into, empty if none
    pub fn error_message(&self) -> String {
        self.inner.lock().error_message.clone()
    }
}

impl Drop for BufferStream {
    fn drop(&mut self) {
        let inner = &self.inner;
        inner.exchange.force_resolve();
        inner.screencast_handle.result_received();
        inner.interval_handle.result_received();
    }
}
