//! Buffer exchange strategies
//!
//! A stream runs exactly one strategy for its whole life, picked from what
//! the server negotiated at creation:
//! - [`PingPongExchange`]: the server owns a small pool and trades one buffer
//!   back for every buffer submitted.
//! - [`VaultExchange`]: the client allocates and frees buffers itself and can
//!   keep several in flight.
//!
//! The strategy is the only component that touches the buffer pool.

mod ping_pong;
mod vault;

pub use ping_pong::PingPongExchange;
pub use vault::VaultExchange;

use crate::buffer::ClientBuffer;
use crate::error::Result;
use crate::rpc::DisplayServer;
use crate::wait_handle::WaitHandle;
use sluice_ipc::{BufferRecord, BufferStreamId, PixelFormat, Size, StreamConfiguration};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Called once the next buffer is ready (or the stream is defunct)
pub type DoneCallback = Box<dyn FnOnce() + Send + 'static>;

pub enum Exchange {
    PingPong(PingPongExchange),
    Vault(VaultExchange),
}

impl Exchange {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PingPong(_) => "exchange",
            Self::Vault(_) => "vault",
        }
    }

    pub fn current(&self) -> Result<Arc<dyn ClientBuffer>> {
        match self {
            Self::PingPong(exchange) => exchange.current(),
            Self::Vault(exchange) => exchange.current(),
        }
    }

    pub fn current_id(&self) -> Result<u32> {
        match self {
            Self::PingPong(exchange) => exchange.current_id(),
            Self::Vault(exchange) => exchange.current_id(),
        }
    }

    pub fn submit(
        &self,
        done: DoneCallback,
        size: Size,
        format: PixelFormat,
        stream_id: BufferStreamId,
    ) -> Result<&WaitHandle> {
        match self {
            Self::PingPong(exchange) => exchange.submit(done, size, format, stream_id),
            Self::Vault(exchange) => exchange.submit(done),
        }
    }

    /// A buffer pushed by the server
    pub fn deposit(&self, record: BufferRecord, size: Size, format: PixelFormat) -> Result<()> {
        match self {
            Self::PingPong(exchange) => exchange.deposit(record, size, format),
            Self::Vault(exchange) => exchange.deposit(record),
        }
    }

    /// A frame pulled by a screencast stream; becomes current right away
    pub fn receive_frame(
        &self,
        record: BufferRecord,
        size: Size,
        format: PixelFormat,
    ) -> Result<()> {
        match self {
            Self::PingPong(exchange) => exchange.adopt(record, size, format),
            Self::Vault(exchange) => exchange.deposit(record),
        }
    }

    pub fn set_size(&self, size: Size) {
        match self {
            Self::PingPong(_) => {}
            Self::Vault(exchange) => exchange.set_size(size),
        }
    }

    pub fn set_scale(&self, scale: f32, stream_id: BufferStreamId) -> Result<&WaitHandle> {
        match self {
            Self::PingPong(exchange) => exchange.set_scale(scale, stream_id),
            Self::Vault(exchange) => exchange.set_scale(scale, stream_id),
        }
    }

    pub fn scale(&self) -> f32 {
        match self {
            Self::PingPong(exchange) => exchange.scale(),
            Self::Vault(exchange) => exchange.scale(),
        }
    }

    pub fn lost_connection(&self) {
        match self {
            Self::PingPong(exchange) => exchange.lost_connection(),
            Self::Vault(_) => {}
        }
    }

    pub fn set_buffer_cache_size(&self, cache_size: usize) {
        match self {
            Self::PingPong(exchange) => exchange.set_buffer_cache_size(cache_size),
            Self::Vault(_) => {}
        }
    }

    /// Wake anything still blocked on this strategy
    pub(crate) fn force_resolve(&self) {
        match self {
            Self::PingPong(exchange) => exchange.force_resolve(),
            Self::Vault(exchange) => exchange.force_resolve(),
        }
    }
}

// ============================================================================
// Scale negotiation (shared by both strategies)
// ============================================================================

pub(crate) struct ScaleState {
    handle: WaitHandle,
    scale: Mutex<f32>,
}

impl ScaleState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            handle: WaitHandle::new(),
            scale: Mutex::new(1.0),
        })
    }

    /// Ask the server for a new scale; the handle resolves on acknowledgment
    pub(crate) fn request(
        self: &Arc<Self>,
        server: &dyn DisplayServer,
        stream_id: BufferStreamId,
        scale: f32,
    ) -> Result<()> {
        self.handle.expect_result()?;
        debug!("Requesting scale {} for stream {:?}", scale, stream_id);

        let state = Arc::downgrade(self);
        server.configure_buffer_stream(
            StreamConfiguration::scale(stream_id, scale),
            Box::new(move |result| {
                let Some(state) = state.upgrade() else {
                    return;
                };
                match result {
                    Ok(()) => *state.scale.lock().unwrap_or_else(PoisonError::into_inner) = scale,
                    Err(e) => warn!("Failed to set scale {}: {}", scale, e),
                }
                state.handle.result_received();
            }),
        );
        Ok(())
    }

    pub(crate) fn scale(&self) -> f32 {
        *self.scale.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn handle(&self) -> &WaitHandle {
        &self.handle
    }
}
