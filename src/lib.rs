//! Sluice - client-side buffer streams
//!
//! A [`BufferStream`] hands rendered buffers to a display server and gets the
//! next one back, using one of two exchange strategies negotiated when the
//! stream is created. Wire records and descriptor passing live in
//! `sluice-ipc`.

pub mod buffer;
pub mod depository;
pub mod error;
pub mod exchange;
pub mod perf;
pub mod rpc;
pub mod stream;
pub mod vault;
pub mod wait_handle;

#[cfg(test)]
mod test_support;

pub use buffer::{BufferInfo, ClientBuffer, ClientBufferFactory, MemoryRegion, ShmBufferFactory};
pub use error::{Result, StreamError};
pub use exchange::{DoneCallback, Exchange};
pub use perf::{NullPerfReport, PerfReport, TracingPerfReport};
pub use rpc::{Completion, DisplayServer};
pub use stream::{BufferStream, StreamMode, StreamOptions, SurfaceAttrib, SurfaceParameters};
pub use vault::{BufferVault, Vault};
pub use wait_handle::WaitHandle;
