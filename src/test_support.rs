//! Fakes shared by the unit tests

use crate::buffer::{ClientBuffer, ClientBufferFactory, MemoryRegion};
use crate::error::{Result, StreamError};
use crate::rpc::{Completion, DisplayServer};
use sluice_ipc::{
    BufferAllocation, BufferFlags, BufferRecord, BufferRelease, BufferRequest, PixelFormat, ScreencastId,
    Size, StreamConfiguration,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub(crate) fn record(id: u32, width: u32, height: u32) -> BufferRecord {
    BufferRecord::new(id, Size::new(width, height), width * 4, PixelFormat::Argb8888)
}

#[derive(Debug)]
pub(crate) struct FakeBuffer {
    state: Mutex<(Size, u32, PixelFormat)>,
}

impl ClientBuffer for FakeBuffer {
    fn size(&self) -> Size {
        self.state.lock().unwrap().0
    }

    fn stride(&self) -> u32 {
        self.state.lock().unwrap().1
    }

    fn pixel_format(&self) -> PixelFormat {
        self.state.lock().unwrap().2
    }

    fn flags(&self) -> BufferFlags {
        BufferFlags::empty()
    }

    fn update_from(&self, record: BufferRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(size) = record.size() {
            state.0 = size;
            state.1 = record.stride;
        }
        Ok(())
    }

    fn secure_for_cpu_write(&self) -> Result<Arc<MemoryRegion>> {
        let (size, stride, format) = *self.state.lock().unwrap();
        Ok(Arc::new(MemoryRegion::local(size, stride, format)))
    }
}

#[derive(Default)]
pub(crate) struct FakeFactory {
    created: AtomicUsize,
    /// Imports accepted before every further one is refused
    limit: Option<usize>,
}

impl FakeFactory {
    /// A factory that refuses every import
    pub(crate) fn failing() -> Self {
        Self::fail_after(0)
    }

    pub(crate) fn fail_after(accepted: usize) -> Self {
        Self {
            created: AtomicUsize::new(0),
            limit: Some(accepted),
        }
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl ClientBufferFactory for FakeFactory {
    fn create_buffer(
        &self,
        record: BufferRecord,
        size: Size,
        format: PixelFormat,
    ) -> Result<Arc<dyn ClientBuffer>> {
        if self.limit.is_some_and(|limit| self.created() >= limit) {
            return Err(StreamError::Platform("import refused".into()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let stride = if record.stride != 0 {
            record.stride
        } else {
            size.width * format.bytes_per_pixel()
        };
        Ok(Arc::new(FakeBuffer {
            state: Mutex::new((size, stride, format)),
        }))
    }
}

#[derive(Default)]
struct Calls {
    submits: Vec<BufferRequest>,
    allocations: Vec<BufferAllocation>,
    releases: Vec<BufferRelease>,
    configurations: Vec<StreamConfiguration>,
    pending_configurations: Vec<Completion<()>>,
    screencasts: Vec<(ScreencastId, Completion<BufferRecord>)>,
}

/// Records every call; configuration and screencast completions are held
/// until the test releases them.
#[derive(Default)]
pub(crate) struct FakeServer {
    calls: Mutex<Calls>,
}

impl FakeServer {
    fn calls(&self) -> MutexGuard<'_, Calls> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn submits(&self) -> Vec<BufferRequest> {
        self.calls().submits.clone()
    }

    pub(crate) fn allocations(&self) -> Vec<BufferAllocation> {
        self.calls().allocations.clone()
    }

    pub(crate) fn releases(&self) -> Vec<BufferRelease> {
        self.calls().releases.clone()
    }

    pub(crate) fn configurations(&self) -> Vec<StreamConfiguration> {
        self.calls().configurations.clone()
    }

    /// Acknowledge every outstanding configuration
    pub(crate) fn ack_configurations(&self) {
        let pending: Vec<_> = self.calls().pending_configurations.drain(..).collect();
        for done in pending {
            done(Ok(()));
        }
    }

    pub(crate) fn screencast_requests(&self) -> usize {
        self.calls().screencasts.len()
    }

    /// Answer the oldest screencast request
    pub(crate) fn deliver_screencast(&self, result: Result<BufferRecord>) {
        let (_, done) = self.calls().screencasts.remove(0);
        done(result);
    }
}

impl DisplayServer for FakeServer {
    fn submit_buffer(&self, request: BufferRequest, done: Completion<()>) {
        self.calls().submits.push(request);
        done(Ok(()));
    }

    fn allocate_buffers(&self, request: BufferAllocation, done: Completion<()>) {
        self.calls().allocations.push(request);
        done(Ok(()));
    }

    fn release_buffers(&self, request: BufferRelease, done: Completion<()>) {
        self.calls().releases.push(request);
        done(Ok(()));
    }

    fn configure_buffer_stream(&self, configuration: StreamConfiguration, done: Completion<()>) {
        let mut calls = self.calls();
        calls.configurations.push(configuration);
        calls.pending_configurations.push(done);
    }

    fn screencast_buffer(&self, id: ScreencastId, done: Completion<BufferRecord>) {
        self.calls().screencasts.push((id, done));
    }
}
