//! RPC transport seam.
//!
//! Every call takes a request message and completes asynchronously through a
//! boxed callback, usually on the connection's I/O thread. Completions for
//! distinct calls may arrive in any order.

use crate::error::Result;
use sluice_ipc::{
    BufferAllocation, BufferParameters, BufferRecord, BufferRelease, BufferRequest,
    BufferStreamId, BufferUsage, PixelFormat, ScreencastId, Size, StreamConfiguration,
};
use std::sync::Arc;
use tracing::debug;

/// Completion callback of one RPC call
pub type Completion<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// The display server as seen by a buffer stream
pub trait DisplayServer: Send + Sync {
    fn submit_buffer(&self, request: BufferRequest, done: Completion<()>);
    fn allocate_buffers(&self, request: BufferAllocation, done: Completion<()>);
    fn release_buffers(&self, request: BufferRelease, done: Completion<()>);
    fn configure_buffer_stream(&self, configuration: StreamConfiguration, done: Completion<()>);
    fn screencast_buffer(&self, id: ScreencastId, done: Completion<BufferRecord>);
}

/// Completion for calls whose acknowledgment nobody waits for
pub fn fire_and_forget(call: &'static str) -> Completion<()> {
    Box::new(move |result| {
        if let Err(e) = result {
            debug!("{} failed: {}", call, e);
        }
    })
}

// ============================================================================
// Buffer requests for the vault protocol
// ============================================================================

/// Buffer management calls a vault makes on behalf of one stream
pub trait ServerBufferRequests: Send + Sync {
    fn allocate_buffer(&self, size: Size, format: PixelFormat, usage: BufferUsage);
    fn free_buffer(&self, buffer_id: u32);
    fn submit_buffer(&self, buffer_id: u32);
}

/// [`ServerBufferRequests`] over a [`DisplayServer`]
pub struct ServerRequests {
    server: Arc<dyn DisplayServer>,
    stream_id: BufferStreamId,
}

impl ServerRequests {
    pub fn new(server: Arc<dyn DisplayServer>, stream_id: BufferStreamId) -> Self {
        Self { server, stream_id }
    }
}

impl ServerBufferRequests for ServerRequests {
    fn allocate_buffer(&self, size: Size, format: PixelFormat, usage: BufferUsage) {
        let request = BufferAllocation {
            id: self.stream_id,
            buffer_requests: vec![BufferParameters {
                width: size.width,
                height: size.height,
                pixel_format: format,
                usage,
            }],
        };
        self.server
            .allocate_buffers(request, fire_and_forget("allocate_buffers"));
    }

    fn free_buffer(&self, buffer_id: u32) {
        let request = BufferRelease {
            id: self.stream_id,
            buffer_ids: vec![buffer_id],
        };
        self.server
            .release_buffers(request, fire_and_forget("release_buffers"));
    }

    fn submit_buffer(&self, buffer_id: u32) {
        let request = BufferRequest {
            id: self.stream_id,
            buffer_id,
        };
        self.server
            .submit_buffer(request, fire_and_forget("submit_buffer"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeServer;

    #[test]
    fn test_requests_carry_stream_id() {
        let server = Arc::new(FakeServer::default());
        let requests = ServerRequests::new(server.clone(), BufferStreamId(9));

        requests.allocate_buffer(Size::new(32, 16), PixelFormat::Abgr8888, BufferUsage::Hardware);
        requests.submit_buffer(4);
        requests.free_buffer(4);

        let allocations = server.allocations();
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].id, BufferStreamId(9));
        assert_eq!(allocations[0].buffer_requests[0].width, 32);
        assert_eq!(allocations[0].buffer_requests[0].usage, BufferUsage::Hardware);

        assert_eq!(
            server.submits(),
            vec![BufferRequest {
                id: BufferStreamId(9),
                buffer_id: 4
            }]
        );
        assert_eq!(server.releases()[0].buffer_ids, vec![4]);
    }
}
