//! Buffer depository for the exchange protocol.
//!
//! Keeps the most recently received buffers keyed by server id, newest first.
//! The front entry is the current buffer. Buffers that fall off the end of
//! the budget are released.

use crate::buffer::{ClientBuffer, ClientBufferFactory};
use crate::error::Result;
use sluice_ipc::{BufferRecord, PixelFormat, Size};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// Default number of buffers the client keeps around
pub const CLIENT_BUFFER_CACHE_SIZE: usize = 3;

/// Current buffer plus one spare
const MIN_BUFFERS: usize = 2;

pub struct BufferDepository {
    factory: Arc<dyn ClientBufferFactory>,
    buffers: VecDeque<(u32, Arc<dyn ClientBuffer>)>,
    max_buffers: usize,
}

impl BufferDepository {
    pub fn new(factory: Arc<dyn ClientBufferFactory>, max_buffers: usize) -> Self {
        Self {
            factory,
            buffers: VecDeque::new(),
            max_buffers: max_buffers.max(MIN_BUFFERS),
        }
    }

    /// Make the buffer described by `record` current.
    ///
    /// A known id refreshes the existing client buffer instead of importing a
    /// new one.
    pub fn deposit_package(
        &mut self,
        record: BufferRecord,
        size: Size,
        format: PixelFormat,
    ) -> Result<()> {
        let id = record.buffer_id;
        let buffer = match self.buffers.iter().position(|(known, _)| *known == id) {
            Some(index) => {
                let (_, buffer) = self.buffers[index].clone();
                buffer.update_from(record)?;
                self.buffers.remove(index);
                buffer
            }
            None => {
                debug!("Importing new buffer {} ({:?})", id, size);
                self.factory.create_buffer(record, size, format)?
            }
        };
        self.buffers.push_front((id, buffer));
        self.trim();
        Ok(())
    }

    pub fn current_buffer(&self) -> Option<Arc<dyn ClientBuffer>> {
        self.buffers.front().map(|(_, buffer)| buffer.clone())
    }

    pub fn current_buffer_id(&self) -> Option<u32> {
        self.buffers.front().map(|(id, _)| *id)
    }

    pub fn set_max_buffers(&mut self, max_buffers: usize) {
        self.max_buffers = max_buffers.max(MIN_BUFFERS);
        self.trim();
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn trim(&mut self) {
        while self.buffers.len() > self.max_buffers {
            if let Some((id, _)) = self.buffers.pop_back() {
                debug!("Dropping cached buffer {}", id);
            }
        }
    }
}
