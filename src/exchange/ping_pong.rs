//! Ping-pong exchange: one buffer back for every buffer submitted.
//!
//! Submission never waits for the server. If a buffer has already been pushed
//! it is adopted on the spot; otherwise the completion is parked until the
//! I/O thread deposits one. At any instant either a completion is parked or
//! the arrival queue is non-empty, never both.

use super::{DoneCallback, ScaleState};
use crate::buffer::{ClientBuffer, ClientBufferFactory};
use crate::depository::BufferDepository;
use crate::error::{Result, StreamError};
use crate::rpc::{fire_and_forget, DisplayServer};
use crate::wait_handle::WaitHandle;
use sluice_ipc::{BufferRecord, BufferRequest, BufferStreamId, PixelFormat, Size};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

struct State {
    depository: BufferDepository,
    /// Buffers pushed before anyone asked for them, oldest first
    incoming: VecDeque<BufferRecord>,
    on_incoming_buffer: Option<DoneCallback>,
    connection_lost: bool,
}

pub struct PingPongExchange {
    server: Arc<dyn DisplayServer>,
    state: Mutex<State>,
    next_buffer: WaitHandle,
    scale: Arc<ScaleState>,
}

impl PingPongExchange {
    pub fn new(
        server: Arc<dyn DisplayServer>,
        factory: Arc<dyn ClientBufferFactory>,
        cache_size: usize,
        first_buffer: BufferRecord,
        size: Size,
        format: PixelFormat,
    ) -> Result<Self> {
        let mut depository = BufferDepository::new(factory, cache_size);
        depository.deposit_package(first_buffer, size, format)?;
        Ok(Self {
            server,
            state: Mutex::new(State {
                depository,
                incoming: VecDeque::new(),
                on_incoming_buffer: None,
                connection_lost: false,
            }),
            next_buffer: WaitHandle::new(),
            scale: ScaleState::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self) -> Result<Arc<dyn ClientBuffer>> {
        self.lock()
            .depository
            .current_buffer()
            .ok_or_else(|| StreamError::misuse("no buffer has been received yet"))
    }

    /// The freshest known id: a pushed-but-unclaimed buffer wins over the
    /// adopted one.
    pub fn current_id(&self) -> Result<u32> {
        let state = self.lock();
        state
            .incoming
            .front()
            .map(|record| record.buffer_id)
            .or_else(|| state.depository.current_buffer_id())
            .ok_or_else(|| StreamError::misuse("no buffer has been received yet"))
    }

    pub fn deposit(&self, record: BufferRecord, size: Size, format: PixelFormat) -> Result<()> {
        let mut state = self.lock();
        let Some(done) = state.on_incoming_buffer.take() else {
            debug!("Queueing buffer {} (no pending request)", record.buffer_id);
            state.incoming.push_back(record);
            return Ok(());
        };

        if let Err(e) = state.depository.deposit_package(record, size, format) {
            state.on_incoming_buffer = Some(done);
            return Err(e);
        }
        drop(state);

        done();
        self.next_buffer.result_received();
        Ok(())
    }

    /// Make `record` current without going through the request queue
    pub fn adopt(&self, record: BufferRecord, size: Size, format: PixelFormat) -> Result<()> {
        self.lock().depository.deposit_package(record, size, format)
    }

    pub fn submit(
        &self,
        done: DoneCallback,
        size: Size,
        format: PixelFormat,
        stream_id: BufferStreamId,
    ) -> Result<&WaitHandle> {
        let request = {
            let state = self.lock();
            if state.connection_lost {
                return Err(StreamError::Disconnected);
            }
            if state.on_incoming_buffer.is_some() {
                return Err(StreamError::misuse(
                    "next buffer requested while the previous request is still pending",
                ));
            }
            let buffer_id = state
                .depository
                .current_buffer_id()
                .ok_or_else(|| StreamError::misuse("no buffer to submit"))?;
            BufferRequest {
                id: stream_id,
                buffer_id,
            }
        };

        // always submit what we have, whether or not a reply is already here
        self.server
            .submit_buffer(request, fire_and_forget("submit_buffer"));

        let mut state = self.lock();
        if state.connection_lost {
            return Err(StreamError::Disconnected);
        }
        match state.incoming.pop_front() {
            Some(record) => {
                // completes even when the arrival cannot be imported
                let adopted = state.depository.deposit_package(record, size, format);
                drop(state);
                done();
                adopted?;
            }
            None => {
                self.next_buffer.expect_result()?;
                state.on_incoming_buffer = Some(done);
            }
        }
        Ok(&self.next_buffer)
    }

    pub fn lost_connection(&self) {
        let pending = {
            let mut state = self.lock();
            state.connection_lost = true;
            state.on_incoming_buffer.take()
        };
        info!("Server connection lost, releasing pending buffer request");
        if let Some(done) = pending {
            done();
        }
        self.force_resolve();
    }

    pub fn set_buffer_cache_size(&self, cache_size: usize) {
        self.lock().depository.set_max_buffers(cache_size);
    }

    pub fn set_scale(&self, scale: f32, stream_id: BufferStreamId) -> Result<&WaitHandle> {
        self.scale.request(self.server.as_ref(), stream_id, scale)?;
        Ok(self.scale.handle())
    }

    pub fn scale(&self) -> f32 {
        self.scale.scale()
    }

    pub(crate) fn force_resolve(&self) {
        self.next_buffer.result_received();
        self.scale.handle().result_received();
    }

    #[cfg(test)]
    fn invariant_holds(&self) -> bool {
        let state = self.lock();
        !(state.on_incoming_buffer.is_some() && !state.incoming.is_empty())
    }
}
