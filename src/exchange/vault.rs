//! Vault exchange: client-managed pool, several buffers in flight.
//!
//! Submitting hands the current buffer to the transport and immediately
//! withdraws the next one. Back-pressure comes from the vault itself: once
//! every buffer is out with the server, the withdrawal blocks until one is
//! returned.

use super::{DoneCallback, ScaleState};
use crate::buffer::{BufferInfo, ClientBuffer};
use crate::error::Result;
use crate::rpc::DisplayServer;
use crate::vault::{wait_for, Vault};
use crate::wait_handle::WaitHandle;
use sluice_ipc::{BufferRecord, BufferStreamId, Size};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

pub struct VaultExchange {
    vault: Arc<dyn Vault>,
    server: Arc<dyn DisplayServer>,
    current: Mutex<Option<BufferInfo>>,
    withdrawing: Mutex<()>,
    next_buffer: WaitHandle,
    scale: Arc<ScaleState>,
}

impl VaultExchange {
    pub fn new(vault: Arc<dyn Vault>, server: Arc<dyn DisplayServer>) -> Self {
        Self {
            vault,
            server,
            current: Mutex::new(None),
            withdrawing: Mutex::new(()),
            next_buffer: WaitHandle::new(),
            scale: ScaleState::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<BufferInfo>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Held across a withdrawal so only one caller fills the cache
    fn withdrawing(&self) -> MutexGuard<'_, ()> {
        self.withdrawing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn withdraw(&self) -> Result<BufferInfo> {
        let info = wait_for(self.vault.withdraw())?;
        trace!("Withdrew buffer {}", info.id);
        Ok(info)
    }

    fn ensure_current(&self) -> Result<BufferInfo> {
        if let Some(info) = self.lock().as_ref() {
            return Ok(info.clone());
        }

        let _withdrawing = self.withdrawing();
        // another caller may have withdrawn while we waited
        if let Some(info) = self.lock().as_ref() {
            return Ok(info.clone());
        }
        let info = self.withdraw()?;
        *self.lock() = Some(info.clone());
        Ok(info)
    }

    /// Remove the current buffer from the cache, withdrawing one if empty
    fn take_current(&self) -> Result<BufferInfo> {
        let _withdrawing = self.withdrawing();
        let cached = self.lock().take();
        match cached {
            Some(info) => Ok(info),
            None => self.withdraw(),
        }
    }

    pub fn current(&self) -> Result<Arc<dyn ClientBuffer>> {
        Ok(self.ensure_current()?.buffer)
    }

    pub fn current_id(&self) -> Result<u32> {
        Ok(self.ensure_current()?.id)
    }

    /// Send the current buffer and withdraw the next one.
    ///
    /// The submitted buffer leaves the cache before anything can fail, so a
    /// failed submit never leaves a server-owned buffer as current.
    pub fn submit(&self, done: DoneCallback) -> Result<&WaitHandle> {
        let current = self.take_current()?;
        self.vault.deposit(&current)?;

        // handed to the transport counts as complete
        self.next_buffer.expect_result()?;
        let outbound = self.vault.wire_transfer_outbound(&current);
        self.next_buffer.result_received();
        outbound?;

        self.ensure_current()?;
        done();
        Ok(&self.next_buffer)
    }

    pub fn deposit(&self, record: BufferRecord) -> Result<()> {
        self.vault.wire_transfer_inbound(record)
    }

    pub fn set_size(&self, size: Size) {
        self.vault.set_size(size);
    }

    pub fn set_scale(&self, scale: f32, stream_id: BufferStreamId) -> Result<&WaitHandle> {
        self.vault.set_scale(scale);
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use crate::test_support::{record, FakeFactory, FakeServer};
    use crate::vault::BufferVault;
    use sluice_ipc::{BufferUsage, PixelFormat};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    const SIZE: Size = Size::new(32, 32);

    /// A vault with `count` buffers already delivered by the server
    fn exchange(count: u32) -> (Arc<VaultExchange>, Arc<BufferVault>, Arc<FakeServer>) {
        let server = Arc::new(FakeServer::default());
        let vault = Arc::new(BufferVault::new(
            Arc::new(FakeFactory::default()),
            Arc::new(crate::rpc::ServerRequests::new(server.clone(), BufferStreamId(5))),
            SIZE,
            PixelFormat::Argb8888,
            BufferUsage::Software,
            count as usize,
        ));
        for id in 1..=count {
            vault.wire_transfer_inbound(record(id, 32, 32)).unwrap();
        }
        let exchange = Arc::new(VaultExchange::new(vault.clone(), server.clone()));
        (exchange, vault, server)
    }

    fn noop() -> DoneCallback {
        Box::new(|| {})
    }

    #[test]
    fn test_current_is_withdrawn_lazily_and_cached() {
        let (exchange, vault, _) = exchange(2);
        assert_eq!(vault.available(), 2);

        let first = exchange.current_id().unwrap();
        assert_eq!(exchange.current_id().unwrap(), first);
        assert_eq!(vault.available(), 1);
    }

    #[test]
    fn test_submit_sends_current_and_advances() {
        let (exchange, _, server) = exchange(3);
        let before = exchange.current_id().unwrap();

        let handle = exchange.submit(noop()).unwrap();
        assert!(!handle.is_pending());
        handle.wait_for_all();

        assert_eq!(server.submits()[0].buffer_id, before);
        assert_eq!(server.submits()[0].id, BufferStreamId(5));
        assert_ne!(exchange.current_id().unwrap(), before);
    }

    #[test]
    fn test_pipelines_until_pool_is_exhausted() {
        // one buffer for rendering plus K in flight
        const K: u32 = 3;
        let (exchange, vault, server) = exchange(K + 1);
        exchange.current_id().unwrap();

        for _ in 0..K {
            exchange.submit(noop()).unwrap().wait_for_all();
        }
        assert_eq!(server.submits().len(), K as usize);
        assert_eq!(vault.available(), 0);

        let (tx, rx) = mpsc::channel();
        let blocked = {
            let exchange = exchange.clone();
            thread::spawn(move || {
                let result = exchange.submit(noop()).map(|_| ());
                tx.send(result.is_ok()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        // the server hands the oldest submitted buffer back
        let returned = server.submits()[0].buffer_id;
        exchange.deposit(record(returned, 32, 32)).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        blocked.join().unwrap();
        assert_eq!(exchange.current_id().unwrap(), returned);
    }

    #[test]
    fn test_disconnected_vault_fails_withdrawal() {
        let (exchange, vault, _) = exchange(1);
        exchange.current_id().unwrap();
        vault.disconnected();

        assert!(matches!(
            exchange.submit(noop()),
            Err(StreamError::Disconnected)
        ));
    }

    #[test]
    fn test_failed_advance_leaves_no_current() {
        let (exchange, vault, server) = exchange(1);
        let submitted = exchange.current_id().unwrap();

        let (tx, rx) = mpsc::channel();
        let blocked = {
            let exchange = exchange.clone();
            thread::spawn(move || {
                let result = exchange.submit(noop()).map(|_| ());
                tx.send(matches!(result, Err(StreamError::Disconnected))).unwrap();
            })
        };
        // the buffer is out and the advance waits on an empty pool
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(server.submits()[0].buffer_id, submitted);

        vault.disconnected();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        blocked.join().unwrap();

        // the server-owned buffer must not come back as current
        assert!(matches!(
            exchange.current_id(),
            Err(StreamError::Disconnected)
        ));
        assert!(matches!(
            exchange.submit(noop()),
            Err(StreamError::Disconnected)
        ));
        assert_eq!(server.submits().len(), 1);
    }

    #[test]
    fn test_racing_callers_share_one_withdrawal() {
        let (exchange, vault, _) = exchange(0);

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let exchange = exchange.clone();
                thread::spawn(move || exchange.current_id().unwrap())
            })
            .collect();
        thread::sleep(Duration::from_millis(50));

        vault.wire_transfer_inbound(record(1, 32, 32)).unwrap();
        vault.wire_transfer_inbound(record(2, 32, 32)).unwrap();
        let ids: Vec<u32> = waiters.into_iter().map(|w| w.join().unwrap()).collect();

        assert_eq!(ids[0], ids[1]);
        // the other buffer was never withdrawn
        assert_eq!(vault.available(), 1);
    }

    #[test]
    fn test_scale_reaches_vault_and_server() {
        let (exchange, vault, server) = exchange(1);
        let handle = exchange.set_scale(2.0, BufferStreamId(5)).unwrap();
        assert!(handle.is_pending());

        server.ack_configurations();
        handle.wait_for_all();
        assert_eq!(exchange.scale(), 2.0);
        assert_eq!(vault.allocation_size(), Size::new(64, 64));
    }
}
