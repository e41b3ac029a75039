//! Buffer vault
//!
//! The pool manager behind [`VaultExchange`](crate::exchange::VaultExchange).
//! Buffers move between four owners:
//! - `Vault`: idle, can be withdrawn
//! - `Client`: withdrawn, being rendered into
//! - `ContentReady`: deposited, waiting to be sent
//! - `Server`: sent, comes back through `wire_transfer_inbound`
//!
//! Withdrawals are futures so a caller can either await them or block on
//! them; [`wait_for`] does the latter.

use crate::buffer::{BufferInfo, ClientBufferFactory};
use crate::error::{Result, StreamError};
use crate::rpc::ServerBufferRequests;
use sluice_ipc::{BufferRecord, BufferUsage, PixelFormat, Size};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// A buffer that will be handed out once one is available
pub type Withdrawal = oneshot::Receiver<Result<BufferInfo>>;

/// Pool manager interface used by the vault exchange
pub trait Vault: Send + Sync {
    fn withdraw(&self) -> Withdrawal;
    /// Mark a withdrawn buffer as holding new content
    fn deposit(&self, buffer: &BufferInfo) -> Result<()>;
    /// Send a deposited buffer to the server
    fn wire_transfer_outbound(&self, buffer: &BufferInfo) -> Result<()>;
    /// A buffer arrived from the server
    fn wire_transfer_inbound(&self, record: BufferRecord) -> Result<()>;
    fn set_size(&self, size: Size);
    fn set_scale(&self, scale: f32);
}

/// Block the calling thread until a withdrawal completes.
///
/// Must not be called from inside an async task.
pub fn wait_for(withdrawal: Withdrawal) -> Result<BufferInfo> {
    withdrawal
        .blocking_recv()
        .unwrap_or(Err(StreamError::Disconnected))
}

// ============================================================================
// BufferVault
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Vault,
    Client,
    ContentReady,
    Server,
}

struct Slot {
    info: BufferInfo,
    owner: Owner,
}

struct VaultState {
    slots: BTreeMap<u32, Slot>,
    pending: VecDeque<oneshot::Sender<Result<BufferInfo>>>,
    size: Size,
    scale: f32,
    format: PixelFormat,
    usage: BufferUsage,
    disconnected: bool,
}

impl VaultState {
    fn allocation_size(&self) -> Size {
        self.size.scaled(self.scale)
    }

    fn take_available(&mut self) -> Option<BufferInfo> {
        let slot = self.slots.values_mut().find(|slot| slot.owner == Owner::Vault)?;
        slot.owner = Owner::Client;
        Some(slot.info.clone())
    }

    /// Hand idle buffers to queued withdrawals
    fn dispatch_pending(&mut self) {
        while !self.pending.is_empty() {
            let Some(info) = self.take_available() else {
                break;
            };
            let Some(waiter) = self.pending.pop_front() else {
                break;
            };
            if let Err(Ok(info)) = waiter.send(Ok(info)) {
                // nobody is waiting any more
                if let Some(slot) = self.slots.get_mut(&info.id) {
                    slot.owner = Owner::Vault;
                }
            }
        }
    }

    /// Drop idle buffers that no longer match the allocation size
    fn evict_stale(&mut self) -> Vec<u32> {
        let size = self.allocation_size();
        let stale: Vec<u32> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.owner == Owner::Vault && slot.info.buffer.size() != size)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.slots.remove(id);
        }
        stale
    }
}

/// A [`Vault`] that allocates and frees buffers through the server
pub struct BufferVault {
    factory: Arc<dyn ClientBufferFactory>,
    requests: Arc<dyn ServerBufferRequests>,
    state: Mutex<VaultState>,
}

impl BufferVault {
    pub fn new(
        factory: Arc<dyn ClientBufferFactory>,
        requests: Arc<dyn ServerBufferRequests>,
        size: Size,
        format: PixelFormat,
        usage: BufferUsage,
        initial_buffers: usize,
    ) -> Self {
        info!("Allocating {} buffers of {:?} ({:?})", initial_buffers, size, format);
        for _ in 0..initial_buffers {
            requests.allocate_buffer(size, format, usage);
        }
        Self {
            factory,
            requests,
            state: Mutex::new(VaultState {
                slots: BTreeMap::new(),
                pending: VecDeque::new(),
                size,
                scale: 1.0,
                format,
                usage,
                disconnected: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every outstanding and future withdrawal
    pub fn disconnected(&self) {
        let mut state = self.lock();
        state.disconnected = true;
        let waiters: Vec<_> = state.pending.drain(..).collect();
        drop(state);

        if !waiters.is_empty() {
            info!("Vault disconnected, failing {} withdrawals", waiters.len());
        }
        for waiter in waiters {
            let _ = waiter.send(Err(StreamError::Disconnected));
        }
    }

    /// Number of idle buffers
    pub fn available(&self) -> usize {
        self.lock()
            .slots
            .values()
            .filter(|slot| slot.owner == Owner::Vault)
            .count()
    }

    /// Size new buffers are allocated at (logical size times scale)
    pub fn allocation_size(&self) -> Size {
        self.lock().allocation_size()
    }

    fn reallocate(&self, stale: Vec<u32>, size: Size, format: PixelFormat, usage: BufferUsage) {
        for id in stale {
            debug!("Reallocating buffer {} at {:?}", id, size);
            self.requests.free_buffer(id);
            self.requests.allocate_buffer(size, format, usage);
        }
    }

    fn transition(&self, buffer: &BufferInfo, from: Owner, to: Owner) -> Result<()> {
        let mut state = self.lock();
        match state.slots.get_mut(&buffer.id) {
            Some(slot) if slot.owner == from => {
                slot.owner = to;
                Ok(())
            }
            Some(slot) => Err(StreamError::misuse(format!(
                "buffer {} is owned by {:?}, expected {:?}",
                buffer.id, slot.owner, from
            ))),
            None => Err(StreamError::misuse(format!(
                "buffer {} does not belong to this vault",
                buffer.id
            ))),
        }
    }
}

impl Vault for BufferVault {
    fn withdraw(&self) -> Withdrawal {
        let (waiter, withdrawal) = oneshot::channel();
        let mut state = self.lock();
        if state.disconnected {
            let _ = waiter.send(Err(StreamError::Disconnected));
            return withdrawal;
        }
        match state.take_available() {
            Some(info) => {
                let _ = waiter.send(Ok(info));
            }
            None => state.pending.push_back(waiter),
        }
        withdrawal
    }

    fn deposit(&self, buffer: &BufferInfo) -> Result<()> {
        self.transition(buffer, Owner::Client, Owner::ContentReady)
    }

    fn wire_transfer_outbound(&self, buffer: &BufferInfo) -> Result<()> {
        self.transition(buffer, Owner::ContentReady, Owner::Server)?;
        self.requests.submit_buffer(buffer.id);
        Ok(())
    }

    fn wire_transfer_inbound(&self, record: BufferRecord) -> Result<()> {
        if let Some(error) = &record.error {
            return Err(StreamError::BufferDelivery(error.clone()));
        }

        let id = record.buffer_id;
        let mut state = self.lock();
        let size = state.allocation_size();
        let (format, usage) = (state.format, state.usage);

        if record.size().is_some_and(|received| received != size) {
            state.slots.remove(&id);
            drop(state);
            self.reallocate(vec![id], size, format, usage);
            return Ok(());
        }

        match state.slots.get_mut(&id) {
            Some(slot) => {
                slot.info.buffer.update_from(record)?;
                if slot.owner == Owner::Server {
                    slot.owner = Owner::Vault;
                } else {
                    warn!("Buffer {} returned while owned by {:?}", id, slot.owner);
                }
            }
            None => {
                let buffer = self.factory.create_buffer(record, size, format)?;
                state.slots.insert(
                    id,
                    Slot {
                        info: BufferInfo { id, buffer },
                        owner: Owner::Vault,
                    },
                );
            }
        }
        state.dispatch_pending();
        Ok(())
    }

    fn set_size(&self, size: Size) {
        let mut state = self.lock();
        if state.size == size {
            return;
        }
        state.size = size;
        let stale = state.evict_stale();
        let (size, format, usage) = (state.allocation_size(), state.format, state.usage);
        drop(state);
        self.reallocate(stale, size, format, usage);
    }

    fn set_scale(&self, scale: f32) {
        let mut state = self.lock();
        if state.scale == scale {
            return;
        }
        state.scale = scale;
        let stale = state.evict_stale();
        let (size, format, usage) = (state.allocation_size(), state.format, state.usage);
        drop(state);
        self.reallocate(stale, size, format, usage);
    }
}

impl Drop for BufferVault {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for id in state.slots.keys() {
            self.requests.free_buffer(*id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::ServerRequests;
    use crate::test_support::{record, FakeFactory, FakeServer};
    use sluice_ipc::BufferStreamId;

    fn vault(initial: usize) -> (BufferVault, Arc<FakeServer>) {
        let server = Arc::new(FakeServer::default());
        let vault = BufferVault::new(
            Arc::new(FakeFactory::default()),
            Arc::new(ServerRequests::new(server.clone(), BufferStreamId(2))),
            Size::new(10, 10),
            PixelFormat::Xrgb8888,
            BufferUsage::Software,
            initial,
        );
        (vault, server)
    }

    #[test]
    fn test_construction_requests_initial_buffers() {
        let (_vault, server) = vault(3);
        let allocations = server.allocations();
        assert_eq!(allocations.len(), 3);
        assert_eq!(allocations[0].buffer_requests[0].pixel_format, PixelFormat::Xrgb8888);
    }

    #[test]
    fn test_withdrawal_waits_for_arrival() {
        let (vault, _) = vault(1);
        let mut withdrawal = vault.withdraw();
        assert!(withdrawal.try_recv().is_err());

        vault.wire_transfer_inbound(record(4, 10, 10)).unwrap();
        let info = withdrawal.try_recv().unwrap().unwrap();
        assert_eq!(info.id, 4);
        assert_eq!(vault.available(), 0);
    }

    #[test]
    fn test_round_trip_through_server() {
        let (vault, server) = vault(1);
        vault.wire_transfer_inbound(record(1, 10, 10)).unwrap();

        let info = wait_for(vault.withdraw()).unwrap();
        vault.deposit(&info).unwrap();
        vault.wire_transfer_outbound(&info).unwrap();
        assert_eq!(server.submits()[0].buffer_id, 1);
        assert_eq!(vault.available(), 0);

        vault.wire_transfer_inbound(record(1, 10, 10)).unwrap();
        assert_eq!(vault.available(), 1);
    }

    #[test]
    fn test_out_of_order_transfers_are_misuse() {
        let (vault, _) = vault(1);
        vault.wire_transfer_inbound(record(1, 10, 10)).unwrap();
        let info = wait_for(vault.withdraw()).unwrap();

        assert!(matches!(
            vault.wire_transfer_outbound(&info),
            Err(StreamError::Misuse(_))
        ));
        vault.deposit(&info).unwrap();
        assert!(matches!(vault.deposit(&info), Err(StreamError::Misuse(_))));
    }

    #[test]
    fn test_error_record_is_rejected() {
        let (vault, _) = vault(1);
        assert!(matches!(
            vault.wire_transfer_inbound(BufferRecord::with_error(1, "no memory")),
            Err(StreamError::BufferDelivery(_))
        ));
        assert_eq!(vault.available(), 0);
    }

    #[test]
    fn test_resize_replaces_idle_buffers() {
        let (vault, server) = vault(2);
        vault.wire_transfer_inbound(record(1, 10, 10)).unwrap();
        vault.wire_transfer_inbound(record(2, 10, 10)).unwrap();
        let held = wait_for(vault.withdraw()).unwrap();

        vault.set_size(Size::new(20, 20));
        assert_eq!(vault.available(), 0);
        let releases = server.releases();
        assert_eq!(releases.len(), 1);
        assert_ne!(releases[0].buffer_ids[0], held.id);
        assert_eq!(server.allocations().last().unwrap().buffer_requests[0].width, 20);

        // the held buffer is replaced when the server returns it at the old size
        vault.deposit(&held).unwrap();
        vault.wire_transfer_outbound(&held).unwrap();
        vault.wire_transfer_inbound(record(held.id, 10, 10)).unwrap();
        assert_eq!(server.releases().len(), 2);
        assert_eq!(vault.available(), 0);
    }

    #[test]
    fn test_disconnect_fails_withdrawals() {
        let (vault, _) = vault(1);
        let pending = vault.withdraw();
        vault.disconnected();

        assert!(matches!(wait_for(pending), Err(StreamError::Disconnected)));
        assert!(matches!(
            wait_for(vault.withdraw()),
            Err(StreamError::Disconnected)
        ));
    }

    #[test]
    fn test_drop_frees_known_buffers() {
        let (vault, server) = vault(2);
        vault.wire_transfer_inbound(record(1, 10, 10)).unwrap();
        vault.wire_transfer_inbound(record(2, 10, 10)).unwrap();
        drop(vault);
        assert_eq!(server.releases().len(), 2);
    }
}
