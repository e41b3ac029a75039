//! Single-shot completion token.
//!
//! A [`WaitHandle`] bridges a thread that blocks on an outcome and the I/O
//! thread that delivers it. It carries no value: whoever resolves it publishes
//! the result in shared state first, and the waiter reads it after waking.
//!
//! States: idle → expecting → resolved → idle. Resolution may be forced on
//! connection loss, in which case no result was published and the waiter must
//! treat the stream as defunct.

use crate::error::{Result, StreamError};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Expecting,
    Resolved,
}

#[derive(Debug)]
pub struct WaitHandle {
    state: Mutex<State>,
    resolved: Condvar,
}

impl WaitHandle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Idle),
            resolved: Condvar::new(),
        }
    }

    /// Arm the handle for exactly one outcome.
    ///
    /// Arming a handle that is already expecting is a programming error and
    /// is reported as [`StreamError::Misuse`].
    pub fn expect_result(&self) -> Result<()> {
        let mut state = self.lock();
        if *state == State::Expecting {
            return Err(StreamError::misuse(
                "wait handle is already expecting a result",
            ));
        }
        *state = State::Expecting;
        Ok(())
    }

    /// Deliver the outcome and wake every waiter. No-op unless expecting.
    pub fn result_received(&self) {
        let mut state = self.lock();
        if *state == State::Expecting {
            *state = State::Resolved;
            trace!("wait handle resolved");
            self.resolved.notify_all();
        }
    }

    /// Block the calling thread until the outcome arrives, then go idle.
    pub fn wait_for_all(&self) {
        let mut state = self.lock();
        while *state == State::Expecting {
            state = self
                .resolved
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *state = State::Idle;
    }

    pub fn is_pending(&self) -> bool {
        *self.lock() == State::Expecting
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for WaitHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_idle_handle_does_not_block() {
        let handle = WaitHandle::new();
        handle.wait_for_all();
        assert!(!handle.is_pending());
    }

    #[test]
    fn test_double_arm_is_misuse() {
        let handle = WaitHandle::new();
        handle.expect_result().unwrap();
        assert!(matches!(
            handle.expect_result(),
            Err(StreamError::Misuse(_))
        ));
    }

    #[test]
    fn test_resolution_without_waiter_is_kept() {
        let handle = WaitHandle::new();
        handle.expect_result().unwrap();
        handle.result_received();
        handle.result_received();
        assert!(!handle.is_pending());
        handle.wait_for_all();

        // back to idle, can be armed again
        handle.expect_result().unwrap();
        assert!(handle.is_pending());
    }

    #[test]
    fn test_waiter_wakes_on_resolution() {
        let handle = Arc::new(WaitHandle::new());
        handle.expect_result().unwrap();

        let waiter = {
            let handle = handle.clone();
            thread::spawn(move || handle.wait_for_all())
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        handle.result_received();
        waiter.join().unwrap();
        assert!(!handle.is_pending());
    }
}
