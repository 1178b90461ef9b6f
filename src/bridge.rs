//! Sync Bridge
//!
//! TigerStyle: One pending async operation, one blocking wait.
//!
//! A [`BridgeToken`] starts `Pending` and ends either `Done` or `TimedOut`,
//! both terminal. The only way to complete it is to drop its
//! [`ReleaseHandle`], so whatever path the owner of the handle takes (early
//! return, error branch, unwinding panic) the waiters are released exactly
//! once.
//!
//! ```text
//!   begin() ──► Pending ──(handle dropped)──► Done(Some | None)
//!                  │
//!                  └──(deadline passed)────► TimedOut
//! ```

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// =============================================================================
// Types
// =============================================================================

#[derive(Debug)]
enum BridgeState<T> {
    Pending,
    /// `None` means the handle was dropped without a value.
    Done(Option<T>),
    TimedOut { after: Duration },
}

#[derive(Debug)]
struct Slot<T> {
    state: Mutex<BridgeState<T>>,
    cvar: Condvar,
    handle_issued: AtomicBool,
}

/// Waitable side of a one-shot bridge. Clones share the same slot.
#[derive(Debug)]
pub struct BridgeToken<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for BridgeToken<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

/// Scope guard that completes its token when dropped.
#[derive(Debug)]
#[must_use = "dropping the handle releases the waiters immediately"]
pub struct ReleaseHandle<T> {
    slot: Arc<Slot<T>>,
    value: Option<T>,
}

/// Why a wait ended without a value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("bridged operation timed out after {after:?}")]
    TimedOut { after: Duration },

    #[error("bridged operation was released without a result")]
    Abandoned,
}

// =============================================================================
// Token
// =============================================================================

impl<T: Clone> BridgeToken<T> {
    /// Create a token in the pending state.
    pub fn begin() -> Self {
        Self {
            slot: Arc::new(Slot {
                state: Mutex::new(BridgeState::Pending),
                cvar: Condvar::new(),
                handle_issued: AtomicBool::new(false),
            }),
        }
    }

    /// Take the token's release handle.
    ///
    /// # Panics
    /// Panics if the handle was already taken; a token has exactly one.
    pub fn release_handle(&self) -> ReleaseHandle<T> {
        let already_issued = self.slot.handle_issued.swap(true, Ordering::AcqRel);
        assert!(!already_issued, "release handle already issued for this token");

        ReleaseHandle {
            slot: Arc::clone(&self.slot),
            value: None,
        }
    }

    /// Block until the token is terminal, with no deadline.
    pub fn wait(&self) -> Result<T, BridgeError> {
        let mut state = self.slot.state.lock();
        while matches!(*state, BridgeState::Pending) {
            self.slot.cvar.wait(&mut state);
        }
        Self::outcome(&state)
    }

    /// Block until the token is terminal or `timeout` elapses.
    ///
    /// Expiry moves the token to `TimedOut` for every waiter; a completion
    /// arriving afterwards is discarded.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, BridgeError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock();

        while matches!(*state, BridgeState::Pending) {
            if self.slot.cvar.wait_until(&mut state, deadline).timed_out() {
                if matches!(*state, BridgeState::Pending) {
                    *state = BridgeState::TimedOut { after: timeout };
                    self.slot.cvar.notify_all();
                }
                break;
            }
        }

        Self::outcome(&state)
    }

    /// Whether no terminal state has been reached yet.
    pub fn is_pending(&self) -> bool {
        matches!(*self.slot.state.lock(), BridgeState::Pending)
    }

    /// Whether both tokens refer to the same underlying operation.
    pub fn same_token(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    fn outcome(state: &BridgeState<T>) -> Result<T, BridgeError> {
        match state {
            BridgeState::Done(Some(value)) => Ok(value.clone()),
            BridgeState::Done(None) => Err(BridgeError::Abandoned),
            BridgeState::TimedOut { after } => Err(BridgeError::TimedOut { after: *after }),
            BridgeState::Pending => unreachable!("outcome read while pending"),
        }
    }
}

// =============================================================================
// Release Handle
// =============================================================================

impl<T> ReleaseHandle<T> {
    /// Record the result and release the waiters.
    pub fn complete(mut self, value: T) {
        self.value = Some(value);
    }
}

impl<T> Drop for ReleaseHandle<T> {
    fn drop(&mut self) {
        {
            let mut state = self.slot.state.lock();
            match *state {
                BridgeState::Pending => *state = BridgeState::Done(self.value.take()),
                BridgeState::TimedOut { after } => {
                    tracing::debug!(?after, "late completion discarded, bridge already timed out");
                }
                BridgeState::Done(_) => debug_assert!(false, "bridge released twice"),
            }
        }
        self.slot.cvar.notify_all();
    }
}

// =============================================================================
// Tests
// =============================================================================
