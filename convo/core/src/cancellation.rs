//! Cancellation Handles and Registry
//!
//! Every network operation the engine starts (the primary send stream, the
//! conversation refetch, the suggested-questions fetch and the secondary
//! workflow-event stream) owns a [`CancellationHandle`]. The session keeps the
//! handles in a [`CancellationRegistry`] keyed by [`StreamRole`], and `stop` /
//! `restart` are nothing more than [`CancellationRegistry::cancel_all`].
//!
//! Cancellation is cooperative-immediate: the task doing the I/O races its
//! work against [`CancellationHandle::cancelled`], and consumers check
//! [`CancellationHandle::is_cancelled`] before applying anything that was
//! already buffered.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct HandleInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Aborts an in-flight stream or request when cancelled
///
/// Cloning yields another handle to the same operation.
#[derive(Clone, Debug, Default)]
pub struct CancellationHandle {
    inner: Arc<HandleInner>,
}

impl CancellationHandle {
    /// Create a fresh, uncancelled handle
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the operation
    ///
    /// Idempotent: returns `true` only for the call that actually cancelled.
    pub fn cancel(&self) -> bool {
        let first = !self.inner.cancelled.swap(true, Ordering::SeqCst);
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// Whether the operation has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the handle is cancelled (immediately if it already is)
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Whether two handles refer to the same operation
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// The role an operation plays within a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamRole {
    /// The send stream for the current round-trip
    Primary,
    /// Post-completion refetch of persisted conversation messages
    ConversationFetch,
    /// Post-completion suggested-questions fetch
    SuggestedQuestionsFetch,
    /// Secondary workflow-run event feed (human-in-the-loop resume)
    WorkflowEvents,
}

impl StreamRole {
    /// All roles, in registry order
    pub const ALL: [Self; 4] = [
        Self::Primary,
        Self::ConversationFetch,
        Self::SuggestedQuestionsFetch,
        Self::WorkflowEvents,
    ];
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::ConversationFetch => write!(f, "conversationFetch"),
            Self::SuggestedQuestionsFetch => write!(f, "suggestedQuestionsFetch"),
            Self::WorkflowEvents => write!(f, "workflowEvents"),
        }
    }
}

/// Holds at most one cancellation handle per [`StreamRole`]
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    slots: HashMap<StreamRole, CancellationHandle>,
}

impl CancellationRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle for a role
    ///
    /// A handle already occupying the slot is cancelled and returned.
    pub fn register(
        &mut self,
        role: StreamRole,
        handle: CancellationHandle,
    ) -> Option<CancellationHandle> {
        let previous = self.slots.insert(role, handle);
        if let Some(ref prev) = previous {
            if prev.cancel() {
                tracing::debug!(role = %role, "Replaced in-flight operation");
            }
        }
        previous
    }

    /// Get the handle registered for a role
    #[must_use]
    pub fn get(&self, role: StreamRole) -> Option<&CancellationHandle> {
        self.slots.get(&role)
    }

    /// Whether a role has a live (registered and not cancelled) handle
    #[must_use]
    pub fn is_active(&self, role: StreamRole) -> bool {
        self.slots.get(&role).is_some_and(|h| !h.is_cancelled())
    }

    /// Cancel and remove the handle for one role (no-op if absent)
    pub fn cancel(&mut self, role: StreamRole) {
        if let Some(handle) = self.slots.remove(&role) {
            handle.cancel();
        }
    }

    /// Forget a role's handle without cancelling it (the operation finished)
    ///
    /// Only removes the slot if it still holds `handle`, so a finished
    /// operation never evicts the one that replaced it.
    pub fn release(&mut self, role: StreamRole, handle: &CancellationHandle) {
        if self.slots.get(&role).is_some_and(|h| h.same_as(handle)) {
            self.slots.remove(&role);
        }
    }

    /// Cancel every registered handle and clear the registry
    ///
    /// Returns the number of handles that were still live.
    pub fn cancel_all(&mut self) -> usize {
        let mut cancelled = 0;
        for (role, handle) in self.slots.drain() {
            if handle.cancel() {
                tracing::debug!(role = %role, "Cancelled in-flight operation");
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Number of occupied slots
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slot is occupied
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
