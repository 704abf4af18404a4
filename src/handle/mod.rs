//! Transfer handles
//!
//! A [`Handle`] wraps exactly one engine session and carries the completion
//! state of its transfer. The caller owns the handle; a [`Multi`] only holds a
//! weak reference while the handle is registered with it.
//!
//! ## State
//!
//! - `Idle` - not registered, not completed
//! - `Registered` - in exactly one multi's active set
//! - `Completed` - a reconciled outcome has been recorded
//!
//! Completion and detachment are independent: a cancelled handle is detached
//! without ever completing, and a completed handle stays `Completed` after
//! the multi lets go of it.
//!
//! [`Multi`]: crate::multi::Multi

mod error;

pub use error::{HandleError, Result};

use crate::engine::{SessionKey, TransferCode, TransferSession};
use crate::multi::MultiId;
use crate::reconcile::Outcome;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HandleId(Uuid);

impl HandleId {
    fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleState {
    Idle,
    Registered,
    Completed,
}

#[derive(Debug, Default)]
struct Slot {
    owner: Option<MultiId>,
    outcome: Option<Outcome>,
    completed_at: Option<OffsetDateTime>,
}

/// Snapshot published to async waiters
#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    attached: bool,
    outcome: Option<Outcome>,
}

/// State shared between the caller's handle and the multi driving it
pub(crate) struct HandleShared<S> {
    id: HandleId,
    key: SessionKey,
    session: Mutex<S>,
    completed: AtomicBool,
    slot: Mutex<Slot>,
    progress: watch::Sender<Progress>,
}

impl<S: TransferSession> HandleShared<S> {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    pub(crate) fn key(&self) -> SessionKey {
        self.key
    }

    pub(crate) fn owner(&self) -> Option<MultiId> {
        self.slot().owner
    }

    pub(crate) fn completed_at(&self) -> Option<OffsetDateTime> {
        self.slot().completed_at
    }

    pub(crate) fn with_session<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut session)
    }

    pub(crate) fn transfer_code(&self) -> TransferCode {
        self.with_session(|session| session.transfer_code())
    }

    /// `Idle -> Registered`
    pub(crate) fn register(&self, multi: MultiId) -> Result<()> {
        let mut slot = self.slot();

        if let Some(owner) = slot.owner {
            return Err(HandleError::AlreadyRegistered { owner });
        }
        if self.completed.load(Ordering::Acquire) {
            return Err(HandleError::AlreadyCompleted);
        }

        slot.owner = Some(multi);
        self.progress.send_replace(Progress {
            attached: true,
            outcome: None,
        });

        debug!(handle_id = %self.id, %multi, session = %self.key, "Handle registered");
        Ok(())
    }

    /// Record the reconciled outcome. Exactly once per registration cycle.
    pub(crate) fn complete(&self, multi: MultiId, outcome: Outcome) -> Result<()> {
        let mut slot = self.slot();

        if slot.owner != Some(multi) {
            return Err(HandleError::NotRegistered { multi });
        }
        if self.completed.load(Ordering::Acquire) {
            error!(handle_id = %self.id, %multi, "Handle completed twice");
            return Err(HandleError::DoubleCompletion);
        }

        slot.outcome = Some(outcome);
        slot.completed_at = Some(OffsetDateTime::now_utc());
        self.completed.store(true, Ordering::Release);
        self.progress.send_modify(|progress| progress.outcome = Some(outcome));

        debug!(
            handle_id = %self.id,
            %multi,
            code = outcome.code,
            origin = ?outcome.origin,
            "Handle completed"
        );
        Ok(())
    }

    /// Clear multi membership. Leaves the completion state untouched.
    pub(crate) fn detach(&self, multi: MultiId) -> Result<()> {
        let mut slot = self.slot();

        if slot.owner != Some(multi) {
            return Err(HandleError::NotRegistered { multi });
        }

        slot.owner = None;
        self.progress.send_modify(|progress| progress.attached = false);

        debug!(handle_id = %self.id, %multi, "Handle detached");
        Ok(())
    }
}

/// One managed transfer
///
/// Dropping a handle that is still registered with a multi is a contract
/// violation and panics.
pub struct Handle<S: TransferSession> {
    shared: Arc<HandleShared<S>>,
}

impl<S: TransferSession> Handle<S> {
    /// Wrap an engine session. The handle owns the session until it is dropped.
    pub fn new(session: S) -> Self {
        let key = session.key();
        let (progress, _) = watch::channel(Progress::default());

        Self {
            shared: Arc::new(HandleShared {
                id: HandleId::new(),
                key,
                session: Mutex::new(session),
                completed: AtomicBool::new(false),
                slot: Mutex::new(Slot::default()),
                progress,
            }),
        }
    }

    pub fn id(&self) -> HandleId {
        self.shared.id
    }

    pub fn session_key(&self) -> SessionKey {
        self.shared.key
    }

    /// Sticky completion flag, safe to read from any thread
    pub fn has_completed(&self) -> bool {
        self.shared.completed.load(Ordering::Acquire)
    }

    /// Reconciled outcome; `None` until the handle completes
    pub fn outcome(&self) -> Option<Outcome> {
        self.shared.slot().outcome
    }

    pub fn completed_at(&self) -> Option<OffsetDateTime> {
        self.shared.completed_at()
    }

    /// Multi currently managing this handle
    pub fn owner(&self) -> Option<MultiId> {
        self.shared.owner()
    }

    /// `Completed` as soon as the completion flag is set, even while the
    /// multi is still detaching the handle.
    pub fn state(&self) -> HandleState {
        if self.has_completed() {
            return HandleState::Completed;
        }
        if self.shared.slot().owner.is_some() {
            HandleState::Registered
        } else {
            HandleState::Idle
        }
    }

    /// Run `f` with exclusive access to the engine session
    ///
    /// Do not call into the owning multi from inside `f`.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        self.shared.with_session(f)
    }

    /// Return a completed (or cancelled) handle to `Idle` so it can be registered again
    pub fn reset(&self) -> Result<()> {
        let mut slot = self.shared.slot();

        if let Some(owner) = slot.owner {
            return Err(HandleError::StillRegistered { owner });
        }

        slot.outcome = None;
        slot.completed_at = None;
        self.shared.completed.store(false, Ordering::Release);
        self.shared.progress.send_replace(Progress::default());
        Ok(())
    }

    /// Wait until the current registration cycle ends.
    ///
    /// Resolves to `Some(outcome)` when the transfer completed, or `None`
    /// when the handle was cancelled or the multi shut down. Resolves
    /// immediately for a handle that is not registered.
    pub async fn finished(&self) -> Option<Outcome> {
        let mut progress = self.shared.progress.subscribe();
        match progress.wait_for(|p| !p.attached).await {
            Ok(progress) => progress.outcome,
            Err(_) => None,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<HandleShared<S>> {
        &self.shared
    }

    pub(crate) fn downgrade(&self) -> Weak<HandleShared<S>> {
        Arc::downgrade(&self.shared)
    }
}

impl<S: TransferSession> fmt::Debug for Handle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.shared.id)
            .field("session", &self.shared.key)
            .field("state", &self.state())
            .finish()
    }
}

impl<S: TransferSession> Drop for Handle<S> {
    fn drop(&mut self) {
        let Some(owner) = self.shared.owner() else {
            return;
        };

        error!(handle_id = %self.shared.id, %owner, "Handle dropped while still registered");
        if !std::thread::panicking() {
            panic!(
                "handle {} dropped while still registered with multi {}",
                self.shared.id, owner
            );
        }
    }
}
