//! Multi controller
//!
//! A [`Multi`] drives many [`Handle`]s through one [`Multiplexer`].
//!
//! Flow per finished session:
//! 1. `poll` asks the multiplexer which sessions finished
//! 2. the session leaves the active set (this is the serialization point
//!    against a concurrent `remove_handle`)
//! 3. transfer and multiplexer codes are reconciled into an [`Outcome`]
//! 4. the handle is completed
//! 5. the session leaves the multiplexer watch set, then the handle is detached
//!
//! Cancellation (`remove_handle`) and shutdown run step 5 only.
//!
//! The active set lives behind a mutex held only for each mutation and for
//! the processing of one poll's finished list. The multiplexer's blocking
//! wait runs outside it, so `add_handle` and `remove_handle` from another
//! thread never wait for an in-flight poll. Polls are serialized by a separate
//! gate. `shutdown` wakes a blocked poll, which then returns `ShutDown`.
//!
//! A session removed while a poll was blocked is ignored if that poll reports
//! it: the report predates the removal, even when the handle was re-added.

mod error;

pub use error::{MultiError, Result};

use crate::config::MultiSettings;
use crate::engine::{Finished, Multiplexer, SessionKey};
use crate::handle::{Handle, HandleError, HandleId, HandleShared};
use crate::observability::{Metrics, MetricsSnapshot};
use crate::reconcile::{Outcome, reconcile};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MultiId(Uuid);

impl MultiId {
    pub(crate) fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for MultiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// `Created -> Running -> ShuttingDown -> Destroyed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiPhase {
    Created,
    Running,
    ShuttingDown,
    Destroyed,
}

/// A handle that completed during a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub handle: HandleId,
    pub session: SessionKey,
    pub outcome: Outcome,
    pub completed_at: OffsetDateTime,
}

type Members<S> = BTreeMap<SessionKey, Weak<HandleShared<S>>>;

struct MultiState<S> {
    phase: MultiPhase,
    active: Members<S>,
    polling: bool,
    /// Sessions removed while the current poll was waiting
    retired: HashSet<SessionKey>,
}

impl<S> MultiState<S> {
    fn ensure_open(&mut self) -> Result<()> {
        match self.phase {
            MultiPhase::ShuttingDown | MultiPhase::Destroyed => Err(MultiError::ShutDown),
            MultiPhase::Created => {
                self.phase = MultiPhase::Running;
                Ok(())
            }
            MultiPhase::Running => Ok(()),
        }
    }
}

pub struct Multi<M: Multiplexer> {
    id: MultiId,
    max_active_handles: usize,
    mux: M,
    state: Mutex<MultiState<M::Session>>,
    poll_gate: Mutex<()>,
    metrics: Metrics,
}

impl<M: Multiplexer> Multi<M> {
    pub fn new(mux: M) -> Self {
        Self::with_settings(mux, &MultiSettings::default())
    }

    pub fn with_settings(mux: M, settings: &MultiSettings) -> Self {
        let id = MultiId::new();
        info!(
            multi_id = %id,
            max_active_handles = settings.max_active_handles,
            "Creating multi"
        );

        Self {
            id,
            max_active_handles: settings.max_active_handles,
            mux,
            state: Mutex::new(MultiState {
                phase: MultiPhase::Created,
                active: BTreeMap::new(),
                polling: false,
                retired: HashSet::new(),
            }),
            poll_gate: Mutex::new(()),
            metrics: Metrics::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MultiState<M::Session>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> MultiId {
        self.id
    }

    pub fn phase(&self) -> MultiPhase {
        self.lock().phase
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    /// Whether `handle` is in this multi's active set
    pub fn contains(&self, handle: &Handle<M::Session>) -> bool {
        let state = self.lock();
        handle.owner() == Some(self.id) && state.active.contains_key(&handle.session_key())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Register `handle` and start watching its session
    pub fn add_handle(&self, handle: &Handle<M::Session>) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.ensure_open()?;

        if state.active.len() >= self.max_active_handles {
            warn!(multi_id = %self.id, limit = self.max_active_handles, "Active handle limit reached");
            return Err(MultiError::CapacityExhausted {
                limit: self.max_active_handles,
            });
        }

        let shared = handle.shared();
        if state.active.contains_key(&shared.key()) && shared.owner() != Some(self.id) {
            warn!(multi_id = %self.id, handle_id = %shared.id(), session = %shared.key(), "Session key already active");
            return Err(MultiError::DuplicateSession {
                session: shared.key(),
            });
        }

        shared.register(self.id).map_err(|e| match e {
            HandleError::AlreadyRegistered { owner } if owner == self.id => {
                MultiError::AlreadyRegistered {
                    handle: shared.id(),
                }
            }
            HandleError::AlreadyRegistered { owner } => MultiError::RegistrationConflict {
                handle: shared.id(),
                owner,
            },
            other => MultiError::Handle(other),
        })?;

        if let Err(e) = shared.with_session(|session| self.mux.add_session(session)) {
            warn!(multi_id = %self.id, handle_id = %shared.id(), error = %e, "Multiplexer refused session");
            shared.detach(self.id)?;
            return Err(e.into());
        }

        state.active.insert(shared.key(), handle.downgrade());
        self.metrics.handle_added();

        debug!(
            multi_id = %self.id,
            handle_id = %shared.id(),
            session = %shared.key(),
            active = state.active.len(),
            "Handle added"
        );
        Ok(())
    }

    /// Stop managing `handle` without completing it.
    ///
    /// Returns `false` when the handle was not in the active set, e.g. because
    /// a concurrent poll already completed and detached it.
    pub fn remove_handle(&self, handle: &Handle<M::Session>) -> Result<bool> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let key = handle.session_key();

        if handle.owner() != Some(self.id) || state.active.remove(&key).is_none() {
            debug!(multi_id = %self.id, handle_id = %handle.id(), "Handle not active, nothing to remove");
            return Ok(false);
        }

        if state.polling {
            state.retired.insert(key);
        }

        let shared = handle.shared();
        self.release(shared);
        if !handle.has_completed() {
            self.metrics.handle_cancelled();
        }

        debug!(multi_id = %self.id, handle_id = %handle.id(), "Handle removed");
        Ok(true)
    }

    /// Drive one multiplexer iteration and complete every finished handle.
    ///
    /// `Some(Duration::ZERO)` does not block; `None` blocks until a session
    /// finishes. Completions are returned in the order the multiplexer
    /// reported them.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<Vec<Completion>> {
        let _gate = self.poll_gate.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut state = self.lock();
            state.ensure_open()?;
            state.polling = true;
        }

        self.metrics.poll_iteration();
        let polled = self.mux.poll_once(timeout);

        let mut guard = self.lock();
        let state = &mut *guard;
        state.polling = false;
        let retired = std::mem::take(&mut state.retired);

        let finished = match polled {
            Ok(finished) => finished,
            Err(e) => {
                self.metrics.poll_error();
                warn!(multi_id = %self.id, error = %e, "Multiplexer poll failed");
                return Err(e.into());
            }
        };

        if matches!(state.phase, MultiPhase::ShuttingDown | MultiPhase::Destroyed) {
            debug!(multi_id = %self.id, discarded = finished.len(), "Multi shut down during poll");
            return Err(MultiError::ShutDown);
        }

        let mut completions = Vec::with_capacity(finished.len());
        let mut violation = None;
        for Finished { key, code } in finished {
            if retired.contains(&key) {
                debug!(multi_id = %self.id, session = %key, "Session removed during poll, skipping");
                continue;
            }

            let Some(member) = state.active.remove(&key) else {
                debug!(multi_id = %self.id, session = %key, "Finished session is not active, skipping");
                continue;
            };

            let Some(shared) = member.upgrade() else {
                error!(multi_id = %self.id, session = %key, "Handle dropped while registered, discarding session");
                if let Err(e) = self.mux.remove_session(key) {
                    warn!(multi_id = %self.id, session = %key, error = %e, "Failed to remove orphaned session");
                }
                continue;
            };

            let outcome = reconcile(shared.transfer_code(), code);
            let completed = shared.complete(self.id, outcome);
            self.release(&shared);
            if let Err(e) = completed {
                error!(multi_id = %self.id, session = %key, error = %e, "Handle rejected completion");
                violation.get_or_insert(e);
                continue;
            }

            self.metrics.handle_completed(outcome.is_success());
            completions.push(Completion {
                handle: shared.id(),
                session: key,
                outcome,
                completed_at: shared
                    .completed_at()
                    .unwrap_or_else(OffsetDateTime::now_utc),
            });
        }

        match violation {
            Some(e) => Err(e.into()),
            None => Ok(completions),
        }
    }

    /// Detach every remaining handle without completing it, then mark the
    /// multi destroyed. Returns the number of handles detached.
    pub fn shutdown(&self) -> usize {
        let mut guard = self.lock();
        let state = &mut *guard;

        if state.phase == MultiPhase::Destroyed {
            return 0;
        }

        state.phase = MultiPhase::ShuttingDown;
        info!(multi_id = %self.id, active = state.active.len(), "Shutting down multi");
        self.mux.wakeup();

        let mut detached = 0;
        for (key, member) in std::mem::take(&mut state.active) {
            match member.upgrade() {
                Some(shared) => {
                    self.release(&shared);
                    self.metrics.handle_cancelled();
                    detached += 1;
                }
                None => {
                    error!(multi_id = %self.id, session = %key, "Handle dropped while registered");
                    if let Err(e) = self.mux.remove_session(key) {
                        warn!(multi_id = %self.id, session = %key, error = %e, "Failed to remove orphaned session");
                    }
                }
            }
        }

        state.phase = MultiPhase::Destroyed;
        info!(multi_id = %self.id, detached, "Multi destroyed");
        detached
    }

    /// Remove the session from the watch set, then clear the handle's membership
    fn release(&self, shared: &HandleShared<M::Session>) {
        let key = shared.key();
        if let Err(e) = self.mux.remove_session(key) {
            warn!(multi_id = %self.id, session = %key, error = %e, "Multiplexer failed to remove session");
        }
        if let Err(e) = shared.detach(self.id) {
            error!(multi_id = %self.id, session = %key, error = %e, "Active handle was not registered here");
        }
    }
}

impl<M: Multiplexer> fmt::Debug for Multi<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multi")
            .field("id", &self.id)
            .field("max_active_handles", &self.max_active_handles)
            .finish_non_exhaustive()
    }
}

impl<M: Multiplexer> Drop for Multi<M> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
