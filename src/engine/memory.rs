//! In-process transfer engine
//!
//! Sessions never touch the network. A test (or the demo CLI) decides when a
//! transfer finishes by calling [`MemoryEngine::finish`]. One engine is one
//! polling context: every multiplexer created from it shares the pending
//! completion queue but keeps its own watch set.

use super::{Finished, MultiCode, Multiplexer, MultiplexerError, SessionKey, TransferCode, TransferSession};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Default)]
struct EngineState {
    next_key: u64,
    next_mux: u64,
    watch_sets: HashMap<u64, WatchSet>,
    pending: VecDeque<Finished>,
    poll_failures: VecDeque<MultiplexerError>,
}

#[derive(Debug, Default)]
struct WatchSet {
    keys: HashSet<SessionKey>,
    capacity: Option<usize>,
    woken: bool,
}

impl EngineState {
    /// Drain pending completions watched by `mux`, keeping report order
    fn take_finished(&mut self, mux: u64) -> Vec<Finished> {
        let Some(watch) = self.watch_sets.get(&mux) else {
            return Vec::new();
        };

        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for finished in self.pending.drain(..) {
            if watch.keys.contains(&finished.key) {
                taken.push(finished);
            } else {
                kept.push_back(finished);
            }
        }
        self.pending = kept;
        taken
    }
}

#[derive(Debug, Default)]
struct EngineShared {
    state: Mutex<EngineState>,
    wakeup: Condvar,
}

impl EngineShared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared polling context for memory sessions and multiplexers
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    shared: Arc<EngineShared>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session whose transfer succeeds
    pub fn session(&self) -> MemorySession {
        self.session_with_code(TransferCode::OK)
    }

    /// Create a session whose transfer reports `code` when it finishes
    pub fn session_with_code(&self, code: TransferCode) -> MemorySession {
        let mut state = self.shared.lock();
        state.next_key += 1;
        MemorySession {
            key: SessionKey(state.next_key),
            code,
        }
    }

    /// Create a multiplexer with an unbounded watch set
    pub fn multiplexer(&self) -> MemoryMultiplexer {
        self.new_multiplexer(None)
    }

    /// Create a multiplexer that refuses sessions beyond `capacity`
    pub fn multiplexer_with_capacity(&self, capacity: usize) -> MemoryMultiplexer {
        self.new_multiplexer(Some(capacity))
    }

    fn new_multiplexer(&self, capacity: Option<usize>) -> MemoryMultiplexer {
        let mut state = self.shared.lock();
        state.next_mux += 1;
        let id = state.next_mux;
        state.watch_sets.insert(
            id,
            WatchSet {
                keys: HashSet::new(),
                capacity,
                woken: false,
            },
        );
        MemoryMultiplexer {
            id,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Mark a transfer finished; the watching multiplexer reports it on its next poll
    ///
    /// Sessions no multiplexer watches are dropped.
    pub fn finish(&self, key: SessionKey, code: MultiCode) {
        let mut state = self.shared.lock();
        if !state.watch_sets.values().any(|watch| watch.keys.contains(&key)) {
            debug!(%key, code = code.0, "Finished session is not watched, dropping");
            return;
        }
        state.pending.push_back(Finished { key, code });
        debug!(%key, code = code.0, "Transfer finished");
        drop(state);
        self.shared.wakeup.notify_all();
    }

    /// Number of finished sessions not yet reported by a poll
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Make the next poll of any multiplexer in this engine fail
    pub fn fail_next_poll(&self, error: MultiplexerError) {
        self.shared.lock().poll_failures.push_back(error);
        self.shared.wakeup.notify_all();
    }

    /// Whether any multiplexer currently watches `key`
    pub fn is_watched(&self, key: SessionKey) -> bool {
        self.shared
            .lock()
            .watch_sets
            .values()
            .any(|watch| watch.keys.contains(&key))
    }

    /// Number of sessions watched across all multiplexers
    pub fn watched_count(&self) -> usize {
        self.shared
            .lock()
            .watch_sets
            .values()
            .map(|watch| watch.keys.len())
            .sum()
    }
}

/// Session created by a [`MemoryEngine`]
#[derive(Debug)]
pub struct MemorySession {
    key: SessionKey,
    code: TransferCode,
}

impl TransferSession for MemorySession {
    fn key(&self) -> SessionKey {
        self.key
    }

    fn transfer_code(&self) -> TransferCode {
        self.code
    }
}

/// Multiplexer backed by a [`MemoryEngine`]
#[derive(Debug)]
pub struct MemoryMultiplexer {
    id: u64,
    shared: Arc<EngineShared>,
}

impl Multiplexer for MemoryMultiplexer {
    type Session = MemorySession;

    fn add_session(&self, session: &MemorySession) -> Result<(), MultiplexerError> {
        let mut state = self.shared.lock();
        let watch = state.watch_sets.entry(self.id).or_default();

        if let Some(capacity) = watch.capacity {
            if watch.keys.len() >= capacity {
                return Err(MultiplexerError::ResourceExhausted(format!(
                    "watch set full ({} sessions)",
                    capacity
                )));
            }
        }

        watch.keys.insert(session.key);
        drop(state);
        // A blocked poll rechecks pending completions for the new key
        self.shared.wakeup.notify_all();
        Ok(())
    }

    fn remove_session(&self, key: SessionKey) -> Result<(), MultiplexerError> {
        let mut state = self.shared.lock();
        let removed = state
            .watch_sets
            .get_mut(&self.id)
            .is_some_and(|watch| watch.keys.remove(&key));

        if !removed {
            return Err(MultiplexerError::UnknownSession(key));
        }

        // A finished-but-unreported session must not surface after removal
        state.pending.retain(|finished| finished.key != key);
        Ok(())
    }

    fn poll_once(&self, timeout: Option<Duration>) -> Result<Vec<Finished>, MultiplexerError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.lock();

        loop {
            if let Some(error) = state.poll_failures.pop_front() {
                return Err(error);
            }

            let finished = state.take_finished(self.id);
            if !finished.is_empty() {
                return Ok(finished);
            }

            if let Some(watch) = state.watch_sets.get_mut(&self.id) {
                if std::mem::take(&mut watch.woken) {
                    return Ok(Vec::new());
                }
            }

            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Vec::new());
                    }
                    self.shared
                        .wakeup
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .shared
                    .wakeup
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    fn wakeup(&self) {
        if let Some(watch) = self.shared.lock().watch_sets.get_mut(&self.id) {
            watch.woken = true;
        }
        self.shared.wakeup.notify_all();
    }
}

impl Drop for MemoryMultiplexer {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if let Some(watch) = state.watch_sets.remove(&self.id) {
            let keys = watch.keys;
            state.pending.retain(|finished| !keys.contains(&finished.key));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_zero_timeout_does_not_block() {
        let engine = MemoryEngine::new();
        let mux = engine.multiplexer();

        let started = Instant::now();
        let finished = mux.poll_once(Some(Duration::ZERO)).unwrap();

        assert!(finished.is_empty());
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_bounded_timeout_waits() {
        let engine = MemoryEngine::new();
        let mux = engine.multiplexer();

        let started = Instant::now();
        let finished = mux.poll_once(Some(Duration::from_millis(30))).unwrap();

        assert!(finished.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_finish_wakes_indefinite_poll() {
        let engine = MemoryEngine::new();
        let mux = engine.multiplexer();
        let session = engine.session();
        mux.add_session(&session).unwrap();

        let key = session.key();
        let remote = engine.clone();
        let finisher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.finish(key, MultiCode::OK);
        });

        let finished = mux.poll_once(None).unwrap();
        finisher.join().unwrap();

        assert_eq!(finished, vec![Finished { key, code: MultiCode::OK }]);
    }

    #[test]
    fn test_reports_only_watched_sessions_in_order() {
        let engine = MemoryEngine::new();
        let mux_a = engine.multiplexer();
        let mux_b = engine.multiplexer();
        let (s1, s2, s3) = (engine.session(), engine.session(), engine.session());
        mux_a.add_session(&s1).unwrap();
        mux_b.add_session(&s2).unwrap();
        mux_a.add_session(&s3).unwrap();

        engine.finish(s3.key(), MultiCode::OK);
        engine.finish(s2.key(), MultiCode::OK);
        engine.finish(s1.key(), MultiCode(7));

        let keys: Vec<_> = mux_a
            .poll_once(Some(Duration::ZERO))
            .unwrap()
            .into_iter()
            .map(|f| f.key)
            .collect();
        assert_eq!(keys, vec![s3.key(), s1.key()]);

        let from_b = mux_b.poll_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(from_b.len(), 1);
        assert_eq!(from_b[0].key, s2.key());
    }

    #[test]
    fn test_remove_session_drops_pending_completion() {
        let engine = MemoryEngine::new();
        let mux = engine.multiplexer();
        let session = engine.session();
        mux.add_session(&session).unwrap();
        engine.finish(session.key(), MultiCode::OK);

        mux.remove_session(session.key()).unwrap();
        mux.add_session(&session).unwrap();

        assert!(mux.poll_once(Some(Duration::ZERO)).unwrap().is_empty());
    }

    #[test]
    fn test_wakeup_interrupts_indefinite_poll() {
        let engine = MemoryEngine::new();
        let mux = Arc::new(engine.multiplexer());

        let poller = {
            let mux = Arc::clone(&mux);
            thread::spawn(move || mux.poll_once(None))
        };
        thread::sleep(Duration::from_millis(20));
        mux.wakeup();

        assert!(poller.join().unwrap().unwrap().is_empty());
    }

    #[test]
    fn test_wakeup_is_consumed_once() {
        let engine = MemoryEngine::new();
        let mux = engine.multiplexer();
        mux.wakeup();

        assert!(mux.poll_once(Some(Duration::from_secs(5))).unwrap().is_empty());
        let started = Instant::now();
        mux.poll_once(Some(Duration::from_millis(30))).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_add_session_while_polling() {
        let engine = MemoryEngine::new();
        let mux = Arc::new(engine.multiplexer());

        let poller = {
            let mux = Arc::clone(&mux);
            thread::spawn(move || mux.poll_once(None))
        };
        thread::sleep(Duration::from_millis(20));

        let session = engine.session();
        mux.add_session(&session).unwrap();
        engine.finish(session.key(), MultiCode::OK);

        let finished = poller.join().unwrap().unwrap();
        assert_eq!(finished, vec![Finished { key: session.key(), code: MultiCode::OK }]);
    }

    #[test]
    fn test_finish_for_unwatched_session_is_dropped() {
        let engine = MemoryEngine::new();
        let mux = engine.multiplexer();
        let session = engine.session();

        engine.finish(session.key(), MultiCode::OK);
        assert_eq!(engine.pending_count(), 0);

        mux.add_session(&session).unwrap();
        assert!(mux.poll_once(Some(Duration::ZERO)).unwrap().is_empty());
    }

    #[test]
    fn test_remove_unknown_session() {
        let engine = MemoryEngine::new();
        let mux = engine.multiplexer();

        assert_eq!(
            mux.remove_session(SessionKey(99)),
            Err(MultiplexerError::UnknownSession(SessionKey(99)))
        );
    }

    #[test]
    fn test_capacity_exhausted() {
        let engine = MemoryEngine::new();
        let mux = engine.multiplexer_with_capacity(1);

        mux.add_session(&engine.session()).unwrap();
        let result = mux.add_session(&engine.session());

        assert!(matches!(result, Err(MultiplexerError::ResourceExhausted(_))));
        assert_eq!(engine.watched_count(), 1);
    }

    #[test]
    fn test_injected_poll_failure() {
        let engine = MemoryEngine::new();
        let mux = engine.multiplexer();
        engine.fail_next_poll(MultiplexerError::Poll("select failed".to_string()));

        assert!(mux.poll_once(Some(Duration::ZERO)).is_err());
        assert!(mux.poll_once(Some(Duration::ZERO)).unwrap().is_empty());
    }
}
