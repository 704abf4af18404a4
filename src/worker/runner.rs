//! Poll loop thread

use super::{Result, WorkerConfig, WorkerError};
use crate::engine::Multiplexer;
use crate::multi::{Completion, Multi, MultiError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Handle to a running poll thread
///
/// The loop ends when [`PollWorker::stop`] is called or when the multi shuts
/// down. A stop request is observed after the in-flight poll returns, so
/// stopping takes at most one poll timeout.
#[derive(Debug)]
pub struct PollWorker {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<u64>,
}

impl PollWorker {
    /// Spawn the poll thread
    ///
    /// Returns:
    /// - PollWorker (stop it to join the thread)
    /// - Receiver of every completion, in poll order
    pub fn spawn<M: Multiplexer>(
        multi: Arc<Multi<M>>,
        config: WorkerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Completion>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));

        let thread = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn({
                let stop = Arc::clone(&stop);
                move || run(multi, config, stop, tx)
            })?;

        Ok((Self { stop, thread }, rx))
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Ask the loop to exit and wait for it. Returns the number of poll iterations.
    pub fn stop(self) -> Result<u64> {
        self.stop.store(true, Ordering::Release);
        self.thread.join().map_err(|_| {
            error!("Poll thread panicked");
            WorkerError::Panicked
        })
    }
}

fn run<M: Multiplexer>(
    multi: Arc<Multi<M>>,
    config: WorkerConfig,
    stop: Arc<AtomicBool>,
    completions: mpsc::UnboundedSender<Completion>,
) -> u64 {
    let multi_id = multi.id();
    let mut iterations = 0;
    info!(%multi_id, poll_timeout = ?config.poll_timeout, "Poll worker started");

    while !stop.load(Ordering::Acquire) {
        match multi.poll(Some(config.poll_timeout)) {
            Ok(finished) => {
                iterations += 1;
                for completion in finished {
                    if completions.send(completion).is_err() {
                        debug!(%multi_id, handle_id = %completion.handle, "Completion receiver dropped");
                    }
                }
            }
            Err(MultiError::ShutDown) => {
                info!(%multi_id, "Multi shut down, stopping poll worker");
                break;
            }
            Err(e) => {
                iterations += 1;
                warn!(%multi_id, error = %e, backoff = ?config.error_backoff, "Poll failed, backing off");
                thread::sleep(config.error_backoff);
            }
        }
    }

    info!(%multi_id, iterations, "Poll worker stopped");
    iterations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryEngine;
    use crate::engine::{MultiCode, MultiplexerError, TransferCode};
    use crate::handle::Handle;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            thread_name: "fetchmux-test".to_string(),
            poll_timeout: Duration::from_millis(10),
            error_backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_worker_config_from_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.thread_name, "fetchmux-poll");
        assert_eq!(config.poll_timeout, Duration::from_millis(250));
        assert_eq!(config.error_backoff, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_forwards_completions() {
        let engine = MemoryEngine::new();
        let multi = Arc::new(Multi::new(engine.multiplexer()));
        let ok = Handle::new(engine.session());
        let failing = Handle::new(engine.session_with_code(TransferCode(35)));
        multi.add_handle(&ok).unwrap();
        multi.add_handle(&failing).unwrap();

        let (worker, mut completions) = PollWorker::spawn(Arc::clone(&multi), test_config()).unwrap();
        engine.finish(ok.session_key(), MultiCode::OK);
        engine.finish(failing.session_key(), MultiCode::OK);

        let first = timeout(Duration::from_secs(2), completions.recv()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(2), completions.recv()).await.unwrap().unwrap();

        assert_eq!(first.handle, ok.id());
        assert!(first.outcome.is_success());
        assert_eq!(second.handle, failing.id());
        assert_eq!(second.outcome.code, 35);
        assert!(ok.has_completed() && failing.has_completed());

        assert!(worker.stop().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_exits_when_multi_shuts_down() {
        let engine = MemoryEngine::new();
        let multi = Arc::new(Multi::new(engine.multiplexer()));

        let (worker, mut completions) = PollWorker::spawn(Arc::clone(&multi), test_config()).unwrap();
        multi.shutdown();

        // Channel closes once the thread exits
        let closed = timeout(Duration::from_secs(2), completions.recv()).await.unwrap();
        assert!(closed.is_none());
        worker.stop().unwrap();
    }

    #[tokio::test]
    async fn test_survives_poll_errors() {
        let engine = MemoryEngine::new();
        let multi = Arc::new(Multi::new(engine.multiplexer()));
        let handle = Handle::new(engine.session());
        multi.add_handle(&handle).unwrap();
        engine.fail_next_poll(MultiplexerError::Poll("interrupted".to_string()));

        let (worker, mut completions) = PollWorker::spawn(Arc::clone(&multi), test_config()).unwrap();
        engine.finish(handle.session_key(), MultiCode::OK);

        let completion = timeout(Duration::from_secs(2), completions.recv()).await.unwrap().unwrap();
        assert_eq!(completion.handle, handle.id());
        assert_eq!(multi.metrics().poll_errors, 1);

        worker.stop().unwrap();
    }
}
