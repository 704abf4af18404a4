use crate::cli::SimulateArgs;
use fetchmux::config::Config;
use fetchmux::engine::memory::{MemoryEngine, MemorySession};
use fetchmux::engine::{MultiCode, TransferCode};
use fetchmux::handle::Handle;
use fetchmux::multi::{Multi, MultiPhase};
use fetchmux::observability::MetricsSnapshot;
use fetchmux::worker::{PollWorker, WorkerConfig};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Transfer code reported by simulated failures (operation timed out)
const SIMULATED_FAILURE: TransferCode = TransferCode(28);
const FINISH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct Summary {
    multi_id: String,
    handles: usize,
    succeeded: usize,
    failed: usize,
    cancelled: usize,
    reported: usize,
    phase: MultiPhase,
    metrics: MetricsSnapshot,
}

fn every(n: usize, index: usize) -> bool {
    n > 0 && (index + 1) % n == 0
}

pub async fn run(args: SimulateArgs, config: Config) -> Result<(), AnyError> {
    let engine = MemoryEngine::new();

    let handles: Vec<Arc<Handle<MemorySession>>> = (0..args.handles)
        .map(|i| {
            let code = if every(args.fail_every, i) {
                SIMULATED_FAILURE
            } else {
                TransferCode::OK
            };
            Arc::new(Handle::new(engine.session_with_code(code)))
        })
        .collect();

    // Must drop before the handles
    let multi = Arc::new(Multi::with_settings(engine.multiplexer(), &config.multi));

    for handle in &handles {
        multi.add_handle(handle)?;
    }
    info!(multi_id = %multi.id(), handles = handles.len(), "Transfers registered");

    let (worker, mut completions) =
        PollWorker::spawn(Arc::clone(&multi), WorkerConfig::from_config(&config))?;

    // remove_handle waits for an in-flight poll, keep it off the runtime threads
    let targets: Vec<_> = handles
        .iter()
        .enumerate()
        .filter(|(i, _)| every(args.cancel_every, *i))
        .map(|(_, handle)| Arc::clone(handle))
        .collect();
    let cancelled = tokio::task::spawn_blocking({
        let multi = Arc::clone(&multi);
        move || {
            targets
                .iter()
                .map(|handle| multi.remove_handle(handle))
                .collect::<Result<Vec<bool>, _>>()
        }
    })
    .await??
    .into_iter()
    .filter(|removed| *removed)
    .count();

    for (i, handle) in handles.iter().enumerate() {
        if !every(args.cancel_every, i) {
            engine.finish(handle.session_key(), MultiCode::OK);
            sleep(Duration::from_millis(1)).await;
        }
    }

    let (mut succeeded, mut failed) = (0, 0);
    for handle in &handles {
        match timeout(FINISH_TIMEOUT, handle.finished()).await {
            Ok(Some(outcome)) if outcome.is_success() => succeeded += 1,
            Ok(Some(outcome)) => {
                info!(handle_id = %handle.id(), %outcome, "Transfer failed");
                failed += 1;
            }
            Ok(None) => {}
            Err(_) => warn!(handle_id = %handle.id(), "Transfer did not finish in time"),
        }
    }

    let iterations = worker.stop()?;
    let mut reported = 0;
    while completions.try_recv().is_ok() {
        reported += 1;
    }

    let multi_for_shutdown = Arc::clone(&multi);
    tokio::task::spawn_blocking(move || multi_for_shutdown.shutdown()).await?;
    info!(iterations, "Simulation finished");

    let summary = Summary {
        multi_id: multi.id().to_string(),
        handles: handles.len(),
        succeeded,
        failed,
        cancelled,
        reported,
        phase: multi.phase(),
        metrics: multi.metrics(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("multi {}", summary.multi_id);
        println!("  handles:   {}", summary.handles);
        println!("  succeeded: {}", summary.succeeded);
        println!("  failed:    {}", summary.failed);
        println!("  cancelled: {}", summary.cancelled);
        println!("  reported:  {}", summary.reported);
        println!("  phase:     {:?}", summary.phase);
    }

    Ok(())
}
