use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use tracing::{debug, warn};

use crate::task::CancelToken;

const CANCEL_CHECK: Duration = Duration::from_millis(100);

/// Runs `task` over `items` on `workers` threads fed from a bounded FIFO queue.
///
/// The output is index-aligned with `items`. Items still queued or running when
/// `deadline` passes or `cancel` fires are abandoned and come back as `None`;
/// results that already landed are kept.
pub fn run_batch<I, T, F>(
    name: &str,
    items: Vec<I>,
    workers: usize,
    deadline: Option<Duration>,
    cancel: Option<&CancelToken>,
    task: F,
) -> Vec<Option<T>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> T + Send + Sync + 'static,
{
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }

    let workers = workers.max(1).min(total);
    let results: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new((0..total).map(|_| None).collect()));
    let abandon = CancelToken::new();
    let task = Arc::new(task);

    let (work_tx, work_rx) = bounded::<(usize, I)>(workers);
    let (done_tx, done_rx) = unbounded::<usize>();

    for idx in 0..workers {
        let rx = work_rx.clone();
        let done = done_tx.clone();
        let results = Arc::clone(&results);
        let abandon = abandon.clone();
        let task = Arc::clone(&task);
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", name, idx))
            .spawn(move || worker_loop(rx, done, results, abandon, task));
        if let Err(e) = spawned {
            warn!(pool = name, error = %e, "failed to spawn worker");
        }
    }
    drop(work_rx);
    drop(done_tx);

    {
        let abandon = abandon.clone();
        let feeder = thread::Builder::new()
            .name(format!("{}-feed", name))
            .spawn(move || feed(items, work_tx, abandon));
        if let Err(e) = feeder {
            warn!(pool = name, error = %e, "failed to spawn feeder");
        }
    }

    let started = Instant::now();
    let deadline_at = deadline.map(|d| started + d);
    let mut finished = 0usize;
    while finished < total {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            warn!(pool = name, finished, total, "batch cancelled");
            break;
        }
        let mut wait = CANCEL_CHECK;
        if let Some(at) = deadline_at {
            let now = Instant::now();
            if now >= at {
                warn!(pool = name, finished, total, elapsed = ?started.elapsed(), "batch timed out");
                break;
            }
            wait = wait.min(at - now);
        }
        match done_rx.recv_timeout(wait) {
            Ok(_) => finished += 1,
            Err(RecvTimeoutError::Timeout) => continue,
            // every worker has exited
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    abandon.cancel();
    debug!(pool = name, finished, total, elapsed = ?started.elapsed(), "batch done");

    let mut guard = results.lock().unwrap_or_else(|e| e.into_inner());
    std::mem::take(&mut *guard)
}

fn feed<I>(items: Vec<I>, tx: Sender<(usize, I)>, abandon: CancelToken) {
    for pair in items.into_iter().enumerate() {
        if abandon.is_cancelled() || tx.send(pair).is_err() {
            break;
        }
    }
}

fn worker_loop<I, T, F>(
    rx: Receiver<(usize, I)>,
    done: Sender<usize>,
    results: Arc<Mutex<Vec<Option<T>>>>,
    abandon: CancelToken,
    task: Arc<F>,
) where
    F: Fn(I) -> T,
{
    while let Ok((idx, item)) = rx.recv() {
        if abandon.is_cancelled() {
            break;
        }
        let out = (*task)(item);
        {
            let mut guard = results.lock().unwrap_or_else(|e| e.into_inner());
            // the slot is gone once the batch has been collected
            if let Some(slot) = guard.get_mut(idx) {
                *slot = Some(out);
            }
        }
        let _ = done.send(idx);
    }
}
