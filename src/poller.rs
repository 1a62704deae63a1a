//! Completion Poller: probes export jobs until their results are ready.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::job::JobHandle;
use crate::task::{BackgroundTask, CancelToken};
use crate::transport::Transport;

const SLEEP_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Ready,
}

#[derive(Debug, Clone)]
pub struct PollOptions {
    /// Delay between probe rounds.
    pub interval: Duration,
    /// Give up (reporting the jobs as still pending) after this long.
    pub max_wait: Option<Duration>,
    pub progress: bool,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_wait: Some(Duration::from_secs(3600)),
            progress: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing to poll.
    Empty,
    AllReady,
    /// The wait budget ran out; some jobs are still compiling.
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PollReport {
    /// Index-aligned with the polled handles.
    pub states: Vec<JobState>,
    pub elapsed: Duration,
    pub probes: usize,
    pub outcome: PollOutcome,
}

impl PollReport {
    pub fn all_ready(&self) -> bool {
        self.states.iter().all(|s| *s == JobState::Ready)
    }

    pub fn pending(&self) -> usize {
        self.states.iter().filter(|s| **s == JobState::Pending).count()
    }
}

/// One probe of `<status root>/status.txt`; anything but HTTP 200 is pending.
pub fn probe(transport: &dyn Transport, handle: &JobHandle) -> JobState {
    match transport.get(&handle.status_url(), &[], None) {
        Ok(reply) if reply.status == 200 => JobState::Ready,
        Ok(reply) => {
            debug!(status = reply.status, root = %handle.status_root, "still compiling");
            JobState::Pending
        }
        Err(e) => {
            debug!(root = %handle.status_root, error = %e, "status probe failed");
            JobState::Pending
        }
    }
}

/// Probes every handle still pending in `states` once. Returns the number of probes.
pub fn check_once(transport: &dyn Transport, handles: &[JobHandle], states: &mut [JobState]) -> usize {
    let mut probes = 0;
    for (handle, state) in handles.iter().zip(states.iter_mut()) {
        if *state == JobState::Ready {
            continue;
        }
        probes += 1;
        *state = probe(transport, handle);
        if *state == JobState::Ready {
            info!(root = %handle.status_root, refdes = %handle.reference_designator, "request completed");
        }
    }
    probes
}

/// Polls until every handle is ready, the wait budget is spent, or `cancel` fires.
///
/// Ready handles are never probed again. Running out of budget is reported in
/// the outcome, not as an error.
pub fn poll(
    transport: &dyn Transport,
    handles: &[JobHandle],
    opts: &PollOptions,
    cancel: Option<&CancelToken>,
) -> PollReport {
    let started = Instant::now();
    let mut states = vec![JobState::Pending; handles.len()];
    if handles.is_empty() {
        return PollReport {
            states,
            elapsed: Duration::ZERO,
            probes: 0,
            outcome: PollOutcome::Empty,
        };
    }

    let spinner = opts.progress.then(|| {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}") {
            pb.set_style(style);
        }
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    });

    let mut probes = 0usize;
    let outcome = loop {
        probes += check_once(transport, handles, &mut states);
        let pending = states.iter().filter(|s| **s == JobState::Pending).count();
        if pending == 0 {
            break PollOutcome::AllReady;
        }
        if cancel.is_some_and(|c| c.is_cancelled()) {
            break PollOutcome::Cancelled;
        }

        let elapsed = started.elapsed();
        let mut wait = opts.interval;
        if let Some(max) = opts.max_wait {
            if elapsed >= max {
                warn!(
                    elapsed_s = elapsed.as_secs(),
                    pending,
                    "data is still compiling; check back later"
                );
                break PollOutcome::TimedOut;
            }
            wait = wait.min(max - elapsed);
        }

        info!(elapsed_s = elapsed.as_secs(), pending, total = handles.len(), "time elapsed");
        if let Some(pb) = &spinner {
            pb.set_message(format!("{} of {} request(s) compiling", pending, handles.len()));
        }
        if sleep_unless_cancelled(wait, cancel) {
            break PollOutcome::Cancelled;
        }
    };

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    PollReport {
        states,
        elapsed: started.elapsed(),
        probes,
        outcome,
    }
}

/// Runs [`poll`] on a background thread; cancelling the task stops the loop.
pub fn spawn(
    transport: Arc<dyn Transport>,
    handles: Vec<JobHandle>,
    opts: PollOptions,
) -> Result<BackgroundTask<PollReport>> {
    BackgroundTask::spawn("ooi-poller", move |token| {
        poll(transport.as_ref(), &handles, &opts, Some(&token))
    })
}

// Returns true when woken by cancellation.
fn sleep_unless_cancelled(total: Duration, cancel: Option<&CancelToken>) -> bool {
    let until = Instant::now() + total;
    loop {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return true;
        }
        let now = Instant::now();
        if now >= until {
            return false;
        }
        thread::sleep(SLEEP_SLICE.min(until - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::CannedTransport;

    fn handle(name: &str) -> JobHandle {
        JobHandle {
            reference_designator: "RS03AXPS-PC03A-4A-CTDPFA303".into(),
            catalog_url: format!("https://t/thredds/catalog/ooi/u/{name}/catalog.html"),
            status_root: format!("https://t/async_results/u/{name}"),
            request_uuid: None,
        }
    }

    fn quick() -> PollOptions {
        PollOptions {
            interval: Duration::ZERO,
            max_wait: Some(Duration::from_secs(5)),
            progress: false,
        }
    }

    #[test]
    fn ready_only_after_first_200() {
        for n in [0usize, 1, 4] {
            let mut t = CannedTransport::new();
            for _ in 0..n {
                t = t.route("a/status.txt", 404, "");
            }
            t = t.route("a/status.txt", 200, "complete");

            let report = poll(&t, &[handle("a")], &quick(), None);
            assert_eq!(report.outcome, PollOutcome::AllReady);
            assert_eq!(report.probes, n + 1);
            assert_eq!(t.count("status.txt"), n + 1);
        }
    }

    #[test]
    fn ready_handles_are_not_probed_again() {
        let t = CannedTransport::new()
            .route("a/status.txt", 200, "")
            .route("b/status.txt", 404, "")
            .route("b/status.txt", 404, "")
            .route("b/status.txt", 200, "");
        let report = poll(&t, &[handle("a"), handle("b")], &quick(), None);
        assert!(report.all_ready());
        assert_eq!(t.count("a/status.txt"), 1);
        assert_eq!(t.count("b/status.txt"), 3);
    }

    #[test]
    fn empty_batch_is_immediate() {
        let t = CannedTransport::new();
        let report = poll(&t, &[], &PollOptions::default(), None);
        assert_eq!(report.outcome, PollOutcome::Empty);
        assert_eq!(report.probes, 0);
        assert!(t.calls().is_empty());
    }

    #[test]
    fn exhausted_budget_reports_pending() {
        let t = CannedTransport::new().route("status.txt", 404, "");
        let opts = PollOptions {
            interval: Duration::from_millis(20),
            max_wait: Some(Duration::from_millis(100)),
            progress: false,
        };
        let report = poll(&t, &[handle("a")], &opts, None);
        assert_eq!(report.outcome, PollOutcome::TimedOut);
        assert_eq!(report.pending(), 1);
        assert!(report.probes >= 2);
    }

    #[test]
    fn background_poll_can_be_cancelled() {
        let t: Arc<dyn Transport> = Arc::new(CannedTransport::new().route("status.txt", 404, ""));
        let opts = PollOptions {
            interval: Duration::from_secs(60),
            max_wait: None,
            progress: false,
        };
        let task = spawn(t, vec![handle("a")], opts).unwrap();
        thread::sleep(Duration::from_millis(50));
        task.cancel();
        let report = task.wait().unwrap();
        assert_eq!(report.outcome, PollOutcome::Cancelled);
        assert_eq!(report.probes, 1);
    }
}
