use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};

use crate::error::{Error, Result};

/// Shared cancellation flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A unit of work running on its own thread that the caller can await,
/// poll for readiness, or cancel.
///
/// Cancellation is cooperative: the work closure receives the token and is
/// expected to check it between steps.
#[derive(Debug)]
pub struct BackgroundTask<T> {
    rx: Receiver<T>,
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

impl<T: Send + 'static> BackgroundTask<T> {
    pub fn spawn<F>(name: &str, work: F) -> Result<Self>
    where
        F: FnOnce(CancelToken) -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = tx.send(work(token));
            })?;
        Ok(Self { rx, cancel, handle })
    }

    pub fn is_finished(&self) -> bool {
        !self.rx.is_empty() || self.handle.is_finished()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Blocks until the work completes.
    pub fn wait(self) -> Result<T> {
        let out = self.rx.recv().map_err(|_| lost_result());
        let _ = self.handle.join();
        out
    }

    /// Waits up to `timeout`; hands the task back if it is still running.
    pub fn wait_timeout(self, timeout: Duration) -> std::result::Result<Result<T>, Self> {
        match self.rx.recv_timeout(timeout) {
            Ok(v) => {
                let _ = self.handle.join();
                Ok(Ok(v))
            }
            Err(RecvTimeoutError::Timeout) => Err(self),
            Err(RecvTimeoutError::Disconnected) => Ok(Err(lost_result())),
        }
    }
}

fn lost_result() -> Error {
    Error::DataUnavailable("background task ended without producing a result".into())
}
