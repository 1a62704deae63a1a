//! Request Dispatcher: submits export requests concurrently with partial-failure semantics.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{info, warn};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::job::{Submission, parse_submission};
use crate::pool::run_batch;
use crate::query::RequestDescriptor;
use crate::task::CancelToken;

pub const DEFAULT_MAX_INSTRUMENTS: usize = 5;
pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: Client,
    max_instruments: usize,
    workers: usize,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            max_instruments: DEFAULT_MAX_INSTRUMENTS,
            workers: DEFAULT_WORKERS,
            timeout: DEFAULT_DISPATCH_TIMEOUT,
        }
    }

    pub fn with_max_instruments(mut self, max: usize) -> Self {
        self.max_instruments = max;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Overall wall-clock budget for a batch.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_instruments(&self) -> usize {
        self.max_instruments
    }

    pub fn check_cap(&self, instruments: usize) -> Result<()> {
        if instruments > self.max_instruments {
            return Err(Error::TooManyInstruments {
                requested: instruments,
                max: self.max_instruments,
            });
        }
        Ok(())
    }

    /// Submits every descriptor; the output is index-aligned with the input.
    ///
    /// Only the instrument cap fails the call as a whole, and it is checked
    /// before any request goes out. Everything else is a per-item `Err`,
    /// including items abandoned when the batch budget runs out.
    pub fn dispatch(
        &self,
        descriptors: Vec<RequestDescriptor>,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<Result<Submission>>> {
        let instruments: HashSet<&str> = descriptors
            .iter()
            .map(|d| d.reference_designator.as_str())
            .collect();
        self.check_cap(instruments.len())?;
        if descriptors.is_empty() {
            return Ok(Vec::new());
        }

        info!(requests = descriptors.len(), "requesting data");
        let client = self.client.clone();
        let results = run_batch(
            "ooi-dispatch",
            descriptors,
            self.workers,
            Some(self.timeout),
            cancel,
            move |d: RequestDescriptor| submit(&client, &d),
        );

        let cancelled = cancel.is_some_and(|c| c.is_cancelled());
        let out: Vec<Result<Submission>> = results
            .into_iter()
            .map(|r| match r {
                Some(r) => r,
                None if cancelled => Err(Error::Cancelled),
                None => Err(Error::TimedOut(self.timeout)),
            })
            .collect();

        let failed = out.iter().filter(|r| r.is_err()).count();
        info!(
            submitted = out.len() - failed,
            failed, "data request complete, please wait for data to be compiled"
        );
        Ok(out)
    }
}

fn submit(client: &Client, d: &RequestDescriptor) -> Result<Submission> {
    let result = client
        .fetch(&d.url, &d.params())
        .and_then(|reply| parse_submission(&reply, &d.reference_designator));
    if let Err(e) = &result {
        warn!(refdes = %d.reference_designator, stream = %d.stream, error = %e, "request failed");
    }
    result
}
