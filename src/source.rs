//! The `DataSource` capability contract and the OOI session implementing it.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::availability::{self, StreamType};
use crate::cache::CatalogCache;
use crate::catalog::{Catalog, FilteredCatalog, InstrumentStreamRecord, SearchQuery};
use crate::client::Client;
use crate::dispatch::{DEFAULT_DISPATCH_TIMEOUT, DEFAULT_MAX_INSTRUMENTS, DEFAULT_WORKERS, Dispatcher};
use crate::error::{Error, Result};
use crate::job::{JobHandle, Submission};
use crate::materialize::{
    DEFAULT_MATERIALIZE_TIMEOUT, DatasetOpener, DatasetResult, Materializer, download_all, inline_dataset,
    plan_downloads,
};
use crate::poller::{self, JobState, PollOptions, PollReport};
use crate::query::{RequestOptions, build_batch};
use crate::task::{BackgroundTask, CancelToken};
use crate::util::split_terms;

/// Deployment lookups are refused for larger selections.
pub const MAX_DEPLOYMENT_RECORDS: usize = 50;

/// What every data source offers: find streams, request them, open the results.
pub trait DataSource {
    fn source_name(&self) -> &str;

    /// Narrows the selection; returns the new view.
    fn search(&mut self, query: &SearchQuery) -> &FilteredCatalog;

    fn request_data(&mut self, request: &DataRequest) -> Result<RequestReport>;

    /// Waits for outstanding requests and opens their results, one entry per
    /// submitted instrument.
    fn to_datasets(&mut self) -> Result<Vec<DatasetResult>>;
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_instruments: usize,
    pub workers: usize,
    pub dispatch_timeout: Duration,
    pub poll: PollOptions,
    pub materialize_timeout: Duration,
    pub stream_type: StreamType,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_instruments: DEFAULT_MAX_INSTRUMENTS,
            workers: DEFAULT_WORKERS,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            poll: PollOptions::default(),
            materialize_timeout: DEFAULT_MATERIALIZE_TIMEOUT,
            stream_type: StreamType::Science,
        }
    }
}

/// A time-windowed data request for the current selection.
#[derive(Debug, Clone, Default)]
pub struct DataRequest {
    /// Start of the window; defaults to the stream's first sample.
    pub begin: Option<String>,
    /// End of the window; defaults to the stream's last sample.
    pub end: Option<String>,
    pub options: RequestOptions,
    /// Comma-separated stream names; instruments whose chosen stream is not
    /// listed are skipped.
    pub streams: Option<String>,
}

impl DataRequest {
    pub fn new(begin: Option<&str>, end: Option<&str>) -> Self {
        Self {
            begin: begin.map(str::to_string),
            end: end.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_streams(mut self, streams: impl Into<String>) -> Self {
        self.streams = Some(streams.into());
        self
    }
}

/// What happened to each selected instrument in [`Ooi::request_data`].
#[derive(Debug, Default)]
pub struct RequestReport {
    /// Asynchronous export jobs now compiling.
    pub jobs: usize,
    /// Synchronous (json) exports already holding their records.
    pub inline: usize,
    /// Instruments dropped before submission (no stream, empty window).
    pub skipped: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

impl RequestReport {
    pub fn submitted(&self) -> usize {
        self.jobs + self.inline
    }
}

/// Lets the caller approve a download before anything is written.
#[derive(Debug)]
pub struct DownloadPlan<'a> {
    pub dest: &'a Path,
    pub urls: &'a [String],
}

/// A search and request session against OOI M2M.
pub struct Ooi {
    client: Client,
    catalog: Catalog,
    filtered: FilteredCatalog,
    settings: SessionSettings,
    opener: Option<Arc<dyn DatasetOpener>>,
    submissions: Vec<Submission>,
}

impl std::fmt::Debug for Ooi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ooi")
            .field("client", &self.client)
            .field("catalog", &self.catalog.len())
            .field("selected", &self.filtered.len())
            .field("settings", &self.settings)
            .field("submissions", &self.submissions.len())
            .finish_non_exhaustive()
    }
}

impl Ooi {
    pub fn new(client: Client, catalog: Catalog) -> Self {
        let filtered = catalog.all();
        Self {
            client,
            catalog,
            filtered,
            settings: SessionSettings::default(),
            opener: None,
            submissions: Vec::new(),
        }
    }

    /// Loads the catalog (see [`Catalog::load`]) and starts a session on it.
    pub fn connect(client: Client, cache: Option<&CatalogCache>) -> Result<Self> {
        let catalog = Catalog::load(&client, cache)?;
        Ok(Self::new(client, catalog))
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the collaborator that opens NetCDF results.
    pub fn with_opener(mut self, opener: Arc<dyn DatasetOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn selection(&self) -> &FilteredCatalog {
        &self.filtered
    }

    /// Number of selected instrument streams.
    pub fn len(&self) -> usize {
        self.filtered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filtered.is_empty()
    }

    pub fn instruments(&self) -> Vec<String> {
        self.filtered.instruments()
    }

    pub fn submissions(&self) -> &[Submission] {
        &self.submissions
    }

    pub fn jobs(&self) -> Vec<JobHandle> {
        self.submissions.iter().filter_map(|s| s.job().cloned()).collect()
    }

    // Designators behind the outstanding submissions. The selection may have
    // moved on since they were requested.
    fn requested_instruments(&self) -> Vec<String> {
        let refs: BTreeSet<&str> = self.submissions.iter().map(Submission::reference_designator).collect();
        refs.into_iter().map(str::to_string).collect()
    }

    /// Reloads the catalog and resets the selection.
    pub fn refresh_catalog(&mut self, cache: Option<&CatalogCache>) -> Result<()> {
        self.catalog.refresh(&self.client, cache)?;
        self.clear();
        Ok(())
    }

    pub fn search(&mut self, query: &SearchQuery) -> &FilteredCatalog {
        self.filtered = self.catalog.search(query);
        info!(selected = self.filtered.len(), "catalog searched");
        &self.filtered
    }

    /// Drops the selection and any outstanding requests.
    pub fn clear(&mut self) {
        self.filtered = self.catalog.all();
        self.submissions.clear();
    }

    /// Requests data for every selected instrument's preferred stream.
    ///
    /// Configuration problems (bad options, too many instruments, malformed
    /// designators) fail the call before any export request is sent;
    /// everything else is reported per instrument.
    pub fn request_data(&mut self, request: &DataRequest) -> Result<RequestReport> {
        request.options.validate()?;
        let instruments = self.filtered.instruments();
        if instruments.is_empty() {
            return Err(Error::InvalidRequest(
                "no instruments selected; narrow the catalog with search first".into(),
            ));
        }
        let dispatcher = Dispatcher::new(self.client.clone())
            .with_max_instruments(self.settings.max_instruments)
            .with_workers(self.settings.workers)
            .with_timeout(self.settings.dispatch_timeout);
        dispatcher.check_cap(instruments.len())?;

        let mut avail = availability::check(&self.client, &self.filtered, self.settings.stream_type)?;
        if let Some(streams) = request.streams.as_deref() {
            let wanted: HashSet<String> = split_terms(streams).into_iter().collect();
            avail.retain(|_, entry| wanted.contains(&entry.stream));
        }

        let mut report = RequestReport::default();
        let mut items = Vec::new();
        for refdes in &instruments {
            let Some(entry) = avail.get(refdes) else {
                warn!(refdes = %refdes, "no matching stream, skipping instrument");
                report.skipped.push(refdes.clone());
                continue;
            };
            if let Some(record) = self.first_record(refdes) {
                items.push((record, Some(entry)));
            }
        }

        let built = build_batch(
            &self.client.data_url(),
            items.iter().copied(),
            request.begin.as_deref(),
            request.end.as_deref(),
            &request.options,
        )?;
        let mut descriptors = Vec::new();
        for ((record, _), d) in items.iter().zip(built) {
            match d {
                Some(d) => descriptors.push(d),
                None => report.skipped.push(record.reference_designator.clone()),
            }
        }

        let names: Vec<String> = descriptors.iter().map(|d| d.reference_designator.clone()).collect();
        self.submissions.clear();
        for (refdes, outcome) in names.into_iter().zip(dispatcher.dispatch(descriptors, None)?) {
            match outcome {
                Ok(sub) => {
                    match sub {
                        Submission::Job(_) => report.jobs += 1,
                        Submission::Inline { .. } => report.inline += 1,
                    }
                    self.submissions.push(sub);
                }
                Err(e) => report.failed.push((refdes, e)),
            }
        }
        info!(
            jobs = report.jobs,
            inline = report.inline,
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "data requested"
        );
        Ok(report)
    }

    fn first_record(&self, refdes: &str) -> Option<&InstrumentStreamRecord> {
        self.filtered.iter().find(|r| r.reference_designator == refdes)
    }

    /// One status pass over the outstanding jobs. Returns their catalog URLs
    /// once every job is ready, `None` while any is still compiling.
    pub fn check_status(&self) -> Option<Vec<String>> {
        let jobs = self.jobs();
        let mut states = vec![JobState::Pending; jobs.len()];
        poller::check_once(self.client.transport().as_ref(), &jobs, &mut states);
        if states.iter().any(|s| *s == JobState::Pending) {
            return None;
        }
        Some(jobs.into_iter().map(|j| j.catalog_url).collect())
    }

    /// Polls the outstanding jobs within the configured wait budget.
    pub fn wait(&self, cancel: Option<&CancelToken>) -> PollReport {
        poller::poll(self.client.transport().as_ref(), &self.jobs(), &self.settings.poll, cancel)
    }

    /// Like [`Ooi::wait`] on a background thread.
    pub fn wait_in_background(&self) -> Result<BackgroundTask<PollReport>> {
        poller::spawn(Arc::clone(self.client.transport()), self.jobs(), self.settings.poll.clone())
    }

    /// Waits for the outstanding requests and opens every result.
    ///
    /// Jobs still compiling when the wait budget runs out come back as
    /// [`DatasetResult::Pending`].
    pub fn to_datasets(&self, cancel: Option<&CancelToken>) -> Result<Vec<DatasetResult>> {
        let jobs = self.jobs();
        if !jobs.is_empty() && self.opener.is_none() {
            return Err(Error::Config(
                "no dataset opener configured; set one with Ooi::with_opener or use download_files".into(),
            ));
        }

        let report = self.wait(cancel);
        let mut states = report.states.iter();
        let mut slots: Vec<Option<DatasetResult>> = Vec::with_capacity(self.submissions.len());
        let mut ready_slots = Vec::new();
        let mut ready = Vec::new();
        for sub in &self.submissions {
            let slot = match sub {
                Submission::Inline {
                    reference_designator,
                    records,
                } => Some(inline_result(reference_designator, records)),
                Submission::Job(job) => match states.next() {
                    Some(JobState::Ready) => {
                        ready_slots.push(slots.len());
                        ready.push(job.clone());
                        None
                    }
                    _ => Some(DatasetResult::Pending {
                        reference_designator: job.reference_designator.clone(),
                        handle: job.clone(),
                    }),
                },
            };
            slots.push(slot);
        }

        if let Some(opener) = &self.opener {
            let opened = Materializer::new(self.client.clone(), Arc::clone(opener))
                .with_workers(self.settings.workers)
                .with_timeout(self.settings.materialize_timeout)
                .materialize(ready, &self.requested_instruments(), cancel);
            for (idx, result) in ready_slots.into_iter().zip(opened) {
                slots[idx] = Some(result);
            }
        }
        Ok(slots.into_iter().flatten().collect())
    }

    /// Downloads the data files of every ready job into `dest`.
    ///
    /// `confirm` sees the planned files first; returning `false` aborts with
    /// [`Error::Cancelled`] before anything is fetched.
    pub fn download_files<F>(&self, dest: &Path, confirm: F) -> Result<Vec<Result<PathBuf>>>
    where
        F: FnOnce(&DownloadPlan<'_>) -> bool,
    {
        if self.check_status().is_none() {
            return Err(Error::DataUnavailable(
                "data is still compiling; check back later".into(),
            ));
        }
        let urls = plan_downloads(&self.client, &self.jobs(), &self.requested_instruments());
        if !confirm(&DownloadPlan { dest, urls: &urls }) {
            return Err(Error::Cancelled);
        }
        download_all(
            &self.client,
            urls,
            dest,
            self.settings.workers,
            self.settings.materialize_timeout,
            None,
        )
    }

    /// Deployment records of each selected instrument, keyed by designator.
    pub fn deployments(&self) -> Result<BTreeMap<String, Vec<serde_json::Value>>> {
        if self.filtered.len() > MAX_DEPLOYMENT_RECORDS {
            return Err(Error::InvalidRequest(format!(
                "you have {} unique streams; too many to fetch deployments, narrow the selection with search",
                self.filtered.len()
            )));
        }
        let mut out = BTreeMap::new();
        for refdes in self.instruments() {
            match self.client.deployments(&refdes) {
                Ok(deps) => {
                    out.insert(refdes, deps);
                }
                Err(e) => warn!(refdes = %refdes, error = %e, "could not fetch deployments"),
            }
        }
        Ok(out)
    }
}

fn inline_result(refdes: &str, records: &[serde_json::Value]) -> DatasetResult {
    let reference_designator = refdes.to_string();
    if records.is_empty() {
        warn!(refdes, "json export returned no records");
        return DatasetResult::Empty {
            reference_designator,
            reason: "no records returned".into(),
        };
    }
    match inline_dataset(records) {
        Ok(dataset) => DatasetResult::Ready {
            reference_designator,
            dataset,
        },
        Err(error) => DatasetResult::Failed {
            reference_designator,
            error,
        },
    }
}

impl DataSource for Ooi {
    fn source_name(&self) -> &str {
        "OOI"
    }

    fn search(&mut self, query: &SearchQuery) -> &FilteredCatalog {
        Ooi::search(self, query)
    }

    fn request_data(&mut self, request: &DataRequest) -> Result<RequestReport> {
        Ooi::request_data(self, request)
    }

    fn to_datasets(&mut self) -> Result<Vec<DatasetResult>> {
        Ooi::to_datasets(self, None)
    }
}
