//! Dataset Materializer: turns ready export jobs into datasets.
//!
//! A ready job's THREDDS catalog lists the produced files. The data files are
//! resolved to direct access URLs and handed to a [`DatasetOpener`], which
//! merges them into one [`Dataset`] per instrument. Opening NetCDF is left to
//! the opener; this module owns listing, filtering, fan-out and the structural
//! normalization applied afterwards.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use crate::client::Client;
use crate::dataset::{Dataset, Values};
use crate::error::{Error, Result};
use crate::job::JobHandle;
use crate::pool::run_batch;
use crate::task::CancelToken;
use crate::util::guess_filename_from_url;

pub const DEFAULT_MATERIALIZE_TIMEOUT: Duration = Duration::from_secs(300);

/// Native sample-index dimension of OOI exports.
pub const OBS_DIM: &str = "obs";
pub const TIME_VAR: &str = "time";
/// Time base of OOI `time` variables.
pub const OOI_TIME_UNITS: &str = "seconds since 1900-01-01 00:00:00";

const AUXILIARY_MARKERS: [&str; 3] = ["json", "txt", "ncml"];
const CALIBRATION_MARKER: &str = "cal_";

/// Opens a set of file URLs as one dataset merged along the observation axis.
pub trait DatasetOpener: Send + Sync {
    fn open(&self, urls: &[String]) -> Result<Dataset>;
}

/// Adapts a single-file reader into a [`DatasetOpener`]: each file is read on
/// its own and the parts are concatenated along `obs`.
pub struct PerFileOpener<F> {
    read: F,
}

impl<F> PerFileOpener<F>
where
    F: Fn(&str) -> Result<Dataset> + Send + Sync,
{
    pub fn new(read: F) -> Self {
        Self { read }
    }
}

impl<F> fmt::Debug for PerFileOpener<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerFileOpener").finish_non_exhaustive()
    }
}

impl<F> DatasetOpener for PerFileOpener<F>
where
    F: Fn(&str) -> Result<Dataset> + Send + Sync,
{
    fn open(&self, urls: &[String]) -> Result<Dataset> {
        let parts = urls.iter().map(|u| (self.read)(u)).collect::<Result<Vec<_>>>()?;
        Dataset::concat(parts, OBS_DIM)
    }
}

/// How the resolved file URLs will be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Remote access through the OPeNDAP service.
    OpenDap,
    /// Whole-file download through the HTTP file server.
    Download,
}

impl Access {
    fn service_type(self) -> &'static str {
        match self {
            Access::OpenDap => "OPENDAP",
            Access::Download => "HTTPServer",
        }
    }

    fn default_base(self) -> &'static str {
        match self {
            Access::OpenDap => "/thredds/dodsC/",
            Access::Download => "/thredds/fileServer/",
        }
    }
}

/// Per-instrument outcome of materialization.
#[derive(Debug)]
pub enum DatasetResult {
    Ready {
        reference_designator: String,
        dataset: Dataset,
    },
    /// The job finished but produced nothing usable.
    Empty {
        reference_designator: String,
        reason: String,
    },
    /// The job has not completed yet; check back later.
    Pending {
        reference_designator: String,
        handle: JobHandle,
    },
    Failed {
        reference_designator: String,
        error: Error,
    },
}

impl DatasetResult {
    pub fn reference_designator(&self) -> &str {
        match self {
            DatasetResult::Ready {
                reference_designator,
                ..
            }
            | DatasetResult::Empty {
                reference_designator,
                ..
            }
            | DatasetResult::Pending {
                reference_designator,
                ..
            }
            | DatasetResult::Failed {
                reference_designator,
                ..
            } => reference_designator,
        }
    }

    pub fn dataset(&self) -> Option<&Dataset> {
        match self {
            DatasetResult::Ready { dataset, .. } => Some(dataset),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, DatasetResult::Ready { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CatalogEntry {
    name: String,
    url_path: String,
}

#[derive(Debug, Default)]
struct ThreddsCatalog {
    services: Vec<(String, String)>,
    datasets: Vec<CatalogEntry>,
}

fn parse_thredds(xml: &str) -> Result<ThreddsCatalog> {
    let opts = roxmltree::ParsingOptions {
        allow_dtd: true,
        ..roxmltree::ParsingOptions::default()
    };
    let doc = roxmltree::Document::parse_with_options(xml, opts)
        .map_err(|e| Error::MalformedReply(format!("unreadable THREDDS catalog: {e}")))?;

    let mut cat = ThreddsCatalog::default();
    for node in doc.descendants().filter(roxmltree::Node::is_element) {
        match node.tag_name().name() {
            "service" => {
                if let (Some(kind), Some(base)) = (node.attribute("serviceType"), node.attribute("base")) {
                    cat.services.push((kind.to_string(), base.to_string()));
                }
            }
            "dataset" => {
                if let Some(url_path) = node.attribute("urlPath") {
                    let name = node
                        .attribute("name")
                        .map(str::to_string)
                        .or_else(|| guess_filename_from_url(url_path))
                        .unwrap_or_default();
                    cat.datasets.push(CatalogEntry {
                        name,
                        url_path: url_path.to_string(),
                    });
                }
            }
            _ => {}
        }
    }
    Ok(cat)
}

fn is_data_file(entry: &CatalogEntry) -> bool {
    !AUXILIARY_MARKERS.iter().any(|m| entry.name.contains(m)) && entry.url_path.ends_with(".nc")
}

/// Keeps `url` if some designator in `refdes` occurs in it at least twice
/// (once in the job directory, once in the file name). An empty list keeps all.
fn mentions_instrument(url: &str, refdes: &[String]) -> bool {
    refdes.is_empty() || refdes.iter().any(|rd| !rd.is_empty() && url.matches(rd.as_str()).count() >= 2)
}

/// Lists the data files a job produced, resolved for `access`.
///
/// The browsable `catalog.html` is read as its `catalog.xml` twin. Descriptor
/// and log files are skipped, as are files that do not belong to one of the
/// `refdes` instruments.
pub fn list_files(client: &Client, catalog_url: &str, access: Access, refdes: &[String]) -> Result<Vec<String>> {
    let xml_url = catalog_url.replace(".html", ".xml");
    let xml = client.fetch_public_text(&xml_url)?;
    let cat = parse_thredds(&xml)?;

    let base = cat
        .services
        .iter()
        .find(|(kind, _)| kind.eq_ignore_ascii_case(access.service_type()))
        .map(|(_, base)| base.as_str())
        .unwrap_or(access.default_base());
    let root = Url::parse(&xml_url)?.join(base)?;

    let mut urls = Vec::new();
    for entry in cat.datasets.iter().filter(|e| is_data_file(e)) {
        let url = root.join(&entry.url_path)?.to_string();
        if mentions_instrument(&url, refdes) {
            urls.push(url);
        } else {
            debug!(file = %entry.name, "skipping file of another instrument");
        }
    }
    debug!(catalog = %xml_url, files = urls.len(), "listed job files");
    Ok(urls)
}

/// Puts an OOI dataset into analysis shape: numeric time offsets become
/// timestamps and the `obs` index is replaced by `time`.
pub fn normalize(ds: &mut Dataset) -> Result<()> {
    ds.decode_times();
    let time_along_obs = ds
        .variable(TIME_VAR)
        .is_some_and(|v| v.dims.len() == 1 && v.dims[0] == OBS_DIM);
    if time_along_obs {
        ds.swap_dims(OBS_DIM, TIME_VAR)?;
    }
    Ok(())
}

/// Builds a dataset from the rows of a synchronous json export.
pub fn inline_dataset(records: &[serde_json::Value]) -> Result<Dataset> {
    let mut ds = Dataset::from_records(records, OBS_DIM)?;
    if let Some(time) = ds.data_vars.get_mut(TIME_VAR) {
        if matches!(time.values, Values::Float(_)) && !time.attrs.contains_key("units") {
            time.attrs.insert("units".into(), OOI_TIME_UNITS.into());
        }
    }
    normalize(&mut ds)?;
    Ok(ds)
}

#[derive(Clone)]
pub struct Materializer {
    client: Client,
    opener: Arc<dyn DatasetOpener>,
    workers: usize,
    timeout: Duration,
}

impl fmt::Debug for Materializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Materializer")
            .field("client", &self.client)
            .field("workers", &self.workers)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Materializer {
    pub fn new(client: Client, opener: Arc<dyn DatasetOpener>) -> Self {
        Self {
            client,
            opener,
            workers: crate::dispatch::DEFAULT_WORKERS,
            timeout: DEFAULT_MATERIALIZE_TIMEOUT,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Opens every ready job; the output is index-aligned with `jobs`.
    ///
    /// An empty listing yields [`DatasetResult::Empty`]; jobs abandoned when
    /// the time budget runs out come back as [`DatasetResult::Failed`].
    pub fn materialize(
        &self,
        jobs: Vec<JobHandle>,
        instrument_refs: &[String],
        cancel: Option<&CancelToken>,
    ) -> Vec<DatasetResult> {
        if jobs.is_empty() {
            return Vec::new();
        }
        info!(jobs = jobs.len(), "acquiring data from opendap urls");
        let names: Vec<String> = jobs.iter().map(|j| j.reference_designator.clone()).collect();
        let client = self.client.clone();
        let opener = Arc::clone(&self.opener);
        let refs = instrument_refs.to_vec();
        let results = run_batch(
            "ooi-materialize",
            jobs,
            self.workers,
            Some(self.timeout),
            cancel,
            move |job: JobHandle| open_job(&client, opener.as_ref(), &job, &refs),
        );

        let cancelled = cancel.is_some_and(|c| c.is_cancelled());
        results
            .into_iter()
            .zip(names)
            .map(|(r, reference_designator)| match r {
                Some(r) => r,
                None => DatasetResult::Failed {
                    reference_designator,
                    error: if cancelled {
                        Error::Cancelled
                    } else {
                        Error::TimedOut(self.timeout)
                    },
                },
            })
            .collect()
    }
}

/// Lists the downloadable data files of `jobs`, skipping calibration files.
/// A job whose listing fails is logged and left out.
pub fn plan_downloads(client: &Client, jobs: &[JobHandle], instrument_refs: &[String]) -> Vec<String> {
    let mut urls = Vec::new();
    for job in jobs {
        match list_files(client, &job.catalog_url, Access::Download, instrument_refs) {
            Ok(files) => urls.extend(files.into_iter().filter(|u| !u.contains(CALIBRATION_MARKER))),
            Err(e) => warn!(refdes = %job.reference_designator, error = %e, "could not list job files"),
        }
    }
    urls
}

/// Downloads `urls` into `dest` on `workers` threads; index-aligned with `urls`.
pub fn download_all(
    client: &Client,
    urls: Vec<String>,
    dest: &Path,
    workers: usize,
    timeout: Duration,
    cancel: Option<&CancelToken>,
) -> Result<Vec<Result<PathBuf>>> {
    std::fs::create_dir_all(dest)?;
    if urls.is_empty() {
        return Ok(Vec::new());
    }

    info!(files = urls.len(), dest = %dest.display(), "downloading files");
    let transport = Arc::clone(client.transport());
    let target_dir = dest.to_path_buf();
    let results = run_batch("ooi-download", urls, workers, Some(timeout), cancel, move |url: String| {
        let name = guess_filename_from_url(&url)
            .ok_or_else(|| Error::InvalidRequest(format!("no file name in {}", url)))?;
        transport.download(&url, &target_dir.join(name))
    });

    let cancelled = cancel.is_some_and(|c| c.is_cancelled());
    Ok(results
        .into_iter()
        .map(|r| match r {
            Some(r) => r,
            None if cancelled => Err(Error::Cancelled),
            None => Err(Error::TimedOut(timeout)),
        })
        .collect())
}

fn open_job(client: &Client, opener: &dyn DatasetOpener, job: &JobHandle, refs: &[String]) -> DatasetResult {
    let reference_designator = job.reference_designator.clone();
    let urls = match list_files(client, &job.catalog_url, Access::OpenDap, refs) {
        Ok(urls) => urls,
        Err(error) => {
            warn!(refdes = %reference_designator, error = %error, "could not list job files");
            return DatasetResult::Failed {
                reference_designator,
                error,
            };
        }
    };
    if urls.is_empty() {
        warn!(refdes = %reference_designator, catalog = %job.catalog_url, "job produced no data files");
        return DatasetResult::Empty {
            reference_designator,
            reason: format!("no data files listed at {}", job.catalog_url),
        };
    }

    let opened = opener.open(&urls).and_then(|mut ds| {
        normalize(&mut ds)?;
        Ok(ds)
    });
    match opened {
        Ok(dataset) => {
            debug!(refdes = %reference_designator, files = urls.len(), "dataset opened");
            DatasetResult::Ready {
                reference_designator,
                dataset,
            }
        }
        Err(error) => {
            warn!(refdes = %reference_designator, error = %error, "could not open dataset");
            DatasetResult::Failed {
                reference_designator,
                error,
            }
        }
    }
}
