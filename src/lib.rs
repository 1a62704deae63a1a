//! A Rust client for the Ocean Observatories Initiative (OOI) M2M API.
//!
//! This crate implements the OOI request flow:
//! search the instrument catalog, request time-windowed exports of the
//! instruments' preferred streams, poll until the exports are compiled, then
//! open the produced files as datasets (or download them).
//!
//! ## Quick start
//! - Configure authentication via environment variables (`OOI_USERNAME`, `OOI_TOKEN`) or a
//!   credentials file (`~/.ooi-m2m/credentials.json`, see [`save_credentials`]).
//! - Load the catalog with [`Ooi::connect`], narrow it with [`Ooi::search`], then call
//!   [`Ooi::request_data`].
//!
//! ```no_run
//! use anyhow::Result;
//! use ooi_m2m::{Client, DataRequest, Ooi, SearchQuery};
//!
//! fn main() -> Result<()> {
//!     let client = Client::from_env()?;
//!     let mut ooi = Ooi::connect(client, None)?;
//!     ooi.search(
//!         &SearchQuery::new()
//!             .region("cabled array")
//!             .site("axial base shallow profiler")
//!             .instrument("CTD"),
//!     );
//!     let report = ooi.request_data(&DataRequest::new(Some("2018-01-01"), Some("2018-01-02")))?;
//!     println!("{} export(s) compiling", report.jobs);
//!
//!     let poll = ooi.wait(None);
//!     if poll.all_ready() {
//!         ooi.download_files(std::path::Path::new("ooi-data"), |_| true)?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Opening NetCDF results in memory needs a [`DatasetOpener`]; see
//! [`Ooi::with_opener`] and [`Ooi::to_datasets`].

#![forbid(unsafe_code)]

mod availability;
mod cache;
mod catalog;
mod client;
mod config;
mod dataset;
mod dispatch;
mod error;
mod job;
mod materialize;
mod poller;
mod pool;
mod query;
mod refdes;
mod source;
mod task;
mod time;
mod transport;
mod util;

pub use availability::{AvailabilityEntry, StreamType, check as check_availability};
pub use cache::CatalogCache;
pub use catalog::{Catalog, CatalogTables, FilteredCatalog, InstrumentStreamRecord, SearchQuery};
pub use client::{Client, StreamMeta, StreamTimes, TocInstrument, VocabEntry};
pub use config::{
    ClientConfig, Credentials, DEFAULT_BASE_URL, default_credentials_path, load_credentials, save_credentials,
};
pub use dataset::{Dataset, Values, Variable};
pub use dispatch::Dispatcher;
pub use error::{Error, Result};
pub use job::{JobHandle, Submission};
pub use materialize::{Access, DatasetOpener, DatasetResult, Materializer, PerFileOpener, list_files, normalize};
pub use poller::{JobState, PollOptions, PollOutcome, PollReport};
pub use query::{ClampWarning, MAX_JSON_LIMIT, OutputFormat, RequestDescriptor, RequestOptions, build as build_request};
pub use refdes::ReferenceDesignator;
pub use source::{DataRequest, DataSource, DownloadPlan, Ooi, RequestReport, SessionSettings};
pub use task::{BackgroundTask, CancelToken};
pub use time::{datetime_to_string, parse_timestamp, seconds_to_date, unix_time_millis};
pub use transport::{HttpTransport, Reply, Transport};
