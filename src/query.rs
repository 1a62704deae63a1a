//! Query Builder: turns a catalog record and a user time window into a
//! fully resolved export request.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use tracing::warn;
use url::Url;

use crate::availability::AvailabilityEntry;
use crate::catalog::InstrumentStreamRecord;
use crate::error::{Error, Result};
use crate::time::{datetime_to_string, parse_timestamp};
use crate::util::build_url;

/// Largest row count the export endpoint documents for JSON requests.
pub const MAX_JSON_LIMIT: i64 = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    NetCdf,
    Json,
}

impl OutputFormat {
    pub fn mime(&self) -> &'static str {
        match self {
            OutputFormat::NetCdf => "application/netcdf",
            OutputFormat::Json => "application/json",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "netcdf" => Ok(OutputFormat::NetCdf),
            "json" => Ok(OutputFormat::Json),
            other => Err(Error::InvalidRequest(format!(
                "invalid application type/format: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputFormat::NetCdf => "netcdf",
            OutputFormat::Json => "json",
        })
    }
}

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub format: OutputFormat,
    /// Row limit; required and positive for JSON. `None` sends `-1`.
    pub limit: Option<i64>,
    pub exec_dpa: bool,
    pub include_provenance: bool,
    pub email: Option<String>,
    /// Clamp the requested window to the stream's availability window.
    pub time_check: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::NetCdf,
            limit: None,
            exec_dpa: true,
            include_provenance: false,
            email: None,
            time_check: true,
        }
    }
}

impl RequestOptions {
    pub fn json(limit: i64) -> Self {
        Self {
            format: OutputFormat::Json,
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.format == OutputFormat::Json && !self.limit.is_some_and(|l| l > 0) {
            return Err(Error::InvalidRequest(
                "json requests need a positive data points limit".into(),
            ));
        }
        Ok(())
    }

    fn limit_param(&self) -> i64 {
        self.limit.unwrap_or(-1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClampWarning {
    BeginBeforeStream {
        requested: DateTime<Utc>,
        stream_begin: DateTime<Utc>,
    },
    EndAfterStream {
        requested: DateTime<Utc>,
        stream_end: DateTime<Utc>,
    },
}

impl fmt::Display for ClampWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClampWarning::BeginBeforeStream {
                requested,
                stream_begin,
            } => write!(
                f,
                "start time {} is earlier than stream beginTime, using {}",
                requested.to_rfc3339(),
                stream_begin.to_rfc3339()
            ),
            ClampWarning::EndAfterStream {
                requested,
                stream_end,
            } => write!(
                f,
                "end time {} exceeds stream endTime, using {}",
                requested.to_rfc3339(),
                stream_end.to_rfc3339()
            ),
        }
    }
}

/// A fully resolved export request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    /// `<data url>/<site>/<node>/<sensor>/<method>/<stream>`
    pub url: String,
    pub reference_designator: String,
    pub method: String,
    pub stream: String,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub format: OutputFormat,
    pub limit: i64,
    pub exec_dpa: bool,
    pub include_provenance: bool,
    pub email: Option<String>,
    pub warnings: Vec<ClampWarning>,
}

impl RequestDescriptor {
    pub fn params(&self) -> Vec<(String, String)> {
        let mut p = vec![
            ("beginDT".to_string(), datetime_to_string(&self.begin)),
            ("endDT".to_string(), datetime_to_string(&self.end)),
            ("format".to_string(), self.format.mime().to_string()),
            ("limit".to_string(), self.limit.to_string()),
            ("execDPA".to_string(), self.exec_dpa.to_string()),
            ("include_provenance".to_string(), self.include_provenance.to_string()),
        ];
        if let Some(email) = &self.email {
            p.push(("email".to_string(), email.clone()));
        }
        p
    }

    pub fn full_url(&self) -> Result<Url> {
        Ok(Url::parse_with_params(&self.url, self.params())?)
    }
}

/// Builds the export request for one record.
///
/// When `availability` is given, its stream, method and window replace the
/// record's own. A missing `begin`/`end` defaults to the window edge.
pub fn build(
    data_url: &str,
    record: &InstrumentStreamRecord,
    availability: Option<&AvailabilityEntry>,
    begin: Option<&str>,
    end: Option<&str>,
    opts: &RequestOptions,
) -> Result<RequestDescriptor> {
    opts.validate()?;

    let (stream, method, stream_begin, stream_end) = match availability {
        Some(a) => (a.stream.as_str(), a.method.as_str(), a.begin, a.end),
        None => (
            record.stream_rd.as_str(),
            record.stream_method.as_str(),
            record.begin,
            record.end,
        ),
    };

    let mut begin_dt = match begin {
        Some(s) => parse_timestamp(s)?,
        None => stream_begin,
    };
    let mut end_dt = match end {
        Some(s) => parse_timestamp(s)?,
        None => stream_end,
    };

    let mut warnings = Vec::new();
    if opts.time_check {
        if end_dt > stream_end {
            warnings.push(ClampWarning::EndAfterStream {
                requested: end_dt,
                stream_end,
            });
            end_dt = stream_end;
        }
        if begin_dt < stream_begin {
            warnings.push(ClampWarning::BeginBeforeStream {
                requested: begin_dt,
                stream_begin,
            });
            begin_dt = stream_begin;
        }
    }

    if begin_dt >= end_dt {
        return Err(Error::InvalidTimeRange {
            begin: begin_dt.to_rfc3339(),
            end: end_dt.to_rfc3339(),
        });
    }

    let label = format!("{}-{}-{}", record.reference_designator, method, stream);
    for w in &warnings {
        warn!(request = %label, "time check: {}", w);
    }

    Ok(RequestDescriptor {
        url: build_url(
            data_url,
            &[
                record.site_rd.as_str(),
                record.infrastructure_rd.as_str(),
                record.instrument_rd.as_str(),
                method,
                stream,
            ],
        ),
        reference_designator: record.reference_designator.clone(),
        method: method.to_string(),
        stream: stream.to_string(),
        begin: begin_dt,
        end: end_dt,
        format: opts.format,
        limit: opts.limit_param(),
        exec_dpa: opts.exec_dpa,
        include_provenance: opts.include_provenance,
        email: opts.email.clone(),
        warnings,
    })
}

/// Builds one request per `(record, availability)` pair, index-aligned.
///
/// Invalid options fail the whole batch before anything is built. Per-record
/// failures (unparseable times, empty window) are logged and leave `None`.
pub fn build_batch<'a, I>(
    data_url: &str,
    items: I,
    begin: Option<&str>,
    end: Option<&str>,
    opts: &RequestOptions,
) -> Result<Vec<Option<RequestDescriptor>>>
where
    I: IntoIterator<Item = (&'a InstrumentStreamRecord, Option<&'a AvailabilityEntry>)>,
{
    opts.validate()?;
    Ok(items
        .into_iter()
        .map(|(record, avail)| match build(data_url, record, avail, begin, end, opts) {
            Ok(d) => Some(d),
            Err(e) => {
                warn!(refdes = %record.reference_designator, error = %e, "request not built, skipping");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::catalog::fixtures;
    use chrono::TimeZone;

    const DATA_URL: &str = "https://ooinet.oceanobservatories.org/api/m2m/12576/sensor/inv";

    fn record_with_window(begin: &str, end: &str) -> InstrumentStreamRecord {
        let mut r = fixtures::catalog().records()[0].clone();
        r.begin = parse_timestamp(begin).unwrap();
        r.end = parse_timestamp(end).unwrap();
        r
    }

    #[test]
    fn clamps_begin_to_stream_window() {
        let r = record_with_window("2018-01-01", "2018-06-01");
        let d = build(
            DATA_URL,
            &r,
            None,
            Some("2017-01-01"),
            Some("2018-03-01"),
            &RequestOptions::default(),
        )
        .unwrap();
        assert_eq!(d.begin, Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(d.end, Utc.with_ymd_and_hms(2018, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(d.warnings.len(), 1);
        assert!(matches!(d.warnings[0], ClampWarning::BeginBeforeStream { .. }));
    }

    #[test]
    fn clamping_to_empty_window_is_rejected() {
        let r = record_with_window("2018-01-01", "2018-06-01");
        let err = build(
            DATA_URL,
            &r,
            None,
            Some("2018-07-01"),
            Some("2018-08-01"),
            &RequestOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidTimeRange { .. }));
    }

    #[test]
    fn time_check_can_be_disabled() {
        let r = record_with_window("2018-01-01", "2018-06-01");
        let opts = RequestOptions {
            time_check: false,
            ..RequestOptions::default()
        };
        let d = build(DATA_URL, &r, None, Some("2017-01-01"), None, &opts).unwrap();
        assert_eq!(d.begin, Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap());
        assert!(d.warnings.is_empty());
    }

    #[test]
    fn json_requires_positive_limit() {
        for limit in [None, Some(0), Some(-5)] {
            let opts = RequestOptions {
                format: OutputFormat::Json,
                limit,
                ..RequestOptions::default()
            };
            assert!(matches!(opts.validate(), Err(Error::InvalidRequest(_))));
        }
        assert!(RequestOptions::json(MAX_JSON_LIMIT + 1).validate().is_ok());
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn renders_url_and_params() {
        let r = record_with_window("2018-01-01", "2018-06-01");
        let opts = RequestOptions {
            email: Some("me@example.org".into()),
            ..RequestOptions::default()
        };
        let d = build(DATA_URL, &r, None, Some("2018-02-01"), Some("2018-03-01"), &opts).unwrap();
        assert_eq!(
            d.url,
            format!("{}/RS03AXPS/PC03A/4A-CTDPFA303/streamed/ctdpf_optode_sample", DATA_URL)
        );
        let params = d.params();
        let get = |k: &str| params.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("beginDT"), Some("2018-02-01T00:00:00.000000Z"));
        assert_eq!(get("format"), Some("application/netcdf"));
        assert_eq!(get("limit"), Some("-1"));
        assert_eq!(get("execDPA"), Some("true"));
        assert_eq!(get("include_provenance"), Some("false"));
        assert_eq!(get("email"), Some("me@example.org"));
        assert!(d.full_url().unwrap().as_str().contains("execDPA=true"));
    }

    #[test]
    fn availability_overrides_record_stream() {
        let r = record_with_window("2018-01-01", "2018-06-01");
        let avail = AvailabilityEntry {
            reference_designator: r.reference_designator.clone(),
            stream: "other_stream".into(),
            method: "recovered_inst".into(),
            begin: Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2016, 2, 1, 0, 0, 0).unwrap(),
        };
        let d = build(DATA_URL, &r, Some(&avail), None, None, &RequestOptions::default()).unwrap();
        assert!(d.url.ends_with("/recovered_inst/other_stream"));
        assert_eq!(d.begin, avail.begin);
        assert_eq!(d.end, avail.end);
    }

    #[test]
    fn batch_keeps_going_past_bad_records() {
        let r = record_with_window("2018-01-01", "2018-06-01");
        let out = build_batch(
            DATA_URL,
            [(&r, None), (&r, None)],
            Some("not a date"),
            None,
            &RequestOptions::default(),
        )
        .unwrap();
        assert_eq!(out, vec![None, None]);

        let err = build_batch(DATA_URL, [(&r, None)], None, None, &RequestOptions::json(0));
        assert!(matches!(err, Err(Error::InvalidRequest(_))));
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn dropped_records_are_warnings() {
        let logs = Captured::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let r = record_with_window("2018-01-01", "2018-06-01");
        tracing::subscriber::with_default(subscriber, || {
            let out = build_batch(
                DATA_URL,
                [(&r, None)],
                Some("2019-01-01"),
                Some("2019-02-01"),
                &RequestOptions::default(),
            )
            .unwrap();
            assert_eq!(out, vec![None]);
        });

        let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let line = text.lines().find(|l| l.contains("request not built")).unwrap();
        assert!(line.contains("WARN"));
        assert!(!text.contains("ERROR"));
    }
}
