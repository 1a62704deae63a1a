//! Availability Checker: which stream each instrument actually serves, and when.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::catalog::InstrumentStreamRecord;
use crate::client::{Client, StreamTimes};
use crate::error::{Error, Result};
use crate::time::parse_timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamType {
    #[default]
    Science,
    Engineering,
    All,
}

impl StreamType {
    fn accepts(&self, reported: &str) -> bool {
        match self {
            StreamType::All => true,
            StreamType::Science => reported.eq_ignore_ascii_case("science"),
            StreamType::Engineering => reported.eq_ignore_ascii_case("engineering"),
        }
    }
}

impl FromStr for StreamType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "science" => Ok(StreamType::Science),
            "engineering" => Ok(StreamType::Engineering),
            "all" => Ok(StreamType::All),
            other => Err(Error::InvalidRequest(format!(
                "unknown stream type `{}` (expected Science, Engineering or all)",
                other
            ))),
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamType::Science => "Science",
            StreamType::Engineering => "Engineering",
            StreamType::All => "all",
        })
    }
}

/// The chosen stream of one instrument and its reported window.
#[derive(Debug, Clone, PartialEq)]
pub struct AvailabilityEntry {
    pub reference_designator: String,
    pub stream: String,
    pub method: String,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Resolves the preferred stream of every instrument in `records`.
///
/// Instruments without a usable stream get no entry and a warning. A record
/// whose reference designator is under-qualified fails the whole call before
/// anything is fetched.
pub fn check<'a, I>(client: &Client, records: I, stream_type: StreamType) -> Result<BTreeMap<String, AvailabilityEntry>>
where
    I: IntoIterator<Item = &'a InstrumentStreamRecord>,
{
    let mut out = BTreeMap::new();
    let mut types: HashMap<String, Option<String>> = HashMap::new();

    let records: Vec<&InstrumentStreamRecord> = records.into_iter().collect();
    let designators = records
        .iter()
        .map(|r| r.designator())
        .collect::<Result<Vec<_>>>()?;

    for (record, rd) in records.into_iter().zip(&designators) {
        if out.contains_key(&record.reference_designator) {
            continue;
        }

        let streams = match client.instrument_stream_times(rd) {
            Ok(s) => s,
            Err(e) => {
                warn!(refdes = %record.reference_designator, error = %e, "could not fetch instrument streams");
                continue;
            }
        };

        let candidates: Vec<StreamTimes> = if stream_type == StreamType::All {
            streams
        } else {
            streams
                .into_iter()
                .filter(|s| {
                    let reported = types.entry(s.stream.clone()).or_insert_with(|| {
                        client
                            .stream_metadata(&s.stream)
                            .map(|m| m.stream_type().to_string())
                            .map_err(|e| debug!(stream = %s.stream, error = %e, "no stream metadata"))
                            .ok()
                    });
                    reported.as_deref().is_some_and(|t| stream_type.accepts(t))
                })
                .collect()
        };

        if candidates.is_empty() {
            warn!(refdes = %record.reference_designator, %stream_type, "no available streams");
            continue;
        }

        if let Some(entry) = select(record, &candidates) {
            out.insert(record.reference_designator.clone(), entry);
        }
    }

    Ok(out)
}

fn select(record: &InstrumentStreamRecord, candidates: &[StreamTimes]) -> Option<AvailabilityEntry> {
    let Some(preferred) = record.preferred_stream.as_deref().filter(|s| !s.is_empty()) else {
        warn!(refdes = %record.reference_designator, "instrument has no preferred stream");
        return None;
    };

    let Some(hit) = candidates.iter().find(|s| s.stream == preferred) else {
        let available: Vec<&str> = candidates.iter().map(|s| s.stream.as_str()).collect();
        warn!(
            refdes = %record.reference_designator,
            preferred,
            ?available,
            "preferred stream not found"
        );
        return None;
    };

    match (parse_timestamp(&hit.begin_time), parse_timestamp(&hit.end_time)) {
        (Ok(begin), Ok(end)) => Some(AvailabilityEntry {
            reference_designator: record.reference_designator.clone(),
            stream: hit.stream.clone(),
            method: hit.method.clone(),
            begin,
            end,
        }),
        (Err(e), _) | (_, Err(e)) => {
            warn!(refdes = %record.reference_designator, error = %e, "unreadable stream window");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::fixtures;
    use crate::config::{ClientConfig, Credentials};
    use crate::transport::testing::CannedTransport;

    const TIMES: &str = r#"[
        {"stream": "ctdpf_optode_calibration_coefficients", "method": "streamed", "beginTime": "2014-09-27T00:00:00.000Z", "endTime": "2018-07-01T00:00:00.000Z"},
        {"stream": "ctdpf_optode_sample", "method": "streamed", "beginTime": "2014-09-27T18:33:23.000Z", "endTime": "2018-06-30T23:59:59.000Z"}
    ]"#;

    fn client(t: CannedTransport) -> (Client, Arc<CannedTransport>) {
        let t = Arc::new(t);
        let cfg = ClientConfig::new(Credentials::new("u", "t"));
        (Client::with_transport(cfg, t.clone()), t)
    }

    fn transport() -> CannedTransport {
        CannedTransport::new()
            .route("CTDPFA303/metadata/times", 200, TIMES)
            .route("byname/ctdpf_optode_sample", 200, r#"{"name": "ctdpf_optode_sample", "stream_type": {"value": "Science"}}"#)
            .route(
                "byname/ctdpf_optode_calibration_coefficients",
                200,
                r#"{"name": "ctdpf_optode_calibration_coefficients", "stream_type": {"value": "Calibration"}}"#,
            )
    }

    #[test]
    fn picks_preferred_science_stream() {
        let cat = fixtures::catalog();
        let (c, t) = client(transport());
        let optode: Vec<_> = cat
            .records()
            .iter()
            .filter(|r| r.reference_designator.ends_with("CTDPFA303"))
            .collect();
        assert_eq!(optode.len(), 2);

        let avail = check(&c, optode, StreamType::Science).unwrap();
        let entry = &avail["RS03AXPS-PC03A-4A-CTDPFA303"];
        assert_eq!(entry.stream, "ctdpf_optode_sample");
        assert_eq!(entry.begin, parse_timestamp("2014-09-27T18:33:23Z").unwrap());
        // second record of the same instrument is not re-fetched
        assert_eq!(t.count("metadata/times"), 1);
        assert_eq!(t.count("byname/"), 2);
    }

    #[test]
    fn missing_preferred_stream_yields_no_entry() {
        let cat = fixtures::catalog();
        let mut record = cat.records()[0].clone();
        record.preferred_stream = Some("does_not_exist".into());
        let (c, _) = client(transport());
        assert!(check(&c, [&record], StreamType::All).unwrap().is_empty());

        record.preferred_stream = None;
        assert!(check(&c, [&record], StreamType::All).unwrap().is_empty());
    }

    #[test]
    fn network_failure_drops_only_that_instrument() {
        let cat = fixtures::catalog();
        let (c, _) = client(transport());
        let avail = check(&c, cat.records(), StreamType::Science).unwrap();
        assert_eq!(avail.len(), 1);
    }

    #[test]
    fn under_qualified_designator_propagates() {
        let cat = fixtures::catalog();
        let mut record = cat.records()[0].clone();
        record.reference_designator = "RS03AXPS-PC03A".into();
        let (c, t) = client(transport());
        assert!(matches!(
            check(&c, [&record], StreamType::Science),
            Err(Error::InvalidReferenceDesignator(_))
        ));
        assert!(t.calls().is_empty());
    }

    #[test]
    fn bad_designator_later_in_batch_fails_before_fetching() {
        let cat = fixtures::catalog();
        let good = cat.records()[0].clone();
        let mut bad = good.clone();
        bad.reference_designator = "RS03AXPS-PC03A".into();
        let (c, t) = client(transport());
        assert!(matches!(
            check(&c, [&good, &bad], StreamType::Science),
            Err(Error::InvalidReferenceDesignator(_))
        ));
        assert!(t.calls().is_empty());
    }

    #[test]
    fn undeclared_preference_is_not_guessed() {
        let toc = r#"{"instruments": [
            {"reference_designator": "RS03AXPS-PC03A-4A-CTDPFA303", "streams": [
                {"stream": "sample_a", "method": "streamed", "beginTime": "2014-09-27T00:00:00.000Z", "endTime": "2018-07-01T00:00:00.000Z"},
                {"stream": "sample_b", "method": "streamed", "beginTime": "2014-09-27T00:00:00.000Z", "endTime": "2018-07-01T00:00:00.000Z"}]}
        ]}"#;
        let vocab = r#"[{"refdes": "RS03AXPS-PC03A-4A-CTDPFA303", "instrument": "CTD"}]"#;
        let streams = r#"[
            {"name": "sample_a", "stream_type": {"value": "Science"}},
            {"name": "sample_b", "stream_type": {"value": "Science"}}
        ]"#;
        let tables = crate::catalog::CatalogTables::parse(fixtures::REGIONS, fixtures::SITES, toc, vocab, streams).unwrap();
        let cat = crate::catalog::Catalog::from_tables(&tables);
        assert_eq!(cat.len(), 2);
        assert!(cat.records().iter().all(|r| r.preferred_stream.is_none()));

        let times = r#"[
            {"stream": "sample_a", "method": "streamed", "beginTime": "2014-09-27T00:00:00.000Z", "endTime": "2018-07-01T00:00:00.000Z"},
            {"stream": "sample_b", "method": "streamed", "beginTime": "2014-09-27T00:00:00.000Z", "endTime": "2018-07-01T00:00:00.000Z"}
        ]"#;
        let (c, _) = client(
            CannedTransport::new()
                .route("CTDPFA303/metadata/times", 200, times)
                .route("byname/", 200, r#"{"name": "sample", "stream_type": {"value": "Science"}}"#),
        );
        assert!(check(&c, cat.records(), StreamType::Science).unwrap().is_empty());
    }

    #[test]
    fn stream_type_parses_case_insensitively() {
        assert_eq!("science".parse::<StreamType>().unwrap(), StreamType::Science);
        assert_eq!("ALL".parse::<StreamType>().unwrap(), StreamType::All);
        assert!("bogus".parse::<StreamType>().is_err());
    }
}
