//! Catalog Resolver: joins the OOI reference tables into one list of
//! instrument streams and filters it by free-text search.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cache::CatalogCache;
use crate::client::{Client, StreamMeta, TocInstrument, VocabEntry, parse_toc};
use crate::error::{Error, Result};
use crate::refdes::ReferenceDesignator;
use crate::task::BackgroundTask;
use crate::time::parse_timestamp;
use crate::util::split_terms;

pub const REGIONS_URL: &str = "https://raw.githubusercontent.com/ooi-data-review/datateam-portal-backend/master/infrastructure/regions.csv";
pub const SITES_URL: &str = "https://raw.githubusercontent.com/ooi-data-review/datateam-portal-backend/master/infrastructure/sites.csv";

#[derive(Debug, Clone, Deserialize)]
pub struct RegionRow {
    pub reference_designator: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteRow {
    pub reference_designator: String,
    pub name: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

/// The raw reference tables a catalog is joined from.
#[derive(Debug, Clone, Default)]
pub struct CatalogTables {
    pub regions: Vec<RegionRow>,
    pub sites: Vec<SiteRow>,
    pub toc: Vec<TocInstrument>,
    pub vocab: Vec<VocabEntry>,
    pub streams: Vec<StreamMeta>,
}

impl CatalogTables {
    /// Parses the five tables from their wire text (two CSVs, three JSON documents).
    pub fn parse(regions_csv: &str, sites_csv: &str, toc_json: &str, vocab_json: &str, streams_json: &str) -> Result<Self> {
        Ok(Self {
            regions: read_csv(regions_csv)?,
            // sites without a position are not deployable locations
            sites: read_csv::<SiteRow>(sites_csv)?
                .into_iter()
                .filter(|s| s.latitude.is_some() && s.longitude.is_some())
                .collect(),
            toc: parse_toc(toc_json)?,
            vocab: serde_json::from_str(vocab_json)?,
            streams: serde_json::from_str(streams_json)?,
        })
    }
}

fn read_csv<T: serde::de::DeserializeOwned>(text: &str) -> Result<Vec<T>> {
    let mut rdr = csv::Reader::from_reader(text.as_bytes());
    let mut rows = Vec::new();
    for row in rdr.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

/// One (site, node, sensor, method, stream) tuple with its names and
/// declared availability window.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentStreamRecord {
    pub array_name: String,
    pub site_name: String,
    pub infrastructure_name: String,
    pub instrument_name: String,
    pub site_rd: String,
    pub infrastructure_rd: String,
    pub instrument_rd: String,
    pub reference_designator: String,
    pub stream_method: String,
    pub stream_type: String,
    pub stream_rd: String,
    pub stream_content: String,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub preferred_stream: Option<String>,
}

impl InstrumentStreamRecord {
    pub fn key(&self) -> (&str, &str, &str, &str, &str) {
        (
            &self.site_rd,
            &self.infrastructure_rd,
            &self.instrument_rd,
            &self.stream_method,
            &self.stream_rd,
        )
    }

    pub fn designator(&self) -> Result<ReferenceDesignator> {
        ReferenceDesignator::parse(&self.reference_designator)
    }
}

/// Filter set for [`Catalog::search`]. Each field is a comma-separated list
/// of case-insensitive substrings; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub region: Option<String>,
    pub site: Option<String>,
    pub node: Option<String>,
    pub instrument: Option<String>,
    pub stream_type: Option<String>,
    pub stream_method: Option<String>,
    pub stream: Option<String>,
}

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn region(mut self, terms: impl Into<String>) -> Self {
        self.region = Some(terms.into());
        self
    }

    pub fn site(mut self, terms: impl Into<String>) -> Self {
        self.site = Some(terms.into());
        self
    }

    pub fn node(mut self, terms: impl Into<String>) -> Self {
        self.node = Some(terms.into());
        self
    }

    pub fn instrument(mut self, terms: impl Into<String>) -> Self {
        self.instrument = Some(terms.into());
        self
    }

    pub fn stream_type(mut self, terms: impl Into<String>) -> Self {
        self.stream_type = Some(terms.into());
        self
    }

    pub fn stream_method(mut self, terms: impl Into<String>) -> Self {
        self.stream_method = Some(terms.into());
        self
    }

    pub fn stream(mut self, terms: impl Into<String>) -> Self {
        self.stream = Some(terms.into());
        self
    }

    pub fn matches(&self, r: &InstrumentStreamRecord) -> bool {
        let refdes = r.reference_designator.as_str();
        dimension(&self.region, &[&r.array_name, &r.site_rd, refdes])
            && dimension(&self.site, &[&r.site_name, &r.site_rd, refdes])
            && dimension(&self.node, &[&r.infrastructure_name, &r.infrastructure_rd, refdes])
            && dimension(&self.instrument, &[&r.instrument_name, &r.instrument_rd, refdes])
            && dimension(&self.stream_type, &[&r.stream_type])
            && dimension(&self.stream_method, &[&r.stream_method])
            && dimension(&self.stream, &[&r.stream_rd])
    }
}

// OR within a dimension, across all of its fields.
fn dimension(filter: &Option<String>, fields: &[&str]) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    let terms: Vec<String> = split_terms(filter).iter().map(|t| t.to_lowercase()).collect();
    if terms.is_empty() {
        return true;
    }
    fields.iter().any(|f| {
        let f = f.to_lowercase();
        terms.iter().any(|t| f.contains(t.as_str()))
    })
}

/// The joined instrument-stream catalog. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    records: Arc<Vec<InstrumentStreamRecord>>,
}

impl Catalog {
    /// Fetches all reference tables and joins them.
    ///
    /// Each table that cannot be fetched is read from `cache` instead; a table
    /// missing from both is [`Error::DataUnavailable`]. Fresh tables are
    /// written back to the cache.
    pub fn load(client: &Client, cache: Option<&CatalogCache>) -> Result<Self> {
        info!("loading OOI catalog");
        let regions = fetch_table(cache, "regions.csv", || client.fetch_public_text(REGIONS_URL))?;
        let sites = fetch_table(cache, "sites.csv", || client.fetch_public_text(SITES_URL))?;
        let toc = fetch_table(cache, "toc.json", || client.fetch_text(&client.toc_url()))?;
        let vocab = fetch_table(cache, "vocab.json", || client.fetch_text(&client.vocab_url()))?;
        let streams = fetch_table(cache, "streams.json", || client.fetch_text(&client.streams_url()))?;

        let tables = CatalogTables::parse(&regions, &sites, &toc, &vocab, &streams)?;
        let catalog = Self::from_tables(&tables);
        info!(records = catalog.len(), "catalog ready");
        Ok(catalog)
    }

    /// Like [`Catalog::load`] on a background thread.
    pub fn load_in_background(client: Client, cache: Option<CatalogCache>) -> Result<BackgroundTask<Result<Self>>> {
        BackgroundTask::spawn("ooi-catalog", move |token| {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            Self::load(&client, cache.as_ref())
        })
    }

    /// Replaces the records with a fresh [`Catalog::load`].
    pub fn refresh(&mut self, client: &Client, cache: Option<&CatalogCache>) -> Result<()> {
        *self = Self::load(client, cache)?;
        Ok(())
    }

    /// Joins the tables: the table of contents inner-joined with stream
    /// metadata, then left-joined with vocabulary, sites and regions.
    pub fn from_tables(tables: &CatalogTables) -> Self {
        let streams: HashMap<&str, &StreamMeta> =
            tables.streams.iter().map(|s| (s.name.as_str(), s)).collect();
        let vocab: HashMap<&str, &VocabEntry> =
            tables.vocab.iter().map(|v| (v.refdes.as_str(), v)).collect();
        let sites: HashMap<&str, &SiteRow> = tables
            .sites
            .iter()
            .map(|s| (s.reference_designator.as_str(), s))
            .collect();
        let regions: HashMap<&str, &RegionRow> = tables
            .regions
            .iter()
            .map(|r| (r.reference_designator.as_str(), r))
            .collect();

        let mut seen = HashSet::new();
        let mut records = Vec::new();

        for inst in &tables.toc {
            let rd = match ReferenceDesignator::parse(&inst.reference_designator) {
                Ok(rd) => rd,
                Err(e) => {
                    warn!(error = %e, "skipping catalog row");
                    continue;
                }
            };
            let voc = vocab.get(inst.reference_designator.as_str()).copied();
            let named = |f: Option<&String>| f.filter(|s| !s.is_empty()).cloned();

            let array_name = regions
                .get(rd.array_code())
                .map(|r| r.name.clone())
                .or_else(|| named(voc.and_then(|v| v.toc_l1.as_ref())))
                .unwrap_or_else(|| rd.array_code().to_string());
            let site_name = sites
                .get(rd.subsite.as_str())
                .map(|s| s.name.clone())
                .or_else(|| named(voc.and_then(|v| v.toc_l2.as_ref())))
                .unwrap_or_else(|| rd.subsite.clone());
            let infrastructure_name =
                named(voc.and_then(|v| v.toc_l3.as_ref())).unwrap_or_else(|| rd.node.clone());
            let instrument_name =
                named(voc.and_then(|v| v.instrument.as_ref())).unwrap_or_else(|| rd.sensor.clone());
            let preferred = named(voc.and_then(|v| v.preferred_stream.as_ref()));

            for st in &inst.streams {
                let Some(meta) = streams.get(st.stream.as_str()) else {
                    debug!(stream = %st.stream, "no stream metadata, dropping");
                    continue;
                };
                let (begin, end) = match (parse_timestamp(&st.begin_time), parse_timestamp(&st.end_time)) {
                    (Ok(b), Ok(e)) => (b, e),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!(refdes = %inst.reference_designator, stream = %st.stream, error = %e, "skipping catalog row");
                        continue;
                    }
                };

                let record = InstrumentStreamRecord {
                    array_name: array_name.clone(),
                    site_name: site_name.clone(),
                    infrastructure_name: infrastructure_name.clone(),
                    instrument_name: instrument_name.clone(),
                    site_rd: rd.subsite.clone(),
                    infrastructure_rd: rd.node.clone(),
                    instrument_rd: rd.sensor.clone(),
                    reference_designator: inst.reference_designator.clone(),
                    stream_method: st.method.clone(),
                    stream_type: meta.stream_type().to_string(),
                    stream_rd: st.stream.clone(),
                    stream_content: meta.stream_content().to_string(),
                    begin,
                    end,
                    preferred_stream: preferred.clone(),
                };

                let key = (
                    record.site_rd.clone(),
                    record.infrastructure_rd.clone(),
                    record.instrument_rd.clone(),
                    record.stream_method.clone(),
                    record.stream_rd.clone(),
                );
                if seen.insert(key) {
                    records.push(record);
                }
            }
        }

        Self {
            records: Arc::new(records),
        }
    }

    pub fn from_records(records: Vec<InstrumentStreamRecord>) -> Self {
        let mut seen = HashSet::new();
        let records = records
            .into_iter()
            .filter(|r| {
                seen.insert((
                    r.site_rd.clone(),
                    r.infrastructure_rd.clone(),
                    r.instrument_rd.clone(),
                    r.stream_method.clone(),
                    r.stream_rd.clone(),
                ))
            })
            .collect();
        Self {
            records: Arc::new(records),
        }
    }

    pub fn records(&self) -> &[InstrumentStreamRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns a new deduplicated view; the catalog itself is untouched.
    pub fn search(&self, query: &SearchQuery) -> FilteredCatalog {
        let mut seen = HashSet::new();
        let records = self
            .records
            .iter()
            .filter(|r| query.matches(r))
            .filter(|r| seen.insert(r.key()))
            .cloned()
            .collect();
        FilteredCatalog { records }
    }

    pub fn all(&self) -> FilteredCatalog {
        self.search(&SearchQuery::default())
    }
}

fn fetch_table<F>(cache: Option<&CatalogCache>, key: &str, fetch: F) -> Result<String>
where
    F: FnOnce() -> Result<String>,
{
    match fetch() {
        Ok(text) => {
            if let Some(cache) = cache {
                if let Err(e) = cache.put(key, &text) {
                    warn!(key, error = %e, "could not cache table");
                }
            }
            Ok(text)
        }
        Err(err) => {
            if let Some(cache) = cache {
                if let Some(text) = cache.get(key)? {
                    warn!(key, error = %err, "fetch failed, using cached copy");
                    return Ok(text);
                }
            }
            Err(Error::DataUnavailable(format!("{}: {}", key, err)))
        }
    }
}

/// A search result: an owned, deduplicated subset of a [`Catalog`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilteredCatalog {
    records: Vec<InstrumentStreamRecord>,
}

impl FilteredCatalog {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, InstrumentStreamRecord> {
        self.records.iter()
    }

    pub fn records(&self) -> &[InstrumentStreamRecord] {
        &self.records
    }

    pub fn get(&self, idx: usize) -> Option<&InstrumentStreamRecord> {
        self.records.get(idx)
    }

    /// Unique reference designators, in catalog order.
    pub fn instruments(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.records
            .iter()
            .filter(|r| seen.insert(r.reference_designator.as_str()))
            .map(|r| r.reference_designator.clone())
            .collect()
    }
}

impl<'a> IntoIterator for &'a FilteredCatalog {
    type Item = &'a InstrumentStreamRecord;
    type IntoIter = std::slice::Iter<'a, InstrumentStreamRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    pub(crate) const REGIONS: &str = "reference_designator,name\nRS,Cabled Array\nCE,Coastal Endurance\n";
    pub(crate) const SITES: &str = "reference_designator,name,latitude,longitude\n\
        RS03AXPS,Axial Base Shallow Profiler Mooring,45.83,-129.75\n\
        RS03ASHS,ASHES Vent Field,45.93,-130.01\n\
        CE02SHBP,Oregon Shelf Cabled Benthic Experiment Package,44.64,-124.31\n\
        XX00NONE,Nowhere,,\n";
    pub(crate) const TOC: &str = r#"{"instruments": [
        {"reference_designator": "RS03AXPS-PC03A-4A-CTDPFA303", "streams": [
            {"stream": "ctdpf_optode_sample", "method": "streamed", "beginTime": "2014-09-27T00:00:00.000Z", "endTime": "2018-07-01T00:00:00.000Z"},
            {"stream": "ctdpf_optode_sample", "method": "streamed", "beginTime": "2014-09-27T00:00:00.000Z", "endTime": "2018-07-01T00:00:00.000Z"},
            {"stream": "ctdpf_optode_calibration_coefficients", "method": "streamed", "beginTime": "2014-09-27T00:00:00.000Z", "endTime": "2018-07-01T00:00:00.000Z"}]},
        {"reference_designator": "RS03AXPS-SF03A-2A-CTDPFA302", "streams": [
            {"stream": "ctdpf_sbe43_sample", "method": "streamed", "beginTime": "2014-10-01T00:00:00.000Z", "endTime": "2018-07-01T00:00:00.000Z"}]},
        {"reference_designator": "RS03ASHS-MJ03B-07-TMPSFA301", "streams": [
            {"stream": "tmpsf_sample", "method": "streamed", "beginTime": "2014-09-29T00:00:00.000Z", "endTime": "2018-07-01T00:00:00.000Z"}]},
        {"reference_designator": "CE02SHBP-LJ01D-06-CTDBPN106", "streams": [
            {"stream": "ctdbp_no_sample", "method": "streamed", "beginTime": "2015-01-01T00:00:00.000Z", "endTime": "2018-07-01T00:00:00.000Z"}]},
        {"reference_designator": "BROKEN", "streams": [
            {"stream": "ctdbp_no_sample", "method": "streamed", "beginTime": "2015-01-01T00:00:00.000Z", "endTime": "2018-07-01T00:00:00.000Z"}]}
    ]}"#;
    pub(crate) const VOCAB: &str = r#"[
        {"refdes": "RS03AXPS-PC03A-4A-CTDPFA303", "instrument": "CTD", "tocL1": "Cabled Axial Seamount", "tocL2": "Axial Base Shallow Profiler Mooring", "tocL3": "Shallow Profiler (PC03A)", "preferred_stream": "ctdpf_optode_sample"},
        {"refdes": "RS03AXPS-SF03A-2A-CTDPFA302", "instrument": "CTD", "tocL1": "Cabled Axial Seamount", "tocL2": "Axial Base Shallow Profiler Mooring", "tocL3": "Shallow Profiler (SF03A)", "preferred_stream": "ctdpf_sbe43_sample"},
        {"refdes": "RS03ASHS-MJ03B-07-TMPSFA301", "instrument": "Diffuse Vent Fluid 3-D Temperature Array", "tocL1": "Cabled Axial Seamount", "tocL2": "ASHES Vent Field", "tocL3": "Medium-Power JBox (MJ03B)", "preferred_stream": "tmpsf_sample"},
        {"refdes": "CE02SHBP-LJ01D-06-CTDBPN106", "instrument": "CTD", "tocL1": "Coastal Endurance", "tocL2": "Oregon Shelf Cabled Benthic Experiment Package", "tocL3": "Low-Power JBox (LJ01D)", "preferred_stream": "ctdbp_no_sample"}
    ]"#;
    pub(crate) const STREAMS: &str = r#"[
        {"name": "ctdpf_optode_sample", "stream_type": {"value": "Science"}, "stream_content": {"value": "CTD Data"}},
        {"name": "ctdpf_optode_calibration_coefficients", "stream_type": {"value": "Calibration"}, "stream_content": {"value": "Calibration Data"}},
        {"name": "ctdpf_sbe43_sample", "stream_type": {"value": "Science"}, "stream_content": {"value": "CTD Data"}},
        {"name": "tmpsf_sample", "stream_type": {"value": "Science"}, "stream_content": {"value": "Temperature Data"}},
        {"name": "ctdbp_no_sample", "stream_type": {"value": "Science"}, "stream_content": {"value": "CTD Data"}}
    ]"#;

    pub(crate) fn catalog() -> super::Catalog {
        let tables = super::CatalogTables::parse(REGIONS, SITES, TOC, VOCAB, STREAMS).unwrap();
        super::Catalog::from_tables(&tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, Credentials};
    use crate::transport::testing::CannedTransport;

    #[test]
    fn join_dedups_and_skips_bad_rows() {
        let cat = fixtures::catalog();
        // duplicate stream collapsed, BROKEN designator skipped
        assert_eq!(cat.len(), 5);
        let keys: HashSet<_> = cat.records().iter().map(|r| r.key()).collect();
        assert_eq!(keys.len(), cat.len());

        let ctd = &cat.records()[0];
        assert_eq!(ctd.array_name, "Cabled Array");
        assert_eq!(ctd.site_name, "Axial Base Shallow Profiler Mooring");
        assert_eq!(ctd.instrument_rd, "4A-CTDPFA303");
        assert_eq!(ctd.stream_type, "Science");
        assert_eq!(ctd.preferred_stream.as_deref(), Some("ctdpf_optode_sample"));
    }

    #[test]
    fn sites_without_position_are_dropped() {
        let tables = CatalogTables::parse(
            fixtures::REGIONS,
            fixtures::SITES,
            fixtures::TOC,
            fixtures::VOCAB,
            fixtures::STREAMS,
        )
        .unwrap();
        assert!(tables.sites.iter().all(|s| s.reference_designator != "XX00NONE"));
    }

    #[test]
    fn search_ands_dimensions_and_ors_terms() {
        let cat = fixtures::catalog();
        let hits = cat.search(
            &SearchQuery::new()
                .region("cabled array")
                .site("axial base shallow profiler")
                .instrument("CTD"),
        );
        assert_eq!(hits.len(), 3);

        let hits = cat.search(
            &SearchQuery::new()
                .region("cabled array")
                .site("axial base shallow profiler")
                .instrument("CTD")
                .stream_type("science"),
        );
        assert_eq!(hits.len(), 2);
        assert_eq!(
            hits.instruments(),
            vec!["RS03AXPS-PC03A-4A-CTDPFA303", "RS03AXPS-SF03A-2A-CTDPFA302"]
        );

        let hits = cat.search(&SearchQuery::new().site("ashes, oregon shelf"));
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn search_results_are_subsets_without_duplicates() {
        let cat = fixtures::catalog();
        for q in [
            SearchQuery::new(),
            SearchQuery::new().instrument("ctd, CTD, ctdpf"),
            SearchQuery::new().region("RS, rs03, cabled").stream_method("stream"),
            SearchQuery::new().node(" , "),
        ] {
            let hits = cat.search(&q);
            let keys: HashSet<_> = hits.iter().map(|r| r.key()).collect();
            assert_eq!(keys.len(), hits.len());
            assert!(hits.iter().all(|r| cat.records().contains(r)));
        }
        assert_eq!(cat.len(), 5);
    }

    fn client(t: CannedTransport) -> Client {
        let cfg = ClientConfig::new(Credentials::new("u", "t"));
        Client::with_transport(cfg, Arc::new(t)).with_progress(false)
    }

    fn full_transport() -> CannedTransport {
        CannedTransport::new()
            .route("regions.csv", 200, fixtures::REGIONS)
            .route("sites.csv", 200, fixtures::SITES)
            .route("sensor/inv/toc", 200, fixtures::TOC)
            .route("12586/vocab", 200, fixtures::VOCAB)
            .route("12575/stream", 200, fixtures::STREAMS)
    }

    #[test]
    fn load_falls_back_to_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CatalogCache::new(dir.path());

        let fresh = Catalog::load(&client(full_transport()), Some(&cache)).unwrap();
        assert_eq!(fresh.len(), 5);

        let offline = client(CannedTransport::new().route("12586/vocab", 503, ""));
        let cached = Catalog::load(&offline, Some(&cache)).unwrap();
        assert_eq!(cached.records(), fresh.records());
    }

    #[test]
    fn load_without_cache_reports_unavailable() {
        let offline = client(CannedTransport::new());
        assert!(matches!(
            Catalog::load(&offline, None),
            Err(Error::DataUnavailable(_))
        ));
    }

    #[test]
    fn background_load_can_be_awaited() {
        let task = Catalog::load_in_background(client(full_transport()), None).unwrap();
        let cat = task.wait().unwrap().unwrap();
        assert_eq!(cat.len(), 5);
    }
}
