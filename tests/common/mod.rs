#![allow(dead_code)]

use std::sync::Mutex;

use ooi_m2m::{
    Client, ClientConfig, Credentials, Dataset, DatasetOpener, Error, Reply, Result, Transport, Values, Variable,
};

pub const CTD_OPTODE: &str = "RS03AXPS-PC03A-4A-CTDPFA303";
pub const CTD_SBE43: &str = "RS03AXPS-SF03A-2A-CTDPFA302";

pub const REGIONS: &str = "reference_designator,name\nRS,Cabled Array\nCE,Coastal Endurance\n";
pub const SITES: &str = "reference_designator,name,latitude,longitude\n\
    RS03AXPS,Axial Base Shallow Profiler Mooring,45.83,-129.75\n\
    RS03ASHS,ASHES Vent Field,45.93,-130.01\n\
    CE02SHBP,Oregon Shelf Cabled Benthic Experiment Package,44.64,-124.31\n";
pub const TOC: &str = r#"{"instruments": [
    {"reference_designator": "RS03AXPS-PC03A-4A-CTDPFA303", "streams": [
        {"stream": "ctdpf_optode_sample", "method": "streamed", "beginTime": "2014-09-27T00:00:00.000Z", "endTime": "2018-07-01T00:00:00.000Z"}]},
    {"reference_designator": "RS03AXPS-SF03A-2A-CTDPFA302", "streams": [
        {"stream": "ctdpf_sbe43_sample", "method": "streamed", "beginTime": "2014-10-01T00:00:00.000Z", "endTime": "2018-07-01T00:00:00.000Z"}]},
    {"reference_designator": "RS03ASHS-MJ03B-07-TMPSFA301", "streams": [
        {"stream": "tmpsf_sample", "method": "streamed", "beginTime": "2014-09-29T00:00:00.000Z", "endTime": "2018-07-01T00:00:00.000Z"}]},
    {"reference_designator": "CE02SHBP-LJ01D-06-CTDBPN106", "streams": [
        {"stream": "ctdbp_no_sample", "method": "streamed", "beginTime": "2015-01-01T00:00:00.000Z", "endTime": "2018-07-01T00:00:00.000Z"}]}
]}"#;
pub const VOCAB: &str = r#"[
    {"refdes": "RS03AXPS-PC03A-4A-CTDPFA303", "instrument": "CTD", "tocL1": "Cabled Axial Seamount", "tocL2": "Axial Base Shallow Profiler Mooring", "tocL3": "Shallow Profiler (PC03A)", "preferred_stream": "ctdpf_optode_sample"},
    {"refdes": "RS03AXPS-SF03A-2A-CTDPFA302", "instrument": "CTD", "tocL1": "Cabled Axial Seamount", "tocL2": "Axial Base Shallow Profiler Mooring", "tocL3": "Shallow Profiler (SF03A)", "preferred_stream": "ctdpf_sbe43_sample"},
    {"refdes": "RS03ASHS-MJ03B-07-TMPSFA301", "instrument": "Diffuse Vent Fluid 3-D Temperature Array", "tocL1": "Cabled Axial Seamount", "tocL2": "ASHES Vent Field", "tocL3": "Medium-Power JBox (MJ03B)", "preferred_stream": "tmpsf_sample"},
    {"refdes": "CE02SHBP-LJ01D-06-CTDBPN106", "instrument": "CTD", "tocL1": "Coastal Endurance", "tocL2": "Oregon Shelf Cabled Benthic Experiment Package", "tocL3": "Low-Power JBox (LJ01D)", "preferred_stream": "ctdbp_no_sample"}
]"#;
pub const STREAMS: &str = r#"[
    {"name": "ctdpf_optode_sample", "stream_type": {"value": "Science"}, "stream_content": {"value": "CTD Data"}},
    {"name": "ctdpf_sbe43_sample", "stream_type": {"value": "Science"}, "stream_content": {"value": "CTD Data"}},
    {"name": "tmpsf_sample", "stream_type": {"value": "Science"}, "stream_content": {"value": "Temperature Data"}},
    {"name": "ctdbp_no_sample", "stream_type": {"value": "Science"}, "stream_content": {"value": "CTD Data"}}
]"#;

/// Name of the async results directory of a job for `refdes`/`stream`.
pub fn job_dir(refdes: &str, stream: &str) -> String {
    format!("20180707T101010-{refdes}-streamed-{stream}")
}

pub fn times(stream: &str) -> String {
    format!(
        r#"[{{"stream": "{stream}", "method": "streamed", "beginTime": "2014-09-27T18:33:23.000Z", "endTime": "2018-06-30T23:59:59.000Z"}}]"#
    )
}

pub fn stream_meta(stream: &str) -> String {
    format!(r#"{{"name": "{stream}", "stream_type": {{"value": "Science"}}}}"#)
}

pub fn job_reply(refdes: &str, stream: &str) -> String {
    let dir = job_dir(refdes, stream);
    format!(
        r#"{{"requestUUID": "{dir}", "allURLs": ["https://opendap.oceanobservatories.org/thredds/catalog/ooi/tester/{dir}/catalog.html", "https://opendap.oceanobservatories.org/async_results/tester/{dir}"]}}"#
    )
}

/// THREDDS catalog listing one deployment file, its provenance json and an ncml aggregate.
pub fn thredds_catalog(refdes: &str, stream: &str) -> String {
    let dir = job_dir(refdes, stream);
    let file = format!("deployment0004_{refdes}-streamed-{stream}_20180101T000000-20180102T000000");
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<catalog xmlns="http://www.unidata.ucar.edu/namespaces/thredds/InvCatalog/v1.0" version="1.0.1">
  <service name="all" serviceType="Compound" base="">
    <service name="odap" serviceType="OPENDAP" base="/thredds/dodsC/" />
    <service name="http" serviceType="HTTPServer" base="/thredds/fileServer/" />
  </service>
  <dataset name="{dir}" ID="ooi/tester/{dir}">
    <dataset name="{file}.nc" ID="ooi/tester/{dir}/{file}.nc" urlPath="ooi/tester/{dir}/{file}.nc" />
    <dataset name="{file}.json" ID="ooi/tester/{dir}/{file}.json" urlPath="ooi/tester/{dir}/{file}.json" />
    <dataset name="{file}.ncml" ID="ooi/tester/{dir}/{file}.ncml" urlPath="ooi/tester/{dir}/{file}.ncml" />
  </dataset>
</catalog>
"#
    )
}

/// Serves fixed replies by URL substring; the first matching route wins.
#[derive(Default)]
pub struct FixtureTransport {
    routes: Vec<(String, u16, Vec<u8>)>,
    calls: Mutex<Vec<String>>,
}

impl FixtureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, needle: &str, status: u16, body: impl Into<Vec<u8>>) -> Self {
        self.routes.push((needle.to_string(), status, body.into()));
        self
    }

    /// Appends the routes of `other` after this one's.
    pub fn and(mut self, other: FixtureTransport) -> Self {
        self.routes.extend(other.routes);
        self
    }

    /// Every route the upstream would need for a full session.
    pub fn ooi() -> Self {
        let mut t = Self::new()
            .route("regions.csv", 200, REGIONS)
            .route("sites.csv", 200, SITES)
            .route("sensor/inv/toc", 200, TOC)
            .route("12586/vocab", 200, VOCAB);
        for (refdes, stream) in [(CTD_OPTODE, "ctdpf_optode_sample"), (CTD_SBE43, "ctdpf_sbe43_sample")] {
            let sensor = refdes.rsplit('-').next().unwrap_or(refdes);
            t = t
                .route(&format!("byname/{stream}"), 200, stream_meta(stream))
                .route(&format!("{sensor}/metadata/times"), 200, times(stream))
                .route(&format!("streamed/{stream}"), 200, job_reply(refdes, stream))
                .route(&format!("{}/catalog.xml", job_dir(refdes, stream)), 200, thredds_catalog(refdes, stream));
        }
        t.route("12575/stream", 200, STREAMS).route("status.txt", 200, "complete")
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }
}

impl Transport for FixtureTransport {
    fn get(&self, url: &str, query: &[(String, String)], _auth: Option<&Credentials>) -> Result<Reply> {
        let full = if query.is_empty() {
            url.to_string()
        } else {
            let qs: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
            format!("{url}?{}", qs.join("&"))
        };
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(full.clone());
        }
        let (status, body) = self
            .routes
            .iter()
            .find(|(needle, _, _)| full.contains(needle.as_str()))
            .map(|(_, status, body)| (*status, body.clone()))
            .unwrap_or((404, Vec::new()));
        Ok(Reply { status, url: full, body })
    }
}

pub fn client(transport: std::sync::Arc<FixtureTransport>) -> Client {
    let cfg = ClientConfig::new(Credentials::new("OOIAPI-TESTER", "TEMP-TOKEN"));
    Client::with_transport(cfg, transport).with_progress(false)
}

/// Stands in for a NetCDF reader: every file holds three CTD samples.
pub struct CtdOpener;

impl DatasetOpener for CtdOpener {
    fn open(&self, urls: &[String]) -> Result<Dataset> {
        if urls.is_empty() {
            return Err(Error::DataUnavailable("nothing to open".into()));
        }
        let n = urls.len() * 3;
        let mut ds = Dataset::new();
        ds.add_coord("obs", Variable::new(&["obs"], Values::Float((0..n).map(|i| i as f64).collect())))?;
        ds.add_var(
            "time",
            Variable::new(&["obs"], Values::Float((0..n).map(|i| 3_723_753_600.0 + i as f64).collect()))
                .with_attr("units", "seconds since 1900-01-01 0:0:0"),
        )?;
        ds.add_var(
            "conductivity",
            Variable::new(&["obs"], Values::Float(vec![3.27; n])).with_attr("units", "S m-1"),
        )?;
        ds.attrs.insert("source".into(), urls.join(","));
        Ok(ds)
    }
}
