use anyhow::Result;
use ooi_m2m::{CatalogCache, Client, DataRequest, Ooi, PollOutcome, SearchQuery};
use std::path::Path;

fn main() -> Result<()> {
    // Example program that calls the library API.
    // Configure authentication via OOI_USERNAME/OOI_TOKEN or ~/.ooi-m2m/credentials.json.
    tracing_subscriber::fmt().init();

    let client = Client::from_env()?;
    let cache = CatalogCache::default_location()?;
    let mut ooi = Ooi::connect(client, Some(&cache))?;

    let found = ooi.search(
        &SearchQuery::new()
            .region("cabled array")
            .site("axial base shallow profiler")
            .instrument("CTD")
            .stream_type("science"),
    );
    for r in found {
        println!("{} {} {}", r.reference_designator, r.stream_method, r.stream_rd);
    }

    let report = ooi.request_data(&DataRequest::new(Some("2018-01-01"), Some("2018-01-02")))?;
    println!(
        "{} export(s) compiling, {} skipped, {} failed",
        report.jobs,
        report.skipped.len(),
        report.failed.len()
    );

    let poll = ooi.wait(None);
    if poll.outcome != PollOutcome::AllReady {
        println!("still compiling after {:?}; run again later", poll.elapsed);
        return Ok(());
    }

    let files = ooi.download_files(Path::new("ooi-data"), |plan| {
        println!("downloading {} file(s) to {}", plan.urls.len(), plan.dest.display());
        true
    })?;
    for f in files {
        match f {
            Ok(path) => println!("saved {}", path.display()),
            Err(e) => println!("failed: {e}"),
        }
    }
    Ok(())
}
