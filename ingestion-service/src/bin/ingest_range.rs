use anyhow::{bail, Context, Result};
use consumption_ingestion::{
    config::AppConfig, observability, pipeline::IngestionPipeline, sinks::QuestDbStore,
    sources::OctopusSource,
};
use meter_client::domain::TimeRange;
use std::env;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

fn parse_instant(name: &str, raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).with_context(|| format!("invalid {name} '{raw}', expected RFC 3339"))
}

/// Ingest one explicit range, e.g. to fill a gap by hand:
///
/// `ingest_range 2024-06-01T00:00:00+02:00 2024-06-08T00:00:00+02:00`
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("usage: ingest_range <since RFC3339> <until RFC3339>");
    }
    let range = TimeRange::new(parse_instant("since", &args[1])?, parse_instant("until", &args[2])?);
    if range.is_empty() {
        bail!("since must be earlier than until");
    }

    // Same config file as the daemon (INGESTION_CONFIG).
    let cfg = AppConfig::load()?;
    let tariff = cfg.tariff.resolve();

    let source = OctopusSource::new(&cfg.octopus, tariff.zone.name())?;
    let store = QuestDbStore::connect(&cfg.questdb, &cfg.store).await?;
    let pipeline = IngestionPipeline::new(source, store, tariff);

    let report = pipeline.run(range).await?;
    tracing::info!(
        range_from = %range.from,
        range_to = %range.to,
        written = report.written,
        skipped_existing = report.skipped_existing,
        "range ingested"
    );

    Ok(())
}
