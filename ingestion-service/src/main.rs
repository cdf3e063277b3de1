use anyhow::Result;
use consumption_ingestion::{
    config::AppConfig,
    metrics_server, observability,
    pipeline::IngestionPipeline,
    scheduler::PollingScheduler,
    sinks::QuestDbStore,
    sources::OctopusSource,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let tariff = cfg.tariff.resolve();
    tracing::info!(
        timezone = %tariff.zone,
        sun_start = %tariff.sun_window.start,
        sun_end = %tariff.sun_window.end,
        peak_start = %tariff.peak_window.start,
        peak_end = %tariff.peak_window.end,
        billed_power_kw = tariff.billed_power_kw,
        "tariff windows resolved"
    );

    let source = OctopusSource::new(&cfg.octopus, tariff.zone.name())?;
    let store = QuestDbStore::connect(&cfg.questdb, &cfg.store).await?;
    let pipeline = IngestionPipeline::new(source, store, tariff);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested, stopping after the current cycle");
            on_signal.cancel();
        }
    });

    tracing::info!(
        frequency_hours = cfg.schedule.frequency_hours,
        backfill_days = cfg.schedule.backfill_days,
        reset_on_startup = cfg.schedule.reset_on_startup,
        "starting consumption polling"
    );

    let scheduler = PollingScheduler::new(pipeline, cfg.schedule.clone());
    scheduler.run(cancel).await?;

    Ok(())
}
