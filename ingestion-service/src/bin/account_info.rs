use anyhow::Result;
use consumption_ingestion::{config::AppConfig, observability, sources::OctopusSource};

/// Check the configured metering API credentials by listing the accounts
/// they can see.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;
    let tariff = cfg.tariff.resolve();
    let source = OctopusSource::new(&cfg.octopus, tariff.zone.name())?;

    let accounts = source.account_numbers().await?;
    if accounts.is_empty() {
        tracing::warn!("credentials are valid but no accounts are visible");
    }
    for account in &accounts {
        tracing::info!(account = %account, property_id = %cfg.octopus.property_id, "account");
    }

    Ok(())
}
