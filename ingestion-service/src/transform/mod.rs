pub mod dedup;
pub mod tariff;

use meter_client::domain::{ConsumptionSample, IngestionPoint};

use crate::config::TariffSettings;

pub use dedup::ExistingInstants;
pub use tariff::classify;

/// Classify a sample and turn it into the point that will be stored.
///
/// Pure: the result depends only on the sample and the resolved tariff settings.
pub fn build_point(sample: &ConsumptionSample, tariff: &TariffSettings) -> IngestionPoint {
    let classification = classify(sample.start, tariff.zone, tariff.sun_window, tariff.peak_window);
    IngestionPoint::new(sample, classification, tariff.billed_power_kw)
}
