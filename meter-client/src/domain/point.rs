use time::OffsetDateTime;

use super::{Classification, ConsumptionSample, Tariff};

/// Measurement (QuestDB table) consumption points are written to.
pub const CONSUMPTION_MEASUREMENT: &str = "consumption";

/// Value of the `unit` tag on every consumption point.
pub const CONSUMPTION_UNIT: &str = "kwh";

/// A fully tagged time-series point, ready to be handed to the store.
///
/// Points are keyed by `(measurement, ts, unit)`; writing the same point
/// twice replaces the stored row.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct IngestionPoint {
    pub ts: OffsetDateTime,
    pub tariff: Tariff,
    pub consumption_kwh: f64,
    pub billed_power_kw: f64,
    pub sun_hours: bool,
    pub power_peak: bool,
}

impl IngestionPoint {
    pub fn new(sample: &ConsumptionSample, classification: Classification, billed_power_kw: f64) -> Self {
        Self {
            ts: sample.start,
            tariff: classification.tariff,
            consumption_kwh: sample.value_kwh,
            billed_power_kw,
            sun_hours: classification.is_sun_club(),
            power_peak: classification.is_peak,
        }
    }

    pub fn measurement(&self) -> &'static str {
        CONSUMPTION_MEASUREMENT
    }

    pub fn unit(&self) -> &'static str {
        CONSUMPTION_UNIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn point_carries_sample_and_classification() {
        let sample = ConsumptionSample {
            start: datetime!(2024-06-01 13:00:00 +02:00),
            value_kwh: 0.42,
        };
        let class = Classification {
            tariff: Tariff::SunClub,
            is_peak: true,
        };

        let p = IngestionPoint::new(&sample, class, 3.5);

        assert_eq!(p.ts, sample.start);
        assert_eq!(p.measurement(), "consumption");
        assert_eq!(p.unit(), "kwh");
        assert_eq!(p.tariff, Tariff::SunClub);
        assert_eq!(p.consumption_kwh, 0.42);
        assert_eq!(p.billed_power_kw, 3.5);
        assert!(p.sun_hours);
        assert!(p.power_peak);
    }
}
