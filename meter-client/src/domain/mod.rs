pub mod consumption;
pub mod point;
pub mod tariff;

pub use consumption::{ConsumptionSample, TimeRange};
pub use point::{IngestionPoint, CONSUMPTION_MEASUREMENT, CONSUMPTION_UNIT};
pub use tariff::{Classification, Tariff, TariffWindow};
