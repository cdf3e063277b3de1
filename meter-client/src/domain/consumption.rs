use time::{Date, Duration, OffsetDateTime};

/// One raw interval reading as returned by the metering API.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ConsumptionSample {
    pub start: OffsetDateTime,
    pub value_kwh: f64,
}

/// Half-open `[from, to)` interval of instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TimeRange {
    pub from: OffsetDateTime,
    pub to: OffsetDateTime,
}

impl TimeRange {
    pub fn new(from: OffsetDateTime, to: OffsetDateTime) -> Self {
        Self { from, to }
    }

    /// The range ending at `now` and reaching `lookback` into the past,
    /// clamped to the earliest representable date.
    pub fn ending_at(now: OffsetDateTime, lookback: Duration) -> Self {
        let from = now
            .checked_sub(lookback)
            .unwrap_or_else(|| Date::MIN.midnight().assume_utc());
        Self { from, to: now }
    }

    pub fn contains(&self, ts: OffsetDateTime) -> bool {
        self.from <= ts && ts < self.to
    }

    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }
}
