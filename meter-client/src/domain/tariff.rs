use time::Time;

/// Pricing category a sample falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Tariff {
    SunClub,
    Standard,
}

impl Tariff {
    /// Value stored in the `tariff` tag column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SunClub => "sun_club",
            Self::Standard => "standard",
        }
    }
}

/// Daily recurring window in local time.
///
/// A window whose `start` is later than its `end` wraps past midnight, so
/// `22:00..06:00` covers the night. Both forms are half-open: `start` is
/// inside, `end` is not. Equal bounds describe an empty window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TariffWindow {
    pub start: Time,
    pub end: Time,
}

impl TariffWindow {
    pub const fn new(start: Time, end: Time) -> Self {
        Self { start, end }
    }

    pub fn wraps_midnight(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, t: Time) -> bool {
        if self.wraps_midnight() {
            t >= self.start || t < self.end
        } else {
            self.start <= t && t < self.end
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Classification {
    pub tariff: Tariff,
    pub is_peak: bool,
}

impl Classification {
    pub fn is_sun_club(&self) -> bool {
        self.tariff == Tariff::SunClub
    }
}
