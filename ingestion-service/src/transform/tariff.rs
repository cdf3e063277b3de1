use chrono::{TimeZone, Timelike};
use chrono_tz::Tz;
use meter_client::domain::{Classification, Tariff, TariffWindow};
use time::{OffsetDateTime, Time, UtcOffset};

/// Wall-clock time of day of `instant` in `zone`, DST included.
pub fn local_time_of_day(instant: OffsetDateTime, zone: Tz) -> Time {
    let local = zone
        .timestamp_opt(instant.unix_timestamp(), instant.nanosecond())
        .single();

    local
        .and_then(|dt| {
            Time::from_hms_nano(
                dt.hour() as u8,
                dt.minute() as u8,
                dt.second() as u8,
                dt.nanosecond(),
            )
            .ok()
        })
        // Only reachable for instants chrono cannot represent; fall back to UTC.
        .unwrap_or_else(|| instant.to_offset(UtcOffset::UTC).time())
}

/// Tariff label and peak flag for a reading starting at `instant`.
///
/// Depends on nothing but its arguments, so the same instant always yields the
/// same classification regardless of batch or fetch order.
pub fn classify(instant: OffsetDateTime, zone: Tz, sun: TariffWindow, peak: TariffWindow) -> Classification {
    let t = local_time_of_day(instant, zone);

    let tariff = if sun.contains(t) {
        Tariff::SunClub
    } else {
        Tariff::Standard
    };

    Classification {
        tariff,
        is_peak: peak.contains(t),
    }
}
