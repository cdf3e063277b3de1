use anyhow::{bail, Result};
use sqlx::PgPool;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::domain::TimeRange;

/// Table names cannot be bound as parameters, so only plain identifiers are
/// allowed to be spliced into SQL.
pub fn validate_measurement(measurement: &str) -> Result<()> {
    let valid = !measurement.is_empty()
        && measurement
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !measurement.starts_with(|c: char| c.is_ascii_digit());

    if !valid {
        bail!("invalid measurement name '{measurement}'");
    }
    Ok(())
}

/// Column layout of a consumption table, in insert order.
pub const CONSUMPTION_COLUMNS: [(&str, &str); 7] = [
    (TIMESTAMP_COLUMN, "TIMESTAMP"),
    ("unit", "SYMBOL"),
    ("tariff", "SYMBOL"),
    ("consumption", "DOUBLE"),
    ("power", "DOUBLE"),
    ("sun_hours", "BOOLEAN"),
    ("power_peak", "BOOLEAN"),
];

/// Designated timestamp of a consumption table.
pub const TIMESTAMP_COLUMN: &str = "ts";

/// Columns that identify a point. Rewriting a point with the same key
/// replaces the stored row.
pub const DEDUP_KEYS: [&str; 2] = [TIMESTAMP_COLUMN, "unit"];

/// `CREATE TABLE IF NOT EXISTS` for a consumption table.
pub fn create_table_sql(measurement: &str) -> Result<String> {
    validate_measurement(measurement)?;

    let columns = CONSUMPTION_COLUMNS
        .iter()
        .map(|(name, ty)| format!("{name} {ty}"))
        .collect::<Vec<_>>()
        .join(", ");

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {measurement} ({columns}) \
         TIMESTAMP({TIMESTAMP_COLUMN}) PARTITION BY DAY WAL \
         DEDUP UPSERT KEYS({})",
        DEDUP_KEYS.join(", ")
    ))
}

/// Create the table for `measurement` unless it already exists.
///
/// ILP would otherwise auto-create it with a `timestamp` column and no
/// dedup keys.
pub async fn ensure_table(pool: &PgPool, measurement: &str) -> Result<()> {
    let sql = create_table_sql(measurement)?;
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

fn existing_timestamps_sql(measurement: &str) -> Result<String> {
    validate_measurement(measurement)?;

    Ok(format!(
        "SELECT {TIMESTAMP_COLUMN} FROM {measurement} \
         WHERE {TIMESTAMP_COLUMN} >= $1 AND {TIMESTAMP_COLUMN} < $2 \
         ORDER BY {TIMESTAMP_COLUMN}"
    ))
}

/// QuestDB stores designated timestamps without zone information, always in UTC.
fn to_utc_primitive(ts: OffsetDateTime) -> PrimitiveDateTime {
    let utc = ts.to_offset(UtcOffset::UTC);
    PrimitiveDateTime::new(utc.date(), utc.time())
}

/// Timestamps already stored for `measurement` within `[range.from, range.to)`.
pub async fn existing_timestamps(
    pool: &PgPool,
    measurement: &str,
    range: TimeRange,
) -> Result<Vec<OffsetDateTime>> {
    let sql = existing_timestamps_sql(measurement)?;

    let rows = sqlx::query_scalar::<_, PrimitiveDateTime>(&sql)
        .bind(to_utc_primitive(range.from))
        .bind(to_utc_primitive(range.to))
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(PrimitiveDateTime::assume_utc).collect())
}

/// Drop the table of `measurement` with every stored row. Callers recreate it
/// with [`ensure_table`].
pub async fn drop_measurement(pool: &PgPool, measurement: &str) -> Result<()> {
    validate_measurement(measurement)?;

    let sql = format!("DROP TABLE IF EXISTS {measurement}");
    sqlx::query(&sql).execute(pool).await?;

    Ok(())
}
