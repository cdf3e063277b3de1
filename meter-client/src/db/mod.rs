pub mod consumption_queries;

pub use consumption_queries::{
    create_table_sql, drop_measurement, ensure_table, existing_timestamps, validate_measurement,
    CONSUMPTION_COLUMNS, DEDUP_KEYS, TIMESTAMP_COLUMN,
};
