use meter_client::domain::{ConsumptionSample, IngestionPoint, TimeRange, CONSUMPTION_MEASUREMENT};
use time::OffsetDateTime;

use crate::config::TariffSettings;
use crate::transform::{self, dedup::ExistingInstants};

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("fetch error: {0}")]
    Fetch(String),
    #[error("query error: {0}")]
    Query(String),
    #[error("write error: {0}")]
    Write(String),
    #[error("reset error: {0}")]
    Reset(String),
}

impl PipelineError {
    /// Short label used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::Query(_) => "query",
            Self::Write(_) => "write",
            Self::Reset(_) => "reset",
        }
    }
}

/// Upstream provider of interval readings.
///
/// Implementations return samples ordered by `start` ascending and restricted
/// to `[range.from, range.to)`. An empty vector means "no data", never an error.
#[async_trait::async_trait]
pub trait ConsumptionSource: Send + Sync {
    async fn fetch(&self, range: TimeRange) -> Result<Vec<ConsumptionSample>, PipelineError>;
}

/// Time-series store the pipeline reads existing points from and writes to.
#[async_trait::async_trait]
pub trait PointStore: Send + Sync {
    async fn existing_timestamps(
        &self,
        measurement: &str,
        range: TimeRange,
    ) -> Result<Vec<OffsetDateTime>, PipelineError>;

    /// Persist one batch. Called at most once per cycle, never with an empty slice.
    async fn write_points(&self, points: &[IngestionPoint]) -> Result<(), PipelineError>;

    async fn reset_measurement(&self, measurement: &str) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub written: usize,
    pub skipped_existing: usize,
}

/// One fetch → dedup → build → write pass over a single time range.
pub struct IngestionPipeline<S, K> {
    pub source: S,
    pub store: K,
    pub tariff: TariffSettings,
}

impl<S, K> IngestionPipeline<S, K>
where
    S: ConsumptionSource,
    K: PointStore,
{
    pub fn new(source: S, store: K, tariff: TariffSettings) -> Self {
        Self { source, store, tariff }
    }

    pub async fn run(&self, range: TimeRange) -> Result<CycleReport, PipelineError> {
        let samples = self.source.fetch(range).await?;
        if samples.is_empty() {
            tracing::info!(
                range_from = %range.from,
                range_to = %range.to,
                "no consumption samples returned for range"
            );
            return Ok(CycleReport::default());
        }

        let existing = ExistingInstants::from_query(
            self.store
                .existing_timestamps(CONSUMPTION_MEASUREMENT, range)
                .await,
        );

        let fetched = samples.len();
        let fresh = existing.filter(samples);
        let skipped_existing = fetched - fresh.len();
        metrics::counter!("consumption_samples_skipped_total").increment(skipped_existing as u64);

        if fresh.is_empty() {
            tracing::info!(
                range_from = %range.from,
                range_to = %range.to,
                skipped_existing,
                "all fetched samples already stored"
            );
            return Ok(CycleReport {
                written: 0,
                skipped_existing,
            });
        }

        let points: Vec<IngestionPoint> = fresh
            .iter()
            .map(|sample| transform::build_point(sample, &self.tariff))
            .collect();

        self.store.write_points(&points).await?;
        metrics::counter!("consumption_points_written_total").increment(points.len() as u64);

        tracing::info!(
            range_from = %range.from,
            range_to = %range.to,
            written = points.len(),
            skipped_existing,
            "consumption points written"
        );

        Ok(CycleReport {
            written: points.len(),
            skipped_existing,
        })
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use meter_client::domain::Tariff;
    use time::macros::datetime;
    use time::Duration;

    use super::testing::{MemoryStore, ScriptedSource};
    use super::*;

    fn hourly_samples(from: OffsetDateTime, n: usize) -> Vec<ConsumptionSample> {
        (0..n)
            .map(|i| ConsumptionSample {
                start: from + Duration::hours(i as i64),
                value_kwh: 0.1 * (i as f64 + 1.0),
            })
            .collect()
    }

    fn day_range() -> TimeRange {
        TimeRange::new(
            datetime!(2024-06-01 00:00:00 +02:00),
            datetime!(2024-06-02 00:00:00 +02:00),
        )
    }

    #[tokio::test]
    async fn writes_classified_points_in_fetch_order() {
        let samples = hourly_samples(datetime!(2024-06-01 11:00:00 +02:00), 3);
        let store = Arc::new(MemoryStore::default());
        let pipeline = IngestionPipeline::new(
            ScriptedSource::returning(samples.clone()),
            store.clone(),
            TariffSettings::default(),
        );

        let report = pipeline.run(day_range()).await.unwrap();

        assert_eq!(report, CycleReport { written: 3, skipped_existing: 0 });
        let points = store.written();
        assert_eq!(points.len(), 3);
        assert_eq!(points.iter().map(|p| p.ts).collect::<Vec<_>>(), samples.iter().map(|s| s.start).collect::<Vec<_>>());
        assert_eq!(points[0].tariff, Tariff::Standard);
        assert_eq!(points[1].tariff, Tariff::SunClub);
        assert!(points[1].sun_hours);
        assert_eq!(points[2].consumption_kwh, samples[2].value_kwh);
        assert_eq!(points[0].billed_power_kw, 3.5);
        assert_eq!(store.write_calls(), 1);
    }

    #[tokio::test]
    async fn second_identical_run_writes_nothing() {
        let samples = hourly_samples(datetime!(2024-06-01 00:00:00 +02:00), 24);
        let store = Arc::new(MemoryStore::default());
        let pipeline = IngestionPipeline::new(
            ScriptedSource::returning(samples),
            store.clone(),
            TariffSettings::default(),
        );

        let first = pipeline.run(day_range()).await.unwrap();
        let second = pipeline.run(day_range()).await.unwrap();

        assert_eq!(first.written, 24);
        assert_eq!(second, CycleReport { written: 0, skipped_existing: 24 });
        assert_eq!(store.written().len(), 24);
        assert_eq!(store.write_calls(), 1);
    }

    #[tokio::test]
    async fn overlapping_run_writes_only_new_samples() {
        let store = Arc::new(MemoryStore::default());
        let source = Arc::new(ScriptedSource::default());
        source.push(Ok(hourly_samples(datetime!(2024-06-01 00:00:00 +02:00), 10)));
        source.push(Ok(hourly_samples(datetime!(2024-06-01 06:00:00 +02:00), 10)));
        let pipeline = IngestionPipeline::new(source, store.clone(), TariffSettings::default());

        pipeline.run(day_range()).await.unwrap();
        let report = pipeline.run(day_range()).await.unwrap();

        assert_eq!(report, CycleReport { written: 6, skipped_existing: 4 });
        assert_eq!(store.written().len(), 16);
    }

    #[tokio::test]
    async fn failed_existing_query_fails_open() {
        let samples = hourly_samples(datetime!(2024-06-01 00:00:00 +02:00), 5);
        let store = Arc::new(MemoryStore {
            fail_queries: true,
            ..Default::default()
        });
        let pipeline = IngestionPipeline::new(
            ScriptedSource::returning(samples),
            store.clone(),
            TariffSettings::default(),
        );

        let report = pipeline.run(day_range()).await.unwrap();

        assert_eq!(report, CycleReport { written: 5, skipped_existing: 0 });
        assert_eq!(store.written().len(), 5);
    }

    #[tokio::test]
    async fn empty_fetch_is_a_noop() {
        let store = Arc::new(MemoryStore::default());
        let pipeline = IngestionPipeline::new(
            ScriptedSource::returning(Vec::new()),
            store.clone(),
            TariffSettings::default(),
        );

        let report = pipeline.run(day_range()).await.unwrap();

        assert_eq!(report, CycleReport::default());
        assert_eq!(store.write_calls(), 0);
        assert_eq!(store.query_calls(), 0);
    }

    #[tokio::test]
    async fn fetch_error_propagates_without_touching_store() {
        let store = Arc::new(MemoryStore::default());
        let source = ScriptedSource::default();
        source.push(Err(PipelineError::Fetch("401 unauthorized".to_string())));
        let pipeline = IngestionPipeline::new(source, store.clone(), TariffSettings::default());

        let err = pipeline.run(day_range()).await.unwrap_err();

        assert!(matches!(err, PipelineError::Fetch(_)));
        assert_eq!(store.query_calls(), 0);
        assert_eq!(store.write_calls(), 0);
    }

    #[tokio::test]
    async fn write_error_is_reported() {
        let store = Arc::new(MemoryStore {
            fail_writes: true,
            ..Default::default()
        });
        let pipeline = IngestionPipeline::new(
            ScriptedSource::returning(hourly_samples(datetime!(2024-06-01 00:00:00 +02:00), 2)),
            store.clone(),
            TariffSettings::default(),
        );

        let err = pipeline.run(day_range()).await.unwrap_err();

        assert!(matches!(err, PipelineError::Write(_)));
        assert_eq!(err.kind(), "write");
        assert_eq!(store.write_calls(), 1);
    }
}
