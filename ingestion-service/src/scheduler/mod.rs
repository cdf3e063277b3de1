//! Drives ingestion cycles: optional reset, one startup cycle, then a fixed
//! cadence until cancelled.

use meter_client::domain::{TimeRange, CONSUMPTION_MEASUREMENT};
use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;

use crate::config::ScheduleConfig;
use crate::pipeline::{ConsumptionSource, CycleReport, IngestionPipeline, PipelineError, PointStore};

/// Extra lookback added to every steady cycle so a late wake-up leaves no gap.
pub const STEADY_OVERLAP: Duration = Duration::HOUR;

/// `count` units of `unit_secs` seconds, saturating at [`Duration::MAX`].
fn saturating_span(count: u64, unit_secs: i64) -> Duration {
    i64::try_from(count)
        .ok()
        .and_then(|c| c.checked_mul(unit_secs))
        .map_or(Duration::MAX, Duration::seconds)
}

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

pub struct PollingScheduler<S, K, C = SystemClock> {
    pipeline: IngestionPipeline<S, K>,
    schedule: ScheduleConfig,
    clock: C,
}

impl<S, K> PollingScheduler<S, K, SystemClock>
where
    S: ConsumptionSource,
    K: PointStore,
{
    pub fn new(pipeline: IngestionPipeline<S, K>, schedule: ScheduleConfig) -> Self {
        Self::with_clock(pipeline, schedule, SystemClock)
    }
}

impl<S, K, C> PollingScheduler<S, K, C>
where
    S: ConsumptionSource,
    K: PointStore,
    C: Clock,
{
    pub fn with_clock(pipeline: IngestionPipeline<S, K>, schedule: ScheduleConfig, clock: C) -> Self {
        Self {
            pipeline,
            schedule,
            clock,
        }
    }

    fn frequency(&self) -> Duration {
        saturating_span(self.schedule.frequency_hours, 3600)
    }

    /// Range of the single cycle run before the steady loop, if any.
    pub fn startup_range(&self, now: OffsetDateTime) -> Option<TimeRange> {
        if self.schedule.backfill_days > 0 {
            Some(TimeRange::ending_at(now, saturating_span(self.schedule.backfill_days, 86_400)))
        } else if !self.schedule.reset_on_startup {
            Some(TimeRange::ending_at(now, self.frequency().saturating_mul(2)))
        } else {
            None
        }
    }

    pub fn steady_range(&self, now: OffsetDateTime) -> TimeRange {
        TimeRange::ending_at(now, self.frequency().saturating_add(STEADY_OVERLAP))
    }

    /// Run one cycle, absorbing its error. Returns the report on success.
    async fn run_cycle(&self, phase: &'static str, range: TimeRange) -> Option<CycleReport> {
        metrics::counter!("consumption_cycles_total", "phase" => phase).increment(1);

        match self.pipeline.run(range).await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!(
                    phase,
                    kind = e.kind(),
                    error = %e,
                    range_from = %range.from,
                    range_to = %range.to,
                    "ingestion cycle failed"
                );
                metrics::counter!("consumption_cycle_failures_total", "kind" => e.kind()).increment(1);
                None
            }
        }
    }

    async fn reset(&self) -> Result<(), PipelineError> {
        tracing::warn!(
            measurement = CONSUMPTION_MEASUREMENT,
            "reset_on_startup is set, dropping all stored consumption data"
        );

        self.pipeline
            .store
            .reset_measurement(CONSUMPTION_MEASUREMENT)
            .await
            .inspect_err(|e| {
                tracing::error!(error = %e, "reset failed, refusing to start");
            })
    }

    /// Run until `cancel` fires.
    ///
    /// Only a failed startup reset ends this early with an error; every cycle
    /// failure is logged and the loop moves on. Cancellation is observed
    /// between cycles, never in the middle of one.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Ok(());
        }

        if self.schedule.reset_on_startup {
            self.reset().await?;
        }

        let now = self.clock.now();
        match self.startup_range(now) {
            Some(range) => {
                let phase = if self.schedule.backfill_days > 0 {
                    "backfill"
                } else {
                    "startup_check"
                };
                tracing::info!(
                    phase,
                    range_from = %range.from,
                    range_to = %range.to,
                    "running startup cycle"
                );
                self.run_cycle(phase, range).await;
            }
            None => {
                tracing::warn!("store was reset and backfill_days is 0, starting empty until the next cycle");
            }
        }

        let period = std::time::Duration::from_secs(self.schedule.frequency_hours.saturating_mul(3600));
        loop {
            if cancel.is_cancelled() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }

            let range = self.steady_range(self.clock.now());
            self.run_cycle("steady", range).await;
        }

        tracing::info!("polling scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use meter_client::domain::ConsumptionSample;
    use time::macros::datetime;

    use super::*;
    use crate::config::TariffSettings;
    use crate::pipeline::testing::{MemoryStore, ScriptedSource};

    const BASE: OffsetDateTime = datetime!(2024-06-01 12:00:00 UTC);

    /// Wall clock driven by tokio's (paused) clock, truncated to whole seconds.
    struct PausedClock {
        start: tokio::time::Instant,
    }

    impl PausedClock {
        fn new() -> Self {
            Self {
                start: tokio::time::Instant::now(),
            }
        }
    }

    impl Clock for PausedClock {
        fn now(&self) -> OffsetDateTime {
            BASE + std::time::Duration::from_secs(self.start.elapsed().as_secs())
        }
    }

    /// Cancels the scheduler once `limit` fetches have happened.
    struct StopAfter {
        inner: Arc<ScriptedSource>,
        limit: usize,
        cancel: CancellationToken,
    }

    #[async_trait::async_trait]
    impl ConsumptionSource for StopAfter {
        async fn fetch(&self, range: TimeRange) -> Result<Vec<ConsumptionSample>, PipelineError> {
            let result = self.inner.fetch(range).await;
            if self.inner.ranges().len() >= self.limit {
                self.cancel.cancel();
            }
            result
        }
    }

    fn schedule(frequency_hours: u64, backfill_days: u64, reset_on_startup: bool) -> ScheduleConfig {
        ScheduleConfig {
            frequency_hours,
            backfill_days,
            reset_on_startup,
        }
    }

    fn scheduler(
        source: Arc<ScriptedSource>,
        store: Arc<MemoryStore>,
        cfg: ScheduleConfig,
        limit: usize,
        cancel: &CancellationToken,
    ) -> PollingScheduler<StopAfter, Arc<MemoryStore>, PausedClock> {
        let source = StopAfter {
            inner: source,
            limit,
            cancel: cancel.clone(),
        };
        let pipeline = IngestionPipeline::new(source, store, TariffSettings::default());
        PollingScheduler::with_clock(pipeline, cfg, PausedClock::new())
    }

    fn hours(h: i64) -> Duration {
        Duration::hours(h)
    }

    #[tokio::test(start_paused = true)]
    async fn startup_check_then_overlapping_steady_cycles() {
        let source = Arc::new(ScriptedSource::default());
        let store = Arc::new(MemoryStore::default());
        let cancel = CancellationToken::new();
        let s = scheduler(source.clone(), store, schedule(6, 0, false), 3, &cancel);

        s.run(cancel).await.unwrap();

        let ranges = source.ranges();
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0], TimeRange::new(BASE - hours(12), BASE));
        assert_eq!(ranges[1], TimeRange::new(BASE + hours(6) - hours(7), BASE + hours(6)));
        assert_eq!(ranges[2], TimeRange::new(BASE + hours(12) - hours(7), BASE + hours(12)));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_then_backfill() {
        let source = Arc::new(ScriptedSource::default());
        let store = Arc::new(MemoryStore::default());
        let cancel = CancellationToken::new();
        let s = scheduler(source.clone(), store.clone(), schedule(1, 30, true), 1, &cancel);

        s.run(cancel).await.unwrap();

        assert_eq!(*store.resets.lock().unwrap(), vec!["consumption".to_string()]);
        assert_eq!(source.ranges(), vec![TimeRange::new(BASE - Duration::days(30), BASE)]);
    }

    #[tokio::test(start_paused = true)]
    async fn backfill_replaces_startup_check() {
        let source = Arc::new(ScriptedSource::default());
        let store = Arc::new(MemoryStore::default());
        let cancel = CancellationToken::new();
        let s = scheduler(source.clone(), store.clone(), schedule(2, 7, false), 2, &cancel);

        s.run(cancel).await.unwrap();

        assert!(store.resets.lock().unwrap().is_empty());
        assert_eq!(
            source.ranges(),
            vec![
                TimeRange::new(BASE - Duration::days(7), BASE),
                TimeRange::new(BASE + hours(2) - hours(3), BASE + hours(2)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reset_without_backfill_skips_startup_cycle() {
        let source = Arc::new(ScriptedSource::default());
        let store = Arc::new(MemoryStore::default());
        let cancel = CancellationToken::new();
        let s = scheduler(source.clone(), store.clone(), schedule(4, 0, true), 1, &cancel);

        s.run(cancel).await.unwrap();

        assert_eq!(store.resets.lock().unwrap().len(), 1);
        assert_eq!(source.ranges(), vec![TimeRange::new(BASE - hours(1), BASE + hours(4))]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cycle_does_not_stop_the_loop() {
        // Inside the lookback of both the third and fourth cycle.
        let sample = ConsumptionSample {
            start: BASE + hours(1),
            value_kwh: 0.3,
        };
        let source = Arc::new(ScriptedSource::returning(vec![sample]));
        source.push(Err(PipelineError::Fetch("502 bad gateway".to_string())));
        source.push(Err(PipelineError::Fetch("502 bad gateway".to_string())));
        let store = Arc::new(MemoryStore::default());
        let cancel = CancellationToken::new();
        let s = scheduler(source.clone(), store.clone(), schedule(1, 0, false), 4, &cancel);

        s.run(cancel).await.unwrap();

        assert_eq!(source.ranges().len(), 4);
        // Third cycle writes the sample, fourth finds it already stored.
        assert_eq!(store.written().len(), 1);
        assert_eq!(store.write_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_writes_are_isolated_too() {
        let sample = ConsumptionSample {
            start: BASE - hours(1),
            value_kwh: 0.3,
        };
        let source = Arc::new(ScriptedSource::returning(vec![sample]));
        let store = Arc::new(MemoryStore {
            fail_writes: true,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let s = scheduler(source.clone(), store.clone(), schedule(1, 0, false), 3, &cancel);

        s.run(cancel).await.unwrap();

        assert_eq!(source.ranges().len(), 3);
        assert_eq!(store.write_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reset_halts_startup() {
        let source = Arc::new(ScriptedSource::default());
        let store = Arc::new(MemoryStore {
            fail_reset: true,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let s = scheduler(source.clone(), store, schedule(1, 3, true), 1, &cancel);

        let err = s.run(cancel).await.unwrap_err();

        assert!(matches!(err, PipelineError::Reset(_)));
        assert!(source.ranges().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_does_nothing() {
        let source = Arc::new(ScriptedSource::default());
        let store = Arc::new(MemoryStore::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let s = scheduler(source.clone(), store.clone(), schedule(1, 0, true), 1, &cancel);

        s.run(cancel).await.unwrap();

        assert!(source.ranges().is_empty());
        assert!(store.resets.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_sleep_stops_promptly() {
        let source = Arc::new(ScriptedSource::default());
        let store = Arc::new(MemoryStore::default());
        let cancel = CancellationToken::new();
        let s = scheduler(source.clone(), store, schedule(24, 0, false), usize::MAX, &cancel);

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            stopper.cancel();
        });
        s.run(cancel).await.unwrap();

        // Only the startup check ran; the 24h sleep was interrupted.
        assert_eq!(source.ranges().len(), 1);
    }

    #[test]
    fn range_helpers() {
        let pipeline = IngestionPipeline::new(
            ScriptedSource::default(),
            MemoryStore::default(),
            TariffSettings::default(),
        );
        let s = PollingScheduler::new(pipeline, schedule(3, 0, false));

        assert_eq!(s.startup_range(BASE), Some(TimeRange::new(BASE - hours(6), BASE)));
        assert_eq!(s.steady_range(BASE), TimeRange::new(BASE - hours(4), BASE));
    }

    #[test]
    fn oversized_schedule_yields_clamped_ranges() {
        let pipeline = IngestionPipeline::new(
            ScriptedSource::default(),
            MemoryStore::default(),
            TariffSettings::default(),
        );
        let s = PollingScheduler::new(pipeline, schedule(u64::MAX, 10_000_000, false));

        let startup = s.startup_range(BASE).unwrap();
        assert_eq!(startup.to, BASE);
        assert!(startup.from < datetime!(1970-01-01 00:00:00 UTC));

        let steady = s.steady_range(BASE);
        assert_eq!(steady.to, BASE);
        assert!(!steady.is_empty());
    }
}
