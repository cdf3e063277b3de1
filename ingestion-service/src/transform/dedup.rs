use std::collections::HashSet;

use meter_client::domain::ConsumptionSample;
use time::OffsetDateTime;

use crate::pipeline::PipelineError;

/// Whole seconds since the Unix epoch. Zone-independent, sub-second parts dropped.
fn normalize(ts: OffsetDateTime) -> i64 {
    ts.unix_timestamp()
}

/// Instants already present in the store for the range being ingested.
#[derive(Debug, Default, Clone)]
pub struct ExistingInstants {
    seconds: HashSet<i64>,
}

impl ExistingInstants {
    pub fn new<I>(instants: I) -> Self
    where
        I: IntoIterator<Item = OffsetDateTime>,
    {
        Self {
            seconds: instants.into_iter().map(normalize).collect(),
        }
    }

    /// Build from the store's answer. A failed lookup is treated as "nothing
    /// stored yet" so that real data is never dropped; at worst a point is
    /// rewritten under the same key.
    pub fn from_query(result: Result<Vec<OffsetDateTime>, PipelineError>) -> Self {
        match result {
            Ok(instants) => Self::new(instants),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "existing-timestamp lookup failed, ingesting without dedup"
                );
                metrics::counter!("dedup_query_failures_total").increment(1);
                Self::default()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seconds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seconds.is_empty()
    }

    pub fn contains(&self, ts: OffsetDateTime) -> bool {
        self.seconds.contains(&normalize(ts))
    }

    /// Drop samples whose start is already stored, keeping the input order.
    pub fn filter(&self, samples: Vec<ConsumptionSample>) -> Vec<ConsumptionSample> {
        if self.is_empty() {
            return samples;
        }
        samples.into_iter().filter(|s| !self.contains(s.start)).collect()
    }
}
