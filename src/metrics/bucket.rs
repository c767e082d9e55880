use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::model::toggle::Variant;

/// Evaluation counters of one toggle within a [`Bucket`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationCount {
    pub yes: u64,
    pub no: u64,
    pub variants: BTreeMap<String, u64>,
}

/// Frozen counters of a closed time window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub toggles: BTreeMap<String, EvaluationCount>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MetricsPayload<'a> {
    pub app_name: &'a str,
    pub instance_id: &'a str,
    pub bucket: &'a Bucket,
}

/// Live, concurrently written counters of the current window.
pub struct CountBucket {
    start: DateTime<Utc>,
    yes: DashMap<String, AtomicU64>,
    no: DashMap<String, AtomicU64>,
    variants: DashMap<(String, String), AtomicU64>,
}

impl CountBucket {
    /// An empty bucket whose window opens at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            yes: DashMap::new(),
            no: DashMap::new(),
            variants: DashMap::new(),
        }
    }

    /// Counts one evaluation of `feature` and hands `enabled` back.
    pub fn count(&self, feature: &str, enabled: bool) -> bool {
        self.add(feature, enabled, 1);
        enabled
    }

    /// Counts one evaluation of `feature` resulting in `variant` and hands `variant` back.
    pub fn count_variant(&self, feature: &str, variant: Variant) -> Variant {
        self.add_variant(feature, &variant.name, 1);
        variant
    }

    pub fn is_empty(&self) -> bool {
        self.yes.is_empty() && self.no.is_empty() && self.variants.is_empty()
    }

    /// Adds the counters of a bucket that failed to be delivered.
    pub fn merge(&self, bucket: &Bucket) {
        for (feature, count) in &bucket.toggles {
            if count.yes > 0 {
                self.add(feature, true, count.yes);
            }
            if count.no > 0 {
                self.add(feature, false, count.no);
            }
            for (variant, increment) in &count.variants {
                self.add_variant(feature, variant, *increment);
            }
        }
    }

    pub fn freeze(self, stop: DateTime<Utc>) -> Bucket {
        let mut toggles: BTreeMap<String, EvaluationCount> = BTreeMap::new();
        for (feature, count) in self.yes {
            toggles.entry(feature).or_default().yes = count.into_inner();
        }
        for (feature, count) in self.no {
            toggles.entry(feature).or_default().no = count.into_inner();
        }
        for ((feature, variant), count) in self.variants {
            toggles
                .entry(feature)
                .or_default()
                .variants
                .insert(variant, count.into_inner());
        }
        Bucket {
            start: self.start,
            stop,
            toggles,
        }
    }

    fn add(&self, feature: &str, enabled: bool, increment: u64) {
        let counters = if enabled { &self.yes } else { &self.no };
        if let Some(counter) = counters.get(feature) {
            counter.fetch_add(increment, Ordering::Relaxed);
            return;
        }
        counters
            .entry(feature.to_owned())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(increment, Ordering::Relaxed);
    }

    fn add_variant(&self, feature: &str, variant: &str, increment: u64) {
        self.variants
            .entry((feature.to_owned(), variant.to_owned()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(increment, Ordering::Relaxed);
    }
}
