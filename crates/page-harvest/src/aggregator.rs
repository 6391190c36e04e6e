// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Keyed merge buckets for high-cardinality event kinds.
//!
//! Every observation sharing a signature lands in one bucket, so a page that
//! issues the same request a thousand times ships one entry with merged
//! metrics instead of a thousand entries.

use std::collections::BTreeMap;
use std::hash::Hasher;

use fnv::{FnvBuildHasher, FnvHasher};
use hashbrown::HashMap;
use tracing::warn;
use ustr::Ustr;

use crate::attributes::Attributes;
use crate::constants;
use crate::errors;

type FnvHashMap<K, V> = HashMap<K, V, FnvBuildHasher>;

/// Per-observation metric values, keyed by metric name.
pub type Metrics = BTreeMap<String, f64>;

/// Running statistics for one metric of one bucket.
///
/// Merging only adds counts and sums and widens the extrema, so the result
/// does not depend on the order observations arrive in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricStats {
    pub count: u64,
    pub total: f64,
    pub min: f64,
    pub max: f64,
    pub sum_of_squares: f64,
}

impl MetricStats {
    #[must_use]
    pub fn new(value: f64) -> Self {
        Self {
            count: 1,
            total: value,
            min: value,
            max: value,
            sum_of_squares: value * value,
        }
    }

    pub fn add(&mut self, value: f64) {
        self.merge(&MetricStats::new(value));
    }

    pub fn merge(&mut self, other: &MetricStats) {
        self.count += other.count;
        self.total += other.total;
        self.sum_of_squares += other.sum_of_squares;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

/// Deterministic hash of a bucket signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignatureKey(u64);

impl SignatureKey {
    #[must_use]
    pub fn of(signature: &str) -> Self {
        let mut hasher = FnvHasher::default();
        hasher.write(signature.as_bytes());
        SignatureKey(hasher.finish())
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateBucket {
    pub kind: Ustr,
    pub key: SignatureKey,
    pub signature: String,
    /// Parameters of the first observation, never overwritten by later ones.
    pub params: Attributes,
    pub metrics: BTreeMap<String, MetricStats>,
}

impl AggregateBucket {
    fn merge_metrics(&mut self, metrics: &Metrics) {
        for (name, value) in metrics {
            self.metrics
                .entry(name.clone())
                .and_modify(|stats| stats.add(*value))
                .or_insert_with(|| MetricStats::new(*value));
        }
    }

    fn merge_bucket(&mut self, other: &AggregateBucket) {
        for (name, stats) in &other.metrics {
            self.metrics
                .entry(name.clone())
                .and_modify(|existing| existing.merge(stats))
                .or_insert(*stats);
        }
    }
}

#[derive(Debug, Default)]
struct KindBuckets {
    index: FnvHashMap<SignatureKey, usize>,
    buckets: Vec<AggregateBucket>,
}

impl KindBuckets {
    fn insert(
        &mut self,
        bucket: AggregateBucket,
        max_buckets: usize,
    ) -> Result<(), errors::Insert> {
        if let Some(&slot) = self.index.get(&bucket.key) {
            self.buckets[slot].merge_bucket(&bucket);
            return Ok(());
        }
        if self.buckets.len() >= max_buckets {
            return Err(errors::Insert::Overflow(
                max_buckets,
                bucket.kind.to_string(),
            ));
        }
        self.index.insert(bucket.key, self.buckets.len());
        self.buckets.push(bucket);
        Ok(())
    }

    /// Like [`KindBuckets::insert`], but a restored bucket predates any bucket
    /// created since the drain, so its params stay representative.
    fn restore(
        &mut self,
        bucket: AggregateBucket,
        max_buckets: usize,
    ) -> Result<(), errors::Insert> {
        if let Some(&slot) = self.index.get(&bucket.key) {
            let newer = std::mem::replace(&mut self.buckets[slot], bucket);
            self.buckets[slot].merge_bucket(&newer);
            return Ok(());
        }
        self.insert(bucket, max_buckets)
    }
}

/// Buckets grouped by event kind. One bucket exists per signature per epoch;
/// [`AggregationStore::take`] ends the epoch for the kinds it drains.
#[derive(Debug)]
pub struct AggregationStore {
    kinds: FnvHashMap<Ustr, KindBuckets>,
    max_buckets: usize,
}

impl Default for AggregationStore {
    fn default() -> Self {
        Self::new(constants::MAX_BUCKETS)
    }
}

impl AggregationStore {
    #[must_use]
    pub fn new(max_buckets: usize) -> Self {
        Self {
            kinds: FnvHashMap::default(),
            max_buckets,
        }
    }

    /// Creates the bucket for `signature` from `params`/`metrics`, or merges
    /// `metrics` into the existing one.
    pub fn store(
        &mut self,
        kind: &str,
        signature: &str,
        params: Attributes,
        metrics: &Metrics,
    ) -> Result<SignatureKey, errors::Insert> {
        let kind = Ustr::from(kind);
        let key = SignatureKey::of(signature);
        let max_buckets = self.max_buckets;
        let entry = self.kinds.entry(kind).or_default();

        if let Some(&slot) = entry.index.get(&key) {
            entry.buckets[slot].merge_metrics(metrics);
            return Ok(key);
        }

        let mut bucket = AggregateBucket {
            kind,
            key,
            signature: signature.to_string(),
            params,
            metrics: BTreeMap::new(),
        };
        bucket.merge_metrics(metrics);
        entry.insert(bucket, max_buckets).inspect_err(|e| {
            warn!("Dropping {kind} observation: {e}");
        })?;
        Ok(key)
    }

    /// Drains every bucket of the requested kinds, in the order of `kinds`
    /// and then bucket creation order.
    pub fn take(&mut self, kinds: &[&str]) -> Vec<AggregateBucket> {
        let mut drained = Vec::new();
        for kind in kinds {
            if let Some(entry) = self.kinds.remove(&Ustr::from(*kind)) {
                drained.extend(entry.buckets);
            }
        }
        drained
    }

    /// Merges previously drained buckets back into the store.
    pub fn restore(&mut self, buckets: Vec<AggregateBucket>) {
        let max_buckets = self.max_buckets;
        let mut dropped = 0usize;
        for bucket in buckets {
            let entry = self.kinds.entry(bucket.kind).or_default();
            if entry.restore(bucket, max_buckets).is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!("Dropped {dropped} aggregation buckets while restoring a failed harvest");
        }
    }

    #[must_use]
    pub fn len(&self, kind: &str) -> usize {
        self.kinds
            .get(&Ustr::from(kind))
            .map_or(0, |entry| entry.buckets.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.values().all(|entry| entry.buckets.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tracing_test::traced_test;

    fn metrics(pairs: &[(&str, f64)]) -> Metrics {
        pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    #[test]
    fn test_same_signature_merges() {
        let mut store = AggregationStore::default();
        let first = store
            .store("xhr", "[200,\"a.com\",\"/x\"]", Attributes::new(), &metrics(&[("time", 10.0)]))
            .unwrap();
        let second = store
            .store("xhr", "[200,\"a.com\",\"/x\"]", Attributes::new(), &metrics(&[("time", 30.0)]))
            .unwrap();
        assert_eq!(first, second);

        let buckets = store.take(&["xhr"]);
        assert_eq!(buckets.len(), 1);
        let time = buckets[0].metrics["time"];
        assert_eq!(time.count, 2);
        assert_eq!(time.total, 40.0);
        assert_eq!(time.min, 10.0);
        assert_eq!(time.max, 30.0);
        assert_eq!(time.sum_of_squares, 1000.0);
    }

    #[test]
    fn test_first_params_are_representative() {
        let mut store = AggregationStore::default();
        let first: Attributes = [("method", "GET")].into_iter().collect();
        let second: Attributes = [("method", "POST")].into_iter().collect();
        store.store("xhr", "sig", first.clone(), &Metrics::new()).unwrap();
        store.store("xhr", "sig", second, &Metrics::new()).unwrap();
        assert_eq!(store.take(&["xhr"])[0].params, first);
    }

    #[test]
    fn test_take_drains_only_requested_kinds() {
        let mut store = AggregationStore::default();
        store.store("xhr", "a", Attributes::new(), &Metrics::new()).unwrap();
        store.store("res", "b", Attributes::new(), &Metrics::new()).unwrap();

        assert_eq!(store.take(&["xhr"]).len(), 1);
        assert!(store.take(&["xhr"]).is_empty());
        assert_eq!(store.len("res"), 1);
    }

    #[test]
    #[traced_test]
    fn test_overflow_rejects_new_signatures_only() {
        let mut store = AggregationStore::new(1);
        store.store("xhr", "a", Attributes::new(), &metrics(&[("time", 1.0)])).unwrap();
        assert_eq!(
            store.store("xhr", "b", Attributes::new(), &Metrics::new()),
            Err(errors::Insert::Overflow(1, "xhr".to_string()))
        );
        assert!(store.store("xhr", "a", Attributes::new(), &metrics(&[("time", 2.0)])).is_ok());
        assert_eq!(store.take(&["xhr"])[0].metrics["time"].count, 2);
        assert!(logs_contain("Dropping xhr observation"));
    }

    #[test]
    fn test_restore_merges_with_newer_observations() {
        let mut store = AggregationStore::default();
        store.store("xhr", "a", Attributes::new(), &metrics(&[("time", 5.0)])).unwrap();
        let drained = store.take(&["xhr"]);

        store.store("xhr", "a", Attributes::new(), &metrics(&[("time", 7.0)])).unwrap();
        store.restore(drained);

        let buckets = store.take(&["xhr"]);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].metrics["time"].count, 2);
        assert_eq!(buckets[0].metrics["time"].min, 5.0);
    }

    #[test]
    fn test_restore_keeps_params_of_older_bucket() {
        let mut store = AggregationStore::default();
        let older: Attributes = [("method", "GET")].into_iter().collect();
        let newer: Attributes = [("method", "POST")].into_iter().collect();
        store.store("xhr", "sig", older.clone(), &metrics(&[("time", 1.0)])).unwrap();
        let drained = store.take(&["xhr"]);

        store.store("xhr", "sig", newer, &metrics(&[("time", 2.0)])).unwrap();
        store.restore(drained);

        let buckets = store.take(&["xhr"]);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].params, older);
        assert_eq!(buckets[0].metrics["time"].count, 2);
        assert_eq!(buckets[0].metrics["time"].max, 2.0);
    }

    proptest! {
        #[test]
        fn prop_merge_is_order_independent(values in proptest::collection::vec(-1000i32..1000, 1..20)) {
            let mut forward = AggregationStore::default();
            let mut backward = AggregationStore::default();
            for v in &values {
                forward.store("xhr", "sig", Attributes::new(), &metrics(&[("m", f64::from(*v))])).unwrap();
            }
            for v in values.iter().rev() {
                backward.store("xhr", "sig", Attributes::new(), &metrics(&[("m", f64::from(*v))])).unwrap();
            }
            let f = forward.take(&["xhr"])[0].metrics["m"];
            let b = backward.take(&["xhr"])[0].metrics["m"];
            prop_assert_eq!(f, b);
        }
    }
}
