// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Finalized timing samples and the buffer that holds them between harvests.
//!
//! Samples move from `pending` into a [`Batch`] when a harvest begins. The batch
//! is the in-flight set: it is handed back through [`TimingBuffer::complete_drain`]
//! once the send outcome is known, and only a retained batch whose outcome asks
//! for a retry returns its samples to the buffer.

use crate::attributes::Attributes;
use crate::constants::CLS_ATTRIBUTE;
use crate::harvest::{HarvestResult, PayloadOptions};

#[derive(Debug, Clone, PartialEq)]
pub struct TimingSample {
    name: String,
    value: Option<f64>,
    attrs: Attributes,
}

impl TimingSample {
    #[must_use]
    pub fn new(name: impl Into<String>, value: Option<f64>, attrs: Attributes) -> Self {
        Self {
            name: name.into(),
            value,
            attrs,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` is an explicit null on the wire, distinct from zero.
    #[must_use]
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    #[must_use]
    pub fn attrs(&self) -> &Attributes {
        &self.attrs
    }
}

/// Samples taken out of the buffer for one harvest.
#[derive(Debug, Default)]
pub struct Batch {
    samples: Vec<TimingSample>,
    retained: bool,
}

impl Batch {
    #[must_use]
    pub fn samples(&self) -> &[TimingSample] {
        &self.samples
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Whether the samples are kept for a possible retry.
    #[must_use]
    pub fn is_retained(&self) -> bool {
        self.retained
    }

    /// Appends the samples of a newer batch, keeping a single in-flight set.
    pub fn absorb(&mut self, newer: Batch) {
        self.samples.extend(newer.samples);
        self.retained |= newer.retained;
    }
}

#[derive(Debug, Default)]
pub struct TimingBuffer {
    pending: Vec<TimingSample>,
}

impl TimingBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a sample. `cls` is the cumulative layout shift snapshot to
    /// attach, already `None` when the caller did not ask for it or the
    /// environment does not report layout shifts.
    pub fn add_timing(
        &mut self,
        name: impl Into<String>,
        value: Option<f64>,
        mut attrs: Attributes,
        cls: Option<f64>,
    ) {
        if let Some(cls) = cls {
            attrs.insert(CLS_ATTRIBUTE, cls);
        }
        self.push(TimingSample::new(name, value, attrs));
    }

    pub fn push(&mut self, sample: TimingSample) {
        self.pending.push(sample);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[must_use]
    pub fn pending(&self) -> &[TimingSample] {
        &self.pending
    }

    /// Moves every pending sample into a batch. Returns `None` when there is
    /// nothing to send.
    pub fn begin_drain(&mut self, options: PayloadOptions) -> Option<Batch> {
        if self.pending.is_empty() {
            return None;
        }
        Some(Batch {
            samples: std::mem::take(&mut self.pending),
            retained: options.retry,
        })
    }

    /// Reconciles a batch with the outcome of its send. A retained batch that
    /// must be retried goes back in front of anything recorded since.
    pub fn complete_drain(&mut self, batch: Batch, result: HarvestResult) {
        if !(batch.retained && result.retry) {
            return;
        }
        let mut requeued = batch.samples;
        requeued.append(&mut self.pending);
        self.pending = requeued;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttrValue;
    use proptest::prelude::*;

    fn sample(name: &str) -> TimingSample {
        TimingSample::new(name, Some(1.0), Attributes::new())
    }

    fn names(samples: &[TimingSample]) -> Vec<&str> {
        samples.iter().map(TimingSample::name).collect()
    }

    #[test]
    fn test_empty_buffer_drains_nothing() {
        let mut buffer = TimingBuffer::new();
        assert!(buffer.begin_drain(PayloadOptions { retry: true }).is_none());
    }

    #[test]
    fn test_add_timing_injects_cls() {
        let mut buffer = TimingBuffer::new();
        buffer.add_timing("fi", Some(120.0), Attributes::new(), Some(0.25));
        buffer.add_timing("fp", Some(80.0), Attributes::new(), None);

        let pending = buffer.pending();
        assert_eq!(pending[0].attrs().get("cls"), Some(&AttrValue::Num(0.25)));
        assert!(pending[1].attrs().get("cls").is_none());
    }

    #[test]
    fn test_retry_requeues_ahead_of_new_samples() {
        let mut buffer = TimingBuffer::new();
        buffer.push(sample("a"));
        buffer.push(sample("b"));

        let batch = buffer
            .begin_drain(PayloadOptions { retry: true })
            .expect("batch");
        assert!(buffer.is_empty());

        buffer.push(sample("c"));
        buffer.complete_drain(batch, HarvestResult::retry());

        assert_eq!(names(buffer.pending()), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_success_discards_batch() {
        let mut buffer = TimingBuffer::new();
        buffer.push(sample("a"));
        let batch = buffer
            .begin_drain(PayloadOptions { retry: true })
            .expect("batch");
        buffer.complete_drain(batch, HarvestResult::sent());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_unretained_batch_is_never_requeued() {
        let mut buffer = TimingBuffer::new();
        buffer.push(sample("a"));
        let batch = buffer
            .begin_drain(PayloadOptions { retry: false })
            .expect("batch");
        assert!(!batch.is_retained());
        buffer.complete_drain(batch, HarvestResult::retry());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_absorb_keeps_order() {
        let mut buffer = TimingBuffer::new();
        buffer.push(sample("a"));
        let mut first = buffer
            .begin_drain(PayloadOptions { retry: true })
            .expect("batch");
        buffer.push(sample("b"));
        let second = buffer
            .begin_drain(PayloadOptions { retry: true })
            .expect("batch");
        first.absorb(second);
        assert_eq!(names(first.samples()), vec!["a", "b"]);
    }

    proptest! {
        // N consecutive transient failures followed by reconciliation keep
        // every sample produced across the N+1 cycles exactly once, in order.
        #[test]
        fn prop_retry_neither_loses_nor_duplicates(per_cycle in proptest::collection::vec(0usize..5, 1..8)) {
            let mut buffer = TimingBuffer::new();
            let mut produced = Vec::new();
            let mut next = 0usize;

            for count in &per_cycle {
                for _ in 0..*count {
                    let name = next.to_string();
                    produced.push(name.clone());
                    buffer.push(sample(&name));
                    next += 1;
                }
                if let Some(batch) = buffer.begin_drain(PayloadOptions { retry: true }) {
                    buffer.complete_drain(batch, HarvestResult::retry());
                }
            }

            prop_assert_eq!(buffer.len(), produced.len());
            let pending: Vec<String> = buffer.pending().iter().map(|s| s.name().to_string()).collect();
            prop_assert_eq!(pending, produced);
        }
    }
}
