// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Page timings feature: the producer behind the `events` channel.
//!
//! Collector calls land here, derived samples come from the
//! [`LifecycleTracker`], and both flow into one [`TimingBuffer`] that is
//! serialized with the host's custom attributes on every harvest.

use tracing::debug;

use crate::attributes::Attributes;
use crate::constants::FIRST_INTERACTION_TIMING;
use crate::harvest::{HarvestResult, Payload, PayloadOptions, PayloadSource};
use crate::lifecycle::{LcpEntry, LcpTrigger, LifecycleTracker, VisibilityState};
use crate::serializer::encode_timings;
use crate::timing::{Batch, TimingBuffer};

/// Body field carrying the timing records.
pub const EVENTS_FIELD: &str = "e";

#[derive(Debug)]
pub struct PageTimings {
    tracker: LifecycleTracker,
    buffer: TimingBuffer,
    custom_attributes: Attributes,
    in_flight: Option<Batch>,
}

impl PageTimings {
    #[must_use]
    pub fn new(cls_supported: bool, custom_attributes: Attributes) -> Self {
        Self {
            tracker: LifecycleTracker::new(cls_supported),
            buffer: TimingBuffer::new(),
            custom_attributes,
            in_flight: None,
        }
    }

    #[must_use]
    pub fn tracker(&self) -> &LifecycleTracker {
        &self.tracker
    }

    #[must_use]
    pub fn buffer(&self) -> &TimingBuffer {
        &self.buffer
    }

    /// Appends a collector timing with the current CLS. Returns true when the
    /// timing is the first interaction, after which LCP must be finalized
    /// once the settle window has passed.
    pub fn record_timing(&mut self, name: &str, value: Option<f64>, attrs: Attributes) -> bool {
        let first_interaction = name == FIRST_INTERACTION_TIMING;
        let cls = self.tracker.cls_snapshot();
        self.buffer.add_timing(name, value, attrs, cls);
        first_interaction
    }

    pub fn record_layout_shift(&mut self, value: f64) {
        self.tracker.observe_layout_shift(value);
    }

    pub fn record_lcp_candidate(&mut self, entry: LcpEntry) {
        self.tracker.observe_lcp_candidate(entry);
    }

    pub fn record_page_hidden(&mut self, timestamp: f64) {
        if let Some(sample) = self.tracker.finalize_page_hide(timestamp) {
            self.buffer.push(sample);
        }
    }

    pub fn record_visibility_change(&mut self, state: VisibilityState, timestamp: f64) {
        if state == VisibilityState::Hidden {
            self.record_page_hidden(timestamp);
        }
    }

    pub fn finalize_lcp(&mut self, trigger: LcpTrigger) {
        if let Some(sample) = self.tracker.finalize_lcp(trigger) {
            self.buffer.push(sample);
        }
    }

    /// Teardown: settle LCP, record page hide and unload, and serialize
    /// everything without keeping a retry copy. A batch whose periodic send
    /// never reported back goes out again ahead of the new samples.
    pub fn final_harvest(&mut self, now: f64) -> Option<Payload> {
        self.finalize_lcp(LcpTrigger::FinalHarvest);
        for sample in self.tracker.finalize_unload(now) {
            self.buffer.push(sample);
        }
        if let Some(batch) = self.in_flight.take() {
            debug!("Folding {} unacknowledged timings into the final harvest", batch.len());
            self.buffer.complete_drain(batch, HarvestResult::retry());
        }
        self.get_payload(PayloadOptions { retry: false })
    }
}

impl PayloadSource for PageTimings {
    fn get_payload(&mut self, options: PayloadOptions) -> Option<Payload> {
        let batch = self.buffer.begin_drain(options)?;
        let body = encode_timings(batch.samples(), &self.custom_attributes);
        debug!("Harvesting {} timings (retry={})", batch.len(), options.retry);

        if batch.is_retained() {
            match self.in_flight.as_mut() {
                Some(outstanding) => outstanding.absorb(batch),
                None => self.in_flight = Some(batch),
            }
        }
        Some(Payload::single(EVENTS_FIELD, body))
    }

    fn on_finished(&mut self, result: HarvestResult) {
        if let Some(batch) = self.in_flight.take() {
            if result.retry {
                debug!("Requeueing {} timings for retry", batch.len());
            }
            self.buffer.complete_drain(batch, result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttrValue;
    use crate::decoder::decode_timings;

    fn decode(payload: &Payload) -> Vec<crate::decoder::DecodedTiming> {
        decode_timings(payload.field(EVENTS_FIELD).expect("e field")).expect("decodes")
    }

    #[test]
    fn test_empty_payload_is_none() {
        let mut timings = PageTimings::new(true, Attributes::new());
        assert!(timings.get_payload(PayloadOptions { retry: true }).is_none());
    }

    #[test]
    fn test_fi_then_lcp_without_cls_support() {
        let mut timings = PageTimings::new(false, Attributes::new());
        assert!(timings.record_timing("fi", Some(120.0), Attributes::new()));
        timings.record_lcp_candidate(LcpEntry {
            size: 500.0,
            id: "img1".to_string(),
            start_time: 900.0,
        });
        timings.finalize_lcp(LcpTrigger::FirstInteraction);

        let payload = timings
            .get_payload(PayloadOptions { retry: true })
            .expect("payload");
        let records = decode(&payload);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "fi");
        assert_eq!(records[0].value, Some(120.0));
        assert!(records[0].attrs.is_empty());

        let expected: Attributes = [
            ("size", AttrValue::Num(500.0)),
            ("eid", AttrValue::from("img1")),
        ]
        .into_iter()
        .collect();
        assert_eq!(records[1].name, "lcp");
        assert_eq!(records[1].attrs, expected);
    }

    #[test]
    fn test_collector_timings_carry_cls_when_supported() {
        let mut timings = PageTimings::new(true, Attributes::new());
        timings.record_layout_shift(0.5);
        assert!(!timings.record_timing("load", Some(300.0), Attributes::new()));

        let records = decode(&timings.get_payload(PayloadOptions { retry: false }).expect("payload"));
        assert_eq!(records[0].attrs.get("cls"), Some(&AttrValue::Num(0.5)));
    }

    #[test]
    fn test_custom_attributes_do_not_override_reserved() {
        let global: Attributes = [
            ("cls", AttrValue::Num(9.9)),
            ("plan", AttrValue::from("gold")),
        ]
        .into_iter()
        .collect();
        let mut timings = PageTimings::new(false, global);
        let local: Attributes = [("cls", 0.2)].into_iter().collect();
        timings.record_timing("custom", Some(1.0), local);

        let records = decode(&timings.get_payload(PayloadOptions { retry: true }).expect("payload"));
        assert_eq!(records[0].attrs.get("cls"), Some(&AttrValue::Num(0.2)));
        assert_eq!(records[0].attrs.get("plan"), Some(&AttrValue::from("gold")));
    }

    #[test]
    fn test_page_hidden_recorded_once() {
        let mut timings = PageTimings::new(false, Attributes::new());
        timings.record_visibility_change(VisibilityState::Visible, 5.0);
        timings.record_visibility_change(VisibilityState::Hidden, 10.0);
        timings.record_page_hidden(20.0);
        assert_eq!(timings.buffer().len(), 1);
        assert!(timings.tracker().is_page_hide_finalized());
    }

    #[test]
    fn test_retry_restores_in_flight_samples() {
        let mut timings = PageTimings::new(false, Attributes::new());
        timings.record_timing("a", Some(1.0), Attributes::new());
        timings.get_payload(PayloadOptions { retry: true }).expect("payload");
        timings.record_timing("b", Some(2.0), Attributes::new());
        timings.on_finished(HarvestResult::retry());

        let records = decode(&timings.get_payload(PayloadOptions { retry: true }).expect("payload"));
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        timings.on_finished(HarvestResult::sent());
        assert!(timings.get_payload(PayloadOptions { retry: true }).is_none());
    }

    #[test]
    fn test_permanent_failure_drops_batch() {
        let mut timings = PageTimings::new(false, Attributes::new());
        timings.record_timing("a", Some(1.0), Attributes::new());
        timings.get_payload(PayloadOptions { retry: true }).expect("payload");
        timings.on_finished(HarvestResult::dropped());
        assert!(timings.get_payload(PayloadOptions { retry: true }).is_none());
    }

    #[test]
    fn test_final_harvest_settles_everything() {
        let mut timings = PageTimings::new(false, Attributes::new());
        timings.record_lcp_candidate(LcpEntry {
            size: 10.0,
            id: "hero".to_string(),
            start_time: 50.0,
        });

        let records = decode(&timings.final_harvest(1000.0).expect("payload"));
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["lcp", "pageHide", "unload"]);

        // nothing retained for retry
        timings.on_finished(HarvestResult::retry());
        assert!(timings.get_payload(PayloadOptions { retry: true }).is_none());
    }

    #[test]
    fn test_final_harvest_resends_unacknowledged_batch() {
        let mut timings = PageTimings::new(false, Attributes::new());
        timings.record_timing("load", Some(300.0), Attributes::new());
        timings.get_payload(PayloadOptions { retry: true }).expect("payload");
        timings.record_timing("custom", Some(400.0), Attributes::new());

        let records = decode(&timings.final_harvest(1000.0).expect("payload"));
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["load", "custom", "pageHide", "unload"]);

        // a late outcome for the abandoned send finds nothing to requeue
        timings.on_finished(HarvestResult::retry());
        assert!(timings.get_payload(PayloadOptions { retry: true }).is_none());
    }
}
