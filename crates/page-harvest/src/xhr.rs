// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request aggregation feature: the producer behind the `jserrors` channel.

use tracing::debug;

use crate::aggregator::{AggregateBucket, AggregationStore, Metrics};
use crate::attributes::Attributes;
use crate::constants::XHR_KIND;
use crate::errors;
use crate::harvest::{HarvestResult, Payload, PayloadOptions, PayloadSource};
use crate::serializer::encode_aggregates;

/// Body field carrying the aggregated request records.
pub const XHR_FIELD: &str = "xhr";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XhrParams {
    pub method: String,
    pub status: u16,
    pub host: String,
    pub pathname: String,
    /// Category tag that replaces host and path in the signature.
    pub cat: Option<String>,
}

impl XhrParams {
    /// Canonical JSON signature: `[status, cat]` when categorized, otherwise
    /// `[status, host, pathname]`.
    #[must_use]
    pub fn signature(&self) -> String {
        let tuple = match &self.cat {
            Some(cat) => serde_json::json!([self.status, cat]),
            None => serde_json::json!([self.status, self.host, self.pathname]),
        };
        tuple.to_string()
    }

    fn to_attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("method", self.method.as_str());
        attrs.insert("status", f64::from(self.status));
        attrs.insert("host", self.host.as_str());
        attrs.insert("pathname", self.pathname.as_str());
        if let Some(cat) = &self.cat {
            attrs.insert("cat", cat.as_str());
        }
        attrs
    }
}

#[derive(Debug, Default)]
pub struct XhrAggregate {
    store: AggregationStore,
    in_flight: Vec<AggregateBucket>,
}

impl XhrAggregate {
    #[must_use]
    pub fn new(max_buckets: usize) -> Self {
        Self {
            store: AggregationStore::new(max_buckets),
            in_flight: Vec::new(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &AggregationStore {
        &self.store
    }

    /// Stores one finished request. `start` is recorded as the `time` metric.
    pub fn store_xhr(
        &mut self,
        params: &XhrParams,
        mut metrics: Metrics,
        start: f64,
    ) -> Result<(), errors::Insert> {
        metrics.insert("time".to_string(), start);
        self.store
            .store(XHR_KIND, &params.signature(), params.to_attributes(), &metrics)
            .map(|_| ())
    }

    /// Teardown payload. Buckets of a periodic send that never reported back
    /// are merged in first.
    pub fn final_harvest(&mut self) -> Option<Payload> {
        let unacknowledged = std::mem::take(&mut self.in_flight);
        if !unacknowledged.is_empty() {
            debug!(
                "Folding {} unacknowledged xhr buckets into the final harvest",
                unacknowledged.len()
            );
            self.store.restore(unacknowledged);
        }
        self.get_payload(PayloadOptions { retry: false })
    }
}

impl PayloadSource for XhrAggregate {
    fn get_payload(&mut self, options: PayloadOptions) -> Option<Payload> {
        let buckets = self.store.take(&[XHR_KIND]);
        if buckets.is_empty() {
            return None;
        }
        debug!("Harvesting {} xhr buckets (retry={})", buckets.len(), options.retry);
        let body = encode_aggregates(&buckets);
        if options.retry {
            self.in_flight.extend(buckets);
        }
        Some(Payload::single(XHR_FIELD, body))
    }

    fn on_finished(&mut self, result: HarvestResult) {
        let buckets = std::mem::take(&mut self.in_flight);
        if result.retry && !buckets.is_empty() {
            debug!("Restoring {} xhr buckets for retry", buckets.len());
            self.store.restore(buckets);
        }
    }
}
