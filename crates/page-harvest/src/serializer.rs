// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Encoder for the `bel` wire protocol.
//!
//! A payload is a version header followed by `;`-separated records. Within a
//! record, fields are `,`-separated. Strings go through a per-payload
//! [`StringTable`]: the first occurrence is written in full and later ones as
//! a base-36 pool index, which keeps repeated attribute keys cheap.
//!
//! ```text
//! bel.6;e,'fi,3c,;e,'lcp,1kw,2;6,'eid,'img1;6,'size,dw.
//! ```

use std::fmt::Write;

use hashbrown::HashMap;

use crate::aggregator::{AggregateBucket, MetricStats};
use crate::attributes::{AttrValue, Attributes};
use crate::constants::{MAX_ATTRIBUTES, PROTOCOL_VERSION};
use crate::timing::TimingSample;

pub const TIMING_TAG: &str = "e";
pub const AGGREGATE_TAG: &str = "a";
pub const METRIC_TAG: &str = "m";

pub const NULL_MARKER: &str = "!";

/// Attribute type codes.
pub(crate) const ATTR_STRING: u8 = 5;
pub(crate) const ATTR_NUMBER: u8 = 6;
pub(crate) const ATTR_TRUE: u8 = 7;
pub(crate) const ATTR_FALSE: u8 = 8;
pub(crate) const ATTR_NULL: u8 = 9;

#[must_use]
pub fn header() -> String {
    format!("bel.{PROTOCOL_VERSION};")
}

#[allow(clippy::cast_possible_truncation)]
fn to_base36(n: i64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let negative = n < 0;
    let mut rest = n.unsigned_abs();
    let mut out = Vec::new();
    while rest > 0 {
        out.push(DIGITS[(rest % 36) as usize]);
        rest /= 36;
    }
    if negative {
        out.push(b'-');
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Floors `n` and writes it in base 36. Only an exact zero collapses to the
/// empty string; fractions below one are written as `0`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn numeric(n: f64) -> String {
    if n == 0.0 {
        return String::new();
    }
    to_base36(n.floor() as i64)
}

/// Like [`numeric`] but zero is written as `0`.
#[must_use]
pub fn numeric_required(n: usize) -> String {
    to_base36(i64::try_from(n).unwrap_or(i64::MAX))
}

/// Nullable numeric field: `!` for null so the record arity never changes.
#[must_use]
pub fn nullable(value: Option<f64>) -> String {
    match value {
        Some(v) => numeric(v),
        None => NULL_MARKER.to_string(),
    }
}

/// Attribute-number form: integers carry a trailing `.`, fractions are
/// written in decimal.
#[must_use]
pub fn number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value}.")
    } else {
        format!("{value}")
    }
}

fn quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 1);
    quoted.push('\'');
    for c in s.chars() {
        if matches!(c, ',' | ';' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted
}

/// Per-payload string deduplication context.
#[derive(Debug, Default)]
pub struct StringTable {
    indices: HashMap<String, usize, fnv::FnvBuildHasher>,
}

impl StringTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, s: &str) -> String {
        if s.is_empty() {
            return String::new();
        }
        if let Some(index) = self.indices.get(s) {
            return numeric_required(*index);
        }
        let index = self.indices.len();
        self.indices.insert(s.to_string(), index);
        quote(s)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

fn encode_attribute(key: &str, value: &AttrValue, strings: &mut StringTable) -> String {
    let key = strings.add(key);
    let (kind, serialized) = match value {
        AttrValue::Str(s) => (ATTR_STRING, strings.add(s)),
        AttrValue::Num(n) => (ATTR_NUMBER, number(*n)),
        AttrValue::Bool(true) => (ATTR_TRUE, String::new()),
        AttrValue::Bool(false) => (ATTR_FALSE, String::new()),
        AttrValue::Null => (ATTR_NULL, String::new()),
    };
    if serialized.is_empty() {
        format!("{kind},{key}")
    } else {
        format!("{kind},{key},{serialized}")
    }
}

/// Encodes at most [`MAX_ATTRIBUTES`] attributes.
pub fn encode_attributes(attrs: &Attributes, strings: &mut StringTable) -> Vec<String> {
    attrs
        .iter()
        .take(MAX_ATTRIBUTES)
        .map(|(key, value)| encode_attribute(key, value, strings))
        .collect()
}

/// Serializes timing samples into one `e`-record payload. Each sample's
/// attributes are merged with `global` first; reserved keys keep the
/// sample's own value.
#[must_use]
pub fn encode_timings(samples: &[TimingSample], global: &Attributes) -> String {
    let mut strings = StringTable::new();
    let mut payload = header();

    for (i, timing) in samples.iter().enumerate() {
        let _ = write!(
            payload,
            "{TIMING_TAG},{},{},",
            strings.add(timing.name()),
            nullable(timing.value())
        );

        let mut attrs = timing.attrs().clone();
        attrs.merge_global(global);
        let parts = encode_attributes(&attrs, &mut strings);
        if !parts.is_empty() {
            let _ = write!(payload, "{};{}", numeric_required(parts.len()), parts.join(";"));
        }

        if i + 1 < samples.len() {
            payload.push(';');
        }
    }

    payload
}

fn encode_metric(name: &str, stats: &MetricStats, strings: &mut StringTable) -> String {
    format!(
        "{METRIC_TAG},{},{},{},{},{},{}",
        strings.add(name),
        numeric_required(usize::try_from(stats.count).unwrap_or(usize::MAX)),
        number(stats.total),
        number(stats.min),
        number(stats.max),
        number(stats.sum_of_squares),
    )
}

/// Serializes drained aggregation buckets into one `a`-record payload.
#[must_use]
pub fn encode_aggregates(buckets: &[AggregateBucket]) -> String {
    let mut strings = StringTable::new();
    let mut records = Vec::with_capacity(buckets.len());

    for bucket in buckets {
        let kind = strings.add(bucket.kind.as_str());
        let signature = strings.add(&bucket.signature);
        let params = encode_attributes(&bucket.params, &mut strings);
        let metrics: Vec<String> = bucket
            .metrics
            .iter()
            .map(|(name, stats)| encode_metric(name, stats, &mut strings))
            .collect();

        let mut record = format!(
            "{AGGREGATE_TAG},{kind},{signature},{},{}",
            numeric_required(params.len()),
            numeric_required(metrics.len())
        );
        for part in params.iter().chain(metrics.iter()) {
            record.push(';');
            record.push_str(part);
        }
        records.push(record);
    }

    format!("{}{}", header(), records.join(";"))
}
