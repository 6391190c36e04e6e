// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conformant decoder for `bel` payloads.
//!
//! The decoder mirrors the encoder's string pool: literals are pushed to the
//! pool in the order they appear, and bare base-36 fields resolve against it.
//! Payloads with any header other than the current version are rejected.

use std::collections::BTreeMap;

use crate::aggregator::MetricStats;
use crate::attributes::{AttrValue, Attributes};
use crate::errors::DecodeError;
use crate::serializer::{
    header, AGGREGATE_TAG, ATTR_FALSE, ATTR_NULL, ATTR_NUMBER, ATTR_STRING, ATTR_TRUE,
    METRIC_TAG, NULL_MARKER, TIMING_TAG,
};

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTiming {
    pub name: String,
    pub value: Option<f64>,
    pub attrs: Attributes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAggregate {
    pub kind: String,
    pub signature: String,
    pub params: Attributes,
    pub metrics: BTreeMap<String, MetricStats>,
}

/// Splits on `delimiter` unless it is escaped with a backslash. Escapes are
/// left in place for [`StringPool::resolve`] to remove.
fn split_unescaped(input: &str, delimiter: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
        } else if c == delimiter {
            parts.push(&input[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&input[start..]);
    parts
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn parse_base36(field: &str) -> Result<i64, DecodeError> {
    i64::from_str_radix(field, 36)
        .map_err(|_| DecodeError::Malformed(format!("invalid base-36 field '{field}'")))
}

#[allow(clippy::cast_precision_loss)]
fn parse_numeric(field: &str) -> Result<f64, DecodeError> {
    if field.is_empty() {
        return Ok(0.0);
    }
    parse_base36(field).map(|n| n as f64)
}

fn parse_count(field: &str) -> Result<usize, DecodeError> {
    if field.is_empty() {
        return Ok(0);
    }
    usize::try_from(parse_base36(field)?)
        .map_err(|_| DecodeError::Malformed(format!("negative count '{field}'")))
}

fn parse_number(field: &str) -> Result<f64, DecodeError> {
    field
        .strip_suffix('.')
        .unwrap_or(field)
        .parse::<f64>()
        .map_err(|_| DecodeError::Malformed(format!("invalid number '{field}'")))
}

#[derive(Default)]
struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    fn resolve(&mut self, field: &str) -> Result<String, DecodeError> {
        if field.is_empty() {
            return Ok(String::new());
        }
        if let Some(literal) = field.strip_prefix('\'') {
            let value = unescape(literal);
            self.strings.push(value.clone());
            return Ok(value);
        }
        let index = parse_count(field)?;
        self.strings
            .get(index)
            .cloned()
            .ok_or(DecodeError::UnknownReference(index))
    }
}

fn strip_header(payload: &str) -> Result<&str, DecodeError> {
    let expected = header();
    if let Some(body) = payload.strip_prefix(expected.as_str()) {
        return Ok(body);
    }
    let found = payload.split(';').next().unwrap_or_default();
    Err(DecodeError::UnsupportedVersion(found.to_string()))
}

fn decode_attribute(token: &str, pool: &mut StringPool) -> Result<(String, AttrValue), DecodeError> {
    let fields = split_unescaped(token, ',');
    let kind: u8 = fields[0]
        .parse()
        .map_err(|_| DecodeError::Malformed(format!("invalid attribute type in '{token}'")))?;
    let key = pool.resolve(fields.get(1).copied().unwrap_or_default())?;
    let raw = fields.get(2).copied().unwrap_or_default();
    let value = match kind {
        ATTR_STRING => AttrValue::Str(pool.resolve(raw)?),
        ATTR_NUMBER => AttrValue::Num(parse_number(raw)?),
        ATTR_TRUE => AttrValue::Bool(true),
        ATTR_FALSE => AttrValue::Bool(false),
        ATTR_NULL => AttrValue::Null,
        other => {
            return Err(DecodeError::Malformed(format!(
                "unknown attribute type {other}"
            )))
        }
    };
    Ok((key, value))
}

fn take_attributes<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    count: usize,
    pool: &mut StringPool,
) -> Result<Attributes, DecodeError> {
    let mut attrs = Attributes::new();
    for _ in 0..count {
        let token = tokens
            .next()
            .ok_or_else(|| DecodeError::Malformed("missing attribute".to_string()))?;
        let (key, value) = decode_attribute(token, pool)?;
        attrs.insert(key, value);
    }
    Ok(attrs)
}

fn record_fields<'a>(token: &'a str, tag: &str) -> Result<Vec<&'a str>, DecodeError> {
    let fields = split_unescaped(token, ',');
    if fields[0] != tag {
        return Err(DecodeError::UnexpectedTag(fields[0].to_string()));
    }
    Ok(fields)
}

/// Decodes a payload produced by [`crate::serializer::encode_timings`].
pub fn decode_timings(payload: &str) -> Result<Vec<DecodedTiming>, DecodeError> {
    let body = strip_header(payload)?;
    let mut timings = Vec::new();
    if body.is_empty() {
        return Ok(timings);
    }

    let mut pool = StringPool::default();
    let mut tokens = split_unescaped(body, ';').into_iter();
    while let Some(token) = tokens.next() {
        let fields = record_fields(token, TIMING_TAG)?;
        if fields.len() != 4 {
            return Err(DecodeError::Malformed(format!(
                "timing record has {} fields",
                fields.len()
            )));
        }
        let name = pool.resolve(fields[1])?;
        let value = if fields[2] == NULL_MARKER {
            None
        } else {
            Some(parse_numeric(fields[2])?)
        };
        let count = parse_count(fields[3])?;
        let attrs = take_attributes(&mut tokens, count, &mut pool)?;
        timings.push(DecodedTiming { name, value, attrs });
    }
    Ok(timings)
}

/// Decodes a payload produced by [`crate::serializer::encode_aggregates`].
pub fn decode_aggregates(payload: &str) -> Result<Vec<DecodedAggregate>, DecodeError> {
    let body = strip_header(payload)?;
    let mut aggregates = Vec::new();
    if body.is_empty() {
        return Ok(aggregates);
    }

    let mut pool = StringPool::default();
    let mut tokens = split_unescaped(body, ';').into_iter();
    while let Some(token) = tokens.next() {
        let fields = record_fields(token, AGGREGATE_TAG)?;
        if fields.len() != 5 {
            return Err(DecodeError::Malformed(format!(
                "aggregate record has {} fields",
                fields.len()
            )));
        }
        let kind = pool.resolve(fields[1])?;
        let signature = pool.resolve(fields[2])?;
        let param_count = parse_count(fields[3])?;
        let metric_count = parse_count(fields[4])?;
        let params = take_attributes(&mut tokens, param_count, &mut pool)?;

        let mut metrics = BTreeMap::new();
        for _ in 0..metric_count {
            let token = tokens
                .next()
                .ok_or_else(|| DecodeError::Malformed("missing metric".to_string()))?;
            let fields = record_fields(token, METRIC_TAG)?;
            if fields.len() != 7 {
                return Err(DecodeError::Malformed(format!(
                    "metric entry has {} fields",
                    fields.len()
                )));
            }
            let name = pool.resolve(fields[1])?;
            let stats = MetricStats {
                count: u64::try_from(parse_count(fields[2])?).unwrap_or(u64::MAX),
                total: parse_number(fields[3])?,
                min: parse_number(fields[4])?,
                max: parse_number(fields[5])?,
                sum_of_squares: parse_number(fields[6])?,
            };
            metrics.insert(name, stats);
        }

        aggregates.push(DecodedAggregate {
            kind,
            signature,
            params,
            metrics,
        });
    }
    Ok(aggregates)
}
