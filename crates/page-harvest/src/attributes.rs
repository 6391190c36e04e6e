// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Attribute maps attached to timing samples and aggregation buckets.
//!
//! Values are restricted to a closed set of scalar kinds so the serializer
//! can encode every attribute without inspecting its shape at runtime.

use std::collections::btree_map::{self, BTreeMap};

use crate::constants::RESERVED_KEYS;

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Str(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Num(value)
    }
}

impl From<u64> for AttrValue {
    #[allow(clippy::cast_precision_loss)]
    fn from(value: u64) -> Self {
        AttrValue::Num(value as f64)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

/// Returns true when `key` carries protocol meaning on a sample.
#[must_use]
pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Ordered attribute map. Iteration order is the key order, which keeps the
/// encoded payload stable across runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    values: BTreeMap<String, AttrValue>,
}

impl Attributes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) {
        self.values.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.values.get(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, AttrValue> {
        self.values.iter()
    }

    /// Applies host-wide custom attributes to this sample's attributes.
    ///
    /// Global values win over local non-reserved keys. Reserved keys in
    /// `global` are skipped entirely, so `size`, `eid`, `cls`, `type` and `fid`
    /// always keep the value the sample was created with (or stay absent).
    pub fn merge_global(&mut self, global: &Attributes) {
        for (key, value) in global.iter() {
            if is_reserved(key) {
                continue;
            }
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Parses `key:value` pairs separated by commas or whitespace. Numeric
    /// and boolean values are kept as strings since host tags carry no type.
    #[must_use]
    pub fn from_env_string(env_attrs: &str) -> Self {
        let mut attrs = Self::new();
        let normalized = env_attrs.replace(',', " ");
        for kv in normalized.split_whitespace() {
            if let Some((key, value)) = kv.split_once(':') {
                if !key.is_empty() {
                    attrs.insert(key, value);
                }
            }
        }
        attrs
    }
}

impl<K: Into<String>, V: Into<AttrValue>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attrs = Attributes::new();
        for (key, value) in iter {
            attrs.insert(key, value);
        }
        attrs
    }
}

impl<'a> IntoIterator for &'a Attributes {
    type Item = (&'a String, &'a AttrValue);
    type IntoIter = btree_map::Iter<'a, String, AttrValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}
