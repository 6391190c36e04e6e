// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Revision of the `bel` wire protocol written by the serializer.
pub const PROTOCOL_VERSION: u32 = 6;

/// Maximum number of attributes encoded for a single record.
pub const MAX_ATTRIBUTES: usize = 64;

/// Attribute keys whose meaning is owned by the sample, never by global
/// custom attributes.
pub const RESERVED_KEYS: [&str; 5] = ["size", "eid", "cls", "type", "fid"];

/// Default maximum number of aggregation buckets per kind in one epoch.
pub const MAX_BUCKETS: usize = 1_000;

pub const LCP_TIMING: &str = "lcp";
pub const PAGE_HIDE_TIMING: &str = "pageHide";
pub const UNLOAD_TIMING: &str = "unload";
/// Timing recorded by the first-interaction collector.
pub const FIRST_INTERACTION_TIMING: &str = "fi";

pub const CLS_ATTRIBUTE: &str = "cls";

pub const XHR_KIND: &str = "xhr";
