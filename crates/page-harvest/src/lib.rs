// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Page telemetry harvest pipeline.
//!
//! Collectors report timings, layout shifts, LCP candidates, visibility
//! changes and finished requests through an [`agent_service::AgentHandle`].
//! Per-channel [`harvest::HarvestScheduler`]s periodically drain the buffers,
//! encode them in the `bel.6` wire format and ship them through a
//! [`transport::Transport`], requeueing in-flight data on transient failures.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod agent_service;
pub mod aggregator;
pub mod attributes;
pub mod config;
pub mod constants;
pub mod decoder;
pub mod errors;
pub mod harvest;
pub mod lifecycle;
pub mod serializer;
pub mod timing;
pub mod timings;
pub mod transport;
pub mod xhr;
