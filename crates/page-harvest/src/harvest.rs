// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Harvest contract and the periodic scheduler that drives it.
//!
//! Every channel exposes a [`PayloadSource`]. The scheduler asks it for a
//! payload on each tick, sends whatever comes back, and reports the outcome so
//! the source can commit or requeue the in-flight data. The scheduler never
//! backs off on its own: retry classification belongs to the transport.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use derive_more::Display;
use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::agent_service::AgentHandle;
use crate::transport::{SendOptions, Transport};

/// Named harvest endpoint. Channels never share buffers.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    #[display("events")]
    Events,
    #[display("jserrors")]
    JsErrors,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Events, Channel::JsErrors];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadOptions {
    /// Keep what goes into the payload so it can be restored if the send
    /// must be retried. False for unload-time sends.
    pub retry: bool,
}

/// Request body, one encoded fragment per field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Payload {
    pub body: BTreeMap<String, String>,
}

impl Payload {
    #[must_use]
    pub fn single(field: &str, data: String) -> Self {
        Self {
            body: BTreeMap::from([(field.to_string(), data)]),
        }
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.body.get(name).map(String::as_str)
    }
}

/// Outcome of one send as classified by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarvestResult {
    pub sent: bool,
    pub retry: bool,
}

impl HarvestResult {
    #[must_use]
    pub fn sent() -> Self {
        Self {
            sent: true,
            retry: false,
        }
    }

    /// Transient failure: the in-flight data must be requeued.
    #[must_use]
    pub fn retry() -> Self {
        Self {
            sent: false,
            retry: true,
        }
    }

    /// Permanent failure: the data is dropped.
    #[must_use]
    pub fn dropped() -> Self {
        Self {
            sent: false,
            retry: false,
        }
    }
}

/// Producer side of a channel.
pub trait PayloadSource {
    /// Returns `None` when there is nothing to send; no network call follows.
    fn get_payload(&mut self, options: PayloadOptions) -> Option<Payload>;

    /// Reconciles the in-flight data with the outcome of the last send.
    fn on_finished(&mut self, result: HarvestResult);
}

pub struct HarvestScheduler {
    channel: Channel,
    handle: AgentHandle,
    transport: Arc<dyn Transport>,
    initial_delay: Duration,
    interval: Duration,
    cancel_token: CancellationToken,
}

impl HarvestScheduler {
    #[must_use]
    pub fn new(
        channel: Channel,
        handle: AgentHandle,
        transport: Arc<dyn Transport>,
        initial_delay: Duration,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            channel,
            handle,
            transport,
            initial_delay,
            interval,
            cancel_token,
        }
    }

    /// Sends the first harvest after `initial_delay`, then one every
    /// `interval`, until cancelled. Cancellation also abandons a harvest in
    /// progress; its in-flight data stays with the producer for the final
    /// harvest.
    pub async fn run(self) {
        debug!("Harvest scheduler for {} started", self.channel);

        let mut delay = self.initial_delay;
        loop {
            tokio::select! {
                () = sleep(delay) => {}
                () = self.cancel_token.cancelled() => break,
            }
            tokio::select! {
                _ = self.harvest() => {}
                () = self.cancel_token.cancelled() => {
                    debug!("Abandoning harvest on {} for teardown", self.channel);
                    break;
                }
            }
            delay = self.interval;
        }

        debug!("Harvest scheduler for {} stopped", self.channel);
    }

    /// Runs one harvest cycle. Returns the send outcome, or `None` when
    /// nothing was sent.
    pub async fn harvest(&self) -> Option<HarvestResult> {
        let payload = match self
            .handle
            .get_payload(self.channel, PayloadOptions { retry: true })
            .await
        {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!("Nothing to harvest on {}", self.channel);
                return None;
            }
            Err(e) => {
                error!("Failed to collect {} payload: {e}", self.channel);
                return None;
            }
        };

        let result = self
            .transport
            .send(self.channel, &payload, SendOptions::default())
            .await;
        debug!(
            "Harvest on {} finished: sent={} retry={}",
            self.channel, result.sent, result.retry
        );

        if let Err(e) = self.handle.harvest_finished(self.channel, result) {
            error!("Failed to report {} harvest outcome: {e}", self.channel);
        }
        Some(result)
    }
}
