// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single owner of all per-page harvest state.
//!
//! Collectors, timers and schedulers talk to the service through an
//! [`AgentHandle`]. Commands are processed one at a time, so a drain always
//! runs to completion before the next observation is applied.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::aggregator::Metrics;
use crate::attributes::Attributes;
use crate::config::HarvestConfig;
use crate::errors::HandleError;
use crate::harvest::{Channel, HarvestResult, Payload, PayloadOptions, PayloadSource};
use crate::lifecycle::{LcpEntry, LcpTrigger, VisibilityState};
use crate::timings::PageTimings;
use crate::xhr::{XhrAggregate, XhrParams};

#[derive(Debug)]
pub enum AgentCommand {
    RecordTiming {
        name: String,
        value: Option<f64>,
        attrs: Attributes,
    },
    RecordLayoutShift(f64),
    RecordLcpCandidate(LcpEntry),
    RecordPageHidden(f64),
    VisibilityChange {
        state: VisibilityState,
        timestamp: f64,
    },
    StoreXhr {
        params: XhrParams,
        metrics: Metrics,
        start: f64,
    },
    FinalizeLcp(LcpTrigger),
    GetPayload {
        channel: Channel,
        options: PayloadOptions,
        response_tx: oneshot::Sender<Option<Payload>>,
    },
    HarvestFinished {
        channel: Channel,
        result: HarvestResult,
    },
    FinalHarvest(oneshot::Sender<Vec<(Channel, Payload)>>),
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct AgentHandle {
    tx: mpsc::UnboundedSender<AgentCommand>,
}

impl AgentHandle {
    fn send(&self, command: AgentCommand) -> Result<(), HandleError> {
        self.tx
            .send(command)
            .map_err(|_| HandleError::ServiceStopped)
    }

    pub fn record_timing(
        &self,
        name: &str,
        value: Option<f64>,
        attrs: Attributes,
    ) -> Result<(), HandleError> {
        self.send(AgentCommand::RecordTiming {
            name: name.to_string(),
            value,
            attrs,
        })
    }

    pub fn record_layout_shift(&self, value: f64) -> Result<(), HandleError> {
        self.send(AgentCommand::RecordLayoutShift(value))
    }

    pub fn record_lcp_candidate(&self, entry: LcpEntry) -> Result<(), HandleError> {
        self.send(AgentCommand::RecordLcpCandidate(entry))
    }

    pub fn record_page_hidden(&self, timestamp: f64) -> Result<(), HandleError> {
        self.send(AgentCommand::RecordPageHidden(timestamp))
    }

    pub fn record_visibility_change(
        &self,
        state: VisibilityState,
        timestamp: f64,
    ) -> Result<(), HandleError> {
        self.send(AgentCommand::VisibilityChange { state, timestamp })
    }

    pub fn store_xhr(
        &self,
        params: XhrParams,
        metrics: Metrics,
        start: f64,
    ) -> Result<(), HandleError> {
        self.send(AgentCommand::StoreXhr {
            params,
            metrics,
            start,
        })
    }

    pub fn finalize_lcp(&self, trigger: LcpTrigger) -> Result<(), HandleError> {
        self.send(AgentCommand::FinalizeLcp(trigger))
    }

    pub async fn get_payload(
        &self,
        channel: Channel,
        options: PayloadOptions,
    ) -> Result<Option<Payload>, HandleError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(AgentCommand::GetPayload {
            channel,
            options,
            response_tx,
        })?;
        response_rx
            .await
            .map_err(|_| HandleError::ResponseDropped(channel))
    }

    pub fn harvest_finished(
        &self,
        channel: Channel,
        result: HarvestResult,
    ) -> Result<(), HandleError> {
        self.send(AgentCommand::HarvestFinished { channel, result })
    }

    /// Collects the teardown payload of every channel. Call at most once.
    pub async fn final_harvest(&self) -> Result<Vec<(Channel, Payload)>, HandleError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(AgentCommand::FinalHarvest(response_tx))?;
        response_rx
            .await
            .map_err(|_| HandleError::FinalHarvestDropped)
    }

    pub fn shutdown(&self) -> Result<(), HandleError> {
        self.send(AgentCommand::Shutdown)
    }
}

pub struct AgentService {
    timings: PageTimings,
    xhr: XhrAggregate,
    lcp_settle_window: Duration,
    started: Instant,
    rx: mpsc::UnboundedReceiver<AgentCommand>,
    weak_tx: mpsc::WeakUnboundedSender<AgentCommand>,
}

impl AgentService {
    #[must_use]
    pub fn new(config: &HarvestConfig) -> (Self, AgentHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            timings: PageTimings::new(config.cls_supported, config.custom_attributes.clone()),
            xhr: XhrAggregate::new(config.max_xhr_buckets),
            lcp_settle_window: config.lcp_settle_window,
            started: Instant::now(),
            rx,
            weak_tx: tx.downgrade(),
        };
        (service, AgentHandle { tx })
    }

    /// Milliseconds since the page session started.
    fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    fn source_mut(&mut self, channel: Channel) -> &mut dyn PayloadSource {
        match channel {
            Channel::Events => &mut self.timings,
            Channel::JsErrors => &mut self.xhr,
        }
    }

    /// Gives the environment one more chance to report the real LCP element
    /// before the first interaction finalizes it.
    fn schedule_settled_lcp(&self) {
        let weak_tx = self.weak_tx.clone();
        let window = self.lcp_settle_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(tx) = weak_tx.upgrade() {
                let _ = tx.send(AgentCommand::FinalizeLcp(LcpTrigger::FirstInteraction));
            }
        });
    }

    pub async fn run(mut self) {
        debug!("Agent service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                AgentCommand::RecordTiming { name, value, attrs } => {
                    if self.timings.record_timing(&name, value, attrs) {
                        self.schedule_settled_lcp();
                    }
                }

                AgentCommand::RecordLayoutShift(value) => {
                    self.timings.record_layout_shift(value);
                }

                AgentCommand::RecordLcpCandidate(entry) => {
                    self.timings.record_lcp_candidate(entry);
                }

                AgentCommand::RecordPageHidden(timestamp) => {
                    self.timings.record_page_hidden(timestamp);
                }

                AgentCommand::VisibilityChange { state, timestamp } => {
                    debug!("Visibility changed to {state}");
                    self.timings.record_visibility_change(state, timestamp);
                }

                AgentCommand::StoreXhr {
                    params,
                    metrics,
                    start,
                } => {
                    // overflow is already logged by the store
                    let _ = self.xhr.store_xhr(&params, metrics, start);
                }

                AgentCommand::FinalizeLcp(trigger) => {
                    self.timings.finalize_lcp(trigger);
                }

                AgentCommand::GetPayload {
                    channel,
                    options,
                    response_tx,
                } => {
                    let payload = self.source_mut(channel).get_payload(options);
                    if response_tx.send(payload).is_err() {
                        error!("Failed to send {channel} payload - receiver dropped");
                    }
                }

                AgentCommand::HarvestFinished { channel, result } => {
                    self.source_mut(channel).on_finished(result);
                }

                AgentCommand::FinalHarvest(response_tx) => {
                    let now = self.now();
                    let mut payloads = Vec::new();
                    if let Some(payload) = self.timings.final_harvest(now) {
                        payloads.push((Channel::Events, payload));
                    }
                    if let Some(payload) = self.xhr.final_harvest() {
                        payloads.push((Channel::JsErrors, payload));
                    }
                    if response_tx.send(payloads).is_err() {
                        warn!("Final harvest receiver dropped, payloads discarded");
                    }
                }

                AgentCommand::Shutdown => {
                    debug!("Agent service shutting down");
                    break;
                }
            }
        }

        debug!("Agent service stopped");
    }
}
