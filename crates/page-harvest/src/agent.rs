// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wires the service, the per-channel schedulers and the LCP ceiling timer
//! into one page session.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::agent_service::{AgentHandle, AgentService};
use crate::config::HarvestConfig;
use crate::harvest::{Channel, HarvestResult, HarvestScheduler};
use crate::lifecycle::LcpTrigger;
use crate::transport::{SendOptions, Transport};

pub struct Agent {
    handle: AgentHandle,
    transport: Arc<dyn Transport>,
    cancel_token: CancellationToken,
    schedulers: Vec<JoinHandle<()>>,
    lcp_timer: JoinHandle<()>,
    service: JoinHandle<()>,
}

impl Agent {
    /// Starts a page session. Returns `None` when the pipeline is disabled.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(config: &HarvestConfig, transport: Arc<dyn Transport>) -> Option<Self> {
        if !config.enabled {
            info!("Harvest pipeline disabled");
            return None;
        }

        let (service, handle) = AgentService::new(config);
        let service = tokio::spawn(service.run());
        let cancel_token = CancellationToken::new();

        let schedulers = Channel::ALL
            .into_iter()
            .map(|channel| {
                let scheduler = HarvestScheduler::new(
                    channel,
                    handle.clone(),
                    Arc::clone(&transport),
                    config.initial_harvest,
                    config.harvest_interval,
                    cancel_token.child_token(),
                );
                tokio::spawn(scheduler.run())
            })
            .collect();

        let lcp_timer = {
            let handle = handle.clone();
            let token = cancel_token.child_token();
            let ceiling = config.max_lcp_time;
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(ceiling) => {
                        if let Err(e) = handle.finalize_lcp(LcpTrigger::Ceiling) {
                            error!("Failed to finalize LCP at ceiling: {e}");
                        }
                    }
                    () = token.cancelled() => {}
                }
            })
        };

        debug!(
            "Harvest pipeline started: initial={:?} interval={:?}",
            config.initial_harvest, config.harvest_interval
        );
        Some(Self {
            handle,
            transport,
            cancel_token,
            schedulers,
            lcp_timer,
            service,
        })
    }

    /// Handle for collectors to report observations.
    #[must_use]
    pub fn handle(&self) -> AgentHandle {
        self.handle.clone()
    }

    /// Tears the session down: stops periodic harvests, sends whatever is
    /// left on every channel as a best-effort unload send, and stops the
    /// service. Unload outcomes are not reconciled.
    ///
    /// A periodic send still on the wire is abandoned, not awaited. Its data
    /// is part of the unload payload.
    pub async fn final_harvest(self) -> Vec<(Channel, HarvestResult)> {
        self.cancel_token.cancel();
        // schedulers exit at their next poll; joining them orders any outcome
        // they already reported ahead of the final drain
        for scheduler in self.schedulers {
            if let Err(e) = scheduler.await {
                error!("Harvest scheduler task failed: {e}");
            }
        }
        self.lcp_timer.abort();

        let payloads = match self.handle.final_harvest().await {
            Ok(payloads) => payloads,
            Err(e) => {
                error!("Final harvest failed: {e}");
                Vec::new()
            }
        };

        let mut results = Vec::with_capacity(payloads.len());
        for (channel, payload) in payloads {
            let result = self
                .transport
                .send(channel, &payload, SendOptions { unload: true })
                .await;
            debug!("Unload send on {channel}: sent={}", result.sent);
            results.push((channel, result));
        }

        if let Err(e) = self.handle.shutdown() {
            error!("Failed to stop agent service: {e}");
        }
        if let Err(e) = self.service.await {
            error!("Agent service task failed: {e}");
        }
        results
    }
}
