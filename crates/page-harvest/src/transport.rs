// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Network side of a harvest: ships a payload and classifies the outcome.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, error};

use crate::config::HarvestConfig;
use crate::harvest::{Channel, HarvestResult, Payload};

/// Budget for a send issued while the page is going away.
const UNLOAD_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Best-effort delivery during teardown. The outcome is never reconciled.
    pub unload: bool,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, channel: Channel, payload: &Payload, options: SendOptions)
        -> HarvestResult;
}

/// Maps a collector response status to a harvest outcome.
///
/// 408, 429 and 5xx are transient; any other non-success status means the
/// collector will never accept this payload.
#[must_use]
pub fn classify(status: StatusCode) -> HarvestResult {
    if status.is_success() {
        return HarvestResult::sent();
    }
    let transient = status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error();
    if transient {
        HarvestResult::retry()
    } else {
        HarvestResult::dropped()
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    license_key: String,
}

impl HttpTransport {
    pub fn new(config: &HarvestConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            license_key: config.license_key.clone().unwrap_or_default(),
        })
    }

    fn url(&self, channel: Channel) -> String {
        format!("{}/{channel}/1/{}", self.endpoint, self.license_key)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        channel: Channel,
        payload: &Payload,
        options: SendOptions,
    ) -> HarvestResult {
        let mut request = self.client.post(self.url(channel)).json(&payload.body);
        if options.unload {
            request = request.timeout(UNLOAD_TIMEOUT);
        }

        match request.send().await {
            Ok(resp) => {
                let status = resp.status();
                let result = classify(status);
                if result.sent {
                    debug!("{channel}: collector accepted payload ({status})");
                } else {
                    error!(
                        "{status}: Failed to push {channel} payload: {:?}",
                        resp.text().await.unwrap_or_default()
                    );
                }
                result
            }
            Err(e) => {
                error!("Error shipping {channel} payload: {e}");
                HarvestResult::retry()
            }
        }
    }
}
