// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Replays newline-delimited JSON collector events through a page session
//! and runs the final harvest on EOF or Ctrl-C.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use page_harvest::{
    agent::Agent,
    agent_service::AgentHandle,
    attributes::{AttrValue, Attributes},
    config::HarvestConfig,
    errors::HandleError,
    lifecycle::{LcpEntry, VisibilityState},
    transport::HttpTransport,
    xhr::XhrParams,
};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum ReplayEvent {
    Timing {
        name: String,
        value: Option<f64>,
        #[serde(default)]
        attrs: BTreeMap<String, serde_json::Value>,
    },
    LayoutShift {
        value: f64,
    },
    Lcp {
        size: f64,
        id: String,
        start_time: f64,
    },
    PageHidden {
        timestamp: f64,
    },
    Visibility {
        state: String,
        timestamp: f64,
    },
    Xhr {
        method: String,
        status: u16,
        host: String,
        pathname: String,
        cat: Option<String>,
        start: f64,
        #[serde(default)]
        metrics: BTreeMap<String, f64>,
    },
}

fn to_attributes(raw: BTreeMap<String, serde_json::Value>) -> Attributes {
    raw.into_iter()
        .filter_map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => AttrValue::Str(s),
                serde_json::Value::Number(n) => AttrValue::Num(n.as_f64()?),
                serde_json::Value::Bool(b) => AttrValue::Bool(b),
                serde_json::Value::Null => AttrValue::Null,
                other => {
                    warn!("Skipping attribute {key}: unsupported value {other}");
                    return None;
                }
            };
            Some((key, value))
        })
        .collect()
}

fn dispatch(handle: &AgentHandle, event: ReplayEvent) -> Result<(), HandleError> {
    match event {
        ReplayEvent::Timing { name, value, attrs } => {
            handle.record_timing(&name, value, to_attributes(attrs))
        }
        ReplayEvent::LayoutShift { value } => handle.record_layout_shift(value),
        ReplayEvent::Lcp {
            size,
            id,
            start_time,
        } => handle.record_lcp_candidate(LcpEntry {
            size,
            id,
            start_time,
        }),
        ReplayEvent::PageHidden { timestamp } => handle.record_page_hidden(timestamp),
        ReplayEvent::Visibility { state, timestamp } => {
            handle.record_visibility_change(VisibilityState::parse(&state), timestamp)
        }
        ReplayEvent::Xhr {
            method,
            status,
            host,
            pathname,
            cat,
            start,
            metrics,
        } => handle.store_xhr(
            XhrParams {
                method,
                status,
                host,
                pathname,
                cat,
            },
            metrics,
            start,
        ),
    }
}

async fn replay_stdin(handle: AgentHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read stdin: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ReplayEvent>(&line) {
            Ok(event) => {
                if let Err(e) = dispatch(&handle, event) {
                    error!("Failed to record event: {e}");
                    break;
                }
            }
            Err(e) => warn!("Skipping malformed event: {e}"),
        }
    }
}

#[tokio::main]
pub async fn main() {
    let config = match HarvestConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", config.log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let transport = match HttpTransport::new(&config) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!("Failed to build HTTP client: {e}");
            return;
        }
    };

    let Some(agent) = Agent::start(&config, transport) else {
        return;
    };

    tokio::select! {
        () = replay_stdin(agent.handle()) => debug!("Replay input exhausted"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    for (channel, result) in agent.final_harvest().await {
        info!(
            "Final harvest on {channel}: sent={} retry={}",
            result.sent, result.retry
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_events() {
        let event: ReplayEvent =
            serde_json::from_str(r#"{"type":"timing","name":"fi","value":120,"attrs":{"k":"v"}}"#)
                .expect("timing");
        assert!(matches!(event, ReplayEvent::Timing { ref name, value: Some(v), .. } if name == "fi" && v == 120.0));

        let event: ReplayEvent =
            serde_json::from_str(r#"{"type":"lcp","size":500,"id":"img1","startTime":900}"#)
                .expect("lcp");
        assert!(matches!(event, ReplayEvent::Lcp { .. }));

        let event: ReplayEvent = serde_json::from_str(
            r#"{"type":"xhr","method":"GET","status":200,"host":"a.com","pathname":"/x","cat":null,"start":5}"#,
        )
        .expect("xhr");
        assert!(matches!(event, ReplayEvent::Xhr { status: 200, .. }));
    }

    #[test]
    fn test_attributes_skip_nested_values() {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(
            r#"{"plan":"gold","n":3,"ok":true,"none":null,"nested":{"a":1}}"#,
        )
        .expect("attrs");
        let attrs = to_attributes(raw);
        assert_eq!(attrs.len(), 4);
        assert_eq!(attrs.get("plan"), Some(&AttrValue::from("gold")));
        assert!(attrs.get("nested").is_none());
    }
}
