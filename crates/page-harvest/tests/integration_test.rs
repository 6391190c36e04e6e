// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use mockito::{Matcher, Server};
use page_harvest::{
    agent::Agent,
    agent_service::AgentService,
    aggregator::Metrics,
    attributes::Attributes,
    config::HarvestConfig,
    harvest::{Channel, HarvestResult, HarvestScheduler},
    lifecycle::{LcpEntry, VisibilityState},
    transport::HttpTransport,
    xhr::XhrParams,
};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

fn config_for(url: String) -> HarvestConfig {
    HarvestConfig {
        endpoint: url,
        license_key: Some("mock-license".to_string()),
        cls_supported: false,
        initial_harvest: Duration::from_secs(3600),
        harvest_interval: Duration::from_secs(3600),
        ..HarvestConfig::default()
    }
}

#[tokio::test]
async fn scheduler_requeues_after_server_error() {
    let mut mock_server = Server::new_async().await;
    let failing = mock_server
        .mock("POST", "/events/1/mock-license")
        .with_status(503)
        .create_async()
        .await;

    let config = config_for(mock_server.url());
    let (service, handle) = AgentService::new(&config);
    tokio::spawn(service.run());
    let transport = Arc::new(HttpTransport::new(&config).expect("failed to build client"));
    let scheduler = HarvestScheduler::new(
        Channel::Events,
        handle.clone(),
        transport,
        Duration::ZERO,
        Duration::from_secs(30),
        CancellationToken::new(),
    );

    handle
        .record_timing("fi", Some(120.0), Attributes::new())
        .expect("record");
    assert_eq!(scheduler.harvest().await, Some(HarvestResult::retry()));
    failing.assert_async().await;
    failing.remove_async().await;

    let accepted = mock_server
        .mock("POST", "/events/1/mock-license")
        .match_body(Matcher::Json(serde_json::json!({"e": "bel.6;e,'fi,3c,"})))
        .with_status(200)
        .create_async()
        .await;
    assert_eq!(scheduler.harvest().await, Some(HarvestResult::sent()));
    accepted.assert_async().await;

    assert_eq!(scheduler.harvest().await, None);
    handle.shutdown().expect("shutdown");
}

#[tokio::test]
async fn final_harvest_ships_every_channel() {
    let mut mock_server = Server::new_async().await;
    let events = mock_server
        .mock("POST", "/events/1/mock-license")
        .match_body(Matcher::Regex(
            r#""e":"bel\.6;e,'pageHide,uk,;e,'lcp,rs,2;5,'eid,'img1;6,'size,500\.;e,'unload,"#
                .to_string(),
        ))
        .with_status(200)
        .create_async()
        .await;
    let jserrors = mock_server
        .mock("POST", "/jserrors/1/mock-license")
        .match_body(Matcher::Regex(r#""xhr":"bel\.6;a,'xhr,"#.to_string()))
        .with_status(200)
        .create_async()
        .await;

    let config = HarvestConfig {
        lcp_settle_window: Duration::ZERO,
        ..config_for(mock_server.url())
    };
    let transport = Arc::new(HttpTransport::new(&config).expect("failed to build client"));
    let agent = Agent::start(&config, transport).expect("agent enabled");
    let handle = agent.handle();

    handle
        .record_lcp_candidate(LcpEntry {
            size: 500.0,
            id: "img1".to_string(),
            start_time: 1000.0,
        })
        .expect("record");
    handle
        .store_xhr(
            XhrParams {
                method: "GET".to_string(),
                status: 200,
                host: "api.example.com".to_string(),
                pathname: "/items".to_string(),
                cat: None,
            },
            Metrics::new(),
            25.0,
        )
        .expect("record");
    handle
        .record_visibility_change(VisibilityState::Hidden, 1100.0)
        .expect("record");
    sleep(Duration::from_millis(10)).await;

    let results = agent.final_harvest().await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, result)| result.sent));

    events.assert_async().await;
    jserrors.assert_async().await;
}
