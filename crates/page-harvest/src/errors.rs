// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::harvest::Channel;

/// Error returned by [`crate::aggregator::AggregationStore::store`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Insert {
    #[error("aggregation bucket limit of {0} reached for kind '{1}'")]
    Overflow(usize, String),
}

/// Errors produced while decoding a `bel` payload.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported payload version '{0}'")]
    UnsupportedVersion(String),
    #[error("unexpected record tag '{0}'")]
    UnexpectedTag(String),
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("string pool reference {0} is out of range")]
    UnknownReference(usize),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced by [`crate::agent_service::AgentHandle`] when the service
/// task is no longer reachable.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("agent service is not running")]
    ServiceStopped,
    #[error("agent service dropped the response for channel {0}")]
    ResponseDropped(Channel),
    #[error("agent service dropped the final harvest response")]
    FinalHarvestDropped,
}
