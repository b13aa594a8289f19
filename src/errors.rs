// Copyright (c) 2025, The AMQP Transport Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Transport
//!
//! This module provides the error taxonomy for the transport. The
//! `TransportError` enum distinguishes fatal configuration problems from
//! transient link failures, and broker-side rejections from indeterminate
//! outcomes, so callers can apply the right retry semantics to each.

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during transport operations.
///
/// The variants split into three families: configuration problems detected
/// before any broker connection (fatal, never retried), link-level failures
/// handled by the connection manager's recovery, and per-dispatch or
/// per-delivery outcomes reported to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Contradictory or invalid options detected at configuration time
    #[error("conflicting configuration: {0}")]
    ConfigurationConflict(String),

    /// The link to the broker is not currently usable
    #[error("connection to the broker was lost: {0}")]
    ConnectionLost(String),

    /// Recovery did not complete within the grace period; the endpoint must shut down
    #[error("circuit breaker tripped after {0:?} without broker recovery")]
    CircuitTripped(Duration),

    /// The broker explicitly refused a publish
    #[error("broker rejected the publish for message `{0}`")]
    DispatchRejected(String),

    /// A confirm could not be obtained; the message may or may not have been delivered
    #[error("delivery of message `{0}` could not be confirmed")]
    DispatchIndeterminate(String),

    /// Malformed frame or unexpected broker behavior
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare exchange `{0}`")]
    DeclareExchange(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare queue `{0}`")]
    DeclareQueue(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindQueue(String, String),

    /// Error starting a consumer on the given queue
    #[error("failure to start consumer on queue `{0}`")]
    Consumer(String),

    /// Error acknowledging a delivery
    #[error("failure to acknowledge delivery: {0}")]
    Acknowledge(String),

    /// Error publishing an exhausted delivery to the dead letter queue
    #[error("failure to publish to dead letter queue `{0}`")]
    DeadLetter(String),
}

impl TransportError {
    /// Classifies a lapin error.
    ///
    /// Protocol-level errors carry the broker's reply text; everything else
    /// is reported as a lost connection and handled by recovery.
    pub(crate) fn from_broker(err: &lapin::Error) -> TransportError {
        match err {
            lapin::Error::ProtocolError(e) => TransportError::ProtocolViolation(e.to_string()),
            lapin::Error::InvalidConnectionState(state) => {
                TransportError::ConnectionLost(format!("invalid connection state: {state:?}"))
            }
            lapin::Error::InvalidChannelState(state) => {
                TransportError::ConnectionLost(format!("invalid channel state: {state:?}"))
            }
            other => TransportError::ConnectionLost(other.to_string()),
        }
    }
}

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        TransportError::from_broker(&err)
    }
}
