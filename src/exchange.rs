// Copyright (c) 2025, The AMQP Transport Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! This module provides the definition type for exchanges the transport
//! declares. Exchanges are the broker-side routing entities messages are
//! published to; the routing topology decides which exchanges exist and the
//! installer declares them from these definitions.

use crate::errors::TransportError;
use lapin::types::{AMQPValue, LongString, ShortString};
use std::collections::BTreeMap;

/// Argument telling the delayed message exchange plugin how to route
pub const AMQP_ARG_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Represents the types of exchanges the transport declares.
///
/// - Direct: routes on an exact routing key match
/// - Fanout: broadcasts to every bound queue
/// - Topic: routes on wildcard pattern matching of routing keys
/// - XMessageDelayed: plugin-provided type that holds messages back for a
///   per-message delay before routing them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    XMessageDelayed,
}

impl TryInto<lapin::ExchangeKind> for ExchangeKind {
    type Error = TransportError;

    fn try_into(self) -> Result<lapin::ExchangeKind, TransportError> {
        match self {
            ExchangeKind::Direct => Ok(lapin::ExchangeKind::Direct),
            ExchangeKind::Fanout => Ok(lapin::ExchangeKind::Fanout),
            ExchangeKind::Topic => Ok(lapin::ExchangeKind::Topic),
            ExchangeKind::XMessageDelayed => {
                Ok(lapin::ExchangeKind::Custom("x-delayed-message".to_owned()))
            }
        }
    }
}

/// Definition of an exchange with its declaration parameters.
///
/// Built by the routing topology, consumed by the topology installer.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// Defaults to a non-durable direct exchange with no extra parameters.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: false,
            auto_delete: false,
            internal: false,
            params: BTreeMap::default(),
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Sets the exchange type to Topic.
    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Turns this definition into a delayed exchange that routes like the
    /// kind it currently has.
    ///
    /// Requires the delayed message exchange plugin on the broker.
    pub fn delayed(mut self) -> Self {
        let routed_as = match self.kind {
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            _ => "direct",
        };
        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            ShortString::from(AMQP_ARG_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from(routed_as)),
        );
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// The name this exchange is declared under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delayed_keeps_the_routing_behavior_of_the_prior_kind() {
        let def = ExchangeDefinition::new("orders.placed").fanout().delayed();
        assert_eq!(def.kind, ExchangeKind::XMessageDelayed);
        let routed_as = def
            .params
            .get(&ShortString::from(AMQP_ARG_DELAYED_EXCHANGE_TYPE))
            .and_then(|v| v.as_long_string().cloned());
        assert_eq!(routed_as, Some(LongString::from("fanout")));
    }

    #[test]
    fn delayed_kind_maps_to_the_plugin_exchange_type() {
        let kind: lapin::ExchangeKind = ExchangeKind::XMessageDelayed
            .try_into()
            .expect("conversion");
        assert_eq!(
            kind,
            lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
        );
    }
}
