// Copyright (c) 2025, The AMQP Transport Authors
// MIT License
// All rights reserved.

//! # Publisher Facade
//!
//! The caller-facing sending surface. Resolves each message's address
//! through the configured routing topology, injects the trace context into
//! its headers, and hands it to the dispatcher with the configured confirm
//! mode. `send` targets the endpoint owning the message type; `publish`
//! fans out to every subscriber.

use crate::{
    config::TransportOptions,
    connection::ConnectionManager,
    dispatcher::{Dispatcher, Receipt},
    errors::TransportError,
    message::OutgoingMessage,
    otel,
    topology::{RoutingAddress, RoutingTopology},
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::sync::Arc;

/// Sends and publishes application messages through the transport.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Sends a command to the endpoint owning the message type.
    async fn send(&self, ctx: &Context, message: OutgoingMessage)
        -> Result<Receipt, TransportError>;

    /// Publishes an event to every endpoint subscribed to the message type.
    async fn publish(
        &self,
        ctx: &Context,
        message: OutgoingMessage,
    ) -> Result<Receipt, TransportError>;
}

/// Publisher over a broker connection and a fixed routing topology.
pub struct AmqpPublisher {
    topology: Arc<dyn RoutingTopology>,
    dispatcher: Dispatcher,
    require_confirm: bool,
}

impl AmqpPublisher {
    /// Creates a publisher from validated options.
    ///
    /// Fails with a configuration conflict when no topology factory was
    /// configured; addressing is meaningless without one.
    pub fn new(
        manager: Arc<ConnectionManager>,
        options: &TransportOptions,
    ) -> Result<Arc<AmqpPublisher>, TransportError> {
        let topology = options.build_topology().ok_or_else(|| {
            TransportError::ConfigurationConflict("no topology factory configured".to_owned())
        })?;

        Ok(Arc::new(AmqpPublisher {
            topology,
            dispatcher: Dispatcher::new(manager, options),
            require_confirm: options.use_publisher_confirms,
        }))
    }

    async fn dispatch(
        &self,
        ctx: &Context,
        mut message: OutgoingMessage,
        address: RoutingAddress,
    ) -> Result<Receipt, TransportError> {
        otel::inject_context(ctx, &mut message.headers);
        self.dispatcher
            .dispatch(&message, &address, self.require_confirm)
            .await
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn send(
        &self,
        ctx: &Context,
        message: OutgoingMessage,
    ) -> Result<Receipt, TransportError> {
        let address = self.topology.address_for_send(message.message_type());
        self.dispatch(ctx, message, address).await
    }

    async fn publish(
        &self,
        ctx: &Context,
        message: OutgoingMessage,
    ) -> Result<Receipt, TransportError> {
        let address = self.topology.address_for_publish(message.message_type());
        self.dispatch(ctx, message, address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::ConventionalTopology;

    #[test]
    fn a_publisher_requires_a_topology() {
        let options = TransportOptions::default();
        let manager = ConnectionManager::new(&options).expect("valid options");
        assert!(matches!(
            AmqpPublisher::new(manager, &options),
            Err(TransportError::ConfigurationConflict(_))
        ));
    }

    #[test]
    fn a_publisher_builds_from_a_configured_topology() {
        let options = TransportOptions::default().topology(Arc::new(|durable| {
            Arc::new(ConventionalTopology::new("billing", durable))
        }));
        let manager = ConnectionManager::new(&options).expect("valid options");
        assert!(AmqpPublisher::new(manager, &options).is_ok());
    }
}
