// Copyright (c) 2025, The AMQP Transport Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides the definition types for queues the transport
//! declares and for the bindings that connect them to exchanges. It includes
//! the retry and dead letter companions used by the receive pump when a
//! handler keeps failing, and the per-queue maximum priority argument.

/// Definition of a queue with its declaration parameters.
///
/// Built by the routing topology, consumed by the topology installer. The
/// retry and dead letter companions are named after the main queue with
/// `-retry` and `-dlq` suffixes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) ttl_ms: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_priority: Option<u8>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) retry_name: Option<String>,
    pub(crate) retry_ttl_ms: Option<i32>,
    pub(crate) retries: Option<i32>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection that declares it.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the message time-to-live for the queue, in milliseconds.
    pub fn ttl(mut self, ttl_ms: i32) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Enables message priorities up to the given maximum.
    ///
    /// The caller is responsible for validating the value against the
    /// supported range before building the definition.
    pub fn max_priority(mut self, max: u8) -> Self {
        self.max_priority = Some(max);
        self
    }

    /// Adds a dead letter companion queue named `<name>-dlq`.
    ///
    /// The dead letter queue receives messages whose handling failed after
    /// every configured retry.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Adds a retry companion queue named `<name>-retry`.
    ///
    /// Failed messages park in the retry queue for `ttl_ms` before the
    /// broker dead-letters them back onto the main queue.
    ///
    /// # Parameters
    /// * `ttl_ms` - Time in milliseconds a failed message waits before redelivery
    /// * `retries` - Maximum number of redelivery attempts
    pub fn with_retry(mut self, ttl_ms: i32, retries: i32) -> Self {
        self.retry_name = Some(format!("{}-retry", self.name));
        self.retry_ttl_ms = Some(ttl_ms);
        self.retries = Some(retries);
        self
    }

    /// The name this queue is declared under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new binding for the given queue.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn companions_are_named_after_the_main_queue() {
        let def = QueueDefinition::new("billing")
            .with_dlq()
            .with_retry(10_000, 3);
        assert_eq!(def.dlq_name.as_deref(), Some("billing-dlq"));
        assert_eq!(def.retry_name.as_deref(), Some("billing-retry"));
        assert_eq!(def.retry_ttl_ms, Some(10_000));
        assert_eq!(def.retries, Some(3));
    }

    #[test]
    fn definitions_start_without_companions() {
        let def = QueueDefinition::new("billing");
        assert!(def.dlq_name.is_none());
        assert!(def.retry_name.is_none());
        assert!(def.max_priority.is_none());
    }
}
