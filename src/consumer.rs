// Copyright (c) 2025, The AMQP Transport Authors
// MIT License
// All rights reserved.

//! # Receive Pump
//!
//! This module pulls deliveries from the endpoint queue under a
//! prefetch-bounded concurrency window and routes them to registered
//! handlers by enclosed message type. A handler's outcome decides the fate
//! of the delivery: success acknowledges it, failure sends it through the
//! retry queue when one is configured, and exhausted retries publish it to
//! the dead letter queue. Acknowledgements always reference the exact
//! delivery they were created for; a failed ack is reported, not retried.

use crate::{
    config::TransportOptions,
    connection::ConnectionManager,
    errors::TransportError,
    message::{
        DeliveryEnvelope, IncomingMessage, MessageIdStrategy, HEADER_ENCLOSED_TYPE,
        OCTET_STREAM_CONTENT_TYPE,
    },
    otel,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions},
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use std::{
    borrow::Cow,
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

/// Header the broker appends each time a message is dead-lettered
pub const AMQP_HEADER_X_DEATH: &str = "x-death";
/// Field of the x-death entry counting the dead-letter passes
pub const AMQP_HEADER_DEATH_COUNT: &str = "count";

/// Processes messages delivered to the endpoint queue.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Handles one delivered message.
    ///
    /// Returning an error routes the delivery through the retry and dead
    /// letter policy of the queue it came from.
    async fn handle(&self, ctx: &Context, message: &IncomingMessage) -> Result<(), TransportError>;
}

/// What the pump does with a delivery after its handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Remove the message from the queue
    Ack,
    /// Reject without requeue; dead-letter arguments decide where it goes
    Nack,
    /// Publish to the dead letter queue, then remove from the main queue
    DeadLetter,
}

/// Prefetch-bounded consumer loop over the endpoint queue.
///
/// The concurrency window is enforced by the broker through `basic.qos`;
/// the pump itself processes deliveries as the stream yields them.
pub struct ReceivePump {
    manager: Arc<ConnectionManager>,
    queue: QueueDefinition,
    prefetch: u16,
    id_strategy: Option<MessageIdStrategy>,
    handlers: HashMap<String, Arc<dyn ConsumerHandler>>,
}

impl ReceivePump {
    /// Creates a pump for the given endpoint queue.
    pub fn new(
        manager: Arc<ConnectionManager>,
        options: &TransportOptions,
        queue: QueueDefinition,
    ) -> ReceivePump {
        ReceivePump {
            manager,
            queue,
            prefetch: options.prefetch_count(),
            id_strategy: options.message_id_strategy.clone(),
            handlers: HashMap::default(),
        }
    }

    /// Registers the handler for a message type.
    ///
    /// Deliveries of types with no registered handler are acknowledged and
    /// dropped with a log line.
    pub fn register(mut self, message_type: &str, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.handlers.insert(message_type.to_owned(), handler);
        self
    }

    /// Consumes the endpoint queue until shutdown is signalled or the
    /// stream ends.
    ///
    /// The pump holds one borrowed channel for its whole run; losing the
    /// stream means the channel died and the caller decides whether to run
    /// the pump again once the link recovers.
    pub async fn run(&self) -> Result<(), TransportError> {
        let channel = self.manager.borrow_channel().await?;

        if let Err(err) = channel
            .raw()
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
        {
            self.manager.release_channel(channel, false).await;
            return Err(err.into());
        }

        let mut consumer = match channel
            .raw()
            .basic_consume(
                self.queue.name(),
                self.queue.name(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = self.queue.name(),
                    "failure to start the consumer"
                );
                self.manager.release_channel(channel, false).await;
                return Err(TransportError::Consumer(self.queue.name().to_owned()));
            }
        };

        debug!(
            queue = self.queue.name(),
            prefetch = self.prefetch,
            "consuming"
        );

        let mut shutdown = self.manager.shutdown_signal();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        warn!(queue = self.queue.name(), "shutdown signalled, stopping the pump");
                        self.manager.release_channel(channel, true).await;
                        return Ok(());
                    }
                }
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => {
                        if let Err(err) = self.process(channel.raw(), delivery).await {
                            error!(error = err.to_string(), "failure to process delivery");
                        }
                    }
                    Some(Err(err)) => {
                        error!(error = err.to_string(), "failure to receive delivery");
                    }
                    None => {
                        self.manager.release_channel(channel, false).await;
                        return Err(TransportError::ConnectionLost(
                            "consumer stream ended".to_owned(),
                        ));
                    }
                }
            }
        }
    }

    async fn process(&self, channel: &Channel, delivery: Delivery) -> Result<(), TransportError> {
        let message = decode_message(
            &delivery.properties,
            &delivery.data,
            delivery.delivery_tag,
            delivery.redelivered,
            self.id_strategy.as_ref(),
        );
        let count = retry_count(&delivery.properties);

        let (ctx, mut span) = otel::consumer_span(
            &delivery.properties,
            &global::tracer("amqp consumer"),
            &message.message_type,
        );

        debug!(
            message_type = message.message_type,
            message_id = message.id,
            "delivery received"
        );

        let disposition = self.handle_message(&ctx, &message, count).await;
        let result = self.settle(channel, &delivery, disposition).await;

        match &result {
            Ok(()) => span.set_status(Status::Ok),
            Err(err) => {
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }

        result
    }

    /// Runs the registered handler and decides the delivery's fate.
    async fn handle_message(
        &self,
        ctx: &Context,
        message: &IncomingMessage,
        death_count: i64,
    ) -> Disposition {
        let Some(handler) = self.handlers.get(&message.message_type) else {
            debug!(
                message_type = message.message_type,
                "removing message from queue, no handler registered for its type"
            );
            return Disposition::Ack;
        };

        match handler.handle(ctx, message).await {
            Ok(()) => Disposition::Ack,
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    message_id = message.id,
                    attempts = death_count,
                    "handler failed"
                );
                failure_disposition(&self.queue, death_count)
            }
        }
    }

    async fn settle(
        &self,
        channel: &Channel,
        delivery: &Delivery,
        disposition: Disposition,
    ) -> Result<(), TransportError> {
        match disposition {
            Disposition::Ack => delivery
                .ack(BasicAckOptions { multiple: false })
                .await
                .map_err(|err| TransportError::Acknowledge(err.to_string())),
            Disposition::Nack => delivery
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: false,
                })
                .await
                .map_err(|err| TransportError::Acknowledge(err.to_string())),
            Disposition::DeadLetter => {
                let dlq = self.queue.dlq_name.clone().unwrap_or_default();
                error!(queue = dlq, "retries exhausted, sending to the dead letter queue");

                if let Err(err) = channel
                    .basic_publish(
                        "",
                        &dlq,
                        BasicPublishOptions::default(),
                        &delivery.data,
                        delivery.properties.clone(),
                    )
                    .await
                {
                    error!(error = err.to_string(), "failure to publish to the dead letter queue");
                    return Err(TransportError::DeadLetter(dlq));
                }

                delivery
                    .ack(BasicAckOptions { multiple: false })
                    .await
                    .map_err(|err| TransportError::Acknowledge(err.to_string()))
            }
        }
    }
}

/// Fate of a delivery whose handler failed.
///
/// While retries remain the message is rejected into the retry queue; once
/// they are exhausted it goes to the dead letter queue. With no retry
/// policy the rejection stands alone and the queue's own dead-letter
/// arguments, if any, decide what happens.
pub(crate) fn failure_disposition(queue: &QueueDefinition, death_count: i64) -> Disposition {
    match (queue.retries, &queue.dlq_name) {
        (Some(retries), _) if death_count < i64::from(retries) => Disposition::Nack,
        (Some(_), Some(_)) => Disposition::DeadLetter,
        _ => Disposition::Nack,
    }
}

/// Number of times the broker has dead-lettered this message, read from the
/// first entry of the `x-death` header.
pub(crate) fn retry_count(properties: &BasicProperties) -> i64 {
    let Some(headers) = properties.headers() else {
        return 0;
    };
    headers
        .inner()
        .get(AMQP_HEADER_X_DEATH)
        .and_then(AMQPValue::as_array)
        .and_then(|deaths| deaths.as_slice().first())
        .and_then(AMQPValue::as_field_table)
        .and_then(|death| death.inner().get(AMQP_HEADER_DEATH_COUNT))
        .and_then(AMQPValue::as_long_long_int)
        .unwrap_or_default()
}

/// Decodes a delivery into the incoming message shape.
///
/// The inverse of the dispatcher's property encoding: native properties
/// become first-class fields, the header table becomes the string map. The
/// message id falls back to the configured strategy and then to a fresh
/// UUID when the broker property is absent.
pub(crate) fn decode_message(
    properties: &BasicProperties,
    data: &[u8],
    delivery_tag: u64,
    redelivered: bool,
    strategy: Option<&MessageIdStrategy>,
) -> IncomingMessage {
    let headers = decode_headers(properties);

    let message_type = properties
        .kind()
        .as_ref()
        .map(|kind| kind.to_string())
        .or_else(|| headers.get(HEADER_ENCLOSED_TYPE).cloned())
        .unwrap_or_default();

    let id = properties
        .message_id()
        .as_ref()
        .map(|id| id.to_string())
        .or_else(|| {
            strategy.map(|derive| {
                derive(&DeliveryEnvelope {
                    properties,
                    delivery_tag,
                    redelivered,
                })
            })
        })
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    IncomingMessage {
        id,
        message_type,
        body: data.to_vec(),
        headers,
        content_type: properties
            .content_type()
            .as_ref()
            .map(|content_type| content_type.to_string())
            .unwrap_or_else(|| OCTET_STREAM_CONTENT_TYPE.to_owned()),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|correlation_id| correlation_id.to_string()),
        reply_to: properties.reply_to().as_ref().map(|reply_to| reply_to.to_string()),
        redelivered,
        delivery_tag,
    }
}

fn decode_headers(properties: &BasicProperties) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::default();
    let Some(table) = properties.headers() else {
        return headers;
    };
    for (key, value) in table.inner() {
        let decoded = match value {
            AMQPValue::LongString(value) => {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            }
            AMQPValue::ShortString(value) => value.as_str().to_owned(),
            _ => continue,
        };
        headers.insert(key.as_str().to_owned(), decoded);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dispatcher::encode_properties,
        message::{DeliveryOptions, OutgoingMessage, HEADER_NON_DURABLE},
    };
    use lapin::types::{FieldArray, LongLongInt, ShortString};

    fn pump() -> ReceivePump {
        let options = TransportOptions::default();
        let manager = ConnectionManager::new(&options).expect("valid options");
        ReceivePump::new(manager, &options, QueueDefinition::new("billing"))
    }

    fn incoming(message_type: &str) -> IncomingMessage {
        decode_message(
            &encode_properties(&OutgoingMessage::new(message_type, b"{}")),
            b"{}",
            1,
            false,
            None,
        )
    }

    fn death_headers(count: i64) -> BasicProperties {
        let mut death = std::collections::BTreeMap::new();
        death.insert(
            ShortString::from(AMQP_HEADER_DEATH_COUNT),
            AMQPValue::LongLongInt(LongLongInt::from(count)),
        );
        let mut headers = std::collections::BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADER_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(
                FieldTable::from(death),
            )])),
        );
        BasicProperties::default().with_headers(FieldTable::from(headers))
    }

    #[test]
    fn retry_count_reads_the_first_death_entry() {
        assert_eq!(retry_count(&death_headers(3)), 3);
        assert_eq!(retry_count(&BasicProperties::default()), 0);
    }

    #[test]
    fn failures_park_in_retry_until_attempts_run_out() {
        let queue = QueueDefinition::new("billing")
            .with_retry(10_000, 3)
            .with_dlq();
        assert_eq!(failure_disposition(&queue, 0), Disposition::Nack);
        assert_eq!(failure_disposition(&queue, 2), Disposition::Nack);
        assert_eq!(failure_disposition(&queue, 3), Disposition::DeadLetter);
    }

    #[test]
    fn failures_without_a_retry_policy_are_rejected() {
        let queue = QueueDefinition::new("billing");
        assert_eq!(failure_disposition(&queue, 0), Disposition::Nack);
        assert_eq!(failure_disposition(&queue, 100), Disposition::Nack);
    }

    #[test]
    fn decoded_messages_round_trip_headers_and_defaults() {
        let outgoing = OutgoingMessage::new("orders::OrderPlaced", b"payload")
            .with_id("msg-1")
            .header("h1", "v1")
            .header("h2", "v2");
        let message = decode_message(&encode_properties(&outgoing), b"payload", 7, true, None);

        assert_eq!(message.id, "msg-1");
        assert_eq!(message.message_type, "orders::OrderPlaced");
        assert_eq!(message.content_type, OCTET_STREAM_CONTENT_TYPE);
        assert_eq!(message.headers.get("h1").map(String::as_str), Some("v1"));
        assert_eq!(message.headers.get("h2").map(String::as_str), Some("v2"));
        assert_eq!(
            message.headers.get(HEADER_NON_DURABLE).map(String::as_str),
            Some("False")
        );
        assert_eq!(message.delivery_tag, 7);
        assert!(message.redelivered);
    }

    #[test]
    fn non_durable_marker_survives_the_round_trip() {
        let outgoing = OutgoingMessage::new("orders::OrderPlaced", b"{}")
            .options(DeliveryOptions::default().non_durable());
        let message = decode_message(&encode_properties(&outgoing), b"{}", 1, false, None);
        assert_eq!(
            message.headers.get(HEADER_NON_DURABLE).map(String::as_str),
            Some("True")
        );
    }

    #[test]
    fn message_id_falls_back_to_the_strategy_then_to_a_fresh_uuid() {
        let strategy: MessageIdStrategy =
            Arc::new(|envelope| format!("tag-{}", envelope.delivery_tag));
        let message =
            decode_message(&BasicProperties::default(), b"{}", 42, false, Some(&strategy));
        assert_eq!(message.id, "tag-42");

        let message = decode_message(&BasicProperties::default(), b"{}", 42, false, None);
        assert!(Uuid::parse_str(&message.id).is_ok());
    }

    #[tokio::test]
    async fn handler_success_acknowledges_the_delivery() {
        let mut handler = MockConsumerHandler::new();
        handler.expect_handle().times(1).returning(|_, _| Ok(()));

        let pump = pump().register("orders::OrderPlaced", Arc::new(handler));
        let disposition = pump
            .handle_message(&Context::new(), &incoming("orders::OrderPlaced"), 0)
            .await;
        assert_eq!(disposition, Disposition::Ack);
    }

    #[tokio::test]
    async fn handler_failure_follows_the_retry_policy() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_handle()
            .returning(|_, _| Err(TransportError::Consumer("billing".to_owned())));

        let options = TransportOptions::default();
        let manager = ConnectionManager::new(&options).expect("valid options");
        let queue = QueueDefinition::new("billing")
            .with_retry(10_000, 3)
            .with_dlq();
        let pump = ReceivePump::new(manager, &options, queue)
            .register("orders::OrderPlaced", Arc::new(handler));

        let message = incoming("orders::OrderPlaced");
        assert_eq!(
            pump.handle_message(&Context::new(), &message, 0).await,
            Disposition::Nack
        );
        assert_eq!(
            pump.handle_message(&Context::new(), &message, 3).await,
            Disposition::DeadLetter
        );
    }

    #[tokio::test]
    async fn unregistered_types_are_acknowledged_and_dropped() {
        let pump = pump();
        let disposition = pump
            .handle_message(&Context::new(), &incoming("orders::Unknown"), 0)
            .await;
        assert_eq!(disposition, Disposition::Ack);
    }
}
