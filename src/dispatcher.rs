// Copyright (c) 2025, The AMQP Transport Authors
// MIT License
// All rights reserved.

//! # Outbound Dispatch
//!
//! This module turns an application-level outgoing message plus a resolved
//! routing address into a wire-level publish. Message properties are a
//! deterministic function of the message fields, so the same message always
//! produces the same frame. When a confirm is required, the dispatch awaits
//! the broker's ack or nack, raced against the configured timeout; the
//! pending-confirm bookkeeping is cleaned up on every resolution path.

use crate::{
    channel::PooledChannel,
    config::TransportOptions,
    connection::ConnectionManager,
    errors::TransportError,
    message::{
        OutgoingMessage, AMQP_HEADER_DELAY, HEADER_CONTENT_TYPE, HEADER_CORRELATION_ID,
        HEADER_ENCLOSED_TYPE, HEADER_NON_DURABLE, HEADER_REPLY_TO, OCTET_STREAM_CONTENT_TYPE,
    },
    topology::RoutingAddress,
};
use lapin::{
    options::BasicPublishOptions,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties,
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Delivery mode marking a message as persisted by the broker
const DELIVERY_MODE_PERSISTENT: u8 = 2;
/// Delivery mode marking a message as transient
const DELIVERY_MODE_TRANSIENT: u8 = 1;

/// What the caller knows about a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// Accepted by the local channel; no delivery guarantee beyond that
    Accepted,
    /// The broker acknowledged the publish
    Confirmed,
}

/// Publishes outgoing messages over channels borrowed from the connection
/// manager.
///
/// The dispatcher holds no mutable state of its own; all bookkeeping lives
/// in the per-channel confirm ledger, and retry policy belongs to the
/// caller.
pub struct Dispatcher {
    manager: Arc<ConnectionManager>,
    confirm_timeout: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher over the given connection manager.
    pub fn new(manager: Arc<ConnectionManager>, options: &TransportOptions) -> Dispatcher {
        Dispatcher {
            manager,
            confirm_timeout: options.confirm_timeout,
        }
    }

    /// Publishes one message to the given address.
    ///
    /// The ledger sequence number is reserved before the frame is written,
    /// so an ack racing the send cannot arrive for an unknown publish. With
    /// `require_confirm` the call suspends until the broker acks or nacks,
    /// or the confirm timeout elapses; a nack is a rejection, a timeout or
    /// link loss is indeterminate and the caller must treat the message as
    /// possibly delivered.
    pub async fn dispatch(
        &self,
        message: &OutgoingMessage,
        address: &RoutingAddress,
        require_confirm: bool,
    ) -> Result<Receipt, TransportError> {
        let channel = self.manager.borrow_channel().await?;
        let pending = channel.ledger().reserve(message.id());
        let sequence = pending.sequence();

        let written = channel
            .raw()
            .basic_publish(
                &address.exchange,
                &address.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                encode_properties(message),
            )
            .await;

        let confirm = match written {
            Ok(confirm) => confirm,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    message_id = message.id(),
                    "failure to publish message"
                );
                drop(pending);
                self.manager.release_channel(channel, false).await;
                return Err(err.into());
            }
        };

        if !require_confirm {
            drop(pending);
            self.manager.release_channel(channel, true).await;
            return Ok(Receipt::Accepted);
        }

        match timeout(self.confirm_timeout, confirm).await {
            Ok(Ok(confirmation)) => {
                drop(pending);
                self.resolve(channel, message, confirmation).await
            }
            Ok(Err(err)) => {
                warn!(
                    error = err.to_string(),
                    message_id = message.id(),
                    sequence,
                    "link failed before the confirm arrived"
                );
                drop(pending);
                self.manager.release_channel(channel, false).await;
                Err(TransportError::DispatchIndeterminate(
                    message.id().to_owned(),
                ))
            }
            Err(_) => {
                warn!(
                    message_id = message.id(),
                    sequence, "timed out awaiting the confirm"
                );
                // The confirm may still arrive on this channel; discarding it
                // purges the ledger so a stale completion cannot fire later.
                drop(pending);
                self.manager.release_channel(channel, false).await;
                Err(TransportError::DispatchIndeterminate(
                    message.id().to_owned(),
                ))
            }
        }
    }

    async fn resolve(
        &self,
        channel: PooledChannel,
        message: &OutgoingMessage,
        confirmation: Confirmation,
    ) -> Result<Receipt, TransportError> {
        match confirmation {
            Confirmation::Nack(_) => {
                warn!(message_id = message.id(), "broker nacked the publish");
                self.manager.release_channel(channel, true).await;
                Err(TransportError::DispatchRejected(message.id().to_owned()))
            }
            Confirmation::Ack(_) => {
                debug!(message_id = message.id(), "publish confirmed");
                self.manager.release_channel(channel, true).await;
                Ok(Receipt::Confirmed)
            }
            Confirmation::NotRequested => {
                self.manager.release_channel(channel, true).await;
                Ok(Receipt::Accepted)
            }
        }
    }
}

/// Maps a message onto wire properties.
///
/// Well-known headers become native properties; everything else rides
/// opaquely in the header table. Content type defaults to the octet-stream
/// marker, priority to 0. Out-of-range priorities are forwarded unchanged,
/// the broker is the authority on what a priority byte means.
pub(crate) fn encode_properties(message: &OutgoingMessage) -> BasicProperties {
    let options = &message.options;
    let mut table = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in &message.headers {
        match key.as_str() {
            HEADER_CONTENT_TYPE | HEADER_REPLY_TO | HEADER_CORRELATION_ID => continue,
            _ => {
                table.insert(
                    ShortString::from(key.as_str()),
                    AMQPValue::LongString(LongString::from(value.as_str())),
                );
            }
        }
    }
    table.insert(
        ShortString::from(HEADER_ENCLOSED_TYPE),
        AMQPValue::LongString(LongString::from(message.message_type.as_str())),
    );
    table.insert(
        ShortString::from(HEADER_NON_DURABLE),
        AMQPValue::LongString(LongString::from(if options.durable { "False" } else { "True" })),
    );
    if let Some(delay) = options.delay {
        table.insert(
            ShortString::from(AMQP_HEADER_DELAY),
            AMQPValue::LongLongInt(LongLongInt::from(delay.as_millis() as i64)),
        );
    }

    let content_type = message
        .headers
        .get(HEADER_CONTENT_TYPE)
        .map(String::as_str)
        .unwrap_or(OCTET_STREAM_CONTENT_TYPE);

    let delivery_mode = if options.durable {
        DELIVERY_MODE_PERSISTENT
    } else {
        DELIVERY_MODE_TRANSIENT
    };

    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(content_type))
        .with_type(ShortString::from(message.message_type.as_str()))
        .with_message_id(ShortString::from(message.id.as_str()))
        .with_priority(options.priority.unwrap_or(0))
        .with_delivery_mode(delivery_mode)
        .with_headers(FieldTable::from(table));

    if let Some(ttl) = options.time_to_live {
        properties = properties.with_expiration(ShortString::from(ttl.as_millis().to_string()));
    }
    if let Some(reply_to) = options
        .reply_to
        .as_deref()
        .or_else(|| message.headers.get(HEADER_REPLY_TO).map(String::as_str))
    {
        properties = properties.with_reply_to(ShortString::from(reply_to));
    }
    if let Some(correlation_id) = options
        .correlation_id
        .as_deref()
        .or_else(|| message.headers.get(HEADER_CORRELATION_ID).map(String::as_str))
    {
        properties = properties.with_correlation_id(ShortString::from(correlation_id));
    }

    properties
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DeliveryOptions;

    fn header(properties: &BasicProperties, key: &str) -> Option<String> {
        properties
            .headers()
            .as_ref()
            .and_then(|table| table.inner().get(&ShortString::from(key)))
            .and_then(AMQPValue::as_long_string)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
    }

    #[test]
    fn content_type_defaults_to_octet_stream() {
        let message = OutgoingMessage::new("orders::OrderPlaced", b"{}");
        let properties = encode_properties(&message);
        assert_eq!(
            properties.content_type().as_ref().map(|c| c.as_str()),
            Some(OCTET_STREAM_CONTENT_TYPE)
        );
    }

    #[test]
    fn explicit_content_type_is_kept() {
        let message = OutgoingMessage::new("orders::OrderPlaced", b"{}")
            .header(HEADER_CONTENT_TYPE, "application/json");
        let properties = encode_properties(&message);
        assert_eq!(
            properties.content_type().as_ref().map(|c| c.as_str()),
            Some("application/json")
        );
        // Lifted into the native property, not duplicated in the table.
        assert_eq!(header(&properties, HEADER_CONTENT_TYPE), None);
    }

    #[test]
    fn time_to_live_is_the_millisecond_string() {
        let message = OutgoingMessage::new("orders::OrderPlaced", b"{}")
            .options(DeliveryOptions::default().time_to_live(Duration::from_secs(24 * 60 * 60)));
        let properties = encode_properties(&message);
        assert_eq!(
            properties.expiration().as_ref().map(|e| e.as_str()),
            Some("86400000")
        );
    }

    #[test]
    fn priority_defaults_to_zero() {
        let message = OutgoingMessage::new("orders::OrderPlaced", b"{}");
        let properties = encode_properties(&message);
        assert_eq!(*properties.priority(), Some(0));
    }

    #[test]
    fn out_of_range_priority_passes_through_unchanged() {
        let message = OutgoingMessage::new("orders::OrderPlaced", b"{}")
            .options(DeliveryOptions::default().priority(255));
        let properties = encode_properties(&message);
        assert_eq!(*properties.priority(), Some(255));
    }

    #[test]
    fn durability_sets_the_delivery_mode_and_marker_header() {
        let durable = encode_properties(&OutgoingMessage::new("orders::OrderPlaced", b"{}"));
        assert_eq!(*durable.delivery_mode(), Some(DELIVERY_MODE_PERSISTENT));
        assert_eq!(
            header(&durable, HEADER_NON_DURABLE),
            Some("False".to_owned())
        );

        let transient = encode_properties(
            &OutgoingMessage::new("orders::OrderPlaced", b"{}")
                .options(DeliveryOptions::default().non_durable()),
        );
        assert_eq!(*transient.delivery_mode(), Some(DELIVERY_MODE_TRANSIENT));
        assert_eq!(
            header(&transient, HEADER_NON_DURABLE),
            Some("True".to_owned())
        );
    }

    #[test]
    fn opaque_headers_ride_in_the_header_table() {
        let message = OutgoingMessage::new("orders::OrderPlaced", b"{}")
            .header("h1", "v1")
            .header("h2", "v2");
        let properties = encode_properties(&message);
        assert_eq!(header(&properties, "h1"), Some("v1".to_owned()));
        assert_eq!(header(&properties, "h2"), Some("v2".to_owned()));
    }

    #[test]
    fn identity_and_type_map_to_native_properties() {
        let message = OutgoingMessage::new("orders::OrderPlaced", b"{}").with_id("msg-1");
        let properties = encode_properties(&message);
        assert_eq!(
            properties.message_id().as_ref().map(|i| i.as_str()),
            Some("msg-1")
        );
        assert_eq!(
            properties.kind().as_ref().map(|k| k.as_str()),
            Some("orders::OrderPlaced")
        );
        assert_eq!(
            header(&properties, HEADER_ENCLOSED_TYPE),
            Some("orders::OrderPlaced".to_owned())
        );
    }

    #[test]
    fn reply_to_and_correlation_id_map_to_native_properties() {
        let message = OutgoingMessage::new("orders::OrderPlaced", b"{}").options(
            DeliveryOptions::default()
                .reply_to("billing")
                .correlation_id("corr-7"),
        );
        let properties = encode_properties(&message);
        assert_eq!(
            properties.reply_to().as_ref().map(|r| r.as_str()),
            Some("billing")
        );
        assert_eq!(
            properties.correlation_id().as_ref().map(|c| c.as_str()),
            Some("corr-7")
        );
    }

    #[test]
    fn delay_is_carried_as_the_plugin_header() {
        let message = OutgoingMessage::new("orders::OrderPlaced", b"{}")
            .options(DeliveryOptions::default().delay(Duration::from_secs(5)));
        let properties = encode_properties(&message);
        let delay = properties
            .headers()
            .as_ref()
            .and_then(|table| table.inner().get(&ShortString::from(AMQP_HEADER_DELAY)))
            .and_then(AMQPValue::as_long_long_int);
        assert_eq!(delay, Some(5_000));
    }

    #[test]
    fn encoding_is_deterministic() {
        let message = OutgoingMessage::new("orders::OrderPlaced", b"{}")
            .with_id("msg-1")
            .header("h1", "v1");
        assert_eq!(encode_properties(&message), encode_properties(&message));
    }
}
