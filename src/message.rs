// Copyright (c) 2025, The AMQP Transport Authors
// MIT License
// All rights reserved.

//! # Message Model
//!
//! This module defines the outgoing and incoming message shapes carried by
//! the transport, the per-message delivery options, and the well-known
//! header keys that are mapped to native protocol properties on the wire.
//! Application bodies are opaque bytes; serialization belongs to the caller.

use lapin::BasicProperties;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use uuid::Uuid;

/// Header carrying the logical message type of the enclosed body
pub const HEADER_ENCLOSED_TYPE: &str = "transport.enclosed-type";
/// Header carrying the content type of the enclosed body
pub const HEADER_CONTENT_TYPE: &str = "transport.content-type";
/// Header carrying the address replies should be sent to
pub const HEADER_REPLY_TO: &str = "transport.reply-to";
/// Header carrying the correlation id of the conversation
pub const HEADER_CORRELATION_ID: &str = "transport.correlation-id";
/// Header marking a message that was dispatched without durability
pub const HEADER_NON_DURABLE: &str = "transport.non-durable";

/// Content type applied when the caller does not specify one
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

/// Native header consumed by the delayed message exchange plugin
pub const AMQP_HEADER_DELAY: &str = "x-delay";

/// Per-message delivery constraints applied by the dispatcher.
///
/// Messages are durable by default. Priority is left unset unless the caller
/// chooses one; the dispatcher fills in the protocol default of 0 on the
/// wire. Values outside the broker's nominal priority range are forwarded
/// unchanged, the broker is the authority on what a priority byte means.
#[derive(Debug, Clone)]
pub struct DeliveryOptions {
    pub(crate) durable: bool,
    pub(crate) priority: Option<u8>,
    pub(crate) time_to_live: Option<Duration>,
    pub(crate) delay: Option<Duration>,
    pub(crate) reply_to: Option<String>,
    pub(crate) correlation_id: Option<String>,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        DeliveryOptions {
            durable: true,
            priority: None,
            time_to_live: None,
            delay: None,
            reply_to: None,
            correlation_id: None,
        }
    }
}

impl DeliveryOptions {
    /// Marks the message as non-durable, trading safety for throughput.
    pub fn non_durable(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Sets the message priority byte.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the time after which the broker discards the message.
    pub fn time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Delays delivery by the given duration.
    ///
    /// Requires the topology to declare delayed exchanges.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sets the address replies should be sent to.
    pub fn reply_to(mut self, address: &str) -> Self {
        self.reply_to = Some(address.to_owned());
        self
    }

    /// Sets the correlation id of the conversation this message belongs to.
    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }
}

/// An application message on its way to the broker.
///
/// The id is assigned once at construction and is stable across retries of
/// the same logical send, so broker-side deduplication can recognize a
/// resubmission. Headers are carried in a `BTreeMap` to keep their wire
/// order deterministic.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub(crate) id: String,
    pub(crate) message_type: String,
    pub(crate) body: Vec<u8>,
    pub(crate) headers: BTreeMap<String, String>,
    pub(crate) options: DeliveryOptions,
}

impl OutgoingMessage {
    /// Creates a new message with a generated unique id and default options.
    ///
    /// # Parameters
    /// * `message_type` - The logical type used for routing
    /// * `body` - The opaque message body
    pub fn new(message_type: &str, body: &[u8]) -> OutgoingMessage {
        OutgoingMessage {
            id: Uuid::new_v4().to_string(),
            message_type: message_type.to_owned(),
            body: body.to_vec(),
            headers: BTreeMap::default(),
            options: DeliveryOptions::default(),
        }
    }

    /// Replaces the generated id, for callers that manage their own identity.
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_owned();
        self
    }

    /// Adds a header carried opaquely to the receiving side.
    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    /// Applies delivery options to this message.
    pub fn options(mut self, options: DeliveryOptions) -> Self {
        self.options = options;
        self
    }

    /// The unique id of this message.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The logical type used for routing.
    pub fn message_type(&self) -> &str {
        &self.message_type
    }
}

/// An application message decoded from a broker delivery.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Unique id of the message
    pub id: String,
    /// Logical type of the enclosed body
    pub message_type: String,
    /// Opaque message body
    pub body: Vec<u8>,
    /// All headers, including the well-known keys
    pub headers: BTreeMap<String, String>,
    /// Content type of the body
    pub content_type: String,
    /// Correlation id of the conversation, if any
    pub correlation_id: Option<String>,
    /// Address replies should be sent to, if any
    pub reply_to: Option<String>,
    /// Whether the broker has delivered this message before
    pub redelivered: bool,
    /// The broker-assigned tag acknowledgements must reference
    pub delivery_tag: u64,
}

/// Raw view of a delivery handed to a custom message id strategy.
pub struct DeliveryEnvelope<'a> {
    /// Native properties of the delivery
    pub properties: &'a BasicProperties,
    /// The broker-assigned delivery tag
    pub delivery_tag: u64,
    /// Whether the broker has delivered this message before
    pub redelivered: bool,
}

/// Computes a message id from a delivery when the broker property is absent.
pub type MessageIdStrategy = Arc<dyn Fn(&DeliveryEnvelope<'_>) -> String + Send + Sync>;
