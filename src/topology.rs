// Copyright (c) 2025, The AMQP Transport Authors
// MIT License
// All rights reserved.

//! # Routing Topology
//!
//! This module maps logical message types to broker exchanges, queues, and
//! bindings. The mapping is pure: given the same type and the same topology
//! configuration it always produces the same address, which is what makes
//! topology declaration idempotent.
//!
//! Two interchangeable strategies are provided:
//! - `ConventionalTopology`: one queue per logical endpoint, one exchange
//!   per message type named by a deterministic convention
//! - `DirectTopology`: a single shared topic exchange with routing keys
//!   computed from the message type by an overridable convention function
//!
//! The `install` function declares a topology on a channel once per process
//! lifetime.

use crate::{
    errors::TransportError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tracing::{debug, error};

/// Argument naming the exchange expired or rejected messages are forwarded to
pub const AMQP_ARG_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Argument naming the routing key used when dead-lettering
pub const AMQP_ARG_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Argument setting the per-queue message time-to-live
pub const AMQP_ARG_MESSAGE_TTL: &str = "x-message-ttl";
/// Argument setting the maximum queue length
pub const AMQP_ARG_MAX_LENGTH: &str = "x-max-length";
/// Argument setting the maximum priority a queue honors
pub const AMQP_ARG_MAX_PRIORITY: &str = "x-max-priority";

/// The well-known shared exchange used by the direct strategy
pub const DEFAULT_TOPIC_EXCHANGE: &str = "amq.topic";

/// Highest queue priority the transport accepts at configuration time
pub const MAX_QUEUE_PRIORITY: u8 = 9;

/// Where a message goes on the wire: the exchange to publish to, the routing
/// key to publish with, and the destination queue when one is implied.
///
/// Addresses are derived, not stored. They are recomputed per dispatch from
/// the topology rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingAddress {
    /// Exchange to publish to; empty selects the broker's default exchange
    pub exchange: String,
    /// Routing key to publish with
    pub routing_key: String,
    /// Destination queue, when the address implies one
    pub queue: Option<String>,
}

/// One entity the topology wants declared on the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyDeclaration {
    Exchange(ExchangeDefinition),
    Queue(QueueDefinition),
    Binding(QueueBinding),
}

/// Trait defining the routing capability set.
///
/// A topology is chosen once at configuration time and fixed for the process
/// lifetime. Implementations hold no I/O; they only compute names.
pub trait RoutingTopology: Send + Sync {
    /// Resolves the address for a command sent to a specific endpoint.
    fn address_for_send(&self, message_type: &str) -> RoutingAddress;

    /// Resolves the address for an event published to every subscriber.
    fn address_for_publish(&self, message_type: &str) -> RoutingAddress;

    /// The entities this topology needs declared, in deterministic order.
    fn declarations(&self) -> Vec<TopologyDeclaration>;
}

/// Builds a topology for the given durability flag.
pub type TopologyFactory = Arc<dyn Fn(bool) -> Arc<dyn RoutingTopology> + Send + Sync>;

/// Computes an overridable routing key from a message type.
pub type RouteConvention = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// The default naming convention: `::`-separated type paths become
/// `.`-separated broker names.
pub fn conventional_route(message_type: &str) -> String {
    message_type
        .split("::")
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<&str>>()
        .join(".")
}

/// The endpoint owning a message type is its first path segment.
fn endpoint_of(message_type: &str) -> String {
    let route = conventional_route(message_type);
    route.split('.').next().unwrap_or_default().to_owned()
}

/// One queue per logical endpoint, one exchange per message type.
///
/// Events are published to a fanout exchange named after their type;
/// subscribing endpoints bind their queue to the exchanges of the types they
/// consume. Commands are sent through the default exchange straight to the
/// owning endpoint's queue.
pub struct ConventionalTopology {
    endpoint: String,
    durable: bool,
    max_priority: Option<u8>,
    delayed: bool,
    retry: Option<(i32, i32)>,
    dead_letter: bool,
    published: BTreeSet<String>,
    subscribed: BTreeSet<String>,
}

impl ConventionalTopology {
    /// Creates a topology for the given local endpoint.
    ///
    /// # Parameters
    /// * `endpoint` - Name of the local endpoint queue
    /// * `durable` - Durability applied to every declared entity
    pub fn new(endpoint: &str, durable: bool) -> ConventionalTopology {
        ConventionalTopology {
            endpoint: endpoint.to_owned(),
            durable,
            max_priority: None,
            delayed: false,
            retry: None,
            dead_letter: false,
            published: BTreeSet::default(),
            subscribed: BTreeSet::default(),
        }
    }

    /// Enables message priorities up to `max` on every declared queue.
    ///
    /// Values above the supported range fail here, at configuration time,
    /// not at declaration time.
    pub fn max_queue_priority(mut self, max: u8) -> Result<Self, TransportError> {
        if max > MAX_QUEUE_PRIORITY {
            return Err(TransportError::ConfigurationConflict(format!(
                "max queue priority {max} is outside the supported range 0..={MAX_QUEUE_PRIORITY}"
            )));
        }
        self.max_priority = Some(max);
        Ok(self)
    }

    /// Declares the per-type exchanges as delayed exchanges.
    ///
    /// Requires the delayed message exchange plugin on the broker.
    pub fn with_delayed_delivery(mut self) -> Self {
        self.delayed = true;
        self
    }

    /// Adds retry and dead letter companions to the endpoint queue.
    ///
    /// # Parameters
    /// * `retry_ttl_ms` - Time a failed message parks before redelivery
    /// * `retries` - Redelivery attempts before the message is dead-lettered
    pub fn with_dead_lettering(mut self, retry_ttl_ms: i32, retries: i32) -> Self {
        self.retry = Some((retry_ttl_ms, retries));
        self.dead_letter = true;
        self
    }

    /// Registers a message type this endpoint publishes.
    pub fn publishes(mut self, message_type: &str) -> Self {
        self.published.insert(message_type.to_owned());
        self
    }

    /// Registers a message type this endpoint subscribes to.
    pub fn subscribes(mut self, message_type: &str) -> Self {
        self.subscribed.insert(message_type.to_owned());
        self
    }

    fn endpoint_queue(&self) -> QueueDefinition {
        let mut def = QueueDefinition::new(&self.endpoint).durable(self.durable);
        if let Some(max) = self.max_priority {
            def = def.max_priority(max);
        }
        if let Some((ttl, retries)) = self.retry {
            def = def.with_retry(ttl, retries);
        }
        if self.dead_letter {
            def = def.with_dlq();
        }
        def
    }
}

impl RoutingTopology for ConventionalTopology {
    fn address_for_send(&self, message_type: &str) -> RoutingAddress {
        let queue = endpoint_of(message_type);
        RoutingAddress {
            exchange: String::new(),
            routing_key: queue.clone(),
            queue: Some(queue),
        }
    }

    fn address_for_publish(&self, message_type: &str) -> RoutingAddress {
        RoutingAddress {
            exchange: conventional_route(message_type),
            routing_key: String::new(),
            queue: None,
        }
    }

    fn declarations(&self) -> Vec<TopologyDeclaration> {
        let mut declarations = vec![];

        // Exchanges for everything this endpoint touches. Both sides of a
        // binding must exist before the bind, and either side may start
        // first, so publishers and subscribers declare alike.
        for message_type in self.published.union(&self.subscribed) {
            let mut def = ExchangeDefinition::new(&conventional_route(message_type))
                .fanout()
                .durable(self.durable);
            if self.delayed {
                def = def.delayed();
            }
            declarations.push(TopologyDeclaration::Exchange(def));
        }

        declarations.push(TopologyDeclaration::Queue(self.endpoint_queue()));

        for message_type in &self.subscribed {
            declarations.push(TopologyDeclaration::Binding(
                QueueBinding::new(&self.endpoint).exchange(&conventional_route(message_type)),
            ));
        }

        declarations
    }
}

/// A single shared exchange with routing keys computed from message types.
///
/// Avoids creating one exchange per message type, at the cost of routing-key
/// collision risk that the convention function must avoid.
pub struct DirectTopology {
    endpoint: String,
    durable: bool,
    exchange: String,
    route: RouteConvention,
    subscribed: BTreeSet<String>,
}

impl DirectTopology {
    /// Creates a topology routing through the default topic exchange.
    pub fn new(endpoint: &str, durable: bool) -> DirectTopology {
        DirectTopology {
            endpoint: endpoint.to_owned(),
            durable,
            exchange: DEFAULT_TOPIC_EXCHANGE.to_owned(),
            route: Arc::new(|message_type| conventional_route(message_type)),
            subscribed: BTreeSet::default(),
        }
    }

    /// Routes through a custom shared exchange instead of the default one.
    pub fn exchange(mut self, name: &str) -> Self {
        self.exchange = name.to_owned();
        self
    }

    /// Overrides the routing key convention.
    pub fn route_convention(mut self, convention: RouteConvention) -> Self {
        self.route = convention;
        self
    }

    /// Registers a message type this endpoint subscribes to.
    pub fn subscribes(mut self, message_type: &str) -> Self {
        self.subscribed.insert(message_type.to_owned());
        self
    }
}

impl RoutingTopology for DirectTopology {
    fn address_for_send(&self, message_type: &str) -> RoutingAddress {
        let queue = endpoint_of(message_type);
        RoutingAddress {
            exchange: String::new(),
            routing_key: queue.clone(),
            queue: Some(queue),
        }
    }

    fn address_for_publish(&self, message_type: &str) -> RoutingAddress {
        RoutingAddress {
            exchange: self.exchange.clone(),
            routing_key: (self.route)(message_type),
            queue: None,
        }
    }

    fn declarations(&self) -> Vec<TopologyDeclaration> {
        let mut declarations = vec![];

        // Broker built-ins already exist and refuse redeclaration.
        if !self.exchange.starts_with("amq.") {
            declarations.push(TopologyDeclaration::Exchange(
                ExchangeDefinition::new(&self.exchange)
                    .topic()
                    .durable(self.durable),
            ));
        }

        declarations.push(TopologyDeclaration::Queue(
            QueueDefinition::new(&self.endpoint).durable(self.durable),
        ));

        for message_type in &self.subscribed {
            declarations.push(TopologyDeclaration::Binding(
                QueueBinding::new(&self.endpoint)
                    .exchange(&self.exchange)
                    .routing_key(&(self.route)(message_type)),
            ));
        }

        declarations
    }
}

/// Declares a topology on the broker.
///
/// Exchanges are declared first, then queues with their companions, then
/// bindings. Redeclaring an entity with identical attributes succeeds
/// silently on the broker side; a protocol-level rejection means an existing
/// entity disagrees with ours and is surfaced as a configuration conflict,
/// once, fatal.
pub async fn install(
    channel: &Channel,
    topology: &dyn RoutingTopology,
) -> Result<(), TransportError> {
    let declarations = topology.declarations();

    for declaration in &declarations {
        if let TopologyDeclaration::Exchange(def) = declaration {
            install_exchange(channel, def).await?;
        }
    }
    for declaration in &declarations {
        if let TopologyDeclaration::Queue(def) = declaration {
            install_queue(channel, def).await?;
        }
    }
    for declaration in &declarations {
        if let TopologyDeclaration::Binding(binding) = declaration {
            install_binding(channel, binding).await?;
        }
    }

    Ok(())
}

fn declare_failure(err: lapin::Error, fallback: TransportError) -> TransportError {
    match err {
        lapin::Error::ProtocolError(e) => TransportError::ConfigurationConflict(e.to_string()),
        _ => fallback,
    }
}

async fn install_exchange(
    channel: &Channel,
    def: &ExchangeDefinition,
) -> Result<(), TransportError> {
    debug!("creating exchange: {}", def.name);

    match channel
        .exchange_declare(
            &def.name,
            def.kind.clone().try_into()?,
            ExchangeDeclareOptions {
                passive: false,
                durable: def.durable,
                auto_delete: def.auto_delete,
                internal: def.internal,
                nowait: false,
            },
            FieldTable::from(def.params.clone()),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = def.name,
                "error to declare the exchange"
            );
            Err(declare_failure(
                err,
                TransportError::DeclareExchange(def.name.clone()),
            ))
        }
        _ => Ok(()),
    }
}

/// Declaration arguments for a queue definition.
pub(crate) fn queue_args(def: &QueueDefinition) -> BTreeMap<ShortString, AMQPValue> {
    let mut args = BTreeMap::new();

    if let Some(ttl) = def.ttl_ms {
        args.insert(
            ShortString::from(AMQP_ARG_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }
    if let Some(max) = def.max_length {
        args.insert(
            ShortString::from(AMQP_ARG_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }
    if let Some(max) = def.max_priority {
        args.insert(
            ShortString::from(AMQP_ARG_MAX_PRIORITY),
            AMQPValue::LongInt(LongInt::from(i32::from(max))),
        );
    }

    args
}

async fn install_queue(channel: &Channel, def: &QueueDefinition) -> Result<(), TransportError> {
    debug!("creating queue: {}", def.name);

    let mut args = queue_args(def);

    if def.retry_name.is_some() {
        install_retry_queue(channel, def, &mut args).await?;
    }
    if def.dlq_name.is_some() {
        install_dlq(channel, def, &mut args).await?;
    }

    match channel
        .queue_declare(
            &def.name,
            QueueDeclareOptions {
                passive: false,
                durable: def.durable,
                exclusive: def.exclusive,
                auto_delete: def.auto_delete,
                nowait: false,
            },
            FieldTable::from(args),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name = def.name, "error to declare the queue");
            Err(declare_failure(
                err,
                TransportError::DeclareQueue(def.name.clone()),
            ))
        }
        _ => {
            debug!("queue: {} was created", def.name);
            Ok(())
        }
    }
}

/// Declares the retry companion and points the main queue's dead letter
/// routing at it, so failed messages park there before redelivery.
async fn install_retry_queue(
    channel: &Channel,
    def: &QueueDefinition,
    queue_args: &mut BTreeMap<ShortString, AMQPValue>,
) -> Result<(), TransportError> {
    let retry_name = def.retry_name.clone().unwrap_or_default();

    let mut args = BTreeMap::new();
    args.insert(
        ShortString::from(AMQP_ARG_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from("")),
    );
    args.insert(
        ShortString::from(AMQP_ARG_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(def.name.clone())),
    );
    if let Some(ttl) = def.retry_ttl_ms {
        args.insert(
            ShortString::from(AMQP_ARG_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }
    if let Some(max) = def.max_priority {
        args.insert(
            ShortString::from(AMQP_ARG_MAX_PRIORITY),
            AMQPValue::LongInt(LongInt::from(i32::from(max))),
        );
    }

    match channel
        .queue_declare(
            &retry_name,
            QueueDeclareOptions {
                passive: false,
                durable: def.durable,
                exclusive: def.exclusive,
                auto_delete: def.auto_delete,
                nowait: false,
            },
            FieldTable::from(args),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "failure to declare retry queue");
            Err(declare_failure(
                err,
                TransportError::DeclareQueue(retry_name),
            ))
        }
        _ => {
            queue_args.insert(
                ShortString::from(AMQP_ARG_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from("")),
            );
            queue_args.insert(
                ShortString::from(AMQP_ARG_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(retry_name)),
            );
            Ok(())
        }
    }
}

/// Declares the dead letter companion. When no retry queue exists, failed
/// messages dead-letter straight back to the main queue's routing.
async fn install_dlq(
    channel: &Channel,
    def: &QueueDefinition,
    queue_args: &mut BTreeMap<ShortString, AMQPValue>,
) -> Result<(), TransportError> {
    let dlq_name = def.dlq_name.clone().unwrap_or_default();

    match channel
        .queue_declare(
            &dlq_name,
            QueueDeclareOptions {
                passive: false,
                durable: def.durable,
                exclusive: def.exclusive,
                auto_delete: def.auto_delete,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "failure to declare dead letter queue");
            Err(declare_failure(err, TransportError::DeclareQueue(dlq_name)))
        }
        _ => {
            if def.retry_name.is_none() {
                queue_args.insert(
                    ShortString::from(AMQP_ARG_DEAD_LETTER_EXCHANGE),
                    AMQPValue::LongString(LongString::from("")),
                );
                queue_args.insert(
                    ShortString::from(AMQP_ARG_DEAD_LETTER_ROUTING_KEY),
                    AMQPValue::LongString(LongString::from(dlq_name)),
                );
            }
            Ok(())
        }
    }
}

async fn install_binding(channel: &Channel, binding: &QueueBinding) -> Result<(), TransportError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        binding.queue_name, binding.exchange_name, binding.routing_key
    );

    match channel
        .queue_bind(
            &binding.queue_name,
            &binding.exchange_name,
            &binding.routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to bind queue to exchange");
            Err(declare_failure(
                err,
                TransportError::BindQueue(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ),
            ))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conventional() -> ConventionalTopology {
        ConventionalTopology::new("billing", true)
            .publishes("billing::InvoicePaid")
            .subscribes("orders::OrderPlaced")
    }

    #[test]
    fn declarations_are_deterministic() {
        let topology = conventional();
        assert_eq!(topology.declarations(), topology.declarations());
    }

    #[test]
    fn send_addresses_are_stable_across_calls() {
        let topology = conventional();
        let first = topology.address_for_send("orders::OrderPlaced");
        let second = topology.address_for_send("orders::OrderPlaced");
        assert_eq!(first, second);
    }

    #[test]
    fn send_routes_through_the_default_exchange_to_the_owning_endpoint() {
        let address = conventional().address_for_send("orders::OrderPlaced");
        assert_eq!(address.exchange, "");
        assert_eq!(address.routing_key, "orders");
        assert_eq!(address.queue.as_deref(), Some("orders"));
    }

    #[test]
    fn publish_routes_to_the_per_type_exchange() {
        let address = conventional().address_for_publish("billing::InvoicePaid");
        assert_eq!(address.exchange, "billing.InvoicePaid");
        assert_eq!(address.routing_key, "");
        assert!(address.queue.is_none());
    }

    #[test]
    fn conventional_declares_exchanges_queue_and_bindings() {
        let declarations = conventional().declarations();

        let exchanges: Vec<&ExchangeDefinition> = declarations
            .iter()
            .filter_map(|d| match d {
                TopologyDeclaration::Exchange(def) => Some(def),
                _ => None,
            })
            .collect();
        assert_eq!(exchanges.len(), 2);
        assert!(exchanges.iter().all(|e| e.durable));

        let bindings: Vec<&QueueBinding> = declarations
            .iter()
            .filter_map(|d| match d {
                TopologyDeclaration::Binding(b) => Some(b),
                _ => None,
            })
            .collect();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].queue_name, "billing");
        assert_eq!(bindings[0].exchange_name, "orders.OrderPlaced");
    }

    #[test]
    fn out_of_range_priority_fails_at_configuration_time() {
        let result = ConventionalTopology::new("billing", true).max_queue_priority(10);
        assert!(matches!(
            result,
            Err(TransportError::ConfigurationConflict(_))
        ));
    }

    #[test]
    fn priority_applies_to_every_declared_queue() {
        let topology = ConventionalTopology::new("billing", true)
            .max_queue_priority(5)
            .expect("priority in range")
            .with_dead_lettering(10_000, 3);

        for declaration in topology.declarations() {
            if let TopologyDeclaration::Queue(def) = declaration {
                assert_eq!(def.max_priority, Some(5));
                let args = queue_args(&def);
                assert_eq!(
                    args.get(&ShortString::from(AMQP_ARG_MAX_PRIORITY)),
                    Some(&AMQPValue::LongInt(5))
                );
            }
        }
    }

    #[test]
    fn direct_publishes_to_the_shared_topic_exchange() {
        let topology = DirectTopology::new("billing", true);
        let address = topology.address_for_publish("orders::OrderPlaced");
        assert_eq!(address.exchange, DEFAULT_TOPIC_EXCHANGE);
        assert_eq!(address.routing_key, "orders.OrderPlaced");
    }

    #[test]
    fn direct_never_declares_broker_builtins() {
        let declarations = DirectTopology::new("billing", true)
            .subscribes("orders::OrderPlaced")
            .declarations();
        assert!(!declarations
            .iter()
            .any(|d| matches!(d, TopologyDeclaration::Exchange(_))));
    }

    #[test]
    fn direct_declares_a_custom_shared_exchange() {
        let declarations = DirectTopology::new("billing", true)
            .exchange("events")
            .declarations();
        let declared = declarations.iter().any(|d| {
            matches!(d, TopologyDeclaration::Exchange(def) if def.name() == "events")
        });
        assert!(declared);
    }

    #[test]
    fn direct_route_convention_is_overridable() {
        let topology = DirectTopology::new("billing", true)
            .route_convention(Arc::new(|t| format!("app.{}", conventional_route(t))));
        let address = topology.address_for_publish("orders::OrderPlaced");
        assert_eq!(address.routing_key, "app.orders.OrderPlaced");
    }

    #[test]
    fn route_convention_collapses_type_paths() {
        assert_eq!(conventional_route("orders::OrderPlaced"), "orders.OrderPlaced");
        assert_eq!(conventional_route("orders"), "orders");
    }
}
