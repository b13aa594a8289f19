// Copyright (c) 2025, The AMQP Transport Authors
// MIT License
// All rights reserved.

//! # Transport Configuration
//!
//! This module provides the options surface of the transport. Every option
//! is validated at configuration time; conflicting combinations fail fast
//! with a `ConfigurationConflict` before any broker connection is attempted.

use crate::{
    errors::TransportError,
    message::MessageIdStrategy,
    topology::{RoutingTopology, TopologyFactory, MAX_QUEUE_PRIORITY},
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};

/// Broker endpoint settings, loadable from configuration material.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Broker host name
    pub host: String,
    /// Broker port
    pub port: u16,
    /// User for credential-based authentication
    pub user: String,
    /// Password for credential-based authentication
    pub password: String,
    /// Virtual host to connect to
    pub vhost: String,
    /// Connection name reported to the broker
    pub app_name: String,
    /// Whether to connect over TLS
    pub secure: bool,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        BrokerSettings {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "".to_owned(),
            app_name: "amqp-transport".to_owned(),
            secure: false,
        }
    }
}

impl BrokerSettings {
    /// Loads settings from a JSON document.
    pub fn from_json(raw: &str) -> Result<BrokerSettings, TransportError> {
        serde_json::from_str(raw)
            .map_err(|err| TransportError::ConfigurationConflict(err.to_string()))
    }

    /// The connection URI these settings describe.
    pub fn uri(&self) -> String {
        let scheme = if self.secure { "amqps" } else { "amqp" };
        format!(
            "{}://{}:{}@{}:{}/{}",
            scheme, self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

/// Client certificate material for mutual TLS authentication.
#[derive(Clone)]
pub struct ClientCertificate {
    /// PKCS#12 archive holding the client certificate and key
    pub pkcs12_der: Vec<u8>,
    /// Password protecting the archive
    pub password: String,
    /// Optional PEM chain to trust for the broker's certificate
    pub ca_chain_pem: Option<String>,
}

/// The full transport options surface.
///
/// Built with the `with_*` methods, checked once with [`validate`], and then
/// fixed for the process lifetime.
///
/// [`validate`]: TransportOptions::validate
#[derive(Clone)]
pub struct TransportOptions {
    pub(crate) broker: BrokerSettings,
    pub(crate) durable_entities: bool,
    pub(crate) use_publisher_confirms: bool,
    pub(crate) confirm_timeout: Duration,
    pub(crate) circuit_breaker_grace_period: Duration,
    pub(crate) prefetch_multiplier: u16,
    pub(crate) prefetch_count_override: Option<u16>,
    pub(crate) max_concurrency: u16,
    pub(crate) max_queue_priority: Option<u8>,
    pub(crate) client_certificate: Option<ClientCertificate>,
    pub(crate) disable_remote_certificate_validation: bool,
    pub(crate) use_external_auth_mechanism: bool,
    pub(crate) message_id_strategy: Option<MessageIdStrategy>,
    pub(crate) topology_factory: Option<TopologyFactory>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            broker: BrokerSettings::default(),
            durable_entities: true,
            use_publisher_confirms: true,
            confirm_timeout: Duration::from_secs(30),
            circuit_breaker_grace_period: Duration::from_secs(60),
            prefetch_multiplier: 3,
            prefetch_count_override: None,
            max_concurrency: 8,
            max_queue_priority: None,
            client_certificate: None,
            disable_remote_certificate_validation: false,
            use_external_auth_mechanism: false,
            message_id_strategy: None,
            topology_factory: None,
        }
    }
}

impl TransportOptions {
    /// Creates options with defaults for the given broker.
    pub fn new(broker: BrokerSettings) -> TransportOptions {
        TransportOptions {
            broker,
            ..TransportOptions::default()
        }
    }

    /// Sets the durability applied to every entity the topology declares.
    pub fn durable_entities(mut self, durable: bool) -> Self {
        self.durable_entities = durable;
        self
    }

    /// Enables or disables publisher confirms on borrowed channels.
    pub fn use_publisher_confirms(mut self, confirms: bool) -> Self {
        self.use_publisher_confirms = confirms;
        self
    }

    /// Sets how long a dispatch waits for its confirm before reporting the
    /// outcome as indeterminate.
    pub fn confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    /// Sets how long the connection may stay unrecovered before the circuit
    /// breaker trips and shuts the endpoint down.
    pub fn circuit_breaker_grace_period(mut self, grace: Duration) -> Self {
        self.circuit_breaker_grace_period = grace;
        self
    }

    /// Sets the multiplier applied to the concurrency limit when computing
    /// the prefetch count.
    pub fn prefetch_multiplier(mut self, multiplier: u16) -> Self {
        self.prefetch_multiplier = multiplier;
        self
    }

    /// Overrides the computed prefetch count with an explicit value.
    pub fn prefetch_count_override(mut self, count: u16) -> Self {
        self.prefetch_count_override = Some(count);
        self
    }

    /// Sets the maximum number of messages handled concurrently.
    pub fn max_concurrency(mut self, concurrency: u16) -> Self {
        self.max_concurrency = concurrency;
        self
    }

    /// Enables message priorities up to the given maximum on declared queues.
    pub fn max_queue_priority(mut self, max: u8) -> Self {
        self.max_queue_priority = Some(max);
        self
    }

    /// Authenticates with a client certificate over mutual TLS.
    pub fn client_certificate(mut self, certificate: ClientCertificate) -> Self {
        self.client_certificate = Some(certificate);
        self
    }

    /// Disables validation of the broker's certificate. Insecure; only for
    /// environments where the broker certificate cannot be trusted in the
    /// normal way.
    pub fn disable_remote_certificate_validation(mut self) -> Self {
        self.disable_remote_certificate_validation = true;
        self
    }

    /// Authenticates with the SASL EXTERNAL mechanism instead of
    /// credentials.
    pub fn use_external_auth_mechanism(mut self) -> Self {
        self.use_external_auth_mechanism = true;
        self
    }

    /// Installs a custom strategy for deriving message ids from deliveries
    /// that carry no message id property.
    pub fn message_id_strategy(mut self, strategy: MessageIdStrategy) -> Self {
        self.message_id_strategy = Some(strategy);
        self
    }

    /// Installs the factory that builds the routing topology for the
    /// configured durability.
    pub fn topology(mut self, factory: TopologyFactory) -> Self {
        self.topology_factory = Some(factory);
        self
    }

    /// Builds the configured topology with the configured durability.
    pub fn build_topology(&self) -> Option<Arc<dyn RoutingTopology>> {
        self.topology_factory
            .as_ref()
            .map(|factory| factory(self.durable_entities))
    }

    /// The prefetch count the receive pump will ask the broker to enforce.
    pub fn prefetch_count(&self) -> u16 {
        match self.prefetch_count_override {
            Some(count) => count,
            None => self.prefetch_multiplier.saturating_mul(self.max_concurrency),
        }
    }

    /// Checks the whole options surface for contradictions.
    ///
    /// Called before any broker connection is attempted; a conflict here is
    /// fatal and never retried.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.prefetch_multiplier == 0 {
            return Err(TransportError::ConfigurationConflict(
                "prefetch multiplier must be positive".to_owned(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(TransportError::ConfigurationConflict(
                "max concurrency must be positive".to_owned(),
            ));
        }
        if self.circuit_breaker_grace_period.is_zero() {
            return Err(TransportError::ConfigurationConflict(
                "circuit breaker grace period must be non-zero".to_owned(),
            ));
        }
        if self.use_publisher_confirms && self.confirm_timeout.is_zero() {
            return Err(TransportError::ConfigurationConflict(
                "confirm timeout must be non-zero when publisher confirms are enabled".to_owned(),
            ));
        }
        if let Some(max) = self.max_queue_priority {
            if max > MAX_QUEUE_PRIORITY {
                return Err(TransportError::ConfigurationConflict(format!(
                    "max queue priority {max} is outside the supported range 0..={MAX_QUEUE_PRIORITY}"
                )));
            }
        }

        let auth_modes = [
            self.client_certificate.is_some(),
            self.disable_remote_certificate_validation,
            self.use_external_auth_mechanism,
        ];
        if auth_modes.iter().filter(|enabled| **enabled).count() > 1 {
            return Err(TransportError::ConfigurationConflict(
                "client certificates, disabled certificate validation, and external \
                 authentication are mutually exclusive"
                    .to_owned(),
            ));
        }
        if self.client_certificate.is_some() && !self.broker.secure {
            return Err(TransportError::ConfigurationConflict(
                "client certificate authentication requires a secure connection".to_owned(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::ConventionalTopology;

    #[test]
    fn defaults_validate() {
        assert!(TransportOptions::default().validate().is_ok());
    }

    #[test]
    fn zero_prefetch_multiplier_is_rejected() {
        let options = TransportOptions::default().prefetch_multiplier(0);
        assert!(matches!(
            options.validate(),
            Err(TransportError::ConfigurationConflict(_))
        ));
    }

    #[test]
    fn out_of_range_queue_priority_is_rejected() {
        let options = TransportOptions::default().max_queue_priority(10);
        assert!(matches!(
            options.validate(),
            Err(TransportError::ConfigurationConflict(_))
        ));
    }

    #[test]
    fn conflicting_auth_modes_are_rejected() {
        let options = TransportOptions::default()
            .disable_remote_certificate_validation()
            .use_external_auth_mechanism();
        assert!(matches!(
            options.validate(),
            Err(TransportError::ConfigurationConflict(_))
        ));
    }

    #[test]
    fn client_certificates_require_a_secure_broker() {
        let options = TransportOptions::default().client_certificate(ClientCertificate {
            pkcs12_der: vec![1, 2, 3],
            password: "secret".to_owned(),
            ca_chain_pem: None,
        });
        assert!(matches!(
            options.validate(),
            Err(TransportError::ConfigurationConflict(_))
        ));

        let mut broker = BrokerSettings::default();
        broker.secure = true;
        let options = TransportOptions::new(broker).client_certificate(ClientCertificate {
            pkcs12_der: vec![1, 2, 3],
            password: "secret".to_owned(),
            ca_chain_pem: None,
        });
        assert!(options.validate().is_ok());
    }

    #[test]
    fn prefetch_is_multiplier_times_concurrency_unless_overridden() {
        let options = TransportOptions::default()
            .prefetch_multiplier(3)
            .max_concurrency(10);
        assert_eq!(options.prefetch_count(), 30);

        let options = options.prefetch_count_override(7);
        assert_eq!(options.prefetch_count(), 7);
    }

    #[test]
    fn prefetch_saturates_instead_of_overflowing() {
        let options = TransportOptions::default()
            .prefetch_multiplier(u16::MAX)
            .max_concurrency(u16::MAX);
        assert_eq!(options.prefetch_count(), u16::MAX);
    }

    #[test]
    fn topology_factory_receives_the_durability_flag() {
        let options = TransportOptions::default()
            .durable_entities(false)
            .topology(Arc::new(|durable| {
                Arc::new(
                    ConventionalTopology::new("billing", durable).publishes("billing::InvoicePaid"),
                )
            }));
        let topology = options.build_topology().expect("factory configured");
        let declarations = topology.declarations();
        assert!(!declarations.is_empty());
    }

    #[test]
    fn broker_settings_load_from_json() {
        let settings =
            BrokerSettings::from_json(r#"{"host":"mq.internal","port":5671,"secure":true}"#)
                .expect("valid settings document");
        assert_eq!(settings.host, "mq.internal");
        assert!(settings.uri().starts_with("amqps://"));
    }

    #[test]
    fn malformed_settings_are_a_configuration_conflict() {
        assert!(matches!(
            BrokerSettings::from_json("{not json"),
            Err(TransportError::ConfigurationConflict(_))
        ));
    }
}
