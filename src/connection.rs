// Copyright (c) 2025, The AMQP Transport Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle Management
//!
//! This module owns the single logical connection to the broker. It lends
//! channels to dispatch and consume operations, detects link failure through
//! the connection error hook, drives recovery with exponential backoff, and
//! trips a circuit breaker when recovery does not happen within the
//! configured grace period. A tripped breaker is terminal: the manager
//! signals endpoint shutdown exactly once and refuses further work, because
//! an endpoint accepting work it cannot dispatch is worse than one that
//! stops.

use crate::{
    channel::PooledChannel,
    config::{ClientCertificate, TransportOptions},
    errors::TransportError,
};
use lapin::{
    options::ConfirmSelectOptions,
    tcp::{OwnedIdentity, OwnedTLSConfig},
    types::LongString,
    uri::{AMQPUri, SASLMechanism},
    Connection, ConnectionProperties,
};
use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{watch, Mutex, Notify},
    time::sleep,
};
use tracing::{debug, error, warn};

const RECOVERY_BACKOFF_BASE: Duration = Duration::from_millis(100);
const RECOVERY_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Health of the logical link to the broker.
///
/// Faulted is terminal; every other state can still make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection has been requested yet
    Disconnected,
    /// The first connection attempt is in progress
    Connecting,
    /// The link is live and channels can be lent
    Connected,
    /// The link failed and recovery attempts are running
    Recovering,
    /// Recovery exceeded the grace period; the endpoint must shut down
    Faulted,
}

/// Tracks how long the link has been failing and trips once.
///
/// Mutated only by the connection manager; everything else observes the
/// link state, never these timestamps.
#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    grace_period: Duration,
    last_success: Instant,
    window_start: Option<Instant>,
    tripped: bool,
}

impl CircuitBreaker {
    pub(crate) fn new(grace_period: Duration) -> CircuitBreaker {
        CircuitBreaker {
            grace_period,
            last_success: Instant::now(),
            window_start: None,
            tripped: false,
        }
    }

    /// Records a failed recovery attempt.
    ///
    /// Returns true exactly once, when the failure window first exceeds the
    /// grace period.
    pub(crate) fn record_failure(&mut self) -> bool {
        if self.tripped {
            return false;
        }
        let window_start = *self.window_start.get_or_insert_with(Instant::now);
        if window_start.elapsed() >= self.grace_period {
            self.tripped = true;
            return true;
        }
        false
    }

    /// Records a successful handshake, closing the failure window.
    pub(crate) fn record_success(&mut self) {
        if !self.tripped {
            self.window_start = None;
            self.last_success = Instant::now();
        }
    }

    pub(crate) fn tripped(&self) -> bool {
        self.tripped
    }

    pub(crate) fn downtime(&self) -> Duration {
        self.last_success.elapsed()
    }
}

/// Owns the logical connection, lends channels, and drives recovery.
pub struct ConnectionManager {
    uri: AMQPUri,
    properties: ConnectionProperties,
    certificate: Option<ClientCertificate>,
    insecure: bool,
    confirms: bool,
    grace_period: Duration,
    state: Mutex<LinkState>,
    breaker: Mutex<CircuitBreaker>,
    connection: Mutex<Option<Connection>>,
    pool: Mutex<Vec<PooledChannel>>,
    link_failed: Arc<Notify>,
    supervisor_running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConnectionManager {
    /// Creates a manager from validated options.
    ///
    /// Fails fast on any configuration conflict; no connection is attempted
    /// here. The first connection is made lazily on the first channel
    /// request.
    pub fn new(options: &TransportOptions) -> Result<Arc<ConnectionManager>, TransportError> {
        options.validate()?;

        let mut uri = AMQPUri::from_str(&options.broker.uri())
            .map_err(TransportError::ConfigurationConflict)?;
        if options.use_external_auth_mechanism {
            uri.query.auth_mechanism = Some(SASLMechanism::External);
        }

        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(options.broker.app_name.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Arc::new(ConnectionManager {
            uri,
            properties,
            certificate: options.client_certificate.clone(),
            insecure: options.disable_remote_certificate_validation,
            confirms: options.use_publisher_confirms,
            grace_period: options.circuit_breaker_grace_period,
            state: Mutex::new(LinkState::Disconnected),
            breaker: Mutex::new(CircuitBreaker::new(options.circuit_breaker_grace_period)),
            connection: Mutex::new(None),
            pool: Mutex::new(vec![]),
            link_failed: Arc::new(Notify::new()),
            supervisor_running: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
        }))
    }

    /// Borrows a channel for one dispatch or one consumer.
    ///
    /// Creates the connection on first use. Fails immediately, without
    /// queueing the caller, when the link is recovering or faulted; retry
    /// policy belongs to the caller.
    pub async fn borrow_channel(self: &Arc<Self>) -> Result<PooledChannel, TransportError> {
        let (current, initiated) = {
            let mut state = self.state.lock().await;
            match *state {
                LinkState::Disconnected => {
                    *state = LinkState::Connecting;
                    (LinkState::Connecting, true)
                }
                other => (other, false),
            }
        };

        match current {
            LinkState::Faulted => Err(TransportError::CircuitTripped(self.grace_period)),
            LinkState::Recovering => Err(TransportError::ConnectionLost(
                "link is recovering".to_owned(),
            )),
            LinkState::Connecting if initiated => {
                self.first_connect().await?;
                self.open_channel().await
            }
            LinkState::Connecting | LinkState::Disconnected => Err(
                TransportError::ConnectionLost("connection attempt in progress".to_owned()),
            ),
            LinkState::Connected => {
                if let Some(channel) = self.pool.lock().await.pop() {
                    if channel.is_usable() {
                        return Ok(channel);
                    }
                    channel.discard();
                }
                self.open_channel().await
            }
        }
    }

    /// Returns a borrowed channel.
    ///
    /// Healthy channels go back to the pool for reuse; unhealthy ones are
    /// discarded after purging their confirm ledger.
    pub async fn release_channel(&self, channel: PooledChannel, healthy: bool) {
        if healthy && channel.is_usable() {
            self.pool.lock().await.push(channel);
        } else {
            channel.discard();
        }
    }

    /// Whether the link is currently usable.
    pub async fn is_connected(&self) -> bool {
        *self.state.lock().await == LinkState::Connected
    }

    pub(crate) async fn state(&self) -> LinkState {
        *self.state.lock().await
    }

    /// A receiver that flips to true when the circuit breaker trips and the
    /// host should begin endpoint shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    async fn first_connect(self: &Arc<Self>) -> Result<(), TransportError> {
        match self.establish().await {
            Ok(connection) => {
                *self.connection.lock().await = Some(connection);
                *self.state.lock().await = LinkState::Connected;
                self.breaker.lock().await.record_success();
                self.spawn_supervisor();
                debug!("amqp connected");
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                *self.state.lock().await = LinkState::Disconnected;
                Err(err)
            }
        }
    }

    async fn establish(&self) -> Result<Connection, TransportError> {
        debug!("creating amqp connection...");

        if self.insecure {
            warn!("remote certificate validation is disabled for this connection");
        }

        let result = match &self.certificate {
            Some(certificate) => {
                Connection::connect_uri_with_config(
                    self.uri.clone(),
                    self.properties.clone(),
                    tls_config(certificate),
                )
                .await
            }
            None => Connection::connect_uri(self.uri.clone(), self.properties.clone()).await,
        };

        match result {
            Ok(connection) => {
                let notify = Arc::clone(&self.link_failed);
                connection.on_error(move |err| {
                    error!(error = err.to_string(), "connection failure detected");
                    // notify_one stores a permit, so a failure raised while
                    // the supervisor is busy elsewhere is not lost.
                    notify.notify_one();
                });
                Ok(connection)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn open_channel(&self) -> Result<PooledChannel, TransportError> {
        let guard = self.connection.lock().await;
        let Some(connection) = guard.as_ref() else {
            return Err(TransportError::ConnectionLost(
                "no live connection".to_owned(),
            ));
        };

        match connection.create_channel().await {
            Ok(channel) => {
                if self.confirms {
                    channel
                        .confirm_select(ConfirmSelectOptions { nowait: false })
                        .await
                        .map_err(TransportError::from)?;
                }
                debug!("channel created");
                Ok(PooledChannel::new(channel, self.confirms))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                self.link_failed.notify_one();
                Err(err.into())
            }
        }
    }

    fn spawn_supervisor(self: &Arc<Self>) {
        if self
            .supervisor_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.supervise().await });
    }

    /// Waits for link failures and re-handshakes until either the link is
    /// back or the grace period runs out.
    async fn supervise(self: Arc<Self>) {
        loop {
            self.link_failed.notified().await;

            {
                let mut state = self.state.lock().await;
                if *state != LinkState::Connected {
                    continue;
                }
                *state = LinkState::Recovering;
            }
            warn!("link failure detected, entering recovery");
            self.drop_link().await;

            let mut attempt: u32 = 0;
            loop {
                match self.establish().await {
                    Ok(connection) => {
                        *self.connection.lock().await = Some(connection);
                        self.breaker.lock().await.record_success();
                        *self.state.lock().await = LinkState::Connected;
                        debug!("amqp connection recovered");
                        break;
                    }
                    Err(err) => {
                        warn!(
                            error = err.to_string(),
                            attempt = attempt + 1,
                            "recovery attempt failed"
                        );
                        if self.note_recovery_failure().await {
                            return;
                        }
                        sleep(recovery_backoff(attempt)).await;
                        attempt = attempt.saturating_add(1);
                    }
                }
            }
        }
    }

    /// Clears the pooled channels and the dead connection after a failure.
    async fn drop_link(&self) {
        for channel in self.pool.lock().await.drain(..) {
            channel.discard();
        }
        *self.connection.lock().await = None;
    }

    /// Records one failed recovery attempt against the breaker.
    ///
    /// On the first failure past the grace period this faults the link and
    /// signals shutdown; the breaker guarantees that happens exactly once.
    pub(crate) async fn note_recovery_failure(&self) -> bool {
        let (tripped, downtime) = {
            let mut breaker = self.breaker.lock().await;
            (breaker.record_failure(), breaker.downtime())
        };
        if tripped {
            *self.state.lock().await = LinkState::Faulted;
            error!(
                downtime = ?downtime,
                grace_period = ?self.grace_period,
                "broker did not recover within the grace period, signalling shutdown"
            );
            let _ = self.shutdown_tx.send(true);
        }
        tripped
    }
}

fn tls_config(certificate: &ClientCertificate) -> OwnedTLSConfig {
    OwnedTLSConfig {
        identity: Some(OwnedIdentity {
            der: certificate.pkcs12_der.clone(),
            password: certificate.password.clone(),
        }),
        cert_chain: certificate.ca_chain_pem.clone(),
    }
}

fn recovery_backoff(attempt: u32) -> Duration {
    let factor = 2_u64.saturating_pow(attempt.min(10));
    let delay = RECOVERY_BACKOFF_BASE.saturating_mul(factor as u32);
    delay.min(RECOVERY_BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportOptions;

    fn manager_with_grace(grace: Duration) -> Arc<ConnectionManager> {
        let options = TransportOptions::default().circuit_breaker_grace_period(grace);
        ConnectionManager::new(&options).expect("valid options")
    }

    #[test]
    fn breaker_does_not_trip_inside_the_grace_period() {
        let mut breaker = CircuitBreaker::new(Duration::from_secs(60));
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(!breaker.tripped());
    }

    #[test]
    fn breaker_trips_exactly_once_after_the_grace_period() {
        let mut breaker = CircuitBreaker::new(Duration::from_millis(50));
        assert!(!breaker.record_failure());
        std::thread::sleep(Duration::from_millis(80));
        assert!(breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.tripped());
    }

    #[test]
    fn success_inside_the_window_resets_the_breaker() {
        let mut breaker = CircuitBreaker::new(Duration::from_millis(50));
        assert!(!breaker.record_failure());
        breaker.record_success();
        std::thread::sleep(Duration::from_millis(80));
        // The old window is gone; a new failure starts counting from now.
        assert!(!breaker.record_failure());
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(recovery_backoff(0), Duration::from_millis(100));
        assert_eq!(recovery_backoff(1), Duration::from_millis(200));
        assert_eq!(recovery_backoff(2), Duration::from_millis(400));
        assert_eq!(recovery_backoff(30), RECOVERY_BACKOFF_CAP);
    }

    #[tokio::test]
    async fn manager_starts_disconnected_with_no_shutdown_signal() {
        let manager = manager_with_grace(Duration::from_secs(60));
        assert_eq!(manager.state().await, LinkState::Disconnected);
        assert!(!*manager.shutdown_signal().borrow());
    }

    #[tokio::test]
    async fn shutdown_is_signalled_exactly_once() {
        let manager = manager_with_grace(Duration::from_millis(50));
        let mut shutdown = manager.shutdown_signal();

        assert!(!manager.note_recovery_failure().await);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(manager.note_recovery_failure().await);
        assert!(!manager.note_recovery_failure().await);

        shutdown.changed().await.expect("sender alive");
        assert!(*shutdown.borrow());
        assert_eq!(manager.state().await, LinkState::Faulted);
    }

    #[tokio::test]
    async fn faulted_manager_refuses_channel_requests() {
        let manager = manager_with_grace(Duration::from_millis(10));
        assert!(!manager.note_recovery_failure().await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(manager.note_recovery_failure().await);

        let result = manager.borrow_channel().await;
        assert!(matches!(result, Err(TransportError::CircuitTripped(_))));
    }

    #[tokio::test]
    async fn external_auth_is_reflected_in_the_uri() {
        let options = TransportOptions::default().use_external_auth_mechanism();
        let manager = ConnectionManager::new(&options).expect("valid options");
        assert_eq!(
            manager.uri.query.auth_mechanism,
            Some(SASLMechanism::External)
        );
    }
}
