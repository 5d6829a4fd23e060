//! Main relay coordination.
//!
//! [`Relay`] wires the registry, router, acknowledgment engine and call engine
//! together in dependency order, so every component is live before anything
//! can reach it. Sessions hold an `Arc<Relay>` and go through it for all
//! shared state.

use crate::ack::{AckEngine, AckPolicy, ACK_ID_FIELD};
use crate::auth::{StaticTokenVerifier, TokenVerifier};
use crate::call::CallEngine;
use crate::config::Config;
use crate::directory::{LineDirectory, StaticLineDirectory};
use crate::error::AuthError;
use crate::limits::RateLimits;
use crate::metrics::RelayMetrics;
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::router::Router;
use crate::session::Session;
use crate::storage::{CallHistorySink, DeliveryFailureSink, LogSink, SqliteStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_types::{EndpointKind, Frame, Group, HelloNotice, Identity, ServerEvent};
use tokio::sync::mpsc;

/// Undelivered events replayed to a reconnecting mirror, per connect.
const REPLAY_BATCH: u32 = 100;

/// Main relay.
pub struct Relay {
    config: Config,
    registry: Arc<ConnectionRegistry>,
    router: Arc<Router>,
    acks: AckEngine,
    calls: CallEngine,
    verifier: Arc<dyn TokenVerifier>,
    rate_limits: RateLimits,
    metrics: Arc<RelayMetrics>,
    store: Option<Arc<SqliteStore>>,
    started_at: Instant,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("config", &self.config)
            .field("connections", &self.registry.len())
            .field("calls", &self.calls.active_count())
            .field("pending_acks", &self.acks.pending_count())
            .field("rate_limits", &self.rate_limits)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Relay`]. Collaborators default to the config-backed
/// verifier and directory and to log-only sinks.
pub struct RelayBuilder {
    config: Config,
    verifier: Option<Arc<dyn TokenVerifier>>,
    directory: Option<Arc<dyn LineDirectory>>,
    history: Option<Arc<dyn CallHistorySink>>,
    failures: Option<Arc<dyn DeliveryFailureSink>>,
    store: Option<Arc<SqliteStore>>,
}

impl RelayBuilder {
    /// Start from a configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            verifier: None,
            directory: None,
            history: None,
            failures: None,
            store: None,
        }
    }

    /// Use a custom identity verifier.
    pub fn verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Use a custom line/contact directory.
    pub fn directory(mut self, directory: Arc<dyn LineDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Send finished calls to `sink`.
    pub fn history_sink(mut self, sink: Arc<dyn CallHistorySink>) -> Self {
        self.history = Some(sink);
        self
    }

    /// Send exhausted deliveries to `sink`.
    pub fn failure_sink(mut self, sink: Arc<dyn DeliveryFailureSink>) -> Self {
        self.failures = Some(sink);
        self
    }

    /// Use a SQLite store for both sinks and for undelivered replay.
    pub fn store(mut self, store: Arc<SqliteStore>) -> Self {
        self.history = Some(store.clone());
        self.failures = Some(store.clone());
        self.store = Some(store);
        self
    }

    /// Build the relay. Components come up in order: registry, router,
    /// acknowledgment engine, call engine.
    pub fn build(self) -> Relay {
        let config = self.config;
        let metrics = Arc::new(RelayMetrics::default());

        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(Router::new(registry.clone(), metrics.clone()));
        let acks = AckEngine::new(
            router.clone(),
            AckPolicy::from(&config.ack),
            self.failures.unwrap_or_else(|| Arc::new(LogSink)),
            metrics.clone(),
        );
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(StaticLineDirectory::from_config(&config.lines)));
        let calls = CallEngine::new(
            registry.clone(),
            router.clone(),
            directory,
            self.history.unwrap_or_else(|| Arc::new(LogSink)),
            Duration::from_millis(config.calls.enrichment_timeout_ms),
            metrics.clone(),
        );
        let verifier = self
            .verifier
            .unwrap_or_else(|| Arc::new(StaticTokenVerifier::from_config(&config.auth.tokens)));
        let rate_limits = RateLimits::new(&config.limits);

        Relay {
            config,
            registry,
            router,
            acks,
            calls,
            verifier,
            rate_limits,
            metrics,
            store: self.store,
            started_at: Instant::now(),
        }
    }
}

impl Relay {
    /// Start building a relay.
    pub fn builder(config: Config) -> RelayBuilder {
        RelayBuilder::new(config)
    }

    /// Relay with default collaborators and no store.
    pub fn new(config: Config) -> Self {
        RelayBuilder::new(config).build()
    }

    /// Verify a handshake credential and admit the identity.
    ///
    /// Any error means the transport must be closed without registering.
    pub async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        let result = self.admit(token).await;
        if let Err(e) = &result {
            RelayMetrics::incr(&self.metrics.auth_failures_total);
            tracing::warn!("Handshake rejected: {}", e);
        }
        result
    }

    async fn admit(&self, token: &str) -> Result<Identity, AuthError> {
        let identity = self.verifier.verify(token).await?;
        identity
            .validate()
            .map_err(|e| AuthError::IdentityRejected(e.to_string()))?;

        if let Err(e) = self.rate_limits.check_connection(&identity.user_id) {
            RelayMetrics::incr(&self.metrics.rate_limit_hits);
            return Err(AuthError::Refused(e.to_string()));
        }
        // Early refusal only; the slot itself is taken in `open_session`.
        if self.registry.len() >= self.config.limits.max_concurrent_connections {
            return Err(AuthError::Refused("relay at capacity".to_string()));
        }
        Ok(identity)
    }

    /// Register a connection for a verified identity and greet it.
    ///
    /// Returns the session driving inbound events and the receiver its writer
    /// must drain. A reconnecting mirror also gets any undelivered events
    /// replayed from the store. Fails with [`AuthError::Refused`] when the
    /// relay filled up after [`Relay::authenticate`] admitted the identity.
    pub fn open_session(
        self: &Arc<Self>,
        identity: Identity,
    ) -> Result<(Session, mpsc::Receiver<Arc<Frame>>), AuthError> {
        let (handle, rx) = ConnectionHandle::new(identity, self.config.server.outbound_buffer);
        if let Err(handle) = self
            .registry
            .try_register(handle.clone(), self.config.limits.max_concurrent_connections)
        {
            RelayMetrics::incr(&self.metrics.auth_failures_total);
            tracing::warn!(
                user_id = %handle.identity().user_id,
                "Connection refused: relay at capacity"
            );
            return Err(AuthError::Refused("relay at capacity".to_string()));
        }
        RelayMetrics::incr(&self.metrics.connections_total);

        tracing::info!(
            connection_id = %handle.id(),
            user_id = %handle.identity().user_id,
            kind = %handle.identity().kind,
            "Connection registered"
        );

        let hello = HelloNotice {
            connection_id: handle.id(),
            identity: handle.identity().clone(),
        };
        self.router.send_to(&handle.id(), &ServerEvent::Hello(hello));

        if handle.identity().kind == EndpointKind::Mirror && self.store.is_some() {
            let relay = self.clone();
            let group = Group::mirrors(&handle.identity().user_id);
            tokio::spawn(async move { relay.replay_undelivered(group).await });
        }

        Ok((Session::new(self.clone(), handle), rx))
    }

    /// Re-emit stored undelivered events for `group` with a fresh ack cycle.
    pub async fn replay_undelivered(&self, group: Group) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let events = match store.undelivered_for_group(&group, REPLAY_BATCH).await {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(group = %group, "Failed to load undelivered events: {}", e);
                return 0;
            }
        };

        let mut replayed = 0;
        for event in events {
            match store.remove_undelivered(&event.ack_id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(ack_id = %event.ack_id, "Failed to claim undelivered event: {}", e);
                    continue;
                }
            }
            let serde_json::Value::Object(mut payload) = event.payload else {
                tracing::warn!(ack_id = %event.ack_id, "Dropping undelivered event with non-object payload");
                continue;
            };
            payload.remove(ACK_ID_FIELD);
            self.acks
                .emit_with_ack(group.clone(), &event.event_name, payload, self.config.ack.timeout());
            replayed += 1;
        }

        if replayed > 0 {
            tracing::info!(group = %group, replayed, "Replayed undelivered events");
        }
        replayed
    }

    /// Relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Group router.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Acknowledgment engine.
    pub fn acks(&self) -> &AckEngine {
        &self.acks
    }

    /// Call engine.
    pub fn calls(&self) -> &CallEngine {
        &self.calls
    }

    /// Rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// SQLite store, when configured.
    pub fn store(&self) -> Option<&Arc<SqliteStore>> {
        self.store.as_ref()
    }

    /// Seconds since the relay was built.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
