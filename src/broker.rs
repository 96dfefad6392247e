// Broker - shared state behind every client connection
// Owns the application registry, the live-connection set and forwarded-request correlation

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::constants::{EVENT_UNSUBSCRIBED_FROM, FIELD_NAME};
use crate::correlation::CorrelationManager;
use crate::error::{CorrelationError, ForwardError, RegistryError};
use crate::net::client::ClientState;
use crate::net::connection::Outbound;
use crate::net::messages::{Event, Message, Request, Response};
use crate::registry::{ClientId, Registry};

/// Point-in-time view of the broker for status logging
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatus {
    pub connections: usize,
    pub applications: Vec<String>,
    pub pending_requests: usize,
}

/// Broker shared by all connection tasks
///
/// The registry is the only shared mutable domain state; every registry
/// operation runs under a single write lock. Frames to other connections are
/// enqueued on their outbound queues, never written to sockets directly.
pub struct Broker {
    registry: RwLock<Registry>,
    /// Live connections and their outbound queues
    clients: RwLock<HashMap<ClientId, Outbound>>,
    correlation: CorrelationManager,
    next_client_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self::with_correlation(CorrelationManager::new())
    }

    /// Broker whose forwarded requests time out after `timeout`
    pub fn with_request_timeout(timeout: Duration) -> Self {
        Self::with_correlation(CorrelationManager::with_timeout(timeout))
    }

    fn with_correlation(correlation: CorrelationManager) -> Self {
        Broker {
            registry: RwLock::new(Registry::new()),
            clients: RwLock::new(HashMap::new()),
            correlation,
            next_client_id: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelled when the broker shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel every connection task and pending forward
    pub fn shutdown(&self) {
        info!("Broker shutting down");
        self.shutdown.cancel();
        self.correlation.clear();
    }

    /// Add a connection to the live set in state Pending
    pub async fn connect(&self, outbound: Outbound) -> ClientId {
        let client = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.registry.write().await.add_client(client);
        self.clients.write().await.insert(client, outbound);
        info!(client, "Client connected");
        client
    }

    /// Tear down a connection.
    ///
    /// Its registration is unregistered (notifying subscribers), its own
    /// subscriptions are dropped, then it leaves the live set.
    pub async fn disconnect(&self, client: ClientId) {
        let registration = self
            .registry
            .read()
            .await
            .registration_of(client)
            .map(str::to_string);

        if let Some(name) = registration {
            if let Err(e) = self.unregister(client, &name).await {
                debug!(client, error = %e, "Unregister on disconnect failed");
            }
        }

        {
            let mut registry = self.registry.write().await;
            for name in registry.subscriptions_of(client) {
                if let Err(e) = registry.unsubscribe(client, &name) {
                    debug!(client, error = %e, "Unsubscribe on disconnect failed");
                }
            }
            registry.remove_client(client);
        }

        self.clients.write().await.remove(&client);
        info!(client, "Client disconnected");
    }

    pub async fn client_state(&self, client: ClientId) -> ClientState {
        self.registry.read().await.state_of(client)
    }

    pub async fn register(&self, client: ClientId, name: &str) -> Result<ClientState, RegistryError> {
        let state = self.registry.write().await.register(client, name)?;
        info!(client, application = name, "Application registered");
        Ok(state)
    }

    /// Unregister `name` and tell each former subscriber with `UnsubscribedFrom`
    pub async fn unregister(&self, client: ClientId, name: &str) -> Result<ClientState, RegistryError> {
        let (subscribers, state) = {
            let mut registry = self.registry.write().await;
            let subscribers = registry.unregister(client, name)?;
            (subscribers, registry.state_of(client))
        };
        info!(client, application = name, subscribers = subscribers.len(), "Application unregistered");

        if !subscribers.is_empty() {
            let event: Message = Event::new(EVENT_UNSUBSCRIBED_FROM)
                .with(FIELD_NAME, name)
                .into();
            self.broadcast(&subscribers, &event).await;
        }

        Ok(state)
    }

    pub async fn subscribe(&self, client: ClientId, name: &str) -> Result<ClientState, RegistryError> {
        let state = self.registry.write().await.subscribe(client, name)?;
        debug!(client, application = name, "Subscribed");
        Ok(state)
    }

    pub async fn unsubscribe(&self, client: ClientId, name: &str) -> Result<ClientState, RegistryError> {
        let state = self.registry.write().await.unsubscribe(client, name)?;
        debug!(client, application = name, "Unsubscribed");
        Ok(state)
    }

    /// Forward `request` from `client` to the owner of `request.application`.
    ///
    /// The request goes out under a fresh correlation id. The matching
    /// response (or a timeout error) is delivered back to `client` under the
    /// original id by a waiter task.
    pub async fn forward_request(
        self: &Arc<Self>,
        client: ClientId,
        mut request: Request,
    ) -> Result<(), ForwardError> {
        let application = request.application.clone();
        let target = {
            let registry = self.registry.read().await;
            if !registry.is_subscribed(client, &application) {
                return Err(ForwardError::NotSubscribed(application));
            }
            registry.owner_of(&application)
        }
        .ok_or_else(|| ForwardError::Unavailable(application.clone()))?;

        let original_id = request.id;
        request.id = self.correlation.next_id();
        let forwarded_id = request.id;
        let pending = self.correlation.await_response(forwarded_id);

        if !self.send_to(target, &Message::Request(request)).await {
            return Err(ForwardError::Unavailable(application));
        }
        debug!(client, target, application = %application, original_id, forwarded_id, "Request forwarded");

        let broker = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = pending.wait() => outcome,
                _ = shutdown.cancelled() => return,
            };

            let reply = match outcome {
                Ok(mut response) => {
                    response.id = Some(original_id);
                    response
                }
                Err(CorrelationError::Timeout { .. }) => {
                    debug!(client, application = %application, original_id, "Forwarded request timed out");
                    Response::error(format!("Request to {} timed out", application), Some(original_id))
                }
                Err(CorrelationError::Cancelled { .. }) => return,
            };
            broker.send_to(client, &Message::Response(reply)).await;
        });

        Ok(())
    }

    /// Fan `event` out to every subscriber of `client`'s registration
    pub async fn publish_event(&self, client: ClientId, event: Event) {
        let subscribers = self
            .registry
            .read()
            .await
            .subscribers_of_registration(client);
        debug!(client, update_type = %event.update_type, subscribers = subscribers.len(), "Publishing event");
        if !subscribers.is_empty() {
            self.broadcast(&subscribers, &Message::Event(event)).await;
        }
    }

    /// Hand a response from a target application to the waiting forward
    pub fn deliver_response(&self, response: Response) {
        self.correlation.resolve(response);
    }

    /// Enqueue `message` for `client`; false if the client is gone
    pub async fn send_to(&self, client: ClientId, message: &Message) -> bool {
        let outbound = self.clients.read().await.get(&client).cloned();
        let Some(outbound) = outbound else {
            debug!(client, "Can't send. Client is not connected");
            return false;
        };
        if outbound.send(message.to_line()).await.is_err() {
            debug!(client, "Can't send. Connection is closed");
            return false;
        }
        true
    }

    /// Send `message` to all `targets` concurrently; individual failures are
    /// logged and don't affect the other deliveries
    pub async fn broadcast(&self, targets: &[ClientId], message: &Message) {
        let line = message.to_line();
        let outbounds: Vec<(ClientId, Outbound)> = {
            let clients = self.clients.read().await;
            targets
                .iter()
                .filter_map(|id| clients.get(id).map(|tx| (*id, tx.clone())))
                .collect()
        };

        let sends = outbounds.into_iter().map(|(id, tx)| {
            let line = line.clone();
            async move {
                if tx.send(line).await.is_err() {
                    debug!(client = id, "Broadcast skipped closed connection");
                }
            }
        });
        join_all(sends).await;
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.correlation.pending_count()
    }

    pub async fn status(&self) -> BrokerStatus {
        let mut applications = self.registry.read().await.application_names();
        applications.sort();
        BrokerStatus {
            connections: self.connection_count().await,
            applications,
            pending_requests: self.pending_requests(),
        }
    }

    /// Log a status line every `interval` until shutdown
    pub async fn run_status_log(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match serde_json::to_string(&self.status().await) {
                        Ok(status) => info!(%status, "Status"),
                        Err(e) => debug!(error = %e, "Status not serializable"),
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
    }
}
