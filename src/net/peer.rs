// Generic peer client
// Connects an application to the broker: handshake, dispatch, request correlation and reconnect

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::constants::{
    CONTROL_APPLICATION, FIELD_NAME, MAX_RECONNECT_TRIES, MAX_SUBSCRIBE_TRIES, REQUEST_REGISTER,
    REQUEST_SUBSCRIBE, REQUEST_TIMEOUT,
};
use crate::correlation::CorrelationManager;
use crate::error::PeerError;
use crate::net::connection::{spawn_writer, Connection, Frame, Outbound};
use crate::net::messages::{classify, Event, Extras, Message, Request, Response};
use crate::net::tls;

type EventCallback = Arc<dyn Fn(Event, PeerHandle) -> BoxFuture<'static, ()> + Send + Sync>;
type RequestCallback = Arc<dyn Fn(Request, PeerHandle) -> BoxFuture<'static, Response> + Send + Sync>;

/// Peer client configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Name used in logs
    pub name: String,
    /// Broker address as `host:port`
    pub address: String,
    /// Application name to register after connecting
    pub registration: Option<String>,
    /// Applications to subscribe after registering
    pub subscriptions: Vec<String>,
    /// CA certificate (PEM); connects over TLS when set
    pub tls_ca: Option<PathBuf>,
    pub max_reconnect_tries: u32,
    pub max_subscribe_tries: u32,
    pub request_timeout: Duration,
}

impl PeerConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        PeerConfig {
            name: name.into(),
            address: address.into(),
            registration: None,
            subscriptions: Vec::new(),
            tls_ca: None,
            max_reconnect_tries: MAX_RECONNECT_TRIES,
            max_subscribe_tries: MAX_SUBSCRIBE_TRIES,
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn register(mut self, application: impl Into<String>) -> Self {
        self.registration = Some(application.into());
        self
    }

    pub fn subscribe(mut self, application: impl Into<String>) -> Self {
        self.subscriptions.push(application.into());
        self
    }
}

/// State shared between the run loop and every handle
struct Shared {
    name: String,
    correlation: CorrelationManager,
    /// Outbound queue of the current connection, if any
    outbound: Mutex<Option<Outbound>>,
    ready: watch::Sender<bool>,
    shutdown: CancellationToken,
}

/// Cloneable handle for sending through a running peer
#[derive(Clone)]
pub struct PeerHandle {
    shared: Arc<Shared>,
}

impl PeerHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Mint a fresh message id
    pub fn next_id(&self) -> u64 {
        self.shared.correlation.next_id()
    }

    /// True once registration and subscriptions succeeded on the current connection
    pub fn is_ready(&self) -> bool {
        *self.shared.ready.borrow()
    }

    /// Wait until the peer is ready
    pub async fn wait_ready(&self) {
        let mut rx = self.shared.ready.subscribe();
        // The sender lives in `shared`, so the channel can't close here
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Stop the peer; `run` returns once the current connection is closed
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    /// Send a message without waiting for anything
    pub async fn send(&self, message: impl Into<Message>) -> Result<(), PeerError> {
        let message = message.into();
        let outbound = self
            .shared
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PeerError::NotConnected)?;

        debug!(peer = %self.shared.name, %message, "Message send");
        outbound
            .send(message.to_line())
            .await
            .map_err(|_| PeerError::NotConnected)
    }

    /// Send a request and wait for its response.
    ///
    /// A response with status error becomes `PeerError::Status`, no response
    /// within the request timeout becomes `PeerError::Timeout`.
    pub async fn send_wait(&self, request: Request) -> Result<Response, PeerError> {
        let pending = self.shared.correlation.await_response(request.id);
        self.send(request).await?;

        let response = pending.wait().await?;
        if response.is_ok() {
            Ok(response)
        } else {
            Err(PeerError::Status {
                id: response.id,
                error: response.error,
            })
        }
    }

    /// Build a request with a fresh id and `send_wait` it
    pub async fn request(
        &self,
        application: &str,
        request_type: &str,
        extras: Extras,
    ) -> Result<Response, PeerError> {
        let mut request = Request::new(application, request_type, self.next_id());
        request.extras = extras;
        self.send_wait(request).await
    }
}

/// Builder collecting the callbacks of a peer
pub struct PeerBuilder {
    config: PeerConfig,
    events: HashMap<String, EventCallback>,
    requests: HashMap<String, RequestCallback>,
}

impl PeerBuilder {
    /// Handle events with the given update-type
    pub fn on_event<F, Fut>(mut self, update_type: impl Into<String>, callback: F) -> Self
    where
        F: Fn(Event, PeerHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: EventCallback = Arc::new(move |event, handle| callback(event, handle).boxed());
        self.events.insert(update_type.into(), callback);
        self
    }

    /// Answer requests with the given request-type; the returned response is
    /// sent back under the request's message-id
    pub fn on_request<F, Fut>(mut self, request_type: impl Into<String>, callback: F) -> Self
    where
        F: Fn(Request, PeerHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        let callback: RequestCallback =
            Arc::new(move |request, handle| callback(request, handle).boxed());
        self.requests.insert(request_type.into(), callback);
        self
    }

    pub fn build(self) -> Peer {
        let (ready, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            name: self.config.name.clone(),
            correlation: CorrelationManager::with_timeout(self.config.request_timeout),
            outbound: Mutex::new(None),
            ready,
            shutdown: CancellationToken::new(),
        });

        Peer {
            config: self.config,
            events: self.events,
            requests: self.requests,
            handle: PeerHandle { shared },
        }
    }
}

/// A broker client application
pub struct Peer {
    config: PeerConfig,
    events: HashMap<String, EventCallback>,
    requests: HashMap<String, RequestCallback>,
    handle: PeerHandle,
}

impl Peer {
    pub fn builder(config: PeerConfig) -> PeerBuilder {
        PeerBuilder {
            config,
            events: HashMap::new(),
            requests: HashMap::new(),
        }
    }

    pub fn handle(&self) -> PeerHandle {
        self.handle.clone()
    }

    /// Connect and serve until shut down.
    ///
    /// Lost connections are re-established with exponential backoff. Returns
    /// an error when the handshake is rejected or the reconnect tries are
    /// used up.
    pub async fn run(self) -> Result<(), PeerError> {
        let connector = match &self.config.tls_ca {
            Some(ca) => Some(tls::client_connector(ca)?),
            None => None,
        };
        let shutdown = self.handle.shared.shutdown.clone();
        let mut backoff = ExponentialBackoff::default();
        let mut reconnect_tries = 0u32;

        info!(peer = %self.config.name, address = %self.config.address, "Starting peer");

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            match self.connect(connector.as_ref()).await {
                Ok(connection) => {
                    info!(peer = %self.config.name, address = %connection.peer_addr(), "Connected to broker");
                    reconnect_tries = 0;
                    backoff.reset();

                    let result = self.session(connection).await;
                    self.disconnected();
                    match result {
                        Ok(()) => debug!(peer = %self.config.name, "Connection closed"),
                        Err(e @ (PeerError::Register(_) | PeerError::Subscribe(_))) => {
                            error!(peer = %self.config.name, error = %e, "Handshake failed");
                            return Err(e);
                        }
                        Err(e) => debug!(peer = %self.config.name, error = %e, "Connection lost"),
                    }
                }
                Err(e) => {
                    debug!(peer = %self.config.name, address = %self.config.address, error = %e, "Can't connect");
                }
            }

            if shutdown.is_cancelled() {
                return Ok(());
            }
            if reconnect_tries >= self.config.max_reconnect_tries {
                warn!(peer = %self.config.name, tries = reconnect_tries, "Giving up reconnecting");
                return Err(PeerError::ReconnectExhausted(self.config.max_reconnect_tries));
            }

            reconnect_tries += 1;
            let delay = backoff.delay();
            debug!(peer = %self.config.name, try_number = reconnect_tries, ?delay, "Reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }

    async fn connect(&self, connector: Option<&TlsConnector>) -> Result<Connection, PeerError> {
        let stream = TcpStream::connect(&self.config.address).await?;
        let peer_addr: SocketAddr = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        match connector {
            Some(connector) => {
                let server_name = tls::server_name(&self.config.address)?;
                let stream = connector.connect(server_name, stream).await?;
                Ok(Connection::new(stream, peer_addr))
            }
            None => Ok(Connection::new(stream, peer_addr)),
        }
    }

    /// Serve one connection: the handshake runs alongside the read loop,
    /// since its responses arrive through it
    async fn session(&self, connection: Connection) -> Result<(), PeerError> {
        let (mut reader, writer) = connection.into_split();
        let (outbound, _writer_task) = spawn_writer(writer, self.config.name.clone());
        *self
            .handle
            .shared
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outbound);

        let shutdown = self.handle.shared.shutdown.clone();
        let handshake = self.handshake();
        tokio::pin!(handshake);
        let mut handshake_done = false;

        loop {
            tokio::select! {
                result = &mut handshake, if !handshake_done => {
                    handshake_done = true;
                    result?;
                    self.handle.shared.ready.send_replace(true);
                    info!(peer = %self.config.name, "Peer ready");
                }
                frame = reader.read_frame() => {
                    match frame? {
                        Some(Frame::Line(line)) => self.dispatch(&line).await,
                        Some(Frame::Rejected(e)) => {
                            warn!(peer = %self.config.name, error = %e, "Dropping unreadable frame");
                        }
                        None => return Ok(()),
                    }
                }
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }

    fn disconnected(&self) {
        let shared = &self.handle.shared;
        shared.ready.send_replace(false);
        shared
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // Nothing can answer requests sent over the old connection
        shared.correlation.clear();
    }

    /// Register, then subscribe every configured application
    async fn handshake(&self) -> Result<(), PeerError> {
        if let Some(application) = &self.config.registration {
            let request = Request::new(CONTROL_APPLICATION, REQUEST_REGISTER, self.handle.next_id())
                .with(FIELD_NAME, application.as_str());

            match self.handle.send_wait(request).await {
                Ok(_) => info!(peer = %self.config.name, %application, "Registered"),
                Err(PeerError::Timeout { .. }) => {
                    return Err(PeerError::Register(format!(
                        "Can't register {}. No response from {}",
                        application, CONTROL_APPLICATION
                    )))
                }
                Err(PeerError::Status { error, .. }) => {
                    return Err(PeerError::Register(format!(
                        "Can't register {}. error: {}",
                        application, error
                    )))
                }
                Err(e) => return Err(e),
            }
        }

        self.subscribe_all().await
    }

    /// Subscribe with backoff; only names not yet subscribed are retried
    async fn subscribe_all(&self) -> Result<(), PeerError> {
        let mut remaining: Vec<&str> = self.config.subscriptions.iter().map(String::as_str).collect();
        let mut backoff = ExponentialBackoff::default();
        let mut tries = 0u32;

        while !remaining.is_empty() {
            let application = remaining[0];
            let request = Request::new(CONTROL_APPLICATION, REQUEST_SUBSCRIBE, self.handle.next_id())
                .with(FIELD_NAME, application);

            match self.handle.send_wait(request).await {
                Ok(_) => {
                    info!(peer = %self.config.name, %application, "Subscribed");
                    remaining.remove(0);
                }
                Err(e @ (PeerError::Timeout { .. } | PeerError::Status { .. })) => {
                    debug!(peer = %self.config.name, %application, error = %e, "Subscribe failed");
                    tries += 1;
                    if tries >= self.config.max_subscribe_tries {
                        return Err(PeerError::Subscribe(format!(
                            "Can't subscribe {:?}. Max. tries reached",
                            remaining
                        )));
                    }
                    tokio::time::sleep(backoff.delay()).await;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Route one inbound frame
    async fn dispatch(&self, line: &str) {
        let message = match classify(line) {
            Ok(message) => message,
            Err(e) => {
                error!(peer = %self.config.name, error = %e, message = %line, "Received invalid message");
                return;
            }
        };
        debug!(peer = %self.config.name, %message, "Message received");

        match message {
            Message::Event(event) => match self.events.get(&event.update_type) {
                Some(callback) => {
                    tokio::spawn(callback(event, self.handle()));
                }
                None => debug!(peer = %self.config.name, update_type = %event.update_type, "Unknown update-type"),
            },
            Message::Request(request) => {
                let id = request.id;
                match self.requests.get(&request.request_type) {
                    Some(callback) => {
                        let handle = self.handle();
                        let reply = callback(request, handle.clone());
                        tokio::spawn(async move {
                            let mut response = reply.await;
                            response.id = Some(id);
                            if let Err(e) = handle.send(response).await {
                                debug!(peer = %handle.name(), error = %e, "Can't send response");
                            }
                        });
                    }
                    None => {
                        debug!(peer = %self.config.name, request_type = %request.request_type, "Unknown request-type");
                        let response = Response::error(
                            format!("Invalid request-type: {}", request.request_type),
                            Some(id),
                        );
                        if let Err(e) = self.handle.send(response).await {
                            debug!(peer = %self.config.name, error = %e, "Can't send response");
                        }
                    }
                }
            }
            Message::Response(response) => match response.id {
                Some(_) => self.handle.shared.correlation.resolve(response),
                None => error!(peer = %self.config.name, error = %response.error, "Error from broker"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::net::listener::TcpServer;

    async fn start_broker() -> (TcpServer, Arc<Broker>) {
        let broker = Arc::new(Broker::new());
        let server = TcpServer::start("127.0.0.1:0".parse().unwrap(), Arc::clone(&broker), None)
            .await
            .unwrap();
        (server, broker)
    }

    #[test]
    fn test_config_defaults() {
        let config = PeerConfig::new("obs", "127.0.0.1:4445")
            .register("OBS")
            .subscribe("Heart Rate")
            .subscribe("Twitch");
        assert_eq!(config.registration.as_deref(), Some("OBS"));
        assert_eq!(config.subscriptions, vec!["Heart Rate", "Twitch"]);
        assert_eq!(config.max_reconnect_tries, 480);
        assert_eq!(config.request_timeout, Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let peer = Peer::builder(PeerConfig::new("p", "127.0.0.1:1")).build();
        let handle = peer.handle();
        assert!(!handle.is_ready());
        assert!(matches!(
            handle.send(Event::new("Ping")).await,
            Err(PeerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_gives_up() {
        // Bind and drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut config = PeerConfig::new("p", address);
        config.max_reconnect_tries = 0;
        let result = Peer::builder(config).build().run().await;
        assert!(matches!(result, Err(PeerError::ReconnectExhausted(0))));
    }

    #[tokio::test]
    async fn test_handshake_and_ready() {
        let (server, broker) = start_broker().await;
        let address = server.addr().to_string();

        let owner = Peer::builder(PeerConfig::new("owner", address.clone()).register("App1")).build();
        let owner_handle = owner.handle();
        let owner_task = tokio::spawn(owner.run());
        owner_handle.wait_ready().await;

        let subscriber =
            Peer::builder(PeerConfig::new("subscriber", address).subscribe("App1")).build();
        let handle = subscriber.handle();
        let task = tokio::spawn(subscriber.run());
        tokio::time::timeout(Duration::from_secs(2), handle.wait_ready())
            .await
            .unwrap();
        assert!(handle.is_ready());
        assert_eq!(broker.status().await.applications, vec!["App1".to_string()]);

        handle.shutdown();
        owner_handle.shutdown();
        assert!(task.await.unwrap().is_ok());
        assert!(owner_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_fatal() {
        let (server, _broker) = start_broker().await;
        let address = server.addr().to_string();

        let first = Peer::builder(PeerConfig::new("first", address.clone()).register("App1")).build();
        let first_handle = first.handle();
        tokio::spawn(first.run());
        first_handle.wait_ready().await;

        let second = Peer::builder(PeerConfig::new("second", address).register("App1")).build();
        match second.run().await {
            Err(PeerError::Register(text)) => assert!(text.contains("App1 is already registered")),
            other => panic!("Expected Register error, got {other:?}"),
        }
        first_handle.shutdown();
    }

    #[tokio::test]
    async fn test_request_callback_answers() {
        let (server, _broker) = start_broker().await;
        let address = server.addr().to_string();

        let owner = Peer::builder(PeerConfig::new("owner", address.clone()).register("App1"))
            .on_request("GetScene", |_request, _handle| async move {
                Response::ok(0).with("scene-name", "Live")
            })
            .build();
        let owner_handle = owner.handle();
        tokio::spawn(owner.run());
        owner_handle.wait_ready().await;

        let client = Peer::builder(PeerConfig::new("client", address).subscribe("App1")).build();
        let handle = client.handle();
        tokio::spawn(client.run());
        handle.wait_ready().await;

        let response = handle.request("App1", "GetScene", Extras::new()).await.unwrap();
        assert_eq!(response.extras["scene-name"], "Live");

        match handle.request("App1", "Unknown", Extras::new()).await {
            Err(PeerError::Status { error, .. }) => assert_eq!(error, "Invalid request-type: Unknown"),
            other => panic!("Expected Status error, got {other:?}"),
        }

        handle.shutdown();
        owner_handle.shutdown();
    }
}
