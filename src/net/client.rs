// Broker-side client handler
// Per-connection state machine: classifies inbound frames and dispatches them by state

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::broker::Broker;
use crate::constants::{
    CONTROL_APPLICATION, FIELD_NAME, REQUEST_REGISTER, REQUEST_SUBSCRIBE, REQUEST_UNREGISTER,
    REQUEST_UNSUBSCRIBE,
};
use crate::error::MessageError;
use crate::net::connection::{Frame, LineReader, Outbound};
use crate::net::messages::{classify, Message, MessageKind, Request, Response};
use crate::registry::ClientId;

/// State of a client connection, derived from its registry membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// No registration, no subscriptions
    Pending,
    /// Registration, no subscriptions
    Registered,
    /// Subscriptions, no registration
    Subscribed,
    /// Both
    SubscribedAndRegistered,
}

/// What to do with an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Request to the broker-control application
    Control,
    /// Request forwarded to a subscribed application
    Forward,
    /// Request to an application while holding no subscriptions
    NoSubscriptions,
    /// Event fanned out to the registration's subscribers
    Publish,
    /// Response completing a forwarded request
    Resolve,
    /// Message kind not accepted in this state
    Reject,
}

impl ClientState {
    /// Pure function of the two membership flags
    pub fn derive(has_registration: bool, has_subscriptions: bool) -> Self {
        match (has_registration, has_subscriptions) {
            (false, false) => ClientState::Pending,
            (true, false) => ClientState::Registered,
            (false, true) => ClientState::Subscribed,
            (true, true) => ClientState::SubscribedAndRegistered,
        }
    }

    pub fn has_registration(self) -> bool {
        matches!(self, ClientState::Registered | ClientState::SubscribedAndRegistered)
    }

    pub fn has_subscriptions(self) -> bool {
        matches!(self, ClientState::Subscribed | ClientState::SubscribedAndRegistered)
    }

    /// Without a registration nothing but requests is accepted
    pub fn accepts_only_requests(self) -> bool {
        !self.has_registration()
    }

    /// Dispatch table keyed on state and message kind
    pub fn route(self, kind: MessageKind, to_control: bool) -> Route {
        use ClientState::*;

        match (self, kind) {
            (_, MessageKind::Request) if to_control => Route::Control,
            (Subscribed | SubscribedAndRegistered, MessageKind::Request) => Route::Forward,
            (Pending | Registered, MessageKind::Request) => Route::NoSubscriptions,
            (Registered | SubscribedAndRegistered, MessageKind::Event) => Route::Publish,
            (Registered | SubscribedAndRegistered, MessageKind::Response) => Route::Resolve,
            (Pending | Subscribed, MessageKind::Event | MessageKind::Response) => Route::Reject,
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Broker-control operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlOp {
    Register,
    Unregister,
    Subscribe,
    Unsubscribe,
}

impl ControlOp {
    fn parse(request_type: &str) -> Option<Self> {
        match request_type {
            REQUEST_REGISTER => Some(ControlOp::Register),
            REQUEST_UNREGISTER => Some(ControlOp::Unregister),
            REQUEST_SUBSCRIBE => Some(ControlOp::Subscribe),
            REQUEST_UNSUBSCRIBE => Some(ControlOp::Unsubscribe),
            _ => None,
        }
    }
}

/// One connected client as seen by the broker
pub struct BrokerClient {
    id: ClientId,
    broker: Arc<Broker>,
    outbound: Outbound,
}

impl BrokerClient {
    /// Join the broker's live set in state Pending
    pub async fn connect(broker: Arc<Broker>, outbound: Outbound) -> Self {
        let id = broker.connect(outbound.clone()).await;
        BrokerClient {
            id,
            broker,
            outbound,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub async fn state(&self) -> ClientState {
        self.broker.client_state(self.id).await
    }

    /// Read loop.
    ///
    /// Frames are handled one at a time in receipt order. A bad frame never
    /// ends the loop; only EOF, a read error or broker shutdown does. The
    /// client is then torn down through the broker.
    pub async fn run(self, mut reader: LineReader) {
        let shutdown = self.broker.shutdown_token();

        loop {
            tokio::select! {
                result = reader.read_frame() => {
                    match result {
                        Ok(Some(Frame::Line(line))) => {
                            debug!(client = self.id, message = %line, "Message received");
                            self.handle_message(&line).await;
                        }
                        Ok(Some(Frame::Rejected(e))) => self.reject_frame(e).await,
                        Ok(None) => {
                            debug!(client = self.id, "Client EOF");
                            break;
                        }
                        Err(e) => {
                            info!(client = self.id, error = %e, "Connection closed");
                            break;
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!(client = self.id, "Closing connection on shutdown");
                    break;
                }
            }
        }

        self.broker.disconnect(self.id).await;
    }

    /// Handle one inbound frame according to the current state
    pub async fn handle_message(&self, line: &str) {
        let state = self.state().await;

        if state.accepts_only_requests() {
            match Request::parse(line) {
                Ok(request) => self.handle_request(state, request).await,
                Err(e) => {
                    debug!(client = self.id, %state, error = %e, "Only requests allowed");
                    self.reply(Response::error(
                        format!("Only requests allowed. {}", e),
                        e.message_id(),
                    ))
                    .await;
                }
            }
            return;
        }

        match classify(line) {
            Ok(Message::Request(request)) => self.handle_request(state, request).await,
            Ok(Message::Event(event)) => match state.route(MessageKind::Event, false) {
                Route::Publish => self.broker.publish_event(self.id, event).await,
                _ => self.reply_invalid().await,
            },
            Ok(Message::Response(response)) => match state.route(MessageKind::Response, false) {
                Route::Resolve => self.broker.deliver_response(response),
                _ => self.reply_invalid().await,
            },
            Err(e) => {
                debug!(client = self.id, %state, error = %e, "Invalid message");
                self.reply_invalid().await;
            }
        }
    }

    /// Answer a frame that never reached the parser
    pub async fn reject_frame(&self, error: MessageError) {
        let state = self.state().await;
        debug!(client = self.id, %state, %error, "Rejected frame");

        if state.accepts_only_requests() {
            self.reply(Response::error(format!("Only requests allowed. {}", error), None))
                .await;
        } else {
            self.reply_invalid().await;
        }
    }

    async fn handle_request(&self, state: ClientState, request: Request) {
        let to_control = request.application == CONTROL_APPLICATION;

        match state.route(MessageKind::Request, to_control) {
            Route::Control => {
                let response = self.handle_control(&request).await;
                self.reply(response).await;
            }
            Route::Forward => {
                let id = request.id;
                if let Err(e) = self.broker.forward_request(self.id, request).await {
                    debug!(client = self.id, error = %e, "Request not forwarded");
                    self.reply(Response::error(e.to_string(), Some(id))).await;
                }
            }
            Route::NoSubscriptions => {
                debug!(client = self.id, application = %request.application, "Request without subscriptions");
                self.reply(Response::error("You have no subscriptions", Some(request.id)))
                    .await;
            }
            Route::Publish | Route::Resolve | Route::Reject => self.reply_invalid().await,
        }
    }

    /// Run a broker-control request; always produces exactly one response
    async fn handle_control(&self, request: &Request) -> Response {
        let Some(op) = ControlOp::parse(&request.request_type) else {
            debug!(client = self.id, request_type = %request.request_type, "Invalid control request-type");
            return Response::error(
                format!("request-type '{}' is invalid", request.request_type),
                Some(request.id),
            );
        };

        let Some(name) = request.extra_str(FIELD_NAME) else {
            debug!(client = self.id, ?op, "Missing additional field");
            return Response::error(
                format!("Missing additional field: '{}'", FIELD_NAME),
                Some(request.id),
            );
        };

        let result = match op {
            ControlOp::Register => self.broker.register(self.id, name).await,
            ControlOp::Unregister => self.broker.unregister(self.id, name).await,
            ControlOp::Subscribe => self.broker.subscribe(self.id, name).await,
            ControlOp::Unsubscribe => self.broker.unsubscribe(self.id, name).await,
        };

        match result {
            Ok(state) => {
                debug!(client = self.id, ?op, application = name, %state, "Control request done");
                Response::ok(request.id)
            }
            Err(e) => {
                debug!(client = self.id, ?op, error = %e, "Control request failed");
                Response::error(e.to_string(), Some(request.id))
            }
        }
    }

    async fn reply_invalid(&self) {
        self.reply(Response::error("Invalid message", None)).await;
    }

    async fn reply(&self, response: Response) {
        let line = Message::Response(response).to_line();
        if self.outbound.send(line).await.is_err() {
            debug!(client = self.id, "Can't reply. Connection is closed");
        }
    }
}
