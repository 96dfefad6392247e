// Network layer module
// Line-framed JSON over TCP/TLS: wire codec, broker-side clients, listener and peer client

pub mod client;
pub mod connection;
pub mod listener;
pub mod messages;
pub mod peer;
pub mod tls;

pub use client::{BrokerClient, ClientState};
pub use connection::Connection;
pub use listener::TcpServer;
pub use messages::{Event, Message, Request, Response, Status};
pub use peer::{Peer, PeerConfig, PeerHandle};
