// TCP listener and server
// Accepts broker clients over plain TCP or TLS and runs one handler per connection

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::client::BrokerClient;
use super::connection::{spawn_writer, Connection};
use crate::broker::Broker;

/// TCP server that accepts and manages client connections
pub struct TcpServer {
    addr: SocketAddr,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl TcpServer {
    /// Start accepting broker clients on `addr`.
    ///
    /// With an acceptor every connection must complete a TLS handshake
    /// before any frame is read; a failed handshake only drops that
    /// connection.
    pub async fn start(
        addr: SocketAddr,
        broker: Arc<Broker>,
        tls: Option<TlsAcceptor>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let broker = Arc::clone(&broker);
                                let tls = tls.clone();
                                tokio::spawn(async move {
                                    handle_connection(stream, peer_addr, broker, tls).await;
                                });
                            }
                            Err(e) => error!("Accept error: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("TCP server shutting down");
                        break;
                    }
                }
            }
        });

        Ok(TcpServer {
            addr: local_addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Get the address the server is listening on
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting new connections
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        // Trigger shutdown on drop
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    broker: Arc<Broker>,
    tls: Option<TlsAcceptor>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer_addr, error = %e, "Can't set TCP_NODELAY");
    }

    let connection = match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => Connection::new(tls_stream, peer_addr),
            Err(e) => {
                warn!(%peer_addr, error = %e, "TLS handshake failed");
                return;
            }
        },
        None => Connection::new(stream, peer_addr),
    };

    let (reader, writer) = connection.into_split();
    let (outbound, writer_task) = spawn_writer(writer, peer_addr.to_string());

    let client = BrokerClient::connect(broker, outbound).await;
    info!(client = client.id(), %peer_addr, "Accepted connection");
    let id = client.id();

    client.run(reader).await;

    // Dropping the last sender lets the writer flush and close the socket
    if let Err(e) = writer_task.await {
        debug!(client = id, error = %e, "Writer task failed");
    }
    debug!(client = id, %peer_addr, "Connection closed");
}
