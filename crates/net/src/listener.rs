//! TCP listener producing a [`Connection`] per accepted peer
//!
//! The accept loop runs on its own task. Each accepted socket is handed to a
//! short-lived task that performs the TLS handshake (if any) and delivers
//! the resulting connection, so a slow or failing handshake never blocks
//! accepting.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::security::{SecurityMode, ServerIdentity};

/// Capacity of the accepted-connection channel
const CONNECTION_CHANNEL_CAPACITY: usize = 64;

/// Accepts incoming sockets and materializes a [`Connection`] for each.
///
/// Delivered connections are owned by whoever receives them from
/// [`next_connection`](Self::next_connection); stopping the listener does
/// not close them.
pub struct Listener {
    port: u16,
    security: SecurityMode,
    identity: Option<ServerIdentity>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    accept_handle: Option<JoinHandle<()>>,
    connection_rx: Option<mpsc::Receiver<Connection>>,
}

impl Listener {
    /// Listener for unencrypted connections. Port 0 binds an ephemeral port.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            security: SecurityMode::Plain,
            identity: None,
            local_addr: None,
            shutdown_tx: None,
            accept_handle: None,
            connection_rx: None,
        }
    }

    /// Listener that wraps each accepted socket in TLS using `identity`.
    ///
    /// The identity is loaded before the listener exists
    /// ([`ServerIdentity::from_pem_files`] fails fast on a bad certificate),
    /// so this constructor itself cannot fail.
    pub fn with_tls(port: u16, identity: ServerIdentity) -> Self {
        Self {
            port,
            security: SecurityMode::Encrypted,
            identity: Some(identity),
            local_addr: None,
            shutdown_tx: None,
            accept_handle: None,
            connection_rx: None,
        }
    }

    /// Bind and start accepting in the background.
    ///
    /// Returns once the port is bound; accepting happens on a spawned task.
    pub async fn start(&mut self) -> Result<()> {
        if self.shutdown_tx.is_some() {
            return Err(Error::AlreadyListening);
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let tcp = TcpListener::bind(addr).await?;
        let local_addr = tcp.local_addr()?;
        self.local_addr = Some(local_addr);

        info!(addr = %local_addr, security = ?self.security, "Listener started");

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (connection_tx, connection_rx) = mpsc::channel(CONNECTION_CHANNEL_CAPACITY);

        self.accept_handle = Some(tokio::spawn(accept_loop(
            tcp,
            local_addr.port(),
            self.identity.clone(),
            connection_tx,
            shutdown_rx,
        )));
        self.shutdown_tx = Some(shutdown_tx);
        self.connection_rx = Some(connection_rx);
        Ok(())
    }

    /// Wait for the next accepted peer.
    ///
    /// Returns `None` before [`start`](Self::start) and after the accept
    /// loop has shut down.
    pub async fn next_connection(&mut self) -> Option<Connection> {
        match self.connection_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Stop accepting new sockets. Idempotent.
    ///
    /// Already-delivered connections are unaffected.
    pub fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
            info!("Listener stopped");
        }
        self.accept_handle.take();
    }

    /// Configured port (0 means an ephemeral port was requested).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bound address, available once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Trust policy applied to accepted sockets.
    pub fn security_mode(&self) -> SecurityMode {
        self.security
    }

    pub fn is_listening(&self) -> bool {
        self.shutdown_tx.is_some()
    }
}

/// Accept incoming sockets until shutdown.
async fn accept_loop(
    listener: TcpListener,
    port: u16,
    identity: Option<ServerIdentity>,
    connection_tx: mpsc::Sender<Connection>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        let identity = identity.clone();
                        let connection_tx = connection_tx.clone();
                        tokio::spawn(handle_accepted(stream, port, identity, connection_tx));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Handshake and delivery for one accepted socket.
///
/// A failure here affects only this client; the accept loop keeps running.
async fn handle_accepted(
    stream: TcpStream,
    port: u16,
    identity: Option<ServerIdentity>,
    connection_tx: mpsc::Sender<Connection>,
) {
    match Connection::from_accepted(stream, port, identity.as_ref()).await {
        Ok(connection) => {
            if connection_tx.send(connection).await.is_err() {
                debug!("Connection consumer dropped");
            }
        }
        Err(e) => {
            warn!(error = %e, "Handshake failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn self_signed_identity() -> ServerIdentity {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        ServerIdentity::from_pem(
            cert.cert.pem().as_bytes(),
            cert.key_pair.serialize_pem().as_bytes(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn binds_ephemeral_port() {
        let mut listener = Listener::new(0);
        assert!(!listener.is_listening());
        listener.start().await.unwrap();
        assert!(listener.is_listening());
        assert!(listener.local_addr().unwrap().port() > 0);
        listener.stop();
        assert!(!listener.is_listening());
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let mut listener = Listener::new(0);
        listener.start().await.unwrap();
        assert!(matches!(listener.start().await, Err(Error::AlreadyListening)));
    }

    #[tokio::test]
    async fn fan_out_to_all_clients() {
        let mut listener = Listener::new(0);
        listener.start().await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let mut client = Connection::new("127.0.0.1", port, SecurityMode::Plain).unwrap();
            client.connect().await.unwrap();
            clients.push(client);
        }

        let mut peers = Vec::new();
        for _ in 0..3 {
            let peer = timeout(WAIT, listener.next_connection())
                .await
                .unwrap()
                .unwrap();
            peers.push(peer);
        }

        for peer in &peers {
            peer.send("broadcast").await.unwrap();
        }

        for client in &mut clients {
            let msg = timeout(WAIT, client.next_message()).await.unwrap().unwrap();
            assert_eq!(msg, "broadcast");
        }
    }

    #[tokio::test]
    async fn stop_stops_accepting() {
        let mut listener = Listener::new(0);
        listener.start().await.unwrap();
        let port = listener.local_addr().unwrap().port();

        listener.stop();

        // The accept loop exits and releases the socket shortly after
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut late_client = Connection::new("127.0.0.1", port, SecurityMode::Plain).unwrap();
        assert!(late_client.connect().await.is_err());

        let next = timeout(WAIT, listener.next_connection()).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn stop_leaves_delivered_connections_alive() {
        let mut listener = Listener::new(0);
        listener.start().await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut client = Connection::new("127.0.0.1", port, SecurityMode::Plain).unwrap();
        client.connect().await.unwrap();
        let mut peer = timeout(WAIT, listener.next_connection())
            .await
            .unwrap()
            .unwrap();

        listener.stop();

        peer.send("still here").await.unwrap();
        let msg = timeout(WAIT, client.next_message()).await.unwrap().unwrap();
        assert_eq!(msg, "still here");
        assert!(peer.is_connected());
    }

    #[tokio::test]
    async fn tls_handshake_with_self_signed_cert() {
        let mut listener = Listener::with_tls(0, self_signed_identity());
        assert_eq!(listener.security_mode(), SecurityMode::Encrypted);
        listener.start().await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Encrypted mode accepts the untrusted self-signed certificate
        let mut client = Connection::new("localhost", port, SecurityMode::Encrypted).unwrap();
        client.connect().await.unwrap();

        let mut peer = timeout(WAIT, listener.next_connection())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peer.security_mode(), SecurityMode::Encrypted);

        client.send("over tls").await.unwrap();
        let msg = timeout(WAIT, peer.next_message()).await.unwrap().unwrap();
        assert_eq!(msg, "over tls");

        peer.send("ack").await.unwrap();
        let msg = timeout(WAIT, client.next_message()).await.unwrap().unwrap();
        assert_eq!(msg, "ack");
    }

    #[tokio::test]
    async fn failed_handshake_does_not_break_accept_loop() {
        let mut listener = Listener::with_tls(0, self_signed_identity());
        listener.start().await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Plain client against a TLS listener: its handshake task fails
        let mut bad_client = Connection::new("127.0.0.1", port, SecurityMode::Plain).unwrap();
        bad_client.connect().await.unwrap();
        bad_client.close().await;

        // A proper TLS client still gets through afterwards
        let mut good_client = Connection::new("localhost", port, SecurityMode::Encrypted).unwrap();
        good_client.connect().await.unwrap();

        let peer = timeout(WAIT, listener.next_connection())
            .await
            .unwrap()
            .unwrap();
        assert!(peer.is_connected());
    }
}
