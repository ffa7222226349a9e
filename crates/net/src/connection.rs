//! A single managed TCP (optionally TLS) connection
//!
//! A `Connection` owns one socket, a background receive loop delivering
//! inbound text through [`Connection::next_message`], and a direct send path.
//!
//! # Wire contract
//!
//! There is no message framing. The receive loop delivers one notification
//! per successful read of up to [`READ_BUFFER_SIZE`] bytes: a message larger
//! than one read arrives as several notifications, and two messages sent
//! back-to-back may coalesce into one. Consumers that need message
//! boundaries must layer their own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::security::{self, SecurityMode, ServerIdentity};
use crate::stream::{IntoNetStream, NetStream};
use crate::text;

/// Size of one receive-loop read. Whatever one read returns is delivered as
/// exactly one notification.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the inbound message channel
const MESSAGE_CHANNEL_CAPACITY: usize = 64;

/// One managed connection to a peer.
///
/// Built either from a target host/port (then [`connect`](Self::connect)ed)
/// or by a [`Listener`](crate::Listener) from an accepted socket, in which
/// case it starts out connected.
pub struct Connection {
    hostname: String,
    port: u16,
    security: SecurityMode,
    writer: Option<Arc<Mutex<WriteHalf<NetStream>>>>,
    connected: Arc<AtomicBool>,
    message_rx: Option<mpsc::Receiver<String>>,
    recv_handle: Option<JoinHandle<()>>,
}

impl Connection {
    /// Create a connection targeting `hostname:port`. Opens nothing yet.
    pub fn new(hostname: impl Into<String>, port: u16, security: SecurityMode) -> Result<Self> {
        let hostname = hostname.into();
        if hostname.is_empty() {
            return Err(Error::InvalidArgument("hostname is empty".into()));
        }
        if port == 0 {
            return Err(Error::InvalidArgument("port is zero".into()));
        }
        Ok(Self {
            hostname,
            port,
            security,
            writer: None,
            connected: Arc::new(AtomicBool::new(false)),
            message_rx: None,
            recv_handle: None,
        })
    }

    /// Wrap a socket already accepted by a listener.
    ///
    /// With an identity present the server-side handshake completes before
    /// this returns, and the mode is `Encrypted` (the server does not verify
    /// clients). The receive loop is running once this returns.
    pub(crate) async fn from_accepted(
        stream: TcpStream,
        port: u16,
        identity: Option<&ServerIdentity>,
    ) -> Result<Self> {
        let peer_ip = stream.peer_addr()?.ip().to_string();

        let (security, net_stream) = match identity {
            Some(identity) => {
                let tls = identity.acceptor().accept(stream).await.map_err(Error::Tls)?;
                (SecurityMode::Encrypted, tls.into_net_stream())
            }
            None => (SecurityMode::Plain, stream.into_net_stream()),
        };

        let mut connection = Self {
            hostname: peer_ip,
            port,
            security,
            writer: None,
            connected: Arc::new(AtomicBool::new(false)),
            message_rx: None,
            recv_handle: None,
        };
        connection.attach(net_stream);
        debug!(peer = %connection.hostname, security = ?security, "Accepted connection ready");
        Ok(connection)
    }

    /// Connect to the configured host and port.
    ///
    /// For encrypted modes the TLS handshake completes before this returns:
    /// `Encrypted` accepts any server certificate, `EncryptedAndVerified`
    /// applies standard chain and hostname validation. On failure nothing is
    /// left half-connected. Reconnecting an already-connected connection
    /// closes the previous socket first.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            self.close().await;
        }

        let stream = TcpStream::connect((self.hostname.as_str(), self.port))
            .await
            .map_err(|source| Error::Connect {
                host: self.hostname.clone(),
                port: self.port,
                source,
            })?;

        let net_stream = match security::client_connector(self.security) {
            Some(connector) => {
                let server_name = ServerName::try_from(self.hostname.clone()).map_err(|_| {
                    Error::InvalidArgument(format!("invalid hostname: {}", self.hostname))
                })?;
                let tls = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(Error::Tls)?;
                tls.into_net_stream()
            }
            None => stream.into_net_stream(),
        };

        self.attach(net_stream);
        info!(host = %self.hostname, port = self.port, security = ?self.security, "Connected");
        Ok(())
    }

    /// Connect to a different host on the configured port.
    pub async fn connect_to(&mut self, hostname: impl Into<String>) -> Result<()> {
        let hostname = hostname.into();
        if hostname.is_empty() {
            return Err(Error::InvalidArgument("hostname is empty".into()));
        }
        self.hostname = hostname;
        self.connect().await
    }

    /// Connect to a different host and port.
    pub async fn connect_to_addr(&mut self, hostname: impl Into<String>, port: u16) -> Result<()> {
        if port == 0 {
            return Err(Error::InvalidArgument("port is zero".into()));
        }
        self.port = port;
        self.connect_to(hostname).await
    }

    /// Send text to the peer.
    ///
    /// Encodes UTF-16LE and writes directly to the stream; the caller
    /// suspends until the write completes and is flushed. Concurrent senders
    /// are serialized by a per-connection lock.
    pub async fn send(&self, text: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let writer = self.writer.as_ref().ok_or(Error::NotConnected)?;
        let data = text::encode(text);

        let mut writer = writer.lock().await;
        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Wait for the next inbound message.
    ///
    /// Returns `None` once the receive loop has terminated and all pending
    /// messages were drained. There is no distinct disconnect notification;
    /// the stream simply ends.
    pub async fn next_message(&mut self) -> Option<String> {
        match self.message_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Close the connection. Idempotent; never errors.
    pub async fn close(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(writer) = self.writer.take() {
            let _ = writer.lock().await.shutdown().await;
        }
        if let Some(handle) = self.recv_handle.take() {
            handle.abort();
        }
    }

    /// Remote hostname, or the peer IP for accepted connections.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Remote port, or the listener port for accepted connections.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the socket is currently usable.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Trust policy this connection was built with.
    pub fn security_mode(&self) -> SecurityMode {
        self.security
    }

    /// Take ownership of a live stream: split it, mark connected, and spawn
    /// the receive loop. A fresh connected flag per attach keeps a stale
    /// loop from a previous socket from clearing the new one.
    fn attach(&mut self, stream: NetStream) {
        let (reader, writer) = tokio::io::split(stream);
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);

        self.connected = Arc::new(AtomicBool::new(true));
        let connected = self.connected.clone();
        self.recv_handle = Some(tokio::spawn(receive_loop(reader, message_tx, connected)));
        self.writer = Some(Arc::new(Mutex::new(writer)));
        self.message_rx = Some(message_rx);
    }
}

/// Receive loop: one read, one notification, until the stream ends.
///
/// Read failures are absorbed, not surfaced; the loop just terminates and
/// the consumer observes the message channel closing.
async fn receive_loop(
    mut reader: ReadHalf<NetStream>,
    message_tx: mpsc::Sender<String>,
    connected: Arc<AtomicBool>,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Stream ended");
                break;
            }
            Ok(n) => {
                let message = text::decode(&buf[..n]);
                if message_tx.send(message).await.is_err() {
                    debug!("Message consumer dropped");
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Read failed");
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}
