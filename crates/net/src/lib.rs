//! Duplex Network Library
//!
//! Bidirectional TCP communication with optional transport encryption, for
//! request/notify style applications (chat being the canonical case).
//!
//! # Architecture
//!
//! - **Connection**: one managed socket with a background receive loop and a
//!   direct send path
//! - **Listener**: accepts incoming sockets and produces a `Connection` per peer
//! - **SecurityMode**: plain, encrypted (trust-all), or encrypted-and-verified
//!
//! Text payloads travel as raw UTF-16LE bytes with no framing: one inbound
//! notification corresponds to one read, not necessarily to one send.
//!
//! # Usage
//!
//! ```ignore
//! // Server
//! let mut listener = Listener::new(DEFAULT_PORT);
//! listener.start().await?;
//! while let Some(mut peer) = listener.next_connection().await {
//!     peer.send("You are connected.").await?;
//!     tokio::spawn(async move {
//!         while let Some(text) = peer.next_message().await {
//!             /* handle */
//!         }
//!     });
//! }
//!
//! // Client
//! let mut conn = Connection::new("example.com", DEFAULT_PORT, SecurityMode::Plain)?;
//! conn.connect().await?;
//! conn.send("hello").await?;
//! while let Some(text) = conn.next_message().await {
//!     /* handle */
//! }
//! ```

pub mod connection;
pub mod error;
pub mod listener;
pub mod security;
mod stream;
pub mod text;

pub use connection::{Connection, READ_BUFFER_SIZE};
pub use error::{Error, Result};
pub use listener::Listener;
pub use security::{SecurityMode, ServerIdentity};

/// Conventional default port for duplex servers
pub const DEFAULT_PORT: u16 = 1337;
