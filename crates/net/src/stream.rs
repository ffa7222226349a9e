//! Unified stream abstraction
//!
//! The connection layer operates on one stream type whether the transport
//! is plain TCP or TLS.

use tokio::io::{AsyncRead, AsyncWrite};

/// Combined trait for async read + write
pub(crate) trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// The stream type a connection owns, plain or TLS-wrapped.
pub(crate) type NetStream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Conversion into the unified stream type
pub(crate) trait IntoNetStream {
    fn into_net_stream(self) -> NetStream;
}

impl<T> IntoNetStream for T
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn into_net_stream(self) -> NetStream {
        Box::new(self)
    }
}
