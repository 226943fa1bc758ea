//! Forwarding engine: relays the bytes of a logical connection.
//!
//! # Submodule Architecture
//!
//! - **[`tcp`]**: [`TcpForwarder`] copies bytes between two sockets, dialing
//!   or accepting whichever side is not attached yet. [`connect_service`]
//!   runs one forwarder, or an ingress and an egress forwarder joined at a
//!   policy-selected network function.
//!
//! - **[`mtls`]**: [`MtlsForwarder`] relays a local socket over a mutual-TLS
//!   connection between gateways. [`serve_mtls`] is the data-plane accept
//!   loop that authenticates peers and hands each stream to its endpoint.
//!
//! - **[`endpoints`]**: [`EndpointRegistry`] maps the endpoint names handed
//!   out in connect replies to the receiver waiting for that stream.
//!
//! Every forwarder follows `Initialized → Running → Closed`; it is closed for
//! good once either side closes or errors, or its cancellation token fires.

pub mod endpoints;
pub mod mtls;
pub mod tcp;

pub use endpoints::EndpointRegistry;
pub use mtls::{serve_mtls, MtlsForwarder, MtlsRole, MtlsSettings};
pub use tcp::{accept_one, connect_service, relay_streams, PreparedService, ServiceRoute, TcpForwarder};

use mbg_core::{cbor_decode, frame_encode, frame_len, MbgResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::io;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Any bidirectional byte stream a forwarder can own: TCP sockets, upgraded
/// HTTP connections, TLS streams, in-memory pipes.
pub trait DataStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DataStream for T {}

pub type BoxedStream = Box<dyn DataStream>;

/// A stream that becomes available later, e.g. once an HTTP upgrade completes.
pub type PendingStream = Pin<Box<dyn Future<Output = io::Result<BoxedStream>> + Send>>;

/// Wrap an already connected stream as a [`PendingStream`].
pub fn ready_stream<S: DataStream + 'static>(stream: S) -> PendingStream {
    let boxed: BoxedStream = Box::new(stream);
    Box::pin(async move { Ok(boxed) })
}

/// Lifecycle of a forwarder instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    Initialized,
    Running,
    Closed,
}

/// Write one length-prefixed CBOR frame.
pub(crate) async fn write_frame<W, T>(writer: &mut W, value: &T) -> MbgResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let frame = frame_encode(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one length-prefixed CBOR frame, nothing past it.
pub(crate) async fn read_frame<R, T>(reader: &mut R) -> MbgResult<T>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = frame_len(header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    cbor_decode(&payload)
}
