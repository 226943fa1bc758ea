//! Endpoint registry for the mTLS data plane.
//!
//! A local-destination setup registers its endpoint name before replying to
//! the peer; the data-plane acceptor later delivers the authenticated stream
//! that announced that name. Each endpoint takes exactly one stream.

use super::BoxedStream;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Default)]
pub struct EndpointRegistry {
    waiting: Mutex<HashMap<String, oneshot::Sender<BoxedStream>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `endpoint` and return the receiver its stream arrives on.
    /// `None` if the name is already waiting.
    pub fn register(&self, endpoint: &str) -> Option<oneshot::Receiver<BoxedStream>> {
        let mut waiting = self.lock();
        if waiting.contains_key(endpoint) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        waiting.insert(endpoint.to_string(), tx);
        debug!(endpoint = %endpoint, "endpoint registered");
        Some(rx)
    }

    /// Hand `stream` to the receiver waiting on `endpoint`. Gives the stream
    /// back if nobody is waiting.
    pub fn deliver(&self, endpoint: &str, stream: BoxedStream) -> Result<(), BoxedStream> {
        match self.take(endpoint) {
            Some(tx) => tx.send(stream),
            None => Err(stream),
        }
    }

    /// Claim the sender for `endpoint`. Later deliveries to the same name fail.
    pub fn take(&self, endpoint: &str) -> Option<oneshot::Sender<BoxedStream>> {
        self.lock().remove(endpoint)
    }

    pub fn contains(&self, endpoint: &str) -> bool {
        self.lock().contains_key(endpoint)
    }

    /// Forget `endpoint`, e.g. after its receiver gave up waiting.
    pub fn remove(&self, endpoint: &str) -> bool {
        self.lock().remove(endpoint).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<BoxedStream>>> {
        self.waiting.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn delivers_to_registered_endpoint() {
        let registry = EndpointRegistry::new();
        let rx = registry.register("a:b-1").unwrap();
        assert!(registry.register("a:b-1").is_none());

        let (mut near, far) = tokio::io::duplex(64);
        assert!(registry.deliver("a:b-1", Box::new(far)).is_ok());
        assert!(registry.is_empty());

        let mut stream = rx.await.unwrap();
        near.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn unknown_endpoint_returns_stream() {
        let registry = EndpointRegistry::new();
        let (_near, far) = tokio::io::duplex(64);
        assert!(registry.deliver("nobody", Box::new(far)).is_err());
    }

    #[tokio::test]
    async fn second_delivery_is_rejected() {
        let registry = EndpointRegistry::new();
        let _rx = registry.register("a:b-1").unwrap();
        let (_n1, f1) = tokio::io::duplex(64);
        let (_n2, f2) = tokio::io::duplex(64);
        assert!(registry.deliver("a:b-1", Box::new(f1)).is_ok());
        assert!(registry.deliver("a:b-1", Box::new(f2)).is_err());
    }

    #[test]
    fn remove_forgets_endpoint() {
        let registry = EndpointRegistry::new();
        let _rx = registry.register("x").unwrap();
        assert!(registry.contains("x"));
        assert!(registry.remove("x"));
        assert!(!registry.remove("x"));
    }
}
