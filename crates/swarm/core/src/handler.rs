//! Application protocol handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use plexus_net_primitives::PeerId;
use plexus_net_upgrade::Stream;

/// Type-erased handler invoked with each negotiated inbound stream.
pub type StreamHandler = Arc<dyn Fn(PeerId, Stream) -> BoxFuture<'static, ()> + Send + Sync>;

/// Erases a handler closure.
pub(crate) fn boxed<F, Fut>(handler: F) -> StreamHandler
where
    F: Fn(PeerId, Stream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |peer, stream| handler(peer, stream).boxed())
}

/// Handlers keyed by protocol id. Clones share the registry.
#[derive(Clone, Default)]
pub(crate) struct Handlers {
    inner: Arc<RwLock<HashMap<String, StreamHandler>>>,
}

impl Handlers {
    /// Registers `handler`, returning whether one was replaced.
    pub(crate) fn insert(&self, protocol: String, handler: StreamHandler) -> bool {
        self.inner.write().insert(protocol, handler).is_some()
    }

    pub(crate) fn remove(&self, protocol: &str) -> bool {
        self.inner.write().remove(protocol).is_some()
    }

    pub(crate) fn get(&self, protocol: &str) -> Option<StreamHandler> {
        self.inner.read().get(protocol).cloned()
    }

    /// Registered protocol ids, sorted.
    pub(crate) fn protocols(&self) -> Vec<String> {
        let mut protocols: Vec<_> = self.inner.read().keys().cloned().collect();
        protocols.sort();
        protocols
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.protocols()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_replace_remove() {
        let handlers = Handlers::default();
        assert!(!handlers.insert("/b/1".into(), boxed(|_, _| async {})));
        assert!(!handlers.insert("/a/1".into(), boxed(|_, _| async {})));
        assert!(handlers.insert("/a/1".into(), boxed(|_, _| async {})));

        assert_eq!(handlers.protocols(), vec!["/a/1".to_string(), "/b/1".to_string()]);
        assert!(handlers.get("/a/1").is_some());

        assert!(handlers.remove("/a/1"));
        assert!(!handlers.remove("/a/1"));
        assert!(handlers.get("/a/1").is_none());
    }
}
