//! Typed dispatch of inbound controller messages.
//!
//! Handlers subscribe to one [`MessageType`] and are called synchronously, in
//! subscription order, with the message and the peer it came from. RPC
//! requests go to at most one async responder per wrapped message type.

use futures::future::BoxFuture;
use mesh_core::{ControllerMessage, MessageType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, warn};

pub type MessageHandler<P> = Arc<dyn Fn(&ControllerMessage, &P) + Send + Sync>;

/// Async RPC responder. `Err` is sent back to the caller as an RPC error.
pub type RpcResponder<P> = Arc<
    dyn Fn(ControllerMessage, P) -> BoxFuture<'static, Result<ControllerMessage, String>>
        + Send
        + Sync,
>;

trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, message_type: MessageType, id: usize);
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving messages, drop it to unsubscribe.
pub struct Subscription {
    router: Weak<dyn Unsubscribe>,
    message_type: MessageType,
    id: usize,
}

impl Subscription {
    /// Keep the handler registered for the router's whole lifetime.
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.unsubscribe(self.message_type, self.id);
        }
    }
}

/// Routes messages to handlers keyed by message type.
///
/// `P` is the context handed to handlers alongside the message; the manager
/// uses the sending peer.
pub struct MessageRouter<P> {
    handlers: RwLock<HashMap<MessageType, Vec<(usize, MessageHandler<P>)>>>,
    responders: RwLock<HashMap<MessageType, RpcResponder<P>>>,
    next_id: AtomicUsize,
}

impl<P> Default for MessageRouter<P> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            responders: RwLock::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<P: Send + Sync + 'static> MessageRouter<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one message type. Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        message_type: MessageType,
        handler: impl Fn(&ControllerMessage, &P) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(message_type)
            .or_default()
            .push((id, Arc::new(handler)));

        let router: Weak<dyn Unsubscribe> = Arc::downgrade(self) as Weak<dyn Unsubscribe>;
        Subscription {
            router,
            message_type,
            id,
        }
    }

    /// Call every handler subscribed to the message's type.
    ///
    /// Returns the number of handlers called.
    pub fn dispatch(&self, message: &ControllerMessage, context: &P) -> usize {
        let message_type = message.message_type();
        // Clone the handler list so handlers may subscribe without deadlocking
        let handlers: Vec<MessageHandler<P>> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&message_type)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!("No handler for {} message, dropping", message_type);
            return 0;
        }

        for handler in &handlers {
            handler(message, context);
        }
        handlers.len()
    }

    /// Register the RPC responder for a wrapped message type, replacing any
    /// previous one.
    pub fn on_rpc<F, Fut>(&self, message_type: MessageType, responder: F)
    where
        F: Fn(ControllerMessage, P) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<ControllerMessage, String>> + Send + 'static,
    {
        let responder: RpcResponder<P> = Arc::new(move |message, context| {
            Box::pin(responder(message, context)) as BoxFuture<'static, _>
        });
        let previous = self
            .responders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(message_type, responder);
        if previous.is_some() {
            warn!("Replaced existing RPC responder for {}", message_type);
        }
    }

    pub fn responder(&self, message_type: MessageType) -> Option<RpcResponder<P>> {
        self.responders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&message_type)
            .cloned()
    }

    pub fn handler_count(&self, message_type: MessageType) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&message_type)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl<P: Send + Sync + 'static> Unsubscribe for MessageRouter<P> {
    fn unsubscribe(&self, message_type: MessageType, id: usize) {
        // try_write: Drop may run during unwinding while dispatch holds a read lock
        if let Ok(mut guard) = self.handlers.try_write() {
            if let Some(list) = guard.get_mut(&message_type) {
                list.retain(|(i, _)| *i != id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::protocol::CreatePipeMessage;
    use std::sync::Mutex;

    fn create_pipe() -> ControllerMessage {
        ControllerMessage::CreatePipe(CreatePipeMessage {
            source_uuid: "s".into(),
            sink_uuid: "k".into(),
        })
    }

    #[test]
    fn test_dispatch_by_type() {
        let router: Arc<MessageRouter<String>> = Arc::new(MessageRouter::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let _sub = router.subscribe(MessageType::CreatePipe, move |msg, peer| {
            seen_clone
                .lock()
                .unwrap()
                .push((msg.message_type(), peer.clone()));
        });

        assert_eq!(router.dispatch(&create_pipe(), &"peer-a".to_string()), 1);
        assert_eq!(router.dispatch(&ControllerMessage::Ping, &"peer-a".to_string()), 0);

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![(MessageType::CreatePipe, "peer-a".to_string())]);
    }

    #[test]
    fn test_handlers_called_in_subscription_order() {
        let router: Arc<MessageRouter<()>> = Arc::new(MessageRouter::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let subs: Vec<_> = (0..3)
            .map(|i| {
                let order = order.clone();
                router.subscribe(MessageType::CreatePipe, move |_, _| {
                    order.lock().unwrap().push(i);
                })
            })
            .collect();

        router.dispatch(&create_pipe(), &());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        drop(subs);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let router: Arc<MessageRouter<()>> = Arc::new(MessageRouter::new());
        let sub = router.subscribe(MessageType::Ping, |_, _| {});
        assert_eq!(router.handler_count(MessageType::Ping), 1);

        drop(sub);
        assert_eq!(router.handler_count(MessageType::Ping), 0);
    }

    #[test]
    fn test_detach_keeps_handler() {
        let router: Arc<MessageRouter<()>> = Arc::new(MessageRouter::new());
        router.subscribe(MessageType::Ping, |_, _| {}).detach();
        assert_eq!(router.handler_count(MessageType::Ping), 1);
    }

    #[test]
    fn test_subscribe_from_handler_does_not_deadlock() {
        let router: Arc<MessageRouter<()>> = Arc::new(MessageRouter::new());
        let weak = Arc::downgrade(&router);
        router
            .subscribe(MessageType::Ping, move |_, _| {
                if let Some(router) = weak.upgrade() {
                    router.subscribe(MessageType::Pong, |_, _| {}).detach();
                }
            })
            .detach();

        router.dispatch(&ControllerMessage::Ping, &());
        assert_eq!(router.handler_count(MessageType::Pong), 1);
    }

    #[tokio::test]
    async fn test_rpc_responder() {
        let router: MessageRouter<String> = MessageRouter::new();
        assert!(router.responder(MessageType::Ping).is_none());

        router.on_rpc(MessageType::Ping, |_, peer| async move {
            if peer == "bad" {
                Err("refused".to_string())
            } else {
                Ok(ControllerMessage::Pong)
            }
        });

        let responder = router.responder(MessageType::Ping).unwrap();
        assert_eq!(
            responder(ControllerMessage::Ping, "good".into()).await,
            Ok(ControllerMessage::Pong)
        );
        assert_eq!(
            responder(ControllerMessage::Ping, "bad".into()).await,
            Err("refused".to_string())
        );
    }
}
