//! UI fan-out
//!
//! Registry of ephemeral popup observers. Each observer owns a bounded
//! message queue drained by its transport (the WebSocket pump). Sends that
//! hit a closed queue evict the observer; a full queue drops the message
//! for that observer rather than stalling the rest of the fleet.

pub mod messages;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::models::TabId;
pub use messages::{DownloadCommand, DownloadProgressPayload, InboundMessage, OutboundMessage, UpdateAction};

/// Queue depth per observer before messages start dropping.
const OBSERVER_QUEUE_DEPTH: usize = 256;

struct Observer {
    tab_id: Option<TabId>,
    sender: mpsc::Sender<OutboundMessage>,
}

/// Shared observer registry.
#[derive(Clone, Default)]
pub struct FanOut {
    observers: Arc<RwLock<HashMap<String, Observer>>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer and hand back the queue its transport drains.
    pub async fn register(
        &self,
        port_id: &str,
        tab_id: Option<TabId>,
        url: Option<String>,
    ) -> mpsc::Receiver<OutboundMessage> {
        let (sender, receiver) = mpsc::channel(OBSERVER_QUEUE_DEPTH);
        let mut observers = self.observers.write().await;
        observers.insert(port_id.to_string(), Observer { tab_id, sender });
        debug!(
            "observer {port_id} registered (tab {tab_id:?}, url {})",
            url.as_deref().unwrap_or("-")
        );
        receiver
    }

    pub async fn unregister(&self, port_id: &str) {
        let mut observers = self.observers.write().await;
        if observers.remove(port_id).is_some() {
            debug!("observer {port_id} unregistered");
        }
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }

    /// Send to one observer. Returns false (and evicts) when its port is dead.
    pub async fn send_to(&self, port_id: &str, message: OutboundMessage) -> bool {
        let mut dead = false;
        {
            let observers = self.observers.read().await;
            match observers.get(port_id) {
                Some(observer) => {
                    if !deliver(port_id, observer, message) {
                        dead = true;
                    }
                }
                None => return false,
            }
        }
        if dead {
            self.unregister(port_id).await;
            return false;
        }
        true
    }

    /// Deliver to every observer regardless of tab.
    pub async fn broadcast(&self, message: OutboundMessage) {
        self.broadcast_filtered(message, |_| true).await;
    }

    /// Deliver only to observers registered for the given tab.
    pub async fn broadcast_tab(&self, tab_id: TabId, message: OutboundMessage) {
        self.broadcast_filtered(message, move |observer_tab| observer_tab == Some(tab_id))
            .await;
    }

    async fn broadcast_filtered<F>(&self, message: OutboundMessage, matches: F)
    where
        F: Fn(Option<TabId>) -> bool,
    {
        let mut dead_ports = Vec::new();
        {
            let observers = self.observers.read().await;
            for (port_id, observer) in observers.iter() {
                if !matches(observer.tab_id) {
                    continue;
                }
                if !deliver(port_id, observer, message.clone()) {
                    dead_ports.push(port_id.clone());
                }
            }
        }
        for port_id in dead_ports {
            self.unregister(&port_id).await;
        }
    }
}

fn deliver(port_id: &str, observer: &Observer, message: OutboundMessage) -> bool {
    match observer.sender.try_send(message) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("observer {port_id} queue full; dropping message");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection_state(connected: bool) -> OutboundMessage {
        OutboundMessage::NativeHostConnectionState { connected }
    }

    #[tokio::test]
    async fn test_tab_scoped_broadcast() {
        let fanout = FanOut::new();
        let mut rx_a = fanout.register("a", Some(1), None).await;
        let mut rx_b = fanout.register("b", Some(2), None).await;

        fanout
            .broadcast_tab(
                1,
                OutboundMessage::DownloadCountUpdated { count: 3 },
            )
            .await;

        assert!(matches!(
            rx_a.try_recv(),
            Ok(OutboundMessage::DownloadCountUpdated { count: 3 })
        ));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_global_broadcast_reaches_all() {
        let fanout = FanOut::new();
        let mut rx_a = fanout.register("a", Some(1), None).await;
        let mut rx_b = fanout.register("b", None, None).await;

        fanout.broadcast(connection_state(true)).await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_dead_port_evicted_on_send() {
        let fanout = FanOut::new();
        let rx = fanout.register("a", Some(1), None).await;
        drop(rx);

        assert_eq!(fanout.observer_count().await, 1);
        fanout.broadcast(connection_state(false)).await;
        assert_eq!(fanout.observer_count().await, 0);

        assert!(!fanout.send_to("a", connection_state(false)).await);
    }

    #[tokio::test]
    async fn test_send_to_unknown_port() {
        let fanout = FanOut::new();
        assert!(!fanout.send_to("ghost", connection_state(true)).await);
    }

    #[tokio::test]
    async fn test_unregister() {
        let fanout = FanOut::new();
        let _rx = fanout.register("a", None, None).await;
        fanout.unregister("a").await;
        assert_eq!(fanout.observer_count().await, 0);
    }
}
