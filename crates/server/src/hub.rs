//! Fan-out of server events to every connected observer.

use std::sync::Arc;

use shared::protocol::ServerEvent;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    watch,
};
use tracing::{trace, warn};

#[derive(Clone)]
pub struct NotificationHub {
    events: broadcast::Sender<ServerEvent>,
    device: Arc<watch::Sender<Option<String>>>,
}

impl NotificationHub {
    /// `capacity` bounds how far a slow observer may fall behind before it
    /// starts losing events.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let (device, _) = watch::channel(None);
        Self {
            events,
            device: Arc::new(device),
        }
    }

    /// Never blocks and never fails for the caller.
    pub fn broadcast(&self, event: ServerEvent) {
        match self.events.send(event) {
            Ok(observers) => trace!(observers, "event broadcast"),
            Err(_) => trace!("event dropped; no observers connected"),
        }
    }

    /// Records the current device path and tells every observer about it.
    pub fn publish_device(&self, path: Option<String>) {
        self.device.send_replace(path.clone());
        self.broadcast(ServerEvent::Dev { path });
    }

    pub fn device_path(&self) -> Option<String> {
        self.device.borrow().clone()
    }

    pub fn observer_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Registers an observer. Its first event is always the current `dev` state.
    pub fn subscribe(&self) -> Subscription {
        let events = self.events.subscribe();
        Subscription {
            greeting: Some(ServerEvent::Dev {
                path: self.device_path(),
            }),
            events,
        }
    }
}

pub struct Subscription {
    greeting: Option<ServerEvent>,
    events: broadcast::Receiver<ServerEvent>,
}

impl Subscription {
    /// Next event for this observer, or `None` once the hub is gone. An
    /// observer that fell too far behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        if let Some(greeting) = self.greeting.take() {
            return Some(greeting);
        }
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "observer lagged behind; dropped events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
