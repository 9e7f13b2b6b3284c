//! In-process topic broker with fault injection.
//!
//! Stands in for the STOMP broker: connections subscribe to destinations,
//! publishes fan out to every live subscriber, and anything published while
//! nobody is subscribed is lost (there is no replay).

use async_trait::async_trait;
use geotrack_env::{ChannelConnection, ChannelTransport, Endpoint, EnvError, Frame, HeartbeatConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

type Inbox = mpsc::UnboundedSender<Result<Frame, EnvError>>;

/// Counters collected by the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    /// Successful handshakes
    pub connects: u64,

    /// Handshakes refused while offline
    pub refused: u64,

    /// Publish calls
    pub published: u64,

    /// Frames handed to subscribers
    pub delivered: u64,

    /// Publishes that reached no subscriber
    pub dropped: u64,

    /// Heart-beats received from clients
    pub heartbeats: u64,

    /// Connections killed by fault injection
    pub forced_drops: u64,
}

struct Subscriber {
    endpoint: Endpoint,
    destinations: Vec<String>,
    inbox: Inbox,
}

struct BrokerState {
    online: bool,
    next_id: u64,
    connections: HashMap<u64, Subscriber>,
    stats: BrokerStats,
}

/// Shared handle to the simulated broker.
#[derive(Clone)]
pub struct SimBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl SimBroker {
    /// Creates an online broker with no connections.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                online: true,
                next_id: 0,
                connections: HashMap::new(),
                stats: BrokerStats::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only follows a panic elsewhere in the run
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns a transport that connects to this broker.
    pub fn transport(&self) -> SimTransport {
        SimTransport {
            broker: self.clone(),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    /// Refuses new connections and kills the live ones.
    pub fn go_offline(&self) {
        info!("broker going offline");
        self.set_online(false);
        self.drop_connections();
    }

    pub fn go_online(&self) {
        info!("broker back online");
        self.set_online(true);
    }

    /// Kills every live connection. Returns how many were dropped.
    pub fn drop_connections(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.connections.len();
        for (id, sub) in state.connections.drain() {
            debug!(conn = id, endpoint = %sub.endpoint, "forcing drop");
            let _ = sub.inbox.send(Err(EnvError::disconnected("forced drop")));
        }
        state.stats.forced_drops += dropped as u64;
        dropped
    }

    /// Publishes a raw body. Returns the number of subscribers reached.
    pub fn publish(&self, destination: &str, body: impl Into<String>) -> usize {
        let body = body.into();
        let mut state = self.lock();
        state.stats.published += 1;

        let mut reached = 0;
        for sub in state.connections.values() {
            if sub.destinations.iter().any(|d| d == destination)
                && sub.inbox.send(Ok(Frame::message(destination, body.clone()))).is_ok()
            {
                reached += 1;
            }
        }

        if reached == 0 {
            state.stats.dropped += 1;
            debug!(destination, "publish reached no subscriber");
        }
        state.stats.delivered += reached as u64;
        reached
    }

    /// Publishes a JSON payload.
    pub fn publish_json<T: Serialize>(&self, destination: &str, payload: &T) -> usize {
        match serde_json::to_string(payload) {
            Ok(body) => self.publish(destination, body),
            Err(e) => {
                tracing::warn!(destination, error = %e, "payload not serializable");
                0
            }
        }
    }

    /// Sends a heart-beat to every live connection.
    pub fn heartbeat(&self) {
        for sub in self.lock().connections.values() {
            let _ = sub.inbox.send(Ok(Frame::Heartbeat));
        }
    }

    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.lock()
            .connections
            .values()
            .filter(|sub| sub.destinations.iter().any(|d| d == destination))
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn stats(&self) -> BrokerStats {
        self.lock().stats
    }

    fn remove(&self, id: u64) {
        self.lock().connections.remove(&id);
    }
}

impl Default for SimBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// `ChannelTransport` backed by a [`SimBroker`].
#[derive(Clone)]
pub struct SimTransport {
    broker: SimBroker,
}

#[async_trait]
impl ChannelTransport for SimTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _heartbeat: HeartbeatConfig,
    ) -> Result<Box<dyn ChannelConnection>, EnvError> {
        let mut state = self.broker.lock();
        if !state.online {
            state.stats.refused += 1;
            return Err(EnvError::ConnectFailed(format!("{endpoint} offline")));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.stats.connects += 1;

        let (inbox, rx) = mpsc::unbounded_channel();
        state.connections.insert(
            id,
            Subscriber {
                endpoint: endpoint.clone(),
                destinations: Vec::new(),
                inbox,
            },
        );
        debug!(conn = id, %endpoint, "connected");

        Ok(Box::new(SimConnection {
            id,
            rx,
            broker: self.broker.clone(),
        }))
    }
}

/// One live connection to the simulated broker.
pub struct SimConnection {
    id: u64,
    rx: mpsc::UnboundedReceiver<Result<Frame, EnvError>>,
    broker: SimBroker,
}

#[async_trait]
impl ChannelConnection for SimConnection {
    async fn subscribe(&mut self, destination: &str) -> Result<(), EnvError> {
        let mut state = self.broker.lock();
        let sub = state
            .connections
            .get_mut(&self.id)
            .ok_or_else(|| EnvError::disconnected("connection dropped"))?;
        sub.destinations.push(destination.to_string());
        Ok(())
    }

    async fn recv(&mut self) -> Result<Frame, EnvError> {
        match self.rx.recv().await {
            Some(frame) => frame,
            None => Err(EnvError::disconnected("broker closed connection")),
        }
    }

    async fn send_heartbeat(&mut self) -> Result<(), EnvError> {
        let mut state = self.broker.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(EnvError::disconnected("connection dropped"));
        }
        state.stats.heartbeats += 1;
        Ok(())
    }

    async fn close(&mut self) {
        self.broker.remove(self.id);
    }
}

impl Drop for SimConnection {
    fn drop(&mut self) {
        self.broker.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new("sim:61613")
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_only() {
        let broker = SimBroker::new();
        let transport = broker.transport();

        let mut conn = transport
            .connect(&endpoint(), HeartbeatConfig::default())
            .await
            .unwrap();
        conn.subscribe("/topic/locations/1").await.unwrap();

        assert_eq!(broker.publish("/topic/locations/1", "{}"), 1);
        assert_eq!(broker.publish("/topic/locations/2", "{}"), 0);
        assert_eq!(
            conn.recv().await.unwrap(),
            Frame::message("/topic/locations/1", "{}")
        );

        let stats = broker.stats();
        assert_eq!((stats.published, stats.delivered, stats.dropped), (2, 1, 1));
    }

    #[tokio::test]
    async fn test_offline_refuses_and_drops() {
        let broker = SimBroker::new();
        let transport = broker.transport();
        let mut conn = transport
            .connect(&endpoint(), HeartbeatConfig::default())
            .await
            .unwrap();
        conn.subscribe("/topic/a").await.unwrap();

        broker.go_offline();
        assert!(conn.recv().await.unwrap_err().is_disconnect());
        assert!(conn.send_heartbeat().await.is_err());
        assert!(transport
            .connect(&endpoint(), HeartbeatConfig::default())
            .await
            .is_err());

        // Lost: nobody is subscribed
        assert_eq!(broker.publish("/topic/a", "{}"), 0);

        broker.go_online();
        assert!(transport
            .connect(&endpoint(), HeartbeatConfig::default())
            .await
            .is_ok());

        let stats = broker.stats();
        assert_eq!((stats.connects, stats.refused, stats.forced_drops), (2, 1, 1));
    }

    #[tokio::test]
    async fn test_dropping_connection_unsubscribes() {
        let broker = SimBroker::new();
        let mut conn = broker
            .transport()
            .connect(&endpoint(), HeartbeatConfig::default())
            .await
            .unwrap();
        conn.subscribe("/topic/a").await.unwrap();
        assert_eq!(broker.subscriber_count("/topic/a"), 1);

        drop(conn);
        assert_eq!(broker.subscriber_count("/topic/a"), 0);
        assert_eq!(broker.connection_count(), 0);
    }
}
