//! Channel Client - restartable per-topic push subscriptions.
//!
//! Each subscription owns one background worker and one physical
//! connection at a time (a connection *epoch*):
//!
//! ```text
//!            ┌────────────── reconnect after fixed delay ──────────────┐
//!            v                                                         │
//!   connect ──> subscribe ──> pump frames ──(drop / ERROR / EOF)──> flag=false
//!                   │             │
//!               flag=true     decode JSON ──> mpsc ──> Subscription<M>
//! ```
//!
//! - Delivery is at-most-once per epoch; nothing is replayed after a drop.
//! - Messages are FIFO within an epoch. Topics are not ordered relative
//!   to each other.
//! - Malformed payloads are logged and dropped; the subscription lives on.
//! - A late incoming heart-beat is only logged. Only a hard transport
//!   error ends the epoch.

use crate::config::ChannelConfig;
use crate::model::{LocationEvent, NotificationEvent, UserId};
use geotrack_env::{
    ChannelConnection, ChannelTransport, Endpoint, EnvError, Frame, HeartbeatConfig,
    TrackerContext,
};
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

// ============================================================================
// TOPICS & CONNECTIVITY
// ============================================================================

/// A named per-user push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Locations,
    Notifications,
}

impl Topic {
    pub fn name(&self) -> &'static str {
        match self {
            Topic::Locations => "locations",
            Topic::Notifications => "notifications",
        }
    }

    /// Broker destination for `user`, e.g. `/topic/locations/7`.
    pub fn destination(&self, user: UserId) -> String {
        format!("/topic/{}/{}", self.name(), user)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Observable per-topic connectivity. A hint for the UI only.
#[derive(Debug)]
pub struct ConnectivityFlags {
    locations: watch::Sender<bool>,
    notifications: watch::Sender<bool>,
}

impl ConnectivityFlags {
    pub fn new() -> Self {
        Self {
            locations: watch::channel(false).0,
            notifications: watch::channel(false).0,
        }
    }

    fn sender(&self, topic: Topic) -> &watch::Sender<bool> {
        match topic {
            Topic::Locations => &self.locations,
            Topic::Notifications => &self.notifications,
        }
    }

    pub fn set(&self, topic: Topic, connected: bool) {
        self.sender(topic).send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }

    pub fn is_connected(&self, topic: Topic) -> bool {
        *self.sender(topic).borrow()
    }

    pub fn watch(&self, topic: Topic) -> watch::Receiver<bool> {
        self.sender(topic).subscribe()
    }
}

impl Default for ConnectivityFlags {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// Opens auto-reconnecting topic subscriptions over a transport.
///
/// Every worker holds a child of `cancel`; disconnecting (or dropping the
/// client) cancels the parent and with it every live subscription.
pub struct ChannelClient<Ctx: TrackerContext, T: ChannelTransport> {
    ctx: Arc<Ctx>,
    transport: Arc<T>,
    config: ChannelConfig,
    flags: Arc<ConnectivityFlags>,
    cancel: CancellationToken,

    /// Workers started since the last disconnect
    workers: usize,
}

impl<Ctx: TrackerContext, T: ChannelTransport> ChannelClient<Ctx, T> {
    pub fn new(ctx: Arc<Ctx>, transport: Arc<T>, config: ChannelConfig) -> Self {
        Self {
            ctx,
            transport,
            config,
            flags: Arc::new(ConnectivityFlags::new()),
            cancel: CancellationToken::new(),
            workers: 0,
        }
    }

    /// Subscribes to `topic` for `user`.
    ///
    /// Returns immediately; the worker connects in the background and
    /// reconnects after every drop until [`disconnect`](Self::disconnect)
    /// or until the subscription is dropped.
    pub fn subscribe<M>(&mut self, topic: Topic, user: UserId) -> Subscription<M>
    where
        M: DeserializeOwned + Send + 'static,
    {
        let endpoint = match topic {
            Topic::Locations => self.config.locations.clone(),
            Topic::Notifications => self.config.notifications.clone(),
        };
        let (tx, rx) = mpsc::channel(self.config.buffer.max(1));
        self.workers += 1;

        let worker = TopicWorker {
            ctx: self.ctx.clone(),
            transport: self.transport.clone(),
            topic,
            endpoint,
            destination: topic.destination(user),
            heartbeat: self.config.heartbeat(),
            reconnect_delay: self.config.reconnect_delay(),
            flags: self.flags.clone(),
            tx,
            cancel: self.cancel.child_token(),
        };
        self.ctx.spawn(&format!("channel-{topic}"), worker.run());

        Subscription {
            topic,
            inner: ReceiverStream::new(rx),
        }
    }

    pub fn locations(&mut self, user: UserId) -> Subscription<LocationEvent> {
        self.subscribe(Topic::Locations, user)
    }

    pub fn notifications(&mut self, user: UserId) -> Subscription<NotificationEvent> {
        self.subscribe(Topic::Notifications, user)
    }

    /// Tears down every subscription. Idempotent; a later
    /// [`subscribe`](Self::subscribe) starts over with a fresh token.
    pub fn disconnect(&mut self) {
        if self.workers == 0 {
            return;
        }
        info!(subscriptions = self.workers, "disconnecting channels");
        std::mem::replace(&mut self.cancel, CancellationToken::new()).cancel();
        self.workers = 0;
        self.flags.set(Topic::Locations, false);
        self.flags.set(Topic::Notifications, false);
    }

    pub fn flags(&self) -> Arc<ConnectivityFlags> {
        self.flags.clone()
    }

    pub fn is_connected(&self, topic: Topic) -> bool {
        self.flags.is_connected(topic)
    }
}

impl<Ctx: TrackerContext, T: ChannelTransport> Drop for ChannelClient<Ctx, T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Decodes one JSON payload. Malformed payloads are logged and dropped.
pub fn decode_message<M: DeserializeOwned>(destination: &str, body: &str) -> Option<M> {
    match serde_json::from_str(body) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(destination, error = %e, "dropping malformed payload");
            None
        }
    }
}

// ============================================================================
// WORKER
// ============================================================================

struct TopicWorker<Ctx: TrackerContext, T: ChannelTransport, M> {
    ctx: Arc<Ctx>,
    transport: Arc<T>,
    topic: Topic,
    endpoint: Endpoint,
    destination: String,
    heartbeat: HeartbeatConfig,
    reconnect_delay: Duration,
    flags: Arc<ConnectivityFlags>,
    tx: mpsc::Sender<M>,
    cancel: CancellationToken,
}

impl<Ctx, T, M> TopicWorker<Ctx, T, M>
where
    Ctx: TrackerContext,
    T: ChannelTransport,
    M: DeserializeOwned + Send + 'static,
{
    async fn run(self) {
        loop {
            if self.stopped() {
                break;
            }

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break,
                opened = open(&*self.transport, &self.endpoint, self.heartbeat, &self.destination) => opened,
            };

            match opened {
                Ok(conn) => self.pump(conn).await,
                Err(e) => warn!(topic = %self.topic, endpoint = %self.endpoint, error = %e, "connect failed"),
            }
            self.flags.set(self.topic, false);

            if self.stopped() {
                break;
            }
            info!(
                topic = %self.topic,
                delay_ms = self.reconnect_delay.as_millis() as u64,
                "reconnecting"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.tx.closed() => break,
                _ = self.ctx.sleep(self.reconnect_delay) => {}
            }
        }

        self.flags.set(self.topic, false);
        debug!(topic = %self.topic, "channel worker stopped");
    }

    fn stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Runs one connection epoch until it drops or is shut down.
    async fn pump(&self, mut conn: Box<dyn ChannelConnection>) {
        self.flags.set(self.topic, true);
        info!(topic = %self.topic, destination = %self.destination, "subscribed");

        let outgoing = (!self.heartbeat.outgoing.is_zero()).then_some(self.heartbeat.outgoing);
        let incoming = self.heartbeat.incoming;
        let mut next_probe = outgoing.map(|every| self.ctx.now() + every);
        let mut last_inbound = self.ctx.now();
        let mut silent = false;

        loop {
            let until_probe = next_probe.map(|at| at.saturating_sub(self.ctx.now()));

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.tx.closed() => break,
                frame = conn.recv() => {
                    match frame {
                        Ok(frame) => {
                            last_inbound = self.ctx.now();
                            silent = false;
                            if !self.deliver(frame).await {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(topic = %self.topic, error = %e, "connection lost");
                            break;
                        }
                    }
                }
                _ = probe_due(&*self.ctx, until_probe) => {
                    if let Err(e) = conn.send_heartbeat().await {
                        warn!(topic = %self.topic, error = %e, "heart-beat failed");
                        break;
                    }
                    let now = self.ctx.now();
                    next_probe = outgoing.map(|every| now + every);

                    if !incoming.is_zero() && !silent && now.saturating_sub(last_inbound) > incoming {
                        debug!(topic = %self.topic, "incoming heart-beat overdue");
                        silent = true;
                    }
                }
            }
        }

        self.flags.set(self.topic, false);
        conn.close().await;
    }

    /// Forwards a frame. Returns false once the consumer is gone.
    async fn deliver(&self, frame: Frame) -> bool {
        match frame {
            Frame::Heartbeat => {
                trace!(topic = %self.topic, "heart-beat");
                true
            }
            Frame::Message { destination, body } => {
                if destination != self.destination {
                    debug!(topic = %self.topic, %destination, "ignoring foreign destination");
                    return true;
                }
                match decode_message::<M>(&destination, &body) {
                    Some(message) => self.tx.send(message).await.is_ok(),
                    None => true,
                }
            }
        }
    }
}

async fn open<T: ChannelTransport>(
    transport: &T,
    endpoint: &Endpoint,
    heartbeat: HeartbeatConfig,
    destination: &str,
) -> Result<Box<dyn ChannelConnection>, EnvError> {
    let mut conn = transport.connect(endpoint, heartbeat).await?;
    if let Err(e) = conn.subscribe(destination).await {
        conn.close().await;
        return Err(e);
    }
    Ok(conn)
}

async fn probe_due<Ctx: TrackerContext>(ctx: &Ctx, wait: Option<Duration>) {
    match wait {
        Some(wait) => ctx.sleep(wait).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// Lazy, infinite sequence of decoded messages for one topic.
///
/// Ends (`None`) only after the client disconnects.
#[derive(Debug)]
pub struct Subscription<M> {
    topic: Topic,
    inner: ReceiverStream<M>,
}

impl<M> Subscription<M> {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub async fn next(&mut self) -> Option<M> {
        self.inner.next().await
    }
}

impl<M> Stream for Subscription<M> {
    type Item = M;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<M>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use geotrack_env::TokioContext;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    type Feed = UnboundedSender<Result<Frame, EnvError>>;

    /// Hands out one pre-scripted connection per connect call.
    #[derive(Default)]
    struct ScriptedTransport {
        epochs: Mutex<VecDeque<UnboundedReceiver<Result<Frame, EnvError>>>>,
        connects: AtomicUsize,
        heartbeats: Arc<AtomicUsize>,
    }

    impl ScriptedTransport {
        fn epoch(&self) -> Feed {
            let (tx, rx) = unbounded_channel();
            self.epochs.lock().unwrap().push_back(rx);
            tx
        }
    }

    struct ScriptedConnection {
        rx: UnboundedReceiver<Result<Frame, EnvError>>,
        heartbeats: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChannelTransport for ScriptedTransport {
        async fn connect(
            &self,
            _endpoint: &Endpoint,
            _heartbeat: HeartbeatConfig,
        ) -> Result<Box<dyn ChannelConnection>, EnvError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let rx = self
                .epochs
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| EnvError::ConnectFailed("refused".into()))?;
            Ok(Box::new(ScriptedConnection {
                rx,
                heartbeats: self.heartbeats.clone(),
            }))
        }
    }

    #[async_trait]
    impl ChannelConnection for ScriptedConnection {
        async fn subscribe(&mut self, _destination: &str) -> Result<(), EnvError> {
            Ok(())
        }

        async fn recv(&mut self) -> Result<Frame, EnvError> {
            match self.rx.recv().await {
                Some(frame) => frame,
                None => Err(EnvError::disconnected("closed")),
            }
        }

        async fn send_heartbeat(&mut self) -> Result<(), EnvError> {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&mut self) {}
    }

    fn location_json(id: i64) -> String {
        format!(
            r#"{{"objectId":{id},"name":"Keys","type":"KEYS","latitude":46.77,"longitude":23.59,"outsideGeofence":false}}"#
        )
    }

    const DEST: &str = "/topic/locations/7";

    fn client(transport: Arc<ScriptedTransport>) -> ChannelClient<TokioContext, ScriptedTransport> {
        ChannelClient::new(TokioContext::shared(), transport, ChannelConfig::default())
    }

    #[test]
    fn test_topic_destinations() {
        assert_eq!(Topic::Locations.destination(UserId(7)), "/topic/locations/7");
        assert_eq!(Topic::Notifications.destination(UserId(7)), "/topic/notifications/7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_dropped() {
        let transport = Arc::new(ScriptedTransport::default());
        let feed = transport.epoch();
        let mut client = client(transport.clone());
        let mut sub = client.locations(UserId(7));

        feed.send(Ok(Frame::message(DEST, "{not json"))).unwrap();
        feed.send(Ok(Frame::message(DEST, r#"{"objectId":1}"#))).unwrap();
        feed.send(Ok(Frame::Heartbeat)).unwrap();
        feed.send(Ok(Frame::message(DEST, location_json(3)))).unwrap();

        let event = sub.next().await.unwrap();
        assert_eq!(event.object_id.0, 3);
        assert!(client.is_connected(Topic::Locations));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_fixed_delay() {
        let transport = Arc::new(ScriptedTransport::default());
        let first = transport.epoch();
        let mut client = client(transport.clone());
        let mut flag = client.flags().watch(Topic::Locations);
        let mut sub = client.locations(UserId(7));
        let started = tokio::time::Instant::now();

        first.send(Ok(Frame::message(DEST, location_json(1)))).unwrap();
        assert_eq!(sub.next().await.unwrap().object_id.0, 1);

        // Hard drop ends the epoch
        first.send(Err(EnvError::disconnected("reset"))).unwrap();
        flag.wait_for(|up| !*up).await.unwrap();

        let second = transport.epoch();
        second.send(Ok(Frame::message(DEST, location_json(2)))).unwrap();
        assert_eq!(sub.next().await.unwrap().object_id.0, 2);

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        assert!(client.is_connected(Topic::Locations));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_sent_while_idle() {
        let transport = Arc::new(ScriptedTransport::default());
        let _feed = transport.epoch();
        let mut client = client(transport.clone());
        let _sub = client.locations(UserId(7));

        tokio::time::sleep(Duration::from_millis(8100)).await;
        assert!(transport.heartbeats.load(Ordering::SeqCst) >= 2);
        // A silent broker is not an error
        assert!(client.is_connected(Topic::Locations));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_ends_subscription() {
        let transport = Arc::new(ScriptedTransport::default());
        let _feed = transport.epoch();
        let mut client = client(transport.clone());
        let mut sub = client.locations(UserId(7));

        tokio::task::yield_now().await;
        client.disconnect();
        client.disconnect();

        assert!(sub.next().await.is_none());
        assert!(!client.is_connected(Topic::Locations));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_after_disconnect_restarts() {
        let transport = Arc::new(ScriptedTransport::default());
        let _first = transport.epoch();
        let mut client = client(transport.clone());
        let mut old = client.locations(UserId(7));
        client
            .flags()
            .watch(Topic::Locations)
            .wait_for(|up| *up)
            .await
            .unwrap();

        client.disconnect();
        assert!(old.next().await.is_none());

        let second = transport.epoch();
        let mut fresh = client.locations(UserId(7));
        second.send(Ok(Frame::message(DEST, location_json(4)))).unwrap();

        assert_eq!(fresh.next().await.unwrap().object_id.0, 4);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);

        client.disconnect();
        assert!(fresh.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_client_stops_workers() {
        let transport = Arc::new(ScriptedTransport::default());
        let _feed = transport.epoch();
        let mut client = client(transport.clone());
        let mut locations = client.locations(UserId(7));
        let mut notifications = client.notifications(UserId(7));

        drop(client);

        assert!(locations.next().await.is_none());
        assert!(notifications.next().await.is_none());
        // No reconnect attempts once the client is gone
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(transport.connects.load(Ordering::SeqCst) <= 2);
    }
}
