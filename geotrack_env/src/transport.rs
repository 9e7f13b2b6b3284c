//! Channel transport abstraction for GeoTrack push topics.

use crate::error::EnvError;
use crate::types::{Endpoint, Frame, HeartbeatConfig};
use async_trait::async_trait;

/// Opens physical connections to a push broker.
///
/// # Implementations
///
/// - **Production**: `StompTransport` - STOMP 1.2 over TCP
/// - **Simulation**: `SimTransport` - in-process broker with fault injection
///
/// # Connection Flow
///
/// ```text
/// Client                     Transport                    Broker
///   |-- connect(endpoint) ------>|-- handshake -------------->|
///   |-- subscribe(dest) -------->|-- SUBSCRIBE -------------->|
///   |                            |<-- MESSAGE / heart-beat ---|
///   |<-- recv() -> Frame --------|                            |
/// ```
#[async_trait]
pub trait ChannelTransport: Send + Sync + 'static {
    /// Opens a new connection (one connection epoch).
    ///
    /// # Returns
    /// * `Ok(conn)` - handshake completed
    /// * `Err(EnvError::ConnectFailed)` - broker unreachable or refused
    async fn connect(
        &self,
        endpoint: &Endpoint,
        heartbeat: HeartbeatConfig,
    ) -> Result<Box<dyn ChannelConnection>, EnvError>;
}

/// One live connection to the broker.
///
/// Messages published while no connection is live are lost; there is no
/// replay across epochs.
#[async_trait]
pub trait ChannelConnection: Send {
    /// Subscribes this connection to a destination.
    async fn subscribe(&mut self, destination: &str) -> Result<(), EnvError>;

    /// Receives the next frame.
    ///
    /// Must be cancel-safe: dropping the future loses no frame.
    /// An `Err` means the connection epoch is over.
    async fn recv(&mut self) -> Result<Frame, EnvError>;

    /// Sends one outgoing liveness probe.
    async fn send_heartbeat(&mut self) -> Result<(), EnvError>;

    /// Closes the connection. Errors are swallowed.
    async fn close(&mut self);
}
