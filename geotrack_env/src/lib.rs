//! GeoTrack Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets the GeoTrack core run
//! against **Production** (tokio + STOMP over TCP) and **Simulation**
//! (paused clock + in-process broker) environments unchanged.
//!
//! # Core Concept
//!
//! Everything the synchronization core needs from the outside world is
//! intercepted here:
//! - Time (`now()`, `sleep()`)
//! - Tasks (`spawn()`)
//! - Randomness (`random_bearing()`)
//! - Push channels (`ChannelTransport::connect()` and `ChannelConnection`)
//!
//! # Example
//!
//! ```ignore
//! use geotrack_env::{ChannelTransport, Frame, TrackerContext};
//!
//! async fn pump<Ctx: TrackerContext, T: ChannelTransport>(ctx: &Ctx, transport: &T) {
//!     let mut conn = transport.connect(&endpoint, heartbeat).await?;
//!     conn.subscribe("/topic/locations/7").await?;
//!     loop {
//!         tokio::select! {
//!             frame = conn.recv() => handle(frame?),
//!             _ = ctx.sleep(Duration::from_secs(4)) => conn.send_heartbeat().await?,
//!         }
//!     }
//! }
//! ```

mod context;
mod error;
mod stomp;
mod tokio_impl;
mod transport;
mod types;

pub use context::TrackerContext;
pub use error::EnvError;
pub use stomp::{StompConnection, StompFrame, StompTransport, DEFAULT_MAX_FRAME_BYTES};
pub use tokio_impl::TokioContext;
pub use transport::{ChannelConnection, ChannelTransport};
pub use types::{Endpoint, Frame, HeartbeatConfig};
