//! Real-time room abstraction
//!
//! The session controller only needs four commands from the media connection
//! (connect, disconnect, microphone on/off) and two notifications (connection
//! lost, media device error). `RealtimeRoom` captures exactly that surface so
//! the controller can be driven by `WsRoom` in production and by a scripted
//! room in tests.

pub mod protocol;
mod ws;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::credentials::ConnectionDetails;
use crate::error::SessionError;

pub use ws::WsRoom;

/// Capacity of the room event broadcast channel
pub const ROOM_EVENT_CAPACITY: usize = 16;

/// Notifications the session controller consumes from the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// The connection dropped without a local `disconnect()`
    Disconnected { reason: String },
    /// The capture device failed while publishing
    MediaDevicesError { message: String },
}

#[async_trait]
pub trait RealtimeRoom: Send + Sync + 'static {
    /// Register for room notifications. Dropping the receiver deregisters.
    fn subscribe(&self) -> broadcast::Receiver<RoomEvent>;

    /// Open the connection using the issued server address and token.
    async fn connect(&self, details: &ConnectionDetails) -> Result<(), SessionError>;

    /// Close the connection. Best effort and idempotent.
    async fn disconnect(&self);

    /// Start or stop microphone capture. With `pre_connect_buffer` set, audio
    /// captured before the connection completes is held and sent on connect.
    async fn set_microphone_enabled(
        &self,
        enabled: bool,
        pre_connect_buffer: bool,
    ) -> Result<(), SessionError>;
}
