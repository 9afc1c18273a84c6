//! Session channel to the remote conversational model
//!
//! The controller only sees two seams: a [`Connector`] that opens one channel
//! per session, and the [`ChannelSink`] it hands back for outbound frames.
//! Everything the channel observes comes back as session-tagged [`Event`]s.
//!
//! # Architecture
//!
//! ```text
//!  SessionRunner ──OutboundFrame──▶ LiveSink ──(bounded queue)──▶ channel task
//!                                                                     │
//!                                                                 WebSocket
//!                                                                     │
//!  controller ◀──ChannelOpened / ChannelMessage / ChannelError / ChannelClosed
//! ```
//!
//! # Failure Strategy
//!
//! - One connect per session, no retries and no reconnect
//! - A socket error reports `ChannelError` followed by `ChannelClosed`
//! - Restarting is a user action that opens a fresh session

mod live_client;
mod protocol;

pub use live_client::{
    LiveConfig, LiveConnector, LiveSink, DEFAULT_MODEL, DEFAULT_VOICE, LIVE_API_URL,
};
pub use protocol::{ClientMessage, Content, OutboundFrame, Part, ServerContent, ServerMessage};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::state_machine::Event;

/// Errors that can occur on the session channel
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("API key not configured. Set GEMINI_API_KEY (or API_KEY).")]
    MissingApiKey,
    #[error("Failed to connect to the Live API: {0}")]
    ConnectionFailed(String),
    #[error("Session setup rejected: {0}")]
    SetupRejected(String),
    #[error("WebSocket protocol error: {0}")]
    Protocol(String),
    #[error("Connection closed: {0}")]
    Closed(String),
    #[error("Failed to send audio: {0}")]
    SendFailed(String),
}

/// Outbound half of an open channel.
pub trait ChannelSink {
    /// Fire-and-forget; frames may be dropped under backpressure.
    fn send(&mut self, frame: OutboundFrame);

    /// Idempotent. No events are delivered for this channel afterwards.
    fn close(&mut self);
}

/// Opens session channels.
pub trait Connector {
    /// Start connecting; lifecycle events arrive on `events` tagged with `session`.
    fn connect(&self, session: Uuid, events: mpsc::Sender<Event>) -> Box<dyn ChannelSink>;
}

/// Get the API key from the environment
pub fn get_api_key() -> Option<String> {
    ["GEMINI_API_KEY", "API_KEY"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|key| !key.trim().is_empty())
}
