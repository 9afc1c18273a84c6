//! Gemini Live API WebSocket client
//!
//! Manages the WebSocket connection lifecycle for one voice session.
//!
//! # Connection Flow
//!
//! 1. `connect()` - spawn the channel task and return the outbound sink
//! 2. Channel task connects, sends `setup`, waits for `setupComplete`
//! 3. `ChannelOpened` is delivered, then frames flow in both directions
//! 4. `close()` - drop the outbound queue; the task sends a Close frame and exits
//!
//! There is no retry: a failed connect or a dropped socket surfaces as
//! `ChannelError` / `ChannelClosed` and the user restarts the session.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;

use super::protocol::{ClientMessage, OutboundFrame, ServerMessage};
use super::{ChannelError, ChannelSink, Connector};
use crate::state_machine::Event;

/// Gemini Live API endpoint (API key is appended as `?key=`)
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Native-audio dialog model
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-preview-native-audio-dialog";

/// Prebuilt voice for replies
pub const DEFAULT_VOICE: &str = "Orus";

/// Connection timeout for initial WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for waiting for setupComplete
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a graceful close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Log a warning for the first dropped frame and every Nth after
const DROP_WARN_INTERVAL: u64 = 100;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection parameters for the Live API
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: Option<String>,
    /// Outbound frames buffered while the socket is slow
    pub outbound_queue_frames: usize,
}

impl LiveConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: LIVE_API_URL.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            system_instruction: None,
            outbound_queue_frames: 256,
        }
    }

    /// Full connect URL including the key
    pub fn url(&self) -> String {
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, sep, self.api_key)
    }

    fn setup_message(&self) -> ClientMessage {
        ClientMessage::setup(
            &self.model,
            &self.voice_name,
            self.system_instruction.as_deref(),
        )
    }
}

/// Opens Live API channels. Must be used from within a tokio runtime.
pub struct LiveConnector {
    config: LiveConfig,
}

impl LiveConnector {
    pub fn new(config: LiveConfig) -> Self {
        Self { config }
    }
}

impl Connector for LiveConnector {
    fn connect(&self, session: Uuid, events: mpsc::Sender<Event>) -> Box<dyn ChannelSink> {
        log::info!("Opening live channel for session {}", session);

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue_frames.max(1));
        let task = tokio::spawn(run_channel(
            self.config.clone(),
            session,
            outbound_rx,
            events,
        ));

        Box::new(LiveSink {
            session,
            outbound: Some(outbound_tx),
            task,
            dropped: 0,
        })
    }
}

/// Outbound handle for one live channel
pub struct LiveSink {
    session: Uuid,
    /// `None` once closed
    outbound: Option<mpsc::Sender<OutboundFrame>>,
    task: tokio::task::JoinHandle<()>,
    dropped: u64,
}

impl LiveSink {
    /// Frames dropped because the outbound queue was full
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }
}

impl ChannelSink for LiveSink {
    fn send(&mut self, frame: OutboundFrame) {
        let Some(tx) = &self.outbound else {
            return;
        };

        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                if self.dropped == 1 || self.dropped % DROP_WARN_INTERVAL == 0 {
                    log::warn!(
                        "Outbound queue full, dropped {} frame(s) on session {}",
                        self.dropped,
                        self.session
                    );
                }
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Channel task for {} has exited, discarding frames", self.session);
                self.outbound = None;
            }
        }
    }

    fn close(&mut self) {
        // Dropping the sender tells the task to send a Close frame and exit
        if self.outbound.take().is_some() {
            log::info!("Closing live channel for session {}", self.session);
        }
    }
}

impl Drop for LiveSink {
    fn drop(&mut self) {
        // Closed sinks let the task finish its goodbye; otherwise stop it now
        if self.outbound.is_some() {
            self.task.abort();
        }
    }
}

/// Connect, run setup, and wait for `setupComplete`.
async fn open_socket(config: &LiveConfig) -> Result<WsStream, ChannelError> {
    let request = config
        .url()
        .into_client_request()
        .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

    log::info!("Connecting to Live API ({})...", config.endpoint);

    let (mut ws, _response) = timeout(
        CONNECTION_TIMEOUT,
        connect_async_with_config(request, None, true),
    )
    .await
    .map_err(|_| ChannelError::ConnectionFailed("Connection timeout".to_string()))?
    .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

    let setup = serde_json::to_string(&config.setup_message())
        .map_err(|e| ChannelError::Protocol(e.to_string()))?;
    ws.send(Message::Text(setup))
        .await
        .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

    log::info!("WebSocket connected, waiting for setupComplete...");

    timeout(SETUP_TIMEOUT, wait_for_setup(&mut ws))
        .await
        .map_err(|_| ChannelError::SetupRejected("Setup timeout".to_string()))??;

    Ok(ws)
}

async fn wait_for_setup(ws: &mut WsStream) -> Result<(), ChannelError> {
    while let Some(msg_result) = ws.next().await {
        let text = match msg_result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .unwrap_or_else(|| "closed during setup".to_string());
                return Err(ChannelError::SetupRejected(reason));
            }
            Ok(_) => continue,
            Err(e) => return Err(ChannelError::Protocol(e.to_string())),
        };

        match ServerMessage::parse(&text) {
            Ok(msg) if msg.is_setup_complete() => {
                log::info!("Live session setup complete");
                return Ok(());
            }
            Ok(_) => log::debug!("Ignoring message while waiting for setupComplete"),
            Err(e) => log::warn!("Failed to parse message: {}", e),
        }
    }

    Err(ChannelError::Closed("Stream ended during setup".to_string()))
}

/// Body of the per-session channel task.
async fn run_channel(
    config: LiveConfig,
    session: Uuid,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    events: mpsc::Sender<Event>,
) {
    let ws = match open_socket(&config).await {
        Ok(ws) => ws,
        Err(e) => {
            log::error!("Live channel for {} failed to open: {}", session, e);
            report_failure(&events, session, e).await;
            return;
        }
    };

    if events.send(Event::ChannelOpened { session }).await.is_err() {
        return;
    }

    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    let json = match serde_json::to_string(&ClientMessage::from(frame)) {
                        Ok(json) => json,
                        Err(e) => {
                            log::warn!("Failed to serialize frame: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(json)).await {
                        log::warn!("WebSocket send failed: {}", e);
                        report_failure(&events, session, ChannelError::SendFailed(e.to_string()))
                            .await;
                        break;
                    }
                }
                None => {
                    log::debug!("Outbound queue closed, closing socket");
                    if timeout(CLOSE_TIMEOUT, write.close()).await.is_err() {
                        log::warn!("Timed out closing WebSocket");
                    }
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if !forward_message(&events, session, &text).await {
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        if !forward_message(&events, session, &text).await {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Dropping non-UTF-8 binary message: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_default();
                    log::info!("WebSocket closed by server: {:?}", reason);
                    let _ = events.send(Event::ChannelClosed { session, reason }).await;
                    break;
                }
                Some(Ok(_)) => {} // Ping/pong are answered by tungstenite
                Some(Err(e)) => {
                    log::warn!("WebSocket error: {}", e);
                    report_failure(&events, session, ChannelError::Protocol(e.to_string())).await;
                    break;
                }
                None => {
                    log::info!("WebSocket stream ended");
                    let _ = events
                        .send(Event::ChannelClosed {
                            session,
                            reason: "stream ended".to_string(),
                        })
                        .await;
                    break;
                }
            },
        }
    }

    log::debug!("Channel task for {} exiting", session);
}

/// Returns false once the controller has gone away.
async fn forward_message(events: &mpsc::Sender<Event>, session: Uuid, text: &str) -> bool {
    match ServerMessage::parse(text) {
        Ok(message) => events
            .send(Event::ChannelMessage { session, message })
            .await
            .is_ok(),
        Err(e) => {
            log::warn!("Failed to parse message: {}", e);
            true
        }
    }
}

async fn report_failure(events: &mpsc::Sender<Event>, session: Uuid, error: ChannelError) {
    let message = error.to_string();
    if events
        .send(Event::ChannelError {
            session,
            message: message.clone(),
        })
        .await
        .is_ok()
    {
        let _ = events
            .send(Event::ChannelClosed {
                session,
                reason: message,
            })
            .await;
    }
}
