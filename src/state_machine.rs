//! State machine for the live voice session
//!
//! This module implements the session controller using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute.
//!
//! Channel and recording lifecycles are tracked side by side. Each carries
//! its own id so late events from a previous session or capture are dropped.

use uuid::Uuid;

use crate::audio::codec::{self, parse_pcm_rate, AudioFrame, InboundChunk, PLAYBACK_SAMPLE_RATE};
use crate::audio::SourceId;
use crate::streaming::{OutboundFrame, ServerMessage};

/// Status line shown after the remote side closes the channel
pub const CLOSED_STATUS: &str = "Connection closed. Please restart.";

/// Lifecycle of the session channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ChannelState {
    #[default]
    Idle,
    Connecting {
        session: Uuid,
    },
    Open {
        session: Uuid,
    },
    Closed {
        session: Uuid,
        reason: String,
    },
    Errored {
        session: Uuid,
        message: String,
    },
}

impl ChannelState {
    pub fn session(&self) -> Option<Uuid> {
        match self {
            ChannelState::Idle => None,
            ChannelState::Connecting { session }
            | ChannelState::Open { session }
            | ChannelState::Closed { session, .. }
            | ChannelState::Errored { session, .. } => Some(*session),
        }
    }
}

/// Microphone lifecycle, independent of the channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RecordingState {
    #[default]
    Off,
    Arming {
        capture: Uuid,
    },
    On {
        capture: Uuid,
    },
}

impl RecordingState {
    pub fn capture(&self) -> Option<Uuid> {
        match self {
            RecordingState::Off => None,
            RecordingState::Arming { capture } | RecordingState::On { capture } => Some(*capture),
        }
    }
}

/// Internal state of the session controller.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    pub channel: ChannelState,
    pub recording: RecordingState,
    /// User-visible status line
    pub status: String,
    /// User-visible, non-fatal error
    pub error: Option<String>,
}

impl State {
    pub fn is_open(&self) -> bool {
        matches!(self.channel, ChannelState::Open { .. })
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.recording, RecordingState::On { .. })
    }
}

/// Events that can trigger state transitions.
/// These are sent from the terminal, the audio callbacks and the channel task.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Open a session (initial connect or manual restart)
    StartSession,
    /// Application exit requested
    Exit,

    // Channel events
    ChannelOpened {
        session: Uuid,
    },
    ChannelMessage {
        session: Uuid,
        message: ServerMessage,
    },
    ChannelError {
        session: Uuid,
        message: String,
    },
    ChannelClosed {
        session: Uuid,
        reason: String,
    },

    // Recording controls
    StartRecording,
    StopRecording,
    ToggleRecording,

    // Capture events
    CaptureStarted {
        capture: Uuid,
    },
    CaptureFailed {
        capture: Uuid,
        err: String,
    },
    /// Device disappeared or the stream faulted mid-recording
    CaptureLost {
        capture: Uuid,
        err: String,
    },
    CaptureFrame {
        capture: Uuid,
        frame: AudioFrame,
    },

    // Playback events
    PlaybackEnded {
        source: SourceId,
    },
}

/// Effects to be executed after a state transition.
/// The effect runner executes these synchronously, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    OpenChannel {
        session: Uuid,
    },
    /// Close the channel sink; playback already queued keeps going
    ReleaseChannel {
        session: Uuid,
    },
    SendFrame {
        frame: OutboundFrame,
    },
    /// Anchor the playback timeline at the current output time
    ResetTimeline,
    EnqueueAudio {
        chunk: InboundChunk,
    },
    /// Stop every scheduled source and unset the timeline
    InterruptPlayback,
    ReleaseSource {
        source: SourceId,
    },
    StartCapture {
        capture: Uuid,
    },
    StopCapture {
        capture: Uuid,
    },
    /// Signal to publish the status view
    EmitStatus,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale session or capture IDs
/// - Emit EmitStatus after user-visible changes
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;

    let current_session = state.channel.session();
    let current_capture = state.recording.capture();

    match event {
        // -----------------
        // Session lifecycle
        // -----------------
        Event::StartSession => match &state.channel {
            ChannelState::Idle | ChannelState::Closed { .. } | ChannelState::Errored { .. } => {
                let session = Uuid::new_v4();
                let mut effects = Vec::new();
                if let ChannelState::Errored { session: old, .. } = &state.channel {
                    // Errored channels may not have seen their close yet
                    effects.push(ReleaseChannel { session: *old });
                }
                effects.push(OpenChannel { session });
                effects.push(EmitStatus);

                let next = State {
                    channel: ChannelState::Connecting { session },
                    status: "Connecting...".to_string(),
                    error: None,
                    ..state.clone()
                };
                (next, effects)
            }
            ChannelState::Connecting { .. } | ChannelState::Open { .. } => {
                log::debug!("StartSession ignored, session already active");
                (state.clone(), vec![])
            }
        },

        Event::ChannelOpened { session } => match &state.channel {
            ChannelState::Connecting { session: s } if *s == session => {
                log::info!("Session {} opened", session);
                let next = State {
                    channel: ChannelState::Open { session },
                    status: String::new(),
                    error: None,
                    ..state.clone()
                };
                (next, vec![ResetTimeline, EmitStatus])
            }
            _ => stale("ChannelOpened", state),
        },

        Event::ChannelMessage { session, message } => match &state.channel {
            ChannelState::Open { session: s } if *s == session => {
                handle_server_message(state, &message)
            }
            _ => stale("ChannelMessage", state),
        },

        Event::ChannelError { session, message } if current_session == Some(session) => {
            log::error!("Channel error on session {}: {}", session, message);
            let channel = match &state.channel {
                ChannelState::Connecting { .. } | ChannelState::Open { .. } => {
                    ChannelState::Errored {
                        session,
                        message: message.clone(),
                    }
                }
                other => other.clone(),
            };
            let next = State {
                channel,
                error: Some(message),
                ..state.clone()
            };
            (next, vec![EmitStatus])
        }
        Event::ChannelError { .. } => stale("ChannelError", state),

        Event::ChannelClosed { session, reason } if current_session == Some(session) => {
            if matches!(state.channel, ChannelState::Closed { .. }) {
                return (state.clone(), vec![]);
            }
            log::info!("Session {} closed: {:?}", session, reason);
            let next = State {
                channel: ChannelState::Closed { session, reason },
                status: CLOSED_STATUS.to_string(),
                ..state.clone()
            };
            (next, vec![ReleaseChannel { session }, EmitStatus])
        }
        Event::ChannelClosed { .. } => stale("ChannelClosed", state),

        // -----------------
        // Recording
        // -----------------
        Event::StartRecording => match state.recording {
            RecordingState::Off => {
                let capture = Uuid::new_v4();
                let next = State {
                    recording: RecordingState::Arming { capture },
                    error: None,
                    ..state.clone()
                };
                (next, vec![StartCapture { capture }, EmitStatus])
            }
            _ => (state.clone(), vec![]),
        },

        Event::StopRecording => match current_capture {
            Some(capture) => {
                let next = State {
                    recording: RecordingState::Off,
                    status: String::new(),
                    error: None,
                    ..state.clone()
                };
                // Stopping the mic also flushes any reply that is still playing
                (
                    next,
                    vec![StopCapture { capture }, InterruptPlayback, EmitStatus],
                )
            }
            None => (state.clone(), vec![]),
        },

        Event::ToggleRecording => {
            if current_capture.is_some() {
                reduce(state, Event::StopRecording)
            } else {
                reduce(state, Event::StartRecording)
            }
        }

        Event::CaptureStarted { capture } => match state.recording {
            RecordingState::Arming { capture: c } if c == capture => {
                log::info!("Recording started ({})", capture);
                let next = State {
                    recording: RecordingState::On { capture },
                    status: String::new(),
                    error: None,
                    ..state.clone()
                };
                (next, vec![EmitStatus])
            }
            _ => stale("CaptureStarted", state),
        },

        Event::CaptureFailed { capture, err } | Event::CaptureLost { capture, err }
            if current_capture == Some(capture) =>
        {
            log::error!("Capture {} failed: {}", capture, err);
            let next = State {
                recording: RecordingState::Off,
                error: Some(format!("Mic error: {}", err)),
                ..state.clone()
            };
            (next, vec![StopCapture { capture }, EmitStatus])
        }
        Event::CaptureFailed { .. } => stale("CaptureFailed", state),
        Event::CaptureLost { .. } => stale("CaptureLost", state),

        Event::CaptureFrame { capture, frame } => {
            let live = matches!(state.recording, RecordingState::On { capture: c } if c == capture);
            if live && state.is_open() {
                let frame = OutboundFrame {
                    media: codec::encode(&frame),
                };
                (state.clone(), vec![SendFrame { frame }])
            } else {
                (state.clone(), vec![])
            }
        }

        // -----------------
        // Playback
        // -----------------
        Event::PlaybackEnded { source } => (state.clone(), vec![ReleaseSource { source }]),

        // Exit is handled by the driver before reaching the reducer
        Event::Exit => (state.clone(), vec![]),
    }
}

/// Open-state handling of one server message: audio first, then interruption.
fn handle_server_message(state: &State, message: &ServerMessage) -> (State, Vec<Effect>) {
    let mut next = State {
        error: None,
        ..state.clone()
    };
    let mut effects = Vec::new();

    if let Some(blob) = message.inline_audio() {
        match codec::decode(&blob.data) {
            Ok(bytes) => {
                let rate = parse_pcm_rate(&blob.mime_type).unwrap_or(PLAYBACK_SAMPLE_RATE);
                let chunk = codec::decode_audio_data(&bytes, rate, 1);
                if chunk.is_empty() {
                    log::debug!("Skipping empty audio chunk");
                } else {
                    effects.push(Effect::EnqueueAudio { chunk });
                }
            }
            Err(e) => {
                log::warn!("Dropping server audio: {}", e);
                next.error = Some(e.to_string());
            }
        }
    }

    if message.is_interrupted() {
        log::info!("Model output interrupted");
        effects.push(Effect::InterruptPlayback);
    }

    if message.is_turn_complete() {
        log::debug!("Model turn complete");
    }

    if let Some(go_away) = &message.go_away {
        log::warn!("Server going away (time left: {:?})", go_away.time_left);
    }

    if next.error != state.error {
        effects.push(Effect::EmitStatus);
    }

    (next, effects)
}

fn stale(kind: &str, state: &State) -> (State, Vec<Effect>) {
    log::debug!("Ignoring stale {} event", kind);
    (state.clone(), vec![])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{EncodedBlob, CAPTURE_SAMPLE_RATE, FRAME_SIZE};
    use crate::streaming::{Content, Part, ServerContent};

    fn open_state() -> (State, Uuid) {
        let session = Uuid::new_v4();
        let state = State {
            channel: ChannelState::Open { session },
            ..State::default()
        };
        (state, session)
    }

    fn audio_message(data: &str, interrupted: bool) -> ServerMessage {
        ServerMessage {
            server_content: Some(ServerContent {
                model_turn: Some(Content {
                    parts: vec![Part {
                        text: None,
                        inline_data: Some(EncodedBlob {
                            mime_type: "audio/pcm;rate=24000".to_string(),
                            data: data.to_string(),
                        }),
                    }],
                }),
                interrupted,
                turn_complete: false,
            }),
            ..ServerMessage::default()
        }
    }

    fn frame() -> AudioFrame {
        AudioFrame::new(vec![0.1; FRAME_SIZE], CAPTURE_SAMPLE_RATE, 0)
    }

    #[test]
    fn idle_start_session_transitions_to_connecting() {
        let (next, effects) = reduce(&State::default(), Event::StartSession);

        let session = match next.channel {
            ChannelState::Connecting { session } => session,
            other => panic!("Expected Connecting, got {:?}", other),
        };
        assert_eq!(effects[0], Effect::OpenChannel { session });
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitStatus)));
    }

    #[test]
    fn start_session_while_active_is_a_no_op() {
        let (state, _) = open_state();
        let (next, effects) = reduce(&state, Event::StartSession);

        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn connecting_opened_resets_timeline() {
        let session = Uuid::new_v4();
        let state = State {
            channel: ChannelState::Connecting { session },
            status: "Connecting...".to_string(),
            ..State::default()
        };
        let (next, effects) = reduce(&state, Event::ChannelOpened { session });

        assert_eq!(next.channel, ChannelState::Open { session });
        assert!(next.status.is_empty());
        assert_eq!(effects, vec![Effect::ResetTimeline, Effect::EmitStatus]);
    }

    #[test]
    fn stale_session_event_is_ignored() {
        let session = Uuid::new_v4();
        let state = State {
            channel: ChannelState::Connecting { session },
            ..State::default()
        };
        let (next, effects) = reduce(
            &state,
            Event::ChannelOpened {
                session: Uuid::new_v4(),
            },
        );

        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn message_with_audio_enqueues_chunk() {
        let (state, session) = open_state();
        // Two samples: 0 and 32767
        let message = audio_message("AAD/fw==", false);
        let (next, effects) = reduce(&state, Event::ChannelMessage { session, message });

        assert!(next.is_open());
        match &effects[0] {
            Effect::EnqueueAudio { chunk } => {
                assert_eq!(chunk.sample_rate, 24_000);
                assert_eq!(chunk.channels.len(), 1);
                assert_eq!(chunk.len(), 2);
            }
            other => panic!("Expected EnqueueAudio, got {:?}", other),
        }
    }

    #[test]
    fn audio_is_enqueued_before_interrupt() {
        let (state, session) = open_state();
        let message = audio_message("AAD/fw==", true);
        let (_, effects) = reduce(&state, Event::ChannelMessage { session, message });

        assert_eq!(effects.len(), 2);
        assert!(matches!(effects[0], Effect::EnqueueAudio { .. }));
        assert_eq!(effects[1], Effect::InterruptPlayback);
    }

    #[test]
    fn malformed_audio_surfaces_error_and_stays_open() {
        let (state, session) = open_state();
        let message = audio_message("not base64!!", false);
        let (next, effects) = reduce(&state, Event::ChannelMessage { session, message });

        assert!(next.is_open());
        assert!(next.error.as_deref().unwrap_or("").contains("base64"));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::EnqueueAudio { .. })));
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitStatus)));
    }

    #[test]
    fn next_message_clears_previous_error() {
        let (mut state, session) = open_state();
        state.error = Some("invalid base64".to_string());
        let (next, _) = reduce(
            &state,
            Event::ChannelMessage {
                session,
                message: ServerMessage::default(),
            },
        );

        assert_eq!(next.error, None);
    }

    #[test]
    fn channel_error_while_open_transitions_to_errored() {
        let (state, session) = open_state();
        let (next, effects) = reduce(
            &state,
            Event::ChannelError {
                session,
                message: "socket reset".to_string(),
            },
        );

        assert!(matches!(next.channel, ChannelState::Errored { .. }));
        assert_eq!(next.error.as_deref(), Some("socket reset"));
        // No retry
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::OpenChannel { .. })));
    }

    #[test]
    fn channel_closed_releases_and_sets_status() {
        let (state, session) = open_state();
        let (next, effects) = reduce(
            &state,
            Event::ChannelClosed {
                session,
                reason: "bye".to_string(),
            },
        );

        assert!(matches!(next.channel, ChannelState::Closed { .. }));
        assert_eq!(next.status, CLOSED_STATUS);
        assert_eq!(effects[0], Effect::ReleaseChannel { session });

        // A second close is ignored
        let (again, effects) = reduce(
            &next,
            Event::ChannelClosed {
                session,
                reason: "bye".to_string(),
            },
        );
        assert_eq!(again, next);
        assert!(effects.is_empty());
    }

    #[test]
    fn restart_from_errored_releases_old_channel() {
        let old = Uuid::new_v4();
        let state = State {
            channel: ChannelState::Errored {
                session: old,
                message: "boom".to_string(),
            },
            error: Some("boom".to_string()),
            ..State::default()
        };
        let (next, effects) = reduce(&state, Event::StartSession);

        assert!(matches!(next.channel, ChannelState::Connecting { .. }));
        assert_eq!(next.error, None);
        assert_eq!(effects[0], Effect::ReleaseChannel { session: old });
        assert!(matches!(effects[1], Effect::OpenChannel { session } if session != old));
    }

    #[test]
    fn start_recording_arms_capture() {
        let (next, effects) = reduce(&State::default(), Event::StartRecording);

        let capture = match next.recording {
            RecordingState::Arming { capture } => capture,
            other => panic!("Expected Arming, got {:?}", other),
        };
        assert_eq!(effects[0], Effect::StartCapture { capture });

        let (on, _) = reduce(&next, Event::CaptureStarted { capture });
        assert!(on.is_recording());
    }

    #[test]
    fn capture_failure_surfaces_mic_error() {
        let capture = Uuid::new_v4();
        let state = State {
            recording: RecordingState::Arming { capture },
            ..State::default()
        };
        let (next, effects) = reduce(
            &state,
            Event::CaptureFailed {
                capture,
                err: "no input device".to_string(),
            },
        );

        assert_eq!(next.recording, RecordingState::Off);
        assert_eq!(next.error.as_deref(), Some("Mic error: no input device"));
        assert!(effects.contains(&Effect::StopCapture { capture }));
    }

    #[test]
    fn device_lost_mid_capture_stops_recording_and_keeps_session() {
        let (open, session) = open_state();
        let capture = Uuid::new_v4();
        let state = State {
            recording: RecordingState::On { capture },
            ..open
        };

        let (next, effects) = reduce(
            &state,
            Event::CaptureLost {
                capture,
                err: "audio input device lost: device not available".to_string(),
            },
        );

        assert_eq!(next.recording, RecordingState::Off);
        assert_eq!(next.channel, ChannelState::Open { session });
        assert_eq!(
            next.error.as_deref(),
            Some("Mic error: audio input device lost: device not available")
        );
        assert_eq!(
            effects,
            vec![Effect::StopCapture { capture }, Effect::EmitStatus]
        );
    }

    #[test]
    fn device_lost_for_previous_capture_is_ignored() {
        let capture = Uuid::new_v4();
        let state = State {
            recording: RecordingState::On { capture },
            ..State::default()
        };

        let (next, effects) = reduce(
            &state,
            Event::CaptureLost {
                capture: Uuid::new_v4(),
                err: "gone".to_string(),
            },
        );

        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn stop_recording_stops_capture_and_flushes_playback() {
        let capture = Uuid::new_v4();
        let state = State {
            recording: RecordingState::On { capture },
            ..State::default()
        };
        let (next, effects) = reduce(&state, Event::StopRecording);

        assert_eq!(next.recording, RecordingState::Off);
        assert_eq!(
            effects,
            vec![
                Effect::StopCapture { capture },
                Effect::InterruptPlayback,
                Effect::EmitStatus
            ]
        );
    }

    #[test]
    fn toggle_alternates_start_and_stop() {
        let (armed, _) = reduce(&State::default(), Event::ToggleRecording);
        assert!(matches!(armed.recording, RecordingState::Arming { .. }));

        let (off, effects) = reduce(&armed, Event::ToggleRecording);
        assert_eq!(off.recording, RecordingState::Off);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StopCapture { .. })));
    }

    #[test]
    fn frame_is_sent_only_when_open_and_recording() {
        let (mut state, _) = open_state();
        let capture = Uuid::new_v4();
        state.recording = RecordingState::On { capture };

        let (_, effects) = reduce(
            &state,
            Event::CaptureFrame {
                capture,
                frame: frame(),
            },
        );
        match &effects[..] {
            [Effect::SendFrame { frame }] => {
                assert_eq!(frame.media.mime_type, "audio/pcm;rate=16000");
            }
            other => panic!("Expected one SendFrame, got {:?}", other),
        }

        // Stale capture id
        let (_, effects) = reduce(
            &state,
            Event::CaptureFrame {
                capture: Uuid::new_v4(),
                frame: frame(),
            },
        );
        assert!(effects.is_empty());

        // Channel not open
        state.channel = ChannelState::Idle;
        let (_, effects) = reduce(
            &state,
            Event::CaptureFrame {
                capture,
                frame: frame(),
            },
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn playback_ended_releases_source() {
        let (_, effects) = reduce(
            &State::default(),
            Event::PlaybackEnded {
                source: SourceId(3),
            },
        );
        assert_eq!(
            effects,
            vec![Effect::ReleaseSource {
                source: SourceId(3)
            }]
        );
    }
}
