pub mod audio;
pub mod effects;
pub mod settings;
pub mod state_machine;
pub mod streaming;

use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::mpsc;

use effects::EffectRunner;
use state_machine::{reduce, ChannelState, Effect, Event, RecordingState, State};

/// Channel part of the status view.
/// Uses tagged union format: { "channel": "open" } or { "channel": "closed", "reason": "..." }
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "channel", rename_all = "camelCase")]
pub enum ChannelView {
    Idle,
    Connecting,
    Open,
    Closed { reason: String },
    Errored { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordingView {
    Off,
    Arming,
    On,
}

/// User-facing snapshot of the session, published after every visible change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    #[serde(flatten)]
    pub channel: ChannelView,
    pub recording: RecordingView,
    pub status: String,
    pub error: Option<String>,
}

impl StatusView {
    pub fn from_state(state: &State) -> Self {
        let channel = match &state.channel {
            ChannelState::Idle => ChannelView::Idle,
            ChannelState::Connecting { .. } => ChannelView::Connecting,
            ChannelState::Open { .. } => ChannelView::Open,
            ChannelState::Closed { reason, .. } => ChannelView::Closed {
                reason: reason.clone(),
            },
            ChannelState::Errored { message, .. } => ChannelView::Errored {
                message: message.clone(),
            },
        };
        let recording = match state.recording {
            RecordingState::Off => RecordingView::Off,
            RecordingState::Arming { .. } => RecordingView::Arming,
            RecordingState::On { .. } => RecordingView::On,
        };

        Self {
            channel,
            recording,
            status: state.status.clone(),
            error: state.error.clone(),
        }
    }
}

impl std::fmt::Display for StatusView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channel = match &self.channel {
            ChannelView::Idle => "idle",
            ChannelView::Connecting => "connecting",
            ChannelView::Open => "open",
            ChannelView::Closed { .. } => "closed",
            ChannelView::Errored { .. } => "error",
        };
        let recording = match self.recording {
            RecordingView::Off => "mic off",
            RecordingView::Arming => "mic starting",
            RecordingView::On => "mic on",
        };

        write!(f, "[{}] {}", channel, recording)?;
        if !self.status.is_empty() {
            write!(f, " | {}", self.status)?;
        }
        if let Some(error) = &self.error {
            write!(f, " | error: {}", error)?;
        }
        Ok(())
    }
}

/// Receives every published status view
pub type StatusSink = Box<dyn FnMut(&StatusView)>;

/// Producer side of the session's event queues.
///
/// Streamed traffic (captured frames, channel messages, user commands) goes
/// through a bounded queue. One-shot notifications that must never be lost
/// (device loss, playback end, exit) go through an unbounded control queue
/// that the session loop drains first.
#[derive(Clone)]
pub struct EventSender {
    queue: mpsc::Sender<Event>,
    control: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    /// Bounded queue for streamed traffic
    pub fn queue(&self) -> &mpsc::Sender<Event> {
        &self.queue
    }

    /// Deliver a one-shot notification. Never blocks and never drops while
    /// the session loop is alive. Returns `false` once the loop is gone.
    pub fn notify(&self, event: Event) -> bool {
        self.control.send(event).is_ok()
    }
}

/// Consumer side of the session's event queues
pub struct EventReceiver {
    queue: mpsc::Receiver<Event>,
    control: mpsc::UnboundedReceiver<Event>,
}

impl EventReceiver {
    /// Next event, control notifications first. `None` once both queues are closed.
    pub async fn recv(&mut self) -> Option<Event> {
        tokio::select! {
            biased;
            Some(event) = self.control.recv() => Some(event),
            Some(event) = self.queue.recv() => Some(event),
            else => None,
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<Event> {
        self.control
            .try_recv()
            .ok()
            .or_else(|| self.queue.try_recv().ok())
    }
}

/// Create the session's event queues. `capacity` bounds the streamed queue only.
pub fn event_queue(capacity: usize) -> (EventSender, EventReceiver) {
    let (queue_tx, queue_rx) = mpsc::channel(capacity);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    (
        EventSender {
            queue: queue_tx,
            control: control_tx,
        },
        EventReceiver {
            queue: queue_rx,
            control: control_rx,
        },
    )
}

/// Single-writer session loop: owns the state and the effect runner.
///
/// Runs on one task. Audio callbacks and the channel task only ever talk to
/// it through the event queue.
pub struct SessionDriver<R: EffectRunner> {
    state: State,
    runner: R,
    status_sink: StatusSink,
}

impl<R: EffectRunner> SessionDriver<R> {
    pub fn new(runner: R, status_sink: StatusSink) -> Self {
        Self {
            state: State::default(),
            runner,
            status_sink,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Reduce one event and run its effects to completion.
    ///
    /// Follow-up events returned by the runner are handled before this
    /// returns, in the order they were produced. Returns `false` on `Exit`.
    pub fn dispatch(&mut self, event: Event) -> bool {
        // Handle Exit at the edge
        if matches!(event, Event::Exit) {
            log::info!("Exit requested, shutting down session");
            self.runner.shutdown();
            return false;
        }

        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            match &event {
                Event::CaptureFrame { .. } | Event::PlaybackEnded { .. } => {
                    log::trace!("Received event: {:?}", event)
                }
                _ => log::debug!("Received event: {:?}", event),
            }

            let (next, effects) = reduce(&self.state, event);

            // Log state transitions
            if std::mem::discriminant(&next.channel) != std::mem::discriminant(&self.state.channel)
            {
                log::info!(
                    "State transition: {:?} -> {:?}",
                    self.state.channel,
                    next.channel
                );
            }
            if std::mem::discriminant(&next.recording)
                != std::mem::discriminant(&self.state.recording)
            {
                log::info!(
                    "Recording transition: {:?} -> {:?}",
                    self.state.recording,
                    next.recording
                );
            }

            self.state = next;

            // Execute effects
            for effect in effects {
                match effect {
                    Effect::EmitStatus => self.emit_status(),
                    other => pending.extend(self.runner.run(other)),
                }
            }
        }

        true
    }

    fn emit_status(&mut self) {
        let view = StatusView::from_state(&self.state);
        (self.status_sink)(&view);
    }

    /// Drain events until `Exit` (or until every sender is gone).
    pub async fn run(&mut self, mut rx: EventReceiver) {
        // Emit initial state
        self.emit_status();
        log::info!("Session loop started");

        let mut exited = false;
        while let Some(event) = rx.recv().await {
            if !self.dispatch(event) {
                exited = true;
                break;
            }
        }

        if !exited {
            self.runner.shutdown();
        }
        log::info!("Session loop ended");
    }
}
