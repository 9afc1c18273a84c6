//! Effect runner for the live voice session
//!
//! This module executes effects produced by the state machine. It owns the
//! collaborators (capture source, output graph, playback scheduler and the
//! session channel) and is only ever touched from the session task.

use uuid::Uuid;

use crate::audio::{
    AudioFrame, CaptureError, FaultHandler, FrameConsumer, FrameSource, OutputGraph,
    PlaybackScheduler,
};
use crate::state_machine::{Effect, Event};
use crate::streaming::{ChannelSink, Connector};
use crate::EventSender;

/// Trait for running effects.
///
/// Effects run to completion on the calling task. Events produced
/// synchronously (e.g. `CaptureStarted`) are returned to the caller and must
/// be processed before the next queued event.
pub trait EffectRunner {
    fn run(&mut self, effect: Effect) -> Vec<Event>;

    /// Stop capture, flush playback and close the channel.
    fn shutdown(&mut self);
}

struct ActiveChannel {
    session: Uuid,
    sink: Box<dyn ChannelSink>,
}

/// Effect runner backed by real (or injected) audio and channel components.
pub struct SessionRunner {
    connector: Box<dyn Connector>,
    capture: Box<dyn FrameSource>,
    /// Output graph while no session owns it
    idle_output: Option<Box<dyn OutputGraph>>,
    /// One scheduler per session, discarded when the next one starts
    scheduler: Option<PlaybackScheduler>,
    channel: Option<ActiveChannel>,
    events: EventSender,
}

impl SessionRunner {
    pub fn new(
        connector: Box<dyn Connector>,
        capture: Box<dyn FrameSource>,
        output: Box<dyn OutputGraph>,
        events: EventSender,
    ) -> Self {
        Self {
            connector,
            capture,
            idle_output: Some(output),
            scheduler: None,
            channel: None,
            events,
        }
    }

    /// Flush the previous session's playback and bind a fresh scheduler.
    fn rotate_scheduler(&mut self) {
        let output = match self.scheduler.take() {
            Some(previous) => Some(previous.shutdown()),
            None => self.idle_output.take(),
        };
        match output {
            Some(output) => self.scheduler = Some(PlaybackScheduler::new(output)),
            None => log::error!("No output graph available for playback"),
        }
    }

    fn close_channel(&mut self) {
        if let Some(mut active) = self.channel.take() {
            active.sink.close();
            log::debug!("Released channel for session {}", active.session);
        }
    }

    fn start_capture(&mut self, capture: Uuid) -> Vec<Event> {
        if self.capture.is_running() {
            log::warn!("Capture still running, restarting for {}", capture);
            self.capture.stop();
        }

        let frames = self.events.queue().clone();
        let consumer: FrameConsumer = Box::new(move |frame: AudioFrame| {
            // Never block the audio thread; a full queue drops the frame
            if frames
                .try_send(Event::CaptureFrame { capture, frame })
                .is_err()
            {
                log::trace!("Event queue full, dropping captured frame");
            }
        });

        // Faults are reported once per stream, so they take the lossless path
        let faults = self.events.clone();
        let on_fault: FaultHandler = Box::new(move |err: CaptureError| {
            let reported = faults.notify(Event::CaptureLost {
                capture,
                err: err.to_string(),
            });
            if !reported {
                log::warn!("Session loop gone, dropping capture fault: {}", err);
            }
        });

        match self.capture.start(consumer, on_fault) {
            Ok(()) => vec![Event::CaptureStarted { capture }],
            Err(e) => {
                log::error!("Failed to start capture: {}", e);
                vec![Event::CaptureFailed {
                    capture,
                    err: e.to_string(),
                }]
            }
        }
    }

    /// Whether a session channel is currently held
    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    /// Number of playback sources still scheduled
    pub fn active_sources(&self) -> usize {
        self.scheduler
            .as_ref()
            .map(|s| s.active_count())
            .unwrap_or(0)
    }
}

impl EffectRunner for SessionRunner {
    fn run(&mut self, effect: Effect) -> Vec<Event> {
        match effect {
            Effect::OpenChannel { session } => {
                self.close_channel();
                self.rotate_scheduler();
                let sink = self
                    .connector
                    .connect(session, self.events.queue().clone());
                self.channel = Some(ActiveChannel { session, sink });
            }

            Effect::ReleaseChannel { session } => {
                if self.channel.as_ref().map(|active| active.session) == Some(session) {
                    self.close_channel();
                } else {
                    log::debug!("ReleaseChannel for inactive session {}", session);
                }
            }

            Effect::SendFrame { frame } => {
                if let Some(active) = self.channel.as_mut() {
                    active.sink.send(frame);
                }
            }

            Effect::ResetTimeline => {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.reset_timeline_to_now();
                }
            }

            Effect::EnqueueAudio { chunk } => match self.scheduler.as_mut() {
                Some(scheduler) => {
                    scheduler.enqueue(&chunk);
                }
                None => log::warn!("Dropping audio chunk, no playback scheduler"),
            },

            Effect::InterruptPlayback => {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.interrupt();
                }
            }

            Effect::ReleaseSource { source } => {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.on_ended(source);
                }
            }

            Effect::StartCapture { capture } => return self.start_capture(capture),

            Effect::StopCapture { capture } => {
                log::info!("Stopping capture {}", capture);
                self.capture.stop();
            }

            // Published by the driver
            Effect::EmitStatus => {}
        }

        Vec::new()
    }

    fn shutdown(&mut self) {
        log::info!("Shutting down session runner");
        self.capture.stop();
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.interrupt();
        }
        self.close_channel();
    }
}
