//! Gapless scheduling of inbound chunks on the output clock.

use std::collections::BTreeSet;

use super::codec::InboundChunk;
use super::output::{OutputGraph, SourceId};

/// When the next chunk should begin, in output-clock seconds.
///
/// `None` means "unset": the next chunk starts at the current time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackTimeline {
    pub next_start_time: Option<f64>,
}

/// Sources scheduled on the output graph that have not finished yet.
pub type ActiveSources = BTreeSet<SourceId>;

/// Result of scheduling one chunk
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub source: SourceId,
    pub start: f64,
    pub duration: f64,
}

/// Owns the timeline and the set of live sources for one session.
pub struct PlaybackScheduler {
    output: Box<dyn OutputGraph>,
    timeline: PlaybackTimeline,
    active: ActiveSources,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn OutputGraph>) -> Self {
        Self {
            output,
            timeline: PlaybackTimeline::default(),
            active: ActiveSources::new(),
        }
    }

    /// Schedule `chunk` immediately after everything already queued.
    pub fn enqueue(&mut self, chunk: &InboundChunk) -> ScheduledChunk {
        let now = self.output.current_time();
        let start = self.timeline.next_start_time.unwrap_or(now).max(now);
        let duration = chunk.duration();

        let source = self.output.start_source(chunk, start);
        self.active.insert(source);
        self.timeline.next_start_time = Some(start + duration);

        log::debug!(
            "Enqueued {} at {:.3}s for {:.3}s ({} active)",
            source,
            start,
            duration,
            self.active.len()
        );

        ScheduledChunk {
            source,
            start,
            duration,
        }
    }

    /// Stop everything that is playing or queued and unset the timeline.
    pub fn interrupt(&mut self) {
        let drained = std::mem::take(&mut self.active);
        if !drained.is_empty() {
            log::info!("Interrupting playback ({} sources)", drained.len());
        }
        for source in drained {
            self.output.stop_source(source);
        }
        self.timeline.next_start_time = None;
    }

    pub fn reset_timeline_to_now(&mut self) {
        self.timeline.next_start_time = Some(self.output.current_time());
    }

    /// End-of-playback notification. Unknown ids are ignored.
    pub fn on_ended(&mut self, source: SourceId) {
        if !self.active.remove(&source) {
            log::trace!("Ignoring end of untracked source {}", source);
        }
    }

    /// Flush playback and hand the output graph back for the next session.
    pub fn shutdown(mut self) -> Box<dyn OutputGraph> {
        self.interrupt();
        self.output
    }

    pub fn next_start_time(&self) -> Option<f64> {
        self.timeline.next_start_time
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, source: SourceId) -> bool {
        self.active.contains(&source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::PLAYBACK_SAMPLE_RATE;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Log {
        now: f64,
        started: Vec<(SourceId, f64)>,
        stopped: Vec<SourceId>,
    }

    struct FakeOutput {
        log: Rc<RefCell<Log>>,
        next_id: u64,
    }

    impl OutputGraph for FakeOutput {
        fn sample_rate(&self) -> u32 {
            48_000
        }

        fn current_time(&self) -> f64 {
            self.log.borrow().now
        }

        fn start_source(&mut self, _chunk: &InboundChunk, at: f64) -> SourceId {
            let id = SourceId(self.next_id);
            self.next_id += 1;
            self.log.borrow_mut().started.push((id, at));
            id
        }

        fn stop_source(&mut self, source: SourceId) {
            self.log.borrow_mut().stopped.push(source);
        }
    }

    fn scheduler() -> (PlaybackScheduler, Rc<RefCell<Log>>) {
        let log = Rc::new(RefCell::new(Log::default()));
        let output = FakeOutput {
            log: log.clone(),
            next_id: 0,
        };
        (PlaybackScheduler::new(Box::new(output)), log)
    }

    fn chunk(seconds: f64) -> InboundChunk {
        let len = (seconds * PLAYBACK_SAMPLE_RATE as f64).round() as usize;
        InboundChunk {
            sample_rate: PLAYBACK_SAMPLE_RATE,
            channels: vec![vec![0.0; len]],
        }
    }

    #[test]
    fn test_back_to_back_chunks() {
        let (mut s, log) = scheduler();
        log.borrow_mut().now = 10.0;
        s.reset_timeline_to_now();

        let a = s.enqueue(&chunk(0.5));
        let b = s.enqueue(&chunk(0.3));

        assert!((a.start - 10.0).abs() < 1e-9);
        assert!((b.start - 10.5).abs() < 1e-9);
        assert!((s.next_start_time().unwrap_or_default() - 10.8).abs() < 1e-9);
        assert_eq!(s.active_count(), 2);
    }

    #[test]
    fn test_start_clamps_to_now_when_behind() {
        let (mut s, log) = scheduler();
        s.reset_timeline_to_now();
        s.enqueue(&chunk(0.2));

        // Output clock has moved past the end of the queue
        log.borrow_mut().now = 3.0;
        let late = s.enqueue(&chunk(0.1));

        assert!((late.start - 3.0).abs() < 1e-9);
        assert!((s.next_start_time().unwrap_or_default() - 3.1).abs() < 1e-9);
    }

    #[test]
    fn test_unset_timeline_starts_at_now() {
        let (mut s, log) = scheduler();
        log.borrow_mut().now = 1.25;

        let first = s.enqueue(&chunk(0.5));

        assert!((first.start - 1.25).abs() < 1e-9);
    }

    #[test]
    fn test_interrupt_stops_all_active() {
        let (mut s, log) = scheduler();
        s.reset_timeline_to_now();
        let a = s.enqueue(&chunk(0.5));
        let b = s.enqueue(&chunk(0.5));

        s.interrupt();

        assert_eq!(s.active_count(), 0);
        assert_eq!(s.next_start_time(), None);
        let stopped = log.borrow().stopped.clone();
        assert_eq!(stopped.len(), 2);
        assert!(stopped.contains(&a.source));
        assert!(stopped.contains(&b.source));

        // Idempotent
        s.interrupt();
        assert_eq!(log.borrow().stopped.len(), 2);
    }

    #[test]
    fn test_enqueue_after_interrupt_starts_at_now() {
        let (mut s, log) = scheduler();
        s.reset_timeline_to_now();
        s.enqueue(&chunk(2.0));
        s.enqueue(&chunk(2.0));

        log.borrow_mut().now = 0.7;
        s.interrupt();
        let next = s.enqueue(&chunk(0.1));

        assert!((next.start - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_on_ended_removes_and_ignores_unknown() {
        let (mut s, _log) = scheduler();
        let a = s.enqueue(&chunk(0.1));
        let b = s.enqueue(&chunk(0.1));

        s.on_ended(a.source);
        s.on_ended(SourceId(999));

        assert!(!s.is_active(a.source));
        assert!(s.is_active(b.source));
        assert_eq!(s.active_count(), 1);
    }

    #[test]
    fn test_stale_end_after_interrupt_is_ignored() {
        let (mut s, log) = scheduler();
        let a = s.enqueue(&chunk(0.1));
        s.interrupt();

        s.on_ended(a.source);

        assert_eq!(s.active_count(), 0);
        assert_eq!(log.borrow().stopped, vec![a.source]);
    }

    #[test]
    fn test_shutdown_flushes_and_returns_output() {
        let (mut s, log) = scheduler();
        s.enqueue(&chunk(0.3));

        let output = s.shutdown();

        assert_eq!(log.borrow().stopped.len(), 1);
        assert_eq!(output.sample_rate(), 48_000);
    }
}
