//! Gapless playback scheduling
//!
//! Buffers arrive at network-determined intervals but must play back to back.
//! The scheduler keeps a cursor `next_start` in device time: each buffer
//! starts at `max(next_start, now)` and advances the cursor by its duration.

use crate::audio::device::{Held, PlaybackHandle, PlaybackSink};
use crate::audio::frame::AudioFrame;
use crate::error::Result;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

struct Scheduled {
    handle: Box<dyn PlaybackHandle>,
    ends_at: Duration,
}

/// Owns the speaker for one session and the playback cursor.
pub struct PlaybackScheduler {
    sink: Held<dyn PlaybackSink>,
    next_start: Duration,
    active: VecDeque<Scheduled>,
}

impl PlaybackScheduler {
    pub fn new(sink: Held<dyn PlaybackSink>) -> Self {
        Self {
            sink,
            next_start: Duration::ZERO,
            active: VecDeque::new(),
        }
    }

    /// Schedule a decoded buffer right after the previous one. Returns the
    /// device time it starts at.
    pub fn enqueue(&mut self, frame: &AudioFrame) -> Result<Duration> {
        let now = self.sink.clock_now();
        self.prune(now);

        let start = self.next_start.max(now);
        let handle = self.sink.schedule(frame, start)?;
        let ends_at = start + frame.duration();
        self.next_start = ends_at;
        self.active.push_back(Scheduled { handle, ends_at });

        debug!(
            "Scheduled {} samples at {:?} (queued {})",
            frame.samples().len(),
            start,
            self.active.len()
        );
        Ok(start)
    }

    /// Audio still queued ahead of the device clock.
    pub fn remaining(&self) -> Duration {
        self.next_start.saturating_sub(self.sink.clock_now())
    }

    pub fn next_start(&self) -> Duration {
        self.next_start
    }

    /// Number of tracked buffers that have not finished playing.
    pub fn pending(&self) -> usize {
        let now = self.sink.clock_now();
        self.active.iter().filter(|s| s.ends_at > now).count()
    }

    /// Cancel every scheduled buffer and reset the cursor. Returns how many
    /// buffers were cancelled.
    pub fn flush(&mut self) -> usize {
        let cancelled = self.active.len();
        for mut scheduled in self.active.drain(..) {
            scheduled.handle.cancel();
        }
        self.next_start = Duration::ZERO;
        if cancelled > 0 {
            debug!("Flushed {} scheduled buffers", cancelled);
        }
        cancelled
    }

    fn prune(&mut self, now: Duration) {
        while self.active.front().is_some_and(|s| s.ends_at <= now) {
            self.active.pop_front();
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::Release;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct FakeState {
        now: Duration,
        starts: Vec<Duration>,
        cancelled: usize,
        released: bool,
    }

    struct FakeSink(Arc<Mutex<FakeState>>);

    struct FakeHandle(Arc<Mutex<FakeState>>);

    impl PlaybackHandle for FakeHandle {
        fn cancel(&mut self) {
            self.0.lock().cancelled += 1;
        }
    }

    impl Release for FakeSink {
        fn release(&mut self) {
            self.0.lock().released = true;
        }
    }

    impl PlaybackSink for FakeSink {
        fn clock_now(&self) -> Duration {
            self.0.lock().now
        }

        fn schedule(
            &mut self,
            _frame: &AudioFrame,
            start_at: Duration,
        ) -> Result<Box<dyn PlaybackHandle>> {
            self.0.lock().starts.push(start_at);
            Ok(Box::new(FakeHandle(self.0.clone())))
        }
    }

    fn scheduler() -> (PlaybackScheduler, Arc<Mutex<FakeState>>) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        let sink: Box<dyn PlaybackSink> = Box::new(FakeSink(state.clone()));
        (PlaybackScheduler::new(Held::new(sink)), state)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn buffer(millis: usize) -> AudioFrame {
        AudioFrame::mono(vec![0.0; 24 * millis], 24_000)
    }

    #[test]
    fn test_buffers_are_contiguous() {
        let (mut scheduler, state) = scheduler();
        state.lock().now = ms(1000);

        assert_eq!(scheduler.enqueue(&buffer(100)).unwrap(), ms(1000));
        state.lock().now = ms(1030);
        assert_eq!(scheduler.enqueue(&buffer(250)).unwrap(), ms(1100));
        state.lock().now = ms(1200);
        assert_eq!(scheduler.enqueue(&buffer(40)).unwrap(), ms(1350));
        assert_eq!(scheduler.next_start(), ms(1390));
        assert_eq!(scheduler.remaining(), ms(190));
        assert_eq!(state.lock().starts, vec![ms(1000), ms(1100), ms(1350)]);
    }

    #[test]
    fn test_late_buffer_starts_at_device_time() {
        let (mut scheduler, state) = scheduler();
        scheduler.enqueue(&buffer(100)).unwrap();
        state.lock().now = ms(500);
        assert_eq!(scheduler.enqueue(&buffer(100)).unwrap(), ms(500));
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn test_flush_cancels_everything_and_resets_cursor() {
        for queued in [0usize, 1, 7] {
            let (mut scheduler, state) = scheduler();
            state.lock().now = ms(20);
            for _ in 0..queued {
                scheduler.enqueue(&buffer(200)).unwrap();
            }
            assert_eq!(scheduler.flush(), queued);
            assert_eq!(state.lock().cancelled, queued);
            assert_eq!(scheduler.next_start(), Duration::ZERO);
            assert_eq!(scheduler.pending(), 0);
            assert_eq!(scheduler.remaining(), Duration::ZERO);

            assert_eq!(scheduler.enqueue(&buffer(10)).unwrap(), ms(20));
        }
    }

    #[test]
    fn test_finished_buffers_are_pruned() {
        let (mut scheduler, state) = scheduler();
        scheduler.enqueue(&buffer(100)).unwrap();
        scheduler.enqueue(&buffer(100)).unwrap();
        state.lock().now = ms(250);
        scheduler.enqueue(&buffer(100)).unwrap();
        assert_eq!(scheduler.active.len(), 1);
        assert_eq!(scheduler.flush(), 1);
    }

    #[test]
    fn test_drop_releases_sink() {
        let (mut scheduler, state) = scheduler();
        scheduler.enqueue(&buffer(100)).unwrap();
        drop(scheduler);
        let state = state.lock();
        assert!(state.released);
        assert_eq!(state.cancelled, 1);
    }
}
