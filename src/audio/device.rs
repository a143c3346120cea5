//! Audio device seams
//!
//! The engine never talks to a sound server directly. Microphones and
//! speakers are acquired through these traits and held in [`Held`] guards,
//! so every exit path (stop, error, a dropped connect attempt) releases them.

use crate::audio::frame::AudioFrame;
use crate::error::Result;
use async_trait::async_trait;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

/// Something that must be handed back to the platform when no longer used.
pub trait Release {
    fn release(&mut self);
}

/// Owning guard that calls [`Release::release`] exactly once, on drop.
pub struct Held<T: ?Sized + Release> {
    inner: Box<T>,
}

impl<T: ?Sized + Release> Held<T> {
    pub fn new(inner: Box<T>) -> Self {
        Self { inner }
    }
}

impl<T: ?Sized + Release> Deref for Held<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: ?Sized + Release> DerefMut for Held<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: ?Sized + Release> Drop for Held<T> {
    fn drop(&mut self) {
        self.inner.release();
    }
}

/// Platform microphone.
///
/// `acquire` fails with `PermissionDenied` when the user refuses access and
/// with `DeviceUnavailable` when the device is busy or missing.
#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    async fn acquire(&self) -> Result<Held<dyn MicrophoneHandle>>;
}

/// An open microphone producing raw sample blocks.
#[async_trait]
pub trait MicrophoneHandle: Release + Send {
    /// Next block of mono samples at the capture rate. Blocks may have any
    /// length. `None` means the device stopped producing.
    async fn next_block(&mut self) -> Option<Result<Vec<f32>>>;
}

/// Platform speaker.
#[async_trait]
pub trait PlaybackDevice: Send + Sync {
    async fn acquire(&self) -> Result<Held<dyn PlaybackSink>>;
}

/// An open speaker with its own monotonic clock.
pub trait PlaybackSink: Release + Send {
    /// Device time, measured from an arbitrary origin.
    fn clock_now(&self) -> Duration;

    /// Queue `frame` to start at device time `start_at`.
    fn schedule(&mut self, frame: &AudioFrame, start_at: Duration)
        -> Result<Box<dyn PlaybackHandle>>;
}

/// A scheduled buffer that can still be cancelled.
pub trait PlaybackHandle: Send {
    fn cancel(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counter(Arc<AtomicUsize>);

    impl Release for Counter {
        fn release(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_held_releases_once_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let held: Held<Counter> = Held::new(Box::new(Counter(count.clone())));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        drop(held);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
