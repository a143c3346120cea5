//! Audio capture, framing and playback

pub mod capture;
pub mod device;
pub mod frame;
pub mod level;
pub mod output;
pub mod playback;
#[cfg(feature = "pulse")]
pub mod pulse;

pub use capture::{CaptureEvent, CaptureLoop, CapturedFrame};
pub use device::{
    Held, MicrophoneHandle, MicrophoneSource, PlaybackDevice, PlaybackHandle, PlaybackSink,
    Release,
};
pub use frame::{AudioFrame, EncodedFrame};
pub use level::LevelMeter;
pub use output::{PcmWriter, QueuedSink};
pub use playback::PlaybackScheduler;
