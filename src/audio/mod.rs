//! audio - capture buffering, conditioning and resampling
//!
//! Device PCM arrives in bursts over the WebSocket; [`CaptureBuffer`] shapes
//! it into bounded blocks for a sink, [`Recorder`] wraps that in push-to-talk
//! sessions, and [`resample`] converts between the device and upstream rates.

mod capture_buffer;
mod conditioning;
mod recording;
pub mod resample;
pub mod sink;

pub use capture_buffer::{CaptureBuffer, CaptureSettings, CaptureStats};
pub use conditioning::ConditioningConfig;
pub use recording::{Recorder, RecordingSession, RecordingState};
pub use resample::{pcm16_from_le_bytes, pcm16_to_le_bytes, resample, resample_bytes};
pub use sink::{AudioSink, ClipHandle, ClipSink, TeeSink, WavFileSink};
