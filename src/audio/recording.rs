//! Push-to-talk recording sessions on top of [`CaptureBuffer`].

use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::capture_buffer::{CaptureBuffer, CaptureSettings};
use super::sink::{AudioSink, ClipHandle, ClipSink, TeeSink, WavFileSink};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
    Draining,
    Closed,
}

/// One start..stop span of device audio.
pub struct RecordingSession {
    id: Uuid,
    state: RecordingState,
    buffer: CaptureBuffer,
    clip: ClipHandle,
    wav_path: Option<PathBuf>,
}

impl RecordingSession {
    /// Open the sinks and enter `Recording`.
    ///
    /// With a recordings directory the audio is also written to
    /// `recording-<id>.wav` there.
    pub fn start(
        settings: CaptureSettings,
        sample_rate: u32,
        recordings_dir: Option<&Path>,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        let (clip_sink, clip) = ClipSink::new();

        let (sink, wav_path): (Box<dyn AudioSink>, Option<PathBuf>) = match recordings_dir {
            Some(dir) => {
                let path = dir.join(format!("recording-{}.wav", id.simple()));
                let wav = WavFileSink::create(&path, sample_rate)?;
                let sinks: Vec<Box<dyn AudioSink>> = vec![Box::new(clip_sink), Box::new(wav)];
                let tee: Box<dyn AudioSink> = Box::new(TeeSink::new(sinks));
                (tee, Some(path))
            }
            None => {
                let clip_only: Box<dyn AudioSink> = Box::new(clip_sink);
                (clip_only, None)
            }
        };

        Ok(Self {
            id,
            state: RecordingState::Recording,
            buffer: CaptureBuffer::new(settings, sink),
            clip,
            wav_path,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn wav_path(&self) -> Option<&Path> {
        self.wav_path.as_deref()
    }

    pub fn buffer(&self) -> &CaptureBuffer {
        &self.buffer
    }

    /// Returns `false` if the session no longer accepts audio.
    pub async fn append(&self, chunk: &[u8]) -> bool {
        if self.state != RecordingState::Recording {
            return false;
        }
        self.buffer.append(chunk).await;
        true
    }

    /// Drain the buffer into the sinks, finalize them and hand back the clip.
    pub async fn finish(&mut self) -> Vec<u8> {
        if self.state == RecordingState::Closed {
            return Vec::new();
        }
        self.state = RecordingState::Draining;
        self.buffer.close().await;
        self.state = RecordingState::Closed;
        self.clip.take()
    }
}

/// Owns at most one active [`RecordingSession`].
pub struct Recorder {
    settings: CaptureSettings,
    sample_rate: u32,
    recordings_dir: Option<PathBuf>,
    current: Option<RecordingSession>,
}

impl Recorder {
    pub fn new(settings: CaptureSettings, sample_rate: u32, recordings_dir: Option<PathBuf>) -> Self {
        Self {
            settings,
            sample_rate,
            recordings_dir,
            current: None,
        }
    }

    pub fn state(&self) -> RecordingState {
        self.current
            .as_ref()
            .map_or(RecordingState::Idle, RecordingSession::state)
    }

    pub fn current(&self) -> Option<&RecordingSession> {
        self.current.as_ref()
    }

    /// Start a new session.
    ///
    /// A session that is still recording is drained and finalized first and
    /// its clip discarded.
    pub async fn start(&mut self) -> Result<Uuid> {
        if let Some(mut previous) = self.current.take() {
            if previous.state() == RecordingState::Recording {
                let dropped = previous.finish().await;
                log::warn!(
                    "Recording {} reset by a new start, discarded {} bytes",
                    previous.id(),
                    dropped.len()
                );
            }
        }

        let session = RecordingSession::start(
            self.settings.clone(),
            self.sample_rate,
            self.recordings_dir.as_deref(),
        )?;
        let id = session.id();
        log::info!("Started new recording session {}", id);
        self.current = Some(session);
        Ok(id)
    }

    pub async fn append(&self, chunk: &[u8]) -> bool {
        match &self.current {
            Some(session) => session.append(chunk).await,
            None => false,
        }
    }

    /// Stop the active session and return its clip, or `None` if nothing
    /// was recording.
    pub async fn stop(&mut self) -> Option<Vec<u8>> {
        let session = self.current.as_mut()?;
        if session.state() != RecordingState::Recording {
            log::info!("No active recording to stop");
            return None;
        }
        let clip = session.finish().await;
        log::info!("Recording {} ended with {} bytes", session.id(), clip.len());
        Some(clip)
    }

    /// Finalize whatever is active without returning audio.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.current.take() {
            session.finish().await;
        }
    }
}
