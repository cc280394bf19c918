//! Destinations for flushed capture blocks.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::resample::pcm16_from_le_bytes;
use crate::error::{RelayError, Result};

/// Receives conditioned PCM blocks from a capture buffer.
///
/// `write` is never called concurrently with itself for one buffer, and
/// `finalize` is called at most once, after the last `write`.
#[async_trait]
pub trait AudioSink: Send {
    async fn write(&mut self, pcm: &[u8]) -> Result<()>;
    async fn finalize(&mut self) -> Result<()>;
}

/// Writes a mono 16-bit PCM WAV file.
///
/// The header's data length is patched when the sink is finalized. File
/// writes run on the blocking pool; `create` opens the file in place.
pub struct WavFileSink {
    path: PathBuf,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
}

impl WavFileSink {
    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let writer = hound::WavWriter::create(&path, spec)?;
        log::info!("Started new recording: {}", path.display());
        Ok(Self {
            path,
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AudioSink for WavFileSink {
    async fn write(&mut self, pcm: &[u8]) -> Result<()> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| RelayError::SinkWriteFailure("wav writer already finalized".into()))?;
        let samples = pcm16_from_le_bytes(pcm);

        // hound writes through std::fs, keep it off the runtime threads
        let (writer, written) = tokio::task::spawn_blocking(move || {
            let written = samples
                .iter()
                .try_for_each(|&sample| writer.write_sample(sample))
                .and_then(|_| writer.flush());
            (writer, written)
        })
        .await
        .map_err(|e| RelayError::SinkWriteFailure(e.to_string()))?;

        self.writer = Some(writer);
        written.map_err(RelayError::from)
    }

    async fn finalize(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            tokio::task::spawn_blocking(move || writer.finalize())
                .await
                .map_err(|e| RelayError::SinkWriteFailure(e.to_string()))??;
            log::info!("Closed WAV file {}", self.path.display());
        }
        Ok(())
    }
}

/// Keeps everything written in memory; the handle returned by
/// [`ClipSink::new`] reads the clip once the capture is closed.
pub struct ClipSink {
    clip: Arc<Mutex<Vec<u8>>>,
}

/// Shared view of the bytes a [`ClipSink`] received.
#[derive(Clone, Default)]
pub struct ClipHandle {
    clip: Arc<Mutex<Vec<u8>>>,
}

impl ClipSink {
    pub fn new() -> (Self, ClipHandle) {
        let clip = Arc::new(Mutex::new(Vec::new()));
        (
            Self { clip: clip.clone() },
            ClipHandle { clip },
        )
    }
}

impl ClipHandle {
    /// Take the collected bytes, leaving the clip empty.
    pub fn take(&self) -> Vec<u8> {
        self.clip
            .lock()
            .map(|mut clip| std::mem::take(&mut *clip))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.clip.lock().map(|clip| clip.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AudioSink for ClipSink {
    async fn write(&mut self, pcm: &[u8]) -> Result<()> {
        let mut clip = self
            .clip
            .lock()
            .map_err(|_| RelayError::SinkWriteFailure("clip lock poisoned".into()))?;
        clip.extend_from_slice(pcm);
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Fans every block out to several sinks. The first error is reported
/// after all sinks saw the block.
pub struct TeeSink {
    sinks: Vec<Box<dyn AudioSink>>,
}

impl TeeSink {
    pub fn new(sinks: Vec<Box<dyn AudioSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AudioSink for TeeSink {
    async fn write(&mut self, pcm: &[u8]) -> Result<()> {
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.write(pcm).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn finalize(&mut self) -> Result<()> {
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.finalize().await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
