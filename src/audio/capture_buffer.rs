//! Debounced, size-bounded accumulator between device audio and a sink.
//!
//! Bursts are written as soon as the low watermark is reached; slow trickles
//! are written once no chunk arrived for `flush_delay`. The byte buffer is
//! only touched under a short synchronous lock and swapped out whole, so no
//! lock is held across an `.await`.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::conditioning::ConditioningConfig;
use super::sink::AudioSink;
use crate::error::RelayError;

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Hard upper bound of buffered bytes
    pub capacity: usize,
    /// Buffered bytes that trigger an immediate flush
    pub low_watermark: usize,
    /// Quiet period after the last append before a timed flush
    pub flush_delay: Duration,
    /// `None` passes audio through byte-identical
    pub conditioning: Option<ConditioningConfig>,
}

/// Counters for capacity tuning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub flushes: u64,
    pub forced_flushes: u64,
    pub bytes_written: u64,
    pub skipped_blocks: u64,
    pub failures: u64,
}

struct State {
    buffer: Vec<u8>,
    processing: bool,
    closed: bool,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    stats: CaptureStats,
}

struct Shared {
    settings: CaptureSettings,
    state: Mutex<State>,
    // None once finalized
    sink: tokio::sync::Mutex<Option<Box<dyn AudioSink>>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave the bytes half-swapped
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Clears the processing flag however the flush ends.
struct ProcessingGuard<'a>(&'a Shared);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.state().processing = false;
    }
}

#[derive(Clone)]
pub struct CaptureBuffer {
    shared: Arc<Shared>,
}

impl CaptureBuffer {
    pub fn new(settings: CaptureSettings, sink: Box<dyn AudioSink>) -> Self {
        let capacity = settings.capacity.max(1);
        let settings = CaptureSettings {
            capacity,
            low_watermark: settings.low_watermark.min(capacity),
            ..settings
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buffer: Vec::with_capacity(settings.low_watermark),
                    processing: false,
                    closed: false,
                    timer: None,
                    timer_generation: 0,
                    stats: CaptureStats::default(),
                }),
                settings,
                sink: tokio::sync::Mutex::new(Some(sink)),
            }),
        }
    }

    /// Append a raw chunk.
    ///
    /// Chunks larger than the capacity are split so the buffer never holds
    /// more than `capacity` bytes.
    pub async fn append(&self, chunk: &[u8]) {
        let capacity = self.shared.settings.capacity;
        for piece in chunk.chunks(capacity) {
            self.append_piece(piece).await;
        }
    }

    async fn append_piece(&self, piece: &[u8]) {
        let (forced, flush_now) = {
            let mut state = self.shared.state();
            if state.closed {
                log::warn!("Dropping {} bytes appended after capture was closed", piece.len());
                return;
            }

            let forced = if state.buffer.len() + piece.len() > self.shared.settings.capacity {
                state.stats.forced_flushes += 1;
                Some(std::mem::take(&mut state.buffer))
            } else {
                None
            };

            state.buffer.extend_from_slice(piece);

            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.timer_generation += 1;
            state.timer = Some(self.arm_timer(state.timer_generation));

            let flush_now =
                state.buffer.len() >= self.shared.settings.low_watermark && !state.processing;
            (forced, flush_now)
        };

        if let Some(block) = forced {
            log::warn!(
                "{}",
                RelayError::BufferOverflowForcedFlush {
                    flushed: block.len(),
                    incoming: piece.len(),
                }
            );
            self.write_block(block).await;
        }

        if flush_now {
            self.flush().await;
        }
    }

    fn arm_timer(&self, generation: u64) -> JoinHandle<()> {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let delay = self.shared.settings.flush_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            {
                let mut state = shared.state();
                if state.timer_generation != generation || state.closed {
                    return;
                }
                // Nobody may abort this task once the flush has started
                state.timer = None;
            }
            CaptureBuffer { shared }.flush().await;
        })
    }

    /// Hand the buffered bytes to the sink.
    ///
    /// Returns `false` without touching the sink when the buffer is empty or
    /// another flush is in progress.
    pub async fn flush(&self) -> bool {
        let block = {
            let mut state = self.shared.state();
            if state.processing || state.buffer.is_empty() {
                return false;
            }
            state.processing = true;
            std::mem::take(&mut state.buffer)
        };
        let _guard = ProcessingGuard(&self.shared);
        self.write_block(block).await;
        true
    }

    async fn write_block(&self, block: Vec<u8>) {
        let data = match &self.shared.settings.conditioning {
            Some(conditioning) => match conditioning.apply(&block) {
                Some(data) => data,
                None => {
                    self.shared.state().stats.skipped_blocks += 1;
                    return;
                }
            },
            None => block,
        };

        // Sink writes are serialized in arrival order (tokio's mutex is fair)
        let mut sink = self.shared.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            log::warn!("Capture sink already finalized, dropping {} bytes", data.len());
            return;
        };

        match sink.write(&data).await {
            Ok(()) => {
                let mut state = self.shared.state();
                state.stats.flushes += 1;
                state.stats.bytes_written += data.len() as u64;
                log::debug!("Wrote {} bytes of audio data", data.len());
            }
            // the failed block is already out of the buffer and is lost;
            // bytes appended since then stay queued
            Err(e) => {
                log::error!("Error writing audio buffer: {}", e);
                self.shared.state().stats.failures += 1;
            }
        }
    }

    /// Flush what is left, stop the debounce timer and finalize the sink.
    ///
    /// Waits for an in-flight flush to finish first. Only the first call has
    /// any effect.
    pub async fn close(&self) {
        let (timer, remainder) = {
            let mut state = self.shared.state();
            if state.closed {
                return;
            }
            state.closed = true;
            (state.timer.take(), std::mem::take(&mut state.buffer))
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        if !remainder.is_empty() {
            self.write_block(remainder).await;
        }

        let mut sink = self.shared.sink.lock().await;
        if let Some(mut sink) = sink.take() {
            if let Err(e) = sink.finalize().await {
                log::error!("Failed to finalize audio sink: {}", e);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shared.state().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state().closed
    }

    pub fn stats(&self) -> CaptureStats {
        self.shared.state().stats
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.shared.settings
    }
}
