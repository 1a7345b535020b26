use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::source::GrowingSource;
use crate::error::StreamError;
use crate::realtime::{OutboundMessage, OutboundSink};

/// Stalled cycles before the streamer reports that capture looks idle
const STALL_REPORT_CYCLES: u8 = 10;

/// Chunk streaming configuration
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Bytes per chunk (default: 1024)
    pub chunk_size: u32,
    /// Pause between read cycles (default: 1s)
    pub interval: Duration,
    /// Wait before the first read so the recorder can start writing (default: 1s)
    pub start_delay: Duration,
    /// Send a commit frame after the final chunk
    pub commit_on_finish: bool,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            interval: Duration::from_millis(1000),
            start_delay: Duration::from_millis(1000),
            commit_on_finish: false,
        }
    }
}

impl StreamerConfig {
    pub fn new(chunk_size: u32, interval: Duration) -> Self {
        Self {
            chunk_size,
            interval,
            ..Self::default()
        }
    }

    pub fn with_start_delay(mut self, start_delay: Duration) -> Self {
        self.start_delay = start_delay;
        self
    }

    pub fn with_commit_on_finish(mut self, commit_on_finish: bool) -> Self {
        self.commit_on_finish = commit_on_finish;
        self
    }
}

/// Read position within one streaming run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkCursor {
    /// Next byte to send
    pub position: u64,
    /// Largest source length observed so far
    pub source_length: u64,
    pub chunk_size: u32,
    /// Consecutive cycles without a full chunk available
    pub stalled_cycles: u8,
}

impl ChunkCursor {
    pub fn new(chunk_size: u32) -> Self {
        Self {
            chunk_size,
            ..Self::default()
        }
    }

    /// Bytes observed but not yet sent
    pub fn unread(&self) -> u64 {
        self.source_length.saturating_sub(self.position)
    }

    pub fn has_full_chunk(&self) -> bool {
        self.unread() >= u64::from(self.chunk_size)
    }

    /// Record a freshly sampled source length. Sources only ever grow.
    pub fn observe_length(&mut self, length: u64) -> Result<(), StreamError> {
        if length < self.source_length {
            return Err(StreamError::SourceShrank {
                previous: self.source_length,
                current: length,
            });
        }
        self.source_length = length;
        Ok(())
    }

    /// Move past `bytes` that were just sent
    fn advance(&mut self, bytes: u64) -> Result<(), StreamError> {
        if bytes > self.unread() {
            return Err(StreamError::Overlap {
                offset: self.position,
                position: self.position,
                expected: self.unread(),
                returned: bytes,
            });
        }
        self.position += bytes;
        self.stalled_cycles = 0;
        Ok(())
    }

    fn stall(&mut self) {
        self.stalled_cycles = self.stalled_cycles.saturating_add(1);
    }
}

/// How a streaming run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum StreamOutcome {
    /// Capture finished and every byte was sent
    Finished,
    /// Stopped on request before capture finished
    #[default]
    Stopped,
}

/// Result of a streaming run
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamSummary {
    pub outcome: StreamOutcome,
    pub chunks_sent: usize,
    pub bytes_sent: u64,
    /// Cycles skipped because no full chunk was available
    pub stalled_cycles: u64,
}

enum Cycle {
    Continue,
    Finished,
}

/// Streams a growing capture to a sink in fixed-size chunks
///
/// Once per interval the source length is sampled and, when a whole chunk
/// is available, exactly one chunk is read and sent. When capture stops the
/// remainder goes out as a final shorter chunk, so every byte is sent once
/// and in order.
pub struct ChunkStreamer {
    config: StreamerConfig,
    stop: CancellationToken,
}

impl ChunkStreamer {
    pub fn new(config: StreamerConfig) -> Self {
        Self::with_stop(config, CancellationToken::new())
    }

    /// Streamer that ends with [`StreamOutcome::Stopped`] when `stop` is cancelled
    pub fn with_stop(mut config: StreamerConfig, stop: CancellationToken) -> Self {
        if config.chunk_size == 0 {
            warn!("Chunk size of 0 requested, using 1 byte chunks");
            config.chunk_size = 1;
        }
        Self { config, stop }
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    /// Stream `source` into `sink` until capture finishes or the run is stopped
    pub async fn run(
        &self,
        source: &dyn GrowingSource,
        sink: &dyn OutboundSink,
    ) -> Result<StreamSummary, StreamError> {
        let mut cursor = ChunkCursor::new(self.config.chunk_size);
        let mut summary = StreamSummary::default();

        info!(
            "Streaming {} in {} byte chunks every {:?}",
            source.name(),
            self.config.chunk_size,
            self.config.interval
        );

        if !self.pause(self.config.start_delay).await {
            return Ok(self.stopped(source, summary));
        }

        loop {
            let cycle = tokio::select! {
                biased;
                () = self.stop.cancelled() => None,
                cycle = self.cycle(source, sink, &mut cursor, &mut summary) => Some(cycle),
            };

            match cycle {
                None => return Ok(self.stopped(source, summary)),
                Some(Err(e)) => {
                    error!("Streaming {} aborted: {}", source.name(), e);
                    return Err(e);
                }
                Some(Ok(Cycle::Finished)) => break,
                Some(Ok(Cycle::Continue)) => {}
            }

            if !self.pause(self.config.interval).await {
                return Ok(self.stopped(source, summary));
            }
        }

        if self.config.commit_on_finish {
            sink.send(OutboundMessage::commit())?;
        }

        summary.outcome = StreamOutcome::Finished;
        info!(
            "Streaming {} complete: {} chunks, {} bytes",
            source.name(),
            summary.chunks_sent,
            summary.bytes_sent
        );

        Ok(summary)
    }

    async fn cycle(
        &self,
        source: &dyn GrowingSource,
        sink: &dyn OutboundSink,
        cursor: &mut ChunkCursor,
        summary: &mut StreamSummary,
    ) -> Result<Cycle, StreamError> {
        let Some(length) = sample_length(source).await else {
            return Ok(Cycle::Continue);
        };
        cursor.observe_length(length)?;

        let blocked = !cursor.has_full_chunk();
        if !blocked {
            let chunk = u64::from(cursor.chunk_size);
            send_range(source, sink, cursor, summary, chunk).await?;
        }

        if source.is_still_producing().await {
            if blocked {
                record_stall(source, cursor, summary);
            }
            return Ok(Cycle::Continue);
        }

        // Capture has stopped; resample so bytes written since the first
        // sample are not lost
        let Some(length) = sample_length(source).await else {
            return Ok(Cycle::Continue);
        };
        cursor.observe_length(length)?;

        if cursor.has_full_chunk() {
            return Ok(Cycle::Continue);
        }

        let remainder = cursor.unread();
        if remainder > 0 && !send_range(source, sink, cursor, summary, remainder).await? {
            return Ok(Cycle::Continue);
        }

        Ok(Cycle::Finished)
    }

    /// Sleeps for `duration`; `false` if stopped meanwhile
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.stop.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }

    fn stopped(&self, source: &dyn GrowingSource, summary: StreamSummary) -> StreamSummary {
        info!(
            "Streaming {} stopped after {} chunks ({} bytes)",
            source.name(),
            summary.chunks_sent,
            summary.bytes_sent
        );
        StreamSummary {
            outcome: StreamOutcome::Stopped,
            ..summary
        }
    }
}

/// A cycle that found no full chunk while capture was still running
fn record_stall(
    source: &dyn GrowingSource,
    cursor: &mut ChunkCursor,
    summary: &mut StreamSummary,
) {
    cursor.stall();
    summary.stalled_cycles += 1;
    debug!(
        "Blocked - waiting for more data (position {}, length {})",
        cursor.position, cursor.source_length
    );
    if cursor.stalled_cycles == STALL_REPORT_CYCLES {
        info!(
            "No new data from {} for {} cycles",
            source.name(),
            cursor.stalled_cycles
        );
    }
}

async fn sample_length(source: &dyn GrowingSource) -> Option<u64> {
    match source.current_length().await {
        Ok(length) => Some(length),
        Err(e) => {
            warn!("Failed to read length of {}: {}", source.name(), e);
            None
        }
    }
}

/// Read `length` bytes at the cursor and send them. `Ok(false)` means the
/// read failed and should be retried next cycle.
async fn send_range(
    source: &dyn GrowingSource,
    sink: &dyn OutboundSink,
    cursor: &mut ChunkCursor,
    summary: &mut StreamSummary,
    length: u64,
) -> Result<bool, StreamError> {
    let offset = cursor.position;

    let payload = match source.read_range(offset, length).await {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Error during chunk upload at {}: {}", offset, e);
            return Ok(false);
        }
    };

    let returned = payload.len() as u64;
    if returned > length {
        return Err(StreamError::Overlap {
            offset,
            position: cursor.position,
            expected: length,
            returned,
        });
    }
    if returned < length {
        warn!(
            "Short read at {} ({} of {} bytes), retrying",
            offset, returned, length
        );
        return Ok(false);
    }

    cursor.advance(length)?;
    sink.send(OutboundMessage::audio(payload))?;
    summary.chunks_sent += 1;
    summary.bytes_sent += length;

    debug!(
        "Uploaded chunk {} [{}..{}) of {}",
        summary.chunks_sent,
        offset,
        offset + length,
        cursor.source_length
    );

    Ok(true)
}
