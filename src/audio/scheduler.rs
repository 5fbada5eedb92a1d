//! # Playback Scheduler
//!
//! Plays inbound agent audio back-to-back without gaps or overlap.
//!
//! ## Scheduling Rule:
//! Each chunk starts at `max(next_start_time, now)` and advances the cursor to
//! `start + duration`. Chunks that arrive while earlier ones are still queued are
//! lined up behind them; a chunk that arrives after the queue ran dry starts
//! immediately instead of at a time in the past.
//!
//! ## Pending Set:
//! Every started playback stays in the pending set until its device reports it
//! finished or it is stopped by an interrupt. "Agent talking" is exactly
//! "pending set is non-empty".

use crate::audio::chunk::AudioChunk;
use crate::audio::device::{DeviceError, OutputPath, PlaybackId};
use std::collections::BTreeMap;
use std::fmt;

/// One chunk placed on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub id: PlaybackId,
    pub start_time: f64,
    pub duration: f64,
}

impl ScheduledPlayback {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// No output device is attached.
    Closed,
    /// The chunk has no samples.
    EmptyChunk,
    Device(DeviceError),
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::Closed => write!(f, "output device is closed"),
            ScheduleError::EmptyChunk => write!(f, "refusing to schedule an empty chunk"),
            ScheduleError::Device(e) => write!(f, "output device failed: {}", e),
        }
    }
}

impl std::error::Error for ScheduleError {}

impl From<DeviceError> for ScheduleError {
    fn from(err: DeviceError) -> Self {
        ScheduleError::Device(err)
    }
}

pub struct PlaybackScheduler {
    output: Option<Box<dyn OutputPath>>,
    next_start_time: f64,
    pending: BTreeMap<PlaybackId, ScheduledPlayback>,
    next_id: u64,
}

impl PlaybackScheduler {
    /// A scheduler with no device. Call [`attach`](Self::attach) before scheduling.
    pub fn new() -> Self {
        Self {
            output: None,
            next_start_time: 0.0,
            pending: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Take ownership of a freshly opened output device, releasing any previous one.
    pub fn attach(&mut self, output: Box<dyn OutputPath>) {
        self.stop();
        self.output = Some(output);
    }

    /// Queue a chunk for gapless playback.
    ///
    /// Consumes the chunk. On success the returned entry is already in the pending
    /// set and the cursor has moved to its end time.
    pub fn schedule(&mut self, chunk: AudioChunk) -> Result<ScheduledPlayback, ScheduleError> {
        if chunk.is_empty() {
            return Err(ScheduleError::EmptyChunk);
        }
        let output = match self.output.as_mut() {
            Some(output) if !output.is_closed() => output,
            _ => return Err(ScheduleError::Closed),
        };

        let now = output.now();
        let start_time = self.next_start_time.max(now);
        let duration = chunk.duration_seconds();

        self.next_id += 1;
        let id = PlaybackId(self.next_id);
        output.start(id, chunk, start_time)?;

        let playback = ScheduledPlayback {
            id,
            start_time,
            duration,
        };
        self.next_start_time = playback.end_time();
        self.pending.insert(id, playback);

        tracing::trace!(
            "Scheduled {} at {:.3}s for {:.3}s ({} pending)",
            id,
            start_time,
            duration,
            self.pending.len()
        );
        Ok(playback)
    }

    /// Record that a playback ended on its own.
    ///
    /// Returns `true` when this removal drained the pending set. Ids that are no
    /// longer pending (stopped by an interrupt, or from an earlier device) are
    /// ignored and return `false`.
    pub fn finish(&mut self, id: PlaybackId) -> bool {
        self.pending.remove(&id).is_some() && self.pending.is_empty()
    }

    /// Cut off all agent speech: stop every pending playback and reset the cursor.
    ///
    /// The cursor goes back to zero; the next chunk then starts at the device's
    /// current time.
    pub fn interrupt(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            if let Some(output) = self.output.as_mut() {
                output.stop_all();
            }
            tracing::debug!("Interrupted {} pending playbacks", pending.len());
        }
        self.next_start_time = 0.0;
    }

    /// Interrupt and release the output device. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.interrupt();
        if let Some(mut output) = self.output.take() {
            if !output.is_closed() {
                output.close();
            }
        }
    }

    pub fn is_playing(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeOutput, OutputProbe};

    fn chunk(seconds: f64) -> AudioChunk {
        AudioChunk::mono(vec![0.1; (seconds * 24_000.0) as usize], 24_000)
    }

    fn attached() -> (PlaybackScheduler, OutputProbe) {
        let (output, probe) = FakeOutput::new(24_000);
        let mut scheduler = PlaybackScheduler::new();
        scheduler.attach(Box::new(output));
        (scheduler, probe)
    }

    #[test]
    fn test_back_to_back_chunks_are_gapless() {
        let (mut scheduler, _probe) = attached();

        let a = scheduler.schedule(chunk(1.0)).unwrap();
        let b = scheduler.schedule(chunk(0.5)).unwrap();
        let c = scheduler.schedule(chunk(2.0)).unwrap();

        assert_eq!(a.start_time, 0.0);
        assert!((b.start_time - a.end_time()).abs() < 1e-9);
        assert!((c.start_time - b.end_time()).abs() < 1e-9);
        assert!((scheduler.next_start_time() - 3.5).abs() < 1e-9);
        assert_eq!(scheduler.pending_len(), 3);
    }

    #[test]
    fn test_late_chunk_starts_now() {
        let (mut scheduler, probe) = attached();

        scheduler.schedule(chunk(0.5)).unwrap();
        probe.advance(2.0);

        let late = scheduler.schedule(chunk(0.5)).unwrap();
        assert!((late.start_time - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_finish_reports_drain_once() {
        let (mut scheduler, _probe) = attached();
        let a = scheduler.schedule(chunk(1.0)).unwrap();
        let b = scheduler.schedule(chunk(1.0)).unwrap();

        assert!(!scheduler.finish(a.id));
        assert!(scheduler.finish(b.id));
        assert!(!scheduler.finish(b.id));
        assert!(!scheduler.is_playing());
    }

    #[test]
    fn test_interrupt_stops_everything_and_resets_cursor() {
        let (mut scheduler, probe) = attached();
        for _ in 0..3 {
            scheduler.schedule(chunk(1.0)).unwrap();
        }
        probe.advance(0.25);

        scheduler.interrupt();
        assert!(!scheduler.is_playing());
        assert_eq!(scheduler.next_start_time(), 0.0);
        assert_eq!(probe.stopped().len(), 3);

        let next = scheduler.schedule(chunk(0.5)).unwrap();
        assert!((next.start_time - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_interrupt_cuts_off_a_long_reply() {
        let (mut scheduler, probe) = attached();
        for _ in 0..400 {
            scheduler.schedule(chunk(0.02)).unwrap();
        }

        scheduler.interrupt();
        assert_eq!(probe.stopped().len(), 400);
        assert!(!scheduler.is_playing());

        // Nothing cut off reports completion afterwards.
        probe.advance(10.0);
        assert!(!scheduler.finish(PlaybackId(1)));
    }

    #[test]
    fn test_stop_closes_device_and_rejects_new_chunks() {
        let (mut scheduler, probe) = attached();
        scheduler.schedule(chunk(1.0)).unwrap();

        scheduler.stop();
        scheduler.stop();

        assert!(probe.is_closed());
        assert_eq!(probe.close_count(), 1);
        assert_eq!(scheduler.schedule(chunk(1.0)), Err(ScheduleError::Closed));
    }

    #[test]
    fn test_empty_chunk_is_rejected() {
        let (mut scheduler, _probe) = attached();
        let empty = AudioChunk::mono(Vec::new(), 24_000);
        assert_eq!(scheduler.schedule(empty), Err(ScheduleError::EmptyChunk));
        assert!(!scheduler.is_playing());
    }
}
