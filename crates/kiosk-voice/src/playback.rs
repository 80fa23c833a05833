//! Playback scheduling for agent speech.
//!
//! Agent audio arrives as a sequence of short buffers. Each buffer is placed
//! on the output device's clock right after the previous one, so speech plays
//! back without gaps or overlap no matter how bursty the network is. An
//! interruption silences everything that is queued or playing and pulls the
//! cursor back to "now".

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::audio_io::{OutputDevice, PlayingSource};
use crate::codec::DecodedBuffer;
use crate::error::VoiceError;

/// Identifier of a scheduled buffer, reported back on natural completion.
pub type PlaybackId = u64;

/// Earliest time the next buffer may start, on the output device clock.
///
/// Only moves forward, except on [`PlaybackClock::reset`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackClock {
    next_start: Duration,
}

impl PlaybackClock {
    pub const fn new() -> Self {
        Self {
            next_start: Duration::ZERO,
        }
    }

    pub const fn next_start(&self) -> Duration {
        self.next_start
    }

    /// Start time for a buffer that is about to be scheduled: never in the
    /// past, never before the previous buffer ends.
    pub fn start_for(&self, now: Duration) -> Duration {
        self.next_start.max(now)
    }

    fn advance_to(&mut self, end: Duration) {
        self.next_start = self.next_start.max(end);
    }

    /// Drop any queued future time.
    pub const fn reset(&mut self, now: Duration) {
        self.next_start = now;
    }
}

/// Timing of one scheduled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackHandle {
    pub id: PlaybackId,
    pub start: Duration,
    pub end: Duration,
}

impl PlaybackHandle {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

struct ActiveSource {
    handle: PlaybackHandle,
    source: Box<dyn PlayingSource>,
}

/// Owns the playback cursor and every buffer that has not finished yet.
pub struct PlaybackScheduler {
    clock: PlaybackClock,
    active: BTreeMap<PlaybackId, ActiveSource>,
    next_id: PlaybackId,
    ended_tx: mpsc::UnboundedSender<PlaybackId>,
}

impl PlaybackScheduler {
    /// Natural completions are reported as ids on `ended_tx`; feed them back
    /// through [`PlaybackScheduler::on_ended`].
    pub const fn new(ended_tx: mpsc::UnboundedSender<PlaybackId>) -> Self {
        Self {
            clock: PlaybackClock::new(),
            active: BTreeMap::new(),
            next_id: 0,
            ended_tx,
        }
    }

    pub const fn clock(&self) -> PlaybackClock {
        self.clock
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self) -> bool {
        !self.active.is_empty()
    }

    /// Handles of everything queued or playing, in schedule order.
    pub fn active_handles(&self) -> Vec<PlaybackHandle> {
        self.active.values().map(|a| a.handle).collect()
    }

    /// Queue `buffer` right after whatever is already scheduled.
    ///
    /// Empty buffers are skipped and leave the clock alone. The clock only
    /// advances once the device accepted the buffer.
    pub fn schedule(
        &mut self,
        output: &dyn OutputDevice,
        buffer: &DecodedBuffer,
    ) -> Result<Option<PlaybackHandle>, VoiceError> {
        if buffer.is_empty() {
            return Ok(None);
        }

        let now = output.current_time();
        let start = self.clock.start_for(now);
        let end = start + buffer.duration();

        let id = self.next_id;
        self.next_id += 1;

        let ended_tx = self.ended_tx.clone();
        let source = output.play_at(
            buffer,
            start,
            Box::new(move || {
                let _ = ended_tx.send(id);
            }),
        )?;

        self.clock.advance_to(end);
        let handle = PlaybackHandle { id, start, end };
        self.active.insert(id, ActiveSource { handle, source });

        tracing::trace!(
            id,
            start_ms = start.as_millis(),
            end_ms = end.as_millis(),
            active = self.active.len(),
            "Buffer scheduled"
        );
        Ok(Some(handle))
    }

    /// Record a natural completion.
    ///
    /// Returns `true` when this completion emptied the active set (the agent
    /// stopped talking). Unknown ids, such as buffers already cut off by an
    /// interruption, are ignored.
    pub fn on_ended(&mut self, id: PlaybackId) -> bool {
        if self.active.remove(&id).is_none() {
            return false;
        }
        self.active.is_empty()
    }

    /// Cut off everything, clear the active set and pull the clock back to
    /// `now`. Returns how many sources were stopped.
    pub fn interrupt(&mut self, now: Duration) -> usize {
        let stopped = self.stop_all();
        self.clock.reset(now);
        stopped
    }

    /// Stop every active source without touching the clock.
    pub fn stop_all(&mut self) -> usize {
        let active = std::mem::take(&mut self.active);
        let stopped = active.len();
        for entry in active.into_values() {
            entry.source.stop();
        }
        stopped
    }
}
