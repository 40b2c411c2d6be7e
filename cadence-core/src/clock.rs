//! Playback clock and frame scheduling
//!
//! An external master clock (normally the audio device) supplies "now" in
//! seconds. The [`PlaybackClock`] anchors the video stream against it and
//! answers when a given pts is due.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Authoritative time source, in seconds
pub trait MediaClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Monotonic wall clock
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaClock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Clock that only moves when told to
#[derive(Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(secs: f64) -> Self {
        Self {
            bits: AtomicU64::new(secs.to_bits()),
        }
    }

    pub fn set(&self, secs: f64) {
        self.bits.store(secs.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, secs: f64) {
        self.set(self.now() + secs);
    }
}

impl MediaClock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

/// Audio clock - updated from audio callback
pub struct AudioClock {
    pts_us: AtomicI64,
    sample_rate: u32,
    samples_played: AtomicU64,
    playing: AtomicBool,
}

impl AudioClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            pts_us: AtomicI64::new(0),
            sample_rate: sample_rate.max(1),
            samples_played: AtomicU64::new(0),
            playing: AtomicBool::new(false),
        }
    }

    /// Rebase on the pts of the buffer the device just started playing
    pub fn update(&self, pts_us: i64) {
        self.pts_us.store(pts_us, Ordering::SeqCst);
        self.samples_played.store(0, Ordering::SeqCst);
    }

    pub fn add_samples(&self, n: u64) {
        self.samples_played.fetch_add(n, Ordering::SeqCst);
    }

    pub fn time_us(&self) -> i64 {
        let base = self.pts_us.load(Ordering::SeqCst);
        if !self.playing.load(Ordering::SeqCst) {
            return base;
        }
        let samples = self.samples_played.load(Ordering::SeqCst);
        base + (samples as i64 * 1_000_000) / self.sample_rate as i64
    }

    pub fn set_playing(&self, p: bool) {
        self.playing.store(p, Ordering::SeqCst);
    }
}

impl MediaClock for AudioClock {
    fn now(&self) -> f64 {
        self.time_us() as f64 / 1_000_000.0
    }
}

// ============================================================================
// Playback Clock
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Running,
    Paused,
    Stopped,
}

/// Scheduling verdict for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Schedule {
    /// Not due for another `wait` seconds
    Early { wait: f64 },
    /// Due; `late_by` seconds past its slot
    Due { late_by: f64 },
    /// Clock has no anchor yet; the frame defines it
    Unanchored,
    /// Paused or stopped, nothing is due
    Held,
}

/// Maps stream pts (seconds) onto master-clock time.
///
/// `presentation_time(pts) = stream_start + pts + paused`, where `paused`
/// is the total length of completed pauses.
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    state: ClockState,
    stream_start: Option<f64>,
    pause_started: Option<f64>,
    accumulated_pause: f64,
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            state: ClockState::Running,
            stream_start: None,
            pause_started: None,
            accumulated_pause: 0.0,
        }
    }

    /// Anchor pts 0 at `now`
    pub fn start_at(&mut self, now: f64) {
        self.stream_start = Some(now);
    }

    /// Anchor so that `pts` is due exactly at `now`; no-op once anchored
    pub fn anchor(&mut self, pts: f64, now: f64) {
        if self.stream_start.is_none() {
            self.stream_start = Some(now - pts - self.accumulated_pause);
            tracing::debug!("Playback clock anchored at {:.3}s (pts {:.3})", now, pts);
        }
    }

    pub fn is_anchored(&self) -> bool {
        self.stream_start.is_some()
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn pause(&mut self, now: f64) {
        if self.state == ClockState::Running {
            self.state = ClockState::Paused;
            self.pause_started = Some(now);
        }
    }

    pub fn resume(&mut self, now: f64) {
        if self.state == ClockState::Paused {
            if let Some(started) = self.pause_started.take() {
                self.accumulated_pause += (now - started).max(0.0);
            }
            self.state = ClockState::Running;
        }
    }

    pub fn stop(&mut self) {
        self.state = ClockState::Stopped;
        self.pause_started = None;
    }

    pub fn accumulated_pause(&self) -> f64 {
        self.accumulated_pause
    }

    /// Master-clock time at which `pts` should become visible. `None` when
    /// stopped or not yet anchored.
    pub fn presentation_time_for(&self, pts: f64) -> Option<f64> {
        if self.state == ClockState::Stopped {
            return None;
        }
        self.stream_start.map(|start| start + pts + self.accumulated_pause)
    }

    /// Playback position in stream seconds
    pub fn position(&self, now: f64) -> Option<f64> {
        let start = self.stream_start?;
        let reference = match (self.state, self.pause_started) {
            (ClockState::Paused, Some(paused_at)) => paused_at,
            _ => now,
        };
        Some(reference - start - self.accumulated_pause)
    }

    pub fn schedule(&self, pts: f64, now: f64) -> Schedule {
        if self.state != ClockState::Running {
            return Schedule::Held;
        }
        match self.presentation_time_for(pts) {
            None => Schedule::Unanchored,
            Some(at) if now >= at => Schedule::Due { late_by: now - at },
            Some(at) => Schedule::Early { wait: at - now },
        }
    }
}
